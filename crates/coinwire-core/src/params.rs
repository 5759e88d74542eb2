//! Per-network parameters consumed by the builder, classifier and client.

use bitcoin::{Amount, Network};

/// Default dust threshold: outputs below this value are never emitted.
pub const DEFAULT_DUST_THRESHOLD: Amount = Amount::from_sat(546);

/// The subset of a coin's parameter table the core depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainParams {
    pub network: Network,
    pub display_name: &'static str,
    pub dust_threshold: Amount,
    /// `host:port` ElectrumX endpoints tried by the CLI when none is given.
    pub default_servers: &'static [&'static str],
}

impl ChainParams {
    pub fn mainnet() -> Self {
        Self {
            network: Network::Bitcoin,
            display_name: "Bitcoin",
            dust_threshold: DEFAULT_DUST_THRESHOLD,
            default_servers: &["electrum.blockstream.info:50001", "electrum.emzy.de:50001"],
        }
    }

    pub fn testnet() -> Self {
        Self {
            network: Network::Testnet,
            display_name: "Bitcoin Testnet",
            dust_threshold: DEFAULT_DUST_THRESHOLD,
            default_servers: &["electrum.blockstream.info:60001", "testnet.aranguren.org:51001"],
        }
    }

    pub fn signet() -> Self {
        Self {
            network: Network::Signet,
            display_name: "Bitcoin Signet",
            dust_threshold: DEFAULT_DUST_THRESHOLD,
            default_servers: &["signet-electrumx.wakiyamap.dev:50001"],
        }
    }

    pub fn regtest() -> Self {
        Self {
            network: Network::Regtest,
            display_name: "Bitcoin Regtest",
            dust_threshold: DEFAULT_DUST_THRESHOLD,
            default_servers: &["127.0.0.1:50001"],
        }
    }

    /// Look up parameters by the chain names used on the command line.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "main" | "mainnet" | "bitcoin" => Some(Self::mainnet()),
            "test" | "testnet" => Some(Self::testnet()),
            "signet" => Some(Self::signet()),
            "regtest" => Some(Self::regtest()),
            _ => None,
        }
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::mainnet()
    }
}
