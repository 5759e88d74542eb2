use bitcoin::Txid;
use clap::{Parser, Subcommand};

/// coinwire: query an ElectrumX server, verify merkle proofs, build and
/// broadcast transactions.
#[derive(Parser)]
#[command(version, about)]
pub struct Cli {
    /// ElectrumX endpoint as host:port. Defaults to the chain's first
    /// known server.
    #[arg(long, env = "COINWIRE_SERVER")]
    pub server: Option<String>,

    /// Chain to operate on: mainnet, testnet, signet or regtest.
    #[arg(long, default_value = "mainnet", env = "COINWIRE_CHAIN")]
    pub chain: String,

    /// Connect over TLS (requires the `tls` feature).
    #[arg(long, env = "COINWIRE_TLS")]
    pub tls: bool,

    /// Seconds to wait for each server response.
    #[arg(long, default_value = "30", env = "COINWIRE_TIMEOUT_SECS")]
    pub timeout_secs: u64,

    /// Client-side cap on requests per second.
    #[arg(long, env = "COINWIRE_REQUESTS_PER_SECOND")]
    pub requests_per_second: Option<u32>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Confirmed and unconfirmed balance of one or more addresses.
    Balance {
        #[arg(required = true)]
        addresses: Vec<String>,
        /// Report only the sum of unspent outputs with a valid merkle proof.
        #[arg(long)]
        merkle_proof: bool,
    },
    /// Transaction history of an address.
    History {
        address: String,
        #[arg(long)]
        merkle_proof: bool,
    },
    /// Unspent outputs of an address.
    Unspent {
        address: String,
        #[arg(long)]
        merkle_proof: bool,
    },
    /// Block header at a height.
    Header { height: u32 },
    /// A range of block headers.
    Headers { start: u32, count: u32 },
    /// Check that a transaction is included in the block at a height.
    MerkleProof { txid: Txid, height: u32 },
    /// Fetch and decode a transaction.
    Tx { txid: Txid },
    /// Broadcast a raw transaction given as hex.
    Broadcast { raw_tx: String },
    /// Pay from a single-key address, with change back to it.
    Send {
        /// Private key as WIF or hex.
        #[arg(long, env = "COINWIRE_PRIVATE_KEY", hide_env_values = true)]
        key: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        /// Amount in satoshis.
        #[arg(long)]
        value: u64,
        /// Absolute fee in satoshis.
        #[arg(long)]
        fee: u64,
    },
    /// Print new chain tips until interrupted.
    WatchHeaders,
    /// Print status changes of an address until interrupted.
    WatchAddress { address: String },
}
