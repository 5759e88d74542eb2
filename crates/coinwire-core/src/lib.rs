pub mod builder;
pub mod electrum;
pub mod error;
pub mod merkle;
pub mod params;
pub mod script;
pub mod sighash;
pub mod sign;
pub mod tx;
pub mod types;
pub mod wallet;

#[cfg(test)]
mod test_util;

pub use builder::TxBuilder;
pub use electrum::{ChainQuery, ElectrumClient, Session, SessionConfig};
pub use error::CoreError;
pub use params::ChainParams;
pub use script::ScriptSpec;
pub use sign::Signer;
pub use tx::{Payment, WalletTx};
