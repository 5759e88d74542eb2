//! ElectrumX protocol client.
//!
//! [`Session`] owns one connection and multiplexes requests and
//! subscriptions over it; [`ElectrumClient`] wraps it in typed queries. The
//! [`ChainQuery`] trait is the seam the merkle verifier and the wallet
//! compositions are written against, so they can run on a mock.

mod client;
#[cfg(test)]
pub mod mock;
mod parsing;
mod protocol;
mod registry;
mod session;
pub mod transport;

pub use client::ElectrumClient;
pub use registry::{ChannelKey, RawNotification};
pub use session::{ReconnectPolicy, ServerVersion, Session, SessionConfig, SessionState};
#[cfg(feature = "tls")]
pub use transport::TlsConnector;
pub use transport::{Connector, TcpConnector};

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};

use crate::error::CoreError;
use crate::types::{BlockHeader, MerkleBranch, UnspentOutput};

/// The chain queries the verifier and wallet need.
#[async_trait]
pub trait ChainQuery: Send + Sync {
    async fn block_header(&self, height: u32) -> Result<BlockHeader, CoreError>;

    /// Merkle branch of `tx_hash` in the block at `height`.
    async fn get_merkle(&self, tx_hash: &Txid, height: u32) -> Result<MerkleBranch, CoreError>;

    async fn unspent(&self, address: &str) -> Result<Vec<UnspentOutput>, CoreError>;

    async fn get_tx(&self, txid: &Txid) -> Result<Transaction, CoreError>;

    /// Broadcast a hex-encoded transaction and return the hash the server
    /// reports.
    async fn pushtx(&self, raw_tx: &str) -> Result<Txid, CoreError>;

    async fn current_height(&self) -> Result<u32, CoreError>;
}
