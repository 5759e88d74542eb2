use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt, TryStreamExt};
use lru::LruCache;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::parsing::{
    parse_address_status, parse_balance, parse_header, parse_header_notification, parse_headers,
    parse_history, parse_merkle, parse_tip_height, parse_transaction, parse_txid, parse_unspents,
};
use super::protocol::method;
use super::registry::{ChannelKey, RawNotification};
use super::session::{Session, SessionConfig};
use super::transport::Connector;
use super::ChainQuery;
use crate::error::CoreError;
use crate::merkle;
use crate::params::ChainParams;
use crate::script::{address_to_script, scripthash};
use crate::types::{
    AddressBalance, AddressHistory, AddressStatus, AddressUnspents, Balance, BlockHeader,
    HeaderNotification, HistoryEntry, MerkleBranch, MerkleProofResult, Notification,
    ProvenBalance, UnspentOutput,
};

/// Maximum number of block headers cached in memory.
const HEADER_CACHE_CAP: usize = 10_000;
/// Maximum number of decoded transactions cached in memory.
const TX_CACHE_CAP: usize = 2_000;
/// Concurrent requests per multi-address fan-out.
const DEFAULT_FANOUT: usize = 8;
/// Headers requested per `blockchain.block.headers` call.
const HEADERS_CHUNK: u32 = 2_016;

/// Typed ElectrumX queries over one [`Session`].
///
/// Block headers and transactions are immutable once confirmed, so both
/// are kept in bounded LRU caches that only ever evict.
pub struct ElectrumClient {
    session: Session,
    params: ChainParams,
    fanout: usize,
    headers: RwLock<LruCache<u32, BlockHeader>>,
    transactions: RwLock<LruCache<Txid, Transaction>>,
}

impl ElectrumClient {
    pub async fn connect(
        params: ChainParams,
        connector: Arc<dyn Connector>,
        config: SessionConfig,
    ) -> Result<Self, CoreError> {
        Ok(Self::new(params, Session::open(connector, config).await?))
    }

    pub fn new(params: ChainParams, session: Session) -> Self {
        Self {
            session,
            params,
            fanout: DEFAULT_FANOUT,
            headers: RwLock::new(LruCache::new(
                NonZeroUsize::new(HEADER_CACHE_CAP).unwrap_or(NonZeroUsize::MIN),
            )),
            transactions: RwLock::new(LruCache::new(
                NonZeroUsize::new(TX_CACHE_CAP).unwrap_or(NonZeroUsize::MIN),
            )),
        }
    }

    /// Bound on concurrent requests of the multi-address queries.
    pub fn with_fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout.max(1);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub async fn close(&self) {
        self.session.close().await;
    }

    fn scripthash_of(&self, address: &str) -> Result<String, CoreError> {
        Ok(scripthash(&address_to_script(address, self.params.network)?))
    }

    async fn scripthash_call(
        &self,
        method_name: &'static str,
        address: &str,
    ) -> Result<Value, CoreError> {
        let hash = self.scripthash_of(address)?;
        self.session.request(method_name, vec![json!(hash)]).await
    }

    // ==========================================================================
    // Balances
    // ==========================================================================

    pub async fn get_balance(&self, address: &str) -> Result<Balance, CoreError> {
        parse_balance(self.scripthash_call(method::SCRIPTHASH_BALANCE, address).await?)
    }

    /// Balances of `addresses`, yielded as each arrives; order is not
    /// preserved.
    pub fn get_balances<'a>(
        &'a self,
        addresses: &'a [String],
    ) -> impl Stream<Item = Result<AddressBalance, CoreError>> + 'a {
        stream::iter(addresses)
            .map(move |address| async move {
                let balance = self.get_balance(address).await?;
                Ok(AddressBalance {
                    address: address.clone(),
                    confirmed: balance.confirmed,
                    unconfirmed: balance.unconfirmed,
                })
            })
            .buffer_unordered(self.fanout)
    }

    /// Sum of the confirmed unspent outputs of `address` whose merkle
    /// proofs check out.
    pub async fn balance_merkle_proven(&self, address: &str) -> Result<ProvenBalance, CoreError> {
        let unspents = self.unspent(address, true).await?;
        let balance = unspents
            .iter()
            .filter(|u| u.proven == Some(true))
            .map(|u| u.value)
            .sum();
        Ok(ProvenBalance {
            address: address.to_owned(),
            balance,
        })
    }

    pub fn balances_merkle_proven<'a>(
        &'a self,
        addresses: &'a [String],
    ) -> impl Stream<Item = Result<ProvenBalance, CoreError>> + 'a {
        stream::iter(addresses)
            .map(move |address| self.balance_merkle_proven(address))
            .buffer_unordered(self.fanout)
    }

    // ==========================================================================
    // History And Unspents
    // ==========================================================================

    /// History of `address`. With `merkle_proof`, every entry carries
    /// `proven`; mempool entries are never proven.
    pub async fn history(
        &self,
        address: &str,
        merkle_proof: bool,
    ) -> Result<Vec<HistoryEntry>, CoreError> {
        let raw = self.scripthash_call(method::SCRIPTHASH_HISTORY, address).await?;
        let mut history = parse_history(raw)?;
        if merkle_proof {
            let targets = history
                .iter()
                .map(|h| (h.tx_hash, u32::try_from(h.height).unwrap_or(0)))
                .collect();
            let proofs = self.prove_all(targets).await?;
            for (entry, proof) in history.iter_mut().zip(proofs) {
                entry.proven = Some(proof.proven);
            }
        }
        Ok(history)
    }

    pub fn get_histories<'a>(
        &'a self,
        addresses: &'a [String],
        merkle_proof: bool,
    ) -> impl Stream<Item = Result<AddressHistory, CoreError>> + 'a {
        stream::iter(addresses)
            .map(move |address| async move {
                Ok(AddressHistory {
                    address: address.clone(),
                    history: self.history(address, merkle_proof).await?,
                })
            })
            .buffer_unordered(self.fanout)
    }

    /// Unspent outputs of `address`. With `merkle_proof`, every output
    /// carries `proven`.
    pub async fn unspent(
        &self,
        address: &str,
        merkle_proof: bool,
    ) -> Result<Vec<UnspentOutput>, CoreError> {
        let raw = self.scripthash_call(method::SCRIPTHASH_LISTUNSPENT, address).await?;
        let mut unspents = parse_unspents(raw, address)?;
        if merkle_proof {
            let targets = unspents.iter().map(|u| (u.tx_hash, u.height)).collect();
            let proofs = self.prove_all(targets).await?;
            for (utxo, proof) in unspents.iter_mut().zip(proofs) {
                utxo.proven = Some(proof.proven);
            }
        }
        Ok(unspents)
    }

    pub fn get_unspents<'a>(
        &'a self,
        addresses: &'a [String],
        merkle_proof: bool,
    ) -> impl Stream<Item = Result<AddressUnspents, CoreError>> + 'a {
        stream::iter(addresses)
            .map(move |address| async move {
                Ok(AddressUnspents {
                    address: address.clone(),
                    unspents: self.unspent(address, merkle_proof).await?,
                })
            })
            .buffer_unordered(self.fanout)
    }

    /// Proof results in the order of `targets`.
    async fn prove_all(
        &self,
        targets: Vec<(Txid, u32)>,
    ) -> Result<Vec<MerkleProofResult>, CoreError> {
        stream::iter(targets)
            .map(|(tx_hash, height)| async move { merkle::prove(self, &tx_hash, height).await })
            .buffered(self.fanout)
            .try_collect()
            .await
    }

    // ==========================================================================
    // Merkle Proofs
    // ==========================================================================

    pub async fn get_merkle(&self, tx_hash: &Txid, height: u32) -> Result<MerkleBranch, CoreError> {
        parse_merkle(
            self.session
                .request(
                    method::TRANSACTION_GET_MERKLE,
                    vec![json!(tx_hash.to_string()), json!(height)],
                )
                .await?,
        )
    }

    /// Prove that `unspent` is included in the block it claims.
    pub async fn merkle_prove(&self, unspent: &UnspentOutput) -> Result<MerkleProofResult, CoreError> {
        merkle::prove(self, &unspent.tx_hash, unspent.height).await
    }

    // ==========================================================================
    // Block Headers
    // ==========================================================================

    pub async fn block_header(&self, height: u32) -> Result<BlockHeader, CoreError> {
        // `LruCache::get` updates recency, so even lookups take the write lock.
        if let Some(header) = self.headers.write().await.get(&height).cloned() {
            return Ok(header);
        }
        let raw = self
            .session
            .request(method::BLOCK_HEADER, vec![json!(height)])
            .await?;
        let header = parse_header(height, raw)?;
        self.headers.write().await.put(height, header.clone());
        Ok(header)
    }

    /// `count` headers starting at `start`, fetched lazily in chunks. The
    /// stream ends early if the server runs out of headers. Calling again
    /// starts over.
    pub fn block_headers(
        &self,
        start: u32,
        count: u32,
    ) -> BoxStream<'_, Result<BlockHeader, CoreError>> {
        let end = start.saturating_add(count);
        stream::try_unfold(start, move |next| async move {
            if next >= end {
                return Ok::<_, CoreError>(None);
            }
            let want = HEADERS_CHUNK.min(end - next);
            let (headers, max) = self.fetch_header_chunk(next, want).await?;
            if headers.is_empty() {
                return Ok(None);
            }
            let got = headers.len() as u32;
            // A short answer under the server's own cap means the tip was reached.
            let next = if got < want && got < max { end } else { next + got };
            let chunk = stream::iter(headers.into_iter().map(Ok::<_, CoreError>));
            Ok(Some((chunk, next)))
        })
        .try_flatten()
        .boxed()
    }

    async fn fetch_header_chunk(
        &self,
        start: u32,
        count: u32,
    ) -> Result<(Vec<BlockHeader>, u32), CoreError> {
        let raw = self
            .session
            .request(method::BLOCK_HEADERS, vec![json!(start), json!(count)])
            .await?;
        let (headers, max) = parse_headers(start, raw)?;
        if max > 0 && headers.len() as u32 > max {
            return Err(CoreError::Protocol(format!(
                "server sent {} headers, above its own limit {max}",
                headers.len()
            )));
        }
        let mut cache = self.headers.write().await;
        for header in &headers {
            cache.put(header.height, header.clone());
        }
        Ok((headers, max))
    }

    /// Height of the chain tip as the server sees it.
    pub async fn current_height(&self) -> Result<u32, CoreError> {
        parse_tip_height(self.session.request(method::HEADERS_SUBSCRIBE, Vec::new()).await?)
    }

    // ==========================================================================
    // Subscriptions
    // ==========================================================================

    /// Subscribe to new chain tips. The current tip is the first item.
    pub async fn subscribe_to_block_headers(
        &self,
    ) -> Result<BoxStream<'static, Notification<HeaderNotification>>, CoreError> {
        let (_, raw) = self.session.subscribe(ChannelKey::Headers, Vec::new()).await?;
        Ok(raw
            .filter_map(|note| async move {
                let payload = note.params.first().cloned().unwrap_or(Value::Null);
                envelope(note, parse_header_notification(payload))
            })
            .boxed())
    }

    pub fn unsubscribe_from_block_headers(&self) -> bool {
        self.session.unsubscribe(&ChannelKey::Headers)
    }

    /// Subscribe to status changes of `address`. The current status is the
    /// first item.
    pub async fn subscribe_to_address(
        &self,
        address: &str,
    ) -> Result<BoxStream<'static, Notification<AddressStatus>>, CoreError> {
        let hash = self.scripthash_of(address)?;
        let (_, raw) = self
            .session
            .subscribe(ChannelKey::Scripthash(hash.clone()), vec![json!(hash)])
            .await?;
        let address = address.to_owned();
        Ok(raw
            .filter_map(move |note| {
                let address = address.clone();
                async move {
                    let payload = note.params.get(1).cloned().unwrap_or(Value::Null);
                    envelope(note, parse_address_status(&address, payload))
                }
            })
            .boxed())
    }

    /// Drop the subscription locally and tell the server. Returns whether
    /// a subscription existed.
    pub async fn unsubscribe_from_address(&self, address: &str) -> Result<bool, CoreError> {
        let hash = self.scripthash_of(address)?;
        let existed = self.session.unsubscribe(&ChannelKey::Scripthash(hash.clone()));
        if existed {
            if let Err(err) = self
                .session
                .request(method::SCRIPTHASH_UNSUBSCRIBE, vec![json!(hash)])
                .await
            {
                // Older servers lack the method; the local side is gone either way.
                debug!(error = %err, "server-side unsubscribe failed");
            }
        }
        Ok(existed)
    }

    // ==========================================================================
    // Transactions
    // ==========================================================================

    /// Broadcast a transaction given as hex. A server refusal is
    /// `BroadcastRejected` with the server's reason.
    pub async fn pushtx(&self, raw_tx: &str) -> Result<Txid, CoreError> {
        let raw_tx = raw_tx.trim();
        match self
            .session
            .request(method::TRANSACTION_BROADCAST, vec![json!(raw_tx)])
            .await
        {
            Ok(answer) => {
                let txid = parse_txid(answer)?;
                debug!(%txid, "transaction broadcast");
                Ok(txid)
            }
            Err(CoreError::ServerError { message, .. }) => {
                warn!(reason = %message, "broadcast rejected");
                Err(CoreError::BroadcastRejected(message))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn pushtx_bytes(&self, raw_tx: &[u8]) -> Result<Txid, CoreError> {
        self.pushtx(&hex::encode(raw_tx)).await
    }

    pub async fn get_tx(&self, txid: &Txid) -> Result<Transaction, CoreError> {
        if let Some(tx) = self.transactions.write().await.get(txid).cloned() {
            return Ok(tx);
        }
        let raw = self
            .session
            .request(method::TRANSACTION_GET, vec![json!(txid.to_string())])
            .await?;
        let tx = parse_transaction(raw)?;
        if tx.compute_txid() != *txid {
            return Err(CoreError::Protocol(format!(
                "server returned {} for {txid}",
                tx.compute_txid()
            )));
        }
        self.transactions.write().await.put(*txid, tx.clone());
        Ok(tx)
    }

    /// Transactions in the order of `txids`, fetched lazily as the stream
    /// is polled.
    pub fn get_txs<'a>(
        &'a self,
        txids: &'a [Txid],
    ) -> impl Stream<Item = Result<Transaction, CoreError>> + 'a {
        stream::iter(txids)
            .map(move |txid| self.get_tx(txid))
            .buffered(self.fanout)
    }
}

/// Wrap a parsed payload in the notification envelope. Payloads that fail
/// to parse are logged and skipped.
fn envelope<T>(note: RawNotification, data: Result<T, CoreError>) -> Option<Notification<T>> {
    match data {
        Ok(data) => Some(Notification {
            data,
            error: None,
            method: note.method,
            params: note.params,
        }),
        Err(err) => {
            warn!(rpc.method = %note.method, error = %err, "skipping malformed notification");
            None
        }
    }
}

#[async_trait]
impl ChainQuery for ElectrumClient {
    async fn block_header(&self, height: u32) -> Result<BlockHeader, CoreError> {
        ElectrumClient::block_header(self, height).await
    }

    async fn get_merkle(&self, tx_hash: &Txid, height: u32) -> Result<MerkleBranch, CoreError> {
        ElectrumClient::get_merkle(self, tx_hash, height).await
    }

    async fn unspent(&self, address: &str) -> Result<Vec<UnspentOutput>, CoreError> {
        ElectrumClient::unspent(self, address, false).await
    }

    async fn get_tx(&self, txid: &Txid) -> Result<Transaction, CoreError> {
        ElectrumClient::get_tx(self, txid).await
    }

    async fn pushtx(&self, raw_tx: &str) -> Result<Txid, CoreError> {
        ElectrumClient::pushtx(self, raw_tx).await
    }

    async fn current_height(&self) -> Result<u32, CoreError> {
        ElectrumClient::current_height(self).await
    }
}
