//! Test doubles: a scripted in-memory ElectrumX server for the session and
//! client, and [`MockChain`], a canned [`ChainQuery`] backend.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::Notify;

use super::transport::{BoxedStream, Connector};
use super::ChainQuery;
use crate::error::CoreError;
use crate::tx::public_txhash;
use crate::types::{BlockHeader, MerkleBranch, UnspentOutput};

// ==============================================================================
// Scripted Server
// ==============================================================================

type Handler = Arc<dyn Fn(&[Value]) -> Result<Value, Value> + Send + Sync>;

/// Answers requests from per-method handlers. `server.version` is answered
/// by default; unknown methods get a JSON-RPC error.
#[derive(Clone, Default)]
pub struct FakeServer {
    handlers: HashMap<String, Handler>,
    hang: HashSet<String>,
    disconnect: HashSet<String>,
    notifications: HashMap<String, Vec<Value>>,
    reverse_pairs: bool,
    stray_id: Option<u64>,
    requests: Arc<Mutex<Vec<(String, Vec<Value>)>>>,
    hung_up: Arc<Notify>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default().respond("server.version", |_| Ok(json!(["FakeX 1.0", "1.4"])))
    }

    pub fn respond(
        mut self,
        method: &str,
        handler: impl Fn(&[Value]) -> Result<Value, Value> + Send + Sync + 'static,
    ) -> Self {
        self.handlers.insert(method.to_owned(), Arc::new(handler));
        self
    }

    /// Never answer `method`.
    pub fn hang_on(mut self, method: &str) -> Self {
        self.hang.insert(method.to_owned());
        self
    }

    /// Close the connection once `method` has been handled.
    pub fn disconnect_after(mut self, method: &str) -> Self {
        self.disconnect.insert(method.to_owned());
        self
    }

    /// Send raw `frames` right after answering `method`.
    pub fn notify_after(mut self, method: &str, frames: Vec<Value>) -> Self {
        self.notifications.insert(method.to_owned(), frames);
        self
    }

    /// Hold each response until the next one is ready, then send both in
    /// reverse order.
    pub fn reverse_pairs(mut self) -> Self {
        self.reverse_pairs = true;
        self
    }

    /// Send a response with an id nobody asked for after the handshake.
    pub fn with_stray_response(mut self, id: u64) -> Self {
        self.stray_id = Some(id);
        self
    }

    /// Requests received so far, handshake included.
    pub fn requests(&self) -> Arc<Mutex<Vec<(String, Vec<Value>)>>> {
        Arc::clone(&self.requests)
    }

    /// Notified once the client side of the connection has gone away.
    pub fn hung_up(&self) -> Arc<Notify> {
        Arc::clone(&self.hung_up)
    }

    async fn serve(self, stream: DuplexStream) {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();
        let mut held: Option<Value> = None;

        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(request) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            let id = request["id"].clone();
            let method = request["method"].as_str().unwrap_or_default().to_owned();
            let params = request["params"].as_array().cloned().unwrap_or_default();
            self.requests
                .lock()
                .expect("request log")
                .push((method.clone(), params.clone()));

            if !self.hang.contains(&method) {
                let reply = match self.handlers.get(&method) {
                    Some(handler) => handler(&params),
                    None => Err(json!({"code": -32601, "message": format!("unknown method {method}")})),
                };
                let response = match reply {
                    Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                    Err(error) => json!({"jsonrpc": "2.0", "id": id, "error": error}),
                };

                if self.reverse_pairs && method != "server.version" {
                    match held.take() {
                        None => held = Some(response),
                        Some(first) => {
                            write_frame(&mut writer, &response).await;
                            write_frame(&mut writer, &first).await;
                        }
                    }
                } else {
                    write_frame(&mut writer, &response).await;
                }

                if method == "server.version" {
                    if let Some(stray) = self.stray_id {
                        write_frame(&mut writer, &json!({"jsonrpc": "2.0", "id": stray, "result": null}))
                            .await;
                    }
                }
            }

            if let Some(frames) = self.notifications.get(&method) {
                for frame in frames {
                    write_frame(&mut writer, frame).await;
                }
            }
            if self.disconnect.contains(&method) {
                return;
            }
        }
        self.hung_up.notify_one();
    }
}

async fn write_frame(writer: &mut tokio::io::WriteHalf<DuplexStream>, frame: &Value) {
    let mut bytes = serde_json::to_vec(frame).expect("frame serializes");
    bytes.push(b'\n');
    let _ = writer.write_all(&bytes).await;
}

/// Hands out one fake server per connect, in order; fails once exhausted.
pub struct ScriptedConnector {
    servers: Mutex<VecDeque<FakeServer>>,
}

impl ScriptedConnector {
    pub fn single(server: FakeServer) -> Self {
        Self::sequence(vec![server])
    }

    pub fn sequence(servers: Vec<FakeServer>) -> Self {
        Self {
            servers: Mutex::new(servers.into()),
        }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<BoxedStream, CoreError> {
        let server = self
            .servers
            .lock()
            .expect("server queue")
            .pop_front()
            .ok_or_else(|| CoreError::ConnectionLost("no more scripted servers".into()))?;
        let (client, server_end) = tokio::io::duplex(64 * 1024);
        tokio::spawn(server.serve(server_end));
        Ok(Box::new(client))
    }

    fn endpoint(&self) -> String {
        "fake://electrum".to_owned()
    }
}

// ==============================================================================
// Chain Query Mock
// ==============================================================================

/// Canned chain data for the verifier and wallet compositions.
#[derive(Default)]
pub struct MockChain {
    headers: HashMap<u32, BlockHeader>,
    branches: HashMap<Txid, MerkleBranch>,
    unspents: HashMap<String, Vec<UnspentOutput>>,
    transactions: HashMap<Txid, Transaction>,
    tip: u32,
    reject: Option<String>,
    broadcasts: Mutex<Vec<String>>,
}

impl MockChain {
    pub fn builder() -> MockChainBuilder {
        MockChainBuilder {
            chain: MockChain::default(),
        }
    }

    pub fn broadcasts(&self) -> Vec<String> {
        self.broadcasts.lock().expect("broadcast log").clone()
    }
}

pub struct MockChainBuilder {
    chain: MockChain,
}

impl MockChainBuilder {
    pub fn with_header(mut self, header: BlockHeader) -> Self {
        self.chain.tip = self.chain.tip.max(header.height);
        self.chain.headers.insert(header.height, header);
        self
    }

    pub fn with_branch(mut self, tx_hash: Txid, branch: MerkleBranch) -> Self {
        self.chain.branches.insert(tx_hash, branch);
        self
    }

    pub fn with_unspents(mut self, address: &str, unspents: Vec<UnspentOutput>) -> Self {
        self.chain.unspents.insert(address.to_owned(), unspents);
        self
    }

    pub fn with_tx(mut self, tx: Transaction) -> Self {
        self.chain.transactions.insert(tx.compute_txid(), tx);
        self
    }

    pub fn rejecting(mut self, reason: &str) -> Self {
        self.chain.reject = Some(reason.to_owned());
        self
    }

    pub fn build(self) -> MockChain {
        self.chain
    }
}

#[async_trait]
impl ChainQuery for MockChain {
    async fn block_header(&self, height: u32) -> Result<BlockHeader, CoreError> {
        self.headers.get(&height).cloned().ok_or(CoreError::ServerError {
            code: 1,
            message: format!("height {height} out of range"),
        })
    }

    async fn get_merkle(&self, tx_hash: &Txid, _height: u32) -> Result<MerkleBranch, CoreError> {
        self.branches.get(tx_hash).cloned().ok_or(CoreError::ServerError {
            code: 1,
            message: format!("tx {tx_hash} not in block"),
        })
    }

    async fn unspent(&self, address: &str) -> Result<Vec<UnspentOutput>, CoreError> {
        Ok(self.unspents.get(address).cloned().unwrap_or_default())
    }

    async fn get_tx(&self, txid: &Txid) -> Result<Transaction, CoreError> {
        self.transactions
            .get(txid)
            .cloned()
            .ok_or(CoreError::ServerError {
                code: 2,
                message: format!("no such transaction {txid}"),
            })
    }

    async fn pushtx(&self, raw_tx: &str) -> Result<Txid, CoreError> {
        if let Some(reason) = &self.reject {
            return Err(CoreError::BroadcastRejected(reason.clone()));
        }
        let txid = public_txhash(raw_tx)?;
        self.broadcasts
            .lock()
            .expect("broadcast log")
            .push(raw_tx.to_owned());
        Ok(txid)
    }

    async fn current_height(&self) -> Result<u32, CoreError> {
        Ok(self.tip)
    }
}
