//! One persistent connection to an ElectrumX server.
//!
//! Requests are multiplexed over the connection by id; a single reader task
//! resolves them as responses arrive, in whatever order the server sends
//! them, and routes notifications to the subscription registry. Registry
//! locks are never held across an await; only writing a frame is
//! serialized.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::channel::mpsc;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::protocol::{decode_frame, encode_request, method, Frame};
use super::registry::{ChannelKey, RawNotification, Registry};
use super::transport::{BoxedStream, Connector};
use crate::error::CoreError;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;
type Responder = oneshot::Sender<Result<Value, CoreError>>;

// ==============================================================================
// State And Configuration
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Ready,
    Closing,
    Closed,
    Faulted,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Ready => write!(f, "ready"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
            Self::Faulted => write!(f, "faulted"),
        }
    }
}

/// Reconnection after a transport failure. Subscriptions are never
/// restored automatically.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_attempts: Some(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sent as the first `server.version` argument.
    pub client_name: String,
    pub protocol_version: String,
    pub request_timeout: Duration,
    /// Interval of `server.ping`; `None` disables the keepalive.
    pub keepalive: Option<Duration>,
    pub reconnect: ReconnectPolicy,
    pub requests_per_second: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_name: concat!("coinwire/", env!("CARGO_PKG_VERSION")).to_owned(),
            protocol_version: "1.4".to_owned(),
            request_timeout: Duration::from_secs(30),
            keepalive: Some(Duration::from_secs(60)),
            reconnect: ReconnectPolicy::default(),
            requests_per_second: None,
        }
    }
}

/// What the server answered to `server.version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVersion {
    pub software: String,
    pub protocol: String,
}

struct PendingRequest {
    method: &'static str,
    responder: Responder,
    /// Set for subscribe calls: the result is also delivered to this
    /// channel as its first notification.
    channel: Option<ChannelKey>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ==============================================================================
// Session
// ==============================================================================

/// Owned handle to a live session. Dropping it stops the background tasks.
pub struct Session {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: SessionConfig,
    limiter: Option<DirectRateLimiter>,
    next_id: AtomicU64,
    /// Bumped on every connect so a stale reader cannot fault a newer
    /// connection.
    generation: AtomicU64,
    reconnecting: AtomicBool,
    state: watch::Sender<SessionState>,
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedStream>>>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    registry: Registry,
    unmatched: AtomicU64,
    server_version: Mutex<Option<ServerVersion>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Connect, perform the `server.version` handshake and start the
    /// keepalive. Fails without retrying if the first connection fails.
    pub async fn open(
        connector: Arc<dyn Connector>,
        config: SessionConfig,
    ) -> Result<Self, CoreError> {
        let limiter = match config.requests_per_second {
            None => None,
            Some(limit) => {
                let limit = NonZeroU32::new(limit).ok_or_else(|| {
                    CoreError::Protocol("requests_per_second must be at least 1".to_owned())
                })?;
                Some(RateLimiter::direct(Quota::per_second(limit)))
            }
        };
        let (state, _) = watch::channel(SessionState::Disconnected);
        let inner = Arc::new(Inner {
            connector,
            config,
            limiter,
            next_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
            reconnecting: AtomicBool::new(false),
            state,
            writer: tokio::sync::Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            registry: Registry::default(),
            unmatched: AtomicU64::new(0),
            server_version: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        // Reconnection only applies once the session has been handed out.
        inner.reconnecting.store(true, Ordering::SeqCst);
        if let Err(err) = inner.connect().await {
            inner.shutdown(|| CoreError::SessionClosed);
            return Err(err);
        }
        inner.reconnecting.store(false, Ordering::SeqCst);

        if let Some(interval) = inner.config.keepalive {
            let handle = tokio::spawn(keepalive(Arc::clone(&inner), interval));
            locked(&inner.tasks).push(handle);
        }
        Ok(Self { inner })
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the session is `Ready`, e.g. after a reconnect. Fails once
    /// the session is closed, including when reconnection gives up.
    pub async fn wait_ready(&self) -> Result<(), CoreError> {
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|s| matches!(s, SessionState::Ready | SessionState::Closed))
            .await
            .map_err(|_| CoreError::SessionClosed)?;
        match *state {
            SessionState::Ready => Ok(()),
            _ => Err(CoreError::SessionClosed),
        }
    }

    pub fn server_version(&self) -> Option<ServerVersion> {
        locked(&self.inner.server_version).clone()
    }

    pub fn endpoint(&self) -> String {
        self.inner.connector.endpoint()
    }

    /// Responses that arrived with an id nobody was waiting for.
    pub fn unmatched_responses(&self) -> u64 {
        self.inner.unmatched.load(Ordering::Relaxed)
    }

    pub fn pending_requests(&self) -> usize {
        locked(&self.inner.pending).len()
    }

    pub fn subscriptions(&self) -> usize {
        self.inner.registry.len()
    }

    /// Send one request and wait for its response. Only allowed while
    /// `Ready`. A timed out request stays pending; a late response to it is
    /// discarded.
    pub async fn request(
        &self,
        method_name: &'static str,
        params: Vec<Value>,
    ) -> Result<Value, CoreError> {
        self.inner.ensure_ready()?;
        self.inner.call(method_name, params, None).await
    }

    /// Register a subscription on `key` and send its subscribe request.
    /// The initial result is returned and also delivered as the first item
    /// of the stream.
    pub async fn subscribe(
        &self,
        key: ChannelKey,
        params: Vec<Value>,
    ) -> Result<(Value, mpsc::UnboundedReceiver<RawNotification>), CoreError> {
        self.inner.ensure_ready()?;
        let stream = self.inner.registry.insert(key.clone())?;
        match self
            .inner
            .call(key.subscribe_method(), params, Some(key.clone()))
            .await
        {
            Ok(initial) => Ok((initial, stream)),
            Err(err) => {
                self.inner.registry.remove(&key);
                Err(err)
            }
        }
    }

    /// Drop the local subscription on `key`. Returns false if there was
    /// none.
    pub fn unsubscribe(&self, key: &ChannelKey) -> bool {
        self.inner.registry.remove(key)
    }

    pub fn is_subscribed(&self, key: &ChannelKey) -> bool {
        self.inner.registry.contains(key)
    }

    /// Last payload delivered on `key`.
    pub fn last_status(&self, key: &ChannelKey) -> Option<Value> {
        self.inner.registry.last_status(key)
    }

    /// Close the connection. Pending requests fail with `SessionClosed`
    /// and all subscriptions end.
    pub async fn close(&self) {
        self.inner.state.send_replace(SessionState::Closing);
        self.inner.shutdown(|| CoreError::SessionClosed);
        // A write stuck on a full socket holds the writer; do not wait on it
        // forever.
        let timeout = self.inner.config.request_timeout;
        if tokio::time::timeout(timeout, self.inner.close_writer()).await.is_err() {
            warn!(endpoint = %self.inner.connector.endpoint(), "writer busy; dropping connection unflushed");
        }
        info!(endpoint = %self.inner.connector.endpoint(), "electrum session closed");
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for handle in locked(&self.inner.tasks).drain(..) {
            handle.abort();
        }
    }
}

impl Inner {
    fn ensure_ready(&self) -> Result<(), CoreError> {
        match *self.state.borrow() {
            SessionState::Ready => Ok(()),
            SessionState::Closing | SessionState::Closed => Err(CoreError::SessionClosed),
            other => Err(CoreError::NotReady(other)),
        }
    }

    async fn connect(self: &Arc<Self>) -> Result<(), CoreError> {
        let endpoint = self.connector.endpoint();
        self.state.send_replace(SessionState::Connecting);
        debug!(endpoint = %endpoint, "electrum connecting");

        let stream = match tokio::time::timeout(self.config.request_timeout, self.connector.connect())
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                self.state.send_replace(SessionState::Faulted);
                return Err(err);
            }
            Err(_) => {
                self.state.send_replace(SessionState::Faulted);
                return Err(CoreError::Timeout(self.config.request_timeout));
            }
        };

        let (reader, writer) = tokio::io::split(stream);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.writer.lock().await = Some(writer);
        let handle = tokio::spawn(read_loop(Arc::clone(self), reader, generation));
        let reader_task = handle.abort_handle();
        {
            let mut tasks = locked(&self.tasks);
            tasks.retain(|task| !task.is_finished());
            tasks.push(handle);
        }

        let params = vec![
            json!(self.config.client_name),
            json!(self.config.protocol_version),
        ];
        let answer = match self.call(method::SERVER_VERSION, params, None).await {
            Ok(answer) => answer,
            Err(err) => {
                self.state.send_replace(SessionState::Faulted);
                reader_task.abort();
                self.close_writer().await;
                return Err(err);
            }
        };
        let version = parse_server_version(&answer);
        info!(
            endpoint = %endpoint,
            server = %version.software,
            protocol = %version.protocol,
            "electrum session ready"
        );
        *locked(&self.server_version) = Some(version);
        self.state.send_replace(SessionState::Ready);
        Ok(())
    }

    async fn call(
        &self,
        method_name: &'static str,
        params: Vec<Value>,
        channel: Option<ChannelKey>,
    ) -> Result<Value, CoreError> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            rpc.id = id,
            rpc.method = method_name,
            rpc.params = params.len(),
            "electrum call"
        );
        let frame = encode_request(id, method_name, &params)?;

        let (responder, response) = oneshot::channel();
        locked(&self.pending).insert(
            id,
            PendingRequest {
                method: method_name,
                responder,
                channel,
            },
        );

        if let Err(err) = self.write_frame(&frame).await {
            locked(&self.pending).remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(self.config.request_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::ConnectionLost(
                "request dropped by the session".to_owned(),
            )),
            Err(_) => {
                warn!(rpc.id = id, rpc.method = method_name, "electrum call timed out");
                Err(CoreError::Timeout(self.config.request_timeout))
            }
        }
    }

    async fn close_writer(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), CoreError> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| CoreError::ConnectionLost("no open connection".to_owned()))?;
        writer
            .write_all(frame)
            .await
            .map_err(|e| CoreError::ConnectionLost(format!("write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| CoreError::ConnectionLost(format!("flush failed: {e}")))
    }

    fn dispatch(&self, line: &str) {
        trace!(frame = %line, "electrum frame");
        let frame = match decode_frame(line) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "discarding undecodable frame");
                return;
            }
        };

        match frame {
            Frame::Response { id, result } => {
                let Some(pending) = locked(&self.pending).remove(&id) else {
                    self.unmatched.fetch_add(1, Ordering::Relaxed);
                    debug!(rpc.id = id, "discarding unmatched response");
                    return;
                };
                debug!(rpc.id = id, rpc.method = pending.method, ok = result.is_ok(), "electrum response");
                if let (Some(key), Ok(initial)) = (&pending.channel, &result) {
                    self.registry.deliver(
                        key,
                        RawNotification {
                            method: pending.method.to_owned(),
                            params: key.notification_params(initial.clone()),
                        },
                    );
                }
                // The caller may have given up; that is fine.
                let _ = pending.responder.send(result);
            }
            Frame::Notification { method, params } => {
                if !self.registry.route(&method, params) {
                    trace!(rpc.method = %method, "dropping unmatched notification");
                }
            }
        }
    }

    fn fail_pending(&self, error: impl Fn() -> CoreError) {
        let drained: Vec<PendingRequest> = locked(&self.pending).drain().map(|(_, p)| p).collect();
        for pending in drained {
            let _ = pending.responder.send(Err(error()));
        }
    }

    /// Transport failure on connection `generation`.
    fn fault(self: &Arc<Self>, generation: u64, reason: String) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if matches!(
            *self.state.borrow(),
            SessionState::Closing | SessionState::Closed
        ) {
            return;
        }
        warn!(endpoint = %self.connector.endpoint(), reason = %reason, "electrum session faulted");
        self.state.send_replace(SessionState::Faulted);
        self.fail_pending(|| CoreError::ConnectionLost(reason.clone()));
        self.registry.clear();

        if self.config.reconnect.enabled
            && self
                .reconnecting
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            let handle = tokio::spawn(reconnect(Arc::clone(self)));
            locked(&self.tasks).push(handle);
        }
    }

    fn shutdown(&self, error: impl Fn() -> CoreError) {
        self.fail_pending(error);
        self.registry.clear();
        self.state.send_replace(SessionState::Closed);
        for handle in locked(&self.tasks).drain(..) {
            handle.abort();
        }
    }
}

fn parse_server_version(answer: &Value) -> ServerVersion {
    let field = |index: usize| {
        answer
            .get(index)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned()
    };
    ServerVersion {
        software: field(0),
        protocol: field(1),
    }
}

// ==============================================================================
// Background Tasks
// ==============================================================================

async fn read_loop(inner: Arc<Inner>, reader: ReadHalf<BoxedStream>, generation: u64) {
    let mut lines = BufReader::new(reader).lines();
    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if !line.trim().is_empty() {
                    inner.dispatch(&line);
                }
            }
            Ok(None) => break "server closed the connection".to_owned(),
            Err(err) => break format!("read failed: {err}"),
        }
    };
    inner.fault(generation, reason);
}

async fn reconnect(inner: Arc<Inner>) {
    let policy = inner.config.reconnect.clone();
    let mut backoff = policy.initial_backoff;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if policy.max_attempts.is_some_and(|max| attempt > max) {
            warn!(attempts = attempt - 1, "electrum reconnect abandoned");
            inner.shutdown(|| CoreError::SessionClosed);
            break;
        }
        tokio::time::sleep(backoff).await;
        if matches!(
            *inner.state.borrow(),
            SessionState::Closing | SessionState::Closed
        ) {
            break;
        }
        match inner.connect().await {
            Ok(()) => {
                info!(attempt, "electrum session reconnected");
                break;
            }
            Err(err) => {
                warn!(
                    attempt,
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "electrum reconnect failed"
                );
                backoff = (backoff * 2).min(policy.max_backoff);
            }
        }
    }
    inner.reconnecting.store(false, Ordering::SeqCst);
}

async fn keepalive(inner: Arc<Inner>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        match *inner.state.borrow() {
            SessionState::Closing | SessionState::Closed => break,
            SessionState::Ready => {}
            _ => continue,
        }
        if let Err(err) = inner.call(method::SERVER_PING, Vec::new(), None).await {
            debug!(error = %err, "keepalive ping failed");
        }
    }
}
