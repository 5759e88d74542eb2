//! Subscription registry: at most one live subscription per channel.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use futures::channel::mpsc;
use serde_json::Value;
use tracing::{debug, trace};

use super::protocol::method;
use crate::error::CoreError;

/// What a subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelKey {
    Headers,
    Scripthash(String),
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Headers => write!(f, "block headers"),
            Self::Scripthash(hash) => write!(f, "scripthash {hash}"),
        }
    }
}

impl ChannelKey {
    /// Channel a server notification belongs to, judged by method name.
    pub(super) fn for_notification(method_name: &str, params: &[Value]) -> Option<Self> {
        match method_name {
            method::HEADERS_SUBSCRIBE => Some(Self::Headers),
            method::SCRIPTHASH_SUBSCRIBE => params
                .first()
                .and_then(Value::as_str)
                .map(|hash| Self::Scripthash(hash.to_owned())),
            _ => None,
        }
    }

    pub(super) fn subscribe_method(&self) -> &'static str {
        match self {
            Self::Headers => method::HEADERS_SUBSCRIBE,
            Self::Scripthash(_) => method::SCRIPTHASH_SUBSCRIBE,
        }
    }

    /// Notification params carrying `payload`, shaped like the server's.
    pub(super) fn notification_params(&self, payload: Value) -> Vec<Value> {
        match self {
            Self::Headers => vec![payload],
            Self::Scripthash(hash) => vec![Value::String(hash.clone()), payload],
        }
    }
}

/// A notification as received, before it is given a typed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RawNotification {
    pub method: String,
    pub params: Vec<Value>,
}

struct Entry {
    sink: mpsc::UnboundedSender<RawNotification>,
    last_status: Option<Value>,
}

#[derive(Default)]
pub(super) struct Registry {
    channels: Mutex<HashMap<ChannelKey, Entry>>,
}

impl Registry {
    fn channels(&self) -> std::sync::MutexGuard<'_, HashMap<ChannelKey, Entry>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn insert(
        &self,
        key: ChannelKey,
    ) -> Result<mpsc::UnboundedReceiver<RawNotification>, CoreError> {
        let mut channels = self.channels();
        if let Some(entry) = channels.get(&key) {
            if !entry.sink.is_closed() {
                return Err(CoreError::AlreadySubscribed(key.to_string()));
            }
        }
        let (sink, stream) = mpsc::unbounded();
        debug!(channel = %key, "subscription registered");
        channels.insert(
            key,
            Entry {
                sink,
                last_status: None,
            },
        );
        Ok(stream)
    }

    pub(super) fn remove(&self, key: &ChannelKey) -> bool {
        self.channels().remove(key).is_some()
    }

    pub(super) fn contains(&self, key: &ChannelKey) -> bool {
        self.channels().contains_key(key)
    }

    /// Deliver to the subscription of `key`. Returns false when nobody
    /// listens; a subscriber that went away is dropped from the registry.
    pub(super) fn deliver(&self, key: &ChannelKey, notification: RawNotification) -> bool {
        let mut channels = self.channels();
        let Some(entry) = channels.get_mut(key) else {
            trace!(channel = %key, "no subscription for notification");
            return false;
        };
        entry.last_status = notification.params.last().cloned();
        if entry.sink.unbounded_send(notification).is_err() {
            debug!(channel = %key, "subscriber gone, dropping subscription");
            channels.remove(key);
            return false;
        }
        true
    }

    /// Route a server notification by its method name.
    pub(super) fn route(&self, method_name: &str, params: Vec<Value>) -> bool {
        match ChannelKey::for_notification(method_name, &params) {
            Some(key) => self.deliver(
                &key,
                RawNotification {
                    method: method_name.to_owned(),
                    params,
                },
            ),
            None => false,
        }
    }

    pub(super) fn last_status(&self, key: &ChannelKey) -> Option<Value> {
        self.channels().get(key).and_then(|e| e.last_status.clone())
    }

    /// Drop every subscription; their streams end.
    pub(super) fn clear(&self) {
        self.channels().clear();
    }

    pub(super) fn len(&self) -> usize {
        self.channels().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[test]
    fn duplicate_subscription_is_rejected() {
        let registry = Registry::default();
        let _live = registry.insert(ChannelKey::Headers).unwrap();
        assert!(matches!(
            registry.insert(ChannelKey::Headers),
            Err(CoreError::AlreadySubscribed(_))
        ));
    }

    #[test]
    fn abandoned_subscription_can_be_replaced() {
        let registry = Registry::default();
        drop(registry.insert(ChannelKey::Headers).unwrap());
        assert!(registry.insert(ChannelKey::Headers).is_ok());
    }

    #[tokio::test]
    async fn routes_by_method_and_scripthash() {
        let registry = Registry::default();
        let mut stream = registry
            .insert(ChannelKey::Scripthash("aa".into()))
            .unwrap();

        assert!(registry.route(method::SCRIPTHASH_SUBSCRIBE, vec![json!("aa"), json!("s1")]));
        assert!(!registry.route(method::SCRIPTHASH_SUBSCRIBE, vec![json!("bb"), json!("s2")]));
        assert!(!registry.route(method::HEADERS_SUBSCRIBE, vec![json!({"height": 1})]));
        assert!(!registry.route("server.banner", vec![]));

        let got = stream.next().await.unwrap();
        assert_eq!(got.params, vec![json!("aa"), json!("s1")]);
        assert_eq!(
            registry.last_status(&ChannelKey::Scripthash("aa".into())),
            Some(json!("s1"))
        );
    }

    #[tokio::test]
    async fn clear_ends_streams() {
        let registry = Registry::default();
        let mut stream = registry.insert(ChannelKey::Headers).unwrap();
        registry.clear();
        assert_eq!(registry.len(), 0);
        assert!(stream.next().await.is_none());
    }
}
