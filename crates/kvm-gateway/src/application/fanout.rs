//! Topic-keyed delivery of events to viewer sockets.
//!
//! # How it works (for beginners)
//!
//! A *topic* is just a string key: a device id for the video and signaling
//! groups, a room id for presence, or `"devices"` for the status bus.  Each
//! topic holds a set of [`Subscriber`]s keyed by their UUID.
//!
//! Broadcasting takes a *snapshot* of the topic's current members, releases
//! the lock, and then sends to all of them concurrently.  Because the lock is
//! not held while sending, one slow socket never blocks another task from
//! joining or leaving.  Sockets that fail during the pass are collected and
//! removed only after every send has finished, then closed.
//!
//! The gateway creates one independent [`ConnectionFanout`] per purpose, so a
//! broadcast on the video group can never reach a socket that only joined
//! the signaling group.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use kvm_core::GatewayEvent;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Errors raised while delivering to a subscriber.
#[derive(Debug, Error)]
pub enum FanoutError {
    /// The socket is gone or refused the frame.
    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("event serialization failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One viewer socket, as seen by the fanout.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Stable identity used for membership.
    fn id(&self) -> Uuid;

    /// Sends one text frame.
    async fn send_text(&self, text: &str) -> Result<(), FanoutError>;

    /// Closes the socket.  Idempotent.
    async fn close(&self);
}

/// Outcome of one broadcast pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

type Members = HashMap<Uuid, Arc<dyn Subscriber>>;

/// A named group of topics.
pub struct ConnectionFanout {
    name: &'static str,
    topics: RwLock<HashMap<String, Members>>,
}

impl ConnectionFanout {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            topics: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Joins `subscriber` to `topic` and returns the topic's new size.
    pub async fn add_subscriber(&self, topic: &str, subscriber: Arc<dyn Subscriber>) -> usize {
        let mut topics = self.topics.write().await;
        let members = topics.entry(topic.to_string()).or_default();
        members.insert(subscriber.id(), subscriber);
        debug!("{}: joined {topic} ({} member(s))", self.name, members.len());
        members.len()
    }

    /// Removes `id` from `topic`.  Returns `false` when it was not a member.
    pub async fn remove_subscriber(&self, topic: &str, id: Uuid) -> bool {
        let mut topics = self.topics.write().await;
        let Some(members) = topics.get_mut(topic) else {
            return false;
        };
        let removed = members.remove(&id).is_some();
        if members.is_empty() {
            topics.remove(topic);
        }
        removed
    }

    /// Removes `id` from every topic.  Returns how many topics it left.
    pub async fn remove_everywhere(&self, id: Uuid) -> usize {
        let mut topics = self.topics.write().await;
        let mut left = 0;
        topics.retain(|_, members| {
            if members.remove(&id).is_some() {
                left += 1;
            }
            !members.is_empty()
        });
        left
    }

    /// Serializes `event` once and delivers it to every member of `topic`.
    pub async fn broadcast(&self, topic: &str, event: &GatewayEvent) -> BroadcastReport {
        match serde_json::to_string(event) {
            Ok(text) => self.broadcast_text(topic, &text).await,
            Err(e) => {
                error!("{}: cannot encode {}: {e}", self.name, event.type_name());
                BroadcastReport::default()
            }
        }
    }

    /// Delivers a pre-encoded frame to every member of `topic`.
    pub async fn broadcast_text(&self, topic: &str, text: &str) -> BroadcastReport {
        let snapshot: Vec<Arc<dyn Subscriber>> = match self.topics.read().await.get(topic) {
            Some(members) => members.values().cloned().collect(),
            None => return BroadcastReport::default(),
        };

        let outcomes = join_all(snapshot.iter().map(|s| async move {
            let result = s.send_text(text).await;
            (s, result)
        }))
        .await;

        let mut report = BroadcastReport::default();
        let mut dead = Vec::new();
        for (subscriber, result) in outcomes {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("{}: dropping {} from {topic}: {e}", self.name, subscriber.id());
                    report.failed += 1;
                    dead.push(Arc::clone(subscriber));
                }
            }
        }

        for subscriber in dead {
            self.remove_everywhere(subscriber.id()).await;
            subscriber.close().await;
        }
        report
    }

    /// Sends `event` to one socket.  A failed send prunes that socket from
    /// every topic of this fanout and closes it.
    pub async fn send_personal(&self, subscriber: &Arc<dyn Subscriber>, event: &GatewayEvent) -> bool {
        let result = match serde_json::to_string(event) {
            Ok(text) => subscriber.send_text(&text).await,
            Err(e) => Err(FanoutError::from(e)),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("{}: personal send to {} failed: {e}", self.name, subscriber.id());
                self.remove_everywhere(subscriber.id()).await;
                subscriber.close().await;
                false
            }
        }
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().await.get(topic).map_or(0, HashMap::len)
    }

    /// Names of the non-empty topics, sorted.
    pub async fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Closes and forgets every member of `topic`.  Returns how many were closed.
    pub async fn close_topic(&self, topic: &str) -> usize {
        let removed = self.topics.write().await.remove(topic);
        let Some(members) = removed else {
            return 0;
        };
        for subscriber in members.values() {
            subscriber.close().await;
        }
        debug!("{}: closed {topic} ({} member(s))", self.name, members.len());
        members.len()
    }

    /// Closes every member of every topic.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<(String, Members)> = self.topics.write().await.drain().collect();
        let mut closed = 0;
        for (_, members) in drained {
            for subscriber in members.values() {
                subscriber.close().await;
                closed += 1;
            }
        }
        closed
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
