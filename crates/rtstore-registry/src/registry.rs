//! Serialized per-key topic registry.
//!
//! A single serializer task owns all topic state. Every mutation — subscribe,
//! unsubscribe, publish — arrives as a command over one channel and is
//! processed strictly in arrival order. This is the one place in the system
//! where a mutex would have been tempting and a single-writer task is used
//! instead: it makes "close exactly once" trivial and removes all cross-topic
//! races, at the cost of a regeneration function blocking later commands
//! while it runs.

use std::collections::HashMap;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Capacity of each subscriber's delivery channel. The registry never blocks
/// on a full channel; see [`Registry::publish`].
const DELIVERY_CAPACITY: usize = 1;

/// A caller-supplied thunk producing the bytes to deliver to subscribers of a
/// topic, evaluated fresh at publish time. Used by collection subscriptions
/// to recompute their filtered/ordered/limited view before delivery.
pub type RegenFn = std::sync::Arc<dyn Fn() -> BoxFuture<'static, Vec<u8>> + Send + Sync>;

enum Command {
    Subscribe {
        key: String,
        f: Option<RegenFn>,
        sender: mpsc::Sender<Vec<u8>>,
        reply: oneshot::Sender<u64>,
    },
    Unsubscribe {
        key: String,
        id: u64,
    },
    Publish {
        key: String,
        data: Vec<u8>,
    },
}

struct Topic {
    f: Option<RegenFn>,
    subscribers: Vec<(u64, mpsc::Sender<Vec<u8>>)>,
}

/// A handle returned by [`Registry::subscribe`]: the channel to read
/// published values from, plus the id needed to unsubscribe later.
pub struct Subscription {
    pub id: u64,
    pub receiver: mpsc::Receiver<Vec<u8>>,
}

/// Handle to the registry's command channel. Cheap to clone; every clone
/// talks to the same serializer task.
#[derive(Clone)]
pub struct Registry {
    cmd_tx: mpsc::Sender<Command>,
}

impl Registry {
    /// Spawn the serializer task and return a handle to it.
    pub fn new() -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        tokio::spawn(run(cmd_rx));
        Self { cmd_tx }
    }

    /// Subscribe to `key`. `f`, if given, is remembered on the topic only if
    /// no regeneration function is already stored for it (first-writer-wins).
    /// Never blocks waiting on a slow subscriber; the caller's receiver has
    /// capacity 1 and deliveries are dropped, not queued, when full.
    pub async fn subscribe(&self, key: impl Into<String>, f: Option<RegenFn>) -> Subscription {
        let (sender, receiver) = mpsc::channel(DELIVERY_CAPACITY);
        let (reply, reply_rx) = oneshot::channel();
        let key = key.into();
        if self.cmd_tx.send(Command::Subscribe { key, f, sender, reply }).await.is_err() {
            warn!("registry closed; subscribe had no effect");
        }
        let id = match reply_rx.await {
            Ok(id) => id,
            Err(_) => {
                error!("registry reply channel closed unexpectedly; subscription id defaulted to 0");
                0
            }
        };
        Subscription { id, receiver }
    }

    /// Unsubscribe `id` from `key`. Idempotent: unsubscribing an id that is
    /// no longer present (or never was) is a no-op.
    pub async fn unsubscribe(&self, key: impl Into<String>, id: u64) {
        let _ = self.cmd_tx.send(Command::Unsubscribe { key: key.into(), id }).await;
    }

    /// Publish `data` on `key`. A no-op if the topic has no subscribers.
    pub async fn publish(&self, key: impl Into<String>, data: Vec<u8>) {
        let _ = self.cmd_tx.send(Command::Publish { key: key.into(), data }).await;
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

async fn run(mut cmd_rx: mpsc::Receiver<Command>) {
    let mut topics: HashMap<String, Topic> = HashMap::new();
    let mut next_id: u64 = 1;

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            Command::Subscribe { key, f, sender, reply } => {
                let id = next_id;
                next_id += 1;
                let topic = topics.entry(key).or_insert_with(|| Topic { f: None, subscribers: Vec::new() });
                if topic.f.is_none() {
                    topic.f = f;
                }
                topic.subscribers.push((id, sender));
                let _ = reply.send(id);
            }
            Command::Unsubscribe { key, id } => {
                if let Some(topic) = topics.get_mut(&key) {
                    if let Some(pos) = topic.subscribers.iter().position(|(sid, _)| *sid == id) {
                        let (_, sender) = topic.subscribers.swap_remove(pos);
                        drop(sender);
                    }
                    if topic.subscribers.is_empty() {
                        topics.remove(&key);
                    }
                }
            }
            Command::Publish { key, data } => {
                let Some(topic) = topics.get(&key) else {
                    debug!(topic = %key, "publish to topic with no subscribers; ignored");
                    continue;
                };
                let payload = match &topic.f {
                    Some(f) => f().await,
                    None => data,
                };
                for (_, sender) in &topic.subscribers {
                    if sender.try_send(payload.clone()).is_err() {
                        debug!(topic = %key, "subscriber buffer full; event dropped");
                    }
                }
            }
        }
    }
}
