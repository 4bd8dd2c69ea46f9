//! Per-connection WebSocket protocol loop: decodes incoming frames, dispatches
//! to the store, and multiplexes subscription delivery over one duplex
//! connection.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use rtstore_registry::{RegenFn, Registry};
use rtstore_types::prelude::*;
use rtstore_types::{path, query::Limit, query::Order, query::Query};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Subscribe,
    Add,
    Set,
    Update,
    Delete,
    Snapshot,
    ValueChange,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct OperationParameters {
    #[serde(default)]
    pub query: Query,
    #[serde(default)]
    pub order: Order,
    #[serde(default)]
    pub limit: Limit,
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct PayloadMetadata {
    #[serde(default)]
    pub exists: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketMessage {
    pub operation: Operation,
    pub key: String,
    #[serde(default, rename = "requestId")]
    pub request_id: u64,
    #[serde(default, rename = "transactionId")]
    pub transaction_id: u64,
    #[serde(default, rename = "operationParameters")]
    pub operation_parameters: OperationParameters,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, rename = "payloadMetadata")]
    pub payload_metadata: PayloadMetadata,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
}

fn value_change_frame(key: &str, data: Option<&[u8]>) -> String {
    let payload = match data {
        Some(bytes) => serde_json::from_slice::<Value>(bytes).unwrap_or(Value::Null),
        None => Value::Null,
    };
    let exists = data.is_some();
    let msg = WebSocketMessage {
        operation: Operation::ValueChange,
        key: key.to_string(),
        request_id: 0,
        transaction_id: 0,
        operation_parameters: OperationParameters::default(),
        payload,
        payload_metadata: PayloadMetadata { exists },
        error: None,
    };
    serde_json::to_string(&msg).unwrap_or_default()
}

fn snapshot_frame(key: &str, request_id: u64, data: Option<&[u8]>) -> String {
    let payload = match data {
        Some(bytes) => serde_json::from_slice::<Value>(bytes).unwrap_or(Value::Null),
        None => Value::Null,
    };
    let exists = data.is_some();
    let msg = WebSocketMessage {
        operation: Operation::Snapshot,
        key: key.to_string(),
        request_id,
        transaction_id: 0,
        operation_parameters: OperationParameters::default(),
        payload,
        payload_metadata: PayloadMetadata { exists },
        error: None,
    };
    serde_json::to_string(&msg).unwrap_or_default()
}

fn error_frame(operation: Operation, key: &str, request_id: u64, message: String) -> String {
    let msg = WebSocketMessage {
        operation,
        key: key.to_string(),
        request_id,
        transaction_id: 0,
        operation_parameters: OperationParameters::default(),
        payload: Value::Null,
        payload_metadata: PayloadMetadata::default(),
        error: Some(ErrorInfo { message }),
    };
    serde_json::to_string(&msg).unwrap_or_default()
}

/// A connection's outgoing half. Abstracted over the concrete `WebSocket`
/// write sink so the dispatch loop can be driven in tests without a real
/// socket upgrade.
#[async_trait]
trait FrameSink: Send + Sync {
    async fn send_frame(&self, frame: String);
}

struct SocketSink {
    inner: Mutex<futures::stream::SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl FrameSink for SocketSink {
    async fn send_frame(&self, frame: String) {
        if let Err(err) = self.inner.lock().await.send(Message::Text(frame.into())).await {
            debug!(%err, "write to closed connection; dropping frame");
        }
    }
}

async fn write_frame(sink: &Arc<dyn FrameSink>, frame: String) {
    sink.send_frame(frame).await;
}

fn regeneration_fn(store: Arc<dyn Store>, key: String, query: Query, order: Order, limit: Limit) -> RegenFn {
    Arc::new(move || {
        let store = store.clone();
        let key = key.clone();
        let query = query.clone();
        let order = order.clone();
        Box::pin(async move {
            let items = match store.collection(&key).await {
                Ok(coll) => coll.items(query, order, limit).await.unwrap_or_default(),
                Err(_) => Vec::new(),
            };
            serde_json::to_vec(&items).unwrap_or_default()
        })
    })
}

fn spawn_delivery_task(
    sink: Arc<dyn FrameSink>,
    key: String,
    mut receiver: tokio::sync::mpsc::Receiver<Vec<u8>>,
) {
    tokio::spawn(async move {
        while let Some(data) = receiver.recv().await {
            let exists = !data.is_empty();
            let frame = value_change_frame(&key, exists.then_some(data.as_slice()));
            write_frame(&sink, frame).await;
        }
    });
}

/// Drive one WebSocket connection's protocol loop to completion. Returns once
/// the socket is closed or a read error occurs; every subscription opened on
/// this connection has been unsubscribed by the time this returns.
pub async fn handle_socket(socket: WebSocket, store: Arc<dyn Store>, registry: Registry) {
    let (sink, mut stream) = socket.split();
    let sink: Arc<dyn FrameSink> = Arc::new(SocketSink { inner: Mutex::new(sink) });
    let mut subscriptions: HashMap<String, u64> = HashMap::new();

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(err) => {
                warn!(%err, "read error on websocket; tearing down session");
                break;
            }
        };
        let text = match frame {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => break,
            _ => {
                warn!("non-text frame on websocket; ignored");
                continue;
            }
        };
        let parsed: WebSocketMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(err) => {
                warn!(%err, "malformed websocket frame; ignored");
                continue;
            }
        };
        dispatch(parsed, &store, &registry, &sink, &mut subscriptions).await;
    }

    for (key, id) in subscriptions.drain() {
        registry.unsubscribe(key, id).await;
    }
}

async fn dispatch(
    msg: WebSocketMessage,
    store: &Arc<dyn Store>,
    registry: &Registry,
    sink: &Arc<dyn FrameSink>,
    subscriptions: &mut HashMap<String, u64>,
) {
    debug!(operation = ?msg.operation, key = %msg.key, request_id = msg.request_id, "dispatching operation");
    match msg.operation {
        Operation::Subscribe => handle_subscribe(msg, store, registry, sink, subscriptions).await,
        Operation::Set => handle_document_write(&msg.key, msg.payload, store, WriteKind::Set).await,
        Operation::Update => handle_document_write(&msg.key, msg.payload, store, WriteKind::Update).await,
        Operation::Delete => handle_delete(&msg.key, store).await,
        Operation::Add => handle_add(&msg.key, msg.payload, store).await,
        Operation::Snapshot => handle_snapshot(msg, store, sink).await,
        Operation::ValueChange => {
            debug!(key = %msg.key, "ignoring client-sent VALUE_CHANGE (outgoing-only operation)");
        }
    }
}

async fn handle_subscribe(
    msg: WebSocketMessage,
    store: &Arc<dyn Store>,
    registry: &Registry,
    sink: &Arc<dyn FrameSink>,
    subscriptions: &mut HashMap<String, u64>,
) {
    let key = msg.key;
    let request_id = msg.request_id;
    if subscriptions.contains_key(&key) {
        debug!(%key, "subscribe ignored: already subscribed in this session");
        return;
    }
    let is_document = matches!(path::is_document(&key), Ok(true));
    let is_collection = matches!(path::is_collection(&key), Ok(true));

    if is_document {
        let sub = registry.subscribe(key.clone(), None).await;
        match store.document(&key).await {
            Ok(doc) => match doc.get().await {
                Ok(current) => {
                    write_frame(sink, value_change_frame(&key, current.as_deref())).await;
                }
                Err(err) => {
                    warn!(%key, %err, "subscribe: document read failed");
                    write_frame(sink, error_frame(Operation::Subscribe, &key, request_id, err.to_string())).await;
                }
            },
            Err(err) => {
                warn!(%key, %err, "subscribe: document lookup failed");
                write_frame(sink, value_change_frame(&key, None)).await;
            }
        }
        subscriptions.insert(key.clone(), sub.id);
        spawn_delivery_task(sink.clone(), key, sub.receiver);
    } else if is_collection {
        let params = msg.operation_parameters;
        let f = regeneration_fn(store.clone(), key.clone(), params.query.clone(), params.order.clone(), params.limit);
        let sub = registry.subscribe(key.clone(), Some(f)).await;
        match store.collection(&key).await {
            Ok(coll) => match coll.items(params.query, params.order, params.limit).await {
                Ok(items) => {
                    let encoded = serde_json::to_vec(&items).unwrap_or_default();
                    write_frame(sink, value_change_frame(&key, Some(&encoded))).await;
                }
                Err(err) => {
                    warn!(%key, %err, "subscribe: collection read failed");
                    write_frame(sink, error_frame(Operation::Subscribe, &key, request_id, err.to_string())).await;
                }
            },
            Err(err) => {
                warn!(%key, %err, "subscribe: collection lookup failed");
                let encoded = serde_json::to_vec(&Vec::<Item>::new()).unwrap_or_default();
                write_frame(sink, value_change_frame(&key, Some(&encoded))).await;
            }
        }
        subscriptions.insert(key.clone(), sub.id);
        spawn_delivery_task(sink.clone(), key, sub.receiver);
    } else {
        warn!(%key, "subscribe: not a valid path");
        let message = format!("invalid path: {key}");
        write_frame(sink, error_frame(Operation::Subscribe, &key, request_id, message)).await;
    }
}

enum WriteKind {
    Set,
    Update,
}

async fn handle_document_write(key: &str, payload: Value, store: &Arc<dyn Store>, kind: WriteKind) {
    let data = serde_json::to_vec(&payload).unwrap_or_default();
    let doc = match store.document(key).await {
        Ok(doc) => doc,
        Err(err) => {
            warn!(%key, %err, "write: document lookup failed");
            return;
        }
    };
    let result = match kind {
        WriteKind::Set => doc.set(data).await,
        WriteKind::Update => doc.update(data).await,
    };
    if let Err(err) = result {
        warn!(%key, %err, "write failed");
    }
}

async fn handle_delete(key: &str, store: &Arc<dyn Store>) {
    let doc = match store.document(key).await {
        Ok(doc) => doc,
        Err(err) => {
            warn!(%key, %err, "delete: document lookup failed");
            return;
        }
    };
    if let Err(err) = doc.delete().await {
        warn!(%key, %err, "delete failed");
    }
}

async fn handle_add(key: &str, payload: Value, store: &Arc<dyn Store>) {
    let data = serde_json::to_vec(&payload).unwrap_or_default();
    let coll = match store.collection(key).await {
        Ok(coll) => coll,
        Err(err) => {
            warn!(%key, %err, "add: collection lookup failed");
            return;
        }
    };
    if let Err(err) = coll.add(data).await {
        warn!(%key, %err, "add failed");
    }
}

async fn handle_snapshot(msg: WebSocketMessage, store: &Arc<dyn Store>, sink: &Arc<dyn FrameSink>) {
    let key = msg.key;
    match store.document(&key).await {
        Ok(doc) => match doc.get().await {
            Ok(current) => {
                write_frame(sink, snapshot_frame(&key, msg.request_id, current.as_deref())).await;
            }
            Err(err) => {
                warn!(%key, %err, "snapshot: document read failed");
                write_frame(sink, error_frame(Operation::Snapshot, &key, msg.request_id, err.to_string())).await;
            }
        },
        Err(err) => {
            write_frame(sink, error_frame(Operation::Snapshot, &key, msg.request_id, err.to_string())).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::NotifyingStore;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn operation_serializes_as_screaming_snake_case() {
        let encoded = serde_json::to_string(&Operation::ValueChange).unwrap_or_default();
        assert_eq!(encoded, "\"VALUE_CHANGE\"");
        let encoded = serde_json::to_string(&Operation::Subscribe).unwrap_or_default();
        assert_eq!(encoded, "\"SUBSCRIBE\"");
    }

    #[test]
    fn message_tolerates_missing_optional_fields() {
        let json = r#"{"operation":"SET","key":"users/u1","payload":{"n":1}}"#;
        let parsed: WebSocketMessage = match serde_json::from_str(json) {
            Ok(m) => m,
            Err(_) => unreachable!("minimal envelope must deserialize"),
        };
        assert_eq!(parsed.key, "users/u1");
        assert_eq!(parsed.request_id, 0);
        assert_eq!(parsed.payload["n"], 1);
    }

    #[test]
    fn message_without_key_fails_to_deserialize() {
        let json = r#"{"operation":"SET","payload":{"n":1}}"#;
        let parsed: Result<WebSocketMessage, _> = serde_json::from_str(json);
        assert!(parsed.is_err(), "a frame missing `key` must not silently default to an empty key");
    }

    #[test]
    fn value_change_frame_marks_presence_via_payload_metadata() {
        let present = value_change_frame("users/u1", Some(br#"{"n":1}"#));
        assert!(present.contains("\"exists\":true"));

        let absent = value_change_frame("users/u1", None);
        assert!(absent.contains("\"exists\":false"));
        assert!(absent.contains("\"payload\":null"));
    }

    #[test]
    fn error_frame_carries_the_requesting_operation_and_request_id() {
        let frame = error_frame(Operation::Subscribe, "bad//path", 7, "invalid path: bad//path".into());
        assert!(frame.contains("\"operation\":\"SUBSCRIBE\""));
        assert!(frame.contains("\"requestId\":7"));
        assert!(frame.contains("\"message\":\"invalid path: bad//path\""));
    }

    /// In-memory [`Store`] used to drive `dispatch` end to end without a real
    /// `redb` file or a real socket.
    struct FakeStore {
        docs: Arc<StdMutex<HashMap<String, Vec<u8>>>>,
        next_child: Arc<StdMutex<HashMap<String, u64>>>,
    }

    impl FakeStore {
        fn new() -> Self {
            Self { docs: Arc::new(StdMutex::new(HashMap::new())), next_child: Arc::new(StdMutex::new(HashMap::new())) }
        }
    }

    #[async_trait]
    impl Store for FakeStore {
        async fn document(&self, path: &str) -> Result<Box<dyn Document>> {
            Ok(Box::new(FakeDocument { key: path.to_string(), docs: self.docs.clone() }))
        }
        async fn collection(&self, path: &str) -> Result<Box<dyn Collection>> {
            Ok(Box::new(FakeCollection { key: path.to_string(), docs: self.docs.clone(), next_child: self.next_child.clone() }))
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FakeDocument {
        key: String,
        docs: Arc<StdMutex<HashMap<String, Vec<u8>>>>,
    }

    #[async_trait]
    impl Document for FakeDocument {
        fn key(&self) -> &str {
            &self.key
        }
        async fn get(&self) -> Result<Option<Vec<u8>>> {
            Ok(self.docs.lock().map(|m| m.get(&self.key).cloned()).unwrap_or(None))
        }
        async fn set(&self, data: Vec<u8>) -> Result<()> {
            if let Ok(mut m) = self.docs.lock() {
                m.insert(self.key.clone(), data);
            }
            Ok(())
        }
        async fn update(&self, data: Vec<u8>) -> Result<()> {
            self.set(data).await
        }
        async fn delete(&self) -> Result<()> {
            if let Ok(mut m) = self.docs.lock() {
                m.remove(&self.key);
            }
            Ok(())
        }
    }

    struct FakeCollection {
        key: String,
        docs: Arc<StdMutex<HashMap<String, Vec<u8>>>>,
        next_child: Arc<StdMutex<HashMap<String, u64>>>,
    }

    #[async_trait]
    impl Collection for FakeCollection {
        fn key(&self) -> &str {
            &self.key
        }
        async fn add(&self, data: Vec<u8>) -> Result<Box<dyn Document>> {
            let next = match self.next_child.lock() {
                Ok(mut counters) => {
                    let entry = counters.entry(self.key.clone()).or_insert(0);
                    *entry += 1;
                    *entry
                }
                Err(_) => 1,
            };
            let child_key = path::child_document(&self.key, next);
            if let Ok(mut m) = self.docs.lock() {
                m.insert(child_key.clone(), data);
            }
            Ok(Box::new(FakeDocument { key: child_key, docs: self.docs.clone() }))
        }
        async fn items(&self, query: Query, order: Order, limit: Limit) -> Result<Vec<Item>> {
            let prefix = format!("{}/", self.key);
            let items: Vec<Item> = match self.docs.lock() {
                Ok(docs) => docs
                    .iter()
                    .filter(|(k, _)| k.starts_with(&prefix) && !k[prefix.len()..].contains('/'))
                    .map(|(k, v)| Item { key: k.clone(), value: v.clone() })
                    .collect(),
                Err(_) => Vec::new(),
            };
            Ok(rtstore_types::query::apply(items, &query, &order, &limit))
        }
    }

    /// In-memory [`FrameSink`] recording every frame a session would have
    /// written to its socket, in order.
    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_frame(&self, frame: String) {
            self.frames.lock().await.push(frame);
        }
    }

    fn subscribe_msg(key: &str, request_id: u64) -> WebSocketMessage {
        WebSocketMessage {
            operation: Operation::Subscribe,
            key: key.to_string(),
            request_id,
            transaction_id: 0,
            operation_parameters: OperationParameters::default(),
            payload: Value::Null,
            payload_metadata: PayloadMetadata::default(),
            error: None,
        }
    }

    fn set_msg(key: &str, payload: Value) -> WebSocketMessage {
        WebSocketMessage {
            operation: Operation::Set,
            key: key.to_string(),
            request_id: 0,
            transaction_id: 0,
            operation_parameters: OperationParameters::default(),
            payload,
            payload_metadata: PayloadMetadata::default(),
            error: None,
        }
    }

    fn delete_msg(key: &str) -> WebSocketMessage {
        WebSocketMessage {
            operation: Operation::Delete,
            key: key.to_string(),
            request_id: 0,
            transaction_id: 0,
            operation_parameters: OperationParameters::default(),
            payload: Value::Null,
            payload_metadata: PayloadMetadata::default(),
            error: None,
        }
    }

    /// Give spawned delivery tasks a chance to run on the current-thread test
    /// executor before we inspect what they wrote.
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn subscribe_then_set_delivers_a_value_change_to_the_subscriber() {
        let registry = Registry::new();
        let store: Arc<dyn Store> = Arc::new(NotifyingStore::new(Arc::new(FakeStore::new()), registry.clone()));
        let sink = Arc::new(RecordingSink::default());
        let dyn_sink: Arc<dyn FrameSink> = sink.clone();
        let mut subscriptions = HashMap::new();

        dispatch(subscribe_msg("users/u1", 1), &store, &registry, &dyn_sink, &mut subscriptions).await;
        settle().await;
        dispatch(set_msg("users/u1", serde_json::json!({"n": 1})), &store, &registry, &dyn_sink, &mut subscriptions).await;
        settle().await;

        let frames = sink.frames.lock().await.clone();
        assert!(subscriptions.contains_key("users/u1"));
        assert!(frames.iter().any(|f| f.contains("\"VALUE_CHANGE\"") && f.contains("\"exists\":true") && f.contains("\"n\":1")));
    }

    #[tokio::test]
    async fn delete_publishes_a_value_change_with_exists_false() {
        let registry = Registry::new();
        let store: Arc<dyn Store> = Arc::new(NotifyingStore::new(Arc::new(FakeStore::new()), registry.clone()));

        let Ok(doc) = store.document("users/u1").await else {
            unreachable!("users/u1 is a valid document path")
        };
        assert!(doc.set(b"{\"n\":1}".to_vec()).await.is_ok());

        let sink = Arc::new(RecordingSink::default());
        let dyn_sink: Arc<dyn FrameSink> = sink.clone();
        let mut subscriptions = HashMap::new();

        dispatch(subscribe_msg("users/u1", 1), &store, &registry, &dyn_sink, &mut subscriptions).await;
        settle().await;
        dispatch(delete_msg("users/u1"), &store, &registry, &dyn_sink, &mut subscriptions).await;
        settle().await;

        let frames = sink.frames.lock().await.clone();
        assert!(frames.iter().any(|f| f.contains("\"VALUE_CHANGE\"") && f.contains("\"exists\":false") && f.contains("\"payload\":null")));
    }

    #[tokio::test]
    async fn session_teardown_unsubscribes_every_open_subscription_without_affecting_others() {
        let registry = Registry::new();
        let store: Arc<dyn Store> = Arc::new(NotifyingStore::new(Arc::new(FakeStore::new()), registry.clone()));
        let sink = Arc::new(RecordingSink::default());
        let dyn_sink: Arc<dyn FrameSink> = sink.clone();
        let mut subscriptions = HashMap::new();

        dispatch(subscribe_msg("users/u1", 1), &store, &registry, &dyn_sink, &mut subscriptions).await;
        dispatch(subscribe_msg("users/u2", 2), &store, &registry, &dyn_sink, &mut subscriptions).await;
        assert_eq!(subscriptions.len(), 2);

        // An independent subscriber, standing in for a second connection, on a
        // topic this session never touches.
        let mut other_sub = registry.subscribe("users/u3", None).await;

        // Mirrors `handle_socket`'s teardown loop.
        for (key, id) in subscriptions.drain() {
            registry.unsubscribe(key, id).await;
        }
        assert!(subscriptions.is_empty());

        registry.publish("users/u3", b"still-alive".to_vec()).await;
        assert_eq!(other_sub.receiver.recv().await, Some(b"still-alive".to_vec()));
    }

    #[tokio::test]
    async fn subscribe_on_an_unreadable_document_surfaces_an_error_frame() {
        struct FailingStore;

        #[async_trait]
        impl Store for FailingStore {
            async fn document(&self, path: &str) -> Result<Box<dyn Document>> {
                Ok(Box::new(FailingDocument { key: path.to_string() }))
            }
            async fn collection(&self, path: &str) -> Result<Box<dyn Collection>> {
                Err(Error::EngineError(format!("no such collection: {path}")))
            }
            async fn close(&self) -> Result<()> {
                Ok(())
            }
        }

        struct FailingDocument {
            key: String,
        }

        #[async_trait]
        impl Document for FailingDocument {
            fn key(&self) -> &str {
                &self.key
            }
            async fn get(&self) -> Result<Option<Vec<u8>>> {
                Err(Error::EngineError("simulated engine failure".into()))
            }
            async fn set(&self, _data: Vec<u8>) -> Result<()> {
                Ok(())
            }
            async fn update(&self, _data: Vec<u8>) -> Result<()> {
                Ok(())
            }
            async fn delete(&self) -> Result<()> {
                Ok(())
            }
        }

        let registry = Registry::new();
        let store: Arc<dyn Store> = Arc::new(FailingStore);
        let sink = Arc::new(RecordingSink::default());
        let dyn_sink: Arc<dyn FrameSink> = sink.clone();
        let mut subscriptions = HashMap::new();

        dispatch(subscribe_msg("users/u1", 42), &store, &registry, &dyn_sink, &mut subscriptions).await;

        let frames = sink.frames.lock().await.clone();
        assert!(frames.iter().any(|f| f.contains("\"error\"") && f.contains("\"requestId\":42") && f.contains("simulated engine failure")));
    }
}
