//! Abstract document/collection operations over the embedded key-value engine.

use async_trait::async_trait;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::error::Result;
use crate::query::{Limit, Order, Query};

/// A `(key, value)` pair read out of a collection. `value` is opaque bytes;
/// it is only interpreted as JSON for serialization to WebSocket clients and
/// for query/order evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub value: Vec<u8>,
}

impl Serialize for Item {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("Item", 2)?;
        state.serialize_field("key", &self.key)?;
        match serde_json::from_slice::<serde_json::Value>(&self.value) {
            Ok(value) => state.serialize_field("value", &value)?,
            Err(_) => state.serialize_field("value", &serde_json::Value::Null)?,
        }
        state.end()
    }
}

#[async_trait]
pub trait Document: Send + Sync {
    fn key(&self) -> &str;
    async fn get(&self) -> Result<Option<Vec<u8>>>;
    async fn set(&self, data: Vec<u8>) -> Result<()>;
    async fn update(&self, data: Vec<u8>) -> Result<()>;
    async fn delete(&self) -> Result<()>;
}

#[async_trait]
pub trait Collection: Send + Sync {
    fn key(&self) -> &str;
    async fn add(&self, data: Vec<u8>) -> Result<Box<dyn Document>>;
    async fn items(&self, query: Query, order: Order, limit: Limit) -> Result<Vec<Item>>;
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Fails with `InvalidPath` if `path` is not a document path.
    async fn document(&self, path: &str) -> Result<Box<dyn Document>>;
    /// Fails with `InvalidPath` if `path` is not a collection path.
    async fn collection(&self, path: &str) -> Result<Box<dyn Collection>>;
    /// Idempotent shutdown of the underlying engine.
    async fn close(&self) -> Result<()>;
}
