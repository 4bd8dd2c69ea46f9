//! Wraps a [`Store`] so that every successful mutation publishes change
//! events through the topic registry, on both the document's own path and
//! its parent collection path.

use std::sync::Arc;

use async_trait::async_trait;
use rtstore_registry::Registry;
use rtstore_types::prelude::*;
use rtstore_types::{path, query::Limit, query::Order, query::Query};

/// A [`Store`] wrapper that couples writes to registry publications.
pub struct NotifyingStore {
    store: Arc<dyn Store>,
    registry: Registry,
}

impl NotifyingStore {
    pub fn new(store: Arc<dyn Store>, registry: Registry) -> Self {
        Self { store, registry }
    }
}

#[async_trait]
impl Store for NotifyingStore {
    async fn document(&self, path: &str) -> Result<Box<dyn Document>> {
        let inner = self.store.document(path).await?;
        Ok(Box::new(NotifyingDocument { inner, registry: self.registry.clone() }))
    }

    async fn collection(&self, path: &str) -> Result<Box<dyn Collection>> {
        let inner = self.store.collection(path).await?;
        Ok(Box::new(NotifyingCollection { inner, registry: self.registry.clone() }))
    }

    async fn close(&self) -> Result<()> {
        self.store.close().await
    }
}

struct NotifyingDocument {
    inner: Box<dyn Document>,
    registry: Registry,
}

#[async_trait]
impl Document for NotifyingDocument {
    fn key(&self) -> &str {
        self.inner.key()
    }

    async fn get(&self) -> Result<Option<Vec<u8>>> {
        self.inner.get().await
    }

    async fn set(&self, data: Vec<u8>) -> Result<()> {
        self.inner.set(data.clone()).await?;
        self.publish_write(data).await;
        Ok(())
    }

    async fn update(&self, data: Vec<u8>) -> Result<()> {
        self.inner.update(data.clone()).await?;
        self.publish_write(data).await;
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.inner.delete().await?;
        self.publish_write(Vec::new()).await;
        Ok(())
    }
}

impl NotifyingDocument {
    /// Publish `data` on the document's own path and on its parent
    /// collection path, in that order. Only called after the write already
    /// succeeded; never called on a failed write.
    async fn publish_write(&self, data: Vec<u8>) {
        let key = self.inner.key().to_string();
        match path::parent_collection(&key) {
            Ok(parent) => {
                self.registry.publish(parent, data.clone()).await;
                self.registry.publish(key, data).await;
            }
            Err(err) => {
                tracing::warn!(%key, %err, "could not derive parent collection for publication");
            }
        }
    }
}

struct NotifyingCollection {
    inner: Box<dyn Collection>,
    registry: Registry,
}

#[async_trait]
impl Collection for NotifyingCollection {
    fn key(&self) -> &str {
        self.inner.key()
    }

    async fn add(&self, data: Vec<u8>) -> Result<Box<dyn Document>> {
        let doc = self.inner.add(data.clone()).await?;
        self.registry.publish(self.inner.key().to_string(), data.clone()).await;
        self.registry.publish(doc.key().to_string(), data).await;
        Ok(doc)
    }

    async fn items(&self, query: Query, order: Order, limit: Limit) -> Result<Vec<Item>> {
        self.inner.items(query, order, limit).await
    }
}
