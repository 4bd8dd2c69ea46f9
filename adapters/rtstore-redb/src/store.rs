//! Implements the `Store` interface over `redb`, an embedded transactional
//! key-value engine. Documents live in one table, one entry per full path.
//! A second table holds a monotonic sequence counter per collection, used by
//! `add` to mint new child keys. A third table is reserved for engine
//! metadata (currently unused beyond initialization).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use rtstore_types::prelude::*;
use rtstore_types::{path, query::Limit, query::Order, query::Query};
use tracing::debug;

const TABLE_DOCUMENTS: TableDefinition<&str, &str> = TableDefinition::new("documents");
const TABLE_SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");
const TABLE_METADATA: TableDefinition<&str, &str> = TableDefinition::new("metadata");

fn engine_err<E: std::fmt::Display>(err: E) -> Error {
    Error::EngineError(err.to_string())
}

async fn run_blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(inner) => inner,
        Err(err) => Err(engine_err(err)),
    }
}

/// A `Store` bound to one `redb` database file on disk.
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (creating if absent) a database file at `path`, initializing its tables.
    pub async fn open(path: impl AsRef<Path> + Send + 'static) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let db = run_blocking(move || {
            let db = Database::create(&path).map_err(engine_err)?;
            let tx = db.begin_write().map_err(engine_err)?;
            {
                let _ = tx.open_table(TABLE_DOCUMENTS).map_err(engine_err)?;
                let _ = tx.open_table(TABLE_SEQUENCES).map_err(engine_err)?;
                let _ = tx.open_table(TABLE_METADATA).map_err(engine_err)?;
            }
            tx.commit().map_err(engine_err)?;
            Ok(db)
        })
        .await?;
        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait]
impl Store for RedbStore {
    async fn document(&self, path: &str) -> Result<Box<dyn Document>> {
        if !path::is_document(path)? {
            return Err(Error::InvalidPath(format!("not a document path: {path}")));
        }
        Ok(Box::new(RedbDocument { db: self.db.clone(), key: path.to_string() }))
    }

    async fn collection(&self, path: &str) -> Result<Box<dyn Collection>> {
        if !path::is_collection(path)? {
            return Err(Error::InvalidPath(format!("not a collection path: {path}")));
        }
        Ok(Box::new(RedbCollection { db: self.db.clone(), key: path.to_string() }))
    }

    async fn close(&self) -> Result<()> {
        // redb has no explicit close call; the database closes when its last
        // `Arc` clone is dropped. This is deliberately a no-op kept idempotent
        // by contract so callers can still sequence shutdown the way the
        // interface describes (see shutdown ordering in DESIGN.md).
        debug!("RedbStore::close called; database closes on final drop");
        Ok(())
    }
}

struct RedbDocument {
    db: Arc<Database>,
    key: String,
}

fn bytes_to_utf8(data: Vec<u8>) -> Result<String> {
    String::from_utf8(data).map_err(|err| Error::DecodeError(err.to_string()))
}

#[async_trait]
impl Document for RedbDocument {
    fn key(&self) -> &str {
        &self.key
    }

    async fn get(&self) -> Result<Option<Vec<u8>>> {
        let db = self.db.clone();
        let key = self.key.clone();
        run_blocking(move || {
            let tx = db.begin_read().map_err(engine_err)?;
            let table = tx.open_table(TABLE_DOCUMENTS).map_err(engine_err)?;
            match table.get(key.as_str()).map_err(engine_err)? {
                Some(guard) => Ok(Some(guard.value().as_bytes().to_vec())),
                None => Ok(None),
            }
        })
        .await
    }

    async fn set(&self, data: Vec<u8>) -> Result<()> {
        let value = bytes_to_utf8(data)?;
        let db = self.db.clone();
        let key = self.key.clone();
        run_blocking(move || {
            let tx = db.begin_write().map_err(engine_err)?;
            {
                let mut table = tx.open_table(TABLE_DOCUMENTS).map_err(engine_err)?;
                table.insert(key.as_str(), value.as_str()).map_err(engine_err)?;
            }
            tx.commit().map_err(engine_err)
        })
        .await
    }

    async fn update(&self, data: Vec<u8>) -> Result<()> {
        // Identical to `set`: the core has no field-level merge semantics.
        self.set(data).await
    }

    async fn delete(&self) -> Result<()> {
        let db = self.db.clone();
        let key = self.key.clone();
        run_blocking(move || {
            let tx = db.begin_write().map_err(engine_err)?;
            {
                let mut table = tx.open_table(TABLE_DOCUMENTS).map_err(engine_err)?;
                table.remove(key.as_str()).map_err(engine_err)?;
            }
            tx.commit().map_err(engine_err)
        })
        .await
    }
}

struct RedbCollection {
    db: Arc<Database>,
    key: String,
}

#[async_trait]
impl Collection for RedbCollection {
    fn key(&self) -> &str {
        &self.key
    }

    async fn add(&self, data: Vec<u8>) -> Result<Box<dyn Document>> {
        let value = bytes_to_utf8(data)?;
        let db = self.db.clone();
        let collection_key = self.key.clone();
        let child_key = run_blocking({
            let collection_key = collection_key.clone();
            move || {
                let tx = db.begin_write().map_err(engine_err)?;
                let next = {
                    let mut sequences = tx.open_table(TABLE_SEQUENCES).map_err(engine_err)?;
                    let current = sequences.get(collection_key.as_str()).map_err(engine_err)?.map(|g| g.value()).unwrap_or(0);
                    let next = current + 1;
                    sequences.insert(collection_key.as_str(), next).map_err(engine_err)?;
                    next
                };
                let child_key = path::child_document(&collection_key, next);
                {
                    let mut documents = tx.open_table(TABLE_DOCUMENTS).map_err(engine_err)?;
                    documents.insert(child_key.as_str(), value.as_str()).map_err(engine_err)?;
                }
                tx.commit().map_err(engine_err)?;
                Ok(child_key)
            }
        })
        .await?;
        Ok(Box::new(RedbDocument { db: self.db.clone(), key: child_key }))
    }

    async fn items(&self, query: Query, order: Order, limit: Limit) -> Result<Vec<Item>> {
        let db = self.db.clone();
        let collection_key = self.key.clone();
        run_blocking(move || {
            let tx = db.begin_read().map_err(engine_err)?;
            let table = tx.open_table(TABLE_DOCUMENTS).map_err(engine_err)?;
            let prefix = format!("{collection_key}/");

            let short_circuit = query.is_empty() && order.is_empty() && !limit.is_empty() && limit.limit > 0;
            let target_count = limit.offset + limit.limit;

            let mut items = Vec::new();
            let range = table.range(prefix.as_str()..).map_err(engine_err)?;
            for entry in range {
                let (key_guard, value_guard) = entry.map_err(engine_err)?;
                let key_str = key_guard.value();
                if !key_str.starts_with(prefix.as_str()) {
                    break;
                }
                let remainder = &key_str[prefix.len()..];
                if remainder.contains('/') {
                    continue;
                }
                items.push(Item { key: key_str.to_string(), value: value_guard.value().as_bytes().to_vec() });
                if short_circuit && items.len() >= target_count {
                    break;
                }
            }
            Ok(rtstore_types::query::apply(items, &query, &order, &limit))
        })
        .await
    }
}
