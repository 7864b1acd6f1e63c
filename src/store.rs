//! Key-value table abstraction the counter runs against.
//!
//! The engine only needs three single-row primitives: a point read, a create
//! that fails when the row exists, and an update that can be made conditional
//! on the etag returned by a previous read.
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub partition_key: String,
    pub row_key: String,
    pub properties: Map<String, Value>,
    /// Opaque version token. `None` makes an update unconditional.
    pub etag: Option<String>,
}

impl Entity {
    pub fn new(partition_key: &str, row_key: &str) -> Self {
        Self {
            partition_key: partition_key.to_string(),
            row_key: row_key.to_string(),
            properties: Map::new(),
            etag: None,
        }
    }

    pub fn with_property(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.properties.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(Entity),
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    NotFound,
    /// The stored etag no longer matches the one supplied.
    Conflict,
}

#[async_trait]
pub trait TableStore: Send + Sync {
    async fn get(&self, partition_key: &str, row_key: &str) -> Result<Lookup>;
    async fn create(&self, entity: &Entity) -> Result<CreateOutcome>;
    async fn update(&self, entity: &Entity) -> Result<UpdateOutcome>;
}

/// Process-local table. Every operation takes the lock once, so each call is
/// atomic with respect to the others just like a single-row call against the
/// real service.
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    rows: Mutex<HashMap<(String, String), (Map<String, Value>, u64)>>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn etag_for(version: u64) -> String {
    format!("W/\"{}\"", version)
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn get(&self, partition_key: &str, row_key: &str) -> Result<Lookup> {
        let rows = self.rows.lock().await;
        let key = (partition_key.to_string(), row_key.to_string());
        Ok(match rows.get(&key) {
            Some((properties, version)) => Lookup::Found(Entity {
                partition_key: key.0,
                row_key: key.1,
                properties: properties.clone(),
                etag: Some(etag_for(*version)),
            }),
            None => Lookup::NotFound,
        })
    }

    async fn create(&self, entity: &Entity) -> Result<CreateOutcome> {
        let mut rows = self.rows.lock().await;
        let key = (entity.partition_key.clone(), entity.row_key.clone());
        if rows.contains_key(&key) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        rows.insert(key, (entity.properties.clone(), 1));
        Ok(CreateOutcome::Created)
    }

    async fn update(&self, entity: &Entity) -> Result<UpdateOutcome> {
        let mut rows = self.rows.lock().await;
        let key = (entity.partition_key.clone(), entity.row_key.clone());
        let Some((properties, version)) = rows.get_mut(&key) else {
            return Ok(UpdateOutcome::NotFound);
        };
        if let Some(expected) = entity.etag.as_deref() {
            if expected != "*" && expected != etag_for(*version) {
                return Ok(UpdateOutcome::Conflict);
            }
        }
        *properties = entity.properties.clone();
        *version += 1;
        Ok(UpdateOutcome::Updated)
    }
}
