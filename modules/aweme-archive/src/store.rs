use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{ArchiveError, Result};
use crate::record::PersistedEntity;

/// Id-keyed storage for one entity kind.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_by_id(&self, id: u64) -> Result<Option<PersistedEntity>>;

    /// Fails if the id already exists.
    async fn insert(&self, entity: &PersistedEntity) -> Result<()>;

    /// Full replace of an existing row. Fails if the id is unknown.
    async fn replace(&self, id: u64, entity: &PersistedEntity) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryEntityStore {
    rows: Mutex<HashMap<u64, PersistedEntity>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(entities: impl IntoIterator<Item = PersistedEntity>) -> Self {
        let rows = entities.into_iter().map(|e| (e.id, e)).collect();
        Self {
            rows: Mutex::new(rows),
        }
    }

    pub fn snapshot(&self) -> Vec<PersistedEntity> {
        let mut rows: Vec<_> = self
            .rows
            .lock()
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|e: &PersistedEntity| e.id);
        rows
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<u64, PersistedEntity>>> {
        self.rows
            .lock()
            .map_err(|_| ArchiveError::Other(anyhow::anyhow!("entity store lock poisoned")))
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn get_by_id(&self, id: u64) -> Result<Option<PersistedEntity>> {
        Ok(self.lock()?.get(&id).cloned())
    }

    async fn insert(&self, entity: &PersistedEntity) -> Result<()> {
        let mut rows = self.lock()?;
        if rows.contains_key(&entity.id) {
            return Err(ArchiveError::Other(anyhow::anyhow!(
                "entity {} already exists",
                entity.id
            )));
        }
        rows.insert(entity.id, entity.clone());
        Ok(())
    }

    async fn replace(&self, id: u64, entity: &PersistedEntity) -> Result<()> {
        let mut rows = self.lock()?;
        match rows.get_mut(&id) {
            Some(row) => {
                *row = entity.clone();
                Ok(())
            }
            None => Err(ArchiveError::Other(anyhow::anyhow!(
                "cannot replace missing entity {id}"
            ))),
        }
    }
}
