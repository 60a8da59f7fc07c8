use crate::backend::{HashBackend, PAYLOAD_FIELD};
use crate::error::Result;
use crate::id::{EntityId, Keyspace};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

/// Entity taken out of the repository for modification.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessEntity<T> {
    entity: T,
}

impl<T> ProcessEntity<T> {
    pub fn new(entity: T) -> Self {
        Self { entity }
    }

    pub fn entity(&self) -> &T {
        &self.entity
    }

    pub fn entity_mut(&mut self) -> &mut T {
        &mut self.entity
    }

    pub fn into_entity(self) -> T {
        self.entity
    }
}

/// Stores each entity as JSON in the `json` field of the hash `<prefix><id>`.
pub struct EntityStore<T, I> {
    backend: Arc<dyn HashBackend>,
    keyspace: Keyspace,
    _marker: PhantomData<fn() -> (T, I)>,
}

impl<T, I> EntityStore<T, I>
where
    T: Serialize + DeserializeOwned + Send + Sync,
    I: EntityId,
{
    pub fn new(backend: Arc<dyn HashBackend>, keyspace: Keyspace) -> Self {
        Self {
            backend,
            keyspace,
            _marker: PhantomData,
        }
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    /// `Ok(None)` when the payload field is missing or empty
    pub async fn load(&self, id: &I) -> Result<Option<T>> {
        let key = self.keyspace.key(id);
        let payload = self.backend.get_field(&key, PAYLOAD_FIELD).await?;

        match payload {
            Some(json) if !json.is_empty() => {
                let entity = serde_json::from_str(&json)?;
                Ok(Some(entity))
            }
            _ => Ok(None),
        }
    }

    pub async fn save(&self, id: &I, entity: &T) -> Result<()> {
        let json = serde_json::to_string(entity)?;
        self.write(id, &json).await
    }

    /// Writes inserts, then updates, one key at a time.
    /// Stops at the first failure; earlier writes stay committed.
    pub async fn save_all(
        &self,
        inserts: &HashMap<I, T>,
        updates: &HashMap<I, ProcessEntity<T>>,
    ) -> Result<()> {
        for (id, entity) in inserts {
            let json = serde_json::to_string(entity)?;
            self.write(id, &json).await?;
        }

        for (id, process_entity) in updates {
            let json = serde_json::to_string(process_entity.entity())?;
            self.write(id, &json).await?;
        }

        tracing::debug!(
            "Saved {} new and {} updated entities under {}",
            inserts.len(),
            updates.len(),
            self.keyspace.prefix()
        );
        Ok(())
    }

    /// Clears the payload field of each id; missing ids are ignored.
    pub async fn remove_all(&self, ids: &[I]) -> Result<()> {
        for id in ids {
            let key = self.keyspace.key(id);
            self.backend.delete_field(&key, PAYLOAD_FIELD).await?;
        }
        Ok(())
    }

    async fn write(&self, id: &I, json: &str) -> Result<()> {
        let key = self.keyspace.key(id);
        self.backend.set_field(&key, PAYLOAD_FIELD, json).await
    }
}
