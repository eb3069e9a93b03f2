use std::path::Path;

use super::{QueueDefinition, SledMode, StorageBackend, StorageError};

pub struct SledStorage {
    db: sled::Db,
}

const QUEUE_PREFIX: &[u8] = b"v1:queue:";

impl SledStorage {
    pub fn open(
        data_path: &Path,
        cache_capacity: Option<u64>,
        mode: Option<SledMode>,
    ) -> Result<Self, StorageError> {
        let mut config = sled::Config::new().path(data_path);

        if let Some(cache_capacity) = cache_capacity {
            config = config.cache_capacity(cache_capacity);
        }

        if let Some(mode) = mode {
            config = config.mode(mode.into_sled());
        }

        let db = config.open().map_err(StorageError::Sled)?;
        Ok(Self { db })
    }
}

fn queue_key(queue_name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(QUEUE_PREFIX.len() + queue_name.len());
    key.extend_from_slice(QUEUE_PREFIX);
    key.extend_from_slice(queue_name.as_bytes());
    key
}

impl StorageBackend for SledStorage {
    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map(|_| ()).map_err(StorageError::Sled)
    }

    fn load_queues(&self) -> Result<Vec<QueueDefinition>, StorageError> {
        let mut queues = Vec::new();
        for entry in self.db.scan_prefix(QUEUE_PREFIX) {
            let (_, value) = entry.map_err(StorageError::Sled)?;
            let queue: QueueDefinition =
                serde_json::from_slice(value.as_ref()).map_err(StorageError::DeserializeQueue)?;
            queues.push(queue);
        }
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(queues)
    }

    fn replace_queues(&self, queues: &[QueueDefinition]) -> Result<(), StorageError> {
        let mut batch = sled::Batch::default();
        for entry in self.db.scan_prefix(QUEUE_PREFIX) {
            let (key, _) = entry.map_err(StorageError::Sled)?;
            batch.remove(key);
        }

        for queue in queues {
            let value = serde_json::to_vec(queue).map_err(StorageError::SerializeQueue)?;
            batch.insert(queue_key(&queue.name), value);
        }

        self.db.apply_batch(batch).map_err(StorageError::Sled)?;
        self.flush()
    }

    fn upsert_queue(&self, queue: &QueueDefinition) -> Result<(), StorageError> {
        let value = serde_json::to_vec(queue).map_err(StorageError::SerializeQueue)?;
        self.db
            .insert(queue_key(&queue.name), value)
            .map_err(StorageError::Sled)?;
        self.flush()
    }

    fn remove_queue(&self, name: &str) -> Result<bool, StorageError> {
        let removed = self
            .db
            .remove(queue_key(name))
            .map_err(StorageError::Sled)?
            .is_some();
        self.flush()?;
        Ok(removed)
    }
}
