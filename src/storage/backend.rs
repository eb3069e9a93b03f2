use super::{QueueDefinition, StorageError};

pub trait StorageBackend: Send + Sync {
    fn flush(&self) -> Result<(), StorageError>;
    fn load_queues(&self) -> Result<Vec<QueueDefinition>, StorageError>;
    fn replace_queues(&self, queues: &[QueueDefinition]) -> Result<(), StorageError>;
    fn upsert_queue(&self, queue: &QueueDefinition) -> Result<(), StorageError>;
    fn remove_queue(&self, name: &str) -> Result<bool, StorageError>;
}
