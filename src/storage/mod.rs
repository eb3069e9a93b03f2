mod backend;
mod engine;
mod error;
mod facade;
mod path;
mod sled_backend;

use serde::{Deserialize, Serialize};

pub use backend::StorageBackend;
pub use engine::{SledMode, StorageEngine};
pub use error::StorageError;
pub use facade::StorageFacade;
pub(crate) use path::expand_home_path;
pub use sled_backend::SledStorage;

/// Catalog entry for a locally defined queue. Messages live in backup files, not here.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueDefinition {
    pub name: String,
    pub threshold: usize,
}

impl QueueDefinition {
    pub fn new(name: impl Into<String>, threshold: usize) -> Self {
        Self {
            name: name.into(),
            threshold,
        }
    }
}
