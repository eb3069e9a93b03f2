use std::fs;
use std::path::{Path, PathBuf};

use serde_json::json;

use crate::config::AppConfig;
use crate::logging::{LogLevel, Logger};

use super::{
    expand_home_path, QueueDefinition, SledMode, SledStorage, StorageBackend, StorageEngine,
    StorageError,
};

/// Owns the queue catalog and the resolved data and backup directories.
pub struct StorageFacade {
    engine: StorageEngine,
    data_path: PathBuf,
    backup_path: PathBuf,
    backend: Box<dyn StorageBackend>,
}

impl StorageFacade {
    pub fn initialize(app_config: &AppConfig, logger: &Logger) -> Result<Self, StorageError> {
        let Some(engine) = StorageEngine::parse(&app_config.storage.engine) else {
            return Err(StorageError::UnsupportedEngine {
                engine: app_config.storage.engine.clone(),
            });
        };
        let mode = match app_config.storage.sled.mode.as_deref() {
            Some(raw) => {
                let Some(mode) = SledMode::parse(raw) else {
                    return Err(StorageError::InvalidSledMode {
                        mode: raw.to_owned(),
                    });
                };
                Some(mode)
            }
            None => None,
        };
        let data_path = expand_home_path(&app_config.storage.path)?;
        let backup_path = expand_home_path(&app_config.storage.backup_path)?;

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Initializing storage facade",
            Some(json!({
                "engine": engine.as_str(),
                "configured_path": app_config.storage.path,
                "resolved_path": data_path.display().to_string(),
                "backup_path": backup_path.display().to_string(),
                "sled": {
                    "cache_capacity": app_config.storage.sled.cache_capacity,
                    "mode": app_config.storage.sled.mode
                }
            })),
        );

        create_directory("storage data", &data_path)?;
        create_directory("queue backup", &backup_path)?;

        let backend: Box<dyn StorageBackend> = match engine {
            StorageEngine::Sled => Box::new(SledStorage::open(
                &data_path,
                app_config.storage.sled.cache_capacity,
                mode,
            )?),
        };

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Storage facade initialized",
            Some(json!({
                "engine": engine.as_str(),
                "resolved_path": data_path.display().to_string(),
            })),
        );

        Ok(Self {
            engine,
            data_path,
            backup_path,
            backend,
        })
    }

    pub fn engine(&self) -> StorageEngine {
        self.engine
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.backend.flush()
    }

    pub fn load_queues(&self) -> Result<Vec<QueueDefinition>, StorageError> {
        self.backend.load_queues()
    }

    pub fn replace_queues(&self, queues: &[QueueDefinition]) -> Result<(), StorageError> {
        self.backend.replace_queues(queues)
    }

    pub fn upsert_queue(&self, queue: &QueueDefinition) -> Result<(), StorageError> {
        self.backend.upsert_queue(queue)
    }

    pub fn remove_queue(&self, name: &str) -> Result<bool, StorageError> {
        self.backend.remove_queue(name)
    }
}

fn create_directory(purpose: &'static str, path: &Path) -> Result<(), StorageError> {
    fs::create_dir_all(path).map_err(|source| StorageError::CreateDirectory {
        purpose,
        path: path.to_path_buf(),
        source,
    })
}
