use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde_json::json;

use crate::config::{AppConfig, RemoteRoute};
use crate::logging::{LogLevel, Logger};
use crate::pools::{PoolError, RemoteConnectionPool};
use crate::remote::{RemoteQueueProxy, RemoteSettings};
use crate::storage::{QueueDefinition, StorageError, StorageFacade};
use crate::store::backup::{self, backup_file_path};
use crate::store::{PriorityQueueStore, QueueStats};
use crate::wire::request::{validate_queue_name, RequestError};

#[derive(Debug)]
pub enum ManagerError {
    InvalidName(RequestError),
    Storage(StorageError),
    Pool(PoolError),
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName(source) => write!(f, "{source}"),
            Self::Storage(source) => write!(f, "queue catalog error: {source}"),
            Self::Pool(source) => write!(f, "remote pool error: {source}"),
        }
    }
}

impl std::error::Error for ManagerError {}

/// Where a queue name leads.
#[derive(Clone, Debug)]
pub enum QueueHandle {
    Local(Arc<PriorityQueueStore>),
    Remote(RemoteQueueProxy),
    NotFound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DefineOutcome {
    Created,
    AlreadyExists,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotEmpty { size: usize },
    NotFound,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueLocation {
    Local(QueueStats),
    Remote(RemoteRoute),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSummary {
    pub name: String,
    pub location: QueueLocation,
}

impl QueueSummary {
    pub fn kind(&self) -> &'static str {
        match self.location {
            QueueLocation::Local(_) => "local",
            QueueLocation::Remote(_) => "remote",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackupReport {
    pub backed_up: usize,
    pub failed: usize,
}

/// Owns the local queues of one broker and knows where remote ones live.
pub struct QueueManager {
    name: String,
    host: String,
    port: u16,
    queues: RwLock<HashMap<String, Arc<PriorityQueueStore>>>,
    routes: HashMap<String, RemoteRoute>,
    remote_pool: Arc<RemoteConnectionPool>,
    remote_settings: Arc<RemoteSettings>,
    storage: Arc<StorageFacade>,
    logger: Arc<Logger>,
}

impl QueueManager {
    pub fn new(
        app_config: &AppConfig,
        storage: Arc<StorageFacade>,
        logger: Arc<Logger>,
    ) -> Result<Self, ManagerError> {
        let remote_pool =
            RemoteConnectionPool::new(app_config.remote.pool_size).map_err(ManagerError::Pool)?;
        let mut routes = HashMap::new();
        for route in &app_config.remote.routes {
            validate_queue_name(&route.queue).map_err(ManagerError::InvalidName)?;
            routes.insert(route.queue.clone(), route.clone());
        }

        Ok(Self {
            name: app_config.manager.name.clone(),
            host: app_config.server.host.clone(),
            port: app_config.server.port,
            queues: RwLock::new(HashMap::new()),
            routes,
            remote_pool: Arc::new(remote_pool),
            remote_settings: Arc::new(RemoteSettings::from_app_config(app_config)),
            storage,
            logger,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Local queues win over remote routes with the same name.
    pub fn resolve(&self, name: &str) -> QueueHandle {
        if let Some(store) = self.read_queues().get(name) {
            return QueueHandle::Local(Arc::clone(store));
        }

        match self.routes.get(name) {
            Some(route) => QueueHandle::Remote(RemoteQueueProxy::new(
                name,
                route.clone(),
                Arc::clone(&self.remote_pool),
                Arc::clone(&self.remote_settings),
            )),
            None => QueueHandle::NotFound,
        }
    }

    pub fn define(&self, name: &str, threshold: usize) -> Result<DefineOutcome, ManagerError> {
        validate_queue_name(name).map_err(ManagerError::InvalidName)?;

        let mut queues = self.write_queues();
        if queues.contains_key(name) {
            return Ok(DefineOutcome::AlreadyExists);
        }

        self.storage
            .upsert_queue(&QueueDefinition::new(name, threshold))
            .map_err(ManagerError::Storage)?;
        queues.insert(
            name.to_owned(),
            Arc::new(PriorityQueueStore::new(name, threshold)),
        );
        drop(queues);

        self.logger.log(
            LogLevel::Info,
            Some("manager::define"),
            "Queue defined",
            Some(json!({ "queue": name, "threshold": threshold })),
        );
        Ok(DefineOutcome::Created)
    }

    pub fn delete(&self, name: &str, force: bool) -> Result<DeleteOutcome, ManagerError> {
        let mut queues = self.write_queues();
        let Some(store) = queues.get(name) else {
            return Ok(DeleteOutcome::NotFound);
        };

        let size = store.size();
        if size > 0 && !force {
            return Ok(DeleteOutcome::NotEmpty { size });
        }

        self.storage
            .remove_queue(name)
            .map_err(ManagerError::Storage)?;
        queues.remove(name);
        drop(queues);

        self.logger.log(
            LogLevel::Info,
            Some("manager::delete"),
            "Queue deleted",
            Some(json!({ "queue": name, "forced": force, "discarded_messages": size })),
        );
        Ok(DeleteOutcome::Deleted)
    }

    /// Exact match, or every name starting with `pattern` when `is_prefix` is set.
    pub fn query(&self, pattern: &str, is_prefix: bool) -> Vec<QueueSummary> {
        let matches = |name: &str| {
            if is_prefix {
                name.starts_with(pattern)
            } else {
                name == pattern
            }
        };

        let queues = self.read_queues();
        let mut summaries: Vec<QueueSummary> = queues
            .iter()
            .filter(|(name, _)| matches(name.as_str()))
            .map(|(name, store)| QueueSummary {
                name: name.clone(),
                location: QueueLocation::Local(store.stats()),
            })
            .collect();

        summaries.extend(
            self.routes
                .iter()
                .filter(|(name, _)| matches(name.as_str()) && !queues.contains_key(name.as_str()))
                .map(|(name, route)| QueueSummary {
                    name: name.clone(),
                    location: QueueLocation::Remote(route.clone()),
                }),
        );
        drop(queues);

        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    pub fn local_queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_queues().keys().cloned().collect();
        names.sort();
        names
    }

    /// One expiration pass over every local queue.
    pub fn expire_all(&self) -> usize {
        let stores: Vec<Arc<PriorityQueueStore>> = self.read_queues().values().cloned().collect();
        stores.iter().map(|store| store.expire()).sum()
    }

    /// Writes every local queue to `<dir>/<QUEUE>.bak` and refreshes the catalog.
    pub fn backup_all(&self, dir: &Path) -> BackupReport {
        let stores: Vec<Arc<PriorityQueueStore>> = self.read_queues().values().cloned().collect();
        let mut report = BackupReport::default();

        for store in &stores {
            let path = backup_file_path(dir, store.name());
            if backup::backup(store, &path, &self.logger) {
                report.backed_up += 1;
            } else {
                report.failed += 1;
            }
        }

        let definitions: Vec<QueueDefinition> = stores
            .iter()
            .map(|store| QueueDefinition::new(store.name(), store.threshold()))
            .collect();
        let persisted = self
            .storage
            .replace_queues(&definitions)
            .and_then(|_| self.storage.flush());
        if let Err(error) = persisted {
            self.logger.error(
                Some("manager::backup"),
                &format!("failed to persist queue catalog: {error}"),
            );
        }

        self.logger.log(
            LogLevel::Info,
            Some("manager::backup"),
            "Local queues backed up",
            Some(json!({
                "manager": self.name,
                "backed_up": report.backed_up,
                "failed": report.failed
            })),
        );
        report
    }

    /// Recreates every catalogued queue and replays its backup file, if any.
    pub fn restore_all(&self, dir: &Path) -> Result<usize, ManagerError> {
        let definitions = self.storage.load_queues().map_err(ManagerError::Storage)?;
        let mut restored_messages = 0;

        for definition in definitions {
            let store = Arc::new(PriorityQueueStore::new(
                definition.name.clone(),
                definition.threshold,
            ));
            let path = backup_file_path(dir, &definition.name);
            match backup::restore_into(&store, &path, &self.logger) {
                Ok(summary) => restored_messages += summary.restored,
                Err(error) => {
                    self.logger.error(Some("manager::restore"), &error.to_string());
                }
            }
            self.write_queues().insert(definition.name, store);
        }

        self.logger.log(
            LogLevel::Info,
            Some("manager::restore"),
            "Local queues restored",
            Some(json!({
                "manager": self.name,
                "queues": self.read_queues().len(),
                "messages": restored_messages
            })),
        );
        Ok(restored_messages)
    }

    fn read_queues(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<PriorityQueueStore>>> {
        self.queues.read().expect("queue registry lock poisoned")
    }

    fn write_queues(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<PriorityQueueStore>>> {
        self.queues.write().expect("queue registry lock poisoned")
    }
}

impl fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueManager")
            .field("name", &self.name)
            .field("local_queues", &self.local_queue_names())
            .field("routes", &self.routes.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use crate::config::{AppConfig, RemoteRoute};
    use crate::logging::Logger;
    use crate::message::MessageEnvelope;
    use crate::storage::StorageFacade;

    use super::{DefineOutcome, DeleteOutcome, QueueHandle, QueueLocation, QueueManager};

    pub(crate) fn temp_root(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "tidemq-manager-{label}-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ))
    }

    pub(crate) fn test_config(root: &std::path::Path) -> AppConfig {
        let mut app_config = AppConfig::default();
        app_config.storage.path = root.join("data").to_string_lossy().to_string();
        app_config.storage.backup_path = root.join("backup").to_string_lossy().to_string();
        app_config
    }

    fn manager_with(app_config: &AppConfig) -> (QueueManager, Arc<StorageFacade>) {
        let (logger, _) = Logger::in_memory();
        let storage = Arc::new(
            StorageFacade::initialize(app_config, &logger).expect("storage should initialize"),
        );
        let manager = QueueManager::new(app_config, Arc::clone(&storage), Arc::new(logger))
            .expect("manager should build");
        (manager, storage)
    }

    #[test]
    fn define_is_idempotent_and_validates_names() {
        let root = temp_root("define");
        let (manager, storage) = manager_with(&test_config(&root));

        assert_eq!(manager.define("ORDERS", 5).expect("define"), DefineOutcome::Created);
        assert_eq!(
            manager.define("ORDERS", 9).expect("define"),
            DefineOutcome::AlreadyExists
        );
        assert!(manager.define("bad name", 0).is_err());

        let catalog = storage.load_queues().expect("catalog load");
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog[0].threshold, 5);

        drop((manager, storage));
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn delete_respects_force_and_resolve_reports_not_found() {
        let root = temp_root("delete");
        let (manager, storage) = manager_with(&test_config(&root));
        manager.define("WORK", 0).expect("define");

        let QueueHandle::Local(store) = manager.resolve("WORK") else {
            panic!("WORK should resolve locally");
        };
        assert!(store.put(MessageEnvelope::text("pending"), "tester"));

        assert_eq!(
            manager.delete("WORK", false).expect("delete"),
            DeleteOutcome::NotEmpty { size: 1 }
        );
        assert_eq!(manager.delete("WORK", true).expect("delete"), DeleteOutcome::Deleted);
        assert!(matches!(manager.resolve("WORK"), QueueHandle::NotFound));
        assert_eq!(manager.delete("WORK", true).expect("delete"), DeleteOutcome::NotFound);
        assert!(storage.load_queues().expect("catalog load").is_empty());

        drop((manager, storage));
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn remote_routes_resolve_to_proxies_and_show_in_queries() {
        let root = temp_root("routes");
        let mut app_config = test_config(&root);
        app_config.remote.routes.push(RemoteRoute {
            queue: "PAY.OUT".to_owned(),
            manager: "QM_WEST".to_owned(),
            host: "10.1.1.1".to_owned(),
            port: 9999,
        });
        let (manager, storage) = manager_with(&app_config);
        manager.define("PAY.IN", 0).expect("define");

        let QueueHandle::Remote(proxy) = manager.resolve("PAY.OUT") else {
            panic!("PAY.OUT should resolve remotely");
        };
        assert_eq!(proxy.route().manager, "QM_WEST");

        let summaries = manager.query("PAY.", true);
        let names: Vec<_> = summaries.iter().map(|s| (s.name.as_str(), s.kind())).collect();
        assert_eq!(names, vec![("PAY.IN", "local"), ("PAY.OUT", "remote")]);
        assert!(matches!(summaries[1].location, QueueLocation::Remote(_)));

        assert_eq!(manager.query("PAY", false).len(), 0);
        assert_eq!(manager.query("PAY.IN", false).len(), 1);
        assert_eq!(manager.query("", true).len(), 2);

        drop((manager, storage));
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn backup_all_then_restore_all_round_trips_messages() {
        let root = temp_root("lifecycle");
        let app_config = test_config(&root);
        {
            let (manager, storage) = manager_with(&app_config);
            manager.define("A", 0).expect("define");
            manager.define("B", 1).expect("define");
            let QueueHandle::Local(a) = manager.resolve("A") else {
                panic!("A should be local");
            };
            a.put(MessageEnvelope::text("one"), "u");
            a.put(MessageEnvelope::text("two"), "u");

            let report = manager.backup_all(storage.backup_path());
            assert_eq!(report.backed_up, 2);
            assert_eq!(report.failed, 0);
            assert!(storage.backup_path().join("A.bak").exists());
        }

        let (manager, storage) = manager_with(&app_config);
        let restored = manager
            .restore_all(storage.backup_path())
            .expect("restore should pass");
        assert_eq!(restored, 2);
        assert_eq!(manager.local_queue_names(), vec!["A", "B"]);
        assert!(!storage.backup_path().join("A.bak").exists());

        let QueueHandle::Local(b) = manager.resolve("B") else {
            panic!("B should be local");
        };
        assert_eq!(b.threshold(), 1);

        drop((manager, storage));
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn expire_all_sums_over_queues() {
        let root = temp_root("expire");
        let (manager, storage) = manager_with(&test_config(&root));
        manager.define("X", 0).expect("define");
        manager.define("Y", 0).expect("define");

        for name in ["X", "Y"] {
            let QueueHandle::Local(store) = manager.resolve(name) else {
                panic!("{name} should be local");
            };
            let mut message = MessageEnvelope::text("stale");
            message.set_expires_after(0).expect("valid expiration");
            let mut stale = MessageEnvelope::text("stale-2");
            stale.set_expires_after(0).expect("valid expiration");
            store.put(message, "u");
            store.put(stale, "u");
        }

        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(manager.expire_all(), 4);
        assert_eq!(manager.expire_all(), 0);

        drop((manager, storage));
        let _ = std::fs::remove_dir_all(root);
    }
}
