use std::sync::Arc;

use crate::config::AppConfig;
use crate::logging::Logger;
use crate::manager::QueueManager;
use crate::pools::SessionPool;
use crate::shutdown::ShutdownSignal;
use crate::wire::codec::WireCodec;

/// Everything a connection worker needs, handed over explicitly at spawn time.
#[derive(Clone)]
pub struct BrokerContext {
    pub config: Arc<AppConfig>,
    pub logger: Arc<Logger>,
    pub manager: Arc<QueueManager>,
    pub sessions: Arc<SessionPool>,
    pub shutdown: ShutdownSignal,
    pub codec: WireCodec,
}

impl BrokerContext {
    pub fn new(
        config: Arc<AppConfig>,
        logger: Arc<Logger>,
        manager: Arc<QueueManager>,
        shutdown: ShutdownSignal,
        codec: WireCodec,
    ) -> Self {
        Self {
            config,
            logger,
            manager,
            sessions: Arc::new(SessionPool::new()),
            shutdown,
            codec,
        }
    }

    /// Effective server-side wait for a get request.
    pub fn effective_get_timeout(&self, requested_ms: i64) -> i64 {
        let cap = i64::try_from(self.config.broker.max_get_wait_ms).unwrap_or(i64::MAX);
        match requested_ms {
            0 if self.config.broker.allow_unbounded_get => 0,
            0 => cap,
            requested if cap > 0 && !self.config.broker.allow_unbounded_get => requested.min(cap),
            requested => requested,
        }
    }

    pub fn effective_poll_interval(&self, requested_ms: Option<i64>) -> i64 {
        requested_ms.unwrap_or_else(|| {
            i64::try_from(self.config.broker.default_poll_interval_ms)
                .unwrap_or(i64::MAX)
                .max(1)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::logging::Logger;
    use crate::manager::tests::{temp_root, test_config};
    use crate::manager::QueueManager;
    use crate::shutdown::ShutdownSignal;
    use crate::storage::StorageFacade;
    use crate::wire::codec::WireCodec;

    use super::BrokerContext;

    fn context_with(allow_unbounded_get: bool) -> (BrokerContext, std::path::PathBuf) {
        let root = temp_root("context");
        let mut app_config = test_config(&root);
        app_config.broker.max_get_wait_ms = 500;
        app_config.broker.default_poll_interval_ms = 25;
        app_config.broker.allow_unbounded_get = allow_unbounded_get;

        let (logger, _) = Logger::in_memory();
        let logger = Arc::new(logger);
        let storage = Arc::new(
            StorageFacade::initialize(&app_config, &logger).expect("storage should initialize"),
        );
        let manager = Arc::new(
            QueueManager::new(&app_config, storage, Arc::clone(&logger)).expect("manager"),
        );
        let codec = WireCodec::from_app_config(&app_config).expect("codec");
        let context = BrokerContext::new(
            Arc::new(app_config),
            logger,
            manager,
            ShutdownSignal::new(),
            codec,
        );
        (context, root)
    }

    #[test]
    fn get_waits_are_capped_unless_unbounded_is_allowed() {
        let (capped, root) = context_with(false);
        assert_eq!(capped.effective_get_timeout(0), 500);
        assert_eq!(capped.effective_get_timeout(100), 100);
        assert_eq!(capped.effective_get_timeout(10_000), 500);
        assert_eq!(capped.effective_poll_interval(None), 25);
        assert_eq!(capped.effective_poll_interval(Some(7)), 7);
        drop(capped);
        let _ = std::fs::remove_dir_all(root);

        let (unbounded, root) = context_with(true);
        assert_eq!(unbounded.effective_get_timeout(0), 0);
        assert_eq!(unbounded.effective_get_timeout(10_000), 10_000);
        drop(unbounded);
        let _ = std::fs::remove_dir_all(root);
    }
}
