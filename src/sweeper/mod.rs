use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::config::AppConfig;
use crate::logging::{LogLevel, Logger};
use crate::manager::QueueManager;

pub const MIN_INTERVAL_MS: u64 = 10;

#[derive(Debug)]
pub enum SweeperError {
    InvalidInterval { provided_ms: u64 },
    AlreadyRunning,
    Spawn(std::io::Error),
    JoinFailed,
}

impl fmt::Display for SweeperError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInterval { provided_ms } => write!(
                f,
                "sweep interval must be at least {MIN_INTERVAL_MS}ms, got {provided_ms}ms"
            ),
            Self::AlreadyRunning => write!(f, "expiration sweeper is already running"),
            Self::Spawn(source) => write!(f, "failed to spawn sweeper thread: {source}"),
            Self::JoinFailed => write!(f, "expiration sweeper thread join failed"),
        }
    }
}

impl std::error::Error for SweeperError {}

/// Fixed-rate background pass dropping expired messages from every local queue.
pub struct ExpirationSweeper {
    pub initiated_at: DateTime<Utc>,
    interval_ms: u64,
    manager: Arc<QueueManager>,
    logger: Arc<Logger>,
    stop_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl ExpirationSweeper {
    pub fn new(
        manager: Arc<QueueManager>,
        logger: Arc<Logger>,
        interval_ms: u64,
    ) -> Result<Self, SweeperError> {
        if interval_ms < MIN_INTERVAL_MS {
            return Err(SweeperError::InvalidInterval {
                provided_ms: interval_ms,
            });
        }

        Ok(Self {
            initiated_at: Utc::now(),
            interval_ms,
            manager,
            logger,
            stop_tx: None,
            worker: None,
        })
    }

    pub fn from_app_config(
        manager: Arc<QueueManager>,
        logger: Arc<Logger>,
        app_config: &AppConfig,
    ) -> Result<Self, SweeperError> {
        Self::new(manager, logger, app_config.broker.sweep_interval_ms)
    }

    pub fn start(&mut self) -> Result<(), SweeperError> {
        if self.worker.is_some() {
            return Err(SweeperError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let manager = Arc::clone(&self.manager);
        let logger = Arc::clone(&self.logger);
        let interval = Duration::from_millis(self.interval_ms);

        let worker = thread::Builder::new()
            .name("tidemq-sweeper".to_owned())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let expired = manager.expire_all();
                        if expired > 0 {
                            logger.log(
                                LogLevel::Debug,
                                Some("sweeper"),
                                "Expired messages removed",
                                Some(json!({ "expired": expired })),
                            );
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(SweeperError::Spawn)?;

        self.stop_tx = Some(stop_tx);
        self.worker = Some(worker);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<(), SweeperError> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(handle) = self.worker.take() {
            return handle.join().map_err(|_| SweeperError::JoinFailed);
        }

        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn initial_metadata_payload(&self) -> Value {
        json!({
            "initiated_at": self.initiated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "interval_ms": self.interval_ms
        })
    }
}

impl Drop for ExpirationSweeper {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
