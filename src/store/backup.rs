use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::json;

use crate::logging::{LogLevel, Logger};
use crate::wire::codec::{read_envelope, write_envelope, CodecError};

use super::{PriorityQueueStore, SYSTEM_USER};

pub const BACKUP_FILE_EXTENSION: &str = "bak";

#[derive(Debug)]
pub enum BackupError {
    Open { path: PathBuf, source: io::Error },
    Remove { path: PathBuf, source: io::Error },
}

impl fmt::Display for BackupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { path, source } => {
                write!(f, "failed to open backup '{}': {source}", path.display())
            }
            Self::Remove { path, source } => {
                write!(f, "failed to remove backup '{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for BackupError {}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub restored: usize,
    pub dropped: usize,
    pub truncated: bool,
}

pub fn backup_file_path(backup_dir: &Path, queue_name: &str) -> PathBuf {
    backup_dir.join(format!("{queue_name}.{BACKUP_FILE_EXTENSION}"))
}

/// Drains `store` into `path` as a sequence of encoded envelopes.
///
/// On failure the drained messages are put back so nothing is lost in memory, and false
/// is returned after logging the cause.
pub fn backup(store: &PriorityQueueStore, path: &Path, logger: &Logger) -> bool {
    let messages = store.drain();
    let count = messages.len();

    let result = File::create(path)
        .map_err(CodecError::Io)
        .and_then(|file| {
            let mut writer = BufWriter::new(file);
            for message in &messages {
                write_envelope(&mut writer, message)?;
            }
            writer.flush().map_err(CodecError::Io)?;
            writer
                .get_ref()
                .sync_all()
                .map_err(CodecError::Io)
        });

    match result {
        Ok(()) => {
            logger.log(
                LogLevel::Info,
                Some("store::backup"),
                "Queue backed up",
                Some(json!({
                    "queue": store.name(),
                    "messages": count,
                    "path": path.display().to_string()
                })),
            );
            true
        }
        Err(error) => {
            logger.log(
                LogLevel::Error,
                Some("store::backup"),
                &format!("failed to back up queue '{}': {error}", store.name()),
                Some(json!({
                    "queue": store.name(),
                    "path": path.display().to_string()
                })),
            );
            for message in messages {
                store.put(message, SYSTEM_USER);
            }
            false
        }
    }
}

/// Builds a fresh store named `name` from the backup at `path`.
pub fn restore(
    path: &Path,
    name: &str,
    threshold: usize,
    logger: &Logger,
) -> Result<PriorityQueueStore, BackupError> {
    let store = PriorityQueueStore::new(name, threshold);
    restore_into(&store, path, logger)?;
    Ok(store)
}

/// Replays the backup at `path` into `store`, then deletes the file.
///
/// A missing file restores nothing. A truncated or undecodable record ends the replay as
/// if the file ended there. Messages over the store threshold are dropped and counted.
pub fn restore_into(
    store: &PriorityQueueStore,
    path: &Path,
    logger: &Logger,
) -> Result<RestoreSummary, BackupError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            logger.debug(
                Some("store::backup"),
                &format!("no backup found for queue '{}'", store.name()),
            );
            return Ok(RestoreSummary::default());
        }
        Err(source) => {
            return Err(BackupError::Open {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let mut reader = BufReader::new(file);
    let mut summary = RestoreSummary::default();
    loop {
        match read_envelope(&mut reader) {
            Ok(Some(message)) => {
                if store.put(message, SYSTEM_USER) {
                    summary.restored += 1;
                } else {
                    summary.dropped += 1;
                }
            }
            Ok(None) => break,
            Err(error) => {
                summary.truncated = true;
                logger.warn(
                    Some("store::backup"),
                    &format!(
                        "backup for queue '{}' ends with an unreadable record, stopping: {error}",
                        store.name()
                    ),
                );
                break;
            }
        }
    }
    drop(reader);

    if summary.dropped > 0 {
        logger.warn(
            Some("store::backup"),
            &format!(
                "{} restored messages dropped by threshold of queue '{}'",
                summary.dropped,
                store.name()
            ),
        );
    }

    fs::remove_file(path).map_err(|source| BackupError::Remove {
        path: path.to_path_buf(),
        source,
    })?;

    logger.log(
        LogLevel::Info,
        Some("store::backup"),
        "Queue restored from backup",
        Some(json!({
            "queue": store.name(),
            "restored": summary.restored,
            "dropped": summary.dropped,
            "truncated": summary.truncated
        })),
    );

    Ok(summary)
}
