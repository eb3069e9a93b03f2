use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum StorageError {
    UnsupportedEngine {
        engine: String,
    },
    InvalidSledMode {
        mode: String,
    },
    HomeDirectoryUnavailable,
    CreateDirectory {
        purpose: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    SerializeQueue(serde_json::Error),
    DeserializeQueue(serde_json::Error),
    Sled(sled::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedEngine { engine } => write!(
                f,
                "unsupported storage.engine '{engine}'; only 'sled' is available"
            ),
            Self::InvalidSledMode { mode } => write!(
                f,
                "invalid storage.sled.mode '{mode}'; allowed values: low_space, high_throughput"
            ),
            Self::HomeDirectoryUnavailable => {
                write!(f, "cannot resolve storage path because HOME is not set")
            }
            Self::CreateDirectory {
                purpose,
                path,
                source,
            } => write!(
                f,
                "failed to create {purpose} directory '{}': {source}",
                path.display()
            ),
            Self::SerializeQueue(source) => {
                write!(f, "failed to serialize queue definition: {source}")
            }
            Self::DeserializeQueue(source) => {
                write!(f, "failed to deserialize queue definition: {source}")
            }
            Self::Sled(source) => write!(f, "sled storage error: {source}"),
        }
    }
}

impl std::error::Error for StorageError {}
