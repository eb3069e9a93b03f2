use std::fmt;

/// Backend selected by `storage.engine`. Only sled is wired in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageEngine {
    Sled,
}

impl StorageEngine {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sled" => Some(Self::Sled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sled => "sled",
        }
    }
}

impl fmt::Display for StorageEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SledMode {
    LowSpace,
    HighThroughput,
}

impl SledMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low_space" => Some(Self::LowSpace),
            "high_throughput" => Some(Self::HighThroughput),
            _ => None,
        }
    }

    pub(super) fn into_sled(self) -> sled::Mode {
        match self {
            Self::LowSpace => sled::Mode::LowSpace,
            Self::HighThroughput => sled::Mode::HighThroughput,
        }
    }
}
