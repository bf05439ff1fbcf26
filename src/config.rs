use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;

/// Settings for the `sprawl-bench` harness, read from TOML.
///
/// ```toml
/// log_level = "debug"
/// runs = 3
///
/// [queue]
/// capacity = 4
/// producers = 2
/// consumers = 2
/// items_per_producer = 1000
///
/// [multiaccess]
/// readers = 4
/// writers = 2
/// ```
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default = "defaults::runs")]
    pub runs: usize,
    #[serde(default)]
    pub queue: QueueWorkload,
    #[serde(default)]
    pub multiaccess: MultiAccessWorkload,
}

/// Producer/consumer load for one queue run.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct QueueWorkload {
    pub capacity: usize,
    pub producers: usize,
    pub consumers: usize,
    pub items_per_producer: usize,
}

/// Reader/writer load for one multi-access run.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct MultiAccessWorkload {
    pub readers: usize,
    pub writers: usize,
    pub writes_per_writer: usize,
    pub reads_per_reader: usize,
}

mod defaults {
    pub fn log_level() -> String {
        "info".into()
    }

    pub fn runs() -> usize {
        1
    }
}

impl Default for QueueWorkload {
    fn default() -> Self {
        Self {
            capacity: 1024,
            producers: 4,
            consumers: 4,
            items_per_producer: 100_000,
        }
    }
}

impl Default for MultiAccessWorkload {
    fn default() -> Self {
        Self {
            readers: 4,
            writers: 2,
            writes_per_writer: 10_000,
            reads_per_reader: 100_000,
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            log_level: defaults::log_level(),
            runs: defaults::runs(),
            queue: QueueWorkload::default(),
            multiaccess: MultiAccessWorkload::default(),
        }
    }
}

impl HarnessConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&toml_to_str)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let config: HarnessConfig = toml::from_str(text)?;
        Ok(config)
    }
}
