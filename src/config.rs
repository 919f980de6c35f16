//! Configuration management.
use crate::error::{PipelineError, PipelineResult};
use config::Config;
use serde::Deserialize;
use std::collections::HashMap;

/// Top-level application settings, loaded from a TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Log level filter passed to the tracing subscriber (e.g. "info").
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Data server bind address and client timeouts.
    pub network: NetworkSettings,
    /// Dispatch loop policy.
    #[serde(default)]
    pub dispatch: DispatchSettings,
    /// Data buffers keyed by data type name.
    pub buffers: HashMap<String, BufferSettings>,
    /// Receivers keyed by the data type they ingest into.
    #[serde(default)]
    pub receivers: HashMap<String, ReceiverSettings>,
}

/// Network settings for the data server and remote clients.
#[derive(Debug, Deserialize, Clone)]
pub struct NetworkSettings {
    /// Interface the data server binds to.
    pub host: String,
    /// Port the data server listens on.
    pub port: u16,
    /// Client-side read timeout in milliseconds.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Client-side connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Dispatch loop policy.
#[derive(Debug, Deserialize, Clone)]
pub struct DispatchSettings {
    /// Whether a cycle that invokes no pipeline is logged and skipped (`true`)
    /// or treated as a fatal dispatch error (`false`).
    #[serde(default)]
    pub permit_empty_cycles: bool,
    /// Upper bound, in milliseconds, a data client waits for fresh stream
    /// data before yielding an incomplete cycle.
    #[serde(default = "default_stream_wait_ms")]
    pub stream_wait_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            permit_empty_cycles: false,
            stream_wait_ms: default_stream_wait_ms(),
        }
    }
}

/// Policy variant of a configured buffer.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BufferKind {
    /// Ring of slots; chunks are transient and consumed once.
    Stream,
    /// Single retained current value, version-stamped for cache validation.
    Service,
}

/// Slot pool configuration for one data type.
#[derive(Debug, Deserialize, Clone)]
pub struct BufferSettings {
    /// Retention policy.
    pub kind: BufferKind,
    /// Number of slots in the pool.
    pub slots: usize,
    /// Capacity of each slot in bytes.
    pub slot_capacity: usize,
}

/// One ingestion task bound to a byte source.
#[derive(Debug, Deserialize, Clone)]
pub struct ReceiverSettings {
    /// `host:port` of the instrument stream to connect to.
    pub source: String,
}

impl Settings {
    /// Loads settings from `config/<name>.toml` (default name: "default").
    pub fn new(config_name: Option<&str>) -> PipelineResult<Self> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path))
            .build()
            .map_err(PipelineError::Config)?;

        s.try_deserialize().map_err(PipelineError::Config)
    }

    /// Checks cross-field constraints that serde cannot express.
    pub fn validate(&self) -> PipelineResult<()> {
        for (name, buffer) in &self.buffers {
            if buffer.slots == 0 {
                return Err(PipelineError::Configuration(format!(
                    "buffer '{}' must have at least one slot",
                    name
                )));
            }
            if buffer.slot_capacity == 0 {
                return Err(PipelineError::Configuration(format!(
                    "buffer '{}' must have a non-zero slot capacity",
                    name
                )));
            }
        }
        for name in self.receivers.keys() {
            if !self.buffers.contains_key(name) {
                return Err(PipelineError::Configuration(format!(
                    "receiver '{}' has no matching buffer entry",
                    name
                )));
            }
        }
        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_read_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_stream_wait_ms() -> u64 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with(buffers: HashMap<String, BufferSettings>) -> Settings {
        Settings {
            log_level: default_log_level(),
            network: NetworkSettings {
                host: "127.0.0.1".to_string(),
                port: 2000,
                read_timeout_ms: default_read_timeout_ms(),
                connect_timeout_ms: default_connect_timeout_ms(),
            },
            dispatch: DispatchSettings::default(),
            buffers,
            receivers: HashMap::new(),
        }
    }

    #[test]
    fn rejects_zero_slot_buffer() {
        let mut buffers = HashMap::new();
        buffers.insert(
            "visibilities".to_string(),
            BufferSettings {
                kind: BufferKind::Stream,
                slots: 0,
                slot_capacity: 1024,
            },
        );
        let settings = settings_with(buffers);
        assert!(matches!(
            settings.validate(),
            Err(PipelineError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_receiver_without_buffer() {
        let mut settings = settings_with(HashMap::new());
        settings.receivers.insert(
            "visibilities".to_string(),
            ReceiverSettings {
                source: "127.0.0.1:4100".to_string(),
            },
        );
        assert!(matches!(
            settings.validate(),
            Err(PipelineError::Configuration(_))
        ));
    }
}
