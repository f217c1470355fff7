// SoundWatch - Error Types
//
// One error enum per concern. Everything here is an expected steady-state
// event for the pipeline except `StorageError::Mount`/`Format` at boot.

use thiserror::Error;

/// Failures talking to the sound-level module over the field bus.
#[derive(Debug, Error)]
pub enum FieldBusError {
    /// The full response did not arrive before the read deadline.
    #[error("response timed out after {received} of {expected} bytes")]
    Timeout { received: usize, expected: usize },

    #[error("checksum mismatch (computed {computed:#06x}, received {received:#06x})")]
    Checksum { computed: u16, received: u16 },

    #[error("serial port error: {0}")]
    Serial(String),
}

/// Failures of the persistent backlog store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to mount storage: {0}")]
    Mount(String),

    #[error("failed to format storage: {0}")]
    Format(String),

    #[error("storage I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures delivering telemetry to the broker.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker session is not connected")]
    NotConnected,

    #[error("broker rejected the message: {0}")]
    Rejected(String),

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures issuing a request to the wireless link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("wireless link request failed: {0}")]
    Request(String),
}

/// Invalid configuration override.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}
