//! Error types for Setu

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Setu error types
///
/// Only constructors surface these. Per-tick operations (`publish`,
/// `receive`) log transient failures and keep going.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Value could not be serialized or compressed
    #[error("Encode error: {0}")]
    Encode(String),

    /// Frame was malformed, truncated or did not match the expected type
    #[error("Decode error: {0}")]
    Decode(String),

    /// Frame or envelope above the allowed maximum
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Frame or envelope size
        size: usize,
        /// Maximum accepted size
        max: usize,
    },

    /// Endpoint string could not be resolved to a socket address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Failed to bind a required local endpoint
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Endpoint we tried to bind
        addr: String,
        /// Underlying socket error
        source: std::io::Error,
    },

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// ZeroMQ error
    #[cfg(feature = "zmq")]
    #[error("ZeroMQ error: {0}")]
    Zmq(#[from] zmq::Error),

    /// MQTT client or broker error
    #[cfg(feature = "mqtt")]
    #[error("MQTT error: {0}")]
    Mqtt(String),

    /// Background thread could not be spawned or panicked
    #[error("Thread error: {0}")]
    Thread(String),
}
