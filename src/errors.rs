use std::path::PathBuf;

use thiserror::Error;

/// Represents all possible errors that can occur while discovering devices
/// and running a workout session
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Failed to create file \"{path}\": {source}")]
    CreateFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Error parsing config: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Bluetooth Error: {0}")]
    Bt(#[from] btleplug::Error),
    #[error("TOML Serialization Error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("TOML Deserialization Error: {0}")]
    TomlDe(#[from] toml::de::Error),
    #[error("JSON Error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Logging setup error: {0}")]
    Logging(String),
    // My errors
    #[error("No rower selected! Bind a rower before starting a workout.")]
    NoRowerBound,
    #[error("Can't {operation} while {state}")]
    InvalidTransition {
        state: &'static str,
        operation: &'static str,
    },
    #[error("Session actor is no longer running")]
    SessionClosed,
    #[error("Workout store error: {0}")]
    Store(String),
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    #[error("Connection timed out")]
    ConnectTimeout,
    #[error("Device is missing characteristic {0}")]
    MissingCharacteristic(uuid::Uuid),
    #[error("Training plan has no segments")]
    EmptyPlan,
    #[error("Can't bind {0}, it isn't a rower or heart rate monitor")]
    UnknownRole(String),
}
