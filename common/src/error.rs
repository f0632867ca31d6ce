use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config document has no `devices` key")]
    MissingDevices,
    #[error("config document has no `days` key")]
    MissingDays,
    #[error("device `{name}`: {reason}")]
    InvalidDevice { name: String, reason: String },
    #[error("invalid time rule `{0}`")]
    InvalidTime(String),
    #[error("invalid mac address `{0}`")]
    InvalidMac(String),
    #[error("invalid calendar date `{0}`")]
    InvalidDate(String),
    #[error("malformed config document: {0}")]
    Json(#[from] serde_json::Error),
}
