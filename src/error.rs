use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, JoinError>;

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid logline: {0}")]
    Parse(String),
    #[error("invalid pixel param: {0}")]
    UnknownParam(String),
    #[error("invalid pixel param id: {0}")]
    UnknownParamId(u64),
    #[error("invalid event record: {0}")]
    Decode(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for JoinError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for JoinError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for JoinError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
