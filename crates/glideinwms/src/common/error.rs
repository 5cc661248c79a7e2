use thiserror::Error;

use gwms_core::common::error::{CoreError, ErrorKind};

use crate::common::error::GwmsError::GenericError;

#[derive(Debug, Error)]
pub enum GwmsError {
    #[error(transparent)]
    CoreError(#[from] CoreError),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Interrupted")]
    Interrupted,
    #[error("Error: {0}")]
    GenericError(String),
}

impl GwmsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GwmsError::CoreError(error) => error.kind(),
            GwmsError::IoError(_) => ErrorKind::TransientExternal,
            GwmsError::SerializationError(_) | GwmsError::DeserializationError(_) => {
                ErrorKind::InvalidInput
            }
            GwmsError::Interrupted | GwmsError::GenericError(_) => ErrorKind::Fatal,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, GwmsError::Interrupted)
    }
}

impl From<serde_json::error::Error> for GwmsError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<anyhow::Error> for GwmsError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(format!("{error:?}"))
    }
}

impl From<toml::de::Error> for GwmsError {
    fn from(error: toml::de::Error) -> Self {
        Self::CoreError(CoreError::configuration(error.to_string()))
    }
}

pub fn error<T>(message: String) -> crate::Result<T> {
    Err(GenericError(message))
}

pub fn configuration_error<T>(message: String) -> crate::Result<T> {
    Err(CoreError::configuration(message).into())
}

impl From<String> for GwmsError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}
