use thiserror::Error;

/// Coarse classification used by the service loops to decide whether a failure skips a
/// component, drops a request, drops a credential, or takes the whole worker down.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorKind {
    TransientExternal,
    InvalidInput,
    Credential,
    Configuration,
    Fatal,
}

#[allow(clippy::enum_variant_names)]
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("External system error: {0}")]
    TransientExternal(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Credential error: {0}")]
    Credential(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] openssl::error::ErrorStack),
    #[error("Error: {0}")]
    GenericError(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::TransientExternal(_) | CoreError::IoError(_) => ErrorKind::TransientExternal,
            CoreError::InvalidInput(_) | CoreError::SerializationError(_) => {
                ErrorKind::InvalidInput
            }
            CoreError::Credential(_) | CoreError::CryptoError(_) => ErrorKind::Credential,
            CoreError::Configuration(_) => ErrorKind::Configuration,
            CoreError::GenericError(_) => ErrorKind::Fatal,
        }
    }

    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        CoreError::InvalidInput(message.into())
    }

    pub fn credential<S: Into<String>>(message: S) -> Self {
        CoreError::Credential(message.into())
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        CoreError::Configuration(message.into())
    }
}

impl From<serde_json::error::Error> for CoreError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<toml::de::Error> for CoreError {
    fn from(e: toml::de::Error) -> Self {
        Self::Configuration(e.to_string())
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(e: anyhow::Error) -> Self {
        Self::TransientExternal(format!("{e:?}"))
    }
}

impl From<String> for CoreError {
    fn from(e: String) -> Self {
        Self::GenericError(e)
    }
}

impl From<&str> for CoreError {
    fn from(e: &str) -> Self {
        Self::GenericError(e.to_string())
    }
}
