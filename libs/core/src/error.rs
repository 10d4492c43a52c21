use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid service path: {0:?}")]
    InvalidPath(String),

    #[error("Missing method in service path: {0:?}")]
    MissingMethod(String),

    #[error("Invalid method: {0:?}")]
    InvalidMethod(String),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("No instance available for service: {0}")]
    NoInstanceAvailable(String),

    #[error("Service {service} unavailable: instance {instance} went down")]
    ServiceUnavailable { service: String, instance: String },

    #[error("Request {id} timed out after {after:?}")]
    RequestTimeout { id: String, after: Duration },

    #[error("Request {id} expired after {age:?} without a reply")]
    MessageExpired { id: String, age: Duration },

    #[error("Empty response for request {0}")]
    EmptyResponse(String),

    #[error("Invalid response for request {id}: {reason}")]
    InvalidResponse { id: String, reason: String },

    #[error("Service already registered: {0}")]
    DuplicateService(String),

    #[error("Invalid service type: {0}")]
    InvalidServiceType(String),

    #[error("Already started")]
    AlreadyStarted,

    #[error("No services registered")]
    NoServicesRegistered,

    #[error("Invalid handler: {0}")]
    InvalidHandler(String),

    #[error("Client is shutting down")]
    ClientShuttingDown,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Custom(String),
}

/// Identity of an [`Error`], without its context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidPath,
    MissingMethod,
    InvalidMethod,
    UnknownService,
    NoInstanceAvailable,
    ServiceUnavailable,
    RequestTimeout,
    MessageExpired,
    EmptyResponse,
    InvalidResponse,
    DuplicateService,
    InvalidServiceType,
    AlreadyStarted,
    NoServicesRegistered,
    InvalidHandler,
    ClientShuttingDown,
    Transport,
    Io,
    Serialization,
    Config,
    Custom,
}

impl Error {
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidPath(_) => ErrorKind::InvalidPath,
            Error::MissingMethod(_) => ErrorKind::MissingMethod,
            Error::InvalidMethod(_) => ErrorKind::InvalidMethod,
            Error::UnknownService(_) => ErrorKind::UnknownService,
            Error::NoInstanceAvailable(_) => ErrorKind::NoInstanceAvailable,
            Error::ServiceUnavailable { .. } => ErrorKind::ServiceUnavailable,
            Error::RequestTimeout { .. } => ErrorKind::RequestTimeout,
            Error::MessageExpired { .. } => ErrorKind::MessageExpired,
            Error::EmptyResponse(_) => ErrorKind::EmptyResponse,
            Error::InvalidResponse { .. } => ErrorKind::InvalidResponse,
            Error::DuplicateService(_) => ErrorKind::DuplicateService,
            Error::InvalidServiceType(_) => ErrorKind::InvalidServiceType,
            Error::AlreadyStarted => ErrorKind::AlreadyStarted,
            Error::NoServicesRegistered => ErrorKind::NoServicesRegistered,
            Error::InvalidHandler(_) => ErrorKind::InvalidHandler,
            Error::ClientShuttingDown => ErrorKind::ClientShuttingDown,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Io(_) => ErrorKind::Io,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::Config(_) => ErrorKind::Config,
            Error::Custom(_) => ErrorKind::Custom,
        }
    }

    /// Whether the error was raised before any network effect took place.
    pub fn is_validation(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidPath | ErrorKind::MissingMethod | ErrorKind::InvalidMethod
        )
    }
}

impl From<::config::ConfigError> for Error {
    fn from(err: ::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
