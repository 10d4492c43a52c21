use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid handler: {0}")]
    InvalidHandler(String),

    #[error("Socket not connected")]
    NotConnected,

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("{0}")]
    Custom(String),
}

impl From<Error> for polymesh_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => polymesh_core::Error::Io(e),
            Error::InvalidHandler(msg) => polymesh_core::Error::InvalidHandler(msg),
            other => polymesh_core::Error::Transport(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
