use std::error::Error;

use crate::StatusCode;

#[derive(thiserror::Error, Debug)]
pub enum FxpError {
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),
    #[error("bad message: {0}")]
    BadMessage(String),
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("{message}")]
    Status { code: StatusCode, message: String },
    #[error("received a short buffer from FXP_READ, but not at EOF")]
    ShortReadInconsistency,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Other(Box<dyn Error + Send + Sync>),
}

impl FxpError {
    pub fn other<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Other(Box::new(err))
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::ProtocolError(message.into())
    }

    /// Builds a status error, falling back to the canned message for `code`
    /// when the peer sent an empty one.
    pub fn status<S: Into<String>>(code: StatusCode, message: S) -> Self {
        let message = message.into();
        let message = if message.is_empty() {
            code.to_string()
        } else {
            message
        };
        Self::Status { code, message }
    }

    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_eof(&self) -> bool {
        self.status_code() == Some(StatusCode::Eof)
    }

    /// Whether the owning session must be torn down after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::MalformedPacket(_) | Self::BadMessage(_) | Self::Status { .. }
        )
    }
}

pub type FxpResult<T> = Result<T, FxpError>;
