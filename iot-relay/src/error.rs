use axum::http::StatusCode;
use protocol::{CommandFailure, FailureKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    UnknownController(String),
    InvalidCommand(String),
    ChannelClosed,
    ResultTimeout(String),
    /// The controller executed the command and reported a failure.
    CommandFailed(CommandFailure),
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::UnknownController(_) => StatusCode::NOT_FOUND,
            RelayError::InvalidCommand(_) => StatusCode::BAD_REQUEST,
            RelayError::ChannelClosed => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::ResultTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::CommandFailed(failure) => match failure.kind {
                FailureKind::UnknownDevice => StatusCode::NOT_FOUND,
                FailureKind::DeviceNotConnected => StatusCode::CONFLICT,
                FailureKind::DriverFailure => StatusCode::BAD_GATEWAY,
                FailureKind::InvalidCommand => StatusCode::BAD_REQUEST,
            },
        }
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::UnknownController(controller_id) => {
                write!(f, "unknown controller: {controller_id}")
            }
            RelayError::InvalidCommand(message) => write!(f, "invalid command: {message}"),
            RelayError::ChannelClosed => write!(f, "controller channel closed"),
            RelayError::ResultTimeout(tag) => {
                write!(f, "controller did not answer command {tag} in time")
            }
            RelayError::CommandFailed(failure) => write!(f, "{}", failure.message),
        }
    }
}

impl std::error::Error for RelayError {}
