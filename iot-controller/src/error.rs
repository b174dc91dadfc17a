use protocol::{CommandFailure, FailureKind, ProtocolError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    UnknownDevice(String),
    DeviceNotConnected(String),
    DriverFailure(String),
    InvalidCommand(String),
}

impl DeviceError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DeviceError::UnknownDevice(_) => FailureKind::UnknownDevice,
            DeviceError::DeviceNotConnected(_) => FailureKind::DeviceNotConnected,
            DeviceError::DriverFailure(_) => FailureKind::DriverFailure,
            DeviceError::InvalidCommand(_) => FailureKind::InvalidCommand,
        }
    }

    pub fn to_failure(&self) -> CommandFailure {
        CommandFailure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl std::fmt::Display for DeviceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceError::UnknownDevice(device_id) => write!(f, "invalid device id: {device_id}"),
            DeviceError::DeviceNotConnected(device_id) => {
                write!(f, "device {device_id} is not connected")
            }
            DeviceError::DriverFailure(message) => write!(f, "driver failure: {message}"),
            DeviceError::InvalidCommand(message) => write!(f, "invalid command: {message}"),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<ProtocolError> for DeviceError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidCommand(message)
            | ProtocolError::Decode(message)
            | ProtocolError::Encode(message) => DeviceError::InvalidCommand(message),
        }
    }
}
