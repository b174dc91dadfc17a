use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

pub const EVENT_CLIENT_READY: &str = "IOT_CLIENT_READY";
pub const EVENT_SCAN_REQUEST: &str = "IOT_SCAN_REQUEST";
pub const EVENT_DEVICE_MSG: &str = "IOT_DEVICE_MSG";
pub const EVENT_COMMAND: &str = "IOT_COMMAND";
pub const EVENT_COMMAND_RESULT: &str = "IOT_COMMAND_RESULT";

pub const CMD_CONNECT: &str = "BB8_CONNECTION_REQUEST";
pub const CMD_ROLL: &str = "ROLL";
pub const CMD_HEADING: &str = "HEADING";
pub const CMD_BLINK: &str = "BLINK";
pub const CMD_COLOR: &str = "COLOR";
pub const CMD_PATH: &str = "PATH";

pub const DEFAULT_SCAN_TIMEOUT_MS: u64 = 30_000;

pub const STATUS_DONE: &str = "done";
pub const STATUS_DEVICE_CONNECTED: &str = "device connected";

/// Frames sent by a controller process to the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ControllerMessage {
    #[serde(rename = "IOT_CLIENT_READY")]
    ClientReady(ClientReady),
    #[serde(rename = "IOT_DEVICE_MSG")]
    Device(DeviceSummary),
    #[serde(rename = "IOT_COMMAND_RESULT")]
    CommandResult(CommandResult),
}

impl ControllerMessage {
    pub fn event(&self) -> &'static str {
        match self {
            ControllerMessage::ClientReady(_) => EVENT_CLIENT_READY,
            ControllerMessage::Device(_) => EVENT_DEVICE_MSG,
            ControllerMessage::CommandResult(_) => EVENT_COMMAND_RESULT,
        }
    }
}

/// Frames sent by the relay to one controller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum RelayMessage {
    #[serde(rename = "IOT_SCAN_REQUEST")]
    ScanRequest(ScanRequest),
    #[serde(rename = "IOT_COMMAND")]
    Command(Command),
}

impl RelayMessage {
    pub fn event(&self) -> &'static str {
        match self {
            RelayMessage::ScanRequest(_) => EVENT_SCAN_REQUEST,
            RelayMessage::Command(_) => EVENT_COMMAND,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientType {
    #[serde(rename = "IOT_CONTROLLER")]
    Controller,
    #[default]
    #[serde(other)]
    Other,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientReady {
    #[serde(rename = "type", default)]
    pub client_type: ClientType,
    pub name: String,
}

impl ClientReady {
    pub fn controller(name: impl Into<String>) -> Self {
        Self {
            client_type: ClientType::Controller,
            name: name.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    /// Milliseconds.
    #[serde(rename = "scanTimeout", default = "default_scan_timeout_ms")]
    pub scan_timeout: u64,
}

impl Default for ScanRequest {
    fn default() -> Self {
        Self {
            scan_timeout: DEFAULT_SCAN_TIMEOUT_MS,
        }
    }
}

/// Public view of one device, as reported by a controller and as listed by the relay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub connected: bool,
    pub device_id: String,
    pub address: String,
    pub name: String,
}

/// Speed and heading travel as plain JSON numbers. Web clients derive them
/// from joystick angles, so both may be fractional and speed may exceed the
/// driver's range; controllers normalize them before driving a device.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RollArgs {
    pub speed: f64,
    /// Degrees.
    pub heading: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeadingArgs {
    pub heading: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlinkArgs {
    pub enabled: bool,
    /// Milliseconds between flashes, zero for a solid color.
    pub period: u64,
    pub color: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorArgs {
    pub color: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathShape {
    Square,
    #[default]
    #[serde(other)]
    Stop,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathArgs {
    pub speed: f64,
    #[serde(rename = "type", default)]
    pub shape: PathShape,
    pub length: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CommandAction {
    Connect,
    Roll(RollArgs),
    Heading(HeadingArgs),
    Blink(BlinkArgs),
    Color(ColorArgs),
    Path(PathArgs),
}

impl CommandAction {
    pub fn cmd_id(&self) -> &'static str {
        match self {
            CommandAction::Connect => CMD_CONNECT,
            CommandAction::Roll(_) => CMD_ROLL,
            CommandAction::Heading(_) => CMD_HEADING,
            CommandAction::Blink(_) => CMD_BLINK,
            CommandAction::Color(_) => CMD_COLOR,
            CommandAction::Path(_) => CMD_PATH,
        }
    }

    fn args(&self) -> Result<Option<Value>, ProtocolError> {
        let value = match self {
            CommandAction::Connect => return Ok(None),
            CommandAction::Roll(args) => {
                require_finite(CMD_ROLL, "speed", args.speed)?;
                require_finite(CMD_ROLL, "heading", args.heading)?;
                serde_json::to_value(args)
            }
            CommandAction::Heading(args) => {
                require_finite(CMD_HEADING, "heading", args.heading)?;
                serde_json::to_value(args)
            }
            CommandAction::Blink(args) => serde_json::to_value(args),
            CommandAction::Color(args) => serde_json::to_value(args),
            CommandAction::Path(args) => {
                require_finite(CMD_PATH, "speed", args.speed)?;
                require_finite(CMD_PATH, "length", args.length)?;
                serde_json::to_value(args)
            }
        };
        value
            .map(Some)
            .map_err(|err| ProtocolError::Encode(format!("{} args: {err}", self.cmd_id())))
    }

    fn from_parts(cmd_id: &str, args: Option<Value>) -> Result<Self, ProtocolError> {
        match cmd_id {
            CMD_CONNECT => Ok(CommandAction::Connect),
            CMD_ROLL => parse_args(cmd_id, args).map(CommandAction::Roll),
            CMD_HEADING => parse_args(cmd_id, args).map(CommandAction::Heading),
            CMD_BLINK => parse_args(cmd_id, args).map(CommandAction::Blink),
            CMD_COLOR => parse_args(cmd_id, args).map(CommandAction::Color),
            CMD_PATH => parse_args(cmd_id, args).map(CommandAction::Path),
            other => Err(ProtocolError::InvalidCommand(format!(
                "unknown cmdId: {other}"
            ))),
        }
    }
}

// JSON has no NaN or infinity; serde_json would silently write them as null.
fn require_finite(cmd_id: &str, field: &str, value: f64) -> Result<(), ProtocolError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ProtocolError::InvalidCommand(format!(
            "{cmd_id} {field} must be a finite number, got {value}"
        )))
    }
}

fn parse_args<T: DeserializeOwned>(cmd_id: &str, args: Option<Value>) -> Result<T, ProtocolError> {
    let Some(args) = args else {
        return Err(ProtocolError::InvalidCommand(format!(
            "{cmd_id} requires args"
        )));
    };
    serde_json::from_value(args)
        .map_err(|err| ProtocolError::InvalidCommand(format!("invalid {cmd_id} args: {err}")))
}

/// A logical command addressed to one device of one controller.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "RawCommand")]
pub struct Command {
    pub device_id: String,
    pub action: CommandAction,
    pub request_result: bool,
    pub tag: Option<String>,
}

impl Command {
    pub fn new(device_id: impl Into<String>, action: CommandAction) -> Self {
        Self {
            device_id: device_id.into(),
            action,
            request_result: false,
            tag: None,
        }
    }

    pub fn with_result(mut self) -> Self {
        self.request_result = true;
        self
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCommand {
    device_id: String,
    cmd_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args: Option<Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    request_result: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tag: Option<String>,
}

impl TryFrom<RawCommand> for Command {
    type Error = ProtocolError;

    fn try_from(raw: RawCommand) -> Result<Self, Self::Error> {
        let action = CommandAction::from_parts(&raw.cmd_id, raw.args)?;
        Ok(Command {
            device_id: raw.device_id,
            action,
            request_result: raw.request_result,
            tag: raw.tag,
        })
    }
}

impl Serialize for Command {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let args = self.action.args().map_err(serde::ser::Error::custom)?;
        RawCommand {
            device_id: self.device_id.clone(),
            cmd_id: self.action.cmd_id().to_string(),
            args,
            request_result: self.request_result,
            tag: self.tag.clone(),
        }
        .serialize(serializer)
    }
}

#[derive(Deserialize)]
struct TaggedFrame {
    event: String,
    #[serde(default)]
    data: Option<TaggedPayload>,
}

#[derive(Deserialize)]
struct TaggedPayload {
    #[serde(default)]
    tag: Option<String>,
}

/// Recovers the correlation tag of an `IOT_COMMAND` frame that did not decode,
/// so the sender can still be told the command was rejected.
pub fn command_tag(frame: &str) -> Option<String> {
    let frame = serde_json::from_str::<TaggedFrame>(frame).ok()?;
    if frame.event != EVENT_COMMAND {
        return None;
    }
    frame.data?.tag
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    UnknownDevice,
    DeviceNotConnected,
    DriverFailure,
    InvalidCommand,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandFailure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub tag: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandFailure>,
}

impl CommandResult {
    pub fn ok(tag: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            status: status.into(),
            error: None,
        }
    }

    pub fn failed(tag: impl Into<String>, failure: CommandFailure) -> Self {
        Self {
            tag: tag.into(),
            status: "failed".to_string(),
            error: Some(failure),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    InvalidCommand(String),
    Decode(String),
    Encode(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::InvalidCommand(message) => write!(f, "invalid command: {message}"),
            ProtocolError::Decode(message) => write!(f, "failed to decode frame: {message}"),
            ProtocolError::Encode(message) => write!(f, "failed to encode frame: {message}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

pub fn encode_frame<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(|err| ProtocolError::Encode(err.to_string()))
}

pub fn decode_frame<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(text).map_err(|err| ProtocolError::Decode(err.to_string()))
}

const fn default_scan_timeout_ms() -> u64 {
    DEFAULT_SCAN_TIMEOUT_MS
}

fn is_false(value: &bool) -> bool {
    !*value
}
