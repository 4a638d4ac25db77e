use crate::account::{Identity, QuotaInfo};
use crate::listing::DirEntry;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const MAX_ENVELOPE_BYTES: usize = 256 * 1024;

/// Inbound `{command, args, requestId}` message from the UI.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub command: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default, rename = "requestId", deserialize_with = "deserialize_request_id")]
    pub request_id: Option<String>,
}

impl Envelope {
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() > MAX_ENVELOPE_BYTES {
            return Err(DecodeError::TooLarge(data.len()));
        }
        let envelope: Envelope = serde_json::from_slice(data)?;
        if !(envelope.args.is_object() || envelope.args.is_null()) {
            return Err(DecodeError::ArgsNotObject);
        }
        Ok(envelope)
    }

    fn arg(&self, name: &str) -> Option<&str> {
        self.args.get(name).and_then(Value::as_str)
    }

    fn required(&self, name: &'static str) -> Result<String, ArgumentError> {
        match self.arg(name) {
            Some(value) if !value.is_empty() => Ok(value.to_string()),
            _ => Err(ArgumentError::Missing {
                command: self.command.clone(),
                name,
            }),
        }
    }

    fn optional(&self, name: &str) -> Option<String> {
        self.arg(name)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }
}

/// Request ids are opaque; numbers are accepted and echoed back as strings.
fn deserialize_request_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(serde::de::Error::custom(
            "expected string or number for requestId",
        )),
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message too large ({0} bytes)")]
    TooLarge(usize),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("args must be an object")]
    ArgsNotObject,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("{command}: missing argument '{name}'")]
    Missing { command: String, name: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login { bduss: String },
    List { path: String },
    Download { path: String, filename: Option<String> },
    Mkdir { path: String },
    Remove { path: String },
    Quota,
    Move { from: String, to: String },
    Copy { from: String, to: String },
    Who,
}

impl Command {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ArgumentError> {
        let command = match envelope.command.as_str() {
            "login" => Command::Login {
                bduss: envelope.arg("bduss").unwrap_or_default().to_string(),
            },
            "ls" => Command::List {
                path: envelope.optional("path").unwrap_or_else(|| "/".to_string()),
            },
            "download" => Command::Download {
                path: envelope.required("path")?,
                filename: envelope.optional("filename"),
            },
            "mkdir" => Command::Mkdir {
                path: envelope.required("path")?,
            },
            "rm" => Command::Remove {
                path: envelope.required("path")?,
            },
            "quota" => Command::Quota,
            "mv" => Command::Move {
                from: envelope.required("from")?,
                to: envelope.required("to")?,
            },
            "cp" => Command::Copy {
                from: envelope.required("from")?,
                to: envelope.required("to")?,
            },
            "who" => Command::Who,
            other => return Err(ArgumentError::UnknownCommand(other.to_string())),
        };
        Ok(command)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Login { .. } => "login",
            Command::List { .. } => "ls",
            Command::Download { .. } => "download",
            Command::Mkdir { .. } => "mkdir",
            Command::Remove { .. } => "rm",
            Command::Quota => "quota",
            Command::Move { .. } => "mv",
            Command::Copy { .. } => "cp",
            Command::Who => "who",
        }
    }
}

/// Outbound event body; the `type` tag is the event name the UI switches on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Status {
        message: String,
    },
    Error {
        code: String,
        message: String,
    },
    LoginSuccess {
        message: String,
    },
    FileList {
        data: Vec<DirEntry>,
        path: String,
    },
    DownloadStart {
        filename: String,
    },
    DownloadProgress {
        progress: u8,
        current: String,
        total: String,
        speed: String,
        remaining: String,
    },
    DownloadComplete {
        message: String,
        #[serde(rename = "localPath")]
        local_path: String,
    },
    MkdirSuccess {
        message: String,
    },
    DeleteSuccess {
        message: String,
    },
    QuotaInfo {
        data: QuotaInfo,
    },
    MoveSuccess {
        message: String,
    },
    CopySuccess {
        message: String,
    },
    WhoInfo {
        data: Identity,
    },
}

impl ServerEvent {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Status { .. } => "status",
            ServerEvent::Error { .. } => "error",
            ServerEvent::LoginSuccess { .. } => "login_success",
            ServerEvent::FileList { .. } => "file_list",
            ServerEvent::DownloadStart { .. } => "download_start",
            ServerEvent::DownloadProgress { .. } => "download_progress",
            ServerEvent::DownloadComplete { .. } => "download_complete",
            ServerEvent::MkdirSuccess { .. } => "mkdir_success",
            ServerEvent::DeleteSuccess { .. } => "delete_success",
            ServerEvent::QuotaInfo { .. } => "quota_info",
            ServerEvent::MoveSuccess { .. } => "move_success",
            ServerEvent::CopySuccess { .. } => "copy_success",
            ServerEvent::WhoInfo { .. } => "who_info",
        }
    }
}

/// An event plus the correlation id of the request that caused it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerMessage {
    #[serde(flatten)]
    pub event: ServerEvent,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ServerMessage {
    pub fn untagged(event: ServerEvent) -> Self {
        Self {
            event,
            request_id: None,
        }
    }

    pub fn tagged(event: ServerEvent, request_id: Option<String>) -> Self {
        Self { event, request_id }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
