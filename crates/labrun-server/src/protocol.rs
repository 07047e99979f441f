//! Messages a browser terminal sends over the socket.

use serde::Deserialize;
use serde_json::Value;

use crate::models::ALL_LABS;
use crate::pty::TermSize;

/// Command text that expands into the playbook runner invocation.
pub const RUN_PLAYBOOK: &str = "run-playbook";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Init {
        run_id: String,
        size: TermSize,
    },
    Resize {
        run_id: String,
        size: Option<TermSize>,
    },
    Command {
        lab: String,
        run_id: String,
        command: String,
        raw: bool,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Invalid message: expected a JSON object")]
    NotAnObject,
    #[error("Unknown message type: {0}")]
    UnknownKind(String),
    #[error("Missing field: {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    lab: Option<String>,
    #[serde(rename = "playbookID", alias = "runId")]
    run_id: Option<String>,
    command: Option<String>,
    is_raw_input: Option<bool>,
    size: Option<TermSize>,
}

impl ClientMessage {
    /// Decode a text frame. The frame may also be a JSON string wrapping the
    /// object, which is how socket.io style clients send it.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let value = match serde_json::from_str::<Value>(raw)? {
            Value::String(inner) => serde_json::from_str::<Value>(&inner)?,
            other => other,
        };
        if !value.is_object() {
            return Err(DecodeError::NotAnObject);
        }
        let envelope: Envelope = serde_json::from_value(value)?;
        let run_id = envelope.run_id.unwrap_or_default();

        match envelope.kind.as_deref() {
            None | Some("init") => Ok(ClientMessage::Init {
                run_id,
                size: envelope.size.unwrap_or_default(),
            }),
            Some("resize") => Ok(ClientMessage::Resize {
                run_id,
                size: envelope.size,
            }),
            Some("command") => Ok(ClientMessage::Command {
                lab: envelope
                    .lab
                    .filter(|lab| !lab.is_empty())
                    .unwrap_or_else(|| ALL_LABS.to_string()),
                run_id,
                command: envelope.command.ok_or(DecodeError::MissingField("command"))?,
                raw: envelope.is_raw_input.unwrap_or(false),
            }),
            Some(other) => Err(DecodeError::UnknownKind(other.to_string())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Init { .. } => "init",
            ClientMessage::Resize { .. } => "resize",
            ClientMessage::Command { .. } => "command",
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            ClientMessage::Init { run_id, .. }
            | ClientMessage::Resize { run_id, .. }
            | ClientMessage::Command { run_id, .. } => run_id,
        }
    }
}
