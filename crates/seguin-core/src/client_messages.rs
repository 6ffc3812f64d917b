use crate::loom_protocol::StatusWord;
use crate::pattern::ReducedPattern;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// State of the server's connection to the loom, sent to the client as a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    Connecting,
    Disconnecting,
}

impl ConnectionState {
    pub fn code(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connected => 1,
            Self::Connecting => 2,
            Self::Disconnecting => 3,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Self::Disconnected),
            1 => Some(Self::Connected),
            2 => Some(Self::Connecting),
            3 => Some(Self::Disconnecting),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Connecting => "connecting",
            Self::Disconnecting => "disconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ConnectionState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for ConnectionState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ConnectionStateVisitor;

        impl<'de> Visitor<'de> for ConnectionStateVisitor {
            type Value = ConnectionState;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a connection state code 0-3")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                ConnectionState::from_code(value)
                    .ok_or_else(|| E::custom(format!("unknown connection state: {value}")))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(E::custom(format!("unknown connection state: {value}")));
                }
                self.visit_u64(value as u64)
            }
        }

        deserializer.deserialize_u64(ConnectionStateVisitor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageSeverity {
    Info,
    Warning,
    Error,
}

impl MessageSeverity {
    pub fn code(self) -> u8 {
        match self {
            Self::Info => 1,
            Self::Warning => 2,
            Self::Error => 3,
        }
    }
}

impl Serialize for MessageSeverity {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for MessageSeverity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match u8::deserialize(deserializer)? {
            1 => Ok(Self::Info),
            2 => Ok(Self::Warning),
            3 => Ok(Self::Error),
            other => Err(de::Error::custom(format!("unknown severity: {other}"))),
        }
    }
}

/// Server to client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientReply {
    LoomConnectionState {
        state: ConnectionState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    LoomState {
        shed_closed: bool,
        cycle_complete: bool,
        error: bool,
    },
    PatternNames {
        names: Vec<String>,
    },
    CurrentPickNumber {
        pick_number: usize,
        repeat_number: i64,
    },
    WeaveDirection {
        forward: bool,
    },
    ReducedPattern(ReducedPattern),
    CommandProblem {
        message: String,
        severity: MessageSeverity,
    },
}

impl ClientReply {
    pub fn loom_state(status: StatusWord) -> Self {
        Self::LoomState {
            shed_closed: status.shed_closed(),
            cycle_complete: status.cycle_complete(),
            error: status.error(),
        }
    }

    pub fn pick_number(pattern: &ReducedPattern) -> Self {
        Self::CurrentPickNumber {
            pick_number: pattern.pick_number,
            repeat_number: pattern.repeat_number,
        }
    }

    pub fn problem(severity: MessageSeverity, message: impl Into<String>) -> Self {
        Self::CommandProblem {
            message: message.into(),
            severity,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::LoomConnectionState { .. } => "LoomConnectionState",
            Self::LoomState { .. } => "LoomState",
            Self::PatternNames { .. } => "PatternNames",
            Self::CurrentPickNumber { .. } => "CurrentPickNumber",
            Self::WeaveDirection { .. } => "WeaveDirection",
            Self::ReducedPattern(_) => "ReducedPattern",
            Self::CommandProblem { .. } => "CommandProblem",
        }
    }
}

/// Client to server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    ClearPatternNames,
    File {
        name: String,
        data: String,
    },
    SelectPattern {
        name: String,
    },
    JumpToPick {
        pick_number: i64,
        /// Keeps the current repeat when omitted.
        #[serde(default)]
        repeat_number: Option<i64>,
    },
    GotoNextPick,
    WeaveDirection {
        forward: bool,
    },
    Oobcommand {
        command: String,
    },
}

impl ClientCommand {
    pub const KINDS: [&'static str; 7] = [
        "clear_pattern_names",
        "file",
        "select_pattern",
        "jump_to_pick",
        "goto_next_pick",
        "weave_direction",
        "oobcommand",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClearPatternNames => "clear_pattern_names",
            Self::File { .. } => "file",
            Self::SelectPattern { .. } => "select_pattern",
            Self::JumpToPick { .. } => "jump_to_pick",
            Self::GotoNextPick => "goto_next_pick",
            Self::WeaveDirection { .. } => "weave_direction",
            Self::Oobcommand { .. } => "oobcommand",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientMessageError {
    #[error("message is not valid JSON: {0}")]
    Malformed(String),
    #[error("message has no 'type' field")]
    MissingType,
    #[error("unknown command type {0:?}")]
    UnknownType(String),
    #[error("invalid {kind} command: {reason}")]
    InvalidFields { kind: String, reason: String },
}

impl ClientMessageError {
    /// Malformed text is only logged; everything else is reported back to the client.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, Self::Malformed(_))
    }
}

pub fn parse_client_command(text: &str) -> Result<ClientCommand, ClientMessageError> {
    let value: Value =
        serde_json::from_str(text).map_err(|err| ClientMessageError::Malformed(err.to_string()))?;
    let kind = match value.get("type").and_then(Value::as_str) {
        Some(kind) => kind.to_string(),
        None => return Err(ClientMessageError::MissingType),
    };
    if !ClientCommand::KINDS.contains(&kind.as_str()) {
        return Err(ClientMessageError::UnknownType(kind));
    }
    serde_json::from_value(value).map_err(|err| ClientMessageError::InvalidFields {
        kind,
        reason: err.to_string(),
    })
}
