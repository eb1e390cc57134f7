//! Messages crossing the host/realm boundary.
//!
//! Both sides exchange plain JSON objects tagged by `type`. Anything arriving
//! over the boundary goes through [`parse_message`] first; a payload that does
//! not match one of the shapes below exactly is noise and gets dropped.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identifier of one run. Fresh for every run, never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Mint a new random run id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The five intercepted console methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

impl ConsoleLevel {
    pub const ALL: [ConsoleLevel; 5] = [
        ConsoleLevel::Log,
        ConsoleLevel::Info,
        ConsoleLevel::Warn,
        ConsoleLevel::Error,
        ConsoleLevel::Debug,
    ];

    /// Name of the console method this level intercepts.
    pub fn as_str(self) -> &'static str {
        match self {
            ConsoleLevel::Log => "log",
            ConsoleLevel::Info => "info",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Error => "error",
            ConsoleLevel::Debug => "debug",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|level| level.as_str() == name)
    }
}

impl fmt::Display for ConsoleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which way a message is allowed to travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToRealm,
    RealmToHost,
}

/// Closed set of boundary messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// The realm finished installing its wiring.
    Ready,

    #[serde(rename = "CONSOLE")]
    ConsoleEvent {
        level: ConsoleLevel,
        args: Vec<String>,
        #[serde(rename = "runId")]
        run_id: RunId,
    },

    RuntimeError {
        message: String,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "present_string"
        )]
        stack: Option<String>,
        #[serde(rename = "runId")]
        run_id: RunId,
    },

    UnhandledRejection {
        message: String,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "present_string"
        )]
        stack: Option<String>,
        #[serde(rename = "runId")]
        run_id: RunId,
    },

    #[serde(rename = "RUN")]
    RunRequest {
        code: String,
        #[serde(rename = "runId")]
        run_id: RunId,
    },

    #[serde(rename = "RESET")]
    ResetRequest,
}

/// An optional field that is present must hold a string; `null` is not absence.
fn present_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(Some)
}

impl Message {
    /// Run the message belongs to, for the message kinds that carry one.
    pub fn run_id(&self) -> Option<&RunId> {
        match self {
            Message::ConsoleEvent { run_id, .. }
            | Message::RuntimeError { run_id, .. }
            | Message::UnhandledRejection { run_id, .. }
            | Message::RunRequest { run_id, .. } => Some(run_id),
            Message::Ready | Message::ResetRequest => None,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Message::RunRequest { .. } | Message::ResetRequest => Direction::HostToRealm,
            _ => Direction::RealmToHost,
        }
    }

    /// Encode into the plain key/value shape sent over the boundary.
    pub fn to_wire(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

/// Validate a raw payload against the protocol.
///
/// Returns `None` for a wrong or missing tag, a missing required field, a
/// field of the wrong type, or any key the shape does not define.
pub fn parse_message(raw: &serde_json::Value) -> Option<Message> {
    if !raw.is_object() {
        return None;
    }
    let message = Message::deserialize(raw).ok()?;
    // Serde ignores unknown keys; the canonical encoding must match exactly.
    match message.to_wire() {
        Ok(canonical) if canonical == *raw => Some(message),
        _ => None,
    }
}
