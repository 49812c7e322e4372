//! Commands and the queue entries that carry them to the executor.
//!
//! A command is a closed enum: anything a caller asks for is parsed into
//! `Command` up front, so an unknown command name is rejected instead of being
//! queued and silently ignored downstream.

use std::fmt;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use strum::AsRefStr;
use strum::Display;
use strum::EnumString;

use super::device::Brightness;
use super::device::Device;
use super::device::EntryId;
use super::device::PowerState;

/// An actuation request for a single property of a device.
///
/// Serializes as `{"name": "turn", "value": "on"}` or
/// `{"name": "brightness", "value": 50}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "value", rename_all = "lowercase")]
pub enum Command {
    Turn(PowerState),
    Brightness(Brightness),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandParseError {
    #[error("unknown command '{0}', expected 'turn' or 'brightness'")]
    UnknownCommand(String),

    #[error("invalid value for '{command}': {reason}")]
    InvalidValue {
        command: &'static str,
        reason: String,
    },
}

impl Command {
    /// Parse a caller-supplied `{command, value}` pair.
    ///
    /// `turn` takes "on"/"off" (or a boolean); `brightness` takes an integer, as a
    /// number or a numeric string, clamped into 0-100.
    pub fn parse(name: &str, value: &serde_json::Value) -> Result<Self, CommandParseError> {
        match name {
            "turn" => {
                let power = match value {
                    serde_json::Value::String(s) => s.trim().parse::<PowerState>().map_err(|_| {
                        CommandParseError::InvalidValue {
                            command: "turn",
                            reason: format!("'{}' is not 'on' or 'off'", s),
                        }
                    })?,
                    serde_json::Value::Bool(b) => PowerState::from(*b),
                    other => {
                        return Err(CommandParseError::InvalidValue {
                            command: "turn",
                            reason: format!("expected a power state, got {}", other),
                        });
                    }
                };
                Ok(Command::Turn(power))
            }
            "brightness" => {
                let level = match value {
                    serde_json::Value::Number(n) => n.as_i64(),
                    serde_json::Value::String(s) => s.trim().parse::<i64>().ok(),
                    _ => None,
                }
                .ok_or_else(|| CommandParseError::InvalidValue {
                    command: "brightness",
                    reason: format!("expected an integer, got {}", value),
                })?;
                Ok(Command::Brightness(Brightness::saturating(level)))
            }
            other => Err(CommandParseError::UnknownCommand(other.to_string())),
        }
    }

    /// Name of the property this command drives.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Turn(_) => "turn",
            Command::Brightness(_) => "brightness",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Turn(power) => write!(f, "turn {}", power),
            Command::Brightness(level) => write!(f, "brightness {}", level),
        }
    }
}

/// Lifecycle of a queue entry.
///
/// ```text
/// pending -> processing -> done
///    |            |
///    +------------+-----> failed
/// ```
///
/// Only the executor moves entries along; `done` and `failed` are terminal.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl CommandStatus {
    /// Statuses that count as an in-flight command for the pending guard.
    pub const OUTSTANDING: [CommandStatus; 2] = [CommandStatus::Pending, CommandStatus::Processing];

    pub fn is_outstanding(self) -> bool {
        Self::OUTSTANDING.contains(&self)
    }

    pub fn can_transition_to(self, next: CommandStatus) -> bool {
        use CommandStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Processing, Done) | (Pending, Failed) | (Processing, Failed)
        )
    }
}

/// A command waiting for (or handled by) the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandQueueEntry {
    pub id: EntryId,
    pub device: String,
    pub model: String,
    pub brand: String,
    pub command: Command,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
}

/// A command about to be enqueued. The store assigns the id, status and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCommand {
    pub device: String,
    pub model: String,
    pub brand: String,
    pub command: Command,
}

impl NewCommand {
    pub fn for_device(device: &Device, command: Command) -> Self {
        Self {
            device: device.id.clone(),
            model: device.model.clone(),
            brand: device.brand.clone(),
            command,
        }
    }
}
