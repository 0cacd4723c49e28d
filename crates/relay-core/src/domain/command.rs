//! Command record and its status state machine.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::envelope::{Metadata, Payload};
use super::errors::FailureReason;
use super::ids::CommandId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandType(String);

impl CommandType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for CommandType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Command status.
///
/// State transitions:
/// - Pending -> Processing -> Completed
/// - Pending -> Processing -> Failed
/// - Pending -> Failed (no processor registered; fails fast at dispatch)
///
/// Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Failed)
    }

    pub fn can_transition_to(self, next: CommandStatus) -> bool {
        use CommandStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Pending, Failed) | (Processing, Completed) | (Processing, Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal command transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: CommandStatus,
    pub to: CommandStatus,
}

/// Tracked lifecycle state of one submitted command.
///
/// Only the dispatcher mutates a record; callers get clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command_id: CommandId,
    pub command_type: CommandType,
    pub parameters: Payload,
    #[serde(default)]
    pub metadata: Metadata,
    pub status: CommandStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureReason>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CommandRecord {
    pub fn new(
        command_id: CommandId,
        command_type: CommandType,
        parameters: Payload,
        metadata: Metadata,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            command_id,
            command_type,
            parameters,
            metadata,
            status: CommandStatus::Pending,
            processor: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, to: CommandStatus, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(to) {
            return Err(InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Pending -> Processing, bound to `processor`.
    pub fn start(&mut self, processor: &str, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(CommandStatus::Processing, now)?;
        self.processor = Some(processor.to_string());
        Ok(())
    }

    pub fn complete(&mut self, result: Value, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(CommandStatus::Completed, now)?;
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, error: FailureReason, now: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(CommandStatus::Failed, now)?;
        self.error = Some(error);
        Ok(())
    }
}
