//! Wire envelopes for the host bridge.
//!
//! A host sends `CommandEnvelope`s and gets exactly one `ResponseEnvelope`
//! back per request id. Session output arrives separately as
//! `EventEnvelope`s. All three carry the contract version `v`.

use crate::pipeline::messages::{ClientEvent, ClientPayload};
use serde::{Deserialize, Serialize};

pub const EVENT_VERSION: u32 = 1;

/// Commands a host may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandName {
    #[serde(rename = "host.ping")]
    HostPing,
    #[serde(rename = "session.open")]
    SessionOpen,
    #[serde(rename = "session.text")]
    SessionText,
    #[serde(rename = "session.push_to_talk")]
    SessionPushToTalk,
    #[serde(rename = "session.close")]
    SessionClose,
    #[serde(rename = "session.context")]
    SessionContext,
    #[serde(rename = "session.history")]
    SessionHistory,
    #[serde(rename = "skills.list")]
    SkillsList,
    #[serde(rename = "runtime.stop")]
    RuntimeStop,
}

impl CommandName {
    /// Wire name, identical to the serde rename.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HostPing => "host.ping",
            Self::SessionOpen => "session.open",
            Self::SessionText => "session.text",
            Self::SessionPushToTalk => "session.push_to_talk",
            Self::SessionClose => "session.close",
            Self::SessionContext => "session.context",
            Self::SessionHistory => "session.history",
            Self::SkillsList => "skills.list",
            Self::RuntimeStop => "runtime.stop",
        }
    }

    /// Commands that address an existing session by `channel`.
    #[must_use]
    pub fn needs_channel(self) -> bool {
        !matches!(self, Self::HostPing | Self::SkillsList | Self::RuntimeStop)
    }
}

/// The answer to one command, matched by `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub v: u32,
    pub request_id: String,
    pub ok: bool,
    pub payload: serde_json::Value,
    pub error: Option<String>,
}

impl ResponseEnvelope {
    #[must_use]
    pub fn ok(request_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            ok: true,
            payload,
            error: None,
        }
    }

    #[must_use]
    pub fn error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            ok: false,
            payload: serde_json::Value::Null,
            error: Some(message.into()),
        }
    }
}

/// One request from the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub v: u32,
    pub request_id: String,
    pub command: CommandName,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CommandEnvelope {
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        command: CommandName,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            command,
            payload,
        }
    }

    /// Check the version, the request id and, for session commands, the
    /// `channel` field.
    ///
    /// # Errors
    ///
    /// A `ContractError` describing the first problem found.
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.v != EVENT_VERSION {
            return Err(ContractError::new(
                ContractErrorKind::UnsupportedVersion,
                format!(
                    "unsupported contract version {}; expected {}",
                    self.v, EVENT_VERSION
                ),
            ));
        }
        if self.request_id.trim().is_empty() {
            return Err(ContractError::new(
                ContractErrorKind::InvalidEnvelope,
                "request_id cannot be empty".to_owned(),
            ));
        }
        if self.command.needs_channel() {
            self.channel()?;
        }
        Ok(())
    }

    /// The `channel` payload field, required by session commands.
    pub fn channel(&self) -> Result<&str, ContractError> {
        self.str_field("channel")
    }

    /// A non-empty string payload field.
    pub fn str_field(&self, field: &str) -> Result<&str, ContractError> {
        match self.payload.get(field).and_then(serde_json::Value::as_str) {
            Some(value) if !value.trim().is_empty() => Ok(value),
            Some(_) => Err(ContractError::new(
                ContractErrorKind::InvalidPayload,
                format!("{}: `{field}` cannot be empty", self.command.as_str()),
            )),
            None => Err(ContractError::new(
                ContractErrorKind::InvalidPayload,
                format!("{}: missing string field `{field}`", self.command.as_str()),
            )),
        }
    }
}

/// Session output pushed to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub v: u32,
    pub event_id: String,
    pub event: String,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    #[must_use]
    pub fn new(
        event_id: impl Into<String>,
        event: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: EVENT_VERSION,
            event_id: event_id.into(),
            event: event.into(),
            payload,
        }
    }

    /// Render a client event for a text host.
    ///
    /// Audio frames are summarised by sample count; the event id is
    /// `<session>:<seq>` so hosts can de-duplicate.
    #[must_use]
    pub fn from_client_event(channel: &str, event: &ClientEvent) -> Self {
        let body = match &event.payload {
            ClientPayload::SessionStarted | ClientPayload::ResponseAudioEnd => {
                serde_json::json!({})
            }
            ClientPayload::StateChanged { state } => serde_json::json!({ "state": state }),
            ClientPayload::PartialTranscript { text } | ClientPayload::FinalTranscript { text } => {
                serde_json::json!({ "text": text })
            }
            ClientPayload::ResponseText { text, kind } => {
                serde_json::json!({ "text": text, "kind": kind })
            }
            ClientPayload::ResponseAudio(frame) => serde_json::json!({
                "frame_seq": frame.seq,
                "samples": frame.samples.len(),
                "sample_rate": frame.sample_rate,
            }),
            ClientPayload::BargeIn { cancelled } => serde_json::json!({ "cancelled": cancelled }),
            ClientPayload::SkillUpdate { skill, text } => {
                serde_json::json!({ "skill": skill, "text": text })
            }
            ClientPayload::SessionClosed { reason } => serde_json::json!({ "reason": reason }),
        };
        Self::new(
            format!("{}:{}", event.session_id, event.seq),
            event.payload.name(),
            serde_json::json!({
                "channel": channel,
                "session_id": event.session_id,
                "turn_id": event.turn_id,
                "seq": event.seq,
                "body": body,
            }),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractErrorKind {
    UnsupportedVersion,
    InvalidEnvelope,
    InvalidPayload,
}

/// An envelope the bridge refuses to route.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ContractError {
    pub kind: ContractErrorKind,
    pub message: String,
}

impl ContractError {
    #[must_use]
    pub fn new(kind: ContractErrorKind, message: String) -> Self {
        Self { kind, message }
    }
}
