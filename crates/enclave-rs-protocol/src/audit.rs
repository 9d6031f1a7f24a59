//! Audit event schema.

use crate::SandboxId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Closed vocabulary of audit event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "sandbox.created")]
    SandboxCreated,
    #[serde(rename = "sandbox.mounted")]
    SandboxMounted,
    #[serde(rename = "sandbox.stopped")]
    SandboxStopped,
    #[serde(rename = "sandbox.approved")]
    SandboxApproved,
    #[serde(rename = "sandbox.rejected")]
    SandboxRejected,
    #[serde(rename = "sandbox.error")]
    SandboxError,
    #[serde(rename = "sandbox.gc_collected")]
    SandboxGcCollected,
    #[serde(rename = "driver.error")]
    DriverError,
    #[serde(rename = "policy.passed")]
    PolicyPassed,
    #[serde(rename = "policy.failed")]
    PolicyFailed,
}

impl EventType {
    /// Every event type in the vocabulary.
    pub const ALL: [EventType; 10] = [
        EventType::SandboxCreated,
        EventType::SandboxMounted,
        EventType::SandboxStopped,
        EventType::SandboxApproved,
        EventType::SandboxRejected,
        EventType::SandboxError,
        EventType::SandboxGcCollected,
        EventType::DriverError,
        EventType::PolicyPassed,
        EventType::PolicyFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::SandboxCreated => "sandbox.created",
            EventType::SandboxMounted => "sandbox.mounted",
            EventType::SandboxStopped => "sandbox.stopped",
            EventType::SandboxApproved => "sandbox.approved",
            EventType::SandboxRejected => "sandbox.rejected",
            EventType::SandboxError => "sandbox.error",
            EventType::SandboxGcCollected => "sandbox.gc_collected",
            EventType::DriverError => "driver.error",
            EventType::PolicyPassed => "policy.passed",
            EventType::PolicyFailed => "policy.failed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|event| event.as_str() == value)
            .ok_or_else(|| format!("unknown event type: {value}"))
    }
}

/// Kind of principal responsible for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    #[default]
    User,
    Agent,
    Gc,
    System,
}

impl ActorType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActorType::User => "user",
            ActorType::Agent => "agent",
            ActorType::Gc => "gc",
            ActorType::System => "system",
        }
    }
}

impl FromStr for ActorType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(ActorType::User),
            "agent" => Ok(ActorType::Agent),
            "gc" => Ok(ActorType::Gc),
            "system" => Ok(ActorType::System),
            other => Err(format!("unknown actor type: {other}")),
        }
    }
}

/// Append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    /// Absent for fleet-wide events.
    #[serde(default)]
    pub sandbox_id: Option<SandboxId>,
    pub event_type: EventType,
    pub actor: String,
    pub actor_type: ActorType,
    #[serde(default)]
    pub details: Map<String, Value>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEvent {
    /// Start a new event stamped with the current time.
    pub fn new(event_type: EventType, actor: impl Into<String>, actor_type: ActorType) -> Self {
        Self {
            id: Uuid::new_v4(),
            sandbox_id: None,
            event_type,
            actor: actor.into(),
            actor_type,
            details: Map::new(),
            recorded_at: Utc::now(),
        }
    }

    /// Attach the sandbox this event describes.
    pub fn for_sandbox(mut self, sandbox_id: SandboxId) -> Self {
        self.sandbox_id = Some(sandbox_id);
        self
    }

    /// Add a detail entry.
    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}
