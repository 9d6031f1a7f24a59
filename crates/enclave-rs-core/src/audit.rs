//! Audit event construction and emission.

use enclave_rs_protocol::{ActorType, AuditEvent, EventType, Sandbox};
use log::info;
use serde::{Deserialize, Serialize};

/// Principal responsible for an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub name: String,
    pub kind: ActorType,
}

impl Actor {
    pub fn new(name: impl Into<String>, kind: ActorType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn user(name: impl Into<String>) -> Self {
        Self::new(name, ActorType::User)
    }

    pub fn gc(name: impl Into<String>) -> Self {
        Self::new(name, ActorType::Gc)
    }

    pub fn system() -> Self {
        Self::new("enclave", ActorType::System)
    }
}

/// Event about `sandbox` attributed to `actor`.
pub(crate) fn sandbox_event(event_type: EventType, sandbox: &Sandbox, actor: &Actor) -> AuditEvent {
    AuditEvent::new(event_type, actor.name.clone(), actor.kind).for_sandbox(sandbox.id)
}

/// Mirror a committed event into the log stream.
pub(crate) fn announce(event: &AuditEvent) {
    match event.sandbox_id {
        Some(sandbox_id) => info!(
            "audit (event={}, sandbox_id={sandbox_id}, actor={}, actor_type={})",
            event.event_type,
            event.actor,
            event.actor_type.as_str()
        ),
        None => info!(
            "audit (event={}, actor={}, actor_type={})",
            event.event_type,
            event.actor,
            event.actor_type.as_str()
        ),
    }
}
