//! Structured domain events for the audit/observability collaborator.
//!
//! The sync core never persists audit records itself; it hands each event to
//! an [`EventSink`]. [`TracingEventSink`] is the production sink.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::models::{ObjectType, SyncDirection};

/// Target used for every record written by [`TracingEventSink`].
pub const EVENT_TARGET: &str = "crm_sync::events";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    JobStarted {
        tenant_id: Uuid,
        object_type: ObjectType,
        job_id: Uuid,
        direction: SyncDirection,
    },
    JobCompleted {
        tenant_id: Uuid,
        object_type: ObjectType,
        job_id: Uuid,
        processed: i32,
        succeeded: i32,
        failed: i32,
    },
    JobFailed {
        tenant_id: Uuid,
        object_type: ObjectType,
        job_id: Uuid,
        error_code: String,
        message: String,
    },
    JobPaused {
        tenant_id: Uuid,
        object_type: ObjectType,
        job_id: Uuid,
        reason: String,
        resume_job_id: Option<Uuid>,
    },
    MappingCreated {
        tenant_id: Uuid,
        object_type: ObjectType,
        local_id: String,
        external_id: String,
    },
    ErrorRecorded {
        tenant_id: Uuid,
        object_type: ObjectType,
        error_id: Uuid,
        job_id: Option<Uuid>,
        error_code: String,
        dead_letter: bool,
    },
    RetryExhausted {
        tenant_id: Uuid,
        object_type: ObjectType,
        error_id: Uuid,
        retry_count: i32,
    },
    ConnectionDeactivated {
        tenant_id: Uuid,
        connection_id: Uuid,
        reason: String,
    },
}

impl SyncEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::JobStarted { .. } => "job_started",
            SyncEvent::JobCompleted { .. } => "job_completed",
            SyncEvent::JobFailed { .. } => "job_failed",
            SyncEvent::JobPaused { .. } => "job_paused",
            SyncEvent::MappingCreated { .. } => "mapping_created",
            SyncEvent::ErrorRecorded { .. } => "error_recorded",
            SyncEvent::RetryExhausted { .. } => "retry_exhausted",
            SyncEvent::ConnectionDeactivated { .. } => "connection_deactivated",
        }
    }

    pub fn tenant_id(&self) -> Uuid {
        match self {
            SyncEvent::JobStarted { tenant_id, .. }
            | SyncEvent::JobCompleted { tenant_id, .. }
            | SyncEvent::JobFailed { tenant_id, .. }
            | SyncEvent::JobPaused { tenant_id, .. }
            | SyncEvent::MappingCreated { tenant_id, .. }
            | SyncEvent::ErrorRecorded { tenant_id, .. }
            | SyncEvent::RetryExhausted { tenant_id, .. }
            | SyncEvent::ConnectionDeactivated { tenant_id, .. } => *tenant_id,
        }
    }
}

/// Receiver of domain events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SyncEvent);
}

pub type SharedEventSink = Arc<dyn EventSink>;

/// Writes each event as one structured `tracing` record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: SyncEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        match &event {
            SyncEvent::JobFailed { .. }
            | SyncEvent::RetryExhausted { .. }
            | SyncEvent::ConnectionDeactivated { .. } => tracing::warn!(
                target: EVENT_TARGET,
                event = event.kind(),
                tenant_id = %event.tenant_id(),
                payload = %payload,
                "sync event"
            ),
            _ => tracing::info!(
                target: EVENT_TARGET,
                event = event.kind(),
                tenant_id = %event.tenant_id(),
                payload = %payload,
                "sync event"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_tag() {
        let event = SyncEvent::MappingCreated {
            tenant_id: Uuid::nil(),
            object_type: ObjectType::Contact,
            local_id: "lead-1".into(),
            external_id: "hs-1".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "mapping_created");
        assert_eq!(json["object_type"], "contact");
        assert_eq!(event.kind(), "mapping_created");
    }
}
