use docapproval_core::audit::{AuditEvent, AuditOutcome, AuditSink};
use tracing::{debug, info, warn};

/// Default sink: every audit event becomes one structured `tracing` event.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        let process_id = event.process_id.map(|id| id.0);
        let document_id = event.document_id.map(|id| id.0);
        let metadata = format!("{:?}", event.metadata);

        match event.outcome {
            AuditOutcome::Success => info!(
                event_name = %event.event_type,
                audit_event_id = %event.event_id,
                category = ?event.category,
                actor = %event.actor,
                process_id,
                document_id,
                metadata = %metadata,
                "audit event"
            ),
            AuditOutcome::Rejected => debug!(
                event_name = %event.event_type,
                audit_event_id = %event.event_id,
                category = ?event.category,
                outcome = "rejected",
                actor = %event.actor,
                process_id,
                document_id,
                metadata = %metadata,
                "audit event"
            ),
            AuditOutcome::Failed => warn!(
                event_name = %event.event_type,
                audit_event_id = %event.event_id,
                category = ?event.category,
                outcome = "failed",
                actor = %event.actor,
                process_id,
                document_id,
                metadata = %metadata,
                "audit event"
            ),
        }
    }
}
