use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info};

use docapproval_core::approvals::{
    ApprovalStateMachine, DecisionRequest, StartRequest, TransitionOutcome, TransitionPlan,
};
use docapproval_core::audit::{
    AuditCategory, AuditEvent, AuditOutcome, AuditSink, DECISION_RECORDED, OPERATION_REJECTED,
    PROCESS_FINALIZED, PROCESS_STARTED,
};
use docapproval_core::domain::approval::{Decision, ProcessId, UserId};
use docapproval_core::domain::document::DocumentId;
use docapproval_core::errors::{ApprovalError, DomainError, ErrorKind};
use docapproval_db::repositories::{ProcessQueries, ProcessStore, RepositoryError};

use crate::audit::TracingAuditSink;
use crate::retry::RetryPolicy;

/// Why one attempt of a mutating operation failed. Only store conflicts are
/// worth another attempt; a domain rejection is final.
#[derive(Debug)]
pub(crate) enum AttemptError {
    Rejected(DomainError),
    Store(RepositoryError),
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(error) if error.is_retryable())
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected(error) => write!(f, "{error}"),
            Self::Store(error) => write!(f, "{error}"),
        }
    }
}

impl From<DomainError> for AttemptError {
    fn from(error: DomainError) -> Self {
        Self::Rejected(error)
    }
}

impl From<RepositoryError> for AttemptError {
    fn from(error: RepositoryError) -> Self {
        Self::Store(error)
    }
}

pub(crate) fn store_error(error: RepositoryError) -> ApprovalError {
    match error {
        RepositoryError::UniqueViolation(message) => ApprovalError::Conflict(message),
        other => ApprovalError::StoreFailure(other.to_string()),
    }
}

/// Identities attached to the logs and audit events of one call.
#[derive(Clone, Copy)]
struct CallContext {
    operation: &'static str,
    process_id: Option<ProcessId>,
    document_id: Option<DocumentId>,
    actor: Option<UserId>,
}

impl CallContext {
    fn actor_label(&self) -> String {
        match self.actor {
            Some(user) => format!("user:{user}"),
            None => "engine".to_owned(),
        }
    }
}

struct DecisionCommitted {
    document_id: DocumentId,
    plan: TransitionPlan,
}

/// Runs start and decide transitions against a process store. Each call is
/// one store transaction, retried as a whole on store conflicts.
pub struct ApprovalEngine<S> {
    pub(crate) store: S,
    machine: ApprovalStateMachine,
    retry: RetryPolicy,
    pub(crate) audit: Arc<dyn AuditSink>,
}

impl<S> ApprovalEngine<S>
where
    S: ProcessStore + ProcessQueries,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            machine: ApprovalStateMachine,
            retry: RetryPolicy::default(),
            audit: Arc::new(TracingAuditSink),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Opens a review cycle for `document_id` with `reviewers` in the given
    /// order and moves the document under review.
    pub async fn start_process(
        &self,
        document_id: DocumentId,
        reviewers: &[UserId],
    ) -> Result<ProcessId, ApprovalError> {
        let context = CallContext {
            operation: "start_process",
            process_id: None,
            document_id: Some(document_id),
            actor: None,
        };
        let request = StartRequest::new(document_id, reviewers.to_vec())
            .map_err(|error| self.rejected(context, error))?;

        let request = &request;
        let result = self
            .retry
            .run(context.operation, AttemptError::is_retryable, move |_| self.try_start(request))
            .await;

        match result {
            Ok(process_id) => {
                info!(
                    event_name = PROCESS_STARTED,
                    process_id = process_id.0,
                    document_id = document_id.0,
                    reviewer_count = request.reviewers().len(),
                    "approval process started"
                );
                let reviewers = request
                    .reviewers()
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                self.audit.emit(
                    AuditEvent::new(
                        Some(process_id),
                        Some(document_id),
                        PROCESS_STARTED,
                        AuditCategory::Process,
                        context.actor_label(),
                        AuditOutcome::Success,
                    )
                    .with_metadata("reviewers", reviewers),
                );
                Ok(process_id)
            }
            Err(AttemptError::Rejected(error)) => Err(self.rejected(context, error)),
            Err(AttemptError::Store(error)) => Err(self.store_failed(context, error)),
        }
    }

    async fn try_start(&self, request: &StartRequest) -> Result<ProcessId, AttemptError> {
        let mut tx = self.store.begin().await?;
        let document = tx
            .lock_document(request.document_id())
            .await?
            .ok_or(DomainError::DocumentNotFound(request.document_id()))?;
        let active_process = tx.find_active_process(document.id).await?;

        let plan = self.machine.start(&document, active_process, request, Utc::now())?;
        let mut created = None;
        for write in &plan.writes {
            if let Some(process_id) = tx.apply(write).await? {
                created = Some(process_id);
            }
        }
        let process_id = created.ok_or_else(|| {
            DomainError::InvariantViolation(format!(
                "start plan for document {} created no process",
                document.id
            ))
        })?;

        tx.commit().await?;
        Ok(process_id)
    }

    /// Records `reviewer`'s decision and, when it was the last pending one,
    /// completes the process and settles the document in the same commit.
    pub async fn record_decision(
        &self,
        process_id: ProcessId,
        reviewer: UserId,
        decision: Decision,
        comment: Option<String>,
    ) -> Result<(), ApprovalError> {
        let context = CallContext {
            operation: "record_decision",
            process_id: Some(process_id),
            document_id: None,
            actor: Some(reviewer),
        };
        let request = DecisionRequest::new(process_id, reviewer, decision, comment)
            .map_err(|error| self.rejected(context, error))?;

        let request = &request;
        let result = self
            .retry
            .run(context.operation, AttemptError::is_retryable, move |_| self.try_decide(request))
            .await;

        let committed = match result {
            Ok(committed) => committed,
            Err(AttemptError::Rejected(error)) => return Err(self.rejected(context, error)),
            Err(AttemptError::Store(error)) => return Err(self.store_failed(context, error)),
        };
        let context = CallContext { document_id: Some(committed.document_id), ..context };

        let remaining = match committed.plan.outcome {
            TransitionOutcome::DecisionRecorded { remaining } => remaining,
            _ => 0,
        };
        info!(
            event_name = DECISION_RECORDED,
            process_id = process_id.0,
            document_id = committed.document_id.0,
            reviewer = reviewer.0,
            decision = ?decision,
            remaining,
            "approval decision recorded"
        );
        self.audit.emit(
            AuditEvent::new(
                Some(process_id),
                Some(committed.document_id),
                DECISION_RECORDED,
                AuditCategory::Decision,
                context.actor_label(),
                AuditOutcome::Success,
            )
            .with_metadata("decision", format!("{decision:?}"))
            .with_metadata("remaining", remaining.to_string()),
        );

        if let Some(disposition) = committed.plan.finalizes() {
            info!(
                event_name = PROCESS_FINALIZED,
                process_id = process_id.0,
                document_id = committed.document_id.0,
                disposition = ?disposition,
                "approval process finalized"
            );
            self.audit.emit(
                AuditEvent::new(
                    Some(process_id),
                    Some(committed.document_id),
                    PROCESS_FINALIZED,
                    AuditCategory::Finalization,
                    context.actor_label(),
                    AuditOutcome::Success,
                )
                .with_metadata("disposition", format!("{disposition:?}"))
                .with_metadata(
                    "document_status",
                    disposition.document_status().as_str().to_owned(),
                ),
            );
        }

        Ok(())
    }

    async fn try_decide(&self, request: &DecisionRequest) -> Result<DecisionCommitted, AttemptError> {
        let mut tx = self.store.begin().await?;
        let aggregate = tx
            .lock_process(request.process_id())
            .await?
            .ok_or(DomainError::ProcessNotFound(request.process_id()))?;

        let plan = self.machine.decide(&aggregate, request, Utc::now())?;
        for write in &plan.writes {
            tx.apply(write).await?;
        }

        tx.commit().await?;
        Ok(DecisionCommitted { document_id: aggregate.process.document_id, plan })
    }

    fn rejected(&self, context: CallContext, error: DomainError) -> ApprovalError {
        let error = ApprovalError::from(error);
        let kind = error.kind();
        let outcome = if kind == ErrorKind::StoreFailure {
            AuditOutcome::Failed
        } else {
            AuditOutcome::Rejected
        };
        if outcome == AuditOutcome::Failed {
            error!(
                event_name = OPERATION_REJECTED,
                operation = context.operation,
                process_id = context.process_id.map(|id| id.0),
                document_id = context.document_id.map(|id| id.0),
                error = %error,
                "approval invariant violated"
            );
        } else {
            debug!(
                event_name = OPERATION_REJECTED,
                operation = context.operation,
                process_id = context.process_id.map(|id| id.0),
                document_id = context.document_id.map(|id| id.0),
                kind = ?kind,
                error = %error,
                "approval operation rejected"
            );
        }

        self.emit_rejection(context, outcome, &error);
        error
    }

    fn store_failed(&self, context: CallContext, error: RepositoryError) -> ApprovalError {
        let error = store_error(error);
        match error {
            ApprovalError::Conflict(_) => {
                debug!(
                    event_name = OPERATION_REJECTED,
                    operation = context.operation,
                    process_id = context.process_id.map(|id| id.0),
                    document_id = context.document_id.map(|id| id.0),
                    error = %error,
                    "approval operation hit a uniqueness conflict"
                );
                self.emit_rejection(context, AuditOutcome::Rejected, &error);
            }
            _ => {
                error!(
                    event_name = OPERATION_REJECTED,
                    operation = context.operation,
                    process_id = context.process_id.map(|id| id.0),
                    document_id = context.document_id.map(|id| id.0),
                    error = %error,
                    "approval store failure"
                );
                self.emit_rejection(context, AuditOutcome::Failed, &error);
            }
        }
        error
    }

    fn emit_rejection(&self, context: CallContext, outcome: AuditOutcome, error: &ApprovalError) {
        let category = match context.operation {
            "record_decision" => AuditCategory::Decision,
            _ => AuditCategory::Process,
        };
        self.audit.emit(
            AuditEvent::new(
                context.process_id,
                context.document_id,
                OPERATION_REJECTED,
                category,
                context.actor_label(),
                outcome,
            )
            .with_metadata("operation", context.operation)
            .with_metadata("kind", format!("{:?}", error.kind()))
            .with_metadata("reason", error.to_string()),
        );
    }
}
