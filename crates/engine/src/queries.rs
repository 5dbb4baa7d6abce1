use tracing::error;

use docapproval_core::approvals::verify_view;
use docapproval_core::domain::approval::{
    ApprovalProcessView, ProcessId, ProcessStatus, ProcessSummary, ReviewerFilter, UserId,
};
use docapproval_core::domain::document::DocumentId;
use docapproval_core::errors::{ApprovalError, DomainError};
use docapproval_db::repositories::{ProcessQueries, ProcessStore, RepositoryError};

use crate::engine::{store_error, ApprovalEngine};

/// Read side of the engine. Every call reads one committed snapshot and
/// refuses to hand out a view that breaks the aggregate invariants.
impl<S> ApprovalEngine<S>
where
    S: ProcessStore + ProcessQueries,
{
    pub async fn get_process(
        &self,
        process_id: ProcessId,
    ) -> Result<ApprovalProcessView, ApprovalError> {
        let view = self
            .store
            .find_process_view(process_id)
            .await
            .map_err(|error| read_failed("get_process", error))?
            .ok_or(DomainError::ProcessNotFound(process_id))?;

        checked(view)
    }

    pub async fn list_processes(&self) -> Result<Vec<ProcessSummary>, ApprovalError> {
        let summaries = self
            .store
            .list_processes()
            .await
            .map_err(|error| read_failed("list_processes", error))?;

        summaries.into_iter().map(checked_summary).collect()
    }

    pub async fn list_for_reviewer(
        &self,
        reviewer: UserId,
        filter: ReviewerFilter,
    ) -> Result<Vec<ApprovalProcessView>, ApprovalError> {
        let views = self
            .store
            .list_for_reviewer(reviewer, filter)
            .await
            .map_err(|error| read_failed("list_for_reviewer", error))?;

        views.into_iter().map(checked).collect()
    }

    /// Every review cycle a document has gone through, newest first.
    pub async fn list_for_document(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<ProcessSummary>, ApprovalError> {
        let summaries = self
            .store
            .list_for_document(document_id)
            .await
            .map_err(|error| read_failed("list_for_document", error))?;

        summaries.into_iter().map(checked_summary).collect()
    }
}

fn checked(view: ApprovalProcessView) -> Result<ApprovalProcessView, ApprovalError> {
    verify_view(&view).map_err(|violation| {
        error!(
            event_name = "approval.read_invariant_violated",
            process_id = view.process.id.0,
            error = %violation,
            "stored approval process violates invariants"
        );
        ApprovalError::from(violation)
    })?;
    Ok(view)
}

fn checked_summary(summary: ProcessSummary) -> Result<ProcessSummary, ApprovalError> {
    let completed = summary.process.status == ProcessStatus::Completed;
    if summary.approver_count == 0 || completed == (summary.pending_count > 0) {
        let violation = DomainError::InvariantViolation(format!(
            "approval process {} is {:?} with {} of {} approvers pending",
            summary.process.id,
            summary.process.status,
            summary.pending_count,
            summary.approver_count
        ));
        error!(
            event_name = "approval.read_invariant_violated",
            process_id = summary.process.id.0,
            error = %violation,
            "stored approval process violates invariants"
        );
        return Err(violation.into());
    }
    Ok(summary)
}

fn read_failed(operation: &'static str, error: RepositoryError) -> ApprovalError {
    error!(event_name = "approval.read_failed", operation, error = %error, "approval read failed");
    store_error(error)
}
