use thiserror::Error;

use crate::domain::approval::{ApproverStatus, ProcessId, UserId};
use crate::domain::document::{DocumentId, DocumentStatus};

/// Rejections produced by the approval state machine. Nothing has been
/// written when one of these is returned.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("an approval process needs at least one reviewer")]
    EmptyReviewerSet,
    #[error("reviewers must be distinct, duplicated: {duplicates:?}")]
    DuplicateReviewers { duplicates: Vec<UserId> },
    #[error("comment exceeds {max_chars} characters")]
    CommentTooLong { max_chars: usize },
    #[error("document {0} does not exist")]
    DocumentNotFound(DocumentId),
    #[error("approval process {0} does not exist")]
    ProcessNotFound(ProcessId),
    #[error("reviewer {reviewer} is not assigned to approval process {process_id}")]
    ReviewerNotAssigned { process_id: ProcessId, reviewer: UserId },
    #[error("document {document_id} already has approval process {process_id} in progress")]
    ActiveProcessExists { document_id: DocumentId, process_id: ProcessId },
    #[error("approval process {0} is already completed")]
    ProcessCompleted(ProcessId),
    #[error("reviewer {reviewer} already decided on process {process_id} ({status:?})")]
    AlreadyDecided { process_id: ProcessId, reviewer: UserId, status: ApproverStatus },
    #[error("invalid document transition from {from:?} to {to:?}")]
    InvalidDocumentTransition { from: DocumentStatus, to: DocumentStatus },
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

impl DomainError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyReviewerSet
            | Self::DuplicateReviewers { .. }
            | Self::CommentTooLong { .. } => ErrorKind::InvalidInput,
            Self::DocumentNotFound(_)
            | Self::ProcessNotFound(_)
            | Self::ReviewerNotAssigned { .. } => ErrorKind::NotFound,
            Self::ActiveProcessExists { .. }
            | Self::ProcessCompleted(_)
            | Self::AlreadyDecided { .. }
            | Self::InvalidDocumentTransition { .. } => ErrorKind::Conflict,
            Self::InvariantViolation(_) => ErrorKind::StoreFailure,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Conflict,
    StoreFailure,
}

/// The only error type callers of the approval engine ever see.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store failure: {0}")]
    StoreFailure(String),
}

impl ApprovalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::StoreFailure(_) => ErrorKind::StoreFailure,
        }
    }
}

impl From<DomainError> for ApprovalError {
    fn from(value: DomainError) -> Self {
        let message = value.to_string();
        match value.kind() {
            ErrorKind::InvalidInput => Self::InvalidInput(message),
            ErrorKind::NotFound => Self::NotFound(message),
            ErrorKind::Conflict => Self::Conflict(message),
            ErrorKind::StoreFailure => Self::StoreFailure(message),
        }
    }
}
