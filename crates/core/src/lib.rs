pub mod approvals;
pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;

pub use approvals::{
    ApprovalStateMachine, DecisionRequest, ProcessWrite, StartRequest, TransitionOutcome,
    TransitionPlan,
};
pub use audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink};
pub use domain::approval::{
    ApprovalProcess, ApprovalProcessView, Approver, ApproverId, ApproverStatus, Decision,
    Disposition, ProcessAggregate, ProcessId, ProcessStatus, ProcessSummary, ReviewerFilter,
    UserId,
};
pub use domain::document::{Document, DocumentId, DocumentStatus, DocumentSummary};
pub use errors::{ApprovalError, DomainError, ErrorKind};
