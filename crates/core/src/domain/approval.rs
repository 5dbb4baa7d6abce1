use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::document::{DocumentId, DocumentStatus, DocumentSummary};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(pub i64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApproverId(pub i64);

impl fmt::Display for ApproverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque reviewer identity supplied by the caller. The engine never checks
/// that it names a real account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    InProgress,
    Completed,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproverStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApproverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn from_approved(approved: bool) -> Self {
        if approved {
            Self::Approve
        } else {
            Self::Reject
        }
    }

    pub fn approver_status(&self) -> ApproverStatus {
        match self {
            Self::Approve => ApproverStatus::Approved,
            Self::Reject => ApproverStatus::Rejected,
        }
    }
}

impl From<bool> for Decision {
    fn from(approved: bool) -> Self {
        Self::from_approved(approved)
    }
}

/// Aggregate outcome of a completed process under the unanimity rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Approved,
    Rejected,
}

impl Disposition {
    pub fn document_status(&self) -> DocumentStatus {
        match self {
            Self::Approved => DocumentStatus::Approved,
            Self::Rejected => DocumentStatus::Rejected,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalProcess {
    pub id: ProcessId,
    pub document_id: DocumentId,
    pub status: ProcessStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approver {
    pub id: ApproverId,
    pub process_id: ProcessId,
    pub user_id: UserId,
    /// Zero-based position in the reviewer list given at start.
    pub position: u32,
    pub status: ApproverStatus,
    pub comment: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// Everything a decision needs to see, loaded under the process lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessAggregate {
    pub process: ApprovalProcess,
    pub document_status: DocumentStatus,
    pub approvers: Vec<Approver>,
}

impl ProcessAggregate {
    pub fn approver_for(&self, user_id: UserId) -> Option<&Approver> {
        self.approvers.iter().find(|approver| approver.user_id == user_id)
    }

    pub fn pending_count(&self) -> usize {
        self.approvers.iter().filter(|approver| approver.status.is_pending()).count()
    }
}

/// Process detail with document summary and the roster in assignment order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalProcessView {
    pub process: ApprovalProcess,
    pub document: DocumentSummary,
    pub approvers: Vec<Approver>,
}

impl ApprovalProcessView {
    pub fn pending_count(&self) -> usize {
        self.approvers.iter().filter(|approver| approver.status.is_pending()).count()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSummary {
    pub process: ApprovalProcess,
    pub document: DocumentSummary,
    pub approver_count: u32,
    pub pending_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewerFilter {
    Pending,
    Decided,
}

impl ReviewerFilter {
    pub fn matches(&self, status: ApproverStatus) -> bool {
        match self {
            Self::Pending => status.is_pending(),
            Self::Decided => !status.is_pending(),
        }
    }
}
