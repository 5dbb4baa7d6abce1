use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::approval::{ApproverId, ApproverStatus, Disposition, ProcessId, UserId};
use crate::domain::document::{DocumentId, DocumentStatus};

/// A single store mutation requested by the state machine. A plan's writes
/// are applied in order inside one transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessWrite {
    CreateProcess { document_id: DocumentId, reviewers: Vec<UserId>, created_at: DateTime<Utc> },
    RecordDecision {
        approver_id: ApproverId,
        status: ApproverStatus,
        comment: Option<String>,
        decided_at: DateTime<Utc>,
    },
    CompleteProcess { process_id: ProcessId, completed_at: DateTime<Utc> },
    SetDocumentStatus { document_id: DocumentId, status: DocumentStatus },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionOutcome {
    Started { reviewer_count: usize },
    DecisionRecorded { remaining: usize },
    Finalized { disposition: Disposition },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionPlan {
    pub writes: Vec<ProcessWrite>,
    pub outcome: TransitionOutcome,
}

impl TransitionPlan {
    pub fn finalizes(&self) -> Option<Disposition> {
        match self.outcome {
            TransitionOutcome::Finalized { disposition } => Some(disposition),
            _ => None,
        }
    }
}
