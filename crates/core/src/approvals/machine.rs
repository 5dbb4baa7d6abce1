use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::approvals::plan::{ProcessWrite, TransitionOutcome, TransitionPlan};
use crate::domain::approval::{
    ApprovalProcessView, ApproverStatus, Decision, Disposition, ProcessAggregate, ProcessId,
    ProcessStatus, UserId,
};
use crate::domain::document::{Document, DocumentId, DocumentStatus};
use crate::errors::DomainError;

pub const MAX_COMMENT_CHARS: usize = 4_000;

/// Validated input for starting a process. Reviewer order is preserved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartRequest {
    document_id: DocumentId,
    reviewers: Vec<UserId>,
}

impl StartRequest {
    /// Duplicate reviewers are rejected, never collapsed into one assignment.
    pub fn new(document_id: DocumentId, reviewers: Vec<UserId>) -> Result<Self, DomainError> {
        if reviewers.is_empty() {
            return Err(DomainError::EmptyReviewerSet);
        }

        let mut seen = HashSet::with_capacity(reviewers.len());
        let mut duplicates = Vec::new();
        for reviewer in &reviewers {
            if !seen.insert(*reviewer) && !duplicates.contains(reviewer) {
                duplicates.push(*reviewer);
            }
        }
        if !duplicates.is_empty() {
            return Err(DomainError::DuplicateReviewers { duplicates });
        }

        Ok(Self { document_id, reviewers })
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn reviewers(&self) -> &[UserId] {
        &self.reviewers
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecisionRequest {
    process_id: ProcessId,
    reviewer: UserId,
    decision: Decision,
    comment: Option<String>,
}

impl DecisionRequest {
    pub fn new(
        process_id: ProcessId,
        reviewer: UserId,
        decision: Decision,
        comment: Option<String>,
    ) -> Result<Self, DomainError> {
        let comment = comment.map(|value| value.trim().to_owned()).filter(|value| !value.is_empty());
        if comment.as_ref().is_some_and(|value| value.chars().count() > MAX_COMMENT_CHARS) {
            return Err(DomainError::CommentTooLong { max_chars: MAX_COMMENT_CHARS });
        }

        Ok(Self { process_id, reviewer, decision, comment })
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn reviewer(&self) -> UserId {
        self.reviewer
    }

    pub fn decision(&self) -> Decision {
        self.decision
    }

    pub fn comment(&self) -> Option<&str> {
        self.comment.as_deref()
    }
}

/// Pure transition logic for an approval process aggregate. It never touches
/// the store; callers load the aggregate under a lock, ask for a plan, and
/// apply the plan's writes in the same transaction.
#[derive(Clone, Debug, Default)]
pub struct ApprovalStateMachine;

impl ApprovalStateMachine {
    pub fn start(
        &self,
        document: &Document,
        active_process: Option<ProcessId>,
        request: &StartRequest,
        now: DateTime<Utc>,
    ) -> Result<TransitionPlan, DomainError> {
        if document.id != request.document_id {
            return Err(DomainError::InvariantViolation(format!(
                "loaded document {} for a start request on document {}",
                document.id, request.document_id
            )));
        }

        if let Some(process_id) = active_process {
            return Err(DomainError::ActiveProcessExists { document_id: document.id, process_id });
        }

        if !document.status.can_transition_to(DocumentStatus::UnderReview) {
            return Err(DomainError::InvalidDocumentTransition {
                from: document.status,
                to: DocumentStatus::UnderReview,
            });
        }

        Ok(TransitionPlan {
            writes: vec![
                ProcessWrite::CreateProcess {
                    document_id: document.id,
                    reviewers: request.reviewers.clone(),
                    created_at: now,
                },
                ProcessWrite::SetDocumentStatus {
                    document_id: document.id,
                    status: DocumentStatus::UnderReview,
                },
            ],
            outcome: TransitionOutcome::Started { reviewer_count: request.reviewers.len() },
        })
    }

    pub fn decide(
        &self,
        aggregate: &ProcessAggregate,
        request: &DecisionRequest,
        now: DateTime<Utc>,
    ) -> Result<TransitionPlan, DomainError> {
        let process = &aggregate.process;
        if process.id != request.process_id {
            return Err(DomainError::InvariantViolation(format!(
                "loaded process {} for a decision on process {}",
                process.id, request.process_id
            )));
        }
        if aggregate.approvers.is_empty() {
            return Err(DomainError::InvariantViolation(format!(
                "approval process {} has no approvers",
                process.id
            )));
        }

        if process.status == ProcessStatus::Completed {
            return Err(DomainError::ProcessCompleted(process.id));
        }

        let approver = aggregate.approver_for(request.reviewer).ok_or(
            DomainError::ReviewerNotAssigned { process_id: process.id, reviewer: request.reviewer },
        )?;
        if !approver.status.is_pending() {
            return Err(DomainError::AlreadyDecided {
                process_id: process.id,
                reviewer: request.reviewer,
                status: approver.status,
            });
        }

        let status = request.decision.approver_status();
        let mut writes = vec![ProcessWrite::RecordDecision {
            approver_id: approver.id,
            status,
            comment: request.comment.clone(),
            decided_at: now,
        }];

        let remaining = aggregate.pending_count() - 1;
        if remaining > 0 {
            return Ok(TransitionPlan {
                writes,
                outcome: TransitionOutcome::DecisionRecorded { remaining },
            });
        }

        let rejected = status == ApproverStatus::Rejected
            || aggregate.approvers.iter().any(|other| other.status == ApproverStatus::Rejected);
        let disposition = if rejected { Disposition::Rejected } else { Disposition::Approved };

        let document_status = disposition.document_status();
        if !aggregate.document_status.can_transition_to(document_status) {
            return Err(DomainError::InvalidDocumentTransition {
                from: aggregate.document_status,
                to: document_status,
            });
        }

        writes.push(ProcessWrite::CompleteProcess { process_id: process.id, completed_at: now });
        writes.push(ProcessWrite::SetDocumentStatus {
            document_id: process.document_id,
            status: document_status,
        });

        Ok(TransitionPlan { writes, outcome: TransitionOutcome::Finalized { disposition } })
    }
}

/// Checks a committed view against the aggregate invariants: at least one
/// approver, decided approvers carry a timestamp, and completion iff nothing
/// is pending. The document's current status is only compared loosely since
/// a later review cycle may have moved it on.
pub fn verify_view(view: &ApprovalProcessView) -> Result<(), DomainError> {
    let process_id = view.process.id;
    if view.approvers.is_empty() {
        return Err(DomainError::InvariantViolation(format!(
            "approval process {process_id} has no approvers"
        )));
    }

    for approver in &view.approvers {
        if approver.status.is_pending() != approver.decided_at.is_none() {
            return Err(DomainError::InvariantViolation(format!(
                "approver {} on process {process_id} is {:?} with decided_at {:?}",
                approver.id, approver.status, approver.decided_at
            )));
        }
    }

    let pending = view.pending_count();
    match view.process.status {
        ProcessStatus::InProgress if pending == 0 => Err(DomainError::InvariantViolation(
            format!("approval process {process_id} is in progress with no pending approvers"),
        )),
        ProcessStatus::InProgress => Ok(()),
        ProcessStatus::Completed if pending > 0 => Err(DomainError::InvariantViolation(format!(
            "approval process {process_id} is completed with {pending} pending approvers"
        ))),
        ProcessStatus::Completed if view.document.status == DocumentStatus::Draft => {
            Err(DomainError::InvariantViolation(format!(
                "completed process {process_id} left document {} in draft",
                view.document.id
            )))
        }
        ProcessStatus::Completed => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{verify_view, ApprovalStateMachine, DecisionRequest, StartRequest};
    use crate::approvals::plan::{ProcessWrite, TransitionOutcome};
    use crate::domain::approval::{
        ApprovalProcess, ApprovalProcessView, Approver, ApproverId, ApproverStatus, Decision,
        Disposition, ProcessAggregate, ProcessId, ProcessStatus, UserId,
    };
    use crate::domain::document::{Document, DocumentId, DocumentStatus};
    use crate::errors::DomainError;

    const ALICE: UserId = UserId(11);
    const BOB: UserId = UserId(12);
    const CAROL: UserId = UserId(13);

    fn document(status: DocumentStatus) -> Document {
        Document {
            id: DocumentId(1),
            title: "Exhibition contract".to_owned(),
            status,
            created_at: Utc::now(),
        }
    }

    fn aggregate(statuses: &[(UserId, ApproverStatus)]) -> ProcessAggregate {
        let now = Utc::now();
        ProcessAggregate {
            process: ApprovalProcess {
                id: ProcessId(5),
                document_id: DocumentId(1),
                status: ProcessStatus::InProgress,
                created_at: now,
                completed_at: None,
            },
            document_status: DocumentStatus::UnderReview,
            approvers: statuses
                .iter()
                .enumerate()
                .map(|(index, (user_id, status))| Approver {
                    id: ApproverId(100 + index as i64),
                    process_id: ProcessId(5),
                    user_id: *user_id,
                    position: index as u32,
                    status: *status,
                    comment: None,
                    decided_at: (!status.is_pending()).then_some(now),
                })
                .collect(),
        }
    }

    fn decision(reviewer: UserId, decision: Decision) -> DecisionRequest {
        DecisionRequest::new(ProcessId(5), reviewer, decision, None).expect("valid decision")
    }

    #[test]
    fn start_creates_process_and_moves_document_under_review() {
        let request = StartRequest::new(DocumentId(1), vec![ALICE, BOB]).expect("valid request");
        let now = Utc::now();
        let plan = ApprovalStateMachine
            .start(&document(DocumentStatus::Draft), None, &request, now)
            .expect("start should succeed");

        assert_eq!(plan.outcome, TransitionOutcome::Started { reviewer_count: 2 });
        assert_eq!(
            plan.writes,
            vec![
                ProcessWrite::CreateProcess {
                    document_id: DocumentId(1),
                    reviewers: vec![ALICE, BOB],
                    created_at: now,
                },
                ProcessWrite::SetDocumentStatus {
                    document_id: DocumentId(1),
                    status: DocumentStatus::UnderReview,
                },
            ]
        );
    }

    #[test]
    fn start_rejects_empty_and_duplicate_reviewers() {
        assert_eq!(
            StartRequest::new(DocumentId(1), Vec::new()).expect_err("empty"),
            DomainError::EmptyReviewerSet
        );
        assert_eq!(
            StartRequest::new(DocumentId(1), vec![ALICE, BOB, ALICE, ALICE, BOB])
                .expect_err("duplicates"),
            DomainError::DuplicateReviewers { duplicates: vec![ALICE, BOB] }
        );
    }

    #[test]
    fn start_refuses_second_active_process() {
        let request = StartRequest::new(DocumentId(1), vec![ALICE]).expect("valid request");
        let error = ApprovalStateMachine
            .start(&document(DocumentStatus::UnderReview), Some(ProcessId(5)), &request, Utc::now())
            .expect_err("active process must block start");

        assert_eq!(
            error,
            DomainError::ActiveProcessExists { document_id: DocumentId(1), process_id: ProcessId(5) }
        );
    }

    #[test]
    fn start_allows_new_cycle_after_completion() {
        let request = StartRequest::new(DocumentId(1), vec![CAROL]).expect("valid request");
        let plan = ApprovalStateMachine
            .start(&document(DocumentStatus::Rejected), None, &request, Utc::now())
            .expect("rejected document can be reviewed again");
        assert!(matches!(plan.outcome, TransitionOutcome::Started { reviewer_count: 1 }));
    }

    #[test]
    fn decision_with_pending_peers_only_records_the_vote() {
        let aggregate = aggregate(&[(ALICE, ApproverStatus::Pending), (BOB, ApproverStatus::Pending)]);
        let plan = ApprovalStateMachine
            .decide(&aggregate, &decision(ALICE, Decision::Approve), Utc::now())
            .expect("decision");

        assert_eq!(plan.outcome, TransitionOutcome::DecisionRecorded { remaining: 1 });
        assert_eq!(plan.writes.len(), 1);
        assert!(plan.finalizes().is_none());
        assert!(matches!(
            plan.writes[0],
            ProcessWrite::RecordDecision { approver_id: ApproverId(100), status: ApproverStatus::Approved, .. }
        ));
    }

    #[test]
    fn last_approval_finalizes_as_approved() {
        let aggregate =
            aggregate(&[(ALICE, ApproverStatus::Approved), (BOB, ApproverStatus::Pending)]);
        let plan = ApprovalStateMachine
            .decide(&aggregate, &decision(BOB, Decision::Approve), Utc::now())
            .expect("decision");

        assert_eq!(plan.finalizes(), Some(Disposition::Approved));
        assert!(matches!(plan.writes[1], ProcessWrite::CompleteProcess { process_id: ProcessId(5), .. }));
        assert_eq!(
            plan.writes[2],
            ProcessWrite::SetDocumentStatus {
                document_id: DocumentId(1),
                status: DocumentStatus::Approved,
            }
        );
    }

    #[test]
    fn any_rejection_overrides_approvals() {
        let last_rejects =
            aggregate(&[(ALICE, ApproverStatus::Approved), (BOB, ApproverStatus::Pending)]);
        let plan = ApprovalStateMachine
            .decide(&last_rejects, &decision(BOB, Decision::Reject), Utc::now())
            .expect("decision");
        assert_eq!(plan.finalizes(), Some(Disposition::Rejected));

        let earlier_rejected =
            aggregate(&[(ALICE, ApproverStatus::Rejected), (BOB, ApproverStatus::Pending)]);
        let plan = ApprovalStateMachine
            .decide(&earlier_rejected, &decision(BOB, Decision::Approve), Utc::now())
            .expect("decision");
        assert_eq!(plan.finalizes(), Some(Disposition::Rejected));
    }

    #[test]
    fn second_decision_from_same_reviewer_conflicts() {
        let aggregate =
            aggregate(&[(ALICE, ApproverStatus::Approved), (BOB, ApproverStatus::Pending)]);
        let error = ApprovalStateMachine
            .decide(&aggregate, &decision(ALICE, Decision::Reject), Utc::now())
            .expect_err("already decided");

        assert_eq!(
            error,
            DomainError::AlreadyDecided {
                process_id: ProcessId(5),
                reviewer: ALICE,
                status: ApproverStatus::Approved,
            }
        );
    }

    #[test]
    fn unassigned_reviewer_is_not_found() {
        let aggregate = aggregate(&[(ALICE, ApproverStatus::Pending)]);
        let error = ApprovalStateMachine
            .decide(&aggregate, &decision(CAROL, Decision::Approve), Utc::now())
            .expect_err("not assigned");
        assert!(matches!(error, DomainError::ReviewerNotAssigned { reviewer: CAROL, .. }));
    }

    #[test]
    fn completed_process_rejects_every_decision() {
        let mut aggregate = aggregate(&[(ALICE, ApproverStatus::Approved)]);
        aggregate.process.status = ProcessStatus::Completed;
        aggregate.document_status = DocumentStatus::Approved;

        for reviewer in [ALICE, CAROL] {
            let error = ApprovalStateMachine
                .decide(&aggregate, &decision(reviewer, Decision::Approve), Utc::now())
                .expect_err("completed");
            assert_eq!(error, DomainError::ProcessCompleted(ProcessId(5)));
        }
    }

    #[test]
    fn aggregate_without_approvers_is_an_invariant_violation() {
        let aggregate = aggregate(&[]);
        let error = ApprovalStateMachine
            .decide(&aggregate, &decision(ALICE, Decision::Approve), Utc::now())
            .expect_err("empty roster");
        assert!(matches!(error, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn comments_are_trimmed_and_bounded() {
        let request =
            DecisionRequest::new(ProcessId(1), ALICE, Decision::Approve, Some("  ok  ".to_owned()))
                .expect("short comment");
        assert_eq!(request.comment(), Some("ok"));

        let blank =
            DecisionRequest::new(ProcessId(1), ALICE, Decision::Reject, Some("   ".to_owned()))
                .expect("blank comment");
        assert_eq!(blank.comment(), None);

        let error = DecisionRequest::new(
            ProcessId(1),
            ALICE,
            Decision::Reject,
            Some("x".repeat(super::MAX_COMMENT_CHARS + 1)),
        )
        .expect_err("comment too long");
        assert!(matches!(error, DomainError::CommentTooLong { .. }));
    }

    #[test]
    fn replaying_decisions_reaches_the_same_outcome() {
        let run = || {
            let mut aggregate = aggregate(&[
                (ALICE, ApproverStatus::Pending),
                (BOB, ApproverStatus::Pending),
                (CAROL, ApproverStatus::Pending),
            ]);
            let mut outcomes = Vec::new();
            for (reviewer, vote) in
                [(BOB, Decision::Approve), (ALICE, Decision::Reject), (CAROL, Decision::Approve)]
            {
                let plan = ApprovalStateMachine
                    .decide(&aggregate, &decision(reviewer, vote), Utc::now())
                    .expect("decision");
                if let Some(approver) =
                    aggregate.approvers.iter_mut().find(|approver| approver.user_id == reviewer)
                {
                    approver.status = vote.approver_status();
                    approver.decided_at = Some(Utc::now());
                }
                outcomes.push(plan.outcome);
            }
            outcomes
        };

        let first = run();
        assert_eq!(first, run());
        assert_eq!(
            first.last(),
            Some(&TransitionOutcome::Finalized { disposition: Disposition::Rejected })
        );
    }

    #[test]
    fn verify_view_flags_completed_process_with_pending_approver() {
        let mut aggregate =
            aggregate(&[(ALICE, ApproverStatus::Approved), (BOB, ApproverStatus::Pending)]);
        aggregate.process.status = ProcessStatus::Completed;
        let view = ApprovalProcessView {
            process: aggregate.process.clone(),
            document: document(DocumentStatus::Approved).summary(),
            approvers: aggregate.approvers.clone(),
        };

        assert!(matches!(verify_view(&view), Err(DomainError::InvariantViolation(_))));
    }

    #[test]
    fn verify_view_accepts_unanimous_approval() {
        let aggregate =
            aggregate(&[(ALICE, ApproverStatus::Approved), (BOB, ApproverStatus::Approved)]);
        let mut process = aggregate.process.clone();
        process.status = ProcessStatus::Completed;
        process.completed_at = Some(Utc::now());
        let view = ApprovalProcessView {
            process,
            document: document(DocumentStatus::Approved).summary(),
            approvers: aggregate.approvers,
        };

        assert_eq!(verify_view(&view), Ok(()));
    }
}
