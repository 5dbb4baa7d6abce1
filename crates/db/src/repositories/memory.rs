use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};

use docapproval_core::approvals::ProcessWrite;
use docapproval_core::domain::approval::{
    ApprovalProcess, ApprovalProcessView, Approver, ApproverId, ApproverStatus, ProcessAggregate,
    ProcessId, ProcessStatus, ProcessSummary, ReviewerFilter, UserId,
};
use docapproval_core::domain::document::{Document, DocumentId, DocumentStatus};

use super::{
    DocumentRepository, ProcessQueries, ProcessStore, ProcessTransaction, RepositoryError,
};

#[derive(Clone, Debug, Default)]
struct MemoryState {
    documents: BTreeMap<DocumentId, Document>,
    processes: BTreeMap<ProcessId, ApprovalProcess>,
    approvers: BTreeMap<ApproverId, Approver>,
    last_document_id: i64,
    last_process_id: i64,
    last_approver_id: i64,
}

impl MemoryState {
    fn roster(&self, process_id: ProcessId) -> Vec<Approver> {
        let mut approvers: Vec<Approver> = self
            .approvers
            .values()
            .filter(|approver| approver.process_id == process_id)
            .cloned()
            .collect();
        approvers.sort_by_key(|approver| approver.position);
        approvers
    }

    fn view(&self, process: &ApprovalProcess) -> Result<ApprovalProcessView, RepositoryError> {
        let document = self.documents.get(&process.document_id).ok_or_else(|| {
            RepositoryError::Decode(format!(
                "approval process {} references missing document {}",
                process.id, process.document_id
            ))
        })?;

        Ok(ApprovalProcessView {
            process: process.clone(),
            document: document.summary(),
            approvers: self.roster(process.id),
        })
    }

    fn summary(&self, process: &ApprovalProcess) -> Result<ProcessSummary, RepositoryError> {
        let view = self.view(process)?;
        Ok(ProcessSummary {
            approver_count: view.approvers.len() as u32,
            pending_count: view.pending_count() as u32,
            process: view.process,
            document: view.document,
        })
    }

    /// Newest first, ties broken by id.
    fn processes_newest_first(&self) -> Vec<&ApprovalProcess> {
        let mut processes: Vec<&ApprovalProcess> = self.processes.values().collect();
        processes.sort_by(|left, right| {
            right.created_at.cmp(&left.created_at).then_with(|| right.id.cmp(&left.id))
        });
        processes
    }

    fn active_process(&self, document_id: DocumentId) -> Option<ProcessId> {
        self.processes
            .values()
            .find(|process| {
                process.document_id == document_id && process.status == ProcessStatus::InProgress
            })
            .map(|process| process.id)
    }
}

/// Process store backed by process memory. A transaction holds the state's
/// write lock from `begin` until it is committed or dropped, and writes go to
/// a staged copy that replaces the state only on commit.
#[derive(Clone, Default)]
pub struct InMemoryProcessStore {
    state: Arc<RwLock<MemoryState>>,
    pending_commit_conflicts: Arc<AtomicU32>,
}

impl InMemoryProcessStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commits fail with a retryable conflict.
    pub fn inject_commit_conflicts(&self, count: u32) {
        self.pending_commit_conflicts.store(count, Ordering::SeqCst);
    }
}

pub struct InMemoryProcessTransaction {
    guard: Option<OwnedRwLockWriteGuard<MemoryState>>,
    staged: MemoryState,
    pending_commit_conflicts: Arc<AtomicU32>,
}

#[async_trait]
impl ProcessStore for InMemoryProcessStore {
    async fn begin(&self) -> Result<Box<dyn ProcessTransaction>, RepositoryError> {
        let guard = Arc::clone(&self.state).write_owned().await;
        let staged = (*guard).clone();
        Ok(Box::new(InMemoryProcessTransaction {
            guard: Some(guard),
            staged,
            pending_commit_conflicts: Arc::clone(&self.pending_commit_conflicts),
        }))
    }
}

#[async_trait]
impl ProcessTransaction for InMemoryProcessTransaction {
    async fn lock_document(
        &mut self,
        document_id: DocumentId,
    ) -> Result<Option<Document>, RepositoryError> {
        Ok(self.staged.documents.get(&document_id).cloned())
    }

    async fn find_active_process(
        &mut self,
        document_id: DocumentId,
    ) -> Result<Option<ProcessId>, RepositoryError> {
        Ok(self.staged.active_process(document_id))
    }

    async fn lock_process(
        &mut self,
        process_id: ProcessId,
    ) -> Result<Option<ProcessAggregate>, RepositoryError> {
        let Some(process) = self.staged.processes.get(&process_id).cloned() else {
            return Ok(None);
        };
        let document_status = self
            .staged
            .documents
            .get(&process.document_id)
            .map(|document| document.status)
            .ok_or_else(|| {
                RepositoryError::Decode(format!(
                    "approval process {process_id} references missing document {}",
                    process.document_id
                ))
            })?;
        let approvers = self.staged.roster(process_id);

        Ok(Some(ProcessAggregate { process, document_status, approvers }))
    }

    async fn apply(&mut self, write: &ProcessWrite) -> Result<Option<ProcessId>, RepositoryError> {
        let state = &mut self.staged;
        match write {
            ProcessWrite::CreateProcess { document_id, reviewers, created_at } => {
                if !state.documents.contains_key(document_id) {
                    return Err(RepositoryError::Constraint(format!(
                        "document {document_id} does not exist"
                    )));
                }
                if let Some(active) = state.active_process(*document_id) {
                    return Err(RepositoryError::UniqueViolation(format!(
                        "document {document_id} already has active process {active}"
                    )));
                }

                state.last_process_id += 1;
                let process_id = ProcessId(state.last_process_id);
                state.processes.insert(
                    process_id,
                    ApprovalProcess {
                        id: process_id,
                        document_id: *document_id,
                        status: ProcessStatus::InProgress,
                        created_at: *created_at,
                        completed_at: None,
                    },
                );
                for (position, reviewer) in reviewers.iter().enumerate() {
                    state.last_approver_id += 1;
                    let approver_id = ApproverId(state.last_approver_id);
                    state.approvers.insert(
                        approver_id,
                        Approver {
                            id: approver_id,
                            process_id,
                            user_id: *reviewer,
                            position: position as u32,
                            status: ApproverStatus::Pending,
                            comment: None,
                            decided_at: None,
                        },
                    );
                }

                Ok(Some(process_id))
            }
            ProcessWrite::RecordDecision { approver_id, status, comment, decided_at } => {
                match state.approvers.get_mut(approver_id) {
                    Some(approver) if approver.status.is_pending() => {
                        approver.status = *status;
                        approver.comment = comment.clone();
                        approver.decided_at = Some(*decided_at);
                        Ok(None)
                    }
                    _ => Err(RepositoryError::Conflict(format!(
                        "approver {approver_id} is no longer pending"
                    ))),
                }
            }
            ProcessWrite::CompleteProcess { process_id, completed_at } => {
                match state.processes.get_mut(process_id) {
                    Some(process) if process.status == ProcessStatus::InProgress => {
                        process.status = ProcessStatus::Completed;
                        process.completed_at = Some(*completed_at);
                        Ok(None)
                    }
                    _ => Err(RepositoryError::Conflict(format!(
                        "approval process {process_id} is no longer in progress"
                    ))),
                }
            }
            ProcessWrite::SetDocumentStatus { document_id, status } => {
                match state.documents.get_mut(document_id) {
                    Some(document) => {
                        document.status = *status;
                        Ok(None)
                    }
                    None => Err(RepositoryError::Conflict(format!(
                        "document {document_id} disappeared during the transaction"
                    ))),
                }
            }
        }
    }

    async fn commit(&mut self) -> Result<(), RepositoryError> {
        let Some(mut guard) = self.guard.take() else {
            return Err(RepositoryError::Database(sqlx::Error::Protocol(
                "in-memory transaction committed twice".to_owned(),
            )));
        };

        let injected = self
            .pending_commit_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| remaining.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RepositoryError::Conflict("injected commit conflict".to_owned()));
        }

        *guard = std::mem::take(&mut self.staged);
        Ok(())
    }
}

#[async_trait]
impl ProcessQueries for InMemoryProcessStore {
    async fn find_process_view(
        &self,
        process_id: ProcessId,
    ) -> Result<Option<ApprovalProcessView>, RepositoryError> {
        let state = self.state.read().await;
        state.processes.get(&process_id).map(|process| state.view(process)).transpose()
    }

    async fn list_processes(&self) -> Result<Vec<ProcessSummary>, RepositoryError> {
        let state = self.state.read().await;
        state.processes_newest_first().into_iter().map(|process| state.summary(process)).collect()
    }

    async fn list_for_reviewer(
        &self,
        reviewer: UserId,
        filter: ReviewerFilter,
    ) -> Result<Vec<ApprovalProcessView>, RepositoryError> {
        let state = self.state.read().await;
        state
            .processes_newest_first()
            .into_iter()
            .filter(|process| {
                state.approvers.values().any(|approver| {
                    approver.process_id == process.id
                        && approver.user_id == reviewer
                        && filter.matches(approver.status)
                })
            })
            .map(|process| state.view(process))
            .collect()
    }

    async fn list_for_document(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<ProcessSummary>, RepositoryError> {
        let state = self.state.read().await;
        state
            .processes_newest_first()
            .into_iter()
            .filter(|process| process.document_id == document_id)
            .map(|process| state.summary(process))
            .collect()
    }
}

#[async_trait]
impl DocumentRepository for InMemoryProcessStore {
    async fn create(&self, title: &str) -> Result<Document, RepositoryError> {
        let mut state = self.state.write().await;
        state.last_document_id += 1;
        let document = Document {
            id: DocumentId(state.last_document_id),
            title: title.to_owned(),
            status: DocumentStatus::Draft,
            created_at: Utc::now(),
        };
        state.documents.insert(document.id, document.clone());
        Ok(document)
    }

    async fn find_by_id(&self, id: DocumentId) -> Result<Option<Document>, RepositoryError> {
        let state = self.state.read().await;
        Ok(state.documents.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use docapproval_core::approvals::ProcessWrite;
    use docapproval_core::domain::approval::{ApproverStatus, ProcessStatus, ReviewerFilter, UserId};
    use docapproval_core::domain::document::DocumentStatus;

    use super::InMemoryProcessStore;
    use crate::repositories::{
        DocumentRepository, ProcessQueries, ProcessStore, ProcessTransaction, RepositoryError,
    };

    const ALICE: UserId = UserId(21);
    const BOB: UserId = UserId(22);

    #[tokio::test]
    async fn staged_writes_are_invisible_until_commit() {
        let store = InMemoryProcessStore::new();
        let document = store.create("Quarterly report").await.expect("create");

        let mut tx = store.begin().await.expect("begin");
        let process_id = tx
            .apply(&ProcessWrite::CreateProcess {
                document_id: document.id,
                reviewers: vec![ALICE, BOB],
                created_at: Utc::now(),
            })
            .await
            .expect("create process")
            .expect("process id");
        drop(tx);

        assert!(store.find_process_view(process_id).await.expect("view").is_none());

        let mut tx = store.begin().await.expect("begin");
        let process_id = tx
            .apply(&ProcessWrite::CreateProcess {
                document_id: document.id,
                reviewers: vec![ALICE, BOB],
                created_at: Utc::now(),
            })
            .await
            .expect("create process")
            .expect("process id");
        tx.commit().await.expect("commit");

        let view = store.find_process_view(process_id).await.expect("view").expect("exists");
        assert_eq!(view.process.status, ProcessStatus::InProgress);
        assert_eq!(view.approvers.len(), 2);
        assert_eq!(view.approvers[0].user_id, ALICE);
    }

    #[tokio::test]
    async fn guarded_writes_and_active_index_match_the_sql_store() {
        let store = InMemoryProcessStore::new();
        let document = store.create("Security review").await.expect("create");

        let mut tx = store.begin().await.expect("begin");
        let process_id = tx
            .apply(&ProcessWrite::CreateProcess {
                document_id: document.id,
                reviewers: vec![ALICE],
                created_at: Utc::now(),
            })
            .await
            .expect("create")
            .expect("process id");
        let duplicate = tx
            .apply(&ProcessWrite::CreateProcess {
                document_id: document.id,
                reviewers: vec![BOB],
                created_at: Utc::now(),
            })
            .await
            .expect_err("second active process");
        assert!(matches!(duplicate, RepositoryError::UniqueViolation(_)));

        let aggregate = tx.lock_process(process_id).await.expect("lock").expect("exists");
        let decision = ProcessWrite::RecordDecision {
            approver_id: aggregate.approvers[0].id,
            status: ApproverStatus::Approved,
            comment: None,
            decided_at: Utc::now(),
        };
        tx.apply(&decision).await.expect("decide");
        assert!(tx.apply(&decision).await.expect_err("replay").is_retryable());

        let complete = ProcessWrite::CompleteProcess { process_id, completed_at: Utc::now() };
        tx.apply(&complete).await.expect("complete");
        assert!(matches!(
            tx.apply(&complete).await.expect_err("second completion"),
            RepositoryError::Conflict(_)
        ));
        tx.apply(&ProcessWrite::SetDocumentStatus {
            document_id: document.id,
            status: DocumentStatus::Approved,
        })
        .await
        .expect("set status");
        tx.commit().await.expect("commit");

        let decided = store.list_for_reviewer(ALICE, ReviewerFilter::Decided).await.expect("list");
        assert_eq!(decided.len(), 1);
        assert_eq!(decided[0].document.status, DocumentStatus::Approved);
        assert!(store.list_for_reviewer(ALICE, ReviewerFilter::Pending).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn injected_conflicts_fail_commits_and_discard_writes() {
        let store = InMemoryProcessStore::new();
        let document = store.create("Onboarding guide").await.expect("create");
        store.inject_commit_conflicts(1);

        for attempt in 0..2 {
            let mut tx = store.begin().await.expect("begin");
            tx.apply(&ProcessWrite::SetDocumentStatus {
                document_id: document.id,
                status: DocumentStatus::UnderReview,
            })
            .await
            .expect("set status");
            let result = tx.commit().await;
            assert_eq!(result.is_err(), attempt == 0, "attempt {attempt}");
        }

        let stored = store.find_by_id(document.id).await.expect("find").expect("exists");
        assert_eq!(stored.status, DocumentStatus::UnderReview);
    }

    #[tokio::test]
    async fn second_commit_is_a_non_retryable_database_error() {
        let store = InMemoryProcessStore::new();
        let mut tx = store.begin().await.expect("begin");
        tx.commit().await.expect("first commit");

        let error = tx.commit().await.expect_err("second commit");
        assert!(matches!(error, RepositoryError::Database(sqlx::Error::Protocol(_))));
        assert!(!error.is_retryable());
    }
}
