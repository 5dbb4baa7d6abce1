use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::sqlite::{Sqlite, SqliteConnection, SqliteRow};
use sqlx::Transaction;

use docapproval_core::approvals::ProcessWrite;
use docapproval_core::domain::approval::{
    ApprovalProcess, ApprovalProcessView, Approver, ApproverId, ApproverStatus, ProcessAggregate,
    ProcessId, ProcessStatus, ProcessSummary, ReviewerFilter, UserId,
};
use docapproval_core::domain::document::{Document, DocumentId, DocumentStatus, DocumentSummary};

use super::document::document_from_row;
use super::{
    column, decode_timestamp, encode_timestamp, ProcessQueries, ProcessStore, ProcessTransaction,
    RepositoryError,
};
use crate::DbPool;

const SUMMARY_SELECT: &str = "SELECT p.id, p.document_id, p.status, p.created_at, p.completed_at,
        d.title AS document_title, d.status AS document_status,
        COUNT(a.id) AS approver_count,
        COALESCE(SUM(CASE WHEN a.status = 'pending' THEN 1 ELSE 0 END), 0) AS pending_count
 FROM approval_processes p
 JOIN documents d ON d.id = p.document_id
 LEFT JOIN approvers a ON a.process_id = p.id";

const APPROVER_COLUMNS: &str = "id, process_id, user_id, position, status, comment, decided_at";

pub struct SqlProcessStore {
    pool: DbPool,
}

impl SqlProcessStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProcessStore for SqlProcessStore {
    async fn begin(&self) -> Result<Box<dyn ProcessTransaction>, RepositoryError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqlProcessTransaction { tx: Some(tx) }))
    }
}

/// Write transaction over the pool. The `lock_*` methods bump the row's
/// `lock_version` as their first statement, which takes SQLite's write lock.
pub struct SqlProcessTransaction {
    tx: Option<Transaction<'static, Sqlite>>,
}

impl SqlProcessTransaction {
    fn connection(&mut self) -> Result<&mut SqliteConnection, RepositoryError> {
        self.tx.as_deref_mut().ok_or_else(|| {
            RepositoryError::Database(sqlx::Error::Protocol(
                "approval transaction used after commit".to_owned(),
            ))
        })
    }
}

#[async_trait]
impl ProcessTransaction for SqlProcessTransaction {
    async fn lock_document(
        &mut self,
        document_id: DocumentId,
    ) -> Result<Option<Document>, RepositoryError> {
        let conn = self.connection()?;
        let row = sqlx::query(
            "UPDATE documents SET lock_version = lock_version + 1 WHERE id = ?
             RETURNING id, title, status, created_at",
        )
        .bind(document_id.0)
        .fetch_optional(&mut *conn)
        .await?;

        row.as_ref().map(document_from_row).transpose()
    }

    async fn find_active_process(
        &mut self,
        document_id: DocumentId,
    ) -> Result<Option<ProcessId>, RepositoryError> {
        let conn = self.connection()?;
        let row = sqlx::query(
            "SELECT id FROM approval_processes WHERE document_id = ? AND status = 'in_progress'",
        )
        .bind(document_id.0)
        .fetch_optional(&mut *conn)
        .await?;

        row.as_ref().map(|row| column::<i64>(row, "id").map(ProcessId)).transpose()
    }

    async fn lock_process(
        &mut self,
        process_id: ProcessId,
    ) -> Result<Option<ProcessAggregate>, RepositoryError> {
        let conn = self.connection()?;
        let Some(row) = sqlx::query(
            "UPDATE approval_processes SET lock_version = lock_version + 1 WHERE id = ?
             RETURNING id, document_id, status, created_at, completed_at",
        )
        .bind(process_id.0)
        .fetch_optional(&mut *conn)
        .await?
        else {
            return Ok(None);
        };
        let process = process_from_row(&row)?;

        let document_row = sqlx::query("SELECT status FROM documents WHERE id = ?")
            .bind(process.document_id.0)
            .fetch_one(&mut *conn)
            .await?;
        let document_status = parse_document_status(&column::<String>(&document_row, "status")?)?;

        let approvers = load_approvers(&mut *conn, process.id).await?;

        Ok(Some(ProcessAggregate { process, document_status, approvers }))
    }

    async fn apply(&mut self, write: &ProcessWrite) -> Result<Option<ProcessId>, RepositoryError> {
        let conn = self.connection()?;
        match write {
            ProcessWrite::CreateProcess { document_id, reviewers, created_at } => {
                let row = sqlx::query(
                    "INSERT INTO approval_processes (document_id, status, created_at)
                     VALUES (?, 'in_progress', ?)
                     RETURNING id",
                )
                .bind(document_id.0)
                .bind(encode_timestamp(created_at))
                .fetch_one(&mut *conn)
                .await?;
                let process_id = ProcessId(column(&row, "id")?);

                for (position, reviewer) in reviewers.iter().enumerate() {
                    sqlx::query(
                        "INSERT INTO approvers (process_id, user_id, position, status)
                         VALUES (?, ?, ?, 'pending')",
                    )
                    .bind(process_id.0)
                    .bind(reviewer.0)
                    .bind(position as i64)
                    .execute(&mut *conn)
                    .await?;
                }

                Ok(Some(process_id))
            }
            ProcessWrite::RecordDecision { approver_id, status, comment, decided_at } => {
                let result = sqlx::query(
                    "UPDATE approvers SET status = ?, comment = ?, decided_at = ?
                     WHERE id = ? AND status = 'pending'",
                )
                .bind(status.as_str())
                .bind(comment.as_deref())
                .bind(encode_timestamp(decided_at))
                .bind(approver_id.0)
                .execute(&mut *conn)
                .await?;

                if result.rows_affected() == 0 {
                    return Err(RepositoryError::Conflict(format!(
                        "approver {approver_id} is no longer pending"
                    )));
                }
                Ok(None)
            }
            ProcessWrite::CompleteProcess { process_id, completed_at } => {
                let result = sqlx::query(
                    "UPDATE approval_processes SET status = 'completed', completed_at = ?
                     WHERE id = ? AND status = 'in_progress'",
                )
                .bind(encode_timestamp(completed_at))
                .bind(process_id.0)
                .execute(&mut *conn)
                .await?;

                if result.rows_affected() == 0 {
                    return Err(RepositoryError::Conflict(format!(
                        "approval process {process_id} is no longer in progress"
                    )));
                }
                Ok(None)
            }
            ProcessWrite::SetDocumentStatus { document_id, status } => {
                let result = sqlx::query("UPDATE documents SET status = ? WHERE id = ?")
                    .bind(status.as_str())
                    .bind(document_id.0)
                    .execute(&mut *conn)
                    .await?;

                if result.rows_affected() == 0 {
                    return Err(RepositoryError::Conflict(format!(
                        "document {document_id} disappeared during the transaction"
                    )));
                }
                Ok(None)
            }
        }
    }

    async fn commit(&mut self) -> Result<(), RepositoryError> {
        match self.tx.take() {
            Some(tx) => Ok(tx.commit().await?),
            None => Err(RepositoryError::Database(sqlx::Error::Protocol(
                "approval transaction committed twice".to_owned(),
            ))),
        }
    }
}

#[async_trait]
impl ProcessQueries for SqlProcessStore {
    async fn find_process_view(
        &self,
        process_id: ProcessId,
    ) -> Result<Option<ApprovalProcessView>, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT p.id, p.document_id, p.status, p.created_at, p.completed_at,
                    d.title AS document_title, d.status AS document_status
             FROM approval_processes p
             JOIN documents d ON d.id = p.document_id
             WHERE p.id = ?",
        )
        .bind(process_id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let process = process_from_row(&row)?;
        let document = document_summary_from_row(&row)?;
        let approvers = load_approvers(&mut *tx, process.id).await?;
        tx.commit().await?;

        Ok(Some(ApprovalProcessView { process, document, approvers }))
    }

    async fn list_processes(&self) -> Result<Vec<ProcessSummary>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SUMMARY_SELECT}
             GROUP BY p.id
             ORDER BY p.created_at DESC, p.id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(summary_from_row).collect()
    }

    async fn list_for_reviewer(
        &self,
        reviewer: UserId,
        filter: ReviewerFilter,
    ) -> Result<Vec<ApprovalProcessView>, RepositoryError> {
        let status_clause = match filter {
            ReviewerFilter::Pending => "status = 'pending'",
            ReviewerFilter::Decided => "status IN ('approved', 'rejected')",
        };
        let assigned = format!(
            "SELECT process_id FROM approvers WHERE user_id = ? AND {status_clause}"
        );

        let mut tx = self.pool.begin().await?;
        let process_rows = sqlx::query(&format!(
            "SELECT p.id, p.document_id, p.status, p.created_at, p.completed_at,
                    d.title AS document_title, d.status AS document_status
             FROM approval_processes p
             JOIN documents d ON d.id = p.document_id
             WHERE p.id IN ({assigned})
             ORDER BY p.created_at DESC, p.id DESC"
        ))
        .bind(reviewer.0)
        .fetch_all(&mut *tx)
        .await?;

        let approver_rows = sqlx::query(&format!(
            "SELECT {APPROVER_COLUMNS} FROM approvers
             WHERE process_id IN ({assigned})
             ORDER BY process_id ASC, position ASC"
        ))
        .bind(reviewer.0)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut rosters: HashMap<ProcessId, Vec<Approver>> = HashMap::new();
        for row in &approver_rows {
            let approver = approver_from_row(row)?;
            rosters.entry(approver.process_id).or_default().push(approver);
        }

        process_rows
            .iter()
            .map(|row| -> Result<ApprovalProcessView, RepositoryError> {
                let process = process_from_row(row)?;
                let document = document_summary_from_row(row)?;
                let approvers = rosters.remove(&process.id).unwrap_or_default();
                Ok(ApprovalProcessView { process, document, approvers })
            })
            .collect()
    }

    async fn list_for_document(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<ProcessSummary>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{SUMMARY_SELECT}
             WHERE p.document_id = ?
             GROUP BY p.id
             ORDER BY p.created_at DESC, p.id DESC"
        ))
        .bind(document_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(summary_from_row).collect()
    }
}

async fn load_approvers(
    conn: &mut SqliteConnection,
    process_id: ProcessId,
) -> Result<Vec<Approver>, RepositoryError> {
    let rows = sqlx::query(&format!(
        "SELECT {APPROVER_COLUMNS} FROM approvers WHERE process_id = ? ORDER BY position ASC"
    ))
    .bind(process_id.0)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter().map(approver_from_row).collect()
}

fn process_from_row(row: &SqliteRow) -> Result<ApprovalProcess, RepositoryError> {
    let status: String = column(row, "status")?;
    let created_at: String = column(row, "created_at")?;
    let completed_at: Option<String> = column(row, "completed_at")?;

    Ok(ApprovalProcess {
        id: ProcessId(column(row, "id")?),
        document_id: DocumentId(column(row, "document_id")?),
        status: ProcessStatus::parse(&status).ok_or_else(|| {
            RepositoryError::Decode(format!("unknown approval process status `{status}`"))
        })?,
        created_at: decode_timestamp("approval_processes.created_at", &created_at)?,
        completed_at: completed_at
            .as_deref()
            .map(|raw| decode_timestamp("approval_processes.completed_at", raw))
            .transpose()?,
    })
}

fn document_summary_from_row(row: &SqliteRow) -> Result<DocumentSummary, RepositoryError> {
    let status: String = column(row, "document_status")?;
    Ok(DocumentSummary {
        id: DocumentId(column(row, "document_id")?),
        title: column(row, "document_title")?,
        status: parse_document_status(&status)?,
    })
}

fn summary_from_row(row: &SqliteRow) -> Result<ProcessSummary, RepositoryError> {
    Ok(ProcessSummary {
        process: process_from_row(row)?,
        document: document_summary_from_row(row)?,
        approver_count: count_column(row, "approver_count")?,
        pending_count: count_column(row, "pending_count")?,
    })
}

fn approver_from_row(row: &SqliteRow) -> Result<Approver, RepositoryError> {
    let status: String = column(row, "status")?;
    let position: i64 = column(row, "position")?;
    let decided_at: Option<String> = column(row, "decided_at")?;

    Ok(Approver {
        id: ApproverId(column(row, "id")?),
        process_id: ProcessId(column(row, "process_id")?),
        user_id: UserId(column(row, "user_id")?),
        position: u32::try_from(position).map_err(|_| {
            RepositoryError::Decode(format!("approver position {position} out of range"))
        })?,
        status: ApproverStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown approver status `{status}`")))?,
        comment: column(row, "comment")?,
        decided_at: decided_at
            .as_deref()
            .map(|raw| decode_timestamp("approvers.decided_at", raw))
            .transpose()?,
    })
}

fn count_column(row: &SqliteRow, name: &str) -> Result<u32, RepositoryError> {
    let value: i64 = column(row, name)?;
    u32::try_from(value).map_err(|_| RepositoryError::Decode(format!("{name} {value} out of range")))
}

pub(crate) fn parse_document_status(raw: &str) -> Result<DocumentStatus, RepositoryError> {
    DocumentStatus::parse(raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown document status `{raw}`")))
}
