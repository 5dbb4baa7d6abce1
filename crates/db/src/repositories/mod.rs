use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::Row;
use thiserror::Error;

use docapproval_core::approvals::ProcessWrite;
use docapproval_core::domain::approval::{
    ApprovalProcessView, ProcessAggregate, ProcessId, ProcessSummary, ReviewerFilter, UserId,
};
use docapproval_core::domain::document::{Document, DocumentId};

pub mod approval;
pub mod document;
pub mod memory;

pub use approval::{SqlProcessStore, SqlProcessTransaction};
pub use document::SqlDocumentRepository;
pub use memory::InMemoryProcessStore;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("store conflict: {0}")]
    Conflict(String),
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("constraint violated: {0}")]
    Constraint(String),
}

impl RepositoryError {
    /// Busy/locked stores and guarded writes that matched nothing can succeed
    /// when the whole operation runs again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

impl From<sqlx::Error> for RepositoryError {
    fn from(error: sqlx::Error) -> Self {
        let sqlx::Error::Database(database_error) = &error else {
            return Self::Database(error);
        };

        let message = database_error.message().to_owned();
        match database_error.kind() {
            sqlx::error::ErrorKind::UniqueViolation => return Self::UniqueViolation(message),
            sqlx::error::ErrorKind::ForeignKeyViolation
            | sqlx::error::ErrorKind::NotNullViolation
            | sqlx::error::ErrorKind::CheckViolation => return Self::Constraint(message),
            _ => {}
        }

        // Extended result codes keep the primary code in the low byte.
        let primary_code = database_error
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| code & 0xff);
        match primary_code {
            Some(SQLITE_BUSY) | Some(SQLITE_LOCKED) => Self::Conflict(message),
            _ => Self::Database(error),
        }
    }
}

/// Opens the write transactions every engine mutation runs in.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn ProcessTransaction>, RepositoryError>;
}

/// One unit of work against the store. The first `lock_*` call must precede
/// any other read so the transaction holds the write lock before it looks at
/// state. Dropping the transaction without `commit` discards every write.
#[async_trait]
pub trait ProcessTransaction: Send {
    async fn lock_document(
        &mut self,
        document_id: DocumentId,
    ) -> Result<Option<Document>, RepositoryError>;

    async fn find_active_process(
        &mut self,
        document_id: DocumentId,
    ) -> Result<Option<ProcessId>, RepositoryError>;

    async fn lock_process(
        &mut self,
        process_id: ProcessId,
    ) -> Result<Option<ProcessAggregate>, RepositoryError>;

    /// Returns the new process id for `CreateProcess`, `None` otherwise.
    async fn apply(&mut self, write: &ProcessWrite) -> Result<Option<ProcessId>, RepositoryError>;

    async fn commit(&mut self) -> Result<(), RepositoryError>;
}

/// Read-only projections. Each call observes a single committed snapshot.
#[async_trait]
pub trait ProcessQueries: Send + Sync {
    async fn find_process_view(
        &self,
        process_id: ProcessId,
    ) -> Result<Option<ApprovalProcessView>, RepositoryError>;

    async fn list_processes(&self) -> Result<Vec<ProcessSummary>, RepositoryError>;

    async fn list_for_reviewer(
        &self,
        reviewer: UserId,
        filter: ReviewerFilter,
    ) -> Result<Vec<ApprovalProcessView>, RepositoryError>;

    async fn list_for_document(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<ProcessSummary>, RepositoryError>;
}

#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn create(&self, title: &str) -> Result<Document, RepositoryError>;
    async fn find_by_id(&self, id: DocumentId) -> Result<Option<Document>, RepositoryError>;
}

pub(crate) fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name).map_err(|error| RepositoryError::Decode(format!("{name}: {error}")))
}

pub(crate) fn encode_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("{column} `{raw}`: {error}")))
}
