use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;

use docapproval_core::domain::document::{Document, DocumentId};

use super::approval::parse_document_status;
use super::{column, decode_timestamp, encode_timestamp, DocumentRepository, RepositoryError};
use crate::DbPool;

pub struct SqlDocumentRepository {
    pool: DbPool,
}

impl SqlDocumentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

pub(crate) fn document_from_row(row: &SqliteRow) -> Result<Document, RepositoryError> {
    let status: String = column(row, "status")?;
    let created_at: String = column(row, "created_at")?;

    Ok(Document {
        id: DocumentId(column(row, "id")?),
        title: column(row, "title")?,
        status: parse_document_status(&status)?,
        created_at: decode_timestamp("documents.created_at", &created_at)?,
    })
}

#[async_trait]
impl DocumentRepository for SqlDocumentRepository {
    async fn create(&self, title: &str) -> Result<Document, RepositoryError> {
        let row = sqlx::query(
            "INSERT INTO documents (title, status, created_at) VALUES (?, 'draft', ?)
             RETURNING id, title, status, created_at",
        )
        .bind(title)
        .bind(encode_timestamp(&Utc::now()))
        .fetch_one(&self.pool)
        .await?;

        document_from_row(&row)
    }

    async fn find_by_id(&self, id: DocumentId) -> Result<Option<Document>, RepositoryError> {
        let row = sqlx::query("SELECT id, title, status, created_at FROM documents WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(document_from_row).transpose()
    }
}
