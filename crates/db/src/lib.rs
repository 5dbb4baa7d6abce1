pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with_settings, DbPool, BUSY_TIMEOUT_MS};
pub use repositories::{
    DocumentRepository, InMemoryProcessStore, ProcessQueries, ProcessStore, ProcessTransaction,
    RepositoryError, SqlDocumentRepository, SqlProcessStore,
};
