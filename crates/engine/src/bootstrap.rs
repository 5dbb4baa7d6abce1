use std::sync::Arc;

use docapproval_core::config::{AppConfig, ConfigError, LoadOptions};
use docapproval_db::{
    connect_with_settings, migrations, DbPool, SqlDocumentRepository, SqlProcessStore,
};
use thiserror::Error;
use tracing::info;

use crate::audit::TracingAuditSink;
use crate::engine::ApprovalEngine;
use crate::retry::RetryPolicy;
use crate::telemetry::{init_logging, TelemetryError};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub engine: ApprovalEngine<SqlProcessStore>,
    pub documents: SqlDocumentRepository,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("logging initialisation failed: {0}")]
    Logging(#[from] TelemetryError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

/// Loads config, installs the global subscriber it describes, then wires the
/// application.
pub async fn bootstrap_with_logging(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    init_logging(&config.logging)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        max_connections = config.database.max_connections,
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let retry = RetryPolicy::from_config(&config.engine);
    let engine = ApprovalEngine::new(SqlProcessStore::new(db_pool.clone()))
        .with_retry_policy(retry)
        .with_audit_sink(Arc::new(TracingAuditSink));
    info!(
        event_name = "system.bootstrap.engine_ready",
        max_attempts = retry.max_attempts(),
        "approval engine ready"
    );

    Ok(Application {
        documents: SqlDocumentRepository::new(db_pool.clone()),
        config,
        db_pool,
        engine,
    })
}

#[cfg(test)]
mod tests {
    use docapproval_core::config::{ConfigOverrides, LoadOptions};
    use docapproval_core::domain::approval::{Decision, ProcessStatus, UserId};
    use docapproval_core::domain::document::DocumentStatus;
    use docapproval_db::DocumentRepository;

    use super::{bootstrap, BootstrapError};

    fn overrides(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_owned()),
                engine_max_attempts: Some(4),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_rejects_non_sqlite_urls() {
        let result = bootstrap(overrides("postgres://localhost/approvals")).await;

        assert!(matches!(result, Err(BootstrapError::Config(_))));
    }

    #[tokio::test]
    async fn bootstrapped_engine_runs_a_review_cycle() {
        let app = bootstrap(overrides("sqlite::memory:")).await.expect("bootstrap");
        assert_eq!(app.engine.retry_policy().max_attempts(), 4);

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master
             WHERE type = 'table' AND name IN ('documents', 'approval_processes', 'approvers')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("schema query");
        assert_eq!(table_count, 3);

        let document = app.documents.create("Retention policy").await.expect("document");
        let process_id =
            app.engine.start_process(document.id, &[UserId(7)]).await.expect("start");
        app.engine
            .record_decision(process_id, UserId(7), Decision::Reject, Some("needs legal".into()))
            .await
            .expect("decide");

        let view = app.engine.get_process(process_id).await.expect("view");
        assert_eq!(view.process.status, ProcessStatus::Completed);
        assert_eq!(view.document.status, DocumentStatus::Rejected);
        assert_eq!(view.approvers[0].comment.as_deref(), Some("needs legal"));
    }
}
