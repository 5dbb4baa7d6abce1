pub mod audit;
pub mod bootstrap;
pub mod engine;
pub mod queries;
pub mod retry;
pub mod telemetry;

pub use audit::TracingAuditSink;
pub use bootstrap::{
    bootstrap, bootstrap_with_config, bootstrap_with_logging, Application, BootstrapError,
};
pub use engine::ApprovalEngine;
pub use retry::RetryPolicy;
pub use telemetry::{init_logging, TelemetryError};
