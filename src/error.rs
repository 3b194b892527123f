use std::sync::Arc;
use thiserror::Error;

/// The error type a work unit may produce.
pub type WorkError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by executions and the pooled executor.
///
/// Cloneable so a captured failure cause can be re-surfaced on every
/// subsequent `poll` of the same handle.
#[derive(Error, Debug, Clone)]
pub enum ExecError {
  /// The work unit ran and returned an error.
  #[error("work unit failed: {0}")]
  WorkFailed(Arc<dyn std::error::Error + Send + Sync + 'static>),

  /// The work unit panicked; the payload is preserved as text.
  #[error("work unit panicked: {0}")]
  Panicked(String),

  /// The execution was torn down before producing an outcome, e.g. it was
  /// cancelled mid-flight or its pool shut down before running it.
  #[error("execution was interrupted before completion")]
  Interrupted,

  /// The target pool is shutting down and rejected the submission.
  #[error("worker pool is shutting down, cannot accept new work")]
  PoolShutDown,
}
