use crate::error::ExecError;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// The category of worker pool a work unit should run on.
///
/// The mapping from a kind to a concrete pool configuration (thread count,
/// queueing) is entirely the [`PoolProvider`]'s responsibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
  /// CPU-bound work.
  Cpu,
  /// I/O-bound work that spends most of its time waiting.
  Io,
  /// Short, lightweight work.
  Light,
}

/// The zero-argument runnable a worker pool executes.
pub type Runnable = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A pool of workers that executes submitted runnables.
pub trait WorkerPool: Send + Sync {
  /// Hands `runnable` to the pool for execution on some worker thread and
  /// returns the token used to request cooperative interruption of that run.
  ///
  /// Must not block on the runnable's completion.
  ///
  /// # Errors
  /// Returns [`ExecError::PoolShutDown`] if the pool no longer accepts work.
  /// The rejected runnable is dropped.
  fn execute(&self, runnable: Runnable) -> Result<CancellationToken, ExecError>;
}

/// Maps a [`PoolKind`] to a worker pool.
///
/// Handles receive a provider at construction rather than reaching into
/// process-wide state, so they can be exercised with a fake provider.
pub trait PoolProvider: Send + Sync {
  fn pool(&self, kind: PoolKind) -> Arc<dyn WorkerPool>;
}
