use crate::error::WorkError;

use std::future::Future;
use std::pin::Pin;

/// The deferred computation an [`Execution`](crate::Execution) runs.
///
/// A work unit is a future producing exactly one value or one error. It must
/// be `Send` and `'static` so a worker pool can run it on any of its threads.
pub type WorkUnit<R> = Pin<Box<dyn Future<Output = Result<R, WorkError>> + Send + 'static>>;
