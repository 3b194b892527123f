//! Handles for single-result background computations, with lazy submission
//! to kind-selected worker pools, polling, and cooperative cancellation.

mod error;
mod executor;
mod handle;
mod pool;
mod work;

pub use error::{ExecError, WorkError};
pub use executor::{PoolSizes, PooledExecutor, RuntimePoolProvider, ShutdownMode};
pub use handle::{Execution, TaskState};
pub use pool::{PoolKind, PoolProvider, Runnable, WorkerPool};
pub use work::WorkUnit;
