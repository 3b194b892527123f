use crate::error::{ExecError, WorkError};
use crate::pool::{PoolKind, PoolProvider, Runnable};
use crate::work::WorkUnit;

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use futures::FutureExt;
use futures_intrusive::sync::ManualResetEvent;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

lazy_static::lazy_static! {
  static ref NEXT_EXEC_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Lifecycle of a background execution. Only ever advances forward:
/// `NotStarted -> Running -> {Succeeded | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
  NotStarted,
  Running,
  Succeeded,
  Failed,
}

/// Per-handle state, guarded by a single lock.
///
/// Invariant: at most one of `result` / `failure` is ever set, and only once
/// `finished` is true. `work` is `Some` exactly until submission takes it.
struct ExecState<R> {
  work: Option<WorkUnit<R>>,
  started: bool,
  finished: bool,
  result: Option<R>,
  failure: Option<ExecError>,
  token: Option<CancellationToken>,
}

struct Shared<R> {
  exec_id: u64,
  provider: Arc<dyn PoolProvider>,
  state: Mutex<ExecState<R>>,
  done: ManualResetEvent,
}

impl<R: Send + 'static> Shared<R> {
  /// Publishes a terminal outcome. The terminal-state flip, the outcome
  /// write, and the release of the cancellation handle all happen under the
  /// same critical section. Returns false if an outcome was already recorded.
  fn complete(&self, outcome: Result<R, ExecError>) -> bool {
    let mut st = self.state.lock();
    if st.finished {
      return false;
    }
    match outcome {
      Ok(value) => st.result = Some(value),
      Err(cause) => st.failure = Some(cause),
    }
    st.finished = true;
    st.token = None;
    drop(st);
    self.done.set();
    true
  }
}

/// Records an interruption if the worker-side future is dropped without
/// having published an outcome, so a handle can never remain `Running` once
/// its run is gone. This covers pool-driven cancellation, executor teardown,
/// and runnables discarded before ever running.
struct CompletionGuard<R: Send + 'static> {
  shared: Arc<Shared<R>>,
}

impl<R: Send + 'static> Drop for CompletionGuard<R> {
  fn drop(&mut self) {
    if self.shared.complete(Err(ExecError::Interrupted)) {
      debug!(
        exec_id = self.shared.exec_id,
        "Execution torn down before completion; recorded interruption."
      );
    }
  }
}

/// A handle to a single unit of deferred work.
///
/// The handle owns the work unit until submission, tracks its lifecycle, and
/// exposes the outcome. Submission is lazy and idempotent: the work unit runs
/// at most once, on a pool selected by [`PoolKind`] through the injected
/// [`PoolProvider`]. Clones share the same underlying execution, so several
/// polling threads can observe one handle.
pub struct Execution<R: Send + 'static> {
  shared: Arc<Shared<R>>,
}

impl<R: Send + 'static> Clone for Execution<R> {
  fn clone(&self) -> Self {
    Self {
      shared: self.shared.clone(),
    }
  }
}

impl<R: Send + 'static> fmt::Debug for Execution<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Execution")
      .field("exec_id", &self.shared.exec_id)
      .field("state", &self.state())
      .finish()
  }
}

impl<R: Send + 'static> Execution<R> {
  /// Wraps `work` in a new handle in state [`TaskState::NotStarted`].
  ///
  /// No side effects beyond storage; nothing runs until [`start`](Self::start)
  /// or [`poll`](Self::poll) submits the work.
  pub fn new(provider: Arc<dyn PoolProvider>, work: WorkUnit<R>) -> Self {
    let exec_id = NEXT_EXEC_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    trace!(exec_id, "Execution handle created.");
    Self {
      shared: Arc::new(Shared {
        exec_id,
        provider,
        state: Mutex::new(ExecState {
          work: Some(work),
          started: false,
          finished: false,
          result: None,
          failure: None,
          token: None,
        }),
        done: ManualResetEvent::new(false),
      }),
    }
  }

  /// Convenience constructor wrapping a plain closure as the work unit.
  pub fn from_fn<F>(provider: Arc<dyn PoolProvider>, f: F) -> Self
  where
    F: FnOnce() -> Result<R, WorkError> + Send + 'static,
  {
    Self::new(provider, Box::pin(async move { f() }))
  }

  /// Returns the process-unique id of this execution, for log correlation.
  pub fn id(&self) -> u64 {
    self.shared.exec_id
  }

  /// Submits the work unit to the pool selected by `kind`.
  ///
  /// Idempotent: any call after the first returns `Ok(())` with no effect,
  /// regardless of `kind`. Returns as soon as the work is handed to the
  /// pool; never blocks on completion.
  ///
  /// # Errors
  /// Returns [`ExecError::PoolShutDown`] if the pool rejected the work. The
  /// handle then lands in [`TaskState::Failed`] (the work never ran and
  /// never will), so later observers see a terminal state rather than a
  /// stuck `Running`.
  pub fn start(&self, kind: PoolKind) -> Result<(), ExecError> {
    let work = {
      let mut st = self.shared.state.lock();
      if st.started {
        trace!(exec_id = self.shared.exec_id, "Start: already started, no-op.");
        return Ok(());
      }
      st.started = true;
      st.work.take()
    };
    let Some(work) = work else {
      return Ok(());
    };

    debug!(exec_id = self.shared.exec_id, pool_kind = ?kind, "Submitting work unit.");
    let runnable = wrap_work(work, self.shared.clone());
    match self.shared.provider.pool(kind).execute(runnable) {
      Ok(token) => {
        let mut st = self.shared.state.lock();
        if !st.finished {
          st.token = Some(token);
        }
        Ok(())
      }
      Err(submit_error) => {
        // The rejected runnable was dropped inside the pool, so its
        // completion guard has already recorded the interruption.
        warn!(
          exec_id = self.shared.exec_id,
          error = %submit_error,
          "Pool rejected the work unit."
        );
        Err(submit_error)
      }
    }
  }

  /// True once submission has transitioned the handle out of `NotStarted`.
  pub fn is_started(&self) -> bool {
    self.shared.state.lock().started
  }

  /// True iff the execution ended in [`TaskState::Failed`].
  pub fn has_failed(&self) -> bool {
    self.shared.state.lock().failure.is_some()
  }

  /// True iff the execution finished with no failure.
  pub fn is_successful(&self) -> bool {
    let st = self.shared.state.lock();
    st.finished && st.failure.is_none()
  }

  /// True once the execution reached a terminal state.
  pub fn is_finished(&self) -> bool {
    self.shared.state.lock().finished
  }

  /// A consistent snapshot of the lifecycle state.
  pub fn state(&self) -> TaskState {
    let st = self.shared.state.lock();
    if !st.started {
      TaskState::NotStarted
    } else if !st.finished {
      TaskState::Running
    } else if st.failure.is_some() {
      TaskState::Failed
    } else {
      TaskState::Succeeded
    }
  }

  /// The captured failure cause, `Some` iff the execution failed.
  pub fn failure_cause(&self) -> Option<ExecError> {
    self.shared.state.lock().failure.clone()
  }

  /// Takes the produced value out of the handle.
  ///
  /// Returns `Some` exactly once, and only after the execution succeeded.
  /// Any other state, or a repeated call, yields `None`.
  pub fn take_result(&self) -> Option<R> {
    let mut st = self.shared.state.lock();
    if st.finished && st.failure.is_none() {
      st.result.take()
    } else {
      None
    }
  }

  /// Requests cooperative interruption of the in-flight run.
  ///
  /// Best-effort: a no-op before submission and after a terminal state, and
  /// a work unit that never yields may still run to completion.
  pub fn cancel(&self) {
    let token = {
      let st = self.shared.state.lock();
      if !st.started || st.finished {
        trace!(exec_id = self.shared.exec_id, "Cancel: nothing in flight, no-op.");
        return;
      }
      st.token.clone()
    };
    if let Some(token) = token {
      debug!(exec_id = self.shared.exec_id, "Cancellation requested.");
      token.cancel();
    }
  }

  /// The composite check operation for polling callers.
  ///
  /// Surfaces a captured failure as `Err` (on this and every later call),
  /// otherwise lazily submits the work via [`start`](Self::start) if needed,
  /// and reports whether the execution has succeeded yet.
  pub fn poll(&self, kind: PoolKind) -> Result<bool, ExecError> {
    {
      let st = self.shared.state.lock();
      if let Some(cause) = &st.failure {
        return Err(cause.clone());
      }
      if st.started {
        return Ok(st.finished);
      }
    }
    self.start(kind)?;
    Ok(self.is_successful())
  }

  /// Waits until the execution reaches a terminal state and returns it.
  ///
  /// A handle that is never started never completes; callers are expected to
  /// have submitted the work first.
  pub async fn wait(&self) -> TaskState {
    self.shared.done.wait().await;
    self.state()
  }
}

/// Builds the runnable handed to the pool: runs the work unit once behind a
/// panic boundary and a completion guard, then publishes the outcome.
fn wrap_work<R: Send + 'static>(work: WorkUnit<R>, shared: Arc<Shared<R>>) -> Runnable {
  Box::pin(async move {
    let _guard = CompletionGuard {
      shared: shared.clone(),
    };
    trace!(exec_id = shared.exec_id, "Work unit starting.");
    match AssertUnwindSafe(work).catch_unwind().await {
      Ok(Ok(value)) => {
        trace!(exec_id = shared.exec_id, "Work unit produced a value.");
        shared.complete(Ok(value));
      }
      Ok(Err(cause)) => {
        debug!(exec_id = shared.exec_id, error = %cause, "Work unit returned an error.");
        shared.complete(Err(ExecError::WorkFailed(cause.into())));
      }
      Err(panic_payload) => {
        error!(exec_id = shared.exec_id, "Work unit panicked during execution.");
        shared.complete(Err(ExecError::Panicked(panic_message(panic_payload))));
      }
    }
  })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
