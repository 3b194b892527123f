use crate::error::ExecError;
use crate::pool::{PoolKind, PoolProvider, Runnable, WorkerPool};

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Defines how an executor should behave upon shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Active runs complete; queued runnables that haven't started are dropped.
  Graceful,
  /// Cancels all active runs; queued runnables that haven't started are dropped.
  ForcefulCancel,
}

struct QueuedRun {
  run_id: u64,
  token: CancellationToken,
  runnable: Runnable,
}

/// A named, concurrency-limited worker pool backed by a Tokio runtime.
///
/// Submitted runnables are queued and picked up by an internal worker loop
/// that gates concurrency with a semaphore. Each run gets its own
/// [`CancellationToken`]; triggering it tears the run down at its next await
/// point. Dropping the executor signals shutdown without blocking.
pub struct PooledExecutor {
  pool_name: Arc<String>,
  semaphore: Arc<Semaphore>,
  queue_tx: mpsc::UnboundedSender<QueuedRun>,
  active_runs: Arc<DashMap<u64, CancellationToken>>,
  shutdown_token: CancellationToken,
  worker_join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl PooledExecutor {
  pub fn new(concurrency_limit: usize, tokio_handle: TokioHandle, pool_name: &str) -> Arc<Self> {
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let shutdown_token = CancellationToken::new();

    let executor = Arc::new(Self {
      pool_name: Arc::new(pool_name.to_string()),
      semaphore: Arc::new(Semaphore::new(concurrency_limit.max(1))),
      queue_tx,
      active_runs: Arc::new(DashMap::new()),
      shutdown_token: shutdown_token.clone(),
      worker_join_handle: Mutex::new(None),
    });

    let worker_pool_name = executor.pool_name.clone();
    let worker_semaphore = executor.semaphore.clone();
    let worker_active_runs = executor.active_runs.clone();
    let worker_tokio_handle = tokio_handle.clone();

    let worker_loop_join_handle = tokio_handle.spawn(
      Self::run_worker_loop(
        worker_pool_name,
        worker_semaphore,
        queue_rx,
        worker_tokio_handle,
        worker_active_runs,
        shutdown_token,
      )
      .instrument(info_span!("pooled_executor_worker_loop", name = %pool_name)),
    );
    *executor.worker_join_handle.lock() = Some(worker_loop_join_handle);

    executor
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  /// Number of runs currently executing (not counting queued ones).
  pub fn active_run_count(&self) -> usize {
    self.active_runs.len()
  }

  /// Shuts the executor down and waits for its worker loop to terminate.
  ///
  /// Queued runnables that were never dequeued are dropped either way; with
  /// [`ShutdownMode::ForcefulCancel`] every active run's token is triggered
  /// as well. Safe to call concurrently with `Drop` or a second `shutdown`.
  pub async fn shutdown(self: Arc<Self>, mode: ShutdownMode) -> Result<(), ExecError> {
    let already_initiating_shutdown = self.shutdown_token.is_cancelled();

    if !already_initiating_shutdown {
      info!(pool_name = %*self.pool_name, "Initiating executor shutdown (mode: {:?}).", mode);
      self.shutdown_token.cancel();

      if mode == ShutdownMode::ForcefulCancel {
        let runs_to_cancel: Vec<(u64, CancellationToken)> = self
          .active_runs
          .iter()
          .map(|entry| (*entry.key(), entry.value().clone()))
          .collect();
        for (run_id, token) in runs_to_cancel {
          debug!(pool_name = %*self.pool_name, %run_id, "Forcefully cancelling active run during shutdown.");
          token.cancel();
        }
      }
    } else {
      info!(pool_name = %*self.pool_name, "Shutdown already in progress or initiated by another call/Drop.");
    }

    let handle_to_await = self.worker_join_handle.lock().take();
    if let Some(handle) = handle_to_await {
      if let Err(join_error) = handle.await {
        error!(
          pool_name = %*self.pool_name,
          "Error joining worker loop during shutdown: {:?}.", join_error
        );
      } else {
        debug!(pool_name = %*self.pool_name, "Worker loop joined.");
      }
    }
    Ok(())
  }

  async fn run_worker_loop(
    pool_name: Arc<String>,
    semaphore: Arc<Semaphore>,
    mut queue_rx: mpsc::UnboundedReceiver<QueuedRun>,
    runs_tokio_handle: TokioHandle,
    active_runs: Arc<DashMap<u64, CancellationToken>>,
    shutdown_token: CancellationToken,
  ) {
    info!(name = %*pool_name, "Worker loop started.");

    loop {
      tokio::select! {
        biased;

        _ = shutdown_token.cancelled() => {
          info!(name = %*pool_name, "Shutdown signal received. Worker loop terminating.");
          break;
        }

        permit_acquisition_result = semaphore.clone().acquire_owned() => {
          let permit = match permit_acquisition_result {
            Ok(p) => p,
            Err(_) => {
              error!(name = %*pool_name, "Semaphore closed. Worker loop exiting.");
              break;
            }
          };
          trace!(name = %*pool_name, "Acquired permit. Available: {}", semaphore.available_permits());

          let (run, permit): (QueuedRun, OwnedSemaphorePermit) = tokio::select! {
            biased;
            _ = shutdown_token.cancelled() => {
              info!(name = %*pool_name, "Shutdown signal received while waiting for a runnable. Releasing permit.");
              drop(permit);
              break;
            }
            received = queue_rx.recv() => {
              match received {
                Some(run) => (run, permit),
                None => {
                  info!(name = %*pool_name, "Submit queue closed and drained. Worker loop terminating.");
                  drop(permit);
                  break;
                }
              }
            }
          };

          if run.token.is_cancelled() {
            // Dropping the runnable unrun lets any completion guard inside
            // it record the interruption.
            debug!(name = %*pool_name, run_id = run.run_id, "Dequeued runnable already cancelled; dropping unrun.");
            drop(run.runnable);
            drop(permit);
            continue;
          }

          let run_id = run.run_id;
          let run_token = run.token;
          let runnable = run.runnable;

          active_runs.insert(run_id, run_token.clone());
          debug!(name = %*pool_name, %run_id, "Dequeued runnable. Spawning with permit.");

          let active_runs_cleanup = active_runs.clone();
          let pool_name_for_run = pool_name.clone();
          let pool_name_for_span = pool_name.clone();

          runs_tokio_handle.spawn({
            let permit_guard = permit;
            async move {
              let _local_permit_guard = permit_guard;

              tokio::select! {
                biased;
                _ = run_token.cancelled() => {
                  // The runnable is dropped mid-flight; its guard records
                  // the interruption.
                  debug!(pool_name = %*pool_name_for_run, %run_id, "Run interrupted by its cancellation token.");
                }
                run_result = AssertUnwindSafe(runnable).catch_unwind() => {
                  match run_result {
                    Ok(()) => {
                      trace!(pool_name = %*pool_name_for_run, %run_id, "Run finished.");
                    }
                    Err(_panic_payload) => {
                      error!(pool_name = %*pool_name_for_run, %run_id, "Run panicked during execution.");
                    }
                  }
                }
              }
            }
            .instrument(info_span!("pooled_run", pool_name = %*pool_name_for_span, %run_id))
            .then(move |_| {
              active_runs_cleanup.remove(&run_id);
              trace!(%run_id, "Run finished processing, removed active info.");
              async {}
            })
          });
        }
      }
    }

    info!(
      name = %*pool_name,
      "Worker loop stopped. Active runs remaining: {}",
      active_runs.len()
    );
  }
}

impl WorkerPool for PooledExecutor {
  fn execute(&self, runnable: Runnable) -> Result<CancellationToken, ExecError> {
    if self.shutdown_token.is_cancelled() {
      warn!(pool_name = %*self.pool_name, "Execute: executor is shutting down; rejecting runnable.");
      return Err(ExecError::PoolShutDown);
    }

    let run_id = NEXT_RUN_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    let token = CancellationToken::new();
    let queued = QueuedRun {
      run_id,
      token: token.clone(),
      runnable,
    };
    debug!(pool_name = %*self.pool_name, %run_id, "Queueing runnable.");

    match self.queue_tx.send(queued) {
      Ok(()) => Ok(token),
      Err(_send_error) => {
        // The worker receiver is gone; the rejected runnable inside the
        // send error is dropped here.
        error!(pool_name = %*self.pool_name, %run_id, "Execute: failed to queue runnable, worker loop is gone.");
        Err(ExecError::PoolShutDown)
      }
    }
  }
}

impl Drop for PooledExecutor {
  fn drop(&mut self) {
    if !self.shutdown_token.is_cancelled() {
      info!(
        pool_name = %*self.pool_name,
        "PooledExecutor dropped. Initiating implicit shutdown (signaling worker loop to stop)."
      );
      // Signal only; Drop must not block on the worker loop. The queue
      // sender is dropped with self, which closes the queue.
      self.shutdown_token.cancel();
    } else {
      trace!(pool_name = %*self.pool_name, "Drop: shutdown already in progress. No new signals sent.");
    }
  }
}

/// Per-kind concurrency limits for [`RuntimePoolProvider`].
#[derive(Debug, Clone, Copy)]
pub struct PoolSizes {
  pub cpu: usize,
  pub io: usize,
  pub light: usize,
}

impl Default for PoolSizes {
  fn default() -> Self {
    let parallelism = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    Self {
      cpu: parallelism,
      io: parallelism * 4,
      light: 2,
    }
  }
}

/// The default [`PoolProvider`]: one [`PooledExecutor`] per [`PoolKind`],
/// all running on the supplied Tokio handle.
///
/// Thread count, queueing, and shutdown stay entirely on this side of the
/// provider trait; handles only submit.
pub struct RuntimePoolProvider {
  cpu: Arc<PooledExecutor>,
  io: Arc<PooledExecutor>,
  light: Arc<PooledExecutor>,
}

impl RuntimePoolProvider {
  pub fn new(tokio_handle: TokioHandle) -> Self {
    Self::with_sizes(tokio_handle, PoolSizes::default())
  }

  pub fn with_sizes(tokio_handle: TokioHandle, sizes: PoolSizes) -> Self {
    Self {
      cpu: PooledExecutor::new(sizes.cpu, tokio_handle.clone(), "cpu"),
      io: PooledExecutor::new(sizes.io, tokio_handle.clone(), "io"),
      light: PooledExecutor::new(sizes.light, tokio_handle, "light"),
    }
  }

  /// Direct access to the executor behind a kind, e.g. for run counts.
  pub fn executor(&self, kind: PoolKind) -> &Arc<PooledExecutor> {
    match kind {
      PoolKind::Cpu => &self.cpu,
      PoolKind::Io => &self.io,
      PoolKind::Light => &self.light,
    }
  }

  /// Shuts all three executors down with the same mode.
  pub async fn shutdown(&self, mode: ShutdownMode) -> Result<(), ExecError> {
    self.cpu.clone().shutdown(mode).await?;
    self.io.clone().shutdown(mode).await?;
    self.light.clone().shutdown(mode).await?;
    Ok(())
  }
}

impl PoolProvider for RuntimePoolProvider {
  fn pool(&self, kind: PoolKind) -> Arc<dyn WorkerPool> {
    self.executor(kind).clone()
  }
}
