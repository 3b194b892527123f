use background_exec::{ExecError, Execution, PoolKind, PoolSizes, RuntimePoolProvider, ShutdownMode, TaskState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,background_exec=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

fn sized_provider(cpu: usize) -> Arc<RuntimePoolProvider> {
  Arc::new(RuntimePoolProvider::with_sizes(
    tokio::runtime::Handle::current(),
    PoolSizes { cpu, io: 2, light: 1 },
  ))
}

#[tokio::test]
async fn test_concurrency_limit_serializes_runs() {
  setup_tracing_for_test();
  let provider = sized_provider(1);
  let completion_order = Arc::new(parking_lot::Mutex::new(Vec::new()));

  let mut execs = Vec::new();
  for task_number in 1..=3u64 {
    let order = completion_order.clone();
    let exec = Execution::new(
      provider.clone(),
      Box::pin(async move {
        sleep(Duration::from_millis(100 + task_number * 20)).await;
        order.lock().push(task_number);
        Ok(task_number)
      }),
    );
    exec.start(PoolKind::Cpu).unwrap();
    execs.push(exec);
  }

  // with a single permit, only one run is active at a time
  sleep(Duration::from_millis(30)).await;
  assert_eq!(provider.executor(PoolKind::Cpu).active_run_count(), 1);

  for exec in &execs {
    assert_eq!(exec.wait().await, TaskState::Succeeded);
  }
  assert_eq!(*completion_order.lock(), vec![1, 2, 3]);

  sleep(Duration::from_millis(30)).await;
  assert_eq!(provider.executor(PoolKind::Cpu).active_run_count(), 0);

  provider.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_graceful_shutdown_finishes_active_and_drops_queued() {
  setup_tracing_for_test();
  let provider = sized_provider(1);

  let first_finished = Arc::new(AtomicBool::new(false));
  let first_flag = first_finished.clone();
  let first = Execution::new(
    provider.clone(),
    Box::pin(async move {
      sleep(Duration::from_millis(300)).await;
      first_flag.store(true, Ordering::SeqCst);
      Ok(())
    }),
  );
  first.start(PoolKind::Cpu).unwrap();

  let second_ran = Arc::new(AtomicBool::new(false));
  let second_flag = second_ran.clone();
  let second = Execution::new(
    provider.clone(),
    Box::pin(async move {
      second_flag.store(true, Ordering::SeqCst);
      Ok(())
    }),
  );
  second.start(PoolKind::Cpu).unwrap();

  sleep(Duration::from_millis(50)).await;
  provider.shutdown(ShutdownMode::Graceful).await.unwrap();

  assert_eq!(first.wait().await, TaskState::Succeeded);
  assert!(first_finished.load(Ordering::SeqCst));

  // the queued run was dropped unrun, but still reached a terminal state
  assert_eq!(second.wait().await, TaskState::Failed);
  assert!(matches!(second.failure_cause(), Some(ExecError::Interrupted)));
  assert!(!second_ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_forceful_shutdown_cancels_active_runs() {
  setup_tracing_for_test();
  let provider = sized_provider(2);

  let mut execs = Vec::new();
  let mut flags = Vec::new();
  for _ in 0..2 {
    let finished = Arc::new(AtomicBool::new(false));
    let flag = finished.clone();
    let exec = Execution::new(
      provider.clone(),
      Box::pin(async move {
        sleep(Duration::from_secs(30)).await;
        flag.store(true, Ordering::SeqCst);
        Ok(())
      }),
    );
    exec.start(PoolKind::Cpu).unwrap();
    execs.push(exec);
    flags.push(finished);
  }

  sleep(Duration::from_millis(50)).await;
  assert_eq!(provider.executor(PoolKind::Cpu).active_run_count(), 2);

  provider.shutdown(ShutdownMode::ForcefulCancel).await.unwrap();

  for exec in &execs {
    assert_eq!(exec.wait().await, TaskState::Failed);
    assert!(matches!(exec.failure_cause(), Some(ExecError::Interrupted)));
  }
  for finished in &flags {
    assert!(!finished.load(Ordering::SeqCst), "forcefully cancelled run must not finish");
  }
}

#[tokio::test]
async fn test_submit_to_shut_down_provider_is_rejected() {
  setup_tracing_for_test();
  let provider = sized_provider(1);
  provider.shutdown(ShutdownMode::Graceful).await.unwrap();

  let exec = Execution::from_fn(provider.clone(), || Ok(5));
  let submit_result = exec.start(PoolKind::Cpu);
  assert!(matches!(submit_result, Err(ExecError::PoolShutDown)));

  // the handle still lands in a terminal state rather than hanging in Running
  assert_eq!(exec.state(), TaskState::Failed);
  assert!(matches!(exec.failure_cause(), Some(ExecError::Interrupted)));
  assert!(matches!(exec.poll(PoolKind::Cpu), Err(ExecError::Interrupted)));
  assert_eq!(exec.take_result(), None);
}

#[tokio::test]
async fn test_run_cancelled_while_queued_is_dropped_unrun() {
  setup_tracing_for_test();
  let provider = sized_provider(1);

  let first = Execution::new(
    provider.clone(),
    Box::pin(async {
      sleep(Duration::from_millis(200)).await;
      Ok(1)
    }),
  );
  first.start(PoolKind::Cpu).unwrap();

  let second_ran = Arc::new(AtomicBool::new(false));
  let second_flag = second_ran.clone();
  let second = Execution::new(
    provider.clone(),
    Box::pin(async move {
      second_flag.store(true, Ordering::SeqCst);
      Ok(2)
    }),
  );
  second.start(PoolKind::Cpu).unwrap();

  sleep(Duration::from_millis(20)).await;
  second.cancel();

  assert_eq!(second.wait().await, TaskState::Failed);
  assert!(matches!(second.failure_cause(), Some(ExecError::Interrupted)));
  assert!(!second_ran.load(Ordering::SeqCst));

  assert_eq!(first.wait().await, TaskState::Succeeded);
  assert_eq!(first.take_result(), Some(1));

  provider.shutdown(ShutdownMode::Graceful).await.unwrap();
}
