//! Concurrency scheduler.
//!
//! Concurrent tests run under a counting semaphore; tests that opt out run
//! one at a time once every concurrent test has finished. Results come back
//! in discovery order regardless of completion order.
//!
//! Every test runs on its own task. A test whose task panics or is cancelled
//! is reported as failed instead of taking the run down with it.

use crate::runner::TestCase;
use crate::schema::Settings;
use std::num::NonZeroUsize;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinError;

/// Runs discovered tests with bounded parallelism.
#[derive(Debug, Clone)]
pub struct Scheduler {
    max_parallel: usize,
}

impl Scheduler {
    /// `maxthreads` of zero or less means one slot per available CPU.
    pub fn new(settings: &Settings) -> Self {
        let max_parallel = match usize::try_from(settings.max_threads) {
            Ok(n) if n > 0 => n.min(Semaphore::MAX_PERMITS),
            _ => std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
        };
        Self { max_parallel }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Run every test on a fresh multi-threaded runtime.
    pub fn run(&self, tests: Vec<TestCase>) -> std::io::Result<Vec<TestCase>> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        Ok(runtime.block_on(self.run_all(tests)))
    }

    /// Run the concurrent group, wait for all of it, then the serial group.
    pub async fn run_all(&self, tests: Vec<TestCase>) -> Vec<TestCase> {
        let total = tests.len();
        let (concurrent, serial): (Vec<_>, Vec<_>) = tests
            .into_iter()
            .enumerate()
            .partition(|(_, case)| case.concurrent());

        tracing::info!(
            concurrent = concurrent.len(),
            serial = serial.len(),
            max_parallel = self.max_parallel,
            "scheduling tests"
        );

        let mut indexed_results: Vec<(usize, TestCase)> = Vec::with_capacity(total);
        let gate = Arc::new(Semaphore::new(self.max_parallel()));
        let mut running = Vec::with_capacity(concurrent.len());

        for (idx, case) in concurrent {
            // The gate is never closed, so a permit is always handed out.
            let permit = Arc::clone(&gate).acquire_owned().await.ok();
            tracing::debug!(test = %case.name, "admitted");
            let snapshot = case.clone();
            let handle = tokio::spawn(async move {
                let case = run_case(case).await;
                drop(permit);
                case
            });
            running.push((idx, snapshot, handle));
        }

        for (idx, snapshot, handle) in running {
            indexed_results.push((idx, settle(snapshot, handle.await)));
        }

        for (idx, case) in serial {
            let snapshot = case.clone();
            let joined = tokio::spawn(run_case(case)).await;
            indexed_results.push((idx, settle(snapshot, joined)));
        }

        indexed_results.sort_by_key(|(idx, _)| *idx);
        indexed_results.into_iter().map(|(_, case)| case).collect()
    }
}

async fn run_case(mut case: TestCase) -> TestCase {
    case.run().await;
    case
}

/// The finished test, or its state from before the run marked failed when
/// its task never returned it.
fn settle(snapshot: TestCase, joined: Result<TestCase, JoinError>) -> TestCase {
    let error = match joined {
        Ok(case) => return case,
        Err(error) => error,
    };

    let mut case = snapshot;
    let reason = if error.is_panic() {
        format!("Test panicked: {}", panic_message(&*error.into_panic()))
    } else {
        format!("Test did not complete: {error}")
    };
    tracing::error!(test = %case.name, "{reason}");
    case.result.fail(reason);
    case
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown cause"
    }
}
