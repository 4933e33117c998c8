//! Sweep engine: drives a whole sweep, one configuration at a time.
//!
//! [`SweepController::run`] is the loop itself. [`SweepEngine::start`] puts
//! that loop on a dedicated `sweep-worker` thread with its own runtime, so
//! the caller keeps its own context free and talks to the worker only
//! through the cancel flag, the progress callback, and the store handed back
//! by [`SweepEngine::wait`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, info, warn};

use crate::error::{Result, SweepError};
use crate::models::{Configuration, MeasurementOutcome, SweepProgress};
use crate::monitor::{Benchmark, RunOutcome};
use crate::report::{FailureKind, SweepSummary};
use crate::space::ConfigurationSpace;
use crate::storage::ResultStore;

/// Cooperative cancellation shared between the caller and the worker.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; observed at the next check.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Per-configuration result as seen by the controller.
enum Step {
    Measured(MeasurementOutcome),
    Failed(FailureKind, String, Option<String>),
    Cancelled,
}

/// Owns the cancel flag of one sweep at a time.
#[derive(Debug, Default)]
pub struct SweepController {
    cancel: CancelFlag,
    running: AtomicBool,
}

impl SweepController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle on the flag `stop` sets, for signal handlers and the like.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Whether `run` is in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the running sweep to stop. A no-op when nothing is running.
    pub fn stop(&self) {
        if self.is_running() {
            info!("Stop requested");
            self.cancel.cancel();
        }
    }

    /// Sweep `space`, skipping configurations already in `store`.
    ///
    /// Only storage errors end the sweep early with an error; every
    /// per-configuration failure is logged and counted in the summary.
    /// `progress` runs on the calling task after each successful write.
    pub async fn run<B, P>(
        &self,
        space: &ConfigurationSpace,
        store: &ResultStore,
        benchmark: &B,
        progress: P,
    ) -> Result<SweepSummary>
    where
        B: Benchmark,
        P: Fn(SweepProgress),
    {
        let _running = self.enter()?;

        let total = space.total();
        let mut summary = SweepSummary::new(total, store.size()?);
        info!(total, tested = summary.tested, "Starting sweep");

        for configuration in space.enumerate() {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            if store.contains(&configuration)? {
                debug!(configuration = %configuration, "Already tested, skipping");
                summary.resumed += 1;
                continue;
            }

            match self.measure_one(&configuration, benchmark).await? {
                Step::Measured(outcome) => {
                    store.put(&configuration, &outcome)?;
                    summary.record_success();
                    info!(
                        configuration = %configuration,
                        aggregate = outcome.aggregate(),
                        progress = %summary.progress(),
                        "Measured"
                    );
                    progress(summary.progress());
                }
                Step::Failed(kind, reason, output) => {
                    warn!(
                        command = %benchmark.describe(&configuration),
                        kind = %kind,
                        reason = %reason,
                        output = output.as_deref().unwrap_or(""),
                        "Configuration failed, skipping"
                    );
                    summary.record_failure(configuration, kind, reason);
                }
                Step::Cancelled => {
                    summary.cancelled = true;
                    break;
                }
            }
        }

        if summary.cancelled {
            info!(summary = %summary, "Sweep cancelled");
        } else {
            info!(summary = %summary, "Sweep finished");
        }
        Ok(summary)
    }

    /// The unit of work for one configuration.
    async fn measure_one<B: Benchmark>(
        &self,
        configuration: &Configuration,
        benchmark: &B,
    ) -> Result<Step> {
        match benchmark.measure(configuration, &self.cancel).await {
            Ok(RunOutcome::Succeeded { samples }) => {
                Ok(Step::Measured(MeasurementOutcome::from_samples(samples)))
            }
            Ok(RunOutcome::Cancelled) => Ok(Step::Cancelled),
            Ok(failed @ RunOutcome::FailedEarlyExit { .. }) => Ok(Step::Failed(
                FailureKind::EarlyExit,
                failed.failure_reason().unwrap_or_default(),
                failed.output().map(str::to_string),
            )),
            Ok(failed @ RunOutcome::FailedTimeout { .. }) => Ok(Step::Failed(
                FailureKind::Timeout,
                failed.failure_reason().unwrap_or_default(),
                failed.output().map(str::to_string),
            )),
            Err(e) => match FailureKind::of_error(&e) {
                Some(kind) => Ok(Step::Failed(kind, e.to_string(), None)),
                None => Err(e),
            },
        }
    }

    fn enter(&self) -> Result<RunningGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| SweepError::AlreadyRunning)?;
        // A stop racing with the end of the previous run may have left it set.
        self.cancel.reset();
        Ok(RunningGuard { controller: self })
    }
}

/// Clears the running state and the cancel flag when a run ends.
struct RunningGuard<'a> {
    controller: &'a SweepController,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.controller.cancel.reset();
        self.controller.running.store(false, Ordering::SeqCst);
    }
}

/// What a finished worker hands back.
#[derive(Debug)]
pub struct CompletedSweep {
    pub summary: SweepSummary,
    pub store: ResultStore,
}

/// A sweep running on its own worker thread.
pub struct SweepEngine {
    cancel: CancelFlag,
    handle: Option<JoinHandle<Result<CompletedSweep>>>,
}

impl SweepEngine {
    /// Spawn the worker and start sweeping immediately.
    pub fn start<B, P>(
        space: ConfigurationSpace,
        store: ResultStore,
        benchmark: B,
        progress: P,
    ) -> Result<Self>
    where
        B: Benchmark + Send + 'static,
        P: Fn(SweepProgress) + Send + 'static,
    {
        let controller = SweepController::new();
        let cancel = controller.cancel_flag();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let handle = std::thread::Builder::new()
            .name("sweep-worker".to_string())
            .spawn(move || -> Result<CompletedSweep> {
                let summary =
                    runtime.block_on(controller.run(&space, &store, &benchmark, progress))?;
                Ok(CompletedSweep { summary, store })
            })?;

        info!("Sweep worker started");
        Ok(Self {
            cancel,
            handle: Some(handle),
        })
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Request cancellation. Idempotent, and a no-op once the worker is done.
    pub fn stop(&self) {
        if !self.is_finished() {
            self.cancel.cancel();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Block until the worker exits.
    pub fn wait(mut self) -> Result<CompletedSweep> {
        self.join()
    }

    fn join(&mut self) -> Result<CompletedSweep> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| SweepError::WorkerPanicked)?,
            None => Err(SweepError::WorkerPanicked),
        }
    }
}

impl Drop for SweepEngine {
    fn drop(&mut self) {
        // Never leave a worker (and its child process) running behind us.
        if self.handle.is_some() {
            self.cancel.cancel();
            let _ = self.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Axis, Sample};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Measures `--a` as the magnitude; `fail` values exit early.
    #[derive(Default)]
    struct FakeBenchmark {
        calls: AtomicUsize,
        cancel_after: Option<usize>,
    }

    impl Benchmark for FakeBenchmark {
        async fn measure(&self, configuration: &Configuration, cancel: &CancelFlag) -> Result<RunOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if Some(call) == self.cancel_after {
                cancel.cancel();
            }
            match configuration.get("--a") {
                Some("fail") => Ok(RunOutcome::FailedEarlyExit {
                    exit: "1".into(),
                    output: "bad launch config".into(),
                }),
                Some("hang") => Ok(RunOutcome::FailedTimeout {
                    scans: 3,
                    output: String::new(),
                }),
                Some("garbage") => Err(SweepError::Parse {
                    fragment: "x k".into(),
                }),
                Some("lost") => Err(SweepError::Monitor {
                    command: "bench --a lost".into(),
                    source: std::io::Error::other("wait failed"),
                }),
                Some(value) => Ok(RunOutcome::Succeeded {
                    samples: vec![Sample::new(value.parse().unwrap_or(0.0), "k")],
                }),
                None => Ok(RunOutcome::Cancelled),
            }
        }
    }

    fn space(values: &[&str]) -> ConfigurationSpace {
        ConfigurationSpace::new(vec![
            Axis::new("--a", values.iter().copied()),
            Axis::new("--b", ["x", "y"]),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_full_sweep_stores_every_success() {
        let controller = SweepController::new();
        let store = ResultStore::open_in_memory().unwrap();
        let bench = FakeBenchmark::default();
        let seen = Mutex::new(Vec::new());

        let summary = controller
            .run(&space(&["1", "2"]), &store, &bench, |p| seen.lock().unwrap().push(p))
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 4);
        assert_eq!(store.size().unwrap(), 4);
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen.last(), Some(&SweepProgress { tested: 4, total: 4 }));
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let controller = SweepController::new();
        let store = ResultStore::open_in_memory().unwrap();
        let s = space(&["1", "2", "3"]);

        controller.run(&s, &store, &FakeBenchmark::default(), |_| {}).await.unwrap();

        let bench = FakeBenchmark::default();
        let summary = controller.run(&s, &store, &bench, |_| {}).await.unwrap();
        assert_eq!(bench.calls.load(Ordering::SeqCst), 0);
        assert_eq!(summary.resumed, 6);
        assert_eq!(summary.tested, 6);
        assert_eq!(summary.succeeded, 0);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_sweep() {
        let controller = SweepController::new();
        let store = ResultStore::open_in_memory().unwrap();
        let progress_calls = AtomicUsize::new(0);

        let summary = controller
            .run(
                &space(&["fail", "hang", "garbage", "5"]),
                &store,
                &FakeBenchmark::default(),
                |_| {
                    progress_calls.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await
            .unwrap();

        assert_eq!(summary.early_exits, 2);
        assert_eq!(summary.timeouts, 2);
        assert_eq!(summary.parse_failures, 2);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.tested, 2);
        assert_eq!(store.size().unwrap(), 2);
        assert_eq!(progress_calls.load(Ordering::SeqCst), 2);
        assert!(summary.failures[0].reason.contains("early-exit"));
    }

    #[tokio::test]
    async fn test_cancellation_leaves_store_consistent() {
        let controller = SweepController::new();
        let store = ResultStore::open_in_memory().unwrap();
        let bench = FakeBenchmark {
            cancel_after: Some(3),
            ..Default::default()
        };

        let summary = controller
            .run(&space(&["1", "2", "3", "4"]), &store, &bench, |_| {})
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(bench.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.size().unwrap(), 3);
        for entry in store.entries().unwrap() {
            assert!(entry.outcome.is_success());
        }
        // Flag is cleared once the run is over.
        assert!(!controller.cancel_flag().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_outcome_is_not_stored() {
        let controller = SweepController::new();
        let store = ResultStore::open_in_memory().unwrap();
        // No `--a` axis: the fake reports a cancelled run.
        let s = ConfigurationSpace::new(vec![Axis::new("--b", ["x", "y"])]).unwrap();
        let bench = FakeBenchmark::default();

        let summary = controller.run(&s, &store, &bench, |_| {}).await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(bench.calls.load(Ordering::SeqCst), 1);
        assert!(store.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_lost_process_only_fails_its_configuration() {
        let controller = SweepController::new();
        let store = ResultStore::open_in_memory().unwrap();

        let summary = controller
            .run(&space(&["lost", "7"]), &store, &FakeBenchmark::default(), |_| {})
            .await
            .unwrap();

        assert_eq!(summary.monitor_failures, 2);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failures[0].kind, FailureKind::Monitor);
    }

    #[tokio::test]
    async fn test_stale_cancel_does_not_abort_next_run() {
        let controller = SweepController::new();
        let store = ResultStore::open_in_memory().unwrap();
        // A stop that lands just after the previous run ended.
        controller.cancel_flag().cancel();

        let summary = controller
            .run(&space(&["1"]), &store, &FakeBenchmark::default(), |_| {})
            .await
            .unwrap();
        assert!(!summary.cancelled);
        assert_eq!(summary.succeeded, 2);
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let controller = SweepController::new();
        controller.stop();
        controller.stop();
        assert!(!controller.cancel_flag().is_cancelled());
    }

    #[test]
    fn test_engine_runs_on_worker_and_returns_store() {
        let store = ResultStore::open_in_memory().unwrap();
        let engine =
            SweepEngine::start(space(&["1", "2"]), store, FakeBenchmark::default(), |_| {}).unwrap();
        let completed = engine.wait().unwrap();
        assert_eq!(completed.summary.succeeded, 4);
        assert_eq!(completed.store.size().unwrap(), 4);
    }

    #[test]
    fn test_engine_stop_after_finish_is_noop() {
        let store = ResultStore::open_in_memory().unwrap();
        let engine =
            SweepEngine::start(space(&["1"]), store, FakeBenchmark::default(), |_| {}).unwrap();
        while !engine.is_finished() {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        engine.stop();
        engine.stop();
        let completed = engine.wait().unwrap();
        assert!(!completed.summary.cancelled);
    }
}
