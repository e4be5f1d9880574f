//! Trial scheduling.
//!
//! Trials are grouped per source file. Each file gets one task that walks its
//! trials in submission order, so a file is never mutated by two trials at
//! once; a semaphore sized by `worker_count` bounds how many trials run
//! across all files. Individual trial failures become outcomes. A fatal
//! apply error (the tree may be left modified) halts scheduling, lets
//! in-flight trials restore, and is returned once everything has drained.

use super::applier::{ApplyError, MutationApplier};
use super::cache::{CacheKey, ResultCache};
use super::executor::{TestExecutor, TestTarget};
use super::{Mutation, MutationResult, TrialOutcome};
use crate::config::Config;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("trial worker panicked: {0}")]
    WorkerPanicked(String),
}

/// One mutant paired with the test that judges it.
#[derive(Debug, Clone)]
pub struct Trial {
    pub mutation: Mutation,
    pub target: TestTarget,
    /// Hash of the unmodified source file
    pub content_hash: String,
    /// Hash of the test file; editing a test invalidates its verdicts
    pub test_hash: String,
}

impl Trial {
    pub fn cache_key(&self) -> CacheKey {
        let target = format!("{}#{}", self.target.key(), self.test_hash);
        CacheKey::new(self.content_hash.clone(), self.mutation.signature(&target))
    }
}

pub struct ParallelCoordinator {
    config: Arc<Config>,
    applier: Arc<MutationApplier>,
    executor: Arc<dyn TestExecutor>,
    cache: Arc<ResultCache>,
    should_stop: Arc<AtomicBool>,
}

/// State shared by the per-file tasks of one run.
struct RunState {
    applier: Arc<MutationApplier>,
    executor: Arc<dyn TestExecutor>,
    cache: Arc<ResultCache>,
    should_stop: Arc<AtomicBool>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    halted: AtomicBool,
    fatal: Mutex<Option<ApplyError>>,
}

impl ParallelCoordinator {
    pub fn new(
        config: Arc<Config>,
        applier: Arc<MutationApplier>,
        executor: Arc<dyn TestExecutor>,
        cache: Arc<ResultCache>,
        should_stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            applier,
            executor,
            cache,
            should_stop,
        }
    }

    /// Run every trial and return the results in submission order.
    ///
    /// Trials skipped because of a stop request are absent from the result.
    pub async fn run(&self, trials: Vec<Trial>) -> Result<Vec<MutationResult>, CoordinatorError> {
        let indexed = self.run_indexed(trials).await?;
        Ok(indexed.into_iter().map(|(_, result)| result).collect())
    }

    /// Like [`ParallelCoordinator::run`], pairing each result with the
    /// index of the trial that produced it.
    pub async fn run_indexed(
        &self,
        trials: Vec<Trial>,
    ) -> Result<Vec<(usize, MutationResult)>, CoordinatorError> {
        let total = trials.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let mut queues: Vec<Vec<(usize, Trial)>> = Vec::new();
        let mut queue_for: HashMap<PathBuf, usize> = HashMap::new();
        for (index, trial) in trials.into_iter().enumerate() {
            let slot = *queue_for
                .entry(trial.mutation.source_file.clone())
                .or_insert_with(|| {
                    queues.push(Vec::new());
                    queues.len() - 1
                });
            queues[slot].push((index, trial));
        }

        tracing::info!(
            "Scheduling {} trials across {} files with {} workers",
            total,
            queues.len(),
            self.config.execution.worker_count
        );

        let state = Arc::new(RunState {
            applier: Arc::clone(&self.applier),
            executor: Arc::clone(&self.executor),
            cache: Arc::clone(&self.cache),
            should_stop: Arc::clone(&self.should_stop),
            permits: Arc::new(Semaphore::new(self.config.execution.worker_count.max(1))),
            timeout: self.config.trial_timeout(),
            halted: AtomicBool::new(false),
            fatal: Mutex::new(None),
        });

        let mut workers = JoinSet::new();
        for queue in queues {
            let state = Arc::clone(&state);
            workers.spawn(async move {
                let mut done = Vec::with_capacity(queue.len());
                for (index, trial) in queue {
                    if state.stopped() {
                        break;
                    }
                    if let Some(result) = state.run_trial(trial).await {
                        done.push((index, result));
                    }
                }
                done
            });
        }

        let mut slots: Vec<Option<MutationResult>> = vec![None; total];
        let mut panicked: Option<String> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(done) => {
                    for (index, result) in done {
                        slots[index] = Some(result);
                    }
                }
                Err(e) => {
                    tracing::error!("Trial worker failed: {}", e);
                    state.halted.store(true, Ordering::SeqCst);
                    panicked.get_or_insert_with(|| e.to_string());
                }
            }
        }

        if let Some(err) = state.take_fatal() {
            return Err(CoordinatorError::Apply(err));
        }
        if let Some(message) = panicked {
            return Err(CoordinatorError::WorkerPanicked(message));
        }

        let results: Vec<(usize, MutationResult)> = slots
            .into_iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.map(|result| (index, result)))
            .collect();
        if results.len() < total {
            tracing::info!("Stopped early: {}/{} trials ran", results.len(), total);
        }
        Ok(results)
    }
}

impl RunState {
    fn stopped(&self) -> bool {
        self.halted.load(Ordering::SeqCst) || self.should_stop.load(Ordering::SeqCst)
    }

    fn record_fatal(&self, err: ApplyError) {
        tracing::error!("{}", err);
        self.halted.store(true, Ordering::SeqCst);
        let mut fatal = match self.fatal.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        fatal.get_or_insert(err);
    }

    fn take_fatal(&self) -> Option<ApplyError> {
        match self.fatal.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Cache lookup, then apply, execute, restore. `None` means the trial
    /// did not produce a result (stop requested or fatal error).
    async fn run_trial(&self, trial: Trial) -> Option<MutationResult> {
        let key = trial.cache_key();
        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!(
                "Cache hit for {}:{} ({})",
                trial.mutation.source_file.display(),
                trial.mutation.line_number,
                trial.mutation.kind
            );
            return Some(hit);
        }

        let _permit = Arc::clone(&self.permits).acquire_owned().await.ok()?;
        if self.stopped() {
            return None;
        }

        let started = Instant::now();
        let applied = match self.applier.apply(&trial.mutation).await {
            Ok(applied) => applied,
            Err(e) if e.is_fatal() => {
                self.record_fatal(e);
                return None;
            }
            Err(e) => {
                tracing::warn!(
                    "Could not apply mutation {}:{} ({}): {}",
                    trial.mutation.source_file.display(),
                    trial.mutation.line_number,
                    trial.mutation.kind,
                    e
                );
                return Some(MutationResult {
                    mutation: trial.mutation,
                    outcome: TrialOutcome::Errored,
                    duration_ms: started.elapsed().as_millis() as u64,
                    test_output_excerpt: Some(e.to_string()),
                    killing_test: None,
                });
            }
        };

        let execution = self.executor.execute(&trial.target, self.timeout).await;

        if let Err(e) = applied.restore() {
            self.record_fatal(e);
            return None;
        }

        let result = MutationResult {
            outcome: execution.outcome,
            duration_ms: execution.duration.as_millis() as u64,
            test_output_excerpt: Some(execution.output).filter(|o| !o.is_empty()),
            killing_test: execution.killing_test,
            mutation: trial.mutation,
        };

        tracing::info!(
            "Trial {}:{} ({}) = {} ({}ms)",
            result.mutation.source_file.display(),
            result.mutation.line_number,
            result.mutation.kind,
            result.outcome,
            result.duration_ms
        );

        self.cache.insert(key, result.clone());
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::applier::backup_path;
    use crate::mutation::executor::Execution;
    use crate::mutation::{content_hash, MutationKind};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    const SOURCE: &str = "def check(x):\n    if x < 1:\n        return True\n    return False\n";

    /// Counts invocations and returns a fixed outcome.
    struct CountingExecutor {
        calls: AtomicUsize,
        outcome: TrialOutcome,
    }

    impl CountingExecutor {
        fn new(outcome: TrialOutcome) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                outcome,
            }
        }
    }

    #[async_trait]
    impl TestExecutor for CountingExecutor {
        async fn execute(&self, _target: &TestTarget, _timeout: Duration) -> Execution {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Execution {
                outcome: self.outcome,
                duration: Duration::from_millis(1),
                output: "test check ... FAILED".to_string(),
                killing_test: Some("check".to_string()),
            }
        }
    }

    /// Sleeps while tracking how many trials are in flight, overall and per file.
    #[derive(Default)]
    struct SleepingExecutor {
        active: Mutex<HashMap<PathBuf, usize>>,
        max_total: AtomicUsize,
        max_per_file: AtomicUsize,
        order: Mutex<Vec<(PathBuf, String)>>,
    }

    #[async_trait]
    impl TestExecutor for SleepingExecutor {
        async fn execute(&self, target: &TestTarget, _timeout: Duration) -> Execution {
            let source = target.source_file.clone();
            {
                let mut active = self.active.lock().unwrap();
                *active.entry(source.clone()).or_default() += 1;
                let total: usize = active.values().sum();
                self.max_total.fetch_max(total, Ordering::SeqCst);
                self.max_per_file.fetch_max(active[&source], Ordering::SeqCst);

                // The mutant currently on disk tells us which trial this is
                let on_disk = std::fs::read_to_string(&source).unwrap();
                self.order.lock().unwrap().push((source.clone(), on_disk));
            }

            tokio::time::sleep(Duration::from_millis(150)).await;

            *self.active.lock().unwrap().get_mut(&source).unwrap() -= 1;
            Execution {
                outcome: TrialOutcome::Survived,
                duration: Duration::from_millis(150),
                output: String::new(),
                killing_test: None,
            }
        }
    }

    fn config(workers: usize) -> Arc<Config> {
        let mut config = Config::default();
        config.execution.worker_count = workers;
        Arc::new(config)
    }

    fn mutation(path: &Path, original: &str, mutated: &str, kind: MutationKind) -> Mutation {
        let start = SOURCE.find(original).unwrap();
        Mutation {
            source_file: path.to_path_buf(),
            line_number: SOURCE[..start].matches('\n').count() + 1,
            column: 1,
            kind,
            rule: format!("{}_rule", kind),
            byte_start: start,
            byte_end: start + original.len(),
            original_text: original.to_string(),
            mutated_text: mutated.to_string(),
        }
    }

    /// Two trials per file; the target's source_file is the absolute path so
    /// the fake executor can inspect what is on disk.
    fn trials_for(paths: &[PathBuf]) -> Vec<Trial> {
        let mut trials = Vec::new();
        for path in paths {
            let hash = content_hash(SOURCE.as_bytes());
            let target = TestTarget::new("tests/test_check.py", path.clone());
            trials.push(Trial {
                mutation: mutation(path, "<", "<=", MutationKind::BoundaryShift),
                target: target.clone(),
                content_hash: hash.clone(),
                test_hash: "t0".to_string(),
            });
            trials.push(Trial {
                mutation: mutation(path, "True", "False", MutationKind::BooleanInversion),
                target,
                content_hash: hash,
                test_hash: "t0".to_string(),
            });
        }
        trials
    }

    fn fixture(names: &[&str]) -> (tempfile::TempDir, Vec<PathBuf>) {
        let dir = tempfile::tempdir().unwrap();
        let paths = names
            .iter()
            .map(|name| {
                let path = dir.path().join(name);
                std::fs::write(&path, SOURCE).unwrap();
                path
            })
            .collect();
        (dir, paths)
    }

    fn coordinator(
        workers: usize,
        executor: Arc<dyn TestExecutor>,
        cache: Arc<ResultCache>,
    ) -> ParallelCoordinator {
        ParallelCoordinator::new(
            config(workers),
            Arc::new(MutationApplier::new()),
            executor,
            cache,
            Arc::new(AtomicBool::new(false)),
        )
    }

    // =========================================================================
    // Concurrency
    // =========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_distinct_files_overlap_same_file_never() {
        let (_dir, paths) = fixture(&["a.py", "b.py"]);
        let executor = Arc::new(SleepingExecutor::default());
        let coord = coordinator(4, executor.clone(), Arc::new(ResultCache::new(64)));

        let results = coord.run(trials_for(&paths)).await.unwrap();
        assert_eq!(results.len(), 4);
        assert!(executor.max_total.load(Ordering::SeqCst) >= 2);
        assert_eq!(executor.max_per_file.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_same_file_runs_in_submission_order() {
        let (_dir, paths) = fixture(&["a.py"]);
        let executor = Arc::new(SleepingExecutor::default());
        let coord = coordinator(4, executor.clone(), Arc::new(ResultCache::new(64)));

        coord.run(trials_for(&paths)).await.unwrap();

        let order = executor.order.lock().unwrap();
        assert_eq!(order.len(), 2);
        assert!(order[0].1.contains("x <= 1"));
        assert!(order[1].1.contains("return False\n    return False"));
    }

    #[tokio::test]
    async fn test_single_worker_serializes_everything() {
        let (_dir, paths) = fixture(&["a.py", "b.py"]);
        let executor = Arc::new(SleepingExecutor::default());
        let coord = coordinator(1, executor.clone(), Arc::new(ResultCache::new(64)));

        coord.run(trials_for(&paths)).await.unwrap();
        assert_eq!(executor.max_total.load(Ordering::SeqCst), 1);
    }

    // =========================================================================
    // Tree integrity
    // =========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_files_byte_identical_after_many_trials() {
        let (dir, paths) = fixture(&["a.py", "b.py", "c.py"]);
        let before: Vec<String> = paths
            .iter()
            .map(|p| content_hash(&std::fs::read(p).unwrap()))
            .collect();

        let executor = Arc::new(CountingExecutor::new(TrialOutcome::Killed));
        let coord = coordinator(3, executor, Arc::new(ResultCache::new(64)));
        let mut trials = trials_for(&paths);
        trials.extend(trials_for(&paths).into_iter().map(|mut t| {
            t.content_hash = "different".to_string();
            t
        }));
        let results = coord.run(trials).await.unwrap();
        assert_eq!(results.len(), 12);

        let after: Vec<String> = paths
            .iter()
            .map(|p| content_hash(&std::fs::read(p).unwrap()))
            .collect();
        assert_eq!(before, after);
        for path in &paths {
            assert!(!backup_path(path).exists());
        }
        drop(dir);
    }

    // =========================================================================
    // Cache
    // =========================================================================

    #[tokio::test]
    async fn test_second_run_is_served_from_cache() {
        let (_dir, paths) = fixture(&["a.py", "b.py"]);
        let executor = Arc::new(CountingExecutor::new(TrialOutcome::Killed));
        let cache = Arc::new(ResultCache::new(64));
        let coord = coordinator(2, executor.clone(), cache.clone());

        let first = coord.run(trials_for(&paths)).await.unwrap();
        assert_eq!(executor.calls.load(Ordering::SeqCst), 4);

        let second = coord.run(trials_for(&paths)).await.unwrap();
        assert_eq!(executor.calls.load(Ordering::SeqCst), 4);
        assert_eq!(first, second);
        assert_eq!(cache.stats().hits, 4);
    }

    #[tokio::test]
    async fn test_edited_test_file_misses_cache() {
        let (_dir, paths) = fixture(&["a.py"]);
        let executor = Arc::new(CountingExecutor::new(TrialOutcome::Killed));
        let cache = Arc::new(ResultCache::new(64));
        let coord = coordinator(1, executor.clone(), cache.clone());

        coord.run(trials_for(&paths)).await.unwrap();
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);

        let edited: Vec<Trial> = trials_for(&paths)
            .into_iter()
            .map(|mut t| {
                t.test_hash = "t1".to_string();
                t
            })
            .collect();
        coord.run(edited).await.unwrap();
        assert_eq!(executor.calls.load(Ordering::SeqCst), 4);
        assert_eq!(cache.stats().hits, 0);
    }

    #[tokio::test]
    async fn test_results_carry_executor_output() {
        let (_dir, paths) = fixture(&["a.py"]);
        let executor = Arc::new(CountingExecutor::new(TrialOutcome::Killed));
        let coord = coordinator(1, executor, Arc::new(ResultCache::new(8)));

        let results = coord.run(trials_for(&paths)).await.unwrap();
        assert_eq!(results[0].outcome, TrialOutcome::Killed);
        assert_eq!(results[0].killing_test.as_deref(), Some("check"));
        assert!(results[0].test_output_excerpt.is_some());
    }

    // =========================================================================
    // Failures
    // =========================================================================

    #[tokio::test]
    async fn test_span_mismatch_is_errored_not_fatal() {
        let (_dir, paths) = fixture(&["a.py"]);
        let executor = Arc::new(CountingExecutor::new(TrialOutcome::Killed));
        let coord = coordinator(1, executor.clone(), Arc::new(ResultCache::new(8)));

        let mut trials = trials_for(&paths);
        trials[0].mutation.original_text = ">".to_string();
        let results = coord.run(trials).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].outcome, TrialOutcome::Errored);
        assert_eq!(results[1].outcome, TrialOutcome::Killed);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_backup_halts_run() {
        let (_dir, paths) = fixture(&["a.py"]);
        std::fs::write(backup_path(&paths[0]), SOURCE).unwrap();

        let executor = Arc::new(CountingExecutor::new(TrialOutcome::Killed));
        let coord = coordinator(1, executor.clone(), Arc::new(ResultCache::new(8)));

        let err = coord.run(trials_for(&paths)).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Apply(ApplyError::StaleBackup { .. })));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_requested_runs_nothing() {
        let (_dir, paths) = fixture(&["a.py"]);
        let executor = Arc::new(CountingExecutor::new(TrialOutcome::Killed));
        let should_stop = Arc::new(AtomicBool::new(true));
        let coord = ParallelCoordinator::new(
            config(2),
            Arc::new(MutationApplier::new()),
            executor.clone(),
            Arc::new(ResultCache::new(8)),
            should_stop,
        );

        let results = coord.run(trials_for(&paths)).await.unwrap();
        assert!(results.is_empty());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_run() {
        let executor = Arc::new(CountingExecutor::new(TrialOutcome::Killed));
        let coord = coordinator(1, executor, Arc::new(ResultCache::new(8)));
        assert!(coord.run(Vec::new()).await.unwrap().is_empty());
    }
}
