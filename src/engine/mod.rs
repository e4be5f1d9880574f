//! Run orchestration.
//!
//! One [`Engine::run`] call takes a project root (and optionally a single
//! test or source to focus on), repairs leftovers from a crashed run, maps
//! tests to sources, generates mutants, verifies each test is green on the
//! clean tree, runs every trial through the coordinator, and scores the
//! results into a [`RunSummary`].

use crate::config::Config;
use crate::language::Language;
use crate::mapping::{Candidate, Mapping, SourceTestMapper};
use crate::mutation::analyzer::{EffectivenessAnalyzer, EffectivenessReport, Finding};
use crate::mutation::applier::{recover_backups, MutationApplier};
use crate::mutation::cache::{CacheStats, ResultCache};
use crate::mutation::coordinator::{ParallelCoordinator, Trial};
use crate::mutation::executor::{CommandExecutor, TestExecutor, TestTarget};
use crate::mutation::generator::MutationGenerator;
use crate::mutation::patterns::PatternTable;
use crate::mutation::{content_hash, Mutation, MutationResult, TrialOutcome};
use crate::project::ProjectLayout;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Why a (source, test) pair produced no report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The test does not pass on the unmodified tree
    BaselineFailed,
    /// No pattern matched the source for the requested kinds
    NoMutations,
    /// The source could not be read or is not eligible
    GenerationFailed,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::BaselineFailed => write!(f, "baseline_failed"),
            SkipReason::NoMutations => write!(f, "no_mutations"),
            SkipReason::GenerationFailed => write!(f, "generation_failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedPair {
    pub test_file: PathBuf,
    pub source_file: PathBuf,
    pub reason: SkipReason,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub detail: Option<String>,
}

/// A test with no confident source match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnmappedTest {
    pub test_file: PathBuf,
    /// Best candidate that fell below the confidence threshold
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub best_candidate: Option<Candidate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub project: String,
    pub root: PathBuf,
    pub language: Language,
    pub threshold: f64,
    pub reports: Vec<EffectivenessReport>,
    pub unmapped: Vec<UnmappedTest>,
    pub skipped: Vec<SkippedPair>,
    pub cache_stats: CacheStats,
    /// Set when a stop request cut the run short
    pub interrupted: bool,
    pub generated_at: DateTime<Utc>,
}

impl RunSummary {
    /// Reports whose defined score is below the threshold.
    pub fn below_threshold(&self) -> Vec<&EffectivenessReport> {
        self.reports
            .iter()
            .filter(|r| r.is_below(self.threshold))
            .collect()
    }

    /// 0 when every defined score meets the threshold, 1 otherwise.
    /// Undefined scores never fail the run.
    pub fn exit_code(&self) -> i32 {
        if self.below_threshold().is_empty() {
            0
        } else {
            1
        }
    }
}

/// Handle for stopping a running engine from another task.
#[derive(Clone)]
pub struct EngineHandle {
    should_stop: Arc<AtomicBool>,
}

impl EngineHandle {
    /// Stop scheduling new trials; in-flight trials finish and restore.
    pub fn stop(&self) {
        tracing::info!("Stop requested, draining in-flight trials");
        self.should_stop.store(true, Ordering::SeqCst);
    }
}

/// A (source, test) pair selected for mutation.
struct Pair {
    test_file: PathBuf,
    source_file: PathBuf,
    alternatives: Vec<PathBuf>,
    strategy: Option<String>,
    confidence: Option<f64>,
}

pub struct Engine {
    config: Arc<Config>,
    table: Arc<PatternTable>,
    cache: Arc<ResultCache>,
    applier: Arc<MutationApplier>,
    executor: Option<Arc<dyn TestExecutor>>,
    should_stop: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(config: Arc<Config>, table: Arc<PatternTable>, cache: Arc<ResultCache>) -> Self {
        Self {
            config,
            table,
            cache,
            applier: Arc::new(MutationApplier::new()),
            executor: None,
            should_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Use `executor` instead of spawning the configured runner command.
    #[cfg(test)]
    pub fn with_executor(mut self, executor: Arc<dyn TestExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            should_stop: Arc::clone(&self.should_stop),
        }
    }

    /// Run the whole pipeline for `root`.
    ///
    /// `filter` may name a test (only that test runs) or a source file (every
    /// test that maps to it runs).
    pub async fn run(&self, root: &Path, filter: Option<&str>) -> Result<RunSummary> {
        let restored = recover_backups(root)
            .with_context(|| format!("Failed to recover leftover backups in {}", root.display()))?;
        if !restored.is_empty() {
            tracing::warn!("Recovered {} file(s) from a previous crashed run", restored.len());
        }

        let layout = ProjectLayout::discover(root, &self.config)?;
        let mapper = SourceTestMapper::new(Arc::clone(&self.config), &layout)?;
        let (pairs, unmapped) = self.select_pairs(&layout, &mapper, filter)?;

        tracing::info!(
            "Selected {} source/test pair(s), {} unmapped test(s)",
            pairs.len(),
            unmapped.len()
        );

        let executor: Arc<dyn TestExecutor> = match &self.executor {
            Some(executor) => Arc::clone(executor),
            None => Arc::new(CommandExecutor::new(
                self.config.test_command_for(layout.language),
                layout.root.clone(),
                self.config.execution.max_output_bytes,
            )),
        };

        let generator = MutationGenerator::new(Arc::clone(&self.table), Arc::clone(&self.config));
        let mut skipped = Vec::new();
        let mut trials = Vec::new();
        let mut trial_pair = Vec::new();
        let mut ready = Vec::new();
        let mut generated: HashMap<PathBuf, Result<Vec<Mutation>, String>> = HashMap::new();

        for (pair_index, pair) in pairs.iter().enumerate() {
            if self.should_stop.load(Ordering::SeqCst) {
                break;
            }

            let mutations = generated
                .entry(pair.source_file.clone())
                .or_insert_with(|| {
                    generator
                        .generate_file(&layout.root, &pair.source_file, &self.config.mutation.kinds)
                        .map(|g| {
                            tracing::info!(
                                "Generated {} mutations ({} candidates) for {}",
                                g.mutations.len(),
                                g.candidates_found,
                                layout.relative(&pair.source_file).display()
                            );
                            g.mutations
                        })
                        .map_err(|e| e.to_string())
                })
                .clone();

            let mutations = match mutations {
                Ok(m) if m.is_empty() => {
                    skipped.push(skip(&layout, pair, SkipReason::NoMutations, None));
                    continue;
                }
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!("Generation failed for {}: {}", pair.source_file.display(), e);
                    skipped.push(skip(&layout, pair, SkipReason::GenerationFailed, Some(e)));
                    continue;
                }
            };

            let target = TestTarget::new(
                layout.relative(&pair.test_file),
                layout.relative(&pair.source_file),
            );

            if self.config.execution.verify_baseline {
                let baseline = executor.execute(&target, self.config.trial_timeout()).await;
                if baseline.outcome != TrialOutcome::Survived {
                    tracing::warn!(
                        "Skipping {}: baseline run was {} on the unmodified tree",
                        target.key(),
                        baseline.outcome
                    );
                    let detail = Some(baseline.output).filter(|o| !o.is_empty());
                    skipped.push(skip(&layout, pair, SkipReason::BaselineFailed, detail));
                    continue;
                }
            }

            let bytes = std::fs::read(&pair.source_file)
                .with_context(|| format!("Failed to read {}", pair.source_file.display()))?;
            let hash = content_hash(&bytes);
            let test_bytes = std::fs::read(&pair.test_file)
                .with_context(|| format!("Failed to read {}", pair.test_file.display()))?;
            let test_hash = content_hash(&test_bytes);

            for mutation in mutations {
                trials.push(Trial {
                    mutation,
                    target: target.clone(),
                    content_hash: hash.clone(),
                    test_hash: test_hash.clone(),
                });
                trial_pair.push(pair_index);
            }
            ready.push(pair_index);
        }

        let coordinator = ParallelCoordinator::new(
            Arc::clone(&self.config),
            Arc::clone(&self.applier),
            executor,
            Arc::clone(&self.cache),
            Arc::clone(&self.should_stop),
        );
        let results = coordinator.run_indexed(trials).await?;

        let mut by_pair: HashMap<usize, Vec<MutationResult>> = HashMap::new();
        for (trial_index, result) in results {
            by_pair
                .entry(trial_pair[trial_index])
                .or_default()
                .push(result);
        }

        let analyzer = EffectivenessAnalyzer::new(Arc::clone(&self.config));
        let reports: Vec<EffectivenessReport> = ready
            .into_iter()
            .map(|pair_index| {
                let pair = &pairs[pair_index];
                let results = by_pair.remove(&pair_index).unwrap_or_default();
                let mut report = analyzer.analyze(
                    layout.relative(&pair.source_file),
                    layout.relative(&pair.test_file),
                    &results,
                );
                report.alternative_sources = pair.alternatives.clone();
                report.mapping_strategy = pair.strategy.clone();
                report.mapping_confidence = pair.confidence;
                relativize(&layout, &mut report.survivors);
                relativize(&layout, &mut report.inconclusive);
                report
            })
            .collect();

        if let Some(path) = &self.config.cache.path {
            let path = if path.is_absolute() {
                path.clone()
            } else {
                layout.root.join(path)
            };
            if let Err(e) = self.cache.save(&path) {
                tracing::warn!("Failed to save result cache: {:#}", e);
            }
        }

        let interrupted = self.should_stop.load(Ordering::SeqCst);
        let summary = RunSummary {
            project: layout.name.clone(),
            root: layout.root.clone(),
            language: layout.language,
            threshold: self.config.analysis.min_score_threshold,
            reports,
            unmapped,
            skipped,
            cache_stats: self.cache.stats(),
            interrupted,
            generated_at: Utc::now(),
        };

        tracing::info!(
            "Run complete: {} report(s), {} below threshold, {} skipped, {} unmapped (cache: {} hits, {} misses)",
            summary.reports.len(),
            summary.below_threshold().len(),
            summary.skipped.len(),
            summary.unmapped.len(),
            summary.cache_stats.hits,
            summary.cache_stats.misses
        );

        Ok(summary)
    }

    fn select_pairs(
        &self,
        layout: &ProjectLayout,
        mapper: &SourceTestMapper,
        filter: Option<&str>,
    ) -> Result<(Vec<Pair>, Vec<UnmappedTest>)> {
        let (tests, only_source) = match filter {
            None => (layout.test_files.clone(), None),
            Some(name) => {
                if let Some(test) = layout.resolve_test(name) {
                    (vec![test], None)
                } else if let Some(source) = layout.resolve_source(name) {
                    (mapper.tests_for_source(&layout.test_files, &source), Some(source))
                } else {
                    anyhow::bail!("'{}' matches no test or source file under {}", name, layout.root.display());
                }
            }
        };

        let mut pairs = Vec::new();
        let mut unmapped = Vec::new();

        for test in tests {
            let mapping = mapper.map(&test);
            let Some(best) = mapping.best() else {
                if let Mapping::Unmapped { best_rejected } = mapping {
                    unmapped.push(UnmappedTest {
                        test_file: layout.relative(&test).to_path_buf(),
                        best_candidate: best_rejected.map(|mut c| {
                            c.source_file = layout.relative(&c.source_file).to_path_buf();
                            c
                        }),
                    });
                }
                continue;
            };
            if only_source.as_ref().is_some_and(|s| *s != best.source_file) {
                continue;
            }

            let alternatives = mapping
                .close_alternatives()
                .into_iter()
                .map(|c| layout.relative(&c.source_file).to_path_buf())
                .collect();
            pairs.push(Pair {
                source_file: best.source_file.clone(),
                alternatives,
                strategy: Some(best.strategy.to_string()),
                confidence: Some(best.confidence),
                test_file: test,
            });
        }

        Ok((pairs, unmapped))
    }
}

/// Discover `root` and map one test, for the `map` command.
pub fn map_test(config: Arc<Config>, root: &Path, test: &str) -> Result<(ProjectLayout, Mapping)> {
    let layout = ProjectLayout::discover(root, &config)?;
    let test_path = layout
        .resolve_test(test)
        .unwrap_or_else(|| layout.root.join(test));
    let mapper = SourceTestMapper::new(config, &layout)?;
    let mapping = mapper.map(&test_path);
    Ok((layout, mapping))
}

fn skip(layout: &ProjectLayout, pair: &Pair, reason: SkipReason, detail: Option<String>) -> SkippedPair {
    SkippedPair {
        test_file: layout.relative(&pair.test_file).to_path_buf(),
        source_file: layout.relative(&pair.source_file).to_path_buf(),
        reason,
        detail,
    }
}

fn relativize(layout: &ProjectLayout, findings: &mut [Finding]) {
    for finding in findings {
        finding.source_file = layout.relative(&finding.source_file).to_path_buf();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::executor::Execution;
    use crate::mutation::MutationKind;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const CLAMP_AWK: &str = r#"function clampToRange(x, low, high,    r) {
    r = x
    while (r < low) r++
    while (r > high) r--
    return r
}
"#;

    const WEAK_TEST: &str = r#"BEGIN {
    if (clampToRange(5, 0, 10) != 5) { print "FAILED: clampToRange(5, 0, 10)"; exit 1 }
    print "ok"
}
"#;

    const STRONG_TEST: &str = r#"BEGIN {
    if (clampToRange(5, 0, 10) != 5) { print "FAILED: clampToRange(5, 0, 10)"; exit 1 }
    if (clampToRange(0, 0, 10) != 0) { print "FAILED: clampToRange(0, 0, 10)"; exit 1 }
    if (clampToRange(10, 0, 10) != 10) { print "FAILED: clampToRange(10, 0, 10)"; exit 1 }
    print "ok"
}
"#;

    fn awk_config() -> Config {
        let mut config = Config::default();
        config.execution.test_command = ["awk", "-f", "clamp.awk", "-f", "{test_file}"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        config.execution.worker_count = 2;
        config.execution.per_trial_timeout_seconds = 30;
        config.mutation.kinds = vec![MutationKind::BoundaryShift];
        config
    }

    fn engine(config: Config) -> Engine {
        let table = Arc::new(PatternTable::compile().unwrap());
        Engine::new(Arc::new(config), table, Arc::new(ResultCache::new(256)))
    }

    fn clamp_project(test_body: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clamp.awk"), CLAMP_AWK).unwrap();
        std::fs::write(dir.path().join("test_clamp.awk"), test_body).unwrap();
        dir
    }

    /// Always passes, counting calls.
    #[derive(Default)]
    struct PassingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TestExecutor for PassingExecutor {
        async fn execute(&self, _target: &TestTarget, _timeout: Duration) -> Execution {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Execution {
                outcome: TrialOutcome::Survived,
                duration: Duration::from_millis(1),
                output: String::new(),
                killing_test: None,
            }
        }
    }

    // =========================================================================
    // End-to-end: clamp scenario
    // =========================================================================

    #[tokio::test]
    async fn test_weak_clamp_test_scores_low() {
        let dir = clamp_project(WEAK_TEST);
        let summary = engine(awk_config()).run(dir.path(), None).await.unwrap();

        assert_eq!(summary.reports.len(), 1, "skipped: {:?}", summary.skipped);
        let report = &summary.reports[0];
        assert_eq!(report.source_file, PathBuf::from("clamp.awk"));
        assert_eq!(report.test_file, PathBuf::from("test_clamp.awk"));
        assert_eq!(report.mapping_strategy.as_deref(), Some("exact"));
        assert_eq!(report.total_attempted, 2);
        assert!(report.score.unwrap() < 0.5);
        assert_eq!(report.survivors.len(), 2);
        assert_eq!(summary.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_strong_clamp_test_kills_every_boundary_mutant() {
        let dir = clamp_project(STRONG_TEST);
        let summary = engine(awk_config()).run(dir.path(), None).await.unwrap();

        let report = &summary.reports[0];
        assert_eq!(report.total_attempted, 2);
        assert_eq!(report.killed, 2);
        assert_eq!(report.score, Some(1.0));
        assert_eq!(summary.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_tree_is_untouched_after_run() {
        let dir = clamp_project(STRONG_TEST);
        engine(awk_config()).run(dir.path(), None).await.unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("clamp.awk")).unwrap(),
            CLAMP_AWK
        );
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.contains("killrate"))
            .collect();
        assert!(leftovers.is_empty(), "leftover files: {:?}", leftovers);
    }

    #[tokio::test]
    async fn test_red_baseline_is_skipped() {
        let dir = clamp_project("BEGIN { print \"FAILED: always\"; exit 1 }\n");
        let summary = engine(awk_config()).run(dir.path(), None).await.unwrap();

        assert!(summary.reports.is_empty());
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].reason, SkipReason::BaselineFailed);
        assert_eq!(summary.exit_code(), 0);
    }

    // =========================================================================
    // Selection
    // =========================================================================

    #[tokio::test]
    async fn test_unmapped_tests_are_reported() {
        let dir = clamp_project(WEAK_TEST);
        std::fs::write(dir.path().join("test_zzzzqqqq.awk"), "BEGIN {}\n").unwrap();

        let executor = Arc::new(PassingExecutor::default());
        let summary = engine(awk_config())
            .with_executor(executor)
            .run(dir.path(), None)
            .await
            .unwrap();

        assert_eq!(summary.unmapped.len(), 1);
        assert_eq!(summary.unmapped[0].test_file, PathBuf::from("test_zzzzqqqq.awk"));
    }

    #[tokio::test]
    async fn test_filter_by_source_selects_mapped_tests() {
        let dir = clamp_project(WEAK_TEST);
        std::fs::write(dir.path().join("other.awk"), "function f(a) { return a < 1 }\n").unwrap();
        std::fs::write(dir.path().join("test_other.awk"), "BEGIN {}\n").unwrap();

        let executor = Arc::new(PassingExecutor::default());
        let summary = engine(awk_config())
            .with_executor(executor)
            .run(dir.path(), Some("clamp.awk"))
            .await
            .unwrap();

        assert_eq!(summary.reports.len(), 1);
        assert_eq!(summary.reports[0].source_file, PathBuf::from("clamp.awk"));
    }

    #[tokio::test]
    async fn test_unknown_filter_is_error() {
        let dir = clamp_project(WEAK_TEST);
        let result = engine(awk_config()).run(dir.path(), Some("nothing_here")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_no_mutations_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plain.awk"), "function f() { return 1 }\n").unwrap();
        std::fs::write(dir.path().join("test_plain.awk"), "BEGIN {}\n").unwrap();

        let executor = Arc::new(PassingExecutor::default());
        let summary = engine(awk_config())
            .with_executor(executor.clone())
            .run(dir.path(), None)
            .await
            .unwrap();

        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].reason, SkipReason::NoMutations);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    // =========================================================================
    // Cache and recovery
    // =========================================================================

    #[tokio::test]
    async fn test_second_run_hits_cache() {
        let dir = clamp_project(WEAK_TEST);
        let executor = Arc::new(PassingExecutor::default());
        let mut config = awk_config();
        config.execution.verify_baseline = false;
        let engine = engine(config).with_executor(executor.clone());

        let first = engine.run(dir.path(), None).await.unwrap();
        let calls = executor.calls.load(Ordering::SeqCst);
        assert_eq!(calls, 2);

        let second = engine.run(dir.path(), None).await.unwrap();
        assert_eq!(executor.calls.load(Ordering::SeqCst), calls);
        assert_eq!(first.reports, second.reports);
        assert_eq!(second.cache_stats.hits, 2);
    }

    #[tokio::test]
    async fn test_strengthened_test_is_rescored() {
        let dir = clamp_project(WEAK_TEST);
        let engine = engine(awk_config());

        let first = engine.run(dir.path(), None).await.unwrap();
        assert_eq!(first.reports[0].score, Some(0.0));

        std::fs::write(dir.path().join("test_clamp.awk"), STRONG_TEST).unwrap();
        let second = engine.run(dir.path(), None).await.unwrap();
        assert_eq!(second.reports[0].score, Some(1.0));
        assert_eq!(second.reports[0].killed, 2);
    }

    #[tokio::test]
    async fn test_cache_snapshot_written() {
        let dir = clamp_project(WEAK_TEST);
        let mut config = awk_config();
        config.cache.path = Some(PathBuf::from(".killrate-cache/results.json"));
        let executor = Arc::new(PassingExecutor::default());
        engine(config)
            .with_executor(executor)
            .run(dir.path(), None)
            .await
            .unwrap();

        let snapshot = dir.path().join(".killrate-cache/results.json");
        let loaded = ResultCache::load(&snapshot, 16).unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[tokio::test]
    async fn test_run_recovers_crashed_backup_first() {
        let dir = clamp_project(STRONG_TEST);
        let source = dir.path().join("clamp.awk");
        std::fs::write(dir.path().join("clamp.awk.killrate.orig"), CLAMP_AWK).unwrap();
        std::fs::write(&source, CLAMP_AWK.replace(" < ", " <= ")).unwrap();

        let summary = engine(awk_config()).run(dir.path(), None).await.unwrap();
        assert_eq!(std::fs::read_to_string(&source).unwrap(), CLAMP_AWK);
        assert_eq!(summary.reports[0].score, Some(1.0));
    }

    #[tokio::test]
    async fn test_stop_before_run_yields_interrupted_summary() {
        let dir = clamp_project(WEAK_TEST);
        let executor = Arc::new(PassingExecutor::default());
        let engine = engine(awk_config()).with_executor(executor.clone());
        engine.handle().stop();

        let summary = engine.run(dir.path(), None).await.unwrap();
        assert!(summary.interrupted);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    // =========================================================================
    // Summary
    // =========================================================================

    #[test]
    fn test_map_test_resolves_by_stem() {
        let dir = clamp_project(WEAK_TEST);
        let (layout, mapping) =
            map_test(Arc::new(Config::default()), dir.path(), "test_clamp").unwrap();
        let best = mapping.best().unwrap();
        assert_eq!(best.source_file, layout.root.join("clamp.awk"));
    }

    #[test]
    fn test_summary_json_is_camel_case() {
        let summary = RunSummary {
            project: "p".to_string(),
            root: PathBuf::from("/p"),
            language: Language::Generic,
            threshold: 0.8,
            reports: Vec::new(),
            unmapped: Vec::new(),
            skipped: vec![SkippedPair {
                test_file: PathBuf::from("t"),
                source_file: PathBuf::from("s"),
                reason: SkipReason::BaselineFailed,
                detail: None,
            }],
            cache_stats: CacheStats::default(),
            interrupted: false,
            generated_at: Utc::now(),
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert!(json.get("cacheStats").is_some());
        assert!(json.get("generatedAt").is_some());
        assert_eq!(json["skipped"][0]["reason"], "baseline_failed");
    }
}
