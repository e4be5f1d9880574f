//! Effectiveness scoring - reduces trial results into a report per
//! (source, test) pair.

use super::{MutationKind, MutationResult, TrialOutcome};
use crate::config::Config;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Outcome counts for one mutation kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindStats {
    pub attempted: usize,
    pub killed: usize,
    pub survived: usize,
    pub timed_out: usize,
    pub errored: usize,
    /// `killed / (killed + survived)`, absent when no trial was conclusive
    pub kill_rate: Option<f64>,
}

impl KindStats {
    fn record(&mut self, outcome: TrialOutcome) {
        self.attempted += 1;
        match outcome {
            TrialOutcome::Killed => self.killed += 1,
            TrialOutcome::Survived => self.survived += 1,
            TrialOutcome::TimedOut => self.timed_out += 1,
            TrialOutcome::Errored => self.errored += 1,
        }
    }

    pub fn conclusive(&self) -> usize {
        self.killed + self.survived
    }
}

/// A survived or inconclusive trial, with enough context to find it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub source_file: PathBuf,
    pub line_number: usize,
    pub kind: MutationKind,
    pub outcome: TrialOutcome,
    pub original_text: String,
    pub mutated_text: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub detail: Option<String>,
}

impl Finding {
    fn from_result(result: &MutationResult) -> Self {
        let m = &result.mutation;
        Self {
            source_file: m.source_file.clone(),
            line_number: m.line_number,
            kind: m.kind,
            outcome: result.outcome,
            original_text: m.original_text.clone(),
            mutated_text: m.mutated_text.clone(),
            detail: match result.outcome {
                TrialOutcome::Errored => result.test_output_excerpt.clone(),
                _ => None,
            },
        }
    }

    pub fn description(&self) -> String {
        format!(
            "Changed `{}` to `{}`",
            self.original_text.trim(),
            self.mutated_text.trim()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub kind: MutationKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectivenessReport {
    pub source_file: PathBuf,
    pub test_file: PathBuf,
    pub total_attempted: usize,
    pub killed: usize,
    pub survived: usize,
    pub timed_out: usize,
    pub errored: usize,
    /// `killed / (killed + survived)`; `None` when no trial was conclusive,
    /// which is distinct from a score of zero
    pub score: Option<f64>,
    pub per_kind_breakdown: BTreeMap<MutationKind, KindStats>,
    pub weak_spots: Vec<MutationKind>,
    pub recommendations: Vec<Recommendation>,
    pub survivors: Vec<Finding>,
    pub inconclusive: Vec<Finding>,
    /// Runner-up source files when the mapping was close
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub alternative_sources: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mapping_strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mapping_confidence: Option<f64>,
}

impl EffectivenessReport {
    /// True when the score is defined and below `threshold`.
    pub fn is_below(&self, threshold: f64) -> bool {
        self.score.is_some_and(|s| s < threshold)
    }
}

/// Fixed suggestion for each weak mutation kind.
pub fn recommendation_for(kind: MutationKind) -> &'static str {
    match kind {
        MutationKind::OffByOne => {
            "Assert exact results at collection ends and numeric limits, not approximate ones"
        }
        MutationKind::BooleanInversion => {
            "Cover each condition with a case that expects the opposite branch"
        }
        MutationKind::BoundaryShift => {
            "Add an exact-boundary-value assertion (input equal to each limit)"
        }
        MutationKind::ExceptionWeakening => {
            "Assert the specific error type raised, not just that something failed"
        }
        MutationKind::ErrorPathInjection => {
            "Add a success-path test that asserts no error branch is taken"
        }
        MutationKind::ConstantMutation => {
            "Assert on the exact strings and constants produced (messages, keys, labels)"
        }
        MutationKind::EarlyReturn => {
            "Assert on returned values, not only on the absence of errors"
        }
    }
}

pub struct EffectivenessAnalyzer {
    config: Arc<Config>,
}

impl EffectivenessAnalyzer {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub fn analyze(
        &self,
        source_file: &Path,
        test_file: &Path,
        results: &[MutationResult],
    ) -> EffectivenessReport {
        let mut totals = KindStats::default();
        let mut per_kind: BTreeMap<MutationKind, KindStats> = BTreeMap::new();
        let mut survivors = Vec::new();
        let mut inconclusive = Vec::new();

        for result in results {
            totals.record(result.outcome);
            per_kind
                .entry(result.mutation.kind)
                .or_default()
                .record(result.outcome);

            match result.outcome {
                TrialOutcome::Killed => {}
                outcome if outcome.is_conclusive() => survivors.push(Finding::from_result(result)),
                _ => inconclusive.push(Finding::from_result(result)),
            }
        }

        for stats in per_kind.values_mut() {
            stats.kill_rate = kill_rate(stats.killed, stats.survived);
        }

        let threshold = self.config.analysis.min_score_threshold;
        let min_samples = self.config.analysis.min_kind_samples;
        let weak_spots: Vec<MutationKind> = per_kind
            .iter()
            .filter(|(_, stats)| {
                stats.conclusive() >= min_samples
                    && stats.kill_rate.is_some_and(|rate| rate < threshold)
            })
            .map(|(kind, _)| *kind)
            .collect();

        let recommendations = weak_spots
            .iter()
            .map(|kind| Recommendation {
                kind: *kind,
                message: recommendation_for(*kind).to_string(),
            })
            .collect();

        let score = kill_rate(totals.killed, totals.survived);
        tracing::debug!(
            "Scored {} against {}: {} killed, {} survived, {} inconclusive",
            source_file.display(),
            test_file.display(),
            totals.killed,
            totals.survived,
            totals.timed_out + totals.errored
        );

        EffectivenessReport {
            source_file: source_file.to_path_buf(),
            test_file: test_file.to_path_buf(),
            total_attempted: totals.attempted,
            killed: totals.killed,
            survived: totals.survived,
            timed_out: totals.timed_out,
            errored: totals.errored,
            score,
            per_kind_breakdown: per_kind,
            weak_spots,
            recommendations,
            survivors,
            inconclusive,
            alternative_sources: Vec::new(),
            mapping_strategy: None,
            mapping_confidence: None,
        }
    }
}

fn kill_rate(killed: usize, survived: usize) -> Option<f64> {
    let conclusive = killed + survived;
    (conclusive > 0).then(|| killed as f64 / conclusive as f64)
}
