//! Pattern-based mutation testing.
//!
//! This module provides functionality for:
//! - Generating single-location mutants from a compiled pattern table
//! - Swapping mutants onto disk and restoring the original afterwards
//! - Running the mapped test against each mutant under a timeout
//! - Caching trial outcomes and scheduling trials across workers
//! - Aggregating outcomes into effectiveness reports

pub mod analyzer;
pub mod applier;
pub mod cache;
pub mod coordinator;
pub mod executor;
pub mod generator;
pub mod patterns;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::str::FromStr;

/// The closed set of defect families the engine injects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    /// Numeric literal shifted by one
    OffByOne,
    /// Equality, logical connective, or boolean literal negated
    BooleanInversion,
    /// Strict comparison swapped with its inclusive form
    BoundaryShift,
    /// Exception filter broadened
    ExceptionWeakening,
    /// Error branch forced to trigger
    ErrorPathInjection,
    /// String constant replaced
    ConstantMutation,
    /// Returned value replaced with an empty/default one
    EarlyReturn,
}

impl MutationKind {
    pub const ALL: [MutationKind; 7] = [
        MutationKind::OffByOne,
        MutationKind::BooleanInversion,
        MutationKind::BoundaryShift,
        MutationKind::ExceptionWeakening,
        MutationKind::ErrorPathInjection,
        MutationKind::ConstantMutation,
        MutationKind::EarlyReturn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OffByOne => "off_by_one",
            Self::BooleanInversion => "boolean_inversion",
            Self::BoundaryShift => "boundary_shift",
            Self::ExceptionWeakening => "exception_weakening",
            Self::ErrorPathInjection => "error_path_injection",
            Self::ConstantMutation => "constant_mutation",
            Self::EarlyReturn => "early_return",
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MutationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| format!("unknown mutation kind '{}'", s))
    }
}

/// One single-location defect in one source file.
///
/// Invariant: `mutated_text != original_text`, and `original_text` is exactly
/// the bytes at `byte_start..byte_end` of the file it was generated from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    /// Absolute path of the mutated source file
    pub source_file: PathBuf,
    /// 1-indexed line of the mutated span
    pub line_number: usize,
    /// 1-indexed column of the mutated span
    pub column: usize,
    pub kind: MutationKind,
    /// Name of the pattern rule that produced this mutant
    pub rule: String,
    pub byte_start: usize,
    pub byte_end: usize,
    pub original_text: String,
    pub mutated_text: String,
}

impl Mutation {
    /// Human-readable description of the mutation (e.g., "Changed `<` to `<=`")
    pub fn description(&self) -> String {
        format!(
            "Changed `{}` to `{}`",
            self.original_text.trim(),
            self.mutated_text.trim()
        )
    }

    /// Stable identity of this mutant when run against `test_target`.
    ///
    /// Together with the file's content hash this keys the result cache.
    pub fn signature(&self, test_target: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update(b"\0");
        hasher.update(self.rule.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.byte_start.to_le_bytes());
        hasher.update(self.byte_end.to_le_bytes());
        hasher.update(self.original_text.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.mutated_text.as_bytes());
        hasher.update(b"\0");
        hasher.update(test_target.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Result of running the test against one mutant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrialOutcome {
    /// The test failed - mutation was caught
    Killed,
    /// The test passed - mutation was NOT caught
    Survived,
    /// The test took too long
    TimedOut,
    /// The runner could not launch, crashed, or the mutant did not build
    Errored,
}

impl TrialOutcome {
    /// Killed and survived trials count toward the score; the rest are
    /// inconclusive.
    pub fn is_conclusive(&self) -> bool {
        matches!(self, Self::Killed | Self::Survived)
    }
}

impl std::fmt::Display for TrialOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Killed => write!(f, "killed"),
            Self::Survived => write!(f, "survived"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// Complete result of one trial
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResult {
    pub mutation: Mutation,
    pub outcome: TrialOutcome,
    pub duration_ms: u64,
    /// Bounded excerpt of the runner's output
    pub test_output_excerpt: Option<String>,
    /// First failing test named in the output, when recognisable
    pub killing_test: Option<String>,
}

/// Compute a SHA256 hash of the content
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}
