//! Mutant generation.
//!
//! Scans a source file once per applicable rule and turns every match into
//! exactly one single-location [`Mutation`]. Two rules are never combined in
//! one mutant, so a mutant can't silently cancel itself out.

use super::patterns::PatternTable;
use super::{Mutation, MutationKind};
use crate::config::Config;
use crate::language::Language;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("refusing to mutate test file {0:?}")]
    TestFile(PathBuf),

    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0:?} is not valid UTF-8")]
    NotUtf8(PathBuf),
}

/// Mutants produced for one file.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    /// Selected mutants, ordered by position in the file
    pub mutations: Vec<Mutation>,
    /// Requested kinds that produced no candidate in this file
    pub unmatched_kinds: Vec<MutationKind>,
    /// Candidates found before the per-file cap was applied
    pub candidates_found: usize,
}

pub struct MutationGenerator {
    table: Arc<PatternTable>,
    config: Arc<Config>,
}

impl MutationGenerator {
    pub fn new(table: Arc<PatternTable>, config: Arc<Config>) -> Self {
        Self { table, config }
    }

    /// Read `source_file` and generate mutants for it.
    ///
    /// Test files are rejected: only production source is eligible.
    pub fn generate_file(
        &self,
        project_root: &Path,
        source_file: &Path,
        kinds: &[MutationKind],
    ) -> Result<Generation, GenerationError> {
        let relative = source_file.strip_prefix(project_root).unwrap_or(source_file);
        let language = Language::from_path(source_file);
        if language.is_test_file(relative) {
            return Err(GenerationError::TestFile(source_file.to_path_buf()));
        }

        let bytes = std::fs::read(source_file).map_err(|source| GenerationError::Read {
            path: source_file.to_path_buf(),
            source,
        })?;
        let text =
            String::from_utf8(bytes).map_err(|_| GenerationError::NotUtf8(source_file.into()))?;

        Ok(self.generate(source_file, language, &text, kinds))
    }

    /// Generate mutants for already-loaded text.
    pub fn generate(
        &self,
        source_file: &Path,
        language: Language,
        text: &str,
        kinds: &[MutationKind],
    ) -> Generation {
        let lines = LineIndex::new(text, language);
        let mut seen: HashSet<(usize, MutationKind)> = HashSet::new();
        let mut candidates = Vec::new();

        for rule in self.table.rules_for(kinds, language) {
            for m in rule.find_matches(text) {
                let (line_number, column) = lines.position(text, m.span.start);
                if lines.is_excluded(line_number) {
                    continue;
                }
                // One mutant per (line, kind); the first rule in table order wins
                if !seen.insert((line_number, rule.kind)) {
                    continue;
                }
                candidates.push(Mutation {
                    source_file: source_file.to_path_buf(),
                    line_number,
                    column,
                    kind: rule.kind,
                    rule: rule.name.to_string(),
                    byte_start: m.span.start,
                    byte_end: m.span.end,
                    original_text: text[m.span.clone()].to_string(),
                    mutated_text: m.replacement,
                });
            }
        }

        let unmatched_kinds: Vec<MutationKind> = kinds
            .iter()
            .copied()
            .filter(|k| !candidates.iter().any(|c| c.kind == *k))
            .collect();
        for kind in &unmatched_kinds {
            if self.table.supports(*kind, language) {
                tracing::debug!(
                    "No {} candidates in {} (kind skipped for this file)",
                    kind,
                    source_file.display()
                );
            } else {
                tracing::debug!("No {} rules for {} files", kind, language);
            }
        }

        let candidates_found = candidates.len();
        let mut mutations = select_subset(
            candidates,
            self.config.mutation.max_mutations_per_file,
            self.config.mutation.seed,
        );
        mutations.sort_by(|a, b| {
            (a.line_number, a.column, a.kind).cmp(&(b.line_number, b.column, b.kind))
        });

        tracing::debug!(
            "Generated {} mutations for {} ({} candidates)",
            mutations.len(),
            source_file.display(),
            candidates_found
        );

        Generation {
            mutations,
            unmatched_kinds,
            candidates_found,
        }
    }
}

/// Pick at most `cap` candidates, round-robin across kinds so one prolific
/// kind can't crowd out the others. Within a kind the order is a seeded
/// shuffle, so repeated runs pick the same subset.
fn select_subset(candidates: Vec<Mutation>, cap: usize, seed: u64) -> Vec<Mutation> {
    if candidates.len() <= cap {
        return candidates;
    }

    let mut by_kind: BTreeMap<MutationKind, Vec<Mutation>> = BTreeMap::new();
    for c in candidates {
        by_kind.entry(c.kind).or_default().push(c);
    }

    let mut rng = fastrand::Rng::with_seed(seed);
    let mut queues: Vec<std::vec::IntoIter<Mutation>> = by_kind
        .into_values()
        .map(|mut group| {
            rng.shuffle(&mut group);
            group.into_iter()
        })
        .collect();

    let mut selected = Vec::with_capacity(cap);
    while selected.len() < cap {
        let mut progressed = false;
        for queue in queues.iter_mut() {
            if selected.len() == cap {
                break;
            }
            if let Some(m) = queue.next() {
                selected.push(m);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    selected
}

/// Byte offsets of line starts plus the set of lines never mutated
/// (comments, imports, attributes, inline test modules).
struct LineIndex {
    starts: Vec<usize>,
    excluded: HashSet<usize>,
}

impl LineIndex {
    fn new(text: &str, language: Language) -> Self {
        let mut starts = vec![0];
        starts.extend(text.match_indices('\n').map(|(i, _)| i + 1));

        let mut excluded = HashSet::new();
        let mut in_test_module = false;
        for (idx, line) in text.lines().enumerate() {
            let line_number = idx + 1;
            let trimmed = line.trim_start();

            if language == Language::Rust && trimmed.starts_with("#[cfg(test)]") {
                // Inline test modules conventionally run to the end of the file
                in_test_module = true;
            }
            if in_test_module || is_non_code_line(trimmed, language) {
                excluded.insert(line_number);
            }
        }

        Self { starts, excluded }
    }

    /// 1-indexed (line, column) of a byte offset.
    fn position(&self, text: &str, offset: usize) -> (usize, usize) {
        let line_idx = match self.starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let column = text[self.starts[line_idx]..offset].chars().count() + 1;
        (line_idx + 1, column)
    }

    fn is_excluded(&self, line_number: usize) -> bool {
        self.excluded.contains(&line_number)
    }
}

fn is_non_code_line(trimmed: &str, language: Language) -> bool {
    if language
        .comment_prefixes()
        .iter()
        .any(|p| trimmed.starts_with(p))
    {
        return true;
    }
    match language {
        Language::Rust => {
            trimmed.starts_with("#[")
                || trimmed.starts_with("#![")
                || trimmed.starts_with("use ")
                || trimmed.starts_with("pub use ")
                || trimmed.starts_with("mod ")
                || trimmed.starts_with("extern crate ")
        }
        Language::Python => trimmed.starts_with("import ") || trimmed.starts_with("from "),
        Language::TypeScript => {
            trimmed.starts_with("import ")
                || trimmed.starts_with("export * from")
                || trimmed.contains("require(")
        }
        Language::Generic => trimmed.starts_with("#include") || trimmed.starts_with("@include"),
    }
}
