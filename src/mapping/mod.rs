//! Test-to-source resolution.
//!
//! Given a test file, find the production source file(s) it most likely
//! exercises. Strategies run from most to least certain; the first one that
//! produces a confident candidate ends the search, otherwise the best
//! candidate seen above `mapping.min_confidence` wins. Results are ranked
//! lists so callers can surface close runner-ups.

use crate::config::Config;
use crate::language::{file_stem_lower, Language};
use crate::project::ProjectLayout;
use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A candidate at or above this confidence stops the search.
pub const CONFIDENT: f64 = 0.8;

/// Runner-ups within this margin of the winner are reported as ambiguous.
pub const CLOSE_MARGIN: f64 = 0.05;

const EXACT_CONFIDENCE: f64 = 1.0;
const SYNONYM_CONFIDENCE: f64 = 0.9;
const HINT_FLOOR: f64 = 0.5;
const HINT_SPAN: f64 = 0.35;
const IMPORT_FLOOR: f64 = 0.4;
const IMPORT_SPAN: f64 = 0.4;
const FUZZY_CEILING: f64 = 0.6;

/// Test concept -> source concepts.
const BUILTIN_SYNONYMS: &[(&str, &[&str])] = &[
    ("notification_system", &["notifications", "notification", "notifier"]),
    ("notifications", &["notification_system", "notifier"]),
    ("auth", &["authentication", "login", "session"]),
    ("authentication", &["auth", "login"]),
    ("login", &["auth", "authentication"]),
    ("user_management", &["users", "user", "accounts"]),
    ("configuration", &["config", "settings"]),
    ("config", &["configuration", "settings"]),
    ("settings", &["config", "configuration"]),
    ("database", &["db", "storage", "store"]),
    ("db", &["database", "storage"]),
    ("persistence", &["storage", "db", "repository"]),
    ("http", &["server", "client", "api"]),
    ("cli", &["main", "args", "commands"]),
    ("parsing", &["parser", "parse"]),
    ("serialization", &["serde", "codec", "encoding"]),
    ("pipeline_runner", &["pipelines", "pipeline"]),
];

/// Keyword in a test name -> directory to search preferentially.
const BUILTIN_DIRECTORY_HINTS: &[(&str, &str)] = &[
    ("dashboard", "dashboards"),
    ("pipeline", "pipelines"),
    ("handler", "handlers"),
    ("route", "routes"),
    ("model", "models"),
    ("view", "views"),
    ("service", "services"),
    ("component", "components"),
    ("util", "utils"),
    ("helper", "helpers"),
    ("api", "api"),
    ("migration", "migrations"),
];

/// How a candidate was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Exact,
    Synonym,
    DirectoryHint,
    ImportAnalysis,
    Fuzzy,
}

impl Strategy {
    /// Most certain first.
    pub const ORDER: [Strategy; 5] = [
        Strategy::Exact,
        Strategy::Synonym,
        Strategy::DirectoryHint,
        Strategy::ImportAnalysis,
        Strategy::Fuzzy,
    ];
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Strategy::Exact => "exact",
            Strategy::Synonym => "synonym",
            Strategy::DirectoryHint => "directory_hint",
            Strategy::ImportAnalysis => "import_analysis",
            Strategy::Fuzzy => "fuzzy",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// Absolute path of the source file
    pub source_file: PathBuf,
    pub confidence: f64,
    pub strategy: Strategy,
}

/// Result of mapping one test.
#[derive(Debug, Clone, PartialEq)]
pub enum Mapping {
    /// Ranked best-first; never empty
    Mapped(Vec<Candidate>),
    /// Nothing cleared the threshold
    Unmapped { best_rejected: Option<Candidate> },
}

impl Mapping {
    pub fn best(&self) -> Option<&Candidate> {
        match self {
            Mapping::Mapped(ranked) => ranked.first(),
            Mapping::Unmapped { .. } => None,
        }
    }

    /// Runner-ups whose confidence is within [`CLOSE_MARGIN`] of the winner.
    pub fn close_alternatives(&self) -> Vec<&Candidate> {
        match self {
            Mapping::Mapped(ranked) => {
                let Some(best) = ranked.first() else {
                    return Vec::new();
                };
                ranked[1..]
                    .iter()
                    .filter(|c| best.confidence - c.confidence <= CLOSE_MARGIN)
                    .collect()
            }
            Mapping::Unmapped { .. } => Vec::new(),
        }
    }
}

/// A source file with its precomputed naming facts.
struct SourceEntry {
    path: PathBuf,
    relative: PathBuf,
    concept: String,
    /// Normalized directory components of the relative path
    dirs: Vec<String>,
    depth: usize,
}

pub struct SourceTestMapper {
    config: Arc<Config>,
    root: PathBuf,
    language: Language,
    sources: Vec<SourceEntry>,
    synonyms: BTreeMap<String, Vec<String>>,
    hints: BTreeMap<String, String>,
    reference_patterns: Vec<Regex>,
}

impl SourceTestMapper {
    pub fn new(config: Arc<Config>, layout: &ProjectLayout) -> Result<Self> {
        let sources = layout
            .source_files
            .iter()
            .map(|path| {
                let relative = path.strip_prefix(&layout.root).unwrap_or(path).to_path_buf();
                let dirs: Vec<String> = relative
                    .parent()
                    .map(|p| {
                        p.components()
                            .map(|c| normalize(&c.as_os_str().to_string_lossy()))
                            .collect()
                    })
                    .unwrap_or_default();
                SourceEntry {
                    concept: source_concept(&relative),
                    depth: relative.components().count(),
                    path: path.clone(),
                    dirs,
                    relative,
                }
            })
            .collect();

        let mut synonyms: BTreeMap<String, Vec<String>> = BUILTIN_SYNONYMS
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect();
        for (key, values) in &config.mapping.synonyms {
            synonyms
                .entry(normalize(key))
                .or_default()
                .extend(values.iter().map(|v| normalize(v)));
        }

        let mut hints: BTreeMap<String, String> = BUILTIN_DIRECTORY_HINTS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        for (keyword, dir) in &config.mapping.directory_hints {
            hints.insert(normalize(keyword), normalize(dir));
        }

        Ok(Self {
            reference_patterns: reference_patterns(layout.language)?,
            config,
            root: layout.root.clone(),
            language: layout.language,
            sources,
            synonyms,
            hints,
        })
    }

    /// Resolve a test file to ranked source candidates.
    pub fn map(&self, test_file: &Path) -> Mapping {
        let test_path = if test_file.is_absolute() {
            test_file.to_path_buf()
        } else {
            self.root.join(test_file)
        };
        let concept = self.test_concept(&test_path);

        let mut found: Vec<Candidate> = Vec::new();
        for strategy in Strategy::ORDER {
            found.extend(match strategy {
                Strategy::Exact => self.exact(&concept),
                Strategy::Synonym => self.synonym(&concept),
                Strategy::DirectoryHint => self.directory_hinted(&concept),
                Strategy::ImportAnalysis => self.imports(&test_path),
                Strategy::Fuzzy => self.fuzzy(&concept),
            });
            if found.iter().any(|c| c.confidence >= CONFIDENT) {
                break;
            }
        }

        let ranked = self.rank(found);
        let min_confidence = self.config.mapping.min_confidence;
        let accepted: Vec<Candidate> = ranked
            .iter()
            .filter(|c| c.confidence >= min_confidence)
            .cloned()
            .collect();

        if accepted.is_empty() {
            let best_rejected = ranked.into_iter().next();
            match &best_rejected {
                Some(c) => tracing::info!(
                    "Unmapped {}: best candidate {} ({:.2}) below threshold {:.2}",
                    test_file.display(),
                    c.source_file.display(),
                    c.confidence,
                    min_confidence
                ),
                None => tracing::info!("Unmapped {}: no candidates", test_file.display()),
            }
            return Mapping::Unmapped { best_rejected };
        }

        let mapping = Mapping::Mapped(accepted);
        if let Some(best) = mapping.best() {
            tracing::info!(
                "Mapped {} -> {} via {} ({:.2})",
                test_file.display(),
                best.source_file.display(),
                best.strategy,
                best.confidence
            );
        }
        let close = mapping.close_alternatives();
        if !close.is_empty() {
            tracing::warn!(
                "Ambiguous mapping for {}: {} candidate(s) within {:.2} of the winner",
                test_file.display(),
                close.len(),
                CLOSE_MARGIN
            );
        }
        mapping
    }

    /// Tests among `tests` whose best mapping is `source_file`.
    pub fn tests_for_source(&self, tests: &[PathBuf], source_file: &Path) -> Vec<PathBuf> {
        tests
            .iter()
            .filter(|test| {
                self.map(test)
                    .best()
                    .is_some_and(|c| c.source_file == source_file)
            })
            .cloned()
            .collect()
    }

    fn test_concept(&self, test_path: &Path) -> String {
        let stem = test_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let snake = to_snake(&stem);
        normalize(self.language.strip_test_affix(&snake))
    }

    fn exact(&self, concept: &str) -> Vec<Candidate> {
        self.sources
            .iter()
            .filter(|s| s.concept == concept)
            .map(|s| candidate(s, EXACT_CONFIDENCE, Strategy::Exact))
            .collect()
    }

    fn synonym(&self, concept: &str) -> Vec<Candidate> {
        let mut targets: HashSet<String> = self
            .synonyms
            .get(concept)
            .map(|v| v.iter().cloned().collect())
            .unwrap_or_default();
        // Singular and plural forms are always synonyms
        match concept.strip_suffix('s') {
            Some(singular) if !singular.is_empty() => {
                targets.insert(singular.to_string());
            }
            _ => {
                targets.insert(format!("{}s", concept));
            }
        }

        self.sources
            .iter()
            .filter(|s| targets.contains(&s.concept))
            .map(|s| candidate(s, SYNONYM_CONFIDENCE, Strategy::Synonym))
            .collect()
    }

    fn directory_hinted(&self, concept: &str) -> Vec<Candidate> {
        let dirs: HashSet<&str> = self
            .hints
            .iter()
            .filter(|(keyword, _)| concept.contains(keyword.as_str()))
            .map(|(_, dir)| dir.as_str())
            .collect();
        if dirs.is_empty() {
            return Vec::new();
        }

        self.sources
            .iter()
            .filter(|s| s.dirs.iter().any(|d| dirs.contains(d.as_str())))
            .map(|s| {
                let score = HINT_FLOOR + HINT_SPAN * similarity(concept, &s.concept);
                candidate(s, score, Strategy::DirectoryHint)
            })
            .collect()
    }

    fn imports(&self, test_path: &Path) -> Vec<Candidate> {
        let Ok(text) = std::fs::read_to_string(test_path) else {
            return Vec::new();
        };

        let mut segments: Vec<String> = Vec::new();
        for pattern in &self.reference_patterns {
            for caps in pattern.captures_iter(&text) {
                if let Some(reference) = caps.get(1) {
                    segments.extend(reference_segments(reference.as_str()));
                }
            }
        }
        if segments.is_empty() {
            return Vec::new();
        }

        let mut hits: HashMap<usize, usize> = HashMap::new();
        for segment in &segments {
            for (i, source) in self.sources.iter().enumerate() {
                if &source.concept == segment {
                    *hits.entry(i).or_default() += 1;
                }
            }
        }
        let total: usize = hits.values().sum();
        if total == 0 {
            return Vec::new();
        }

        hits.into_iter()
            .map(|(i, count)| {
                let share = count as f64 / total as f64;
                candidate(
                    &self.sources[i],
                    IMPORT_FLOOR + IMPORT_SPAN * share,
                    Strategy::ImportAnalysis,
                )
            })
            .collect()
    }

    fn fuzzy(&self, concept: &str) -> Vec<Candidate> {
        self.sources
            .iter()
            .map(|s| {
                let score = FUZZY_CEILING * similarity(concept, &s.concept);
                candidate(s, score, Strategy::Fuzzy)
            })
            .filter(|c| c.confidence > 0.0)
            .collect()
    }

    /// Keep each source's best candidate, then order by confidence, depth,
    /// and path.
    fn rank(&self, found: Vec<Candidate>) -> Vec<Candidate> {
        let mut best: HashMap<PathBuf, Candidate> = HashMap::new();
        for c in found {
            match best.get(&c.source_file) {
                Some(existing) if existing.confidence >= c.confidence => {}
                _ => {
                    best.insert(c.source_file.clone(), c);
                }
            }
        }

        let depth_of: HashMap<&Path, (usize, &Path)> = self
            .sources
            .iter()
            .map(|s| (s.path.as_path(), (s.depth, s.relative.as_path())))
            .collect();

        let mut ranked: Vec<Candidate> = best.into_values().collect();
        ranked.sort_by(|a, b| {
            let (da, ra) = depth_of
                .get(a.source_file.as_path())
                .copied()
                .unwrap_or((usize::MAX, a.source_file.as_path()));
            let (db, rb) = depth_of
                .get(b.source_file.as_path())
                .copied()
                .unwrap_or((usize::MAX, b.source_file.as_path()));
            b.confidence
                .total_cmp(&a.confidence)
                .then(da.cmp(&db))
                .then_with(|| ra.cmp(rb))
        });
        ranked
    }
}

fn candidate(source: &SourceEntry, confidence: f64, strategy: Strategy) -> Candidate {
    Candidate {
        source_file: source.path.clone(),
        confidence: confidence.clamp(0.0, 1.0),
        strategy,
    }
}

/// The concept a source file stands for: its stem, or its directory for
/// module entry files (`mod.rs`, `__init__.py`, `index.ts`).
fn source_concept(relative: &Path) -> String {
    let stem = file_stem_lower(relative);
    let entry_file = matches!(stem.as_str(), "mod" | "__init__" | "index");
    if entry_file {
        if let Some(dir) = relative
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
        {
            return normalize(&to_snake(&dir));
        }
    }
    let stem = relative
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    normalize(&to_snake(&stem))
}

/// Patterns whose first group is a module reference.
fn reference_patterns(language: Language) -> std::result::Result<Vec<Regex>, regex::Error> {
    let patterns: Vec<&str> = match language {
        Language::Rust => vec![
            r"\buse\s+(?:crate|super|self)?:*([\w:]+)",
            r"\b(?:crate|super)::([\w:]+)",
            r"\bmod\s+(\w+)\s*;",
        ],
        Language::Python => vec![
            r"(?m)^\s*from\s+([\w.]+)\s+import",
            r"(?m)^\s*import\s+([\w.]+)",
        ],
        Language::TypeScript => vec![
            r#"\bfrom\s+['"]([^'"]+)['"]"#,
            r#"\brequire\(\s*['"]([^'"]+)['"]\s*\)"#,
            r#"\bimport\(\s*['"]([^'"]+)['"]\s*\)"#,
        ],
        // Scripts name sibling files outright (`-f clamp.awk`, `. ./lib.sh`)
        Language::Generic => vec![r"([\w./-]+\.[A-Za-z]\w*)\b"],
    };

    patterns.into_iter().map(Regex::new).collect()
}

/// Split a module reference into normalized name segments.
fn reference_segments(reference: &str) -> Vec<String> {
    reference
        .split(|c| matches!(c, ':' | '.' | '/' | '\\'))
        .filter(|s| !s.is_empty())
        .map(|s| normalize(&to_snake(s)))
        .filter(|s| !matches!(s.as_str(), "" | "crate" | "super" | "self" | "src" | "lib"))
        .collect()
}

/// `clampToRange` -> `clamp_to_range`. Acronym runs stay together.
fn to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for ch in name.chars() {
        if ch.is_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
            prev_lower = false;
        } else {
            out.push(ch);
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        }
    }
    out
}

/// Lowercase, with `-`, `.` and spaces folded to single underscores.
fn normalize(name: &str) -> String {
    let folded: String = name
        .to_lowercase()
        .chars()
        .map(|c| if matches!(c, '-' | '.' | ' ') { '_' } else { c })
        .collect();
    folded
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Lexical similarity in `[0, 1]`: the better of token overlap and
/// normalized edit distance.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let tokens_a: HashSet<&str> = a.split('_').filter(|t| !t.is_empty()).collect();
    let tokens_b: HashSet<&str> = b.split('_').filter(|t| !t.is_empty()).collect();
    let jaccard = jaccard_similarity(&tokens_a, &tokens_b);

    let longest = a.chars().count().max(b.chars().count());
    let edit = 1.0 - levenshtein(a, b) as f64 / longest as f64;

    match jaccard.partial_cmp(&edit) {
        Some(Ordering::Less) => edit,
        _ => jaccard,
    }
}

fn jaccard_similarity(a: &HashSet<&str>, b: &HashSet<&str>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = if ca == *cb {
                diagonal
            } else {
                1 + diagonal.min(above).min(row[j])
            };
            diagonal = above;
        }
    }
    row[b.len()]
}
