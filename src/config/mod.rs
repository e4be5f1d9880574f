//! Run configuration.
//!
//! A [`Config`] is built once per run: hard-coded defaults, overlaid by an
//! optional TOML file, overlaid by `KILLRATE_*` environment variables, then
//! validated. It is immutable afterwards and shared as `Arc<Config>`.

use crate::language::Language;
use crate::mutation::MutationKind;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Name of the per-project config file looked up at the project root.
pub const PROJECT_CONFIG_FILE: &str = "killrate.toml";

/// Prefix shared by all environment overrides.
pub const ENV_PREFIX: &str = "KILLRATE_";

/// Errors raised while building the run configuration. All of them are fatal
/// and surface before any trial starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value {value:?} for environment variable {var}: {reason}")]
    InvalidEnv {
        var: String,
        value: String,
        reason: String,
    },

    #[error("invalid configuration: {field} {reason} (got {value})")]
    Invalid {
        field: &'static str,
        reason: &'static str,
        value: String,
    },
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Mutant generation settings
    #[serde(default)]
    pub mutation: MutationSettings,

    /// Trial execution settings
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Scoring settings
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Test-to-source mapping settings
    #[serde(default)]
    pub mapping: MappingConfig,

    /// Result cache settings
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationSettings {
    /// Maximum mutants generated per source file
    #[serde(default = "default_max_mutations_per_file")]
    pub max_mutations_per_file: usize,

    /// Mutation kinds to generate
    #[serde(default = "default_kinds")]
    pub kinds: Vec<MutationKind>,

    /// Seed for choosing a subset when candidates exceed the cap
    #[serde(default)]
    pub seed: u64,

    /// Glob patterns (project-relative) of source files never mutated
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Wall-clock limit for one test run
    #[serde(default = "default_trial_timeout")]
    pub per_trial_timeout_seconds: u64,

    /// Number of trials allowed in flight at once
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Runner argv template. Empty means the project language's default.
    #[serde(default)]
    pub test_command: Vec<String>,

    /// Maximum test output kept per result (bytes)
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Run each test once against the untouched tree before mutating
    #[serde(default = "default_true")]
    pub verify_baseline: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Scores (and per-kind kill rates) below this are reported as failing
    #[serde(default = "default_min_score_threshold")]
    pub min_score_threshold: f64,

    /// Conclusive trials a kind needs before it can be called a weak spot
    #[serde(default = "default_min_kind_samples")]
    pub min_kind_samples: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingConfig {
    /// Confidence below which a test is reported as unmapped
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Source root relative to the project root (auto-detected when unset)
    #[serde(default)]
    pub source_root: Option<PathBuf>,

    /// Extra synonyms: normalized test concept -> source concepts
    #[serde(default)]
    pub synonyms: BTreeMap<String, Vec<String>>,

    /// Extra directory hints: keyword in test name -> directory to search
    #[serde(default)]
    pub directory_hints: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum cached trial results
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    /// JSON snapshot loaded before and saved after a run
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_mutations_per_file() -> usize {
    10
}

fn default_kinds() -> Vec<MutationKind> {
    MutationKind::ALL.to_vec()
}

fn default_trial_timeout() -> u64 {
    60
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(8)
}

fn default_max_output_bytes() -> usize {
    4000
}

fn default_true() -> bool {
    true
}

fn default_min_score_threshold() -> f64 {
    0.8
}

fn default_min_kind_samples() -> usize {
    3
}

fn default_min_confidence() -> f64 {
    0.5
}

fn default_cache_capacity() -> usize {
    1024
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for MutationSettings {
    fn default() -> Self {
        Self {
            max_mutations_per_file: default_max_mutations_per_file(),
            kinds: default_kinds(),
            seed: 0,
            exclude: Vec::new(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            per_trial_timeout_seconds: default_trial_timeout(),
            worker_count: default_worker_count(),
            test_command: Vec::new(),
            max_output_bytes: default_max_output_bytes(),
            verify_baseline: true,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            min_score_threshold: default_min_score_threshold(),
            min_kind_samples: default_min_kind_samples(),
        }
    }
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            source_root: None,
            synonyms: BTreeMap::new(),
            directory_hints: BTreeMap::new(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            path: None,
        }
    }
}

impl Config {
    /// Build the run configuration from defaults, the config file, and the
    /// process environment, then validate it.
    ///
    /// The file is `path` if given, else `<project_root>/killrate.toml`, else
    /// the per-user config file. Only the implicit files may be missing.
    pub fn load(path: Option<&Path>, project_root: &Path) -> Result<Self, ConfigError> {
        let config_path = path
            .map(PathBuf::from)
            .or_else(|| {
                let local = project_root.join(PROJECT_CONFIG_FILE);
                local.exists().then_some(local)
            })
            .or_else(|| Self::default_config_path().filter(|p| p.exists()));

        Self::from_sources(config_path.as_deref(), std::env::vars())
    }

    /// Layer file and environment overrides over defaults and validate.
    ///
    /// A named `file` must exist; optional lookups are resolved by the caller.
    pub fn from_sources<I>(file: Option<&Path>, env: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file without validating it.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Overlay `KILLRATE_*` variables. Unknown `KILLRATE_*` names are ignored,
    /// values that fail to parse are errors.
    pub fn apply_env<I>(&mut self, env: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (var, value) in env {
            let Some(key) = var.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match key {
                "MAX_MUTATIONS_PER_FILE" => {
                    self.mutation.max_mutations_per_file = parse_env(&var, &value)?
                }
                "PER_TRIAL_TIMEOUT_SECONDS" | "TRIAL_TIMEOUT_SECONDS" => {
                    self.execution.per_trial_timeout_seconds = parse_env(&var, &value)?
                }
                "WORKER_COUNT" => self.execution.worker_count = parse_env(&var, &value)?,
                "MIN_SCORE_THRESHOLD" => {
                    self.analysis.min_score_threshold = parse_env(&var, &value)?
                }
                "MIN_KIND_SAMPLES" => self.analysis.min_kind_samples = parse_env(&var, &value)?,
                "MIN_CONFIDENCE" => self.mapping.min_confidence = parse_env(&var, &value)?,
                "SEED" => self.mutation.seed = parse_env(&var, &value)?,
                "CACHE_CAPACITY" => self.cache.capacity = parse_env(&var, &value)?,
                "CACHE_PATH" => self.cache.path = Some(PathBuf::from(value)),
                "LOG_LEVEL" => self.general.log_level = value,
                "TEST_COMMAND" => {
                    self.execution.test_command =
                        value.split_whitespace().map(str::to_string).collect()
                }
                "VERIFY_BASELINE" => self.execution.verify_baseline = parse_env(&var, &value)?,
                "KINDS" => {
                    self.mutation.kinds = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(|s| parse_env::<MutationKind>(&var, s))
                        .collect::<Result<_, _>>()?
                }
                _ => tracing::debug!("Ignoring unknown override {}", var),
            }
        }
        Ok(())
    }

    /// Check every constraint. Violations are reported, never clamped.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.execution.worker_count < 1 {
            return Err(invalid(
                "execution.worker_count",
                "must be at least 1",
                self.execution.worker_count,
            ));
        }
        if self.execution.per_trial_timeout_seconds == 0 {
            return Err(invalid(
                "execution.per_trial_timeout_seconds",
                "must be greater than 0",
                self.execution.per_trial_timeout_seconds,
            ));
        }
        let threshold = self.analysis.min_score_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(invalid(
                "analysis.min_score_threshold",
                "must be between 0 and 1",
                threshold,
            ));
        }
        if self.mutation.max_mutations_per_file < 1 {
            return Err(invalid(
                "mutation.max_mutations_per_file",
                "must be at least 1",
                self.mutation.max_mutations_per_file,
            ));
        }
        if self.mutation.kinds.is_empty() {
            return Err(invalid(
                "mutation.kinds",
                "must name at least one kind",
                "[]",
            ));
        }
        let confidence = self.mapping.min_confidence;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(invalid(
                "mapping.min_confidence",
                "must be between 0 and 1",
                confidence,
            ));
        }
        if self.cache.capacity < 1 {
            return Err(invalid(
                "cache.capacity",
                "must be at least 1",
                self.cache.capacity,
            ));
        }
        if !self.execution.test_command.is_empty()
            && self.execution.test_command[0].trim().is_empty()
        {
            return Err(invalid(
                "execution.test_command",
                "must start with a program name",
                format!("{:?}", self.execution.test_command),
            ));
        }
        Ok(())
    }

    /// Runner argv template: the configured one, or the language default.
    pub fn test_command_for(&self, language: Language) -> Vec<String> {
        if self.execution.test_command.is_empty() {
            language.default_test_command()
        } else {
            self.execution.test_command.clone()
        }
    }

    /// Per-trial timeout as a `Duration`.
    pub fn trial_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.execution.per_trial_timeout_seconds)
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "killrate", "killrate")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

fn parse_env<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidEnv {
            var: var.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn invalid(field: &'static str, reason: &'static str, value: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason,
        value: value.to_string(),
    }
}
