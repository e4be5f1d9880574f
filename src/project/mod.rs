//! Project layout discovery.
//!
//! Works out, for one project root, its language, where production source
//! lives, and which files are production source versus tests.

use crate::config::{Config, PROJECT_CONFIG_FILE};
use crate::language::Language;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Conventional source roots, tried in order before falling back to the root.
const SOURCE_ROOT_CANDIDATES: &[&str] = &["src", "lib", "app"];

/// Files a generic project never treats as mutable source.
const NON_SOURCE_EXTENSIONS: &[&str] = &[
    "toml", "json", "lock", "md", "txt", "yaml", "yml", "cfg", "ini", "orig", "bak",
];

/// A discovered project.
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    /// Canonical project root.
    pub root: PathBuf,
    /// Project name (from manifest or directory name).
    pub name: String,
    pub language: Language,
    /// Directory searched for production source.
    pub source_root: PathBuf,
    /// Absolute paths of production source files, sorted.
    pub source_files: Vec<PathBuf>,
    /// Absolute paths of test files, sorted.
    pub test_files: Vec<PathBuf>,
}

impl ProjectLayout {
    pub fn discover(root: &Path, config: &Config) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("Project root {} is not accessible", root.display()))?;
        if !root.is_dir() {
            anyhow::bail!("Project root {} is not a directory", root.display());
        }

        let language = Language::detect(&root);
        let source_root = match &config.mapping.source_root {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => root.join(dir),
            None => SOURCE_ROOT_CANDIDATES
                .iter()
                .map(|d| root.join(d))
                .find(|p| p.is_dir())
                .unwrap_or_else(|| root.clone()),
        };

        let source_files: Vec<PathBuf> = language
            .find_files(&source_root)?
            .into_iter()
            .filter(|path| {
                let relative = path.strip_prefix(&root).unwrap_or(path);
                !language.is_test_file(relative)
                    && !is_excluded(relative, &config.mutation.exclude)
                    && is_source_candidate(language, path)
            })
            .collect();

        let test_files: Vec<PathBuf> = language
            .find_files(&root)?
            .into_iter()
            .filter(|path| {
                let relative = path.strip_prefix(&root).unwrap_or(path);
                language.is_test_file(relative) && is_source_candidate(language, path)
            })
            .collect();

        let name = project_name(&root, language);

        tracing::info!(
            "Discovered {} project '{}' at {}: {} source files, {} test files",
            language,
            name,
            root.display(),
            source_files.len(),
            test_files.len()
        );
        tracing::debug!("Source root: {}", source_root.display());

        Ok(Self {
            root,
            name,
            language,
            source_root,
            source_files,
            test_files,
        })
    }

    /// Path relative to the project root, or the path itself if outside it.
    pub fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.root).unwrap_or(path)
    }

    /// Find a test by project-relative path, file name, or stem.
    pub fn resolve_test(&self, name: &str) -> Option<PathBuf> {
        resolve(&self.root, &self.test_files, name)
    }

    /// Find a source file by project-relative path, file name, or stem.
    pub fn resolve_source(&self, name: &str) -> Option<PathBuf> {
        resolve(&self.root, &self.source_files, name)
    }
}

fn resolve(root: &Path, files: &[PathBuf], name: &str) -> Option<PathBuf> {
    let wanted = name.trim_start_matches("./").replace('\\', "/");
    let by = |f: &dyn Fn(&Path) -> bool| files.iter().find(|p| f(p.as_path())).cloned();

    by(&|p: &Path| {
        p.strip_prefix(root)
            .map(|r| r.to_string_lossy().replace('\\', "/") == wanted)
            .unwrap_or(false)
    })
    .or_else(|| by(&|p: &Path| p.file_name().is_some_and(|n| n.to_string_lossy() == wanted)))
    .or_else(|| by(&|p: &Path| p.file_stem().is_some_and(|n| n.to_string_lossy() == wanted)))
}

fn is_excluded(relative: &Path, patterns: &[String]) -> bool {
    let path = relative.to_string_lossy().replace('\\', "/");
    patterns
        .iter()
        .any(|pattern| glob_match::glob_match(pattern, &path))
}

fn is_source_candidate(language: Language, path: &Path) -> bool {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if file_name == PROJECT_CONFIG_FILE {
        return false;
    }
    if language != Language::Generic {
        return true;
    }
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    !NON_SOURCE_EXTENSIONS.contains(&ext.as_str())
}

/// Project name from the manifest, else the directory name.
fn project_name(root: &Path, language: Language) -> String {
    let from_manifest = match language {
        Language::Rust => toml_string(&root.join("Cargo.toml"), &["package", "name"]),
        Language::Python => toml_string(&root.join("pyproject.toml"), &["project", "name"])
            .or_else(|| {
                toml_string(&root.join("pyproject.toml"), &["tool", "poetry", "name"])
            }),
        Language::TypeScript => parse_npm_package_name(&root.join("package.json")),
        Language::Generic => None,
    };
    from_manifest.unwrap_or_else(|| directory_name(root))
}

/// Read a nested string key from a TOML file.
fn toml_string(path: &Path, keys: &[&str]) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let doc: toml::Value = content.parse().ok()?;
    let mut value = &doc;
    for key in keys {
        value = value.get(key)?;
    }
    value.as_str().map(String::from)
}

/// Parse package.json for package name.
fn parse_npm_package_name(package_json_path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(package_json_path).ok()?;
    let json: serde_json::Value = serde_json::from_str(&content).ok()?;

    json.get("name")?.as_str().map(String::from)
}

/// Get the directory name as a string.
fn directory_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string()
}
