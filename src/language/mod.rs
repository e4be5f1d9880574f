//! Language conventions.
//!
//! This module knows, per language, which files are production source, which
//! are tests, how a test name relates to the source it exercises, and how the
//! test runner is usually invoked.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Supported project languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Rust,
    Python,
    TypeScript,
    /// Anything else. Only language-neutral mutation rules apply.
    Generic,
}

impl Language {
    /// Detect the primary language of a project by examining its contents.
    pub fn detect(project_root: &Path) -> Self {
        // Check for language-specific marker files
        if project_root.join("Cargo.toml").exists() {
            return Language::Rust;
        }
        if project_root.join("pyproject.toml").exists()
            || project_root.join("setup.py").exists()
            || project_root.join("setup.cfg").exists()
        {
            return Language::Python;
        }
        if project_root.join("package.json").exists() || project_root.join("tsconfig.json").exists()
        {
            return Language::TypeScript;
        }

        Language::Generic
    }

    /// Language of a single file, judged by its extension.
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "rs" => Language::Rust,
            "py" => Language::Python,
            "ts" | "tsx" | "js" | "jsx" | "mjs" | "cjs" => Language::TypeScript,
            _ => Language::Generic,
        }
    }

    /// Human-readable name for the language.
    pub fn name(&self) -> &'static str {
        match self {
            Language::Rust => "Rust",
            Language::Python => "Python",
            Language::TypeScript => "TypeScript",
            Language::Generic => "Generic",
        }
    }

    /// File extensions for this language. Empty means "any extension".
    pub fn file_extensions(&self) -> &'static [&'static str] {
        match self {
            Language::Rust => &["rs"],
            Language::Python => &["py"],
            Language::TypeScript => &["ts", "tsx", "js", "jsx", "mjs", "cjs"],
            Language::Generic => &[],
        }
    }

    /// Directories to skip when scanning for files.
    pub fn skip_directories(&self) -> &'static [&'static str] {
        match self {
            Language::Rust => &["target", "node_modules", ".git"],
            Language::Python => &[
                "__pycache__",
                ".venv",
                "venv",
                ".tox",
                "build",
                "dist",
                ".git",
            ],
            Language::TypeScript => &[
                "node_modules",
                ".git",
                "dist",
                "build",
                ".next",
                "coverage",
            ],
            Language::Generic => &[".git", "target", "node_modules", "build", "dist"],
        }
    }

    /// Prefixes that start a line comment.
    pub fn comment_prefixes(&self) -> &'static [&'static str] {
        match self {
            Language::Rust | Language::TypeScript => &["//", "/*", "*"],
            Language::Python => &["#"],
            Language::Generic => &["#", "//"],
        }
    }

    /// Default argv template for running a single test target.
    pub fn default_test_command(&self) -> Vec<String> {
        let argv: &[&str] = match self {
            Language::Rust => &["cargo", "test", "--test", "{test_name}"],
            Language::Python => &["python", "-m", "pytest", "-x", "-q", "{test_file}"],
            Language::TypeScript => &["npx", "jest", "{test_file}"],
            Language::Generic => &["sh", "{test_file}"],
        };
        argv.iter().map(|s| s.to_string()).collect()
    }

    /// Whether a file carries one of this language's extensions.
    pub fn accepts_extension(&self, path: &Path) -> bool {
        let exts = self.file_extensions();
        if exts.is_empty() {
            // Generic projects accept any file with an extension
            return path.extension().is_some();
        }
        path.extension()
            .map(|e| exts.contains(&e.to_string_lossy().as_ref()))
            .unwrap_or(false)
    }

    /// Whether a project-relative path names a test file.
    ///
    /// Anything under a `tests`/`test`/`__tests__` directory counts, as do
    /// files whose stem carries a test affix.
    pub fn is_test_file(&self, relative: &Path) -> bool {
        let in_test_dir = relative
            .parent()
            .map(|parent| {
                parent.components().any(|c| {
                    let name = c.as_os_str().to_string_lossy();
                    matches!(name.as_ref(), "tests" | "test" | "__tests__" | "spec")
                })
            })
            .unwrap_or(false);
        if in_test_dir {
            return true;
        }

        let file_name = relative
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let stem = file_stem_lower(relative);

        file_name.contains(".test.")
            || file_name.contains(".spec.")
            || stem.starts_with("test_")
            || stem.ends_with("_test")
            || stem.ends_with("_tests")
            || stem == "test"
            || stem == "tests"
            || stem == "conftest"
    }

    /// Strip the conventional test affix from a test file's base name.
    ///
    /// `test_clamp` -> `clamp`, `parser_tests` -> `parser`,
    /// `button.test` -> `button`.
    pub fn strip_test_affix<'a>(&self, base: &'a str) -> &'a str {
        let mut name = base;
        for suffix in [".test", ".spec", "_tests", "_test", "-test", "-tests"] {
            if let Some(stripped) = name.strip_suffix(suffix) {
                if !stripped.is_empty() {
                    name = stripped;
                    break;
                }
            }
        }
        for prefix in ["test_", "tests_", "test-"] {
            if let Some(stripped) = name.strip_prefix(prefix) {
                if !stripped.is_empty() {
                    name = stripped;
                    break;
                }
            }
        }
        name
    }

    /// Find all files under `dir` that carry this language's extensions,
    /// skipping hidden and build directories.
    pub fn find_files(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        if !dir.is_dir() {
            return Ok(files);
        }

        let root_dir = dir.to_path_buf();
        let skip_dirs = self.skip_directories();

        for entry in walkdir::WalkDir::new(dir)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                // Don't filter the root directory itself (may be a temp dir starting with .)
                if e.path() == root_dir {
                    return true;
                }
                let name = e.file_name().to_string_lossy();
                !name.starts_with('.') && !skip_dirs.contains(&name.as_ref())
            })
        {
            let entry = entry?;
            let path = entry.path();
            if path.is_file() && self.accepts_extension(path) && !is_backup_artifact(path) {
                files.push(path.to_path_buf());
            }
        }

        Ok(files)
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Lowercased file stem, with any trailing `.test`/`.spec` left in place.
pub fn file_stem_lower(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Files the engine itself leaves behind (backups, temp swaps) are never source.
fn is_backup_artifact(path: &Path) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    name.ends_with(".orig") || name.ends_with(".bak") || name.starts_with(".killrate")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // =========================================================================
    // Detection
    // =========================================================================

    #[test]
    fn test_language_detect_rust() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("Cargo.toml"), "[package]").unwrap();

        assert_eq!(Language::detect(temp_dir.path()), Language::Rust);
    }

    #[test]
    fn test_language_detect_python() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("pyproject.toml"), "").unwrap();

        assert_eq!(Language::detect(temp_dir.path()), Language::Python);
    }

    #[test]
    fn test_language_detect_unknown_is_generic() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(Language::detect(temp_dir.path()), Language::Generic);
    }

    #[test]
    fn test_from_path() {
        assert_eq!(Language::from_path(Path::new("src/lib.rs")), Language::Rust);
        assert_eq!(Language::from_path(Path::new("app/views.py")), Language::Python);
        assert_eq!(Language::from_path(Path::new("ui/App.tsx")), Language::TypeScript);
        assert_eq!(Language::from_path(Path::new("clamp.awk")), Language::Generic);
    }

    #[test]
    fn test_language_display() {
        assert_eq!(format!("{}", Language::Rust), "Rust");
        assert_eq!(Language::TypeScript.to_string(), "TypeScript");
    }

    // =========================================================================
    // Test-file conventions
    // =========================================================================

    #[test]
    fn test_is_test_file_by_affix() {
        let lang = Language::Python;
        assert!(lang.is_test_file(Path::new("test_parser.py")));
        assert!(lang.is_test_file(Path::new("pkg/parser_test.py")));
        assert!(lang.is_test_file(Path::new("conftest.py")));
        assert!(!lang.is_test_file(Path::new("pkg/parser.py")));
        assert!(!lang.is_test_file(Path::new("pkg/contest.py")));
    }

    #[test]
    fn test_is_test_file_by_directory() {
        let lang = Language::Rust;
        assert!(lang.is_test_file(Path::new("tests/integration.rs")));
        assert!(lang.is_test_file(Path::new("crates/a/tests/foo.rs")));
        assert!(!lang.is_test_file(Path::new("src/testing_utils.rs")));
    }

    #[test]
    fn test_is_test_file_dotted() {
        let lang = Language::TypeScript;
        assert!(lang.is_test_file(Path::new("src/button.test.tsx")));
        assert!(lang.is_test_file(Path::new("src/button.spec.ts")));
        assert!(!lang.is_test_file(Path::new("src/button.tsx")));
    }

    #[test]
    fn test_strip_test_affix() {
        let lang = Language::Generic;
        assert_eq!(lang.strip_test_affix("test_clamp"), "clamp");
        assert_eq!(lang.strip_test_affix("parser_tests"), "parser");
        assert_eq!(lang.strip_test_affix("parser_test"), "parser");
        assert_eq!(lang.strip_test_affix("button.test"), "button");
        assert_eq!(lang.strip_test_affix("plain"), "plain");
        // Never strip down to nothing
        assert_eq!(lang.strip_test_affix("test_"), "test_");
    }

    // =========================================================================
    // File discovery
    // =========================================================================

    #[test]
    fn test_find_files_filters_extension_and_skip_dirs() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("src")).unwrap();
        std::fs::create_dir_all(temp_dir.path().join("target/debug")).unwrap();
        std::fs::write(temp_dir.path().join("src/lib.rs"), "pub fn a() {}").unwrap();
        std::fs::write(temp_dir.path().join("src/notes.md"), "# notes").unwrap();
        std::fs::write(temp_dir.path().join("target/debug/gen.rs"), "// gen").unwrap();
        std::fs::write(temp_dir.path().join("src/lib.rs.killrate.orig"), "x").unwrap();

        let files = Language::Rust.find_files(temp_dir.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("src/lib.rs"));
    }

    #[test]
    fn test_find_files_skips_hidden() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join(".hidden")).unwrap();
        std::fs::write(temp_dir.path().join(".hidden/x.py"), "x = 1").unwrap();

        let files = Language::Python.find_files(temp_dir.path()).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn test_default_test_command_has_placeholder() {
        for lang in [
            Language::Rust,
            Language::Python,
            Language::TypeScript,
            Language::Generic,
        ] {
            let argv = lang.default_test_command();
            assert!(argv.iter().any(|a| a.contains("{test_")), "{}", lang);
        }
    }
}
