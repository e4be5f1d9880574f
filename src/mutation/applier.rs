//! Mutant application and restoration.
//!
//! Handles swapping a mutant onto disk and putting the original back. Every
//! write goes to a temp file in the same directory and is renamed over the
//! target, so no reader ever observes a half-written file. A backup of the
//! original sits next to the file while a mutant is live; leftovers from a
//! crashed run are repaired by [`recover_backups`] before new trials start.

use super::{content_hash, Mutation};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};

/// Suffix of the backup kept beside a file while a mutant is live.
pub const BACKUP_SUFFIX: &str = ".killrate.orig";

/// Prefix of the temp files used for atomic swaps.
const TEMP_PREFIX: &str = ".killrate-swap-";

/// Restoration is retried this many times before giving up.
const RESTORE_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("mutation at {path:?}:{line} no longer matches the file (expected {expected:?})")]
    SpanMismatch {
        path: PathBuf,
        line: usize,
        expected: String,
    },

    #[error("leftover backup {backup:?} exists; run recovery before mutating {path:?}")]
    StaleBackup { path: PathBuf, backup: PathBuf },

    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CRITICAL: could not confirm restoration of {path:?}: {reason}")]
    RestoreUnconfirmed { path: PathBuf, reason: String },
}

impl ApplyError {
    /// Whether the source tree may be left modified. Such errors halt the run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ApplyError::RestoreUnconfirmed { .. } | ApplyError::StaleBackup { .. }
        )
    }
}

/// One async mutex per source file.
#[derive(Default)]
pub struct FileLocks {
    locks: Mutex<HashMap<PathBuf, Arc<TokioMutex<()>>>>,
}

impl FileLocks {
    /// Wait for exclusive access to `path`.
    pub async fn acquire(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(TokioMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Swaps mutants onto disk under a per-file lock.
#[derive(Default)]
pub struct MutationApplier {
    locks: FileLocks,
}

impl MutationApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the file's lock and swap the mutant in.
    ///
    /// The returned guard restores the original when [`AppliedMutation::restore`]
    /// is called, or on drop if the trial unwinds or is cancelled first. The
    /// file lock is released only after restoration.
    pub async fn apply(&self, mutation: &Mutation) -> Result<AppliedMutation, ApplyError> {
        let path = mutation.source_file.clone();
        let guard = self.locks.acquire(&path).await;

        let backup = backup_path(&path);
        if backup.exists() {
            return Err(ApplyError::StaleBackup { path, backup });
        }

        let original = std::fs::read(&path).map_err(|source| ApplyError::Read {
            path: path.clone(),
            source,
        })?;
        let mutated = splice(&original, mutation)?;

        // Backup first, so a crash between here and restore is recoverable
        atomic_write(&backup, &original).map_err(|source| ApplyError::Write {
            path: backup.clone(),
            source,
        })?;

        if let Err(source) = atomic_write(&path, &mutated) {
            // The rename never happened, so the original is still in place
            let _ = std::fs::remove_file(&backup);
            return Err(ApplyError::Write { path, source });
        }

        tracing::debug!(
            "Applied mutation {}:{} ({})",
            path.display(),
            mutation.line_number,
            mutation.kind
        );

        Ok(AppliedMutation {
            original_hash: content_hash(&original),
            path,
            backup,
            original,
            restored: false,
            _guard: guard,
        })
    }
}

/// A live mutant. Restores the original file when consumed or dropped.
pub struct AppliedMutation {
    path: PathBuf,
    backup: PathBuf,
    original: Vec<u8>,
    original_hash: String,
    restored: bool,
    // Dropped after `Drop::drop` runs, i.e. after restoration
    _guard: OwnedMutexGuard<()>,
}

impl AppliedMutation {
    /// Put the original bytes back and verify them by hash.
    pub fn restore(mut self) -> Result<(), ApplyError> {
        let result = self.restore_verified();
        self.restored = true;
        result
    }

    fn restore_verified(&mut self) -> Result<(), ApplyError> {
        let mut last_failure = String::new();

        for attempt in 1..=RESTORE_ATTEMPTS {
            match atomic_write(&self.path, &self.original) {
                Ok(()) => match std::fs::read(&self.path) {
                    Ok(bytes) if content_hash(&bytes) == self.original_hash => {
                        if let Err(e) = std::fs::remove_file(&self.backup) {
                            tracing::warn!(
                                "Restored {} but could not remove backup {}: {}",
                                self.path.display(),
                                self.backup.display(),
                                e
                            );
                        }
                        return Ok(());
                    }
                    Ok(_) => last_failure = "content hash mismatch after write".to_string(),
                    Err(e) => last_failure = format!("read-back failed: {}", e),
                },
                Err(e) => last_failure = format!("write failed: {}", e),
            }
            tracing::warn!(
                "Restore attempt {}/{} for {} failed: {}",
                attempt,
                RESTORE_ATTEMPTS,
                self.path.display(),
                last_failure
            );
        }

        // Backup stays on disk for recovery at next startup
        Err(ApplyError::RestoreUnconfirmed {
            path: self.path.clone(),
            reason: last_failure,
        })
    }
}

impl Drop for AppliedMutation {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        tracing::warn!(
            "Trial on {} ended without explicit restore, restoring now",
            self.path.display()
        );
        if let Err(e) = self.restore_verified() {
            tracing::error!("{}", e);
        }
        self.restored = true;
    }
}

/// Splice the mutated text into the original bytes, verifying the span first.
pub fn splice(original: &[u8], mutation: &Mutation) -> Result<Vec<u8>, ApplyError> {
    let span = original.get(mutation.byte_start..mutation.byte_end);
    if span != Some(mutation.original_text.as_bytes()) {
        return Err(ApplyError::SpanMismatch {
            path: mutation.source_file.clone(),
            line: mutation.line_number,
            expected: mutation.original_text.clone(),
        });
    }

    let mut mutated = Vec::with_capacity(original.len() + mutation.mutated_text.len());
    mutated.extend_from_slice(&original[..mutation.byte_start]);
    mutated.extend_from_slice(mutation.mutated_text.as_bytes());
    mutated.extend_from_slice(&original[mutation.byte_end..]);
    Ok(mutated)
}

/// Path of the backup kept beside `path` while a mutant is live.
pub fn backup_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!("{}{}", name, BACKUP_SUFFIX))
}

/// Write `bytes` to a temp file beside `path` and rename it over `path`.
fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut temp = tempfile::Builder::new().prefix(TEMP_PREFIX).tempfile_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;

    // Keep the target's permissions (e.g. executable scripts)
    if let Ok(metadata) = std::fs::metadata(path) {
        std::fs::set_permissions(temp.path(), metadata.permissions())?;
    }

    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Repair files left mutated by a crashed run.
///
/// Every `*.killrate.orig` backup under `root` is written back over its file
/// and removed; stray swap temp files are deleted. Returns the restored paths.
pub fn recover_backups(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut restored = Vec::new();

    for entry in walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !matches!(name.as_ref(), ".git" | "target" | "node_modules")
        })
    {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();

        if name.starts_with(TEMP_PREFIX) {
            tracing::warn!("Removing stray swap file {}", path.display());
            std::fs::remove_file(path)?;
            continue;
        }

        let Some(target_name) = name.strip_suffix(BACKUP_SUFFIX) else {
            continue;
        };
        let target = path.with_file_name(target_name);
        let original = std::fs::read(path)?;
        atomic_write(&target, &original)?;

        let written = std::fs::read(&target)?;
        if content_hash(&written) != content_hash(&original) {
            anyhow::bail!(
                "CRITICAL: recovery of {} from {} could not be confirmed",
                target.display(),
                path.display()
            );
        }
        std::fs::remove_file(path)?;

        tracing::warn!(
            "Restored {} from leftover backup of a previous run",
            target.display()
        );
        restored.push(target);
    }

    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::MutationKind;
    use std::time::Duration;

    const SOURCE: &str = "def clamp(x, low, high):\n    if x < low:\n        return low\n    return x\n";

    fn boundary_mutation(path: &Path) -> Mutation {
        let start = SOURCE.find(" < ").unwrap() + 1;
        Mutation {
            source_file: path.to_path_buf(),
            line_number: 2,
            column: 10,
            kind: MutationKind::BoundaryShift,
            rule: "lt_to_le".to_string(),
            byte_start: start,
            byte_end: start + 1,
            original_text: "<".to_string(),
            mutated_text: "<=".to_string(),
        }
    }

    fn fixture() -> (tempfile::TempDir, PathBuf) {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("clamp.py");
        std::fs::write(&path, SOURCE).unwrap();
        (temp_dir, path)
    }

    // =========================================================================
    // splice
    // =========================================================================

    #[test]
    fn test_splice_replaces_only_span() {
        let m = boundary_mutation(Path::new("clamp.py"));
        let out = splice(SOURCE.as_bytes(), &m).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("if x <= low:"));
        assert_eq!(out.len(), SOURCE.len() + 1);
    }

    #[test]
    fn test_splice_span_mismatch() {
        let mut m = boundary_mutation(Path::new("clamp.py"));
        m.original_text = ">".to_string();
        let result = splice(SOURCE.as_bytes(), &m);
        assert!(matches!(result, Err(ApplyError::SpanMismatch { .. })));
    }

    #[test]
    fn test_splice_out_of_bounds() {
        let mut m = boundary_mutation(Path::new("clamp.py"));
        m.byte_start = 10_000;
        m.byte_end = 10_001;
        assert!(splice(SOURCE.as_bytes(), &m).is_err());
    }

    #[test]
    fn test_backup_path() {
        assert_eq!(
            backup_path(Path::new("/a/b/lib.rs")),
            PathBuf::from("/a/b/lib.rs.killrate.orig")
        );
    }

    // =========================================================================
    // apply / restore
    // =========================================================================

    #[tokio::test]
    async fn test_apply_then_restore_is_byte_identical() {
        let (_dir, path) = fixture();
        let before = content_hash(&std::fs::read(&path).unwrap());
        let applier = MutationApplier::new();

        let applied = applier.apply(&boundary_mutation(&path)).await.unwrap();
        let live = std::fs::read_to_string(&path).unwrap();
        assert!(live.contains("x <= low"));
        assert!(backup_path(&path).exists());

        applied.restore().unwrap();
        let after = content_hash(&std::fs::read(&path).unwrap());
        assert_eq!(before, after);
        assert!(!backup_path(&path).exists());
    }

    #[tokio::test]
    async fn test_crlf_preserved() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("win.py");
        let crlf = SOURCE.replace('\n', "\r\n");
        std::fs::write(&path, &crlf).unwrap();

        let start = crlf.find(" < ").unwrap() + 1;
        let mut m = boundary_mutation(&path);
        m.byte_start = start;
        m.byte_end = start + 1;

        let applier = MutationApplier::new();
        applier.apply(&m).await.unwrap().restore().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), crlf.as_bytes());
    }

    #[tokio::test]
    async fn test_drop_without_restore_restores() {
        let (_dir, path) = fixture();
        let applier = MutationApplier::new();

        {
            let _applied = applier.apply(&boundary_mutation(&path)).await.unwrap();
            assert_ne!(std::fs::read_to_string(&path).unwrap(), SOURCE);
        }

        assert_eq!(std::fs::read_to_string(&path).unwrap(), SOURCE);
        assert!(!backup_path(&path).exists());
    }

    #[tokio::test]
    async fn test_panicking_trial_still_restores() {
        let (_dir, path) = fixture();
        let applier = Arc::new(MutationApplier::new());
        let mutation = boundary_mutation(&path);

        let task_applier = applier.clone();
        let handle = tokio::spawn(async move {
            let _applied = task_applier.apply(&mutation).await.unwrap();
            panic!("runner blew up");
        });
        assert!(handle.await.is_err());

        assert_eq!(std::fs::read_to_string(&path).unwrap(), SOURCE);
    }

    #[tokio::test]
    async fn test_span_mismatch_leaves_file_untouched() {
        let (_dir, path) = fixture();
        let mut m = boundary_mutation(&path);
        m.original_text = "?".to_string();

        let applier = MutationApplier::new();
        assert!(applier.apply(&m).await.is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), SOURCE);
        assert!(!backup_path(&path).exists());
    }

    #[tokio::test]
    async fn test_stale_backup_refused() {
        let (_dir, path) = fixture();
        std::fs::write(backup_path(&path), SOURCE).unwrap();

        let applier = MutationApplier::new();
        let err = applier.apply(&boundary_mutation(&path)).await.err().unwrap();
        assert!(err.is_fatal());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), SOURCE);
    }

    #[tokio::test]
    async fn test_same_file_is_exclusive() {
        let (_dir, path) = fixture();
        let applier = MutationApplier::new();
        let m = boundary_mutation(&path);

        let first = applier.apply(&m).await.unwrap();
        // A second trial on the same file must wait for the first to restore
        let blocked = tokio::time::timeout(Duration::from_millis(100), applier.apply(&m)).await;
        assert!(blocked.is_err());

        first.restore().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), applier.apply(&m))
            .await
            .unwrap()
            .unwrap();
        second.restore().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), SOURCE);
    }

    // =========================================================================
    // Crash recovery
    // =========================================================================

    #[test]
    fn test_recover_backups_restores_and_cleans() {
        let (dir, path) = fixture();
        // Simulate a crash mid-trial: mutant on disk, backup beside it
        std::fs::write(backup_path(&path), SOURCE).unwrap();
        std::fs::write(&path, SOURCE.replace(" < ", " <= ")).unwrap();
        std::fs::write(dir.path().join(".killrate-swap-abc"), "junk").unwrap();

        let restored = recover_backups(dir.path()).unwrap();
        assert_eq!(restored, vec![path.clone()]);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), SOURCE);
        assert!(!backup_path(&path).exists());
        assert!(!dir.path().join(".killrate-swap-abc").exists());
    }

    #[test]
    fn test_recover_backups_clean_tree() {
        let (dir, _path) = fixture();
        assert!(recover_backups(dir.path()).unwrap().is_empty());
    }
}
