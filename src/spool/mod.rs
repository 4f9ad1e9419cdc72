//! File-backed spool: the four fixed per-study subdirectories
//! (`DCM/`, `Structure/`, `Addition/`, `DebugDicom/`) that every received
//! instance lands in before the pipeline picks it up.
//!
//! Grounded on `empath-spool`'s `FileBackingStore`: path-traversal validation
//! before any path is used, write-to-temp-then-rename for every file
//! mutation, and a two-phase (rename, then remove) delete so a crash mid-
//! cleanup never leaves a half-deleted study lying around.

use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::DirectoriesConfig;
use crate::error::{Error, Result};

/// The well-known subdirectories inside a study directory.
pub const SUBDIR_DCM: &str = "DCM";
pub const SUBDIR_STRUCTURE: &str = "Structure";
pub const SUBDIR_ADDITION: &str = "Addition";
pub const SUBDIR_DEBUG: &str = "DebugDicom";

const ALL_SUBDIRS: [&str; 4] = [SUBDIR_DCM, SUBDIR_STRUCTURE, SUBDIR_ADDITION, SUBDIR_DEBUG];

/// Prefix every per-study spool directory carries, per spec.md §3's
/// `<working>/UID_<StudyKey>/` layout.
const UID_PREFIX: &str = "UID_";

fn study_dir_name(key: &str) -> String {
    format!("{UID_PREFIX}{key}")
}

/// Strips the `UID_` prefix from a spool directory name, returning the raw
/// study key it encodes. `None` for anything that isn't a study directory
/// (the quarantine subtree, dotfiles, stray entries).
fn study_key_from_dir_name(name: &str) -> Option<String> {
    name.strip_prefix(UID_PREFIX).map(|s| s.to_string())
}

/// Validates a study identifier before it is ever joined onto a filesystem
/// path. Rejects empty strings, `.`/`..` components, path separators, NUL
/// bytes, and leading dots — the same boundary `empath-spool` enforces on
/// its own filenames, adapted to study keys instead of ULIDs.
pub fn safe_key(raw: &str) -> Result<String> {
    if raw.is_empty() {
        return Err(Error::MalformedIdentifier {
            reason: "study key is empty".to_string(),
        });
    }
    if raw.contains('\0') {
        return Err(Error::MalformedIdentifier {
            reason: "study key contains a NUL byte".to_string(),
        });
    }
    if raw.starts_with('.') {
        return Err(Error::MalformedIdentifier {
            reason: "study key may not start with '.'".to_string(),
        });
    }
    let candidate = Path::new(raw);
    for component in candidate.components() {
        match component {
            Component::Normal(_) => {}
            other => {
                return Err(Error::MalformedIdentifier {
                    reason: format!("study key contains illegal path component {other:?}"),
                })
            }
        }
    }
    if candidate.components().count() != 1 {
        return Err(Error::MalformedIdentifier {
            reason: "study key must be a single path component".to_string(),
        });
    }
    Ok(raw.to_string())
}

#[derive(Debug, Clone)]
pub struct Spool {
    working: PathBuf,
    quarantine_subdir: String,
}

impl Spool {
    pub fn new(cfg: DirectoriesConfig) -> Self {
        Spool {
            working: cfg.working,
            quarantine_subdir: cfg.quarantine_subdir,
        }
    }

    /// Creates the working directory and the quarantine directory, and
    /// sweeps any orphaned `.tmp-*` files left by a crash mid-write.
    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(&self.working).map_err(|e| Error::io(&self.working, e))?;
        std::fs::create_dir_all(self.quarantine_root())
            .map_err(|e| Error::io(self.quarantine_root(), e))?;
        self.cleanup_orphaned_temp_files()?;
        Ok(())
    }

    fn cleanup_orphaned_temp_files(&self) -> Result<()> {
        let mut cleaned = 0usize;
        for entry in std::fs::read_dir(&self.working).map_err(|e| Error::io(&self.working, e))? {
            let entry = entry.map_err(|e| Error::io(&self.working, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            for subdir in ALL_SUBDIRS {
                let dir = entry.path().join(subdir);
                if !dir.is_dir() {
                    continue;
                }
                for file in std::fs::read_dir(&dir).map_err(|e| Error::io(&dir, e))? {
                    let file = file.map_err(|e| Error::io(&dir, e))?;
                    let name = file.file_name();
                    let name = name.to_string_lossy();
                    if name.starts_with(".tmp-") {
                        std::fs::remove_file(file.path()).map_err(|e| Error::io(file.path(), e))?;
                        cleaned += 1;
                    }
                }
            }
        }
        if cleaned > 0 {
            info!(cleaned, "swept orphaned temp files from spool on startup");
        }
        Ok(())
    }

    fn quarantine_root(&self) -> PathBuf {
        self.working.join(&self.quarantine_subdir)
    }

    /// Absolute path to a study's root directory: `<working>/UID_<key>/`.
    pub fn path_for(&self, study_key: &str) -> Result<PathBuf> {
        let key = safe_key(study_key)?;
        Ok(self.working.join(study_dir_name(&key)))
    }

    /// Absolute path to a subdirectory within a study.
    pub fn subdir_path(&self, study_key: &str, subdir: &str) -> Result<PathBuf> {
        Ok(self.path_for(study_key)?.join(subdir))
    }

    /// Ensures the study directory and its four subdirectories exist.
    pub fn create(&self, study_key: &str) -> Result<PathBuf> {
        let root = self.path_for(study_key)?;
        for subdir in ALL_SUBDIRS {
            let dir = root.join(subdir);
            std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        }
        Ok(root)
    }

    /// Writes `data` to `dest` atomically: write to a sibling `.tmp-<name>`
    /// file, then rename over the destination.
    pub fn write_atomic(&self, dest: &Path, data: &[u8]) -> Result<()> {
        let parent = dest.parent().ok_or_else(|| Error::internal("destination has no parent"))?;
        let tmp_name = format!(
            ".tmp-{}",
            dest.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("write")
        );
        let tmp_path = parent.join(tmp_name);
        std::fs::write(&tmp_path, data).map_err(|e| Error::io(&tmp_path, e))?;
        std::fs::rename(&tmp_path, dest).map_err(|e| Error::io(dest, e))?;
        Ok(())
    }

    /// Moves a study directory into quarantine, under
    /// `<quarantine_subdir>/UID_<key>_<timestamp>/`, and writes a sibling
    /// `reason.txt` file alongside it recording why, per spec.md §4.A.
    pub fn quarantine(&self, study_key: &str, reason: &str, now_suffix: &str) -> Result<PathBuf> {
        let key = safe_key(study_key)?;
        let src = self.working.join(study_dir_name(&key));
        if !src.exists() {
            return Err(Error::IncompleteStudy {
                study: key,
                reason: "study directory does not exist".to_string(),
            });
        }
        let dest_name = format!("{}{key}_{now_suffix}", UID_PREFIX);
        let dest = self.quarantine_root().join(&dest_name);
        std::fs::rename(&src, &dest).map_err(|e| Error::io(&dest, e))?;

        let reason_path = self.quarantine_root().join(format!("{dest_name}.reason.txt"));
        std::fs::write(&reason_path, reason).map_err(|e| Error::io(&reason_path, e))?;

        warn!(study = %key, reason, dest = %dest.display(), "study quarantined");
        Ok(dest)
    }

    /// Removes a study directory entirely after a successful send. Two
    /// phase: rename to a `.deleted-` sibling first, then remove, so a crash
    /// mid-cleanup leaves an unambiguous orphan rather than a half-deleted
    /// study directory still visible under its original key.
    pub fn cleanup(&self, study_key: &str) -> Result<()> {
        let key = safe_key(study_key)?;
        let src = self.working.join(study_dir_name(&key));
        if !src.exists() {
            debug!(study = %key, "cleanup called on already-absent study directory");
            return Ok(());
        }
        let marked = self.working.join(format!(".deleted-{key}"));
        std::fs::rename(&src, &marked).map_err(|e| Error::io(&marked, e))?;
        std::fs::remove_dir_all(&marked).map_err(|e| Error::io(&marked, e))?;
        info!(study = %key, "study directory cleaned up");
        Ok(())
    }

    /// Sweeps `.deleted-*` directories left behind by a crash between the
    /// rename and the remove in `cleanup`.
    pub fn sweep_deleted_markers(&self) -> Result<()> {
        for entry in std::fs::read_dir(&self.working).map_err(|e| Error::io(&self.working, e))? {
            let entry = entry.map_err(|e| Error::io(&self.working, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(".deleted-") {
                std::fs::remove_dir_all(entry.path()).map_err(|e| Error::io(entry.path(), e))?;
            }
        }
        Ok(())
    }

    /// Enumerates study keys currently present in the working directory,
    /// excluding the quarantine directory and any in-flight delete markers
    /// — used on startup to recover studies that were mid-pipeline when the
    /// process last exited.
    pub fn list_studies(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.working).map_err(|e| Error::io(&self.working, e))? {
            let entry = entry.map_err(|e| Error::io(&self.working, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if let Some(key) = study_key_from_dir_name(&name) {
                out.push(key);
            }
        }
        out.sort();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(dir: &Path) -> DirectoriesConfig {
        DirectoriesConfig {
            working: dir.to_path_buf(),
            logs: dir.join("logs"),
            quarantine_subdir: "quarantine".to_string(),
        }
    }

    #[test]
    fn rejects_path_traversal_keys() {
        assert!(safe_key("../etc/passwd").is_err());
        assert!(safe_key("a/b").is_err());
        assert!(safe_key(".hidden").is_err());
        assert!(safe_key("").is_err());
        assert!(safe_key("1.2.3.4.5").is_ok());
    }

    #[test]
    fn create_then_cleanup_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let spool = Spool::new(cfg(tmp.path()));
        spool.init().unwrap();
        let root = spool.create("1.2.3").unwrap();
        assert!(root.join(SUBDIR_DCM).is_dir());
        assert!(root.join(SUBDIR_STRUCTURE).is_dir());
        spool.cleanup("1.2.3").unwrap();
        assert!(!root.exists());
        // idempotent
        spool.cleanup("1.2.3").unwrap();
    }

    #[test]
    fn quarantine_moves_study_out_of_working_set() {
        let tmp = tempfile::tempdir().unwrap();
        let spool = Spool::new(cfg(tmp.path()));
        spool.init().unwrap();
        spool.create("1.2.3").unwrap();
        let dest = spool.quarantine("1.2.3", "roi-empty", "20260101T000000").unwrap();
        assert!(dest.exists());
        assert!(dest.file_name().unwrap().to_string_lossy().starts_with("UID_1.2.3_"));
        assert!(!spool.path_for("1.2.3").unwrap().exists());

        let reason_path = dest.with_file_name(format!(
            "{}.reason.txt",
            dest.file_name().unwrap().to_string_lossy()
        ));
        assert_eq!(std::fs::read_to_string(&reason_path).unwrap(), "roi-empty");
    }

    #[test]
    fn write_atomic_never_leaves_a_temp_file_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let spool = Spool::new(cfg(tmp.path()));
        spool.init().unwrap();
        let root = spool.create("1.2.3").unwrap();
        let dest = root.join(SUBDIR_DCM).join("a.dcm");
        spool.write_atomic(&dest, b"hello").unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello");
        let leftovers: Vec<_> = std::fs::read_dir(root.join(SUBDIR_DCM))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
