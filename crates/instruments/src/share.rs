//! Result pickup from the instrument's network share.
//!
//! The HPLC data system writes each run's export somewhere under a shared
//! folder. A listing taken before the run is compared with later listings;
//! whatever appeared in between belongs to this run.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::InstrumentError;

#[derive(Debug, Clone)]
pub struct ShareWatcher {
    root: PathBuf,
    pattern: String,
    seen: BTreeSet<PathBuf>,
}

impl ShareWatcher {
    /// Snapshot the share. `pattern` is matched case-insensitively against
    /// directory names and `.csv` file names.
    pub fn snapshot(root: impl Into<PathBuf>, pattern: &str) -> Self {
        let root = root.into();
        let pattern = pattern.to_lowercase();
        let seen = list_matching(&root, &pattern);
        tracing::debug!(root = %root.display(), entries = seen.len(), "share snapshot");
        Self {
            root,
            pattern,
            seen,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Entries (relative to the root) that appeared since the last call,
    /// oldest listing order first. CSV files are listed before directories.
    pub fn poll_new(&mut self) -> Vec<PathBuf> {
        let current = list_matching(&self.root, &self.pattern);
        let mut fresh: Vec<PathBuf> = current.difference(&self.seen).cloned().collect();
        fresh.sort_by_key(|p| !is_csv(p));
        self.seen = current;
        fresh
    }

    /// Copy `entry` from the share into `local_dir`, keeping its file name.
    pub fn fetch(&self, entry: &Path, local_dir: &Path) -> Result<PathBuf, InstrumentError> {
        fs::create_dir_all(local_dir).map_err(|e| InstrumentError::io(local_dir, e))?;
        let source = self.root.join(entry);
        let name = entry.file_name().ok_or_else(|| {
            InstrumentError::io(
                &source,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "entry has no file name"),
            )
        })?;
        let target = local_dir.join(name);
        fs::copy(&source, &target).map_err(|e| InstrumentError::io(&source, e))?;
        tracing::info!(from = %source.display(), to = %target.display(), "result fetched from share");
        Ok(target)
    }
}

fn is_csv(path: &Path) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case("csv"))
        .unwrap_or(false)
}

/// A share that cannot be read yields an empty listing; the run keeps
/// polling and picks up entries once the share is reachable again.
fn list_matching(root: &Path, pattern: &str) -> BTreeSet<PathBuf> {
    WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy().to_lowercase();
            if !name.contains(pattern) {
                return false;
            }
            let file_type = entry.file_type();
            file_type.is_dir() || (file_type.is_file() && name.ends_with(".csv"))
        })
        .filter_map(|entry| entry.path().strip_prefix(root).ok().map(Path::to_path_buf))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_csv_is_detected_once() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("old.csv"), "1,2").unwrap();
        let mut watcher = ShareWatcher::snapshot(tmp.path(), ".csv");
        assert!(watcher.poll_new().is_empty());

        fs::create_dir(tmp.path().join("batch7")).unwrap();
        fs::write(tmp.path().join("batch7").join("Run7.CSV"), "3,4").unwrap();
        fs::write(tmp.path().join("notes.txt"), "x").unwrap();

        let fresh = watcher.poll_new();
        assert_eq!(fresh, vec![PathBuf::from("batch7").join("Run7.CSV")]);
        assert!(watcher.poll_new().is_empty());

        let local = tmp.path().join("local");
        let copied = watcher.fetch(&fresh[0], &local).unwrap();
        assert_eq!(copied, local.join("Run7.CSV"));
        assert_eq!(fs::read_to_string(copied).unwrap(), "3,4");
    }

    #[test]
    fn missing_share_lists_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut watcher = ShareWatcher::snapshot(tmp.path().join("offline"), ".csv");
        assert!(watcher.poll_new().is_empty());
    }
}
