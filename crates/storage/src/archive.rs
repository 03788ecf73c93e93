//! Append-only store of finished instrument results.
//!
//! Each archive is a copy of the instrument's result CSV, `{id}.csv`, plus a
//! `{id}.meta.json` with the source data folder and the SHA-256 of the copy.
//! Ids are `{YYYYMMDD_HHMMSS}_{label}`; a clash within the same second gets a
//! numeric suffix, so an id is never reused and a file is never overwritten.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use lims_protocol::{archive_stamp, Series};
use sha2::{Digest, Sha256};

use crate::error::StorageError;
use crate::record::ArchiveMeta;

const MAX_SUFFIX: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedResult {
    pub archive_id: String,
    pub data_path: PathBuf,
    pub meta: ArchiveMeta,
}

impl ArchivedResult {
    pub fn data_folder(&self) -> Option<PathBuf> {
        self.meta.data_folder.as_ref().map(PathBuf::from)
    }
}

#[derive(Debug, Clone)]
pub struct ResultArchive {
    dir: PathBuf,
}

impl ResultArchive {
    /// Open (creating if needed) an archive rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn data_path(&self, archive_id: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", archive_id))
    }

    fn meta_path(&self, archive_id: &str) -> PathBuf {
        self.dir.join(format!("{}.meta.json", archive_id))
    }

    /// Copy `source` into the archive under a fresh id built from `label`
    /// (e.g. `seq3`, `b2`).
    pub fn archive(
        &self,
        source: &Path,
        label: &str,
        data_folder: Option<&Path>,
    ) -> Result<ArchivedResult, StorageError> {
        validate_id(label)?;
        let bytes = fs::read(source).map_err(|e| StorageError::io(source, e))?;
        let base = format!("{}_{}", archive_stamp(), label);

        let (archive_id, mut file) = self.create_unique(&base)?;
        let data_path = self.data_path(&archive_id);
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| StorageError::io(&data_path, e))?;

        let meta = ArchiveMeta {
            data_folder: data_folder.map(|p| p.to_string_lossy().into_owned()),
            source: Some(source.to_string_lossy().into_owned()),
            sha256: Some(hex::encode(Sha256::digest(&bytes))),
        };
        let meta_path = self.meta_path(&archive_id);
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| StorageError::Parse(e.to_string()))?;
        fs::write(&meta_path, json).map_err(|e| StorageError::io(&meta_path, e))?;

        tracing::info!(
            archive_id = %archive_id,
            source = %source.display(),
            bytes = bytes.len(),
            "result archived"
        );
        Ok(ArchivedResult {
            archive_id,
            data_path,
            meta,
        })
    }

    fn create_unique(&self, base: &str) -> Result<(String, fs::File), StorageError> {
        for n in 1..=MAX_SUFFIX {
            let id = if n == 1 {
                base.to_string()
            } else {
                format!("{}_{}", base, n)
            };
            let path = self.data_path(&id);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((id, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(StorageError::io(&path, e)),
            }
        }
        Err(StorageError::Backend(format!(
            "no free archive id for {} after {} attempts",
            base, MAX_SUFFIX
        )))
    }

    /// Look up an archive. A missing meta file is tolerated (archives written
    /// before metadata existed); a missing data file is not.
    pub fn get(&self, archive_id: &str) -> Result<ArchivedResult, StorageError> {
        validate_id(archive_id)?;
        let data_path = self.data_path(archive_id);
        if !data_path.is_file() {
            return Err(StorageError::ArchiveNotFound {
                archive_id: archive_id.to_string(),
            });
        }
        let meta_path = self.meta_path(archive_id);
        let meta = match fs::read(&meta_path) {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| {
                StorageError::Parse(format!("{}: {}", meta_path.display(), e))
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => ArchiveMeta::default(),
            Err(e) => return Err(StorageError::io(&meta_path, e)),
        };
        Ok(ArchivedResult {
            archive_id: archive_id.to_string(),
            data_path,
            meta,
        })
    }

    /// Read the archived bytes, refusing them if they no longer match the
    /// recorded digest.
    pub fn read_verified(&self, archive_id: &str) -> Result<Vec<u8>, StorageError> {
        let archived = self.get(archive_id)?;
        let bytes = fs::read(&archived.data_path)
            .map_err(|e| StorageError::io(&archived.data_path, e))?;
        if let Some(expected) = &archived.meta.sha256 {
            let actual = hex::encode(Sha256::digest(&bytes));
            if !actual.eq_ignore_ascii_case(expected) {
                tracing::warn!(archive_id, expected = %expected, actual = %actual, "archive digest mismatch");
                return Err(StorageError::Tampered {
                    archive_id: archive_id.to_string(),
                });
            }
        }
        Ok(bytes)
    }

    pub fn read_series(&self, archive_id: &str) -> Result<Series, StorageError> {
        let bytes = self.read_verified(archive_id)?;
        Ok(parse_series(&String::from_utf8_lossy(&bytes)))
    }
}

fn validate_id(id: &str) -> Result<(), StorageError> {
    let ok = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidArchiveId(id.to_string()))
    }
}

/// Parse `x,y` rows. Rows that do not start with two numbers (a header,
/// blank lines, trailing garbage) are skipped.
pub fn parse_series(text: &str) -> Series {
    let mut series = Series::default();
    for line in text.lines() {
        let mut cols = line.split(',').map(|c| c.trim().trim_matches('"'));
        let (Some(x), Some(y)) = (cols.next(), cols.next()) else {
            continue;
        };
        if let (Ok(x), Ok(y)) = (x.parse::<f64>(), y.parse::<f64>()) {
            series.x.push(x);
            series.y.push(y);
        }
    }
    series
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
