//! Sequence catalog: which instrument sequence file a sequence number runs,
//! and where that sequence writes its data.
//!
//! The list file holds `index: name` lines (ASCII or full-width colon). The
//! optional parameter table is a CSV of
//! `index,sequence_file,data_name,data_path`.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use lims_protocol::SequenceEntry;

use crate::error::StorageError;

/// One row of the parameter table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceParams {
    pub index: u32,
    pub sequence_file: String,
    pub data_name: String,
    pub data_path: PathBuf,
}

impl SequenceParams {
    /// `<data_path>/<data_name>.D`
    pub fn data_folder(&self) -> PathBuf {
        self.data_path.join(folder_name(&self.data_name))
    }
}

fn folder_name(data_name: &str) -> String {
    if data_name.to_ascii_lowercase().ends_with(".d") {
        data_name.to_string()
    } else {
        format!("{}.D", data_name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SequenceCatalog {
    names: BTreeMap<u32, String>,
    params: BTreeMap<u32, SequenceParams>,
}

fn parse_entry(line: &str) -> Option<(u32, String)> {
    let line = line.trim();
    let (idx, name) = line.split_once('：').or_else(|| line.split_once(':'))?;
    let idx = idx.trim();
    if idx.is_empty() || !idx.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((idx.parse().ok()?, name.trim().to_string()))
}

fn parse_params_row(line: &str) -> Option<SequenceParams> {
    let cols: Vec<&str> = line.split(',').map(str::trim).collect();
    if cols.len() < 4 {
        return None;
    }
    let index = cols[0].parse().ok()?;
    Some(SequenceParams {
        index,
        sequence_file: cols[1].to_string(),
        data_name: cols[2].to_string(),
        data_path: PathBuf::from(cols[3]),
    })
}

fn read_optional(path: &Path) -> Result<Option<String>, StorageError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

impl SequenceCatalog {
    pub fn parse(list: &str) -> Self {
        let names = list.lines().filter_map(parse_entry).collect();
        SequenceCatalog {
            names,
            params: BTreeMap::new(),
        }
    }

    /// Add the parameter table. Rows whose index is not a number (the
    /// header) are skipped.
    pub fn with_params(mut self, csv: &str) -> Self {
        for row in csv.lines().filter_map(parse_params_row) {
            self.params.insert(row.index, row);
        }
        self
    }

    /// Load from disk. A missing file yields an empty catalog.
    pub fn load(list_path: &Path, params_path: Option<&Path>) -> Result<Self, StorageError> {
        let list = read_optional(list_path)?;
        if list.is_none() {
            tracing::warn!(path = %list_path.display(), "sequence list not found");
        }
        let mut catalog = SequenceCatalog::parse(list.as_deref().unwrap_or_default());
        if let Some(path) = params_path {
            if let Some(csv) = read_optional(path)? {
                catalog = catalog.with_params(&csv);
            }
        }
        Ok(catalog)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.params.is_empty()
    }

    /// Catalog entries in index order.
    pub fn entries(&self) -> Vec<SequenceEntry> {
        self.names
            .iter()
            .map(|(index, name)| SequenceEntry {
                index: *index,
                name: name.clone(),
            })
            .collect()
    }

    /// The sequence file to start for `index`: the list entry, else the
    /// parameter table's `sequence_file`.
    pub fn sequence_file(&self, index: u32) -> Option<&str> {
        self.names
            .get(&index)
            .map(String::as_str)
            .or_else(|| self.params.get(&index).map(|p| p.sequence_file.as_str()))
            .filter(|s| !s.is_empty())
    }

    pub fn params(&self, index: u32) -> Option<&SequenceParams> {
        self.params.get(&index)
    }

    /// Where the instrument writes the result CSV for `index`.
    pub fn result_csv(&self, index: u32, file_name: &str) -> Option<PathBuf> {
        self.params
            .get(&index)
            .map(|p| p.data_folder().join(file_name))
    }

    /// Compatibility lookup for runs archived before data folders were
    /// recorded: the exact `.D` folder from the parameter table, else the
    /// newest `.D` folder under `data_path` whose name starts with
    /// `data_name`.
    pub fn locate_data_folder(&self, index: u32) -> Result<PathBuf, StorageError> {
        let params = self
            .params
            .get(&index)
            .ok_or(StorageError::UnknownSequence(index))?;
        let exact = params.data_folder();
        if exact.is_dir() {
            return Ok(exact);
        }

        let prefix = params.data_name.to_lowercase();
        let entries = fs::read_dir(&params.data_path)
            .map_err(|e| StorageError::io(&params.data_path, e))?;
        let newest = entries
            .filter_map(Result::ok)
            .filter(|entry| {
                let name = entry.file_name().to_string_lossy().to_lowercase();
                name.starts_with(&prefix) && name.ends_with(".d")
            })
            .map(|entry| {
                let modified = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                (modified, entry.path())
            })
            .max_by_key(|(modified, _)| *modified);

        match newest {
            Some((_, path)) => {
                tracing::debug!(sequence = index, folder = %path.display(), "data folder by prefix match");
                Ok(path)
            }
            None => Err(StorageError::Io {
                path: exact,
                source: std::io::Error::new(ErrorKind::NotFound, "no matching .D folder"),
            }),
        }
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
