//! Answers to result queries: the archived chromatogram, peaks found in
//! the run's data folder, and the mass spectrum nearest a retention time.
//!
//! Every answer is a complete event. A missing or unreadable result is
//! reported with `available: false` and a message, never as a transport
//! failure.

use std::path::PathBuf;
use std::sync::Arc;

use lims_instruments::{InstrumentError, MzmlCache, PeakFinder};
use lims_protocol::{local_timestamp, Series, WorkerEvent};
use lims_storage::{ResultArchive, SequenceCatalog, StorageError};
use tracing::{debug, warn};

use crate::error::StationError;

const MISSING_ARCHIVE_ID: &str = "任务未完成或未归档，无法查看结果（缺少归档ID）";
const ARCHIVE_GONE: &str = "归档结果不存在或已被清理";

pub struct ResultQueries {
    archive: ResultArchive,
    catalog: SequenceCatalog,
    peaks: Option<Arc<dyn PeakFinder>>,
    spectra: Option<MzmlCache>,
    /// `(threshold, target)` for thinning long series.
    thinning: Option<(usize, usize)>,
}

impl ResultQueries {
    pub fn new(archive: ResultArchive, catalog: SequenceCatalog) -> Self {
        Self {
            archive,
            catalog,
            peaks: None,
            spectra: None,
            thinning: None,
        }
    }

    pub fn with_peak_finder(mut self, finder: Arc<dyn PeakFinder>) -> Self {
        self.peaks = Some(finder);
        self
    }

    pub fn with_spectra(mut self, cache: MzmlCache) -> Self {
        self.spectra = Some(cache);
        self
    }

    pub fn with_thinning(mut self, threshold: usize, target: usize) -> Self {
        self.thinning = Some((threshold, target));
        self
    }

    /// The archived result series. Results are only served from the
    /// archive, so a request without an archive id is unanswerable.
    pub fn analysis_result(
        &self,
        bottle: Option<u32>,
        sequence: Option<u32>,
        archive_id: Option<&str>,
    ) -> WorkerEvent {
        let outcome = match archive_id {
            None => Err(StationError::Unavailable(MISSING_ARCHIVE_ID.into())),
            Some(id) => self.read_series(id),
        };
        let (series, message) = match outcome {
            Ok(series) => (Some(series), None),
            Err(e) => {
                warn!(?archive_id, error = %e, "result unavailable");
                (None, Some(e.to_string()))
            }
        };
        WorkerEvent::AnalysisResult {
            bottle_num: bottle,
            sequence_index: sequence,
            archive_id: archive_id.map(str::to_string),
            available: series.is_some(),
            series,
            message,
            timestamp: local_timestamp(),
        }
    }

    fn read_series(&self, archive_id: &str) -> Result<Series, StationError> {
        let series = self.archive.read_series(archive_id).map_err(|e| match e {
            StorageError::ArchiveNotFound { .. } => StationError::Unavailable(ARCHIVE_GONE.into()),
            other => StationError::Archive(other),
        })?;
        Ok(match self.thinning {
            Some((threshold, target)) => series.decimated(threshold, target),
            None => series,
        })
    }

    /// The `.D` folder a result came from. Archives record it; archives
    /// written before that (no metadata at all) and requests without an
    /// archive fall back to the sequence catalog.
    pub fn data_folder(&self, sequence: u32, archive_id: Option<&str>) -> Result<PathBuf, StationError> {
        if let Some(id) = archive_id {
            let archived = self.archive.get(id).map_err(|e| match e {
                StorageError::ArchiveNotFound { .. } => StationError::Unavailable(ARCHIVE_GONE.into()),
                other => StationError::Archive(other),
            })?;
            if let Some(folder) = archived.data_folder() {
                return Ok(folder);
            }
            if archived.meta.sha256.is_some() {
                return Err(StationError::Unavailable(format!("归档 {id} 未记录数据目录")));
            }
            debug!(archive_id = id, sequence, "legacy archive, locating data folder from catalog");
        }
        Ok(self.catalog.locate_data_folder(sequence)?)
    }

    pub fn peaks(&self, sequence: u32, relative_percent: f64, archive_id: Option<&str>) -> WorkerEvent {
        let folder = self.data_folder(sequence, archive_id);
        let data_folder = folder.as_ref().ok().map(|p| p.to_string_lossy().into_owned());
        let outcome = folder.and_then(|folder| {
            let finder = self
                .peaks
                .as_ref()
                .ok_or_else(|| StationError::Unavailable("未配置Qual服务".into()))?;
            finder
                .find_peaks(&folder.to_string_lossy(), relative_percent)
                .map_err(|e| match e {
                    InstrumentError::Api { code, .. } => {
                        StationError::Unavailable(format!("Qual服务错误: {code}"))
                    }
                    other => StationError::Unavailable(format!("获取峰失败: {other}")),
                })
        });
        let (available, peaks, message) = match outcome {
            Ok(peaks) => (true, peaks, None),
            Err(e) => {
                warn!(sequence, error = %e, "peaks unavailable");
                (false, Vec::new(), Some(e.to_string()))
            }
        };
        WorkerEvent::PeaksResult {
            sequence_index: sequence,
            archive_id: archive_id.map(str::to_string),
            relative_area_percent: relative_percent,
            available,
            data_folder,
            peaks,
            message,
            timestamp: local_timestamp(),
        }
    }

    pub fn mass_spectrum(&self, sequence: u32, retention_time: f64, archive_id: Option<&str>) -> WorkerEvent {
        let outcome = self.data_folder(sequence, archive_id).and_then(|folder| {
            let cache = self
                .spectra
                .as_ref()
                .ok_or_else(|| StationError::Unavailable("未配置质谱转换器".into()))?;
            let index = cache.index_for(&folder, archive_id)?;
            index.lookup(retention_time).ok_or_else(|| {
                StationError::Unavailable(format!(
                    "在保留时间 {retention_time:.2} 附近未找到质谱数据（已尝试单位换算、扩大容差与就近匹配）"
                ))
            })
        });
        let (found, message) = match outcome {
            Ok(found) => (Some(found), None),
            Err(e) => {
                warn!(sequence, retention_time, error = %e, "mass spectrum unavailable");
                (None, Some(e.to_string()))
            }
        };
        WorkerEvent::MassSpectrumResult {
            sequence_index: sequence,
            requested_rt: retention_time,
            retention_time: found.as_ref().map(|m| m.retention_time),
            archive_id: archive_id.map(str::to_string),
            available: found.is_some(),
            series: found.map(|m| m.series),
            message,
            timestamp: local_timestamp(),
        }
    }
}
