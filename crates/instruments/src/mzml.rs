//! Mass spectra from vendor `.D` folders.
//!
//! The folder is converted to mzML once by ProteoWizard's `msconvert` and
//! cached as `<folder>_<archive_id>.mzML`, so a conversion for one run never
//! replaces another run's file. [`SpectrumIndex`] then answers "spectrum
//! at retention time t" lookups with retention times in minutes.

use std::env;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use base64::Engine;
use flate2::read::ZlibDecoder;
use lims_protocol::Series;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::InstrumentError;

/// Spectra above this many points are thinned before being sent out.
pub const MAX_SPECTRUM_POINTS: usize = 1000;

const KNOWN_MSCONVERT_PATHS: &[&str] = &[
    r"C:\Program Files\ProteoWizard\ProteoWizard 3.0.25323.6de0b61\msconvert.exe",
    r"C:\Program Files\ProteoWizard\msconvert.exe",
    r"C:\Program Files (x86)\ProteoWizard\msconvert.exe",
];

// ──────────────────────────────────────────────
// Conversion
// ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MsConverter {
    exe: Option<PathBuf>,
    timeout: Duration,
}

impl MsConverter {
    /// Use `explicit` if given, else `MSCONVERT_EXE`, else the usual
    /// ProteoWizard install locations.
    pub fn locate(explicit: Option<PathBuf>, timeout: Duration) -> Self {
        let exe = explicit
            .or_else(|| env::var_os("MSCONVERT_EXE").map(PathBuf::from))
            .filter(|p| p.exists())
            .or_else(|| {
                KNOWN_MSCONVERT_PATHS
                    .iter()
                    .map(PathBuf::from)
                    .find(|p| p.exists())
            });
        match &exe {
            Some(path) => tracing::info!(msconvert = %path.display(), "msconvert located"),
            None => tracing::warn!("msconvert not found; set MSCONVERT_EXE"),
        }
        Self { exe, timeout }
    }

    pub fn is_available(&self) -> bool {
        self.exe.is_some()
    }

    /// Convert `input_folder` into exactly `output_file`.
    pub fn convert(&self, input_folder: &Path, output_file: &Path) -> Result<(), InstrumentError> {
        let exe = self
            .exe
            .as_ref()
            .ok_or_else(|| InstrumentError::Converter("msconvert is not installed".into()))?;
        if !input_folder.exists() {
            return Err(InstrumentError::Converter(format!(
                "data folder does not exist: {}",
                input_folder.display()
            )));
        }
        let out_dir = output_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        fs::create_dir_all(out_dir).map_err(|e| InstrumentError::io(out_dir, e))?;
        let out_name = output_file
            .file_name()
            .ok_or_else(|| InstrumentError::Converter("output file has no name".into()))?;

        tracing::info!(input = %input_folder.display(), output = %output_file.display(), "running msconvert");
        let mut child = Command::new(exe)
            .arg("--mzML")
            .arg(input_folder)
            .arg("-o")
            .arg(out_dir)
            .arg("--outfile")
            .arg(out_name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| InstrumentError::io(exe, e))?;

        let started = Instant::now();
        let status = loop {
            match child.try_wait().map_err(|e| InstrumentError::io(exe, e))? {
                Some(status) => break status,
                None if started.elapsed() >= self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(InstrumentError::Converter(format!(
                        "msconvert timed out after {}s",
                        self.timeout.as_secs()
                    )));
                }
                None => thread::sleep(Duration::from_millis(200)),
            }
        };
        if !status.success() {
            return Err(InstrumentError::Converter(format!(
                "msconvert exited with {}",
                status
            )));
        }

        // Some msconvert builds ignore --outfile and use the folder name.
        if !output_file.exists() {
            let stem = input_folder
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let fallback = out_dir.join(format!("{}.mzML", stem));
            if fallback.exists() {
                fs::rename(&fallback, output_file).map_err(|e| InstrumentError::io(&fallback, e))?;
            }
        }
        if output_file.exists() {
            Ok(())
        } else {
            Err(InstrumentError::Converter(format!(
                "msconvert produced no {}",
                output_file.display()
            )))
        }
    }
}

/// Converted-file cache keyed by data folder and archive id.
#[derive(Debug, Clone)]
pub struct MzmlCache {
    dir: PathBuf,
    converter: MsConverter,
}

impl MzmlCache {
    pub fn new(dir: impl Into<PathBuf>, converter: MsConverter) -> Self {
        Self {
            dir: dir.into(),
            converter,
        }
    }

    /// `<folder name without .D>_<archive_id>.mzML`; without an archive id
    /// a millisecond timestamp keeps the name unique.
    pub fn cache_path(&self, data_folder: &Path, archive_id: Option<&str>) -> PathBuf {
        let folder = data_folder
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let base = match folder.len().checked_sub(2) {
            Some(cut) if folder[cut..].eq_ignore_ascii_case(".d") => folder[..cut].to_string(),
            _ => folder,
        };
        let suffix = match archive_id {
            Some(id) => id.to_string(),
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or_default()
                .to_string(),
        };
        self.dir.join(format!("{}_{}.mzML", base, suffix))
    }

    /// Load the spectra of `data_folder`, converting only if this archive
    /// has not been converted before.
    pub fn index_for(
        &self,
        data_folder: &Path,
        archive_id: Option<&str>,
    ) -> Result<SpectrumIndex, InstrumentError> {
        let target = self.cache_path(data_folder, archive_id);
        if target.exists() {
            tracing::debug!(mzml = %target.display(), "reusing converted file");
        } else {
            self.converter.convert(data_folder, &target)?;
        }
        SpectrumIndex::load(&target)
    }
}

// ──────────────────────────────────────────────
// mzML parsing
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    pub id: String,
    /// Minutes.
    pub retention_time: f64,
    pub mz: Vec<f64>,
    pub intensity: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumMatch {
    pub retention_time: f64,
    pub series: Series,
}

#[derive(Debug, Default)]
struct ArrayState {
    kind: Option<ArrayKind>,
    double: bool,
    zlib: bool,
    text: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ArrayKind {
    Mz,
    Intensity,
}

#[derive(Debug, Default)]
struct SpectrumState {
    id: String,
    rt: Option<f64>,
    rt_unit: Option<RtUnit>,
    mz: Vec<f64>,
    intensity: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RtUnit {
    Minute,
    Second,
}

fn attr(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.try_get_attribute(name)
        .ok()
        .flatten()
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn decode_array(state: &ArrayState) -> Result<Vec<f64>, InstrumentError> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(state.text.trim())
        .map_err(|e| InstrumentError::Mzml(format!("bad base64: {}", e)))?;
    let bytes = if state.zlib {
        let mut out = Vec::new();
        ZlibDecoder::new(raw.as_slice())
            .read_to_end(&mut out)
            .map_err(|e| InstrumentError::Mzml(format!("bad zlib stream: {}", e)))?;
        out
    } else {
        raw
    };
    let values = if state.double {
        bytes
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect()
    } else {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
            .collect()
    };
    Ok(values)
}

#[derive(Debug, Clone, Default)]
pub struct SpectrumIndex {
    spectra: Vec<Spectrum>,
}

impl SpectrumIndex {
    pub fn load(path: &Path) -> Result<Self, InstrumentError> {
        let text = fs::read_to_string(path).map_err(|e| InstrumentError::io(path, e))?;
        let index = Self::parse(&text)?;
        tracing::info!(
            mzml = %path.display(),
            spectra = index.len(),
            max_rt = index.max_retention_time(),
            "mzML loaded"
        );
        Ok(index)
    }

    pub fn parse(xml: &str) -> Result<Self, InstrumentError> {
        let mut reader = Reader::from_str(xml);
        let mut raw: Vec<(SpectrumState, Option<f64>)> = Vec::new();
        let mut spectrum: Option<SpectrumState> = None;
        let mut array: Option<ArrayState> = None;
        let mut in_binary = false;

        loop {
            let event = reader
                .read_event()
                .map_err(|e| InstrumentError::Mzml(format!("at byte {}: {}", reader.buffer_position(), e)))?;
            match event {
                Event::Start(e) | Event::Empty(e) => match e.local_name().as_ref() {
                    b"spectrum" => {
                        spectrum = Some(SpectrumState {
                            id: attr(&e, "id").unwrap_or_default(),
                            ..SpectrumState::default()
                        });
                    }
                    b"binaryDataArray" if spectrum.is_some() => {
                        array = Some(ArrayState {
                            double: true,
                            ..ArrayState::default()
                        });
                    }
                    b"binary" if array.is_some() => in_binary = true,
                    b"cvParam" => {
                        let accession = attr(&e, "accession").unwrap_or_default();
                        if let Some(state) = array.as_mut() {
                            match accession.as_str() {
                                "MS:1000514" => state.kind = Some(ArrayKind::Mz),
                                "MS:1000515" => state.kind = Some(ArrayKind::Intensity),
                                "MS:1000523" => state.double = true,
                                "MS:1000521" => state.double = false,
                                "MS:1000574" => state.zlib = true,
                                "MS:1000576" => state.zlib = false,
                                _ => {}
                            }
                        } else if let Some(state) = spectrum.as_mut() {
                            if accession == "MS:1000016" {
                                state.rt = attr(&e, "value").and_then(|v| v.trim().parse().ok());
                                state.rt_unit = match attr(&e, "unitName").as_deref() {
                                    Some("minute") => Some(RtUnit::Minute),
                                    Some("second") => Some(RtUnit::Second),
                                    _ => None,
                                };
                            }
                        }
                    }
                    _ => {}
                },
                Event::Text(t) if in_binary => {
                    if let Some(state) = array.as_mut() {
                        state.text.push_str(&String::from_utf8_lossy(&t));
                    }
                }
                Event::End(e) => match e.local_name().as_ref() {
                    b"binary" => in_binary = false,
                    b"binaryDataArray" => {
                        if let (Some(state), Some(spec)) = (array.take(), spectrum.as_mut()) {
                            match state.kind {
                                Some(ArrayKind::Mz) => spec.mz = decode_array(&state)?,
                                Some(ArrayKind::Intensity) => {
                                    spec.intensity = decode_array(&state)?
                                }
                                None => {}
                            }
                        }
                    }
                    b"spectrum" => {
                        if let Some(done) = spectrum.take() {
                            let rt = done.rt;
                            raw.push((done, rt));
                        }
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(Self::normalise(raw))
    }

    /// Convert retention times to minutes. Explicit units win; values
    /// without a unit are taken as seconds when most of them exceed 100.
    fn normalise(raw: Vec<(SpectrumState, Option<f64>)>) -> Self {
        let unitless: Vec<f64> = raw
            .iter()
            .filter(|(s, _)| s.rt_unit.is_none())
            .filter_map(|(_, rt)| *rt)
            .collect();
        let over_100 = unitless.iter().filter(|v| **v > 100.0).count();
        let unitless_seconds = !unitless.is_empty() && over_100 * 2 > unitless.len();

        let mut spectra: Vec<Spectrum> = raw
            .into_iter()
            .filter_map(|(state, rt)| {
                let rt = rt?;
                let minutes = match state.rt_unit {
                    Some(RtUnit::Minute) => rt,
                    Some(RtUnit::Second) => rt / 60.0,
                    None if unitless_seconds => rt / 60.0,
                    None => rt,
                };
                Some(Spectrum {
                    id: state.id,
                    retention_time: minutes,
                    mz: state.mz,
                    intensity: state.intensity,
                })
            })
            .collect();
        spectra.sort_by(|a, b| a.retention_time.total_cmp(&b.retention_time));
        Self { spectra }
    }

    pub fn len(&self) -> usize {
        self.spectra.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spectra.is_empty()
    }

    pub fn max_retention_time(&self) -> f64 {
        self.spectra.last().map(|s| s.retention_time).unwrap_or(0.0)
    }

    pub fn nearest(&self, rt: f64) -> Option<&Spectrum> {
        self.spectra
            .iter()
            .min_by(|a, b| (a.retention_time - rt).abs().total_cmp(&(b.retention_time - rt).abs()))
    }

    pub fn within(&self, rt: f64, tolerance: f64) -> Option<&Spectrum> {
        self.nearest(rt)
            .filter(|s| (s.retention_time - rt).abs() <= tolerance)
    }

    /// Find the spectrum for a retention time whose unit the caller may
    /// have gotten wrong. Tries, in order: the request as minutes (or as
    /// seconds if it is more than twice the run length), the request
    /// divided by 60, a wider tolerance, and finally the nearest spectrum.
    pub fn lookup(&self, requested: f64) -> Option<SpectrumMatch> {
        let max_rt = self.max_retention_time();
        let primary = if max_rt > 0.0 && requested > max_rt * 2.0 {
            requested / 60.0
        } else {
            requested
        };
        let attempts = [
            (primary, 0.1),
            (primary, 0.3),
            (requested / 60.0, 0.1),
            (requested / 60.0, 0.3),
            (requested, 0.5),
        ];
        let hit = attempts
            .iter()
            .find_map(|(rt, tol)| self.within(*rt, *tol))
            .or_else(|| self.nearest(primary))?;
        Some(SpectrumMatch {
            retention_time: hit.retention_time,
            series: Series {
                x: hit.mz.clone(),
                y: hit.intensity.clone(),
            }
            .decimated(MAX_SPECTRUM_POINTS, MAX_SPECTRUM_POINTS),
        })
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn encode_f64(values: &[f64], zlib: bool) -> String {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let bytes = if zlib {
            let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
            enc.write_all(&bytes).unwrap();
            enc.finish().unwrap()
        } else {
            bytes
        };
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    fn spectrum_xml(id: &str, rt: f64, unit: Option<&str>, mz: &[f64], int: &[f64]) -> String {
        let unit_attr = unit
            .map(|u| format!(r#" unitName="{}""#, u))
            .unwrap_or_default();
        format!(
            r#"<spectrum id="{id}" index="0">
  <scanList count="1"><scan>
    <cvParam cvRef="MS" accession="MS:1000016" name="scan start time" value="{rt}"{unit_attr}/>
  </scan></scanList>
  <binaryDataArrayList count="2">
    <binaryDataArray>
      <cvParam cvRef="MS" accession="MS:1000523" name="64-bit float"/>
      <cvParam cvRef="MS" accession="MS:1000574" name="zlib compression"/>
      <cvParam cvRef="MS" accession="MS:1000514" name="m/z array"/>
      <binary>{mz}</binary>
    </binaryDataArray>
    <binaryDataArray>
      <cvParam cvRef="MS" accession="MS:1000523" name="64-bit float"/>
      <cvParam cvRef="MS" accession="MS:1000576" name="no compression"/>
      <cvParam cvRef="MS" accession="MS:1000515" name="intensity array"/>
      <binary>{int}</binary>
    </binaryDataArray>
  </binaryDataArrayList>
</spectrum>"#,
            mz = encode_f64(mz, true),
            int = encode_f64(int, false),
        )
    }

    fn document(spectra: &[String]) -> String {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<mzML><run><spectrumList count="{}">{}</spectrumList></run></mzML>"#,
            spectra.len(),
            spectra.join("\n")
        )
    }

    #[test]
    fn parses_arrays_and_minutes() {
        let xml = document(&[
            spectrum_xml("scan=1", 1.0, Some("minute"), &[50.0, 51.0], &[10.0, 20.0]),
            spectrum_xml("scan=2", 2.0, Some("minute"), &[60.0], &[5.0]),
        ]);
        let index = SpectrumIndex::parse(&xml).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.max_retention_time(), 2.0);
        let hit = index.lookup(1.05).unwrap();
        assert_eq!(hit.retention_time, 1.0);
        assert_eq!(hit.series.x, vec![50.0, 51.0]);
        assert_eq!(hit.series.y, vec![10.0, 20.0]);
    }

    #[test]
    fn unitless_large_times_are_seconds() {
        let xml = document(&[
            spectrum_xml("a", 120.0, None, &[1.0], &[1.0]),
            spectrum_xml("b", 180.0, None, &[2.0], &[2.0]),
            spectrum_xml("c", 240.0, None, &[3.0], &[3.0]),
        ]);
        let index = SpectrumIndex::parse(&xml).unwrap();
        assert_eq!(index.max_retention_time(), 4.0);
        assert_eq!(index.within(3.0, 0.01).unwrap().id, "b");
    }

    #[test]
    fn request_in_seconds_is_converted() {
        let xml = document(&[
            spectrum_xml("a", 2.0, Some("minute"), &[1.0], &[1.0]),
            spectrum_xml("b", 3.0, Some("minute"), &[2.0], &[2.0]),
        ]);
        let index = SpectrumIndex::parse(&xml).unwrap();
        // 180 s is far beyond a 3-minute run, so it is read as 3.0 min.
        assert_eq!(index.lookup(180.0).unwrap().retention_time, 3.0);
    }

    #[test]
    fn falls_back_to_nearest_spectrum() {
        let xml = document(&[spectrum_xml("a", 5.0, Some("minute"), &[1.0], &[1.0])]);
        let index = SpectrumIndex::parse(&xml).unwrap();
        assert_eq!(index.lookup(7.5).unwrap().retention_time, 5.0);
        assert!(SpectrumIndex::default().lookup(1.0).is_none());
    }

    #[test]
    fn large_spectra_are_decimated() {
        let mz: Vec<f64> = (0..5000).map(f64::from).collect();
        let xml = document(&[spectrum_xml("a", 1.0, Some("minute"), &mz, &mz)]);
        let hit = SpectrumIndex::parse(&xml).unwrap().lookup(1.0).unwrap();
        assert!(hit.series.len() <= MAX_SPECTRUM_POINTS);
        assert_eq!(hit.series.x[0], 0.0);
    }

    #[test]
    fn cache_names_are_per_archive() {
        let cache = MzmlCache::new(
            "/cache",
            MsConverter::locate(Some(PathBuf::from("/nonexistent/msconvert")), Duration::from_secs(1)),
        );
        assert_eq!(
            cache.cache_path(Path::new("/data/Run1.D"), Some("20240101_120000_seq1")),
            PathBuf::from("/cache/Run1_20240101_120000_seq1.mzML")
        );
        assert_eq!(
            cache.cache_path(Path::new("/data/plain"), Some("x")),
            PathBuf::from("/cache/plain_x.mzML")
        );
    }

    #[test]
    fn missing_converter_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let converter = MsConverter {
            exe: None,
            timeout: Duration::from_secs(1),
        };
        let cache = MzmlCache::new(tmp.path(), converter);
        let err = cache.index_for(tmp.path(), Some("a")).unwrap_err();
        assert!(matches!(err, InstrumentError::Converter(_)));
    }
}
