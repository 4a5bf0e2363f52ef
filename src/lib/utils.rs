//! Utility functions.
use std::{
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use path_absolutize::Absolutize;
use regex::Regex;
use serde::Serialize;
use tempfile::NamedTempFile;

/// Version of the software.
pub static VERSION: &str = env!("CARGO_PKG_VERSION");

/// Recursively lists all files below `dir`, in sorted order.
pub fn list_files<P: AsRef<Path>>(dir: P) -> io::Result<Vec<PathBuf>> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir.as_ref())?
        .map(|res| res.map(|e| e.path()))
        .collect::<Result<_, _>>()?;
    entries.sort();

    let mut files = vec![];
    for entry in entries {
        if entry.is_dir() {
            files.extend(list_files(&entry)?);
        } else if entry.is_file() {
            files.push(entry);
        }
    }
    Ok(files)
}

/// Finds the first file named exactly `file_name` anywhere below `dir`.
pub fn find_file_by_name<P: AsRef<Path>>(dir: P, file_name: &str) -> io::Result<Option<PathBuf>> {
    Ok(list_files(dir)?
        .into_iter()
        .find(|p| p.file_name().map_or(false, |name| name == file_name)))
}

/// Returns the absolute form of `path` without touching the file system.
pub fn absolute_path<P: AsRef<Path>>(path: P) -> io::Result<PathBuf> {
    Ok(path.as_ref().absolutize()?.to_path_buf())
}

/// The current time, used as the creation time of new records.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Writes `value` as pretty JSON to `path`.
///
/// The JSON is written to a temporary file next to `path` that is then renamed over it, so
/// `path` holds either the previous or the new content.
pub fn write_json_atomically<T: Serialize, P: AsRef<Path>>(path: P, value: &T) -> io::Result<()> {
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        serde_json::to_writer_pretty(&mut writer, value)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Rounds to two decimals.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub static FASTQ_SUFFIX: &str = "_001.fastq.gz";

lazy_static! {
    /// <sample>_S#_L00#_<R# or I#>_001.fastq.gz
    static ref FASTQ_REGEX: Regex =
        Regex::new(r"^(.+)_S(\d+)_L(\d{3})_([RI])(\d)_001\.fastq\.gz$").unwrap();
}

/// A fastq file written by the demultiplexing software, with the information encoded in the
/// file name by the Illumina naming convention.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DemuxedFastq {
    pub sample: String,
    pub lane: usize,
    pub is_index_read: bool,
    pub read_number: u8,
    pub sample_number: usize,
    pub path: PathBuf,
}

impl DemuxedFastq {
    /// Create a new `DemuxedFastq` inferring information from the file name.  This must match the
    /// `FASTQ_REGEX` pattern.
    pub fn new<P: AsRef<Path>>(path: P) -> Option<DemuxedFastq> {
        let file_name = path.as_ref().file_name()?.to_string_lossy();
        let captures = FASTQ_REGEX.captures(&file_name)?;
        Some(DemuxedFastq {
            sample: captures.get(1)?.as_str().to_string(),
            sample_number: captures.get(2)?.as_str().parse().ok()?,
            lane: captures.get(3)?.as_str().parse().ok()?,
            is_index_read: captures.get(4)?.as_str() == "I",
            read_number: captures.get(5)?.as_str().parse().ok()?,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Identifies all fastq files below `dir` that match the `FASTQ_REGEX` pattern.  The
    /// fastqs are returned sorted by sample, lane and read.
    pub fn slurp<P: AsRef<Path>>(dir: P) -> io::Result<Vec<DemuxedFastq>> {
        let mut fastqs: Vec<DemuxedFastq> = list_files(dir)?
            .into_iter()
            .filter(|p| p.to_string_lossy().ends_with(FASTQ_SUFFIX))
            .filter_map(DemuxedFastq::new)
            .collect();
        fastqs.sort();
        Ok(fastqs)
    }
}
