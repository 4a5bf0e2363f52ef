//! Parsing of the metrics files written by BCL Convert (DRAGEN) during demultiplexing.
//!
//! Three files are read from anywhere below a run directory:
//! - `Demultiplex_Stats.csv`: the number of read pairs per sample and lane
//! - `Quality_Metrics.csv`: yield and base quality per sample, lane and read
//! - `Adapter_Metrics.csv`: adapter bases per sample and lane
//!
//! The columns are mapped by header name, so column order and extra columns do not matter.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use ahash::{AHashMap, AHashSet};
use clap::{ArgEnum, PossibleValue};
use csv::{ReaderBuilder, Trim};
use itertools::Itertools;
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::metrics::UNDETERMINED_SAMPLE_ID;
use crate::utils::find_file_by_name;

pub const DEMUX_STATS_FILE_NAME: &str = "Demultiplex_Stats.csv";
pub const QUALITY_METRICS_FILE_NAME: &str = "Quality_Metrics.csv";
pub const ADAPTER_METRICS_FILE_NAME: &str = "Adapter_Metrics.csv";

/// The demultiplexing software counts read pairs; every pair is two reads.
pub const READ_PAIR_SCALING_FACTOR: u64 = 2;

/// The number of quality rows (one per read) assumed by [`QualityAveraging::FixedDivisor`].
const FIXED_QUALITY_DIVISOR: f64 = 2.0;

lazy_static! {
    /// Internal sample ids: three letters, a number, a letter and a number, e.g. ACC11927A2.
    static ref INTERNAL_ID_REGEX: Regex = Regex::new(r"^[A-Za-z]{3}\d+[A-Za-z]\d+$").unwrap();
}

/// Returns true if `sample_id` looks like an internal sample id, rather than e.g. `Undetermined`.
pub fn is_valid_sample_internal_id(sample_id: &str) -> bool {
    INTERNAL_ID_REGEX.is_match(sample_id)
}

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Could not find {file_name} in {dir:?}")]
    FileNotFound { file_name: &'static str, dir: PathBuf },

    #[error("Unable to read {path:?}")]
    Io { source: std::io::Error, path: PathBuf },

    #[error("Unable to open {path:?}: {source}")]
    Open { source: csv::Error, path: PathBuf },

    #[error("Unable to parse line {line} of {path:?}: {source}")]
    DeserializeRecord { source: csv::Error, path: PathBuf, line: u64 },

    #[error("Sample {sample_id} occurs more than once for lane {lane} in {file_name}")]
    DuplicateEntry { sample_id: String, lane: usize, file_name: &'static str },

    #[error("No metrics for sample {sample_id} in lane {lane} in {file_name}")]
    MissingEntry { sample_id: String, lane: usize, file_name: &'static str },
}

/// How the per-read rows of `Quality_Metrics.csv` are combined for one sample in one lane.
#[derive(ArgEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QualityAveraging {
    /// Sum the per-read values and divide by two, regardless of the number of rows or their yield.
    FixedDivisor,
    /// Weight each per-read value by the yield of that read.
    YieldWeighted,
}

impl Default for QualityAveraging {
    fn default() -> Self {
        Self::YieldWeighted
    }
}

impl QualityAveraging {
    pub fn possible_values<'a>() -> impl Iterator<Item = PossibleValue<'a>> {
        QualityAveraging::value_variants().iter().filter_map(ArgEnum::to_possible_value)
    }

    /// Combine `(value, yield)` pairs into one value.
    fn combine<I: IntoIterator<Item = (f64, u64)>>(self, values: I) -> f64 {
        match self {
            Self::FixedDivisor => {
                values.into_iter().map(|(value, _)| value).sum::<f64>() / FIXED_QUALITY_DIVISOR
            }
            Self::YieldWeighted => {
                let (weighted_sum, total_yield) = values
                    .into_iter()
                    .fold((0.0, 0_u64), |(sum, total), (value, y)| {
                        (sum + value * y as f64, total + y)
                    });
                if total_yield == 0 {
                    0.0
                } else {
                    weighted_sum / total_yield as f64
                }
            }
        }
    }
}

impl std::str::FromStr for QualityAveraging {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        for variant in Self::value_variants() {
            if variant.to_possible_value().map_or(false, |v| v.matches(s, false)) {
                return Ok(*variant);
            }
        }
        Err(anyhow::anyhow!("Invalid variant: {}", s))
    }
}

/// A row of `Demultiplex_Stats.csv`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DemuxMetric {
    #[serde(rename = "Lane")]
    pub lane: usize,
    #[serde(rename = "SampleID")]
    pub sample_internal_id: String,
    #[serde(rename = "# Reads")]
    pub read_pair_count: u64,
}

/// A row of `Quality_Metrics.csv`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QualityMetric {
    #[serde(rename = "Lane")]
    pub lane: usize,
    #[serde(rename = "SampleID")]
    pub sample_internal_id: String,
    /// Absent in files written with a single row per sample and lane.
    #[serde(rename = "ReadNumber", default)]
    pub read_number: Option<u8>,
    #[serde(rename = "Yield")]
    pub yield_: u64,
    #[serde(rename = "YieldQ30")]
    pub yield_q30: u64,
    #[serde(rename = "QualityScoreSum")]
    pub quality_score_sum: u64,
    #[serde(rename = "Mean Quality Score (PF)")]
    pub mean_quality_score_q30: f64,
    /// A fraction between 0 and 1.
    #[serde(rename = "% Q30")]
    pub q30_bases_percent: f64,
}

/// A row of `Adapter_Metrics.csv`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AdapterMetric {
    #[serde(rename = "Lane")]
    pub lane: usize,
    #[serde(rename = "Sample_ID")]
    pub sample_internal_id: String,
    #[serde(rename = "R1_AdapterBases")]
    pub r1_adapter_bases: u64,
    #[serde(rename = "R1_SampleBases")]
    pub r1_sample_bases: u64,
    #[serde(rename = "R2_AdapterBases", default)]
    pub r2_adapter_bases: Option<u64>,
    #[serde(rename = "R2_SampleBases", default)]
    pub r2_sample_bases: Option<u64>,
}

/// Reads all rows of a headed CSV file.
fn read_metrics_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, MetricsError> {
    let mut reader = ReaderBuilder::new()
        .trim(Trim::All)
        .from_path(path)
        .map_err(|e| MetricsError::Open { source: e, path: path.to_path_buf() })?;

    let mut rows = vec![];
    for result in reader.deserialize() {
        let row: T = result.map_err(|e| {
            let line = e.position().map_or(0, csv::Position::line);
            MetricsError::DeserializeRecord { source: e, path: path.to_path_buf(), line }
        })?;
        rows.push(row);
    }
    debug!("Read {} rows from {:?}", rows.len(), path);
    Ok(rows)
}

/// Locates a required metrics file anywhere below `dir`.
fn locate(dir: &Path, file_name: &'static str) -> Result<PathBuf, MetricsError> {
    find_file_by_name(dir, file_name)
        .map_err(|e| MetricsError::Io { source: e, path: dir.to_path_buf() })?
        .ok_or_else(|| MetricsError::FileNotFound { file_name, dir: dir.to_path_buf() })
}

type SampleLaneKey = (String, usize);

/// The parsed BCL Convert metrics of one run.
#[derive(Debug, Clone)]
pub struct BclConvertMetricsParser {
    demux_metrics: Vec<DemuxMetric>,
    quality_metrics: Vec<QualityMetric>,
    adapter_metrics: Vec<AdapterMetric>,
    demux_index: AHashMap<SampleLaneKey, usize>,
    quality_index: AHashMap<SampleLaneKey, Vec<usize>>,
    adapter_index: AHashMap<SampleLaneKey, usize>,
    averaging: QualityAveraging,
}

impl BclConvertMetricsParser {
    /// Locate and parse the three metrics files below `run_dir`.
    pub fn from_run_dir<P: AsRef<Path>>(run_dir: P) -> Result<Self, MetricsError> {
        let dir = run_dir.as_ref();
        let demux_path = locate(dir, DEMUX_STATS_FILE_NAME)?;
        let quality_path = locate(dir, QUALITY_METRICS_FILE_NAME)?;
        let adapter_path = locate(dir, ADAPTER_METRICS_FILE_NAME)?;
        Self::new(
            read_metrics_file(&demux_path)?,
            read_metrics_file(&quality_path)?,
            read_metrics_file(&adapter_path)?,
        )
    }

    /// Build a parser from already parsed rows, validating that each key occurs once.
    pub fn new(
        demux_metrics: Vec<DemuxMetric>,
        quality_metrics: Vec<QualityMetric>,
        adapter_metrics: Vec<AdapterMetric>,
    ) -> Result<Self, MetricsError> {
        let mut demux_index = AHashMap::new();
        for (i, metric) in demux_metrics.iter().enumerate() {
            let key = (metric.sample_internal_id.clone(), metric.lane);
            if demux_index.insert(key, i).is_some() {
                return Err(MetricsError::DuplicateEntry {
                    sample_id: metric.sample_internal_id.clone(),
                    lane: metric.lane,
                    file_name: DEMUX_STATS_FILE_NAME,
                });
            }
        }

        let mut seen_reads = AHashSet::new();
        let mut quality_index: AHashMap<SampleLaneKey, Vec<usize>> = AHashMap::new();
        for (i, metric) in quality_metrics.iter().enumerate() {
            let read_key = (metric.sample_internal_id.clone(), metric.lane, metric.read_number);
            if !seen_reads.insert(read_key) {
                return Err(MetricsError::DuplicateEntry {
                    sample_id: metric.sample_internal_id.clone(),
                    lane: metric.lane,
                    file_name: QUALITY_METRICS_FILE_NAME,
                });
            }
            quality_index
                .entry((metric.sample_internal_id.clone(), metric.lane))
                .or_default()
                .push(i);
        }

        let mut adapter_index = AHashMap::new();
        for (i, metric) in adapter_metrics.iter().enumerate() {
            let key = (metric.sample_internal_id.clone(), metric.lane);
            if adapter_index.insert(key, i).is_some() {
                return Err(MetricsError::DuplicateEntry {
                    sample_id: metric.sample_internal_id.clone(),
                    lane: metric.lane,
                    file_name: ADAPTER_METRICS_FILE_NAME,
                });
            }
        }

        Ok(Self {
            demux_metrics,
            quality_metrics,
            adapter_metrics,
            demux_index,
            quality_index,
            adapter_index,
            averaging: QualityAveraging::default(),
        })
    }

    /// Use the given strategy to combine per-read quality rows.
    pub fn with_averaging(mut self, averaging: QualityAveraging) -> Self {
        self.averaging = averaging;
        self
    }

    pub fn demux_metrics(&self) -> &[DemuxMetric] {
        &self.demux_metrics
    }

    pub fn quality_metrics(&self) -> &[QualityMetric] {
        &self.quality_metrics
    }

    pub fn adapter_metrics(&self) -> &[AdapterMetric] {
        &self.adapter_metrics
    }

    /// All internal sample ids in the demultiplexing counts, excluding undetermined and other
    /// placeholder rows.
    pub fn get_sample_internal_ids(&self) -> BTreeSet<String> {
        self.demux_metrics
            .iter()
            .map(|m| &m.sample_internal_id)
            .filter(|id| is_valid_sample_internal_id(id))
            .cloned()
            .collect()
    }

    /// The sorted lanes a sample was demultiplexed in.
    pub fn get_lanes_for_sample(&self, sample_id: &str) -> Vec<usize> {
        self.demux_metrics
            .iter()
            .filter(|m| m.sample_internal_id == sample_id)
            .map(|m| m.lane)
            .sorted()
            .dedup()
            .collect()
    }

    fn demux_metric(&self, sample_id: &str, lane: usize) -> Result<&DemuxMetric, MetricsError> {
        self.demux_index
            .get(&(sample_id.to_string(), lane))
            .map(|&i| &self.demux_metrics[i])
            .ok_or_else(|| MetricsError::MissingEntry {
                sample_id: sample_id.to_string(),
                lane,
                file_name: DEMUX_STATS_FILE_NAME,
            })
    }

    fn quality_rows(
        &self,
        sample_id: &str,
        lane: usize,
    ) -> Result<Vec<&QualityMetric>, MetricsError> {
        self.quality_index
            .get(&(sample_id.to_string(), lane))
            .map(|indices| indices.iter().map(|&i| &self.quality_metrics[i]).collect())
            .ok_or_else(|| MetricsError::MissingEntry {
                sample_id: sample_id.to_string(),
                lane,
                file_name: QUALITY_METRICS_FILE_NAME,
            })
    }

    /// The number of reads (not read pairs) for a sample in a lane.
    pub fn calculate_total_reads_for_sample_in_lane(
        &self,
        sample_id: &str,
        lane: usize,
    ) -> Result<u64, MetricsError> {
        Ok(self.demux_metric(sample_id, lane)?.read_pair_count * READ_PAIR_SCALING_FACTOR)
    }

    /// The fraction (0-1) of bases with a quality of 30 or above for a sample in a lane.
    pub fn get_q30_bases_percent_for_sample_in_lane(
        &self,
        sample_id: &str,
        lane: usize,
    ) -> Result<f64, MetricsError> {
        let rows = self.quality_rows(sample_id, lane)?;
        Ok(self.averaging.combine(rows.iter().map(|r| (r.q30_bases_percent, r.yield_))))
    }

    /// The mean base quality score for a sample in a lane.
    pub fn get_mean_quality_score_for_sample_in_lane(
        &self,
        sample_id: &str,
        lane: usize,
    ) -> Result<f64, MetricsError> {
        let rows = self.quality_rows(sample_id, lane)?;
        Ok(self.averaging.combine(rows.iter().map(|r| (r.mean_quality_score_q30, r.yield_))))
    }

    /// The number of bases over all reads for a sample in a lane.
    pub fn get_yield_for_sample_in_lane(
        &self,
        sample_id: &str,
        lane: usize,
    ) -> Result<u64, MetricsError> {
        Ok(self.quality_rows(sample_id, lane)?.iter().map(|r| r.yield_).sum())
    }

    /// The number of bases with a quality of 30 or above for a sample in a lane.
    pub fn get_yield_q30_for_sample_in_lane(
        &self,
        sample_id: &str,
        lane: usize,
    ) -> Result<u64, MetricsError> {
        Ok(self.quality_rows(sample_id, lane)?.iter().map(|r| r.yield_q30).sum())
    }

    /// The percentage (0-100) of sample bases that are adapter, over both reads.
    pub fn get_adapter_bases_percent_for_sample_in_lane(
        &self,
        sample_id: &str,
        lane: usize,
    ) -> Result<f64, MetricsError> {
        let metric = self
            .adapter_index
            .get(&(sample_id.to_string(), lane))
            .map(|&i| &self.adapter_metrics[i])
            .ok_or_else(|| MetricsError::MissingEntry {
                sample_id: sample_id.to_string(),
                lane,
                file_name: ADAPTER_METRICS_FILE_NAME,
            })?;
        let adapter_bases = metric.r1_adapter_bases + metric.r2_adapter_bases.unwrap_or(0);
        let sample_bases = metric.r1_sample_bases + metric.r2_sample_bases.unwrap_or(0);
        if sample_bases == 0 {
            Ok(0.0)
        } else {
            Ok(adapter_bases as f64 / sample_bases as f64 * 100.0)
        }
    }

    /// True if there is an undetermined row for the lane.
    pub fn has_undetermined_reads_in_lane(&self, lane: usize) -> bool {
        self.demux_index.contains_key(&(UNDETERMINED_SAMPLE_ID.to_string(), lane))
    }
}
