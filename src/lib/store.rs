//! The status database: samples, flow cells, sequencing runs and per sample and lane metrics.
//!
//! Access goes through the [`StatusDb`] trait, so that the handle can be constructed by the
//! caller and passed down. [`InMemoryStatusDb`] implements session semantics on top of plain
//! tables: writes are visible within the session immediately, [`StatusDb::commit`] publishes
//! them once the JSON snapshot has been written (if the store is backed by a file) and
//! [`StatusDb::rollback`] discards everything since the last successful commit.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::metrics::{SampleLaneMetrics, SequencingRunMetrics};
use crate::sequencer::Sequencer;
use crate::utils::write_json_atomically;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("No {entity} with id {internal_id}")]
    EntryNotFound { entity: &'static str, internal_id: String },

    #[error("A {entity} with id {internal_id} already exists")]
    EntryAlreadyExists { entity: &'static str, internal_id: String },

    #[error("Io error occurred for {path:?}")]
    Io { source: std::io::Error, path: PathBuf },

    #[error("Unable to (de)serialize the status database")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ControlType {
    Negative,
    Positive,
}

/// Where the data of a sequencing run currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DataAvailability {
    OnDisk,
    Removed,
    Requested,
    Processing,
    Retrieved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub internal_id: String,
    pub name: String,
    pub control: Option<ControlType>,
    /// Reads over all lanes of all sequencing runs.
    pub reads: u64,
    pub last_sequenced_at: Option<DateTime<Utc>>,
}

impl Sample {
    pub fn new(internal_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            internal_id: internal_id.into(),
            name: name.into(),
            control: None,
            reads: 0,
            last_sequenced_at: None,
        }
    }

    pub fn with_control(mut self, control: ControlType) -> Self {
        self.control = Some(control);
        self
    }

    pub fn is_negative_control(&self) -> bool {
        self.control == Some(ControlType::Negative)
    }
}

/// The data needed to add a flow cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowCellDto {
    pub internal_id: String,
    pub sequencer_type: Sequencer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowCell {
    pub id: u64,
    pub internal_id: String,
    pub sequencer_type: Sequencer,
}

/// One demultiplexing of a flow cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencingRun {
    pub id: u64,
    pub flow_cell_id: u64,
    pub data_availability: DataAvailability,
    pub has_backup: bool,
    pub archived_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub metrics: SequencingRunMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleSequencingMetrics {
    pub id: u64,
    pub sequencing_run_id: u64,
    #[serde(flatten)]
    pub metrics: SampleLaneMetrics,
}

/// Repository style access to the status database.
pub trait StatusDb {
    fn get_sample_by_internal_id(&self, internal_id: &str) -> Option<Sample>;

    fn get_flow_cell_by_internal_id(&self, internal_id: &str) -> Option<FlowCell>;

    fn get_sequencing_runs_by_flow_cell(&self, flow_cell_id: &str) -> Vec<SequencingRun>;

    fn get_sample_lane_metrics_by_flow_cell(
        &self,
        flow_cell_id: &str,
    ) -> Vec<SampleSequencingMetrics>;

    fn get_sample_lane_metrics_by_sample(&self, sample_id: &str) -> Vec<SampleSequencingMetrics>;

    fn get_metrics_entry_by_flow_cell_sample_and_lane(
        &self,
        flow_cell_id: &str,
        sample_id: &str,
        lane: usize,
    ) -> Option<SampleSequencingMetrics>;

    fn add_sample(&mut self, sample: Sample) -> Result<Sample, StoreError>;

    /// Fails with [`StoreError::EntryAlreadyExists`] if the flow cell is already present.
    fn add_flow_cell(&mut self, dto: &FlowCellDto) -> Result<FlowCell, StoreError>;

    fn add_sequencing_run(
        &mut self,
        metrics: SequencingRunMetrics,
        flow_cell: &FlowCell,
    ) -> Result<SequencingRun, StoreError>;

    /// Fails with [`StoreError::EntryNotFound`], and rolls back the session, if the sample of
    /// the metrics is unknown. Fails with [`StoreError::EntryAlreadyExists`] if the run already
    /// holds metrics for the sample and lane.
    fn add_sample_metrics_entry(
        &mut self,
        metrics: SampleLaneMetrics,
        sequencing_run: &SequencingRun,
    ) -> Result<SampleSequencingMetrics, StoreError>;

    fn update_sample_reads(
        &mut self,
        internal_id: &str,
        reads: u64,
        last_sequenced_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn update_data_availability(
        &mut self,
        flow_cell_id: &str,
        data_availability: DataAvailability,
    ) -> Result<(), StoreError>;

    fn update_has_backup(&mut self, flow_cell_id: &str, has_backup: bool) -> Result<(), StoreError>;

    /// Deletes the flow cell together with its sequencing runs and their sample metrics, and
    /// recalculates the reads of the samples that had metrics on it.
    fn delete_flow_cell(&mut self, internal_id: &str) -> Result<(), StoreError>;

    /// Publishes the session. On error nothing is published and the session can be rolled back.
    fn commit(&mut self) -> Result<(), StoreError>;

    fn rollback(&mut self);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Tables {
    next_id: u64,
    samples: BTreeMap<String, Sample>,
    flow_cells: Vec<FlowCell>,
    sequencing_runs: Vec<SequencingRun>,
    sample_metrics: Vec<SampleSequencingMetrics>,
}

impl Tables {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn flow_cell(&self, internal_id: &str) -> Option<&FlowCell> {
        self.flow_cells.iter().find(|f| f.internal_id == internal_id)
    }

    /// Sets the reads of a sample to the sum over its remaining lane metrics, and its last
    /// sequencing date to that of the newest remaining run.
    fn recalculate_sample_reads(&mut self, sample_id: &str) {
        let entries: Vec<&SampleSequencingMetrics> =
            self.sample_metrics.iter().filter(|m| m.metrics.sample_id == sample_id).collect();
        let reads: u64 = entries.iter().map(|m| m.metrics.total_reads_in_lane).sum();
        let last_sequenced_at = entries
            .iter()
            .map(|m| {
                self.sequencing_runs
                    .iter()
                    .find(|r| r.id == m.sequencing_run_id)
                    .and_then(|r| r.metrics.sequencing_completed_at)
                    .unwrap_or(m.metrics.created_at)
            })
            .max();
        if let Some(sample) = self.samples.get_mut(sample_id) {
            sample.reads = reads;
            sample.last_sequenced_at = last_sequenced_at;
        }
    }

    fn run_ids(&self, flow_cell_id: &str) -> Vec<u64> {
        match self.flow_cell(flow_cell_id) {
            Some(flow_cell) => self
                .sequencing_runs
                .iter()
                .filter(|r| r.flow_cell_id == flow_cell.id)
                .map(|r| r.id)
                .collect(),
            None => vec![],
        }
    }
}

/// A [`StatusDb`] held in memory, optionally persisted as a JSON snapshot.
#[derive(Debug, Default)]
pub struct InMemoryStatusDb {
    committed: Tables,
    pending: Tables,
    path: Option<PathBuf>,
}

impl InMemoryStatusDb {
    /// An empty store that is never written to disk.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the snapshot at `path`, starting empty if it does not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let tables: Tables = if path.exists() {
            let file = File::open(&path)
                .map_err(|e| StoreError::Io { source: e, path: path.clone() })?;
            serde_json::from_reader(BufReader::new(file))?
        } else {
            Tables::default()
        };
        debug!("Opened status database {:?} with {} flow cells", path, tables.flow_cells.len());
        Ok(Self { committed: tables.clone(), pending: tables, path: Some(path) })
    }

    fn write_snapshot(&self, tables: &Tables) -> Result<(), StoreError> {
        if let Some(path) = &self.path {
            write_json_atomically(path, tables)
                .map_err(|e| StoreError::Io { source: e, path: path.clone() })?;
        }
        Ok(())
    }

    fn sequencing_run_mut(
        &mut self,
        flow_cell_id: &str,
    ) -> Result<Vec<&mut SequencingRun>, StoreError> {
        let run_ids = self.pending.run_ids(flow_cell_id);
        if run_ids.is_empty() {
            return Err(StoreError::EntryNotFound {
                entity: "sequencing run",
                internal_id: flow_cell_id.to_string(),
            });
        }
        Ok(self.pending.sequencing_runs.iter_mut().filter(|r| run_ids.contains(&r.id)).collect())
    }
}

impl StatusDb for InMemoryStatusDb {
    fn get_sample_by_internal_id(&self, internal_id: &str) -> Option<Sample> {
        self.pending.samples.get(internal_id).cloned()
    }

    fn get_flow_cell_by_internal_id(&self, internal_id: &str) -> Option<FlowCell> {
        self.pending.flow_cell(internal_id).cloned()
    }

    fn get_sequencing_runs_by_flow_cell(&self, flow_cell_id: &str) -> Vec<SequencingRun> {
        let run_ids = self.pending.run_ids(flow_cell_id);
        self.pending.sequencing_runs.iter().filter(|r| run_ids.contains(&r.id)).cloned().collect()
    }

    fn get_sample_lane_metrics_by_flow_cell(
        &self,
        flow_cell_id: &str,
    ) -> Vec<SampleSequencingMetrics> {
        let run_ids = self.pending.run_ids(flow_cell_id);
        self.pending
            .sample_metrics
            .iter()
            .filter(|m| run_ids.contains(&m.sequencing_run_id))
            .cloned()
            .collect()
    }

    fn get_sample_lane_metrics_by_sample(&self, sample_id: &str) -> Vec<SampleSequencingMetrics> {
        self.pending
            .sample_metrics
            .iter()
            .filter(|m| m.metrics.sample_id == sample_id)
            .cloned()
            .collect()
    }

    fn get_metrics_entry_by_flow_cell_sample_and_lane(
        &self,
        flow_cell_id: &str,
        sample_id: &str,
        lane: usize,
    ) -> Option<SampleSequencingMetrics> {
        self.get_sample_lane_metrics_by_flow_cell(flow_cell_id)
            .into_iter()
            .find(|m| m.metrics.sample_id == sample_id && m.metrics.flow_cell_lane == lane)
    }

    fn add_sample(&mut self, sample: Sample) -> Result<Sample, StoreError> {
        if self.pending.samples.contains_key(&sample.internal_id) {
            return Err(StoreError::EntryAlreadyExists {
                entity: "sample",
                internal_id: sample.internal_id,
            });
        }
        self.pending.samples.insert(sample.internal_id.clone(), sample.clone());
        Ok(sample)
    }

    fn add_flow_cell(&mut self, dto: &FlowCellDto) -> Result<FlowCell, StoreError> {
        if self.pending.flow_cell(&dto.internal_id).is_some() {
            return Err(StoreError::EntryAlreadyExists {
                entity: "flow cell",
                internal_id: dto.internal_id.clone(),
            });
        }
        let flow_cell = FlowCell {
            id: self.pending.next_id(),
            internal_id: dto.internal_id.clone(),
            sequencer_type: dto.sequencer_type,
        };
        self.pending.flow_cells.push(flow_cell.clone());
        Ok(flow_cell)
    }

    fn add_sequencing_run(
        &mut self,
        metrics: SequencingRunMetrics,
        flow_cell: &FlowCell,
    ) -> Result<SequencingRun, StoreError> {
        let run = SequencingRun {
            id: self.pending.next_id(),
            flow_cell_id: flow_cell.id,
            data_availability: DataAvailability::OnDisk,
            has_backup: false,
            archived_at: None,
            metrics,
        };
        self.pending.sequencing_runs.push(run.clone());
        Ok(run)
    }

    fn add_sample_metrics_entry(
        &mut self,
        metrics: SampleLaneMetrics,
        sequencing_run: &SequencingRun,
    ) -> Result<SampleSequencingMetrics, StoreError> {
        if !self.pending.samples.contains_key(&metrics.sample_id) {
            self.rollback();
            return Err(StoreError::EntryNotFound {
                entity: "sample",
                internal_id: metrics.sample_id,
            });
        }
        let duplicate = self.pending.sample_metrics.iter().any(|m| {
            m.sequencing_run_id == sequencing_run.id
                && m.metrics.sample_id == metrics.sample_id
                && m.metrics.flow_cell_lane == metrics.flow_cell_lane
        });
        if duplicate {
            return Err(StoreError::EntryAlreadyExists {
                entity: "sample lane metrics",
                internal_id: format!("{} in lane {}", metrics.sample_id, metrics.flow_cell_lane),
            });
        }
        let entry = SampleSequencingMetrics {
            id: self.pending.next_id(),
            sequencing_run_id: sequencing_run.id,
            metrics,
        };
        self.pending.sample_metrics.push(entry.clone());
        Ok(entry)
    }

    fn update_sample_reads(
        &mut self,
        internal_id: &str,
        reads: u64,
        last_sequenced_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let sample = self.pending.samples.get_mut(internal_id).ok_or_else(|| {
            StoreError::EntryNotFound { entity: "sample", internal_id: internal_id.to_string() }
        })?;
        sample.reads = reads;
        sample.last_sequenced_at = Some(last_sequenced_at);
        Ok(())
    }

    fn update_data_availability(
        &mut self,
        flow_cell_id: &str,
        data_availability: DataAvailability,
    ) -> Result<(), StoreError> {
        for run in self.sequencing_run_mut(flow_cell_id)? {
            run.data_availability = data_availability;
        }
        Ok(())
    }

    fn update_has_backup(
        &mut self,
        flow_cell_id: &str,
        has_backup: bool,
    ) -> Result<(), StoreError> {
        for run in self.sequencing_run_mut(flow_cell_id)? {
            run.has_backup = has_backup;
        }
        Ok(())
    }

    fn delete_flow_cell(&mut self, internal_id: &str) -> Result<(), StoreError> {
        let flow_cell = self.pending.flow_cell(internal_id).cloned().ok_or_else(|| {
            StoreError::EntryNotFound { entity: "flow cell", internal_id: internal_id.to_string() }
        })?;
        let run_ids = self.pending.run_ids(internal_id);
        let sample_ids: BTreeSet<String> = self
            .pending
            .sample_metrics
            .iter()
            .filter(|m| run_ids.contains(&m.sequencing_run_id))
            .map(|m| m.metrics.sample_id.clone())
            .collect();
        self.pending.sample_metrics.retain(|m| !run_ids.contains(&m.sequencing_run_id));
        self.pending.sequencing_runs.retain(|r| r.flow_cell_id != flow_cell.id);
        self.pending.flow_cells.retain(|f| f.id != flow_cell.id);
        for sample_id in &sample_ids {
            self.pending.recalculate_sample_reads(sample_id);
        }
        info!(
            "Deleted flow cell {} and {} sequencing runs from the status database",
            internal_id,
            run_ids.len()
        );
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.write_snapshot(&self.pending)?;
        self.committed = self.pending.clone();
        Ok(())
    }

    fn rollback(&mut self) {
        self.pending = self.committed.clone();
    }
}
