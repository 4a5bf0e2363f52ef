//! Writing the results of demultiplexing to the status database and Housekeeper.
//!
//! The two stores share no transaction. The status database is written in one session that is
//! either committed as a whole or rolled back; Housekeeper registration is idempotent, so a
//! flow cell whose registration failed half way can simply be registered again.

use std::path::PathBuf;

use ahash::AHashSet;
use log::{debug, error, info, warn};
use thiserror::Error;

use crate::bcl_convert::{
    ADAPTER_METRICS_FILE_NAME, DEMUX_STATS_FILE_NAME, QUALITY_METRICS_FILE_NAME,
};
use crate::flow_cell::{FlowCellDirectory, FlowCellError};
use crate::housekeeper::{Housekeeper, HousekeeperError, HousekeeperFile};
use crate::metrics::{SampleLaneMetrics, SequencingRunMetrics, UNDETERMINED_SAMPLE_ID};
use crate::qc::is_trackable;
use crate::sample_sheet::SampleSheet;
use crate::sequencer::SequencingFileTag;
use crate::store::{FlowCell, FlowCellDto, StatusDb, StoreError};
use crate::utils::{find_file_by_name, now, DemuxedFastq};

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Housekeeper(#[from] HousekeeperError),

    #[error(transparent)]
    FlowCell(#[from] FlowCellError),
}

/// Adds the flow cell, its sequencing run and the sample lane metrics, then updates the reads
/// of every sample on the flow cell. Commits on success, rolls back on any error, a failed
/// commit included.
pub fn store_flow_cell_data_in_status_db<S: StatusDb + ?Sized>(
    store: &mut S,
    flow_cell: &FlowCellDirectory,
    run_metrics: SequencingRunMetrics,
    sample_metrics: Vec<SampleLaneMetrics>,
) -> Result<FlowCell, StoreError> {
    let result = add_flow_cell_data(store, flow_cell, run_metrics, sample_metrics)
        .and_then(|db_flow_cell| store.commit().map(|_| db_flow_cell));
    match result {
        Ok(db_flow_cell) => {
            info!("Stored flow cell {} in the status database", flow_cell.id);
            Ok(db_flow_cell)
        }
        Err(e) => {
            store.rollback();
            Err(e)
        }
    }
}

fn add_flow_cell_data<S: StatusDb + ?Sized>(
    store: &mut S,
    flow_cell: &FlowCellDirectory,
    run_metrics: SequencingRunMetrics,
    sample_metrics: Vec<SampleLaneMetrics>,
) -> Result<FlowCell, StoreError> {
    let last_sequenced_at = run_metrics.sequencing_completed_at.unwrap_or_else(now);
    let db_flow_cell = store.add_flow_cell(&FlowCellDto {
        internal_id: flow_cell.id.clone(),
        sequencer_type: flow_cell.sequencer_type,
    })?;
    let run = store.add_sequencing_run(run_metrics, &db_flow_cell)?;

    let mut sample_ids = vec![];
    for metrics in sample_metrics {
        if !sample_ids.contains(&metrics.sample_id) {
            sample_ids.push(metrics.sample_id.clone());
        }
        store.add_sample_metrics_entry(metrics, &run)?;
    }
    debug!("Added metrics for {} samples on flow cell {}", sample_ids.len(), flow_cell.id);

    for sample_id in sample_ids {
        let reads: u64 = store
            .get_sample_lane_metrics_by_sample(&sample_id)
            .iter()
            .map(|m| m.metrics.total_reads_in_lane)
            .sum();
        store.update_sample_reads(&sample_id, reads, last_sequenced_at)?;
    }
    Ok(db_flow_cell)
}

/// Registers a fastq in the bundle of `sample_id` if it passes the quality gate.
fn track_fastq<S: StatusDb + ?Sized, H: Housekeeper + ?Sized>(
    store: &S,
    housekeeper: &mut H,
    flow_cell: &FlowCellDirectory,
    sample_id: &str,
    fastq: &DemuxedFastq,
) -> Result<bool, HousekeeperError> {
    let metrics =
        store.get_metrics_entry_by_flow_cell_sample_and_lane(&flow_cell.id, sample_id, fastq.lane);
    let is_negative_control =
        store.get_sample_by_internal_id(sample_id).map_or(false, |s| s.is_negative_control());
    let lane_metrics = metrics.as_ref().map(|m| &m.metrics);
    if !is_trackable(lane_metrics, is_negative_control, flow_cell.sequencer_type) {
        warn!("Not tracking {:?} for sample {}", fastq.path, sample_id);
        return Ok(false);
    }
    housekeeper.add_bundle_and_version_if_non_existent(sample_id)?;
    housekeeper.add_file_to_bundle_if_non_existent(
        &fastq.path,
        sample_id,
        &[SequencingFileTag::Fastq.as_ref(), flow_cell.id.as_str(), sample_id],
    )?;
    Ok(true)
}

/// Registers the fastq files of every sample on the flow cell that pass the quality gate, and
/// the undetermined fastqs of non-pooled lanes in the bundle of that lane's sample.
///
/// Returns the number of files tracked.
pub fn store_fastq_files_in_housekeeper<S: StatusDb + ?Sized, H: Housekeeper + ?Sized>(
    store: &S,
    housekeeper: &mut H,
    flow_cell: &FlowCellDirectory,
    sample_sheet: &SampleSheet,
) -> Result<usize, PersistenceError> {
    let fastqs: Vec<DemuxedFastq> =
        flow_cell.fastq_files()?.into_iter().filter(|f| !f.is_index_read).collect();
    let sample_ids: AHashSet<String> = sample_sheet.sample_internal_ids().into_iter().collect();

    let mut tracked = 0;
    for fastq in fastqs.iter().filter(|f| sample_ids.contains(&f.sample)) {
        if track_fastq(store, housekeeper, flow_cell, &fastq.sample, fastq)? {
            tracked += 1;
        }
    }

    for (lane, sample_id) in sample_sheet.non_pooled_lanes_and_samples() {
        let undetermined =
            fastqs.iter().filter(|f| f.sample == UNDETERMINED_SAMPLE_ID && f.lane == lane);
        for fastq in undetermined {
            if track_fastq(store, housekeeper, flow_cell, &sample_id, fastq)? {
                tracked += 1;
            }
        }
    }
    info!("Tracked {} fastq files for flow cell {}", tracked, flow_cell.id);
    Ok(tracked)
}

/// Registers the sample sheet of the flow cell in the flow cell bundle, creating the bundle if
/// this is the first file of the flow cell.
pub fn add_sample_sheet_path_to_housekeeper<H: Housekeeper + ?Sized>(
    housekeeper: &mut H,
    flow_cell: &FlowCellDirectory,
) -> Result<HousekeeperFile, HousekeeperError> {
    let path = flow_cell.sample_sheet_path();
    let tags = [SequencingFileTag::SampleSheet.as_ref(), flow_cell.id.as_str()];
    match housekeeper.create_bundle_and_add_file_with_tags(&flow_cell.id, &path, &tags) {
        Err(HousekeeperError::BundleAlreadyExists { .. }) => {
            housekeeper.add_file_to_bundle_if_non_existent(&path, &flow_cell.id, &tags)
        }
        result => result,
    }
}

/// Registers `RunParameters.xml` and the demultiplexing metrics files in the flow cell bundle,
/// skipping those that are absent. Returns the number of files registered.
pub fn add_run_files_to_housekeeper<H: Housekeeper + ?Sized>(
    housekeeper: &mut H,
    flow_cell: &FlowCellDirectory,
) -> Result<usize, PersistenceError> {
    let mut files: Vec<(PathBuf, SequencingFileTag)> = vec![];
    if let Some(path) = flow_cell.run_parameters_path()? {
        files.push((path, SequencingFileTag::RunParameters));
    }
    for file_name in [DEMUX_STATS_FILE_NAME, QUALITY_METRICS_FILE_NAME, ADAPTER_METRICS_FILE_NAME]
    {
        let found = find_file_by_name(&flow_cell.path, file_name)
            .map_err(|e| FlowCellError::Io { source: e, path: flow_cell.path.clone() })?;
        match found {
            Some(path) => files.push((path, SequencingFileTag::DemuxMetrics)),
            None => warn!("No {} found for flow cell {}", file_name, flow_cell.id),
        }
    }

    housekeeper.add_bundle_and_version_if_non_existent(&flow_cell.id)?;
    for (path, tag) in &files {
        let tags = [tag.as_ref(), flow_cell.id.as_str()];
        housekeeper.add_file_to_bundle_if_non_existent(path, &flow_cell.id, &tags)?;
    }
    Ok(files.len())
}

/// The outcome of removing a flow cell from the status database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusDbDeletion {
    Deleted,
    NotFound,
    Failed,
}

/// What [`delete_flow_cell_data`] managed to remove.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionReport {
    pub status_db: StatusDbDeletion,
    pub housekeeper_files_deleted: usize,
    pub errors: Vec<String>,
}

impl DeletionReport {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Removes all data of a flow cell from the status database and its fastq, spring and spring
/// metadata files from Housekeeper.
///
/// Every step is attempted even if an earlier one failed; failures are logged and reported.
pub fn delete_flow_cell_data<S: StatusDb + ?Sized, H: Housekeeper + ?Sized>(
    store: &mut S,
    housekeeper: &mut H,
    flow_cell_id: &str,
) -> DeletionReport {
    let mut errors = vec![];

    let status_db = match store.delete_flow_cell(flow_cell_id).and_then(|_| store.commit()) {
        Ok(()) => StatusDbDeletion::Deleted,
        Err(StoreError::EntryNotFound { .. }) => {
            debug!("Flow cell {} is not in the status database", flow_cell_id);
            StatusDbDeletion::NotFound
        }
        Err(e) => {
            store.rollback();
            error!("Could not delete flow cell {} from the status database: {}", flow_cell_id, e);
            errors.push(e.to_string());
            StatusDbDeletion::Failed
        }
    };

    let mut housekeeper_files_deleted = 0;
    for tag in SequencingFileTag::FLOW_CELL_DATA {
        for file in housekeeper.files(&[tag.as_ref(), flow_cell_id]) {
            match housekeeper.delete_file(file.id) {
                Ok(_) => housekeeper_files_deleted += 1,
                Err(e) => {
                    error!("Could not delete {:?} from Housekeeper: {}", file.path, e);
                    errors.push(e.to_string());
                }
            }
        }
    }
    if housekeeper_files_deleted > 0 {
        info!(
            "Deleted {} files of flow cell {} from Housekeeper",
            housekeeper_files_deleted, flow_cell_id
        );
    }

    DeletionReport { status_db, housekeeper_files_deleted, errors }
}
