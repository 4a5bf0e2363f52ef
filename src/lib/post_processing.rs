//! Post-processing of demultiplexed flow cells.
//!
//! A flow cell is validated and its metrics are computed. Any data stored for it by an earlier
//! post-processing is then removed, the metrics are stored in the status database, its files
//! are registered in Housekeeper and finally the delivery marker is written.
//!
//! The status database is written first, since the quality gate for the fastq files reads the
//! stored sample lane metrics. Should Housekeeper registration then fail, the flow cell is
//! removed from the status database again, leaving the flow cell ready to be post-processed anew.

use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::bcl_convert::{BclConvertMetricsParser, MetricsError, QualityAveraging};
use crate::flow_cell::{FlowCellDirectory, FlowCellError};
use crate::housekeeper::{Housekeeper, HousekeeperError};
use crate::metrics::{
    combine_mapped_metrics_with_undetermined, create_sample_lane_metrics,
    create_undetermined_metrics_for_non_pooled_lanes, SequencingRunMetrics,
};
use crate::persistence::{
    add_run_files_to_housekeeper, add_sample_sheet_path_to_housekeeper, delete_flow_cell_data,
    store_fastq_files_in_housekeeper, store_flow_cell_data_in_status_db, PersistenceError,
};
use crate::sample_sheet::SampleSheet;
use crate::store::{StatusDb, StoreError};
use crate::utils::now;

/// No sample on the flow cell has any fastq file.
#[derive(Error, Debug)]
#[error("No fastq files found for any sample on flow cell {flow_cell_id}")]
pub struct MissingFilesError {
    pub flow_cell_id: String,
}

#[derive(Error, Debug)]
pub enum PostProcessingError {
    /// The flow cell is not ready to be post-processed.
    #[error(transparent)]
    NotReady(FlowCellError),

    #[error(transparent)]
    MissingFiles(#[from] MissingFilesError),

    /// Reading from or writing to the flow cell directory failed after validation.
    #[error(transparent)]
    FlowCell(#[from] FlowCellError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Housekeeper(#[from] HousekeeperError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Unable to list flow cell directories in {path:?}")]
    Io { source: std::io::Error, path: PathBuf },
}

impl PostProcessingError {
    /// True if the flow cell is not ready for post-processing, rather than post-processing
    /// having failed.
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::NotReady(_) | Self::MissingFiles(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PostProcessingConfig {
    /// Post-process flow cells that have already been delivered.
    pub force: bool,
    pub quality_averaging: QualityAveraging,
    /// Register the sample sheet found in the flow cell directory before validation.
    pub register_sample_sheet: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Skipped(String),
    Failed(String),
}

/// The result of post-processing one flow cell directory in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub flow_cell_name: String,
    pub status: RunStatus,
}

/// True if post-processing failed for any of the flow cells.
pub fn any_failed(outcomes: &[RunOutcome]) -> bool {
    outcomes.iter().any(|o| matches!(o.status, RunStatus::Failed(_)))
}

pub struct PostProcessor<'a, S: StatusDb, H: Housekeeper> {
    store: &'a mut S,
    housekeeper: &'a mut H,
    config: PostProcessingConfig,
}

impl<'a, S: StatusDb, H: Housekeeper> PostProcessor<'a, S, H> {
    pub fn new(store: &'a mut S, housekeeper: &'a mut H, config: PostProcessingConfig) -> Self {
        Self { store, housekeeper, config }
    }

    /// Post-processes every flow cell directory below `flow_cells_dir`.
    ///
    /// A failure for one flow cell is logged and does not stop the others. Directories whose
    /// name is not a flow cell name are ignored.
    pub fn post_process_all<P: AsRef<Path>>(
        &mut self,
        flow_cells_dir: P,
    ) -> Result<Vec<RunOutcome>, PostProcessingError> {
        let root = flow_cells_dir.as_ref();
        let io_error = |e| PostProcessingError::Io { source: e, path: root.to_path_buf() };
        let mut dirs: Vec<PathBuf> = std::fs::read_dir(root)
            .map_err(io_error)?
            .map(|res| res.map(|e| e.path()))
            .collect::<Result<_, _>>()
            .map_err(io_error)?;
        dirs.retain(|p| p.is_dir());
        dirs.sort();

        let mut outcomes = vec![];
        for dir in dirs {
            let flow_cell_name =
                dir.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
            if let Err(e) = FlowCellDirectory::new(&dir) {
                debug!("Ignoring {:?}: {}", dir, e);
                continue;
            }
            let status = match self.post_process_flow_cell(&dir) {
                Ok(()) => RunStatus::Completed,
                Err(e) if e.is_skip() => {
                    warn!("Skipping flow cell {}: {}", flow_cell_name, e);
                    RunStatus::Skipped(e.to_string())
                }
                Err(e) => {
                    let message = format!("{:#}", anyhow::Error::new(e));
                    error!("Post-processing of flow cell {} failed: {}", flow_cell_name, message);
                    RunStatus::Failed(message)
                }
            };
            outcomes.push(RunOutcome { flow_cell_name, status });
        }
        Ok(outcomes)
    }

    /// Post-processes the flow cell in the directory `flow_cell_dir`.
    pub fn post_process_flow_cell<P: AsRef<Path>>(
        &mut self,
        flow_cell_dir: P,
    ) -> Result<(), PostProcessingError> {
        let flow_cell =
            FlowCellDirectory::new(flow_cell_dir).map_err(PostProcessingError::NotReady)?;
        info!("Post-processing flow cell {}", flow_cell.full_name);

        if self.config.register_sample_sheet && flow_cell.sample_sheet_path().exists() {
            add_sample_sheet_path_to_housekeeper(self.housekeeper, &flow_cell)?;
        }
        let sample_sheet = self.validate(&flow_cell)?;

        if let Err(e) = self.store_flow_cell(&flow_cell, &sample_sheet) {
            self.store.rollback();
            return Err(e);
        }
        flow_cell.create_delivery_marker()?;
        info!("Finished post-processing flow cell {}", flow_cell.full_name);
        Ok(())
    }

    /// Checks that the flow cell is ready to be post-processed and returns its sample sheet.
    fn validate(&self, flow_cell: &FlowCellDirectory) -> Result<SampleSheet, PostProcessingError> {
        use crate::post_processing::PostProcessingError::NotReady;

        let flow_cell_id = flow_cell.id.clone();
        let sample_sheet_path =
            self.housekeeper.get_sample_sheet_path(&flow_cell.id).ok_or_else(|| {
                NotReady(FlowCellError::SampleSheetNotRegistered {
                    flow_cell_id: flow_cell_id.clone(),
                })
            })?;
        if !sample_sheet_path.exists() {
            let path = sample_sheet_path;
            return Err(NotReady(FlowCellError::SampleSheetMissing { flow_cell_id, path }));
        }
        if !flow_cell.is_demultiplexing_complete() {
            return Err(NotReady(FlowCellError::NotDemultiplexed { flow_cell_id }));
        }
        if flow_cell.is_delivered() && !self.config.force {
            return Err(NotReady(FlowCellError::AlreadyDelivered { flow_cell_id }));
        }
        let sample_sheet = SampleSheet::from_path(&sample_sheet_path).map_err(|e| {
            NotReady(FlowCellError::SampleSheet { source: e, flow_cell_id: flow_cell_id.clone() })
        })?;

        let fastqs = flow_cell.fastq_files().map_err(NotReady)?;
        let (with_files, without_files): (Vec<String>, Vec<String>) = sample_sheet
            .sample_internal_ids()
            .into_iter()
            .partition(|id| fastqs.iter().any(|f| &f.sample == id));
        if with_files.is_empty() {
            return Err(MissingFilesError { flow_cell_id }.into());
        }
        for sample_id in without_files {
            warn!("No fastq files found for sample {} on flow cell {}", sample_id, flow_cell_id);
        }
        Ok(sample_sheet)
    }

    fn store_flow_cell(
        &mut self,
        flow_cell: &FlowCellDirectory,
        sample_sheet: &SampleSheet,
    ) -> Result<(), PostProcessingError> {
        let parser = BclConvertMetricsParser::from_run_dir(&flow_cell.path)?
            .with_averaging(self.config.quality_averaging);
        let created_at = now();
        let mapped = create_sample_lane_metrics(&parser, created_at)?;
        let undetermined = create_undetermined_metrics_for_non_pooled_lanes(
            &parser,
            &sample_sheet.non_pooled_lanes_and_samples(),
            created_at,
        )?;
        let sample_metrics = combine_mapped_metrics_with_undetermined(mapped, undetermined);
        let run_metrics = SequencingRunMetrics::new(flow_cell, &parser)?;

        let report = delete_flow_cell_data(self.store, self.housekeeper, &flow_cell.id);
        if !report.is_complete() {
            warn!(
                "Stale data of flow cell {} was only partly removed: {:?}",
                flow_cell.id, report.errors
            );
        }

        store_flow_cell_data_in_status_db(self.store, flow_cell, run_metrics, sample_metrics)?;

        if let Err(e) = self.store_files_in_housekeeper(flow_cell, sample_sheet) {
            error!(
                "Registering files of flow cell {} failed, removing it from the status database",
                flow_cell.id
            );
            let removed =
                self.store.delete_flow_cell(&flow_cell.id).and_then(|_| self.store.commit());
            if let Err(delete_error) = removed {
                self.store.rollback();
                error!(
                    "Could not remove flow cell {} from the status database: {}",
                    flow_cell.id, delete_error
                );
            }
            return Err(e);
        }
        Ok(())
    }

    fn store_files_in_housekeeper(
        &mut self,
        flow_cell: &FlowCellDirectory,
        sample_sheet: &SampleSheet,
    ) -> Result<(), PostProcessingError> {
        add_sample_sheet_path_to_housekeeper(self.housekeeper, flow_cell)?;
        add_run_files_to_housekeeper(self.housekeeper, flow_cell)?;
        store_fastq_files_in_housekeeper(self.store, self.housekeeper, flow_cell, sample_sheet)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use matches::assert_matches;
    use tempfile::tempdir;

    use super::*;
    use crate::flow_cell::{DELIVERY_FILE_NAME, DEMUX_COMPLETE_FILE_NAME, DRAGEN_REPLAY_FILE_NAME};
    use crate::housekeeper::InMemoryHousekeeper;
    use crate::store::{InMemoryStatusDb, Sample};
    use crate::utils::test_commons::{
        create_flow_cell_dir, create_named_flow_cell_dir, FailingHousekeeper, FailingStatusDb,
        LaneMetricsDef, FLOW_CELL_ID,
    };

    const FORCE: PostProcessingConfig = PostProcessingConfig {
        force: true,
        quality_averaging: QualityAveraging::YieldWeighted,
        register_sample_sheet: false,
    };

    fn defs() -> Vec<LaneMetricsDef<'static>> {
        vec![
            LaneMetricsDef::new("ACC11927A2", 1, 15_962_796, 0.94),
            LaneMetricsDef::new("ACC11927A2", 2, 15_962_796, 0.93),
            LaneMetricsDef::new("Undetermined", 1, 10_000, 0.5),
            LaneMetricsDef::new("Undetermined", 2, 10_000, 0.5),
        ]
    }

    fn store() -> InMemoryStatusDb {
        let mut store = InMemoryStatusDb::new();
        store.add_sample(Sample::new("ACC11927A2", "sample")).unwrap();
        store.add_sample(Sample::new("ACC11927A5", "other")).unwrap();
        store.commit().unwrap();
        store
    }

    fn register_sample_sheet(hk: &mut impl Housekeeper, flow_cell_dir: &Path) {
        let flow_cell = FlowCellDirectory::new(flow_cell_dir).unwrap();
        add_sample_sheet_path_to_housekeeper(hk, &flow_cell).unwrap();
    }

    fn post_process<S: StatusDb, H: Housekeeper>(
        store: &mut S,
        hk: &mut H,
        config: PostProcessingConfig,
        path: &Path,
    ) -> Result<(), PostProcessingError> {
        PostProcessor::new(store, hk, config).post_process_flow_cell(path)
    }

    #[test]
    fn test_post_process_flow_cell() {
        let dir = tempdir().unwrap();
        let path = create_flow_cell_dir(dir.path(), &defs());
        let mut store = store();
        let mut hk = InMemoryHousekeeper::new();
        register_sample_sheet(&mut hk, &path);

        post_process(&mut store, &mut hk, PostProcessingConfig::default(), &path).unwrap();

        assert!(path.join(DELIVERY_FILE_NAME).exists());
        assert!(store.get_flow_cell_by_internal_id(FLOW_CELL_ID).is_some());
        let metrics = store.get_sample_lane_metrics_by_flow_cell(FLOW_CELL_ID);
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].metrics.total_reads_in_lane, 31_925_592 + 20_000);
        assert_eq!(
            store.get_sample_by_internal_id("ACC11927A2").unwrap().reads,
            2 * (31_925_592 + 20_000)
        );
        // sample and undetermined fastqs of both lanes
        assert_eq!(hk.files(&["fastq", FLOW_CELL_ID]).len(), 8);
        assert_eq!(hk.files(&["demux-metrics", FLOW_CELL_ID]).len(), 3);
        let run = &store.get_sequencing_runs_by_flow_cell(FLOW_CELL_ID)[0];
        assert_eq!(run.metrics.aggregates.total_reads, 2 * 31_925_592 + 40_000);
    }

    #[test]
    fn test_reprocessing_replaces_data() {
        let dir = tempdir().unwrap();
        let path = create_flow_cell_dir(dir.path(), &defs());
        let mut store = store();
        let mut hk = InMemoryHousekeeper::new();
        register_sample_sheet(&mut hk, &path);

        post_process(&mut store, &mut hk, FORCE, &path).unwrap();
        post_process(&mut store, &mut hk, FORCE, &path).unwrap();

        assert_eq!(store.get_sequencing_runs_by_flow_cell(FLOW_CELL_ID).len(), 1);
        assert_eq!(store.get_sample_lane_metrics_by_flow_cell(FLOW_CELL_ID).len(), 2);
        assert_eq!(
            store.get_sample_by_internal_id("ACC11927A2").unwrap().reads,
            2 * (31_925_592 + 20_000)
        );
        assert_eq!(hk.files(&["fastq", FLOW_CELL_ID]).len(), 8);
        assert_eq!(hk.files(&["samplesheet", FLOW_CELL_ID]).len(), 1);
    }

    #[test]
    fn test_sample_sheet_not_registered() {
        let dir = tempdir().unwrap();
        let path = create_flow_cell_dir(dir.path(), &defs());
        let mut store = store();
        let mut hk = InMemoryHousekeeper::new();

        let result = post_process(&mut store, &mut hk, PostProcessingConfig::default(), &path);

        assert_matches!(
            result,
            Err(PostProcessingError::NotReady(FlowCellError::SampleSheetNotRegistered { .. }))
        );
        assert!(result.unwrap_err().is_skip());
        assert!(!path.join(DELIVERY_FILE_NAME).exists());
    }

    #[test]
    fn test_register_sample_sheet_from_flow_cell() {
        let dir = tempdir().unwrap();
        let path = create_flow_cell_dir(dir.path(), &defs());
        let mut store = store();
        let mut hk = InMemoryHousekeeper::new();
        let config =
            PostProcessingConfig { register_sample_sheet: true, ..PostProcessingConfig::default() };

        post_process(&mut store, &mut hk, config, &path).unwrap();

        assert!(hk.get_sample_sheet_path(FLOW_CELL_ID).is_some());
    }

    #[test]
    fn test_sample_sheet_missing_on_disk() {
        let dir = tempdir().unwrap();
        let path = create_flow_cell_dir(dir.path(), &defs());
        let mut store = store();
        let mut hk = InMemoryHousekeeper::new();
        register_sample_sheet(&mut hk, &path);
        std::fs::remove_file(path.join("SampleSheet.csv")).unwrap();

        let result = post_process(&mut store, &mut hk, PostProcessingConfig::default(), &path);

        assert_matches!(
            result,
            Err(PostProcessingError::NotReady(FlowCellError::SampleSheetMissing { .. }))
        );
    }

    #[test]
    fn test_not_demultiplexed() {
        let dir = tempdir().unwrap();
        let path = create_flow_cell_dir(dir.path(), &defs());
        std::fs::remove_file(path.join(DEMUX_COMPLETE_FILE_NAME)).unwrap();
        let mut store = store();
        let mut hk = InMemoryHousekeeper::new();
        register_sample_sheet(&mut hk, &path);

        let result = post_process(&mut store, &mut hk, PostProcessingConfig::default(), &path);

        assert_matches!(
            result,
            Err(PostProcessingError::NotReady(FlowCellError::NotDemultiplexed { .. }))
        );
        assert!(store.get_flow_cell_by_internal_id(FLOW_CELL_ID).is_none());
    }

    #[test]
    fn test_already_delivered() {
        let dir = tempdir().unwrap();
        let path = create_flow_cell_dir(dir.path(), &defs());
        std::fs::File::create(path.join(DELIVERY_FILE_NAME)).unwrap();
        let mut store = store();
        let mut hk = InMemoryHousekeeper::new();
        register_sample_sheet(&mut hk, &path);

        let result = post_process(&mut store, &mut hk, PostProcessingConfig::default(), &path);
        assert_matches!(
            result,
            Err(PostProcessingError::NotReady(FlowCellError::AlreadyDelivered { .. }))
        );

        post_process(&mut store, &mut hk, FORCE, &path).unwrap();
        assert!(store.get_flow_cell_by_internal_id(FLOW_CELL_ID).is_some());
    }

    #[test]
    fn test_invalid_sample_sheet() {
        let dir = tempdir().unwrap();
        let path = create_flow_cell_dir(dir.path(), &defs());
        let mut store = store();
        let mut hk = InMemoryHousekeeper::new();
        register_sample_sheet(&mut hk, &path);
        std::fs::write(path.join("SampleSheet.csv"), "[Header]\nFileFormatVersion,2\n").unwrap();

        let result = post_process(&mut store, &mut hk, PostProcessingConfig::default(), &path);

        assert_matches!(
            result,
            Err(PostProcessingError::NotReady(FlowCellError::SampleSheet { .. }))
        );
    }

    #[test]
    fn test_no_fastq_files() {
        let dir = tempdir().unwrap();
        let path = create_flow_cell_dir(dir.path(), &defs());
        std::fs::remove_dir_all(path.join("Unaligned")).unwrap();
        let mut store = store();
        let mut hk = InMemoryHousekeeper::new();
        register_sample_sheet(&mut hk, &path);

        let result = post_process(&mut store, &mut hk, PostProcessingConfig::default(), &path);

        assert_matches!(result, Err(PostProcessingError::MissingFiles(_)));
        assert!(result.unwrap_err().is_skip());
    }

    #[test]
    fn test_unknown_sample_fails_and_rolls_back() {
        let dir = tempdir().unwrap();
        let path = create_flow_cell_dir(dir.path(), &defs());
        let mut store = InMemoryStatusDb::new();
        let mut hk = InMemoryHousekeeper::new();
        register_sample_sheet(&mut hk, &path);

        let result = post_process(&mut store, &mut hk, PostProcessingConfig::default(), &path);

        assert_matches!(result, Err(PostProcessingError::Store(StoreError::EntryNotFound { .. })));
        assert!(!result.unwrap_err().is_skip());
        assert!(store.get_flow_cell_by_internal_id(FLOW_CELL_ID).is_none());
        assert!(hk.files(&["fastq", FLOW_CELL_ID]).is_empty());
        assert!(!path.join(DELIVERY_FILE_NAME).exists());
    }

    #[test]
    fn test_malformed_dragen_replay_fails_and_keeps_stored_data() {
        let dir = tempdir().unwrap();
        let path = create_flow_cell_dir(dir.path(), &defs());
        let mut store = store();
        let mut hk = InMemoryHousekeeper::new();
        register_sample_sheet(&mut hk, &path);
        post_process(&mut store, &mut hk, PostProcessingConfig::default(), &path).unwrap();
        std::fs::write(path.join(DRAGEN_REPLAY_FILE_NAME), "{\"system\": {").unwrap();

        let outcomes =
            PostProcessor::new(&mut store, &mut hk, FORCE).post_process_all(dir.path()).unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_matches!(outcomes[0].status, RunStatus::Failed(_));
        assert!(any_failed(&outcomes));
        // the data of the earlier post-processing is untouched
        assert!(store.get_flow_cell_by_internal_id(FLOW_CELL_ID).is_some());
        assert_eq!(store.get_sample_lane_metrics_by_flow_cell(FLOW_CELL_ID).len(), 2);
        assert_eq!(hk.files(&["fastq", FLOW_CELL_ID]).len(), 8);
    }

    #[test]
    fn test_delivery_marker_failure_is_not_a_skip() {
        let dir = tempdir().unwrap();
        let path = create_flow_cell_dir(dir.path(), &defs());
        std::fs::create_dir(path.join(DELIVERY_FILE_NAME)).unwrap();
        let mut store = store();
        let mut hk = InMemoryHousekeeper::new();
        register_sample_sheet(&mut hk, &path);

        let result = post_process(&mut store, &mut hk, FORCE, &path);

        assert_matches!(result, Err(PostProcessingError::FlowCell(FlowCellError::Io { .. })));
        assert!(!result.unwrap_err().is_skip());
        assert!(store.get_flow_cell_by_internal_id(FLOW_CELL_ID).is_some());
    }

    #[test]
    fn test_housekeeper_failure_removes_flow_cell_from_status_db() {
        let dir = tempdir().unwrap();
        let path = create_flow_cell_dir(dir.path(), &defs());
        let mut store = store();
        let mut hk = FailingHousekeeper::default();
        register_sample_sheet(&mut hk, &path);
        hk.fail_on_add = true;

        let result = post_process(&mut store, &mut hk, PostProcessingConfig::default(), &path);

        assert_matches!(result, Err(PostProcessingError::Housekeeper(_)));
        assert!(store.get_flow_cell_by_internal_id(FLOW_CELL_ID).is_none());
        assert!(store.get_sample_lane_metrics_by_flow_cell(FLOW_CELL_ID).is_empty());
        let sample = store.get_sample_by_internal_id("ACC11927A2").unwrap();
        assert_eq!(sample.reads, 0);
        assert_eq!(sample.last_sequenced_at, None);
        assert!(!path.join(DELIVERY_FILE_NAME).exists());
    }

    #[test]
    fn test_housekeeper_failure_when_status_db_cannot_remove_flow_cell() {
        let dir = tempdir().unwrap();
        let path = create_flow_cell_dir(dir.path(), &defs());
        let mut store =
            FailingStatusDb { inner: store(), fail_on_delete: true, fail_on_commit: false };
        let mut hk = FailingHousekeeper::default();
        register_sample_sheet(&mut hk, &path);
        hk.fail_on_add = true;

        let result = post_process(&mut store, &mut hk, PostProcessingConfig::default(), &path);

        assert_matches!(result, Err(PostProcessingError::Housekeeper(_)));
        assert!(store.get_flow_cell_by_internal_id(FLOW_CELL_ID).is_some());
        assert!(!path.join(DELIVERY_FILE_NAME).exists());

        // the flow cell left behind is replaced once both stores work again
        store.fail_on_delete = false;
        hk.fail_on_add = false;
        post_process(&mut store, &mut hk, PostProcessingConfig::default(), &path).unwrap();
        assert_eq!(store.get_sequencing_runs_by_flow_cell(FLOW_CELL_ID).len(), 1);
        assert_eq!(hk.files(&["fastq", FLOW_CELL_ID]).len(), 8);
    }

    #[test]
    fn test_commit_failure_fails_without_storing() {
        let dir = tempdir().unwrap();
        let path = create_flow_cell_dir(dir.path(), &defs());
        let mut store =
            FailingStatusDb { inner: store(), fail_on_delete: false, fail_on_commit: true };
        let mut hk = InMemoryHousekeeper::new();
        register_sample_sheet(&mut hk, &path);

        let result = post_process(&mut store, &mut hk, PostProcessingConfig::default(), &path);

        assert_matches!(result, Err(PostProcessingError::Store(StoreError::Io { .. })));
        assert!(!result.unwrap_err().is_skip());
        assert!(store.get_flow_cell_by_internal_id(FLOW_CELL_ID).is_none());
        assert!(hk.files(&["fastq", FLOW_CELL_ID]).is_empty());
        assert!(!path.join(DELIVERY_FILE_NAME).exists());
    }

    #[test]
    fn test_post_process_all() {
        let dir = tempdir().unwrap();
        let good = create_flow_cell_dir(dir.path(), &defs());
        let not_demultiplexed = create_named_flow_cell_dir(
            dir.path(),
            "230913_A00187_1006_BHJKLMDSX7",
            &[LaneMetricsDef::new("ACC11927A5", 1, 1_000, 0.9)],
        );
        std::fs::remove_file(not_demultiplexed.join(DEMUX_COMPLETE_FILE_NAME)).unwrap();
        let unknown_sample = create_named_flow_cell_dir(
            dir.path(),
            "230914_LH00188_0034_AHMNOPDSX7",
            &[LaneMetricsDef::new("ACC99999A9", 1, 1_000, 0.9)],
        );
        std::fs::create_dir_all(dir.path().join("logs")).unwrap();
        std::fs::File::create(dir.path().join("230915_A00187_1007_AHQRSTDSX7.tar")).unwrap();

        let mut store = store();
        let mut hk = InMemoryHousekeeper::new();
        for path in [&good, &not_demultiplexed, &unknown_sample] {
            register_sample_sheet(&mut hk, path);
        }

        let outcomes = PostProcessor::new(&mut store, &mut hk, PostProcessingConfig::default())
            .post_process_all(dir.path())
            .unwrap();

        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[0].flow_cell_name, "230912_A00187_1005_AHGYFLDSX7");
        assert_eq!(outcomes[0].status, RunStatus::Completed);
        assert_eq!(outcomes[1].flow_cell_name, "230913_A00187_1006_BHJKLMDSX7");
        assert_matches!(outcomes[1].status, RunStatus::Skipped(_));
        assert_eq!(outcomes[2].flow_cell_name, "230914_LH00188_0034_AHMNOPDSX7");
        assert_matches!(outcomes[2].status, RunStatus::Failed(_));
        assert!(any_failed(&outcomes));
        assert!(!any_failed(&outcomes[..2]));
        assert!(store.get_flow_cell_by_internal_id(FLOW_CELL_ID).is_some());
        assert!(store.get_flow_cell_by_internal_id("HMNOPDSX7").is_none());
    }

    #[test]
    fn test_post_process_all_missing_root() {
        let dir = tempdir().unwrap();
        let mut store = store();
        let mut hk = InMemoryHousekeeper::new();
        let result = PostProcessor::new(&mut store, &mut hk, PostProcessingConfig::default())
            .post_process_all(dir.path().join("missing"));
        assert_matches!(result, Err(PostProcessingError::Io { .. }));
    }
}
