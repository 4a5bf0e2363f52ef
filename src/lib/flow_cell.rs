//! A demultiplexed flow cell run directory and the marker files within it.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::sample_sheet::SampleSheetError;
use crate::sequencer::Sequencer;
use crate::utils::{find_file_by_name, DemuxedFastq};

pub const DEMUX_STARTED_FILE_NAME: &str = "demuxstarted.txt";
pub const DEMUX_COMPLETE_FILE_NAME: &str = "demuxcomplete.txt";
pub const DELIVERY_FILE_NAME: &str = "delivery.txt";
pub const COPY_COMPLETE_FILE_NAME: &str = "CopyComplete.txt";
pub const SAMPLE_SHEET_FILE_NAME: &str = "SampleSheet.csv";
pub const RUN_PARAMETERS_FILE_NAME: &str = "RunParameters.xml";
pub const DRAGEN_REPLAY_FILE_NAME: &str = "dragen-replay.json";

lazy_static! {
    /// <YYMMDD>_<instrument>_<run number>_<position><flow cell id>,
    /// e.g. 230912_A00187_1005_AHGYFLDSX7
    static ref FLOW_CELL_NAME_REGEX: Regex =
        Regex::new(r"^(\d{6})_([A-Za-z0-9-]+)_(\d+)_([AB])([A-Za-z0-9]+)$").unwrap();
}

/// The errors that make a flow cell directory unfit for post-processing.
#[derive(Error, Debug)]
pub enum FlowCellError {
    #[error("{name} is not a flow cell directory name")]
    InvalidName { name: String },

    #[error("Unknown sequencer for instrument {instrument}")]
    UnknownSequencer { instrument: String },

    #[error("No sample sheet registered in Housekeeper for flow cell {flow_cell_id}")]
    SampleSheetNotRegistered { flow_cell_id: String },

    #[error("The sample sheet of flow cell {flow_cell_id} does not exist: {path:?}")]
    SampleSheetMissing { flow_cell_id: String, path: PathBuf },

    #[error("Flow cell {flow_cell_id} has not finished demultiplexing")]
    NotDemultiplexed { flow_cell_id: String },

    #[error("Flow cell {flow_cell_id} has already been delivered")]
    AlreadyDelivered { flow_cell_id: String },

    #[error("Invalid sample sheet for flow cell {flow_cell_id}: {source}")]
    SampleSheet { source: SampleSheetError, flow_cell_id: String },

    #[error("Unable to parse {path:?}: {source}")]
    DragenReplay { source: serde_json::Error, path: PathBuf },

    #[error("Io error occurred for {path:?}")]
    Io { source: io::Error, path: PathBuf },
}

#[derive(Debug, Deserialize)]
struct DragenReplay {
    system: DragenSystem,
}

#[derive(Debug, Deserialize)]
struct DragenSystem {
    dragen_version: Option<String>,
}

/// A run directory written by the sequencer and filled in by demultiplexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowCellDirectory {
    pub path: PathBuf,
    /// The directory name, e.g. `230912_A00187_1005_AHGYFLDSX7`.
    pub full_name: String,
    pub run_date: NaiveDate,
    /// The instrument serial, e.g. `A00187`.
    pub machine_name: String,
    pub run_number: u32,
    /// The flow cell slot, `A` or `B`.
    pub position: char,
    /// The flow cell id, e.g. `HGYFLDSX7`.
    pub id: String,
    pub sequencer_type: Sequencer,
}

/// The modification time of `path`, if it exists.
fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok().map(DateTime::<Utc>::from)
}

impl FlowCellDirectory {
    /// Parse the flow cell information from the name of the directory at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, FlowCellError> {
        let path = path.as_ref();
        let full_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| FlowCellError::InvalidName {
                name: path.to_string_lossy().to_string(),
            })?;
        let invalid = || FlowCellError::InvalidName { name: full_name.clone() };

        let captures = FLOW_CELL_NAME_REGEX.captures(&full_name).ok_or_else(invalid)?;
        let run_date = NaiveDate::parse_from_str(&captures[1], "%y%m%d").map_err(|_| invalid())?;
        let machine_name = captures[2].to_string();
        let run_number = captures[3].parse().map_err(|_| invalid())?;
        let position = captures[4].chars().next().ok_or_else(invalid)?;
        let id = captures[5].to_string();
        let sequencer_type = Sequencer::from_instrument_id(&machine_name)
            .ok_or_else(|| FlowCellError::UnknownSequencer { instrument: machine_name.clone() })?;

        Ok(Self {
            path: path.to_path_buf(),
            full_name: full_name.clone(),
            run_date,
            machine_name,
            run_number,
            position,
            id,
            sequencer_type,
        })
    }

    pub fn sample_sheet_path(&self) -> PathBuf {
        self.path.join(SAMPLE_SHEET_FILE_NAME)
    }

    pub fn delivery_marker_path(&self) -> PathBuf {
        self.path.join(DELIVERY_FILE_NAME)
    }

    pub fn is_demultiplexing_complete(&self) -> bool {
        self.path.join(DEMUX_COMPLETE_FILE_NAME).exists()
    }

    pub fn is_delivered(&self) -> bool {
        self.delivery_marker_path().exists()
    }

    /// The run date at midnight UTC.
    pub fn sequencing_started_at(&self) -> Option<DateTime<Utc>> {
        self.run_date.and_hms_opt(0, 0, 0).map(|dt| Utc.from_utc_datetime(&dt))
    }

    pub fn sequencing_completed_at(&self) -> Option<DateTime<Utc>> {
        modified_at(&self.path.join(COPY_COMPLETE_FILE_NAME))
    }

    pub fn demultiplexing_started_at(&self) -> Option<DateTime<Utc>> {
        modified_at(&self.path.join(DEMUX_STARTED_FILE_NAME))
    }

    pub fn demultiplexing_completed_at(&self) -> Option<DateTime<Utc>> {
        modified_at(&self.path.join(DEMUX_COMPLETE_FILE_NAME))
    }

    fn find(&self, file_name: &str) -> Result<Option<PathBuf>, FlowCellError> {
        find_file_by_name(&self.path, file_name)
            .map_err(|e| FlowCellError::Io { source: e, path: self.path.clone() })
    }

    /// The DRAGEN version from `dragen-replay.json`, if that file is present.
    pub fn demux_software_version(&self) -> Result<Option<String>, FlowCellError> {
        let path = match self.find(DRAGEN_REPLAY_FILE_NAME)? {
            Some(path) => path,
            None => {
                warn!("No {} found for flow cell {}", DRAGEN_REPLAY_FILE_NAME, self.id);
                return Ok(None);
            }
        };
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| FlowCellError::Io { source: e, path: path.clone() })?;
        let replay: DragenReplay = serde_json::from_str(&contents)
            .map_err(|e| FlowCellError::DragenReplay { source: e, path })?;
        Ok(replay.system.dragen_version)
    }

    /// The `RunParameters.xml` written by the sequencer, if present.
    pub fn run_parameters_path(&self) -> Result<Option<PathBuf>, FlowCellError> {
        self.find(RUN_PARAMETERS_FILE_NAME)
    }

    /// All Illumina-named fastq files below the run directory.
    pub fn fastq_files(&self) -> Result<Vec<DemuxedFastq>, FlowCellError> {
        DemuxedFastq::slurp(&self.path)
            .map_err(|e| FlowCellError::Io { source: e, path: self.path.clone() })
    }

    /// Marks the flow cell as ready for delivery downstream.
    pub fn create_delivery_marker(&self) -> Result<(), FlowCellError> {
        let path = self.delivery_marker_path();
        std::fs::File::create(&path)
            .map_err(|e| FlowCellError::Io { source: e, path: path.clone() })?;
        Ok(())
    }
}
