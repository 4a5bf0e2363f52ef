#![forbid(unsafe_code)]

use std::path::PathBuf;

use clap::Parser;
use env_logger::Env;

use crate::bcl_convert::QualityAveraging;
use crate::post_processing::PostProcessingConfig;
use crate::utils::VERSION;

pub static TOOL_NAME: &str = "cg";

pub static DOC_LINK_AND_SUPPORT_EMAIL: &str = "
For support please contact the clinical genomics production team.
";

static SHORT_USAGE: &str = "Post-processes demultiplexed Illumina flow cells.";

static LONG_USAGE: &str = "
Post-processes demultiplexed Illumina flow cells.

For a flow cell directory with a completed BCL Convert demultiplexing, the sequencing and
demultiplexing metrics are parsed from `Demultiplex_Stats.csv`, `Quality_Metrics.csv` and
`Adapter_Metrics.csv`, stored in the status database per sample and lane, and the fastq files of
samples passing the Q30 threshold of the sequencer are registered in Housekeeper.  A
`delivery.txt` marker is written once the flow cell has been stored.

A flow cell is only post-processed when its sample sheet is registered in Housekeeper,
`demuxcomplete.txt` exists and it has not been delivered before (see `--force`).  Data stored
by an earlier post-processing of the same flow cell is replaced.

Without `--flow-cell-name` every flow cell directory below `--flow-cells-dir` is post-processed.

Example invocation:

cg \\
  --flow-cells-dir /home/proj/flow_cells/ \\
  --flow-cell-name 230912_A00187_1005_AHGYFLDSX7 \\
  --status-db status_db.json \\
  --housekeeper-db housekeeper.json
";

#[derive(Parser, Debug, Clone)]
#[clap(name = TOOL_NAME, version = VERSION, about=SHORT_USAGE, long_about=LONG_USAGE, term_width=0)]
pub struct Opts {
    /// The directory holding the demultiplexed flow cell directories.
    #[clap(long, short = 'd', display_order = 1)]
    pub flow_cells_dir: PathBuf,

    /// The name of the flow cell directory to post-process, e.g. 230912_A00187_1005_AHGYFLDSX7.
    ///
    /// [default: all flow cells in --flow-cells-dir]
    #[clap(long, short = 'n', display_order = 2)]
    pub flow_cell_name: Option<String>,

    /// Path to the status database snapshot.
    ///
    /// The snapshot is created if it does not exist.  Without it, an empty status database is
    /// used and nothing is persisted.
    #[clap(long, display_order = 3)]
    pub status_db: Option<PathBuf>,

    /// Path to the Housekeeper snapshot.
    ///
    /// The snapshot is created if it does not exist.  Without it, an empty Housekeeper is used
    /// and nothing is persisted.
    #[clap(long, display_order = 4)]
    pub housekeeper_db: Option<PathBuf>,

    /// Post-process flow cells that have already been delivered.
    #[clap(long, short = 'f', display_order = 11)]
    pub force: bool,

    /// How the per-read quality metrics are combined for a sample in a lane.
    ///
    /// `fixed-divisor` divides the summed per-read values by two, `yield-weighted` weights each
    /// read by its yield.
    #[clap(
        long,
        short = 'q',
        default_value = "yield-weighted",
        possible_values = QualityAveraging::possible_values(),
        display_order = 11
    )]
    pub quality_averaging: QualityAveraging,

    /// Register the `SampleSheet.csv` found in the flow cell directory in Housekeeper before
    /// post-processing.
    #[clap(long, short = 's', display_order = 11)]
    pub register_sample_sheet: bool,
}

impl Opts {
    /// Extract a [`PostProcessingConfig`] from the CLI opts.
    pub fn as_post_processing_config(&self) -> PostProcessingConfig {
        PostProcessingConfig {
            force: self.force,
            quality_averaging: self.quality_averaging,
            register_sample_sheet: self.register_sample_sheet,
        }
    }

    /// The directory of the single flow cell to post-process, if one was named.
    pub fn flow_cell_dir(&self) -> Option<PathBuf> {
        self.flow_cell_name.as_ref().map(|name| self.flow_cells_dir.join(name))
    }
}

/// Implement defaults that match the CLI options to allow for easier testing.
///
/// Note that these defaults exist only within test code.
#[cfg(test)]
impl Default for Opts {
    fn default() -> Self {
        Self {
            flow_cells_dir: PathBuf::default(),
            flow_cell_name: None,
            status_db: None,
            housekeeper_db: None,
            force: false,
            quality_averaging: QualityAveraging::YieldWeighted,
            register_sample_sheet: false,
        }
    }
}

/// Parse args and set up logging / tracing
pub fn setup() -> Opts {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    Opts::parse()
}
