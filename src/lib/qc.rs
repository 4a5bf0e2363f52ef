//! The quality gate deciding which fastq files are tracked in Housekeeper.

use log::{debug, warn};

use crate::metrics::SampleLaneMetrics;
use crate::sequencer::Sequencer;

/// Returns true if the fastq files of a sample in a lane should be tracked.
///
/// Files are only tracked if metrics have been stored for the sample and lane. Negative controls
/// are tracked as soon as they hold any reads, other samples when the percentage of Q30 bases
/// reaches the threshold of the sequencer.
pub fn is_trackable(
    metrics: Option<&SampleLaneMetrics>,
    is_negative_control: bool,
    sequencer: Sequencer,
) -> bool {
    let metrics = match metrics {
        Some(metrics) => metrics,
        None => {
            warn!("No sample lane metrics stored, fastq files will not be tracked");
            return false;
        }
    };

    if is_negative_control && metrics.total_reads_in_lane > 0 {
        debug!(
            "Negative control {} has {} reads in lane {}",
            metrics.sample_id, metrics.total_reads_in_lane, metrics.flow_cell_lane
        );
        return true;
    }

    let passes = metrics.base_passing_q30_percent >= sequencer.q30_threshold();
    if !passes {
        warn!(
            "Sample {} has {}% Q30 bases in lane {}, below the threshold of {}% for {}",
            metrics.sample_id,
            metrics.base_passing_q30_percent,
            metrics.flow_cell_lane,
            sequencer.q30_threshold(),
            sequencer
        );
    }
    passes
}
