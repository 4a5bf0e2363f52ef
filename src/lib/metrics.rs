//! Functionality pertaining to the aggregation of demultiplexing metrics.
//!
//! For each sample in each lane a [`SampleLaneMetrics`] is created from the parsed BCL Convert
//! metrics. Lanes that hold a single sample ("non-pooled" lanes) have their undetermined reads
//! attributed to that sample: a second [`SampleLaneMetrics`] is built from the `Undetermined`
//! row of the lane and merged into the sample's own with [`SampleLaneMetrics::combine_with`].
//!
//! Totals over the whole flow cell are held in [`FlowCellAggregates`], which together with the
//! run directory information make up the [`SequencingRunMetrics`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::bcl_convert::{BclConvertMetricsParser, MetricsError, READ_PAIR_SCALING_FACTOR};
use crate::flow_cell::{FlowCellDirectory, FlowCellError};
use crate::sequencer::Sequencer;
use crate::utils::round2;

/// The sample name given to reads that could not be assigned to a sample.
pub const UNDETERMINED_SAMPLE_ID: &str = "Undetermined";

/// The name of the demultiplexing software producing the metrics.
pub const DEMULTIPLEXING_SOFTWARE: &str = "dragen";

/// Average of two values weighted by their totals, 0 if both totals are 0.
pub fn weighted_average(total_1: u64, value_1: f64, total_2: u64, value_2: f64) -> f64 {
    let total = total_1 + total_2;
    if total == 0 {
        return 0.0;
    }
    (total_1 as f64 * value_1 + total_2 as f64 * value_2) / total as f64
}

/// Percentage of `part` in `whole`, 0 if `whole` is 0.
fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// The demultiplexing metrics of one sample in one lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleLaneMetrics {
    pub sample_id: String,
    pub flow_cell_lane: usize,
    pub total_reads_in_lane: u64,
    /// Percentage (0-100) of bases with quality 30 or above.
    pub base_passing_q30_percent: f64,
    pub base_mean_quality_score: f64,
    #[serde(rename = "yield")]
    pub yield_: u64,
    pub yield_q30: u64,
    /// Percentage (0-100) of sample bases that are adapter.
    #[serde(default)]
    pub adapter_bases_percent: f64,
    pub created_at: DateTime<Utc>,
}

impl SampleLaneMetrics {
    /// Builds the metrics for `sample_id` from the parser rows of `source_id` in `lane`.
    ///
    /// `source_id` differs from `sample_id` when undetermined reads are attributed to a sample.
    /// The Q30 fraction reported by the parser is scaled to a percentage and rounded to 2
    /// decimals, as are the mean quality score and the adapter percentage.
    pub fn from_parser(
        parser: &BclConvertMetricsParser,
        source_id: &str,
        sample_id: &str,
        lane: usize,
        created_at: DateTime<Utc>,
    ) -> Result<Self, MetricsError> {
        Ok(Self {
            sample_id: sample_id.to_string(),
            flow_cell_lane: lane,
            total_reads_in_lane: parser.calculate_total_reads_for_sample_in_lane(source_id, lane)?,
            base_passing_q30_percent: round2(
                parser.get_q30_bases_percent_for_sample_in_lane(source_id, lane)? * 100.0,
            ),
            base_mean_quality_score: round2(
                parser.get_mean_quality_score_for_sample_in_lane(source_id, lane)?,
            ),
            yield_: parser.get_yield_for_sample_in_lane(source_id, lane)?,
            yield_q30: parser.get_yield_q30_for_sample_in_lane(source_id, lane)?,
            adapter_bases_percent: round2(
                parser.get_adapter_bases_percent_for_sample_in_lane(source_id, lane)?,
            ),
            created_at,
        })
    }

    /// Merge the metrics of the same sample and lane, e.g. mapped and undetermined reads.
    ///
    /// Reads and yield are summed. The percentages and the mean quality score are averaged,
    /// weighted by the reads in the lane.
    pub fn combine_with(&self, other: &SampleLaneMetrics) -> SampleLaneMetrics {
        let (reads_1, reads_2) = (self.total_reads_in_lane, other.total_reads_in_lane);
        let yield_ = self.yield_ + other.yield_;
        let yield_q30_percent = weighted_average(
            reads_1,
            percent(self.yield_q30, self.yield_),
            reads_2,
            percent(other.yield_q30, other.yield_),
        );
        SampleLaneMetrics {
            sample_id: self.sample_id.clone(),
            flow_cell_lane: self.flow_cell_lane,
            total_reads_in_lane: reads_1 + reads_2,
            base_passing_q30_percent: weighted_average(
                reads_1,
                self.base_passing_q30_percent,
                reads_2,
                other.base_passing_q30_percent,
            ),
            base_mean_quality_score: weighted_average(
                reads_1,
                self.base_mean_quality_score,
                reads_2,
                other.base_mean_quality_score,
            ),
            yield_,
            yield_q30: (yield_q30_percent / 100.0 * yield_ as f64).round() as u64,
            adapter_bases_percent: weighted_average(
                reads_1,
                self.adapter_bases_percent,
                reads_2,
                other.adapter_bases_percent,
            ),
            created_at: self.created_at,
        }
    }
}

/// One [`SampleLaneMetrics`] for every valid sample in every lane it was demultiplexed in.
pub fn create_sample_lane_metrics(
    parser: &BclConvertMetricsParser,
    created_at: DateTime<Utc>,
) -> Result<Vec<SampleLaneMetrics>, MetricsError> {
    let mut metrics = vec![];
    for sample_id in parser.get_sample_internal_ids() {
        for lane in parser.get_lanes_for_sample(&sample_id) {
            metrics.push(SampleLaneMetrics::from_parser(
                parser, &sample_id, &sample_id, lane, created_at,
            )?);
        }
    }
    Ok(metrics)
}

/// Metrics of the undetermined reads in non-pooled lanes, attributed to the lane's only sample.
///
/// `non_pooled_lanes_and_samples` holds `(lane, sample)` pairs; lanes without undetermined
/// reads are skipped.
pub fn create_undetermined_metrics_for_non_pooled_lanes(
    parser: &BclConvertMetricsParser,
    non_pooled_lanes_and_samples: &[(usize, String)],
    created_at: DateTime<Utc>,
) -> Result<Vec<SampleLaneMetrics>, MetricsError> {
    let mut metrics = vec![];
    for (lane, sample_id) in non_pooled_lanes_and_samples {
        if parser.has_undetermined_reads_in_lane(*lane) {
            debug!("Attributing undetermined reads in lane {} to {}", lane, sample_id);
            metrics.push(SampleLaneMetrics::from_parser(
                parser,
                UNDETERMINED_SAMPLE_ID,
                sample_id,
                *lane,
                created_at,
            )?);
        }
    }
    Ok(metrics)
}

/// Merges undetermined metrics into the mapped metrics of the same sample and lane.
///
/// Metrics without a counterpart are kept as they are. The result is sorted by sample and lane.
pub fn combine_mapped_metrics_with_undetermined(
    mapped: Vec<SampleLaneMetrics>,
    undetermined: Vec<SampleLaneMetrics>,
) -> Vec<SampleLaneMetrics> {
    let mut combined: BTreeMap<(String, usize), SampleLaneMetrics> = mapped
        .into_iter()
        .map(|m| ((m.sample_id.clone(), m.flow_cell_lane), m))
        .collect();
    for metric in undetermined {
        let key = (metric.sample_id.clone(), metric.flow_cell_lane);
        let merged = match combined.get(&key) {
            Some(existing) => existing.combine_with(&metric),
            None => metric,
        };
        combined.insert(key, merged);
    }
    combined.into_values().collect()
}

/// Totals over all samples and lanes of a flow cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FlowCellAggregates {
    /// Reads over all samples and lanes, undetermined included.
    pub total_reads: u64,
    pub total_undetermined_reads: u64,
    pub percent_undetermined_reads: f64,
    #[serde(rename = "yield")]
    pub yield_: u64,
    pub yield_q30: u64,
    /// Percentage (0-100) of the yield with quality 30 or above.
    pub percent_q30: f64,
    pub mean_quality_score: f64,
}

impl FlowCellAggregates {
    pub fn from_parser(parser: &BclConvertMetricsParser) -> Self {
        let total_reads: u64 = parser
            .demux_metrics()
            .iter()
            .map(|m| m.read_pair_count * READ_PAIR_SCALING_FACTOR)
            .sum();
        let total_undetermined_reads: u64 = parser
            .demux_metrics()
            .iter()
            .filter(|m| m.sample_internal_id == UNDETERMINED_SAMPLE_ID)
            .map(|m| m.read_pair_count * READ_PAIR_SCALING_FACTOR)
            .sum();
        let yield_: u64 = parser.quality_metrics().iter().map(|m| m.yield_).sum();
        let yield_q30: u64 = parser.quality_metrics().iter().map(|m| m.yield_q30).sum();
        let quality_score_sum: u64 =
            parser.quality_metrics().iter().map(|m| m.quality_score_sum).sum();
        let mean_quality_score =
            if yield_ == 0 { 0.0 } else { round2(quality_score_sum as f64 / yield_ as f64) };

        Self {
            total_reads,
            total_undetermined_reads,
            percent_undetermined_reads: round2(percent(total_undetermined_reads, total_reads)),
            yield_,
            yield_q30,
            percent_q30: round2(percent(yield_q30, yield_)),
            mean_quality_score,
        }
    }
}

/// The metrics of one demultiplexing of a flow cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencingRunMetrics {
    pub sequencer_type: Sequencer,
    pub sequencer_name: String,
    pub demultiplexing_software: String,
    pub demultiplexing_software_version: Option<String>,
    pub sequencing_started_at: Option<DateTime<Utc>>,
    pub sequencing_completed_at: Option<DateTime<Utc>>,
    pub demultiplexing_started_at: Option<DateTime<Utc>>,
    pub demultiplexing_completed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub aggregates: FlowCellAggregates,
}

impl SequencingRunMetrics {
    pub fn new(
        flow_cell: &FlowCellDirectory,
        parser: &BclConvertMetricsParser,
    ) -> Result<Self, FlowCellError> {
        Ok(Self {
            sequencer_type: flow_cell.sequencer_type,
            sequencer_name: flow_cell.machine_name.clone(),
            demultiplexing_software: DEMULTIPLEXING_SOFTWARE.to_string(),
            demultiplexing_software_version: flow_cell.demux_software_version()?,
            sequencing_started_at: flow_cell.sequencing_started_at(),
            sequencing_completed_at: flow_cell.sequencing_completed_at(),
            demultiplexing_started_at: flow_cell.demultiplexing_started_at(),
            demultiplexing_completed_at: flow_cell.demultiplexing_completed_at(),
            aggregates: FlowCellAggregates::from_parser(parser),
        })
    }
}

#[cfg(test)]
mod test {
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    use super::*;
    use crate::bcl_convert::BclConvertMetricsParser;
    use crate::utils::test_commons::{
        create_flow_cell_dir, write_metrics_files, LaneMetricsDef, DRAGEN_VERSION,
    };

    fn metric(sample_id: &str, lane: usize, reads: u64, q30: f64) -> SampleLaneMetrics {
        SampleLaneMetrics {
            sample_id: sample_id.to_string(),
            flow_cell_lane: lane,
            total_reads_in_lane: reads,
            base_passing_q30_percent: q30,
            base_mean_quality_score: 35.0,
            yield_: reads * 100,
            yield_q30: (reads as f64 * 100.0 * q30 / 100.0).round() as u64,
            adapter_bases_percent: q30 / 10.0,
            created_at: Utc.timestamp_opt(1_694_500_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_weighted_average_zero_totals() {
        assert!(weighted_average(0, 0.0, 0, 0.0).abs() < f64::EPSILON);
        assert!(weighted_average(0, 90.0, 0, 70.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_weighted_average() {
        assert!((weighted_average(100, 0.9, 100, 0.7) - 0.8).abs() < 1e-9);
        assert!((weighted_average(300, 90.0, 100, 70.0) - 85.0).abs() < 1e-9);
        assert!((weighted_average(0, 90.0, 100, 70.0) - 70.0).abs() < 1e-9);
    }

    #[test]
    fn test_combine_same_lane() {
        let mapped = metric("ACC1A1", 1, 100, 90.0);
        let undetermined = metric("ACC1A1", 1, 100, 70.0);

        let combined = mapped.combine_with(&undetermined);

        assert_eq!(combined.sample_id, "ACC1A1");
        assert_eq!(combined.flow_cell_lane, 1);
        assert_eq!(combined.total_reads_in_lane, 200);
        assert!((combined.base_passing_q30_percent - 80.0).abs() < 1e-9);
        assert!((combined.base_mean_quality_score - 35.0).abs() < 1e-9);
        assert_eq!(combined.yield_, 20_000);
        assert_eq!(combined.yield_q30, 16_000);
        assert!((combined.adapter_bases_percent - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_combine_zero_reads() {
        let combined = metric("ACC1A1", 1, 0, 90.0).combine_with(&metric("ACC1A1", 1, 0, 70.0));
        assert_eq!(combined.total_reads_in_lane, 0);
        assert!(combined.base_passing_q30_percent.abs() < f64::EPSILON);
        assert_eq!(combined.yield_q30, 0);
    }

    #[test]
    fn test_combine_mapped_with_undetermined() {
        let mapped = vec![metric("ACC1A1", 1, 100, 90.0), metric("ACC1A2", 2, 50, 95.0)];
        let undetermined = vec![metric("ACC1A1", 1, 100, 70.0), metric("ACC1A1", 2, 10, 60.0)];

        let combined = combine_mapped_metrics_with_undetermined(mapped, undetermined);

        assert_eq!(combined.len(), 3);
        assert_eq!((combined[0].sample_id.as_str(), combined[0].flow_cell_lane), ("ACC1A1", 1));
        assert_eq!(combined[0].total_reads_in_lane, 200);
        assert!((combined[0].base_passing_q30_percent - 80.0).abs() < 1e-9);
        // a different lane of the same sample is never merged
        assert_eq!((combined[1].sample_id.as_str(), combined[1].flow_cell_lane), ("ACC1A1", 2));
        assert_eq!(combined[1].total_reads_in_lane, 10);
        assert_eq!(combined[2], metric("ACC1A2", 2, 50, 95.0));
    }

    #[test]
    fn test_create_metrics_from_parser() {
        let dir = tempdir().unwrap();
        write_metrics_files(
            dir.path(),
            &[
                LaneMetricsDef::new("ACC11927A2", 1, 15_962_796, 0.93546),
                LaneMetricsDef::new("ACC11927A2", 2, 15_962_796, 0.91),
                LaneMetricsDef::new("ACC11927A5", 2, 1_000, 0.8),
                LaneMetricsDef::new("Undetermined", 1, 1_000, 0.5),
                LaneMetricsDef::new("Undetermined", 2, 1_000, 0.5),
            ],
        );
        let parser = BclConvertMetricsParser::from_run_dir(dir.path()).unwrap();
        let created_at = Utc.timestamp_opt(1_694_500_000, 0).unwrap();

        let mapped = create_sample_lane_metrics(&parser, created_at).unwrap();
        assert_eq!(mapped.len(), 3);
        assert_eq!(mapped[0].total_reads_in_lane, 31_925_592);
        assert!((mapped[0].base_passing_q30_percent - 93.55).abs() < 1e-9);
        assert!((mapped[0].base_mean_quality_score - 35.5).abs() < 1e-9);
        assert!((mapped[0].adapter_bases_percent - 1.0).abs() < 1e-9);

        let non_pooled = vec![(1, String::from("ACC11927A2"))];
        let undetermined =
            create_undetermined_metrics_for_non_pooled_lanes(&parser, &non_pooled, created_at)
                .unwrap();
        assert_eq!(undetermined.len(), 1);
        assert_eq!(undetermined[0].sample_id, "ACC11927A2");
        assert_eq!(undetermined[0].total_reads_in_lane, 2_000);

        let combined = combine_mapped_metrics_with_undetermined(mapped, undetermined);
        assert_eq!(combined.len(), 3);
        assert_eq!(combined[0].total_reads_in_lane, 31_927_592);
        assert_eq!(combined[1].total_reads_in_lane, 31_925_592);
        assert_eq!(combined[2].sample_id, "ACC11927A5");
    }

    #[test]
    fn test_flow_cell_aggregates() {
        let dir = tempdir().unwrap();
        write_metrics_files(
            dir.path(),
            &[
                LaneMetricsDef::new("ACC11927A2", 1, 300, 0.9),
                LaneMetricsDef::new("Undetermined", 1, 100, 0.5),
            ],
        );
        let parser = BclConvertMetricsParser::from_run_dir(dir.path()).unwrap();

        let aggregates = FlowCellAggregates::from_parser(&parser);

        assert_eq!(aggregates.total_reads, 800);
        assert_eq!(aggregates.total_undetermined_reads, 200);
        assert!((aggregates.percent_undetermined_reads - 25.0).abs() < 1e-9);
        assert_eq!(aggregates.yield_, 2 * 400 * 151);
        // yield weighted: (0.9 * 300 + 0.5 * 100) / 400
        assert!((aggregates.percent_q30 - 80.0).abs() < 0.01);
        assert!((aggregates.mean_quality_score - 35.5).abs() < 1e-9);
    }

    #[test]
    fn test_flow_cell_aggregates_empty() {
        let parser = BclConvertMetricsParser::new(vec![], vec![], vec![]).unwrap();
        assert_eq!(FlowCellAggregates::from_parser(&parser), FlowCellAggregates::default());
    }

    #[test]
    fn test_sequencing_run_metrics() {
        let dir = tempdir().unwrap();
        let path =
            create_flow_cell_dir(dir.path(), &[LaneMetricsDef::new("ACC11927A2", 1, 300, 0.9)]);
        let flow_cell = FlowCellDirectory::new(&path).unwrap();
        let parser = BclConvertMetricsParser::from_run_dir(&path).unwrap();

        let run_metrics = SequencingRunMetrics::new(&flow_cell, &parser).unwrap();

        assert_eq!(run_metrics.sequencer_type, Sequencer::NovaSeq);
        assert_eq!(run_metrics.sequencer_name, "A00187");
        assert_eq!(run_metrics.demultiplexing_software, "dragen");
        assert_eq!(run_metrics.demultiplexing_software_version, Some(DRAGEN_VERSION.to_string()));
        assert!(run_metrics.sequencing_started_at.is_some());
        assert!(run_metrics.sequencing_completed_at.is_some());
        assert!(run_metrics.demultiplexing_started_at.is_none());
        assert!(run_metrics.demultiplexing_completed_at.is_some());
        assert_eq!(run_metrics.aggregates.total_reads, 600);
    }
}
