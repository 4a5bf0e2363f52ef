//! Sequencer models and the Housekeeper tags used for sequencing files.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};

/// The Illumina sequencer models that produce flow cells handled by post-processing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Sequencer {
    HiSeqX,
    HiSeqGA,
    NovaSeq,
    NovaSeqX,
}

lazy_static! {
    /// Instrument serial patterns, as found in the run folder name, for each sequencer model.
    static ref INSTRUMENT_LOOKUP: Vec<(Regex, Sequencer)> = vec![
        (Regex::new(r"^A[0-9]{5}$").unwrap(), Sequencer::NovaSeq),
        (Regex::new(r"^LH[0-9]{5}$").unwrap(), Sequencer::NovaSeqX),
        (Regex::new(r"^(ST-)?E[0-9]{5}$").unwrap(), Sequencer::HiSeqX),
        (Regex::new(r"^(HWI-)?D[0-9]{5}$").unwrap(), Sequencer::HiSeqGA),
    ];
}

impl Sequencer {
    /// The minimum percentage of bases with a quality of 30 or above that a sample must reach
    /// in a lane for its fastq files to be tracked.
    pub fn q30_threshold(self) -> f64 {
        match self {
            Self::HiSeqX => 75.0,
            Self::HiSeqGA => 80.0,
            Self::NovaSeq | Self::NovaSeqX => 75.0,
        }
    }

    /// Look up the sequencer model from an instrument serial, e.g. `A00187`.
    pub fn from_instrument_id(instrument_id: &str) -> Option<Self> {
        INSTRUMENT_LOOKUP
            .iter()
            .find(|(pattern, _)| pattern.is_match(instrument_id))
            .map(|(_, sequencer)| *sequencer)
    }
}

/// Tags attached to sequencing files stored in Housekeeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Display, EnumString, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum SequencingFileTag {
    Fastq,
    Spring,
    SpringMetadata,
    #[strum(serialize = "samplesheet")]
    SampleSheet,
    RunParameters,
    DemuxMetrics,
}

impl SequencingFileTag {
    /// The tags that are removed from Housekeeper together with a flow cell.
    pub const FLOW_CELL_DATA: [SequencingFileTag; 3] =
        [SequencingFileTag::Fastq, SequencingFileTag::Spring, SequencingFileTag::SpringMetadata];
}
