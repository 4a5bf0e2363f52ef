#![forbid(unsafe_code)]
#![allow(clippy::must_use_candidate)]

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::sample_sheet::SampleSheetError;

/// One row of the data section of a BCL Convert sample sheet.
///
/// A sample sequenced on several lanes has one entry per lane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Hash, Eq)]
pub struct SampleSheetEntry {
    /// The lane the sample was loaded on.
    #[serde(alias = "Lane", rename(serialize = "Lane"))]
    pub lane: usize,

    /// The internal id of the sample.
    #[serde(alias = "Sample_ID", rename(serialize = "Sample_ID"))]
    pub sample_id: String,

    /// The index1 sequence.
    #[serde(alias = "Index", rename(serialize = "Index"), default)]
    pub index: Option<String>,

    /// The index2 sequence, absent for single-indexed samples.
    #[serde(alias = "Index2", rename(serialize = "Index2"), default)]
    pub index2: Option<String>,

    /// The project the sample belongs to.
    #[serde(alias = "Sample_Project", rename(serialize = "Sample_Project"), default)]
    pub project: Option<String>,

    /// The line number in the input in which this sample was defined
    #[serde(skip)]
    pub line_number: Option<usize>,
}

impl SampleSheetEntry {
    /// Create a new [`SampleSheetEntry`] without any index information.
    pub fn new(lane: usize, sample_id: impl Into<String>) -> Self {
        Self {
            lane,
            sample_id: sample_id.into(),
            index: None,
            index2: None,
            project: None,
            line_number: None,
        }
    }

    /// Set the line number the entry was read from.
    pub fn with_line_number(mut self, line_number: usize) -> Self {
        self.line_number = Some(line_number);
        self
    }
}

/// Validates a set of sample sheet entries.
///
/// Empty index sequences are normalised to `None`.
///
/// # Errors
///
/// - [`SampleSheetError::NoSamples`] if there are no entries
/// - [`SampleSheetError::DuplicateSampleId`] if a sample occurs twice in the same lane
pub fn validate_entries(
    entries: Vec<SampleSheetEntry>,
) -> Result<Vec<SampleSheetEntry>, SampleSheetError> {
    if entries.is_empty() {
        return Err(SampleSheetError::NoSamples);
    }

    let mut seen = HashSet::new();
    let mut validated = Vec::with_capacity(entries.len());
    for mut entry in entries {
        if !seen.insert((entry.sample_id.clone(), entry.lane)) {
            return Err(SampleSheetError::DuplicateSampleId {
                id: entry.sample_id,
                lane: entry.lane,
            });
        }
        entry.index = entry.index.filter(|i| !i.is_empty());
        entry.index2 = entry.index2.filter(|i| !i.is_empty());
        validated.push(entry);
    }
    Ok(validated)
}
