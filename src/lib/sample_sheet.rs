use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord, Trim};
use fgoxide::io::Io;
use itertools::Itertools;
use thiserror::Error;

use crate::sample_metadata::{validate_entries, SampleSheetEntry};

/// The section holding the samples in a BCL Convert sample sheet.
pub const BCL_CONVERT_DATA_SECTION: &str = "[BCLConvert_Data]";
/// The section holding the samples in older sample sheets.
pub const DATA_SECTION: &str = "[Data]";

/// The error that may occur when parsing the [`SampleSheet`].
#[derive(Error, Debug)]
pub enum SampleSheetError {
    #[error("Io error occurred")]
    FgError(#[from] fgoxide::FgError),

    #[error("The sample sheet was empty")]
    Empty,

    #[error("The '[BCLConvert_Data]' or '[Data]' section is missing")]
    NoData,

    #[error("The data section is missing samples")]
    NoSamples,

    #[error("The header line in the data section is missing")]
    NoDataHeader,

    #[error("Sample on line {line_number} has {actual} fields instead of {expected}: {line}")]
    SampleInvalidNumberOfColumns {
        actual: usize,
        expected: usize,
        line_number: usize,
        line: String,
    },

    #[error("Unable to parse the sample info line number {line}: {source}")]
    SampleInvalidLine { source: csv::Error, line: usize },

    #[error("Duplicate Sample_ID {id} found in lane {lane}")]
    DuplicateSampleId { id: String, lane: usize },

    #[error(transparent)]
    Deserialize(#[from] csv::Error),
}

/// The samples of a flow cell, as given to the demultiplexing software.
#[derive(Debug, Clone)]
pub struct SampleSheet {
    pub path: PathBuf,
    pub entries: Vec<SampleSheetEntry>,
}

impl SampleSheet {
    /// Builds a `SampleSheet` from the CSV at the given path.
    ///
    /// The samples are read from the `[BCLConvert_Data]` section, falling back to a `[Data]`
    /// section for sample sheets written for older converters. The section must start with a
    /// header line holding at least `Lane` and `Sample_ID`.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, SampleSheetError> {
        let io = Io::default();
        let lines = io.read_lines(&path).map_err(SampleSheetError::FgError)?;

        if lines.is_empty() {
            return Err(SampleSheetError::Empty);
        }

        let data = lines.join("\n");
        let entries = SampleSheet::from_reader(data.as_bytes())?;
        Ok(SampleSheet { path: path.as_ref().to_path_buf(), entries })
    }

    /// Reads the sample entries from a full sample sheet.
    fn from_reader<R: std::io::Read>(reader: R) -> Result<Vec<SampleSheetEntry>, SampleSheetError> {
        let mut reader = ReaderBuilder::new()
            .delimiter(b',')
            .has_headers(false)
            .quoting(true)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(reader);

        let mut records: Vec<StringRecord> = vec![];
        for record in reader.records() {
            records.push(record?);
        }
        SampleSheet::from_string_records(&records)
    }

    /// Finds the start and end line index (0-based inclusive) of the section with the given key
    /// (e.g.  "[Header]", "[Reads]", "[BCLConvert_Data]"), returning `None` if the key wasn't
    /// found or the section is empty.  The key must occur in the first column.  The end of the
    /// section is identified by the first column starting with "[".  The line with the header
    /// key is not returned.
    fn find_section(records: &[StringRecord], section_key: &str) -> Option<(usize, usize)> {
        let header_index = records.iter().position(|r| !r.is_empty() && &r[0] == section_key)?;
        let start_line_index = header_index + 1;
        if start_line_index >= records.len() {
            return None;
        }
        let end_line_index = records[start_line_index..]
            .iter()
            .position(|r| !r.is_empty() && r[0].starts_with('['))
            .map_or(records.len(), |offset| start_line_index + offset);
        if end_line_index == start_line_index {
            return None;
        }
        Some((start_line_index, end_line_index - 1))
    }

    /// Converts the given string records from the data section to entries.  Assumes a header,
    /// and all rows have the same number of columns.
    fn slurp_entries(
        records: &[StringRecord],
        mut line_index: usize,
    ) -> Result<Vec<SampleSheetEntry>, SampleSheetError> {
        if records.is_empty() {
            return Err(SampleSheetError::NoDataHeader);
        }

        // The header line with column names
        let header = &records[0];

        let mut entries: Vec<SampleSheetEntry> = vec![];
        for record in &records[1..] {
            line_index += 1;
            // allow an empty line
            if record.is_empty() || record.iter().all(str::is_empty) {
                continue;
            }
            if header.len() != record.len() {
                return Err(SampleSheetError::SampleInvalidNumberOfColumns {
                    actual: record.len(),
                    expected: header.len(),
                    line_number: line_index + 1,
                    line: record.into_iter().join(","),
                });
            }

            let entry: SampleSheetEntry = record.deserialize(Some(header)).map_err(|e| {
                SampleSheetError::SampleInvalidLine { source: e, line: line_index + 1 }
            })?;
            entries.push(entry.with_line_number(line_index + 1));
        }
        if entries.is_empty() {
            return Err(SampleSheetError::NoSamples);
        }

        Ok(entries)
    }

    /// Reads the entries from a sample sheet represented as a vector of `StringRecord`s, one
    /// per line.  Validates that no sample occurs twice in the same lane.
    fn from_string_records(
        records: &[StringRecord],
    ) -> Result<Vec<SampleSheetEntry>, SampleSheetError> {
        if records.is_empty() {
            return Err(SampleSheetError::Empty);
        }

        let (start, end) = SampleSheet::find_section(records, BCL_CONVERT_DATA_SECTION)
            .or_else(|| SampleSheet::find_section(records, DATA_SECTION))
            .ok_or(SampleSheetError::NoData)?;

        let entries = SampleSheet::slurp_entries(&records[start..=end], start)?;
        validate_entries(entries)
    }

    /// The unique internal ids of all samples on the flow cell, sorted.
    pub fn sample_internal_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.sample_id.clone()).sorted().dedup().collect()
    }

    /// The `(lane, sample)` pairs for every lane that holds exactly one sample.
    pub fn non_pooled_lanes_and_samples(&self) -> Vec<(usize, String)> {
        let mut samples_per_lane: BTreeMap<usize, Vec<&str>> = BTreeMap::new();
        for entry in &self.entries {
            samples_per_lane.entry(entry.lane).or_default().push(&entry.sample_id);
        }
        samples_per_lane
            .into_iter()
            .filter(|(_, samples)| samples.len() == 1)
            .map(|(lane, samples)| (lane, samples[0].to_string()))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use csv::StringRecord;
    use matches::assert_matches;

    use crate::sample_sheet::{SampleSheet, SampleSheetError};
    use crate::utils::test_commons::write_sample_sheet;

    #[test]
    fn test_find_section_not_found_empty_records() {
        assert_eq!(SampleSheet::find_section(&[], "[Hello]"), None);
    }

    #[test]
    fn test_find_section_not_found() {
        let records: Vec<StringRecord> = vec![
            StringRecord::from(vec!["[Header]"]),
            StringRecord::from(vec!["FileFormatVersion", "2"]),
            StringRecord::from(vec!["RunName", "Foo"]),
            StringRecord::from(vec!["[Reads]"]),
            StringRecord::from(vec!["Read1Cycles", "151"]),
            StringRecord::from(vec!["[BCLConvert_Data]"]),
        ];
        assert_eq!(SampleSheet::find_section(&records, "[Hello]"), None);
    }

    #[test]
    fn test_find_section_not_found_empty_section() {
        let records: Vec<StringRecord> = vec![StringRecord::from(vec!["[Hello]"])];
        assert_eq!(SampleSheet::find_section(&records, "[Hello]"), None);
    }

    #[test]
    fn test_find_section_non_empty_section() {
        let records: Vec<StringRecord> = vec![
            StringRecord::from(vec!["[Header]"]),
            StringRecord::from(vec!["FileFormatVersion", "2"]),
            StringRecord::from(vec!["RunName", "Foo"]),
            StringRecord::from(vec!["[Reads]"]),
            StringRecord::from(vec!["Read1Cycles", "151"]),
            StringRecord::from(vec!["Read2Cycles", "151"]),
            StringRecord::from(vec!["Index1Cycles", "10"]),
            StringRecord::from(vec!["[BCLConvert_Data]"]),
            StringRecord::from(vec!["Lane", "Sample_ID"]),
            StringRecord::from(vec!["[End]"]),
        ];
        assert_eq!(SampleSheet::find_section(&records, "[Header]"), Some((1, 2)));
        assert_eq!(SampleSheet::find_section(&records, "[Reads]"), Some((4, 6)));
        assert_eq!(SampleSheet::find_section(&records, "[BCLConvert_Data]"), Some((8, 8)));
        assert_eq!(SampleSheet::find_section(&records, "[End]"), None);
    }

    #[test]
    fn test_slurp_entries_no_header() {
        let result = SampleSheet::slurp_entries(&[], 12);
        assert_matches!(result, Err(SampleSheetError::NoDataHeader));
    }

    #[test]
    fn test_slurp_entries_ok() {
        let records = vec![
            StringRecord::from(vec!["Lane", "Sample_ID", "Index", "Index2"]),
            StringRecord::from(vec!["1", "ACC11927A2", "AAAAAAAA", "CCCCCCCC"]),
            StringRecord::new(),
            StringRecord::from(vec!["2", "ACC11927A5", "GGGGGGGG", "TTTTTTTT"]),
        ];
        let entries = SampleSheet::slurp_entries(&records, 12).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].lane, 1);
        assert_eq!(entries[0].sample_id, "ACC11927A2");
        assert_eq!(entries[0].index, Some(String::from("AAAAAAAA")));
        assert_eq!(entries[0].line_number, Some(14));
        assert_eq!(entries[1].lane, 2);
        assert_eq!(entries[1].sample_id, "ACC11927A5");
        assert_eq!(entries[1].index2, Some(String::from("TTTTTTTT")));
        assert_eq!(entries[1].line_number, Some(16));
    }

    #[test]
    fn test_slurp_entries_wrong_number_of_columns() {
        let records = vec![
            StringRecord::from(vec!["Lane", "Sample_ID", "Index"]),
            StringRecord::from(vec!["1", "ACC11927A2", "AAAA"]),
            StringRecord::from(vec!["1", "ACC11927A5"]),
        ];
        let result = SampleSheet::slurp_entries(&records, 12);
        assert_matches!(
            result,
            Err(SampleSheetError::SampleInvalidNumberOfColumns {
                actual: 2,
                expected: 3,
                line_number: 15,
                line: _,
            })
        );
        if let Err(SampleSheetError::SampleInvalidNumberOfColumns { line, .. }) = result {
            assert_eq!(line, "1,ACC11927A5");
        }
    }

    #[test]
    fn test_slurp_entries_deserialize_error() {
        let records = vec![
            StringRecord::from(vec!["Lane", "Sample_ID"]),
            StringRecord::from(vec!["1", "ACC11927A2"]),
            StringRecord::from(vec!["one", "ACC11927A5"]),
        ];
        let result = SampleSheet::slurp_entries(&records, 12);
        assert_matches!(result, Err(SampleSheetError::SampleInvalidLine { source: _, line: 15 }));
    }

    #[test]
    fn test_sample_sheet_empty() {
        let records: Vec<StringRecord> = vec![];
        assert_matches!(SampleSheet::from_string_records(&records), Err(SampleSheetError::Empty));
    }

    #[test]
    fn test_sample_sheet_no_data() {
        let records: Vec<StringRecord> = vec![
            StringRecord::from(vec!["[Header]"]),
            StringRecord::from(vec!["FileFormatVersion", "2"]),
            StringRecord::from(vec!["RunName", "Foo"]),
        ];
        assert_matches!(SampleSheet::from_string_records(&records), Err(SampleSheetError::NoData));
    }

    #[test]
    fn test_ok_sample_sheet() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample_sheet(
            dir.path(),
            &[(1, "ACC11927A2"), (2, "ACC11927A2"), (3, "ACC11927A5"), (3, "ACC11927A7")],
        );

        let sample_sheet = SampleSheet::from_path(&path).unwrap();

        assert_eq!(sample_sheet.path, path);
        assert_eq!(sample_sheet.entries.len(), 4);
        assert_eq!(
            sample_sheet.sample_internal_ids(),
            vec!["ACC11927A2", "ACC11927A5", "ACC11927A7"]
        );
        assert_eq!(
            sample_sheet.non_pooled_lanes_and_samples(),
            vec![(1, String::from("ACC11927A2")), (2, String::from("ACC11927A2"))]
        );
    }

    #[test]
    fn test_legacy_data_section() {
        let file_contents = "[Header]\n\
            Date,2023-09-12\n\
            [Data]\n\
            Lane,Sample_ID,Index,Index2,Sample_Project\n\
            1,ACC11927A2,AAAAAAAA,CCCCCCCC,project\n\
            "
        .to_string();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SampleSheet.csv");
        std::fs::write(&path, file_contents).expect("Failed to write sample sheet to file.");

        let sample_sheet = SampleSheet::from_path(&path).unwrap();
        assert_eq!(sample_sheet.entries.len(), 1);
        assert_eq!(sample_sheet.entries[0].project, Some(String::from("project")));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = SampleSheet::from_path(dir.path().join("SampleSheet.csv"));
        assert_matches!(result, Err(SampleSheetError::FgError(_)));
    }
}
