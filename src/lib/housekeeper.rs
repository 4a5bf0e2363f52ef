//! Housekeeper: the store that tracks files in versioned bundles, each file carrying tags.
//!
//! Every sample gets a bundle named after its internal id and every flow cell a bundle named
//! after the flow cell id. Files are looked up by their tags, e.g. `{fastq, HGYFLDSX7}`.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sequencer::SequencingFileTag;
use crate::utils::{absolute_path, now, write_json_atomically};

#[derive(Error, Debug)]
pub enum HousekeeperError {
    #[error("No bundle named {name}")]
    BundleNotFound { name: String },

    #[error("A bundle named {name} already exists")]
    BundleAlreadyExists { name: String },

    #[error("No file with id {id}")]
    FileNotFound { id: u64 },

    #[error("Cannot add {path:?}: the file does not exist")]
    MissingOnDisk { path: PathBuf },

    #[error("Io error occurred for {path:?}")]
    Io { source: std::io::Error, path: PathBuf },

    #[error("Unable to (de)serialize the housekeeper database")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub id: u64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub id: u64,
    pub bundle_id: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HousekeeperFile {
    pub id: u64,
    pub version_id: u64,
    pub path: PathBuf,
    pub tags: BTreeSet<String>,
}

impl HousekeeperFile {
    pub fn has_tags(&self, tags: &[&str]) -> bool {
        tags.iter().all(|t| self.tags.contains(*t))
    }
}

/// The operations on Housekeeper used by post-processing.
pub trait Housekeeper {
    /// Returns the latest version of the bundle, creating bundle and version if needed.
    fn add_bundle_and_version_if_non_existent(
        &mut self,
        bundle_name: &str,
    ) -> Result<Version, HousekeeperError>;

    /// Adds the file to the latest version of the bundle unless a file with the same path is
    /// already there, in which case the existing file is returned.
    fn add_file_to_bundle_if_non_existent(
        &mut self,
        path: &Path,
        bundle_name: &str,
        tags: &[&str],
    ) -> Result<HousekeeperFile, HousekeeperError>;

    /// Creates a new bundle holding a single file.
    fn create_bundle_and_add_file_with_tags(
        &mut self,
        bundle_name: &str,
        path: &Path,
        tags: &[&str],
    ) -> Result<HousekeeperFile, HousekeeperError>;

    /// All files carrying every one of `tags`.
    fn files(&self, tags: &[&str]) -> Vec<HousekeeperFile>;

    fn files_in_bundle(&self, bundle_name: &str) -> Vec<HousekeeperFile>;

    fn delete_file(&mut self, id: u64) -> Result<HousekeeperFile, HousekeeperError>;

    /// The newest sample sheet registered for the flow cell.
    fn get_sample_sheet_path(&self, flow_cell_id: &str) -> Option<PathBuf> {
        self.files(&[SequencingFileTag::SampleSheet.as_ref(), flow_cell_id])
            .into_iter()
            .max_by_key(|f| f.id)
            .map(|f| f.path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct HousekeeperState {
    next_id: u64,
    bundles: Vec<Bundle>,
    versions: Vec<Version>,
    files: Vec<HousekeeperFile>,
}

/// A [`Housekeeper`] held in memory, written through to a JSON snapshot if backed by a file.
///
/// A change whose snapshot could not be written is undone.
#[derive(Debug, Default)]
pub struct InMemoryHousekeeper {
    state: HousekeeperState,
    path: Option<PathBuf>,
}

impl InMemoryHousekeeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the snapshot at `path`, starting empty if it does not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, HousekeeperError> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let file = File::open(&path)
                .map_err(|e| HousekeeperError::Io { source: e, path: path.clone() })?;
            serde_json::from_reader(BufReader::new(file))?
        } else {
            HousekeeperState::default()
        };
        Ok(Self { state, path: Some(path) })
    }

    /// Writes the snapshot, going back to `previous` if that fails.
    fn persist(&mut self, previous: HousekeeperState) -> Result<(), HousekeeperError> {
        if let Some(path) = self.path.clone() {
            if let Err(e) = write_json_atomically(&path, &self.state) {
                self.state = previous;
                return Err(HousekeeperError::Io { source: e, path });
            }
        }
        Ok(())
    }

    fn next_id(&mut self) -> u64 {
        self.state.next_id += 1;
        self.state.next_id
    }

    fn bundle(&self, name: &str) -> Option<&Bundle> {
        self.state.bundles.iter().find(|b| b.name == name)
    }

    fn latest_version(&self, bundle_id: u64) -> Option<&Version> {
        self.state.versions.iter().filter(|v| v.bundle_id == bundle_id).max_by_key(|v| v.id)
    }

    fn create_bundle(&mut self, name: &str) -> Version {
        let bundle = Bundle { id: self.next_id(), name: name.to_string(), created_at: now() };
        let version = Version { id: self.next_id(), bundle_id: bundle.id, created_at: now() };
        info!("Created bundle {}", name);
        self.state.bundles.push(bundle);
        self.state.versions.push(version.clone());
        version
    }

    fn add_file(&mut self, path: PathBuf, version_id: u64, tags: &[&str]) -> HousekeeperFile {
        let file = HousekeeperFile {
            id: self.next_id(),
            version_id,
            path,
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
        };
        self.state.files.push(file.clone());
        file
    }

    fn checked_path(path: &Path) -> Result<PathBuf, HousekeeperError> {
        if !path.exists() {
            return Err(HousekeeperError::MissingOnDisk { path: path.to_path_buf() });
        }
        absolute_path(path)
            .map_err(|e| HousekeeperError::Io { source: e, path: path.to_path_buf() })
    }
}

impl Housekeeper for InMemoryHousekeeper {
    fn add_bundle_and_version_if_non_existent(
        &mut self,
        bundle_name: &str,
    ) -> Result<Version, HousekeeperError> {
        let existing = self.bundle(bundle_name).and_then(|b| self.latest_version(b.id)).cloned();
        match existing {
            Some(version) => Ok(version),
            None => {
                let previous = self.state.clone();
                let version = match self.bundle(bundle_name).map(|b| b.id) {
                    Some(bundle_id) => {
                        let version = Version { id: self.next_id(), bundle_id, created_at: now() };
                        self.state.versions.push(version.clone());
                        version
                    }
                    None => self.create_bundle(bundle_name),
                };
                self.persist(previous)?;
                Ok(version)
            }
        }
    }

    fn add_file_to_bundle_if_non_existent(
        &mut self,
        path: &Path,
        bundle_name: &str,
        tags: &[&str],
    ) -> Result<HousekeeperFile, HousekeeperError> {
        let path = Self::checked_path(path)?;
        let version_id = self
            .bundle(bundle_name)
            .and_then(|b| self.latest_version(b.id))
            .map(|v| v.id)
            .ok_or_else(|| HousekeeperError::BundleNotFound { name: bundle_name.to_string() })?;

        if let Some(existing) =
            self.state.files.iter().find(|f| f.version_id == version_id && f.path == path)
        {
            debug!("{:?} is already in bundle {}", path, bundle_name);
            return Ok(existing.clone());
        }
        let previous = self.state.clone();
        let file = self.add_file(path, version_id, tags);
        debug!("Added {:?} to bundle {} with tags {:?}", file.path, bundle_name, file.tags);
        self.persist(previous)?;
        Ok(file)
    }

    fn create_bundle_and_add_file_with_tags(
        &mut self,
        bundle_name: &str,
        path: &Path,
        tags: &[&str],
    ) -> Result<HousekeeperFile, HousekeeperError> {
        if self.bundle(bundle_name).is_some() {
            return Err(HousekeeperError::BundleAlreadyExists { name: bundle_name.to_string() });
        }
        let path = Self::checked_path(path)?;
        let previous = self.state.clone();
        let version = self.create_bundle(bundle_name);
        let file = self.add_file(path, version.id, tags);
        self.persist(previous)?;
        Ok(file)
    }

    fn files(&self, tags: &[&str]) -> Vec<HousekeeperFile> {
        self.state.files.iter().filter(|f| f.has_tags(tags)).cloned().collect()
    }

    fn files_in_bundle(&self, bundle_name: &str) -> Vec<HousekeeperFile> {
        let bundle_id = match self.bundle(bundle_name) {
            Some(bundle) => bundle.id,
            None => return vec![],
        };
        let version_ids: Vec<u64> =
            self.state.versions.iter().filter(|v| v.bundle_id == bundle_id).map(|v| v.id).collect();
        self.state.files.iter().filter(|f| version_ids.contains(&f.version_id)).cloned().collect()
    }

    fn delete_file(&mut self, id: u64) -> Result<HousekeeperFile, HousekeeperError> {
        let index = self
            .state
            .files
            .iter()
            .position(|f| f.id == id)
            .ok_or(HousekeeperError::FileNotFound { id })?;
        let previous = self.state.clone();
        let file = self.state.files.remove(index);
        self.persist(previous)?;
        Ok(file)
    }
}
