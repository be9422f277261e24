//! Local record of the projects created from this machine.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

const PROJECT_ID_LEN: usize = 6;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode project store: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("no data directory available for the project store")]
    NoDataDir,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    pub id: String,
    pub github_url: String,
    pub sandbox_id: String,
    pub preview_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_script: Option<String>,
    /// Milliseconds since the unix epoch.
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct ProjectStore {
    path: PathBuf,
}

impl ProjectStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> Result<PathBuf, StoreError> {
        let base = dirs::data_dir().ok_or(StoreError::NoDataDir)?;
        Ok(base.join("sandbox-relay").join("projects.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records, newest first.
    pub fn list(&self) -> Result<Vec<ProjectRecord>, StoreError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str(&contents) {
            Ok(records) => Ok(records),
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "project store is unreadable, treating as empty"
                );
                Ok(Vec::new())
            }
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<ProjectRecord>, StoreError> {
        Ok(self.list()?.into_iter().find(|record| record.id == id))
    }

    pub fn add(&self, record: ProjectRecord) -> Result<(), StoreError> {
        let mut records = self.list()?;
        records.retain(|existing| existing.id != record.id);
        records.insert(0, record);
        self.write(&records)
    }

    fn write(&self, records: &[ProjectRecord]) -> Result<(), StoreError> {
        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let encoded = serde_json::to_vec_pretty(records)?;
        fs::write(&self.path, encoded).map_err(io_err)
    }
}

pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Short lowercase alphanumeric project id.
pub fn new_project_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PROJECT_ID_LEN)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect()
}
