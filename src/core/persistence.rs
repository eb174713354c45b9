//! Persistence collaborator: durable storage of service records.
//!
//! The core depends only on [`PersistenceStore`]; [`JsonFileStore`] is the
//! ambient, concrete implementation that lets the crate run end-to-end.
//! Write-then-rename idiom grounded on the teacher's atomic asset-preparation
//! writes (the managed-image download pipeline write a completed file only
//! after its checksum verifies, never a partially-written one in place).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::core::service::ServiceRecord;
use crate::error::{Error, Result};

/// Provides `commit()` plus service records with the fields of the data model.
/// Records are read back verbatim on resume.
pub trait PersistenceStore {
    fn commit(&mut self, records: &BTreeMap<String, ServiceRecord>) -> Result<()>;
    fn load(&self) -> Result<BTreeMap<String, ServiceRecord>>;
}

/// A JSON-file-backed store: one file per plan, rewritten wholesale on every
/// `commit`.
pub struct JsonFileStore {
    path: PathBuf,
    last_committed_at: Option<String>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_committed_at: None,
        }
    }

    /// Derive the conventional store path from a plan file's path: same
    /// directory, stem + `.state.json`.
    pub fn for_plan(plan_path: &Path) -> Self {
        let stem = plan_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "plan".to_string());
        let path = plan_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!("{stem}.state.json"));
        Self::new(path)
    }

    /// RFC 3339 timestamp of the most recent `commit` made by this process.
    /// `None` before this store's first commit.
    pub fn last_committed_at(&self) -> Option<&str> {
        self.last_committed_at.as_deref()
    }

    /// Reads the `committed_at` timestamp stamped by the last commit to this
    /// store's file, whether made by this process or an earlier one. `None`
    /// if the file does not exist or predates the field.
    pub fn read_committed_at(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path).map_err(|source| Error::Io {
            path: self.path.clone(),
            source,
        })?;
        let document: StoreDocument = serde_json::from_str(&contents)
            .map_err(|source| Error::config(format!("malformed persisted state: {source}")))?;
        Ok(document.committed_at)
    }
}

#[derive(Serialize, Deserialize)]
struct StoreDocument {
    records: BTreeMap<String, ServiceRecord>,
    committed_at: Option<String>,
}

/// Grounded on the teacher's `format_verified_at` (`app/clean.rs`):
/// `OffsetDateTime` formatted as RFC 3339, falling back to a sentinel on
/// formatting failure rather than propagating an error for a cosmetic field.
fn format_now() -> String {
    match OffsetDateTime::now_utc().format(&Rfc3339) {
        Ok(formatted) => formatted,
        Err(_) => "<invalid timestamp>".to_string(),
    }
}

impl PersistenceStore for JsonFileStore {
    fn commit(&mut self, records: &BTreeMap<String, ServiceRecord>) -> Result<()> {
        let committed_at = format_now();
        let document = StoreDocument {
            records: records.clone(),
            committed_at: Some(committed_at.clone()),
        };
        let serialized = serde_json::to_string_pretty(&document)
            .map_err(|source| Error::config(format!("failed to serialize service records: {source}")))?;

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, serialized).map_err(|source| Error::Io {
            path: tmp_path.clone(),
            source,
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|source| Error::Io {
            path: self.path.clone(),
            source,
        })?;
        self.last_committed_at = Some(committed_at);
        Ok(())
    }

    fn load(&self) -> Result<BTreeMap<String, ServiceRecord>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = std::fs::read_to_string(&self.path).map_err(|source| Error::Io {
            path: self.path.clone(),
            source,
        })?;
        let document: StoreDocument = serde_json::from_str(&contents)
            .map_err(|source| Error::config(format!("malformed persisted state: {source}")))?;
        Ok(document.records)
    }
}
