//! Core domain model for the catalog harvester: sources, jobs, harvest objects and records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod config;
pub mod error;
pub mod mapping;
pub mod record;

pub use config::{HarvestConfig, RemoteEntityPolicy, SourceMappings};
pub use error::{ErrorKind, HarvestError, MappingError};
pub use mapping::{column_index, column_letter, FieldMapping, NormalizedMapping, RemoteFieldRef, SchemaVersion};
pub use record::{CatalogRecord, Extra, JsonMap, RawRecord};

pub const CRATE_NAME: &str = "harvest-core";

/// Remote origin flavour; selects the adapter used during gather.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    CatalogApi,
    Spreadsheet,
    Csw,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::CatalogApi => "catalog_api",
            SourceKind::Spreadsheet => "spreadsheet",
            SourceKind::Csw => "csw",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-defined remote origin. Read by every job and never mutated while one runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestSource {
    pub id: String,
    pub title: String,
    pub kind: SourceKind,
    pub url: String,
    /// Local organization that owns harvested datasets when no remote one applies.
    pub owner_org: Option<String>,
    pub enabled: bool,
    pub config: HarvestConfig,
}

impl HarvestSource {
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Finished,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Aborted => "aborted",
        }
    }
}

impl FromStr for JobStatus {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobStatus::Running),
            "finished" => Ok(JobStatus::Finished),
            "failed" => Ok(JobStatus::Failed),
            "aborted" => Ok(JobStatus::Aborted),
            other => Err(HarvestError::Configuration(format!("unknown job status {other:?}"))),
        }
    }
}

/// One execution of a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestJob {
    pub id: Uuid,
    pub source_id: String,
    pub status: JobStatus,
    pub gather_started: DateTime<Utc>,
    pub gather_finished: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub has_errors: bool,
}

impl HarvestJob {
    pub fn start(source_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id: source_id.to_string(),
            status: JobStatus::Running,
            gather_started: Utc::now(),
            gather_finished: None,
            finished: None,
            has_errors: false,
        }
    }

    pub fn is_error_free(&self) -> bool {
        self.status == JobStatus::Finished && !self.has_errors
    }
}

/// Gather-stage classification of a guid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectStatus {
    New,
    Change,
    Delete,
}

impl ObjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectStatus::New => "new",
            ObjectStatus::Change => "change",
            ObjectStatus::Delete => "delete",
        }
    }
}

impl FromStr for ObjectStatus {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(ObjectStatus::New),
            "change" => Ok(ObjectStatus::Change),
            "delete" => Ok(ObjectStatus::Delete),
            other => Err(HarvestError::Configuration(format!("unknown object status {other:?}"))),
        }
    }
}

/// Import-stage progress of a harvest object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectState {
    Pending,
    Complete,
    Error,
}

impl ObjectState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectState::Pending => "pending",
            ObjectState::Complete => "complete",
            ObjectState::Error => "error",
        }
    }
}

impl FromStr for ObjectState {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ObjectState::Pending),
            "complete" => Ok(ObjectState::Complete),
            "error" => Ok(ObjectState::Error),
            other => Err(HarvestError::Configuration(format!("unknown object state {other:?}"))),
        }
    }
}

/// Persisted unit of harvested work. Superseded, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestObject {
    pub id: Uuid,
    pub guid: String,
    pub source_id: String,
    pub job_id: Uuid,
    pub package_id: Option<String>,
    /// Serialized [`CatalogRecord`]; absent for deletions.
    pub content: Option<String>,
    pub status: ObjectStatus,
    pub state: ObjectState,
    pub current: bool,
    pub metadata_modified: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl HarvestObject {
    pub fn new(job: &HarvestJob, guid: impl Into<String>, status: ObjectStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            guid: guid.into(),
            source_id: job.source_id.clone(),
            job_id: job.id,
            package_id: None,
            content: None,
            status,
            state: ObjectState::Pending,
            current: false,
            metadata_modified: None,
            created_at: Utc::now(),
        }
    }

    pub fn record(&self) -> Result<CatalogRecord, HarvestError> {
        let content = self.content.as_deref().ok_or_else(|| {
            HarvestError::Reconciliation(format!("Empty content for object {}", self.id))
        })?;
        serde_json::from_str(content).map_err(|err| {
            HarvestError::Reconciliation(format!("Could not parse content for object {}: {err}", self.id))
        })
    }
}

/// Result of reconciling one harvest object against the target catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Created,
    Updated,
    Unchanged,
    Deleted,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    Gather,
    Import,
}

impl ErrorStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorStage::Gather => "gather",
            ErrorStage::Import => "import",
        }
    }
}

/// Error attributed to a job and, for import errors, to one of its objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestErrorRecord {
    pub job_id: Uuid,
    pub object_id: Option<Uuid>,
    pub stage: ErrorStage,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl HarvestErrorRecord {
    pub fn gather(job_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            job_id,
            object_id: None,
            stage: ErrorStage::Gather,
            message: message.into(),
            created_at: Utc::now(),
        }
    }

    pub fn import(job_id: Uuid, object_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            job_id,
            object_id: Some(object_id),
            stage: ErrorStage::Import,
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_free_requires_finished_without_errors() {
        let mut job = HarvestJob::start("src");
        assert!(!job.is_error_free());
        job.status = JobStatus::Finished;
        assert!(job.is_error_free());
        job.has_errors = true;
        assert!(!job.is_error_free());
    }

    #[test]
    fn statuses_round_trip_through_their_text_form() {
        for status in [ObjectStatus::New, ObjectStatus::Change, ObjectStatus::Delete] {
            assert_eq!(status.as_str().parse::<ObjectStatus>().expect("parse"), status);
        }
        assert!("gone".parse::<ObjectStatus>().is_err());
    }

    #[test]
    fn delete_objects_without_content_fail_to_decode() {
        let job = HarvestJob::start("src");
        let obj = HarvestObject::new(&job, "guid-1", ObjectStatus::Delete);
        let err = obj.record().expect_err("no content");
        assert!(err.to_string().contains("Empty content"));
    }
}
