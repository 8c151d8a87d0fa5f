//! Source adapter contract and the per-kind adapters (catalog API, spreadsheet, CSW).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{HarvestError, HarvestSource, RawRecord, SourceKind};
use harvest_storage::{CatalogSchema, FetchError, HttpFetcher};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub mod catalog_api;
pub mod csw;
pub mod spreadsheet;

pub use catalog_api::{CatalogApiAdapter, CatalogApiOptions};
pub use csw::{CswAdapter, CswOptions};
pub use spreadsheet::{SheetReader, SpreadsheetAdapter, SpreadsheetOptions, StorageType};

pub const CRATE_NAME: &str = "harvest-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Harvest(#[from] HarvestError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("fetch cancelled")]
    Cancelled,
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl From<AdapterError> for HarvestError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Harvest(err) => err,
            other => HarvestError::SourceFetch(other.to_string()),
        }
    }
}

/// Per-job inputs shared by every adapter call.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub job_id: Uuid,
    /// Incremental watermark; `None` requests a full listing.
    pub since: Option<DateTime<Utc>>,
    pub cancel: CancellationToken,
    pub http: Arc<HttpFetcher>,
    pub required_lang: String,
}

impl AdapterContext {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            job_id: Uuid::nil(),
            since: None,
            cancel: CancellationToken::new(),
            http,
            required_lang: "en".to_string(),
        }
    }

    pub fn ensure_active(&self) -> Result<(), AdapterError> {
        if self.cancel.is_cancelled() {
            Err(AdapterError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// What a completed fetch actually covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchScope {
    Full,
    /// Only records modified after the watermark; absence does not imply deletion.
    ChangedSince(DateTime<Utc>),
}

/// Remote payload kept for the optional archive.
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub extension: &'static str,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub records: Vec<RawRecord>,
    pub scope: FetchScope,
    /// Per-record problems found while decoding; the records are skipped.
    pub rejects: Vec<String>,
    pub payloads: Vec<RawPayload>,
}

impl FetchOutcome {
    pub fn full(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            scope: FetchScope::Full,
            rejects: Vec::new(),
            payloads: Vec::new(),
        }
    }
}

/// Where field mappings are applied for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingStage {
    Transform,
    /// The adapter maps rows itself because its join keys may be remapped.
    Adapter,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Check kind-specific options; runs before any job is created.
    fn validate_config(&self, source: &HarvestSource) -> Result<(), HarvestError>;

    fn mapping_stage(&self) -> MappingStage {
        MappingStage::Transform
    }

    /// Pull every record the source currently exposes, or only the changed ones when `ctx.since` is set.
    async fn fetch(&self, ctx: &AdapterContext, source: &HarvestSource) -> Result<FetchOutcome, AdapterError>;

    /// Remote field definitions used to check mappings; `None` when the remote publishes none.
    async fn remote_schema(
        &self,
        _ctx: &AdapterContext,
        _source: &HarvestSource,
    ) -> Result<Option<CatalogSchema>, AdapterError> {
        Ok(None)
    }

    /// Link to the record's original document, when the protocol has one.
    fn original_url(&self, _source: &HarvestSource, _guid: &str) -> Option<String> {
        None
    }
}

pub fn adapter_for_kind(kind: SourceKind) -> Box<dyn SourceAdapter> {
    match kind {
        SourceKind::CatalogApi => Box::new(CatalogApiAdapter),
        SourceKind::Spreadsheet => Box::new(SpreadsheetAdapter::default()),
        SourceKind::Csw => Box::new(CswAdapter),
    }
}
