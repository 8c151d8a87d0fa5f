//! Gather: fetch a source, transform its records in parallel, classify them against the
//! current objects and persist the job's pending objects.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use futures::{stream, StreamExt};
use harvest_adapters::{adapter_for_kind, AdapterContext, AdapterError, FetchScope, SourceAdapter};
use harvest_core::{
    HarvestError, HarvestErrorRecord, HarvestJob, HarvestObject, HarvestSource, JobStatus, ObjectStatus,
    RawRecord,
};
use harvest_storage::{HarvestStore, HttpFetcher, PayloadArchive, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::schema::{check_remote_fields, SchemaCache};
use crate::transform::{transform_record, TransformedRecord};

/// Guids partitioned by what the import stage has to do with them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub new: BTreeSet<String>,
    pub change: BTreeSet<String>,
    pub delete: BTreeSet<String>,
}

/// `new = H \ D`, `change = H ∩ D`, `delete = D \ H`. An incremental fetch never deletes.
pub fn classify(guids_in_db: &BTreeSet<String>, guids_in_harvest: &BTreeSet<String>, scope: FetchScope) -> Classification {
    let new = guids_in_harvest.difference(guids_in_db).cloned().collect();
    let change = guids_in_harvest.intersection(guids_in_db).cloned().collect();
    let delete = match scope {
        FetchScope::Full => guids_in_db.difference(guids_in_harvest).cloned().collect(),
        FetchScope::ChangedSince(_) => BTreeSet::new(),
    };
    Classification { new, change, delete }
}

#[derive(Debug, Clone)]
pub struct GatherSettings {
    pub transform_concurrency: usize,
    /// Subtracted from the last error-free job start to form the incremental watermark.
    pub watermark_skew: Duration,
    /// Ignore the watermark and fetch everything.
    pub force: bool,
    pub required_lang: String,
}

impl Default for GatherSettings {
    fn default() -> Self {
        Self {
            transform_concurrency: 4,
            watermark_skew: Duration::seconds(3600),
            force: false,
            required_lang: "en".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GatherReport {
    pub job_id: Uuid,
    pub source_id: String,
    pub incremental: bool,
    pub since: Option<DateTime<Utc>>,
    pub fetched: usize,
    pub skipped: usize,
    pub new: usize,
    pub change: usize,
    pub delete: usize,
    pub archived_payloads: usize,
}

#[derive(Debug, Error)]
enum GatherError {
    #[error(transparent)]
    Harvest(#[from] HarvestError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("gather cancelled")]
    Cancelled,
}

impl From<AdapterError> for GatherError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Cancelled => GatherError::Cancelled,
            other => GatherError::Harvest(other.into()),
        }
    }
}

/// Everything a gather needs besides the source itself.
pub struct Gatherer<'a> {
    pub store: &'a dyn HarvestStore,
    pub schema_cache: &'a SchemaCache,
    pub archive: Option<&'a PayloadArchive>,
    pub http: Arc<HttpFetcher>,
    pub cancel: CancellationToken,
    pub run_id: Uuid,
    pub settings: &'a GatherSettings,
}

impl<'a> Gatherer<'a> {
    /// Run the gather stage for `source` with the adapter registered for its kind.
    pub async fn gather(&self, source: &HarvestSource) -> Result<GatherReport> {
        let adapter = adapter_for_kind(source.kind);
        self.gather_with(adapter.as_ref(), source).await
    }

    /// A failure after the job was opened is recorded on the job, which is then finished as
    /// failed (or aborted on cancellation).
    pub async fn gather_with(&self, adapter: &dyn SourceAdapter, source: &HarvestSource) -> Result<GatherReport> {
        adapter.validate_config(source)?;

        let job = self.store.create_job(&source.id).await?;
        let span = info_span!(
            "harvest_gather",
            source_id = %source.id,
            job_id = %job.id,
            run_id = %self.run_id
        );
        self.gather_job(adapter, source, &job).instrument(span).await
    }

    async fn gather_job(&self, adapter: &dyn SourceAdapter, source: &HarvestSource, job: &HarvestJob) -> Result<GatherReport> {
        match self.run(adapter, source, job).await {
            Ok(report) => {
                info!(
                    fetched = report.fetched,
                    new = report.new,
                    change = report.change,
                    delete = report.delete,
                    skipped = report.skipped,
                    "gather finished"
                );
                Ok(report)
            }
            Err(err) => {
                let status = match err {
                    GatherError::Cancelled => JobStatus::Aborted,
                    _ => JobStatus::Failed,
                };
                warn!(error = %err, status = status.as_str(), "gather stopped");
                self.store
                    .record_error(&HarvestErrorRecord::gather(job.id, err.to_string()))
                    .await?;
                self.store.finish_job(job.id, status).await?;
                Err(anyhow::Error::new(err).context(format!("gathering source {}", source.id)))
            }
        }
    }

    async fn run(
        &self,
        adapter: &dyn SourceAdapter,
        source: &HarvestSource,
        job: &HarvestJob,
    ) -> Result<GatherReport, GatherError> {
        let since = if self.settings.force || source.config.force_all {
            None
        } else {
            self.store
                .last_error_free_job(&source.id)
                .await?
                .map(|prior| prior.gather_started - self.settings.watermark_skew)
        };

        let ctx = AdapterContext {
            run_id: self.run_id,
            job_id: job.id,
            since,
            cancel: self.cancel.clone(),
            http: Arc::clone(&self.http),
            required_lang: self.settings.required_lang.clone(),
        };

        if !source.config.mappings.is_empty() {
            match self.schema_cache.remote_schema(adapter, &ctx, source).await? {
                Some(schema) => check_remote_fields(&schema, &source.config.mappings)?,
                None => warn!("remote publishes no schema; mapped fields are not checked"),
            }
        }

        let outcome = adapter.fetch(&ctx, source).await?;
        let fetched = outcome.records.len();
        info!(fetched, since = ?since, "fetched remote records");

        let mut archived_payloads = 0;
        if let Some(archive) = self.archive {
            let fetched_at = Utc::now();
            for payload in &outcome.payloads {
                match archive
                    .store(fetched_at, &source.id, job.id, payload.extension, &payload.bytes)
                    .await
                {
                    Ok(_) => archived_payloads += 1,
                    Err(err) => warn!(error = %err, "failed to archive payload"),
                }
            }
        }

        let mut skipped = 0;
        for reject in &outcome.rejects {
            warn!(reason = %reject, "record rejected by adapter");
            self.store
                .record_error(&HarvestErrorRecord::gather(job.id, reject.clone()))
                .await?;
            skipped += 1;
        }

        let harvested = self.transform_all(adapter, source, outcome.records).await;
        let mut by_guid: BTreeMap<String, TransformedRecord> = BTreeMap::new();
        for (idx, result) in harvested {
            match result {
                Ok(transformed) => {
                    if by_guid.contains_key(&transformed.guid) {
                        warn!(guid = %transformed.guid, record = idx, "duplicate guid in source; keeping the first record");
                        skipped += 1;
                    } else {
                        by_guid.insert(transformed.guid.clone(), transformed);
                    }
                }
                Err(err) => {
                    warn!(record = idx, error = %err, "record skipped");
                    self.store
                        .record_error(&HarvestErrorRecord::gather(job.id, format!("record {idx}: {err}")))
                        .await?;
                    skipped += 1;
                }
            }
        }

        ctx.ensure_active()?;

        let current: HashMap<String, HarvestObject> = self
            .store
            .current_objects(&source.id)
            .await?
            .into_iter()
            .map(|obj| (obj.guid.clone(), obj))
            .collect();
        let in_db: BTreeSet<String> = current.keys().cloned().collect();
        let in_harvest: BTreeSet<String> = by_guid.keys().cloned().collect();
        let classes = classify(&in_db, &in_harvest, outcome.scope);

        let mut objects = Vec::with_capacity(in_harvest.len() + classes.delete.len());
        for (guid, transformed) in by_guid {
            let status = if classes.change.contains(&guid) {
                ObjectStatus::Change
            } else {
                ObjectStatus::New
            };
            let mut obj = HarvestObject::new(job, guid, status);
            obj.metadata_modified = transformed.recency;
            obj.content = Some(
                serde_json::to_string(&transformed.record)
                    .map_err(|err| HarvestError::Transform(format!("serializing {}: {err}", obj.guid)))?,
            );
            if status == ObjectStatus::Change {
                obj.package_id = current.get(&obj.guid).and_then(|prior| prior.package_id.clone());
            }
            objects.push(obj);
        }
        for guid in &classes.delete {
            let mut obj = HarvestObject::new(job, guid.clone(), ObjectStatus::Delete);
            obj.package_id = current.get(guid).and_then(|prior| prior.package_id.clone());
            objects.push(obj);
        }

        self.store.persist_gathered(&objects).await?;
        self.store.mark_gather_finished(job.id).await?;

        Ok(GatherReport {
            job_id: job.id,
            source_id: source.id.clone(),
            incremental: matches!(outcome.scope, FetchScope::ChangedSince(_)),
            since,
            fetched,
            skipped,
            new: classes.new.len(),
            change: classes.change.len(),
            delete: classes.delete.len(),
            archived_payloads,
        })
    }

    /// Transform on the blocking pool, at most `transform_concurrency` at a time. Results keep their input index.
    async fn transform_all(
        &self,
        adapter: &dyn SourceAdapter,
        source: &HarvestSource,
        records: Vec<RawRecord>,
    ) -> Vec<(usize, Result<TransformedRecord, HarvestError>)> {
        let stage = adapter.mapping_stage();
        let shared = Arc::new(source.clone());
        let lang = self.settings.required_lang.clone();

        let mut results: Vec<_> = stream::iter(records.into_iter().enumerate())
            .map(|(idx, raw)| {
                let source = Arc::clone(&shared);
                let lang = lang.clone();
                async move {
                    let result = tokio::task::spawn_blocking(move || transform_record(&raw, &source, stage, &lang))
                        .await
                        .unwrap_or_else(|err| Err(HarvestError::Transform(format!("transform task failed: {err}"))));
                    (idx, result)
                }
            })
            .buffer_unordered(self.settings.transform_concurrency.max(1))
            .collect()
            .await;
        results.sort_by_key(|(idx, _)| *idx);
        results
    }
}
