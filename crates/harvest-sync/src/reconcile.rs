//! Import: reconcile a job's pending harvest objects against the target catalog.
//!
//! Objects are processed one at a time. A failed object is recorded and left in the `error`
//! state; its guid keeps whatever current object it had, so the next job retries it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Result};
use harvest_core::record::non_empty_str;
use harvest_core::{
    CatalogRecord, HarvestError, HarvestErrorRecord, HarvestObject, HarvestSource, JobStatus, JsonMap, ObjectState,
    ObjectStatus, Outcome, RemoteEntityPolicy,
};
use harvest_storage::{CatalogClient, CatalogError, HarvestStore, StoreError};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::defaults::{
    apply_default_extras, detect_format, fill_missing, fill_release_dates, group_names, normalize_size,
    normalize_tags, ExtraPlaceholders, DATASET_DEFAULTS, RESOURCE_DEFAULTS,
};
use crate::transform::resource_recency;
use crate::{NoopPackageHook, PackageHook};

const NAME_ATTEMPTS: usize = 100;
const LOOKUP_FIELDS: &[&str] = &["identifier", "alternate_identifier", "inspire_id"];
const REMOTE_ENTITY_STRIP: &[&str] = &[
    "packages",
    "created",
    "users",
    "groups",
    "tags",
    "extras",
    "display_name",
    "type",
];

#[derive(Debug, Clone, Default)]
pub struct ImportSettings {
    /// Write even when the remote record is not newer than the stored one.
    pub force: bool,
    /// Fields restored from the existing package on update, on top of each source's own list.
    pub not_overwrite_fields: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub job_id: Uuid,
    pub source_id: String,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub failed: usize,
    pub aborted: bool,
}

impl ImportReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::Unchanged => self.unchanged += 1,
            Outcome::Deleted => self.deleted += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Error)]
enum ReconcileError {
    #[error(transparent)]
    Harvest(#[from] HarvestError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<CatalogError> for ReconcileError {
    fn from(err: CatalogError) -> Self {
        ReconcileError::Harvest(HarvestError::Reconciliation(err.to_string()))
    }
}

/// Package id -> (object id, guid) of the current object linked to it.
pub type PackageOwners = HashMap<String, (Uuid, String)>;

/// What one import run is working on.
pub struct ImportScope<'a> {
    pub source: &'a HarvestSource,
    pub job_id: Uuid,
    /// Catalog on the source side, used to copy organization and group definitions missing locally.
    pub remote: Option<&'a dyn CatalogClient>,
}

pub struct Reconciler {
    catalog: Arc<dyn CatalogClient>,
    store: Arc<dyn HarvestStore>,
    hook: Arc<dyn PackageHook>,
    settings: ImportSettings,
}

impl Reconciler {
    pub fn new(catalog: Arc<dyn CatalogClient>, store: Arc<dyn HarvestStore>, settings: ImportSettings) -> Self {
        Self {
            catalog,
            store,
            hook: Arc::new(NoopPackageHook),
            settings,
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn PackageHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Reconcile every pending object of the job, then finish it.
    pub async fn import_job(&self, scope: &ImportScope<'_>, cancel: &CancellationToken) -> Result<ImportReport> {
        let span = info_span!("harvest_import", source_id = %scope.source.id, job_id = %scope.job_id);
        self.import_objects(scope, cancel).instrument(span).await
    }

    async fn import_objects(&self, scope: &ImportScope<'_>, cancel: &CancellationToken) -> Result<ImportReport> {
        let job = self
            .store
            .job(scope.job_id)
            .await?
            .ok_or(StoreError::JobNotFound(scope.job_id))?;
        if job.source_id != scope.source.id {
            bail!("job {} belongs to source {}, not {}", job.id, job.source_id, scope.source.id);
        }

        let pending = self.store.pending_objects(job.id).await?;
        let mut owners: PackageOwners = self
            .store
            .current_objects(&scope.source.id)
            .await?
            .into_iter()
            .filter_map(|obj| {
                let package_id = obj.package_id?;
                Some((package_id, (obj.id, obj.guid)))
            })
            .collect();

        let mut report = ImportReport {
            job_id: job.id,
            source_id: scope.source.id.clone(),
            ..Default::default()
        };
        for (idx, obj) in pending.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(remaining = pending.len() - idx, "import cancelled");
                report.aborted = true;
                break;
            }
            let outcome = self.reconcile(scope, obj, &mut owners).await?;
            report.record(outcome);
        }

        let status = if report.aborted {
            JobStatus::Aborted
        } else {
            JobStatus::Finished
        };
        self.store.finish_job(job.id, status).await?;
        info!(
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            deleted = report.deleted,
            failed = report.failed,
            "import finished"
        );
        Ok(report)
    }

    /// Reconcile one object. Catalog rejections and conflicts are recorded against the object and
    /// reported as [`Outcome::Failed`]; only store failures are returned as errors.
    pub async fn reconcile(
        &self,
        scope: &ImportScope<'_>,
        obj: &HarvestObject,
        owners: &mut PackageOwners,
    ) -> Result<Outcome, StoreError> {
        let result = match obj.status {
            ObjectStatus::Delete => self.remove(scope, obj, owners).await,
            ObjectStatus::New | ObjectStatus::Change => self.upsert(scope, obj, owners).await,
        };
        match result {
            Ok(outcome) => {
                debug!(guid = %obj.guid, object_id = %obj.id, outcome = ?outcome, "object reconciled");
                Ok(outcome)
            }
            Err(ReconcileError::Store(err)) => Err(err),
            Err(ReconcileError::Harvest(err)) => {
                warn!(guid = %obj.guid, object_id = %obj.id, error = %err, "object failed");
                self.store
                    .record_error(&HarvestErrorRecord::import(scope.job_id, obj.id, err.to_string()))
                    .await?;
                self.store.finish_object(obj.id, ObjectState::Error).await?;
                Ok(Outcome::Failed)
            }
        }
    }

    async fn remove(
        &self,
        scope: &ImportScope<'_>,
        obj: &HarvestObject,
        owners: &mut PackageOwners,
    ) -> Result<Outcome, ReconcileError> {
        let outcome = match obj.package_id.as_deref() {
            Some(package_id) if scope.source.config.override_local_datasets => {
                match self.catalog.package_delete(package_id).await {
                    Ok(()) | Err(CatalogError::NotFound(_)) => {}
                    Err(err) => return Err(err.into()),
                }
                owners.remove(package_id);
                info!(guid = %obj.guid, package_id, "package deleted");
                Outcome::Deleted
            }
            Some(package_id) => {
                info!(guid = %obj.guid, package_id, "record gone from source; local package kept");
                Outcome::Unchanged
            }
            None => Outcome::Unchanged,
        };
        self.store.finish_object(obj.id, ObjectState::Complete).await?;
        Ok(outcome)
    }

    async fn upsert(
        &self,
        scope: &ImportScope<'_>,
        obj: &HarvestObject,
        owners: &mut PackageOwners,
    ) -> Result<Outcome, ReconcileError> {
        let source = scope.source;
        let record = obj.record()?;

        if record.get_str("type") == Some("harvest") && !source.config.allow_harvest_datasets {
            info!(guid = %obj.guid, "skipping harvest source dataset");
            self.store.finish_object(obj.id, ObjectState::Complete).await?;
            return Ok(Outcome::Unchanged);
        }

        let prior = match obj.status {
            ObjectStatus::Change => self
                .store
                .current_object(&source.id, &obj.guid)
                .await?
                .filter(|prior| prior.id != obj.id),
            _ => None,
        };

        let wanted_id = obj
            .package_id
            .clone()
            .unwrap_or_else(|| package_id_for(&record, &obj.guid));
        let existing = self.find_existing(&record, &wanted_id).await?;
        let package_id = existing
            .as_ref()
            .and_then(|pkg| non_empty_str(pkg.get("id")))
            .map(str::to_string)
            .unwrap_or(wanted_id);

        if let Some((owner_id, owner_guid)) = owners.get(&package_id) {
            if *owner_guid != obj.guid {
                return Err(HarvestError::Reconciliation(format!(
                    "Object {owner_id} already has package {package_id} under guid {owner_guid}"
                ))
                .into());
            }
        }

        if let (Some(prior), Some(_)) = (&prior, &existing) {
            if !self.settings.force && !is_newer(obj, prior) {
                debug!(guid = %obj.guid, package_id = %package_id, "remote record is not newer; package untouched");
                self.store.finish_object(obj.id, ObjectState::Complete).await?;
                return Ok(Outcome::Unchanged);
            }
        }

        let mut package = self
            .build_package(scope, obj, record, &package_id, existing.as_ref())
            .await?;
        self.hook.before_write(source, &mut package).map_err(|err| {
            HarvestError::Reconciliation(format!("package hook rejected {}: {err:#}", obj.guid))
        })?;

        let (written, outcome) = match existing {
            Some(_) => (self.catalog.package_update(&package).await?, Outcome::Updated),
            None => (self.catalog.package_create(&package).await?, Outcome::Created),
        };
        let written_id = non_empty_str(written.get("id")).unwrap_or(&package_id).to_string();

        self.store
            .promote_current(obj.id, &written_id, obj.metadata_modified)
            .await?;
        owners.insert(written_id.clone(), (obj.id, obj.guid.clone()));
        info!(guid = %obj.guid, package_id = %written_id, outcome = ?outcome, "package written");

        if let Err(err) = self.hook.after_write(source, &written, outcome) {
            warn!(guid = %obj.guid, error = %err, "after-write hook failed");
        }
        Ok(outcome)
    }

    /// By id, then name, then the identifier-like fields.
    async fn find_existing(&self, record: &CatalogRecord, package_id: &str) -> Result<Option<Value>, CatalogError> {
        if let Some(found) = self.catalog.package_show(package_id).await? {
            return Ok(Some(found));
        }
        if let Some(name) = record.get_str("name") {
            if let Some(found) = self.catalog.package_show(name).await? {
                if same_dataset(&found, record) {
                    return Ok(Some(found));
                }
            }
        }
        for field in LOOKUP_FIELDS {
            if let Some(value) = record.get_str(field) {
                if let Some(found) = self.catalog.package_find(field, value).await? {
                    return Ok(Some(found));
                }
            }
        }
        Ok(None)
    }

    async fn unique_name(&self, base: &str) -> Result<String, ReconcileError> {
        for attempt in 0..NAME_ATTEMPTS {
            let candidate = if attempt == 0 {
                base.to_string()
            } else {
                format!("{base}-{attempt}")
            };
            if self.catalog.package_show(&candidate).await?.is_none() {
                return Ok(candidate);
            }
        }
        Err(HarvestError::Reconciliation(format!("no free package name for {base}")).into())
    }

    async fn build_package(
        &self,
        scope: &ImportScope<'_>,
        obj: &HarvestObject,
        record: CatalogRecord,
        package_id: &str,
        existing: Option<&Value>,
    ) -> Result<Value, ReconcileError> {
        let source = scope.source;
        let config = &source.config;
        let CatalogRecord {
            mut fields,
            resources,
            mut extras,
        } = record;

        fields.insert("id".into(), Value::String(package_id.to_string()));
        let name = match existing.and_then(|pkg| non_empty_str(pkg.get("name"))) {
            Some(name) => name.to_string(),
            None => {
                let base = non_empty_str(fields.get("name"))
                    .map(str::to_string)
                    .unwrap_or_else(|| package_id.to_string());
                self.unique_name(&base).await?
            }
        };
        fields.insert("name".into(), Value::String(name));

        let tags = normalize_tags(&mut fields, &config.default_tags, config.clean_tags);
        fields.insert("tags".into(), Value::Array(tags));

        let group_refs = group_names(fields.get("groups"), &config.default_groups);
        let groups = self.resolve_groups(scope, &group_refs).await?;
        fields.insert("groups".into(), Value::Array(groups));

        match self.resolve_owner_org(scope, &fields).await? {
            Some(org) => fields.insert("owner_org".into(), Value::String(org)),
            None => fields.remove("owner_org"),
        };
        fields.remove("organization");

        fill_missing(&mut fields, DATASET_DEFAULTS);
        fill_release_dates(&mut fields, existing);

        let placeholders = ExtraPlaceholders {
            harvest_source_id: source.id.clone(),
            harvest_source_url: source.base_url().to_string(),
            harvest_source_title: source.title.clone(),
            harvest_job_id: scope.job_id.to_string(),
            harvest_object_id: obj.id.to_string(),
            dataset_id: package_id.to_string(),
        };
        apply_default_extras(&mut extras, &config.default_extras, config.override_extras, &placeholders);
        fields.insert(
            "extras".into(),
            Value::Array(
                extras
                    .iter()
                    .map(|extra| json!({"key": extra.key, "value": extra.value}))
                    .collect(),
            ),
        );

        let mut ids = HashSet::new();
        let mut incoming = Vec::with_capacity(resources.len());
        for (idx, resource) in resources.into_iter().enumerate() {
            if non_empty_str(resource.get("url")).is_none() {
                let label = non_empty_str(resource.get("name")).unwrap_or("unnamed");
                self.store
                    .record_error(&HarvestErrorRecord::import(
                        scope.job_id,
                        obj.id,
                        format!("resource {idx} ({label}) of {} has no url", obj.guid),
                    ))
                    .await?;
            }
            incoming.push(prepare_resource(package_id, idx, resource, &mut ids));
        }
        let stored = existing
            .and_then(|pkg| pkg.get("resources"))
            .and_then(Value::as_array);
        let resources = match stored {
            Some(stored) => merge_resources(stored, incoming),
            None => incoming,
        };
        fields.insert(
            "resources".into(),
            Value::Array(resources.into_iter().map(Value::Object).collect()),
        );

        if let Some(existing) = existing {
            for field in config.not_overwrite_fields.iter().chain(&self.settings.not_overwrite_fields) {
                match existing.get(field) {
                    Some(value) => fields.insert(field.clone(), value.clone()),
                    None => fields.remove(field),
                };
            }
        }

        Ok(Value::Object(fields))
    }

    async fn resolve_groups(&self, scope: &ImportScope<'_>, names: &[String]) -> Result<Vec<Value>, ReconcileError> {
        let mut groups = Vec::with_capacity(names.len());
        for name in names {
            if let Some(group) = self.catalog.group_show(name).await? {
                let local = non_empty_str(group.get("name")).unwrap_or(name);
                groups.push(json!({"name": local}));
                continue;
            }
            if scope.source.config.remote_groups != RemoteEntityPolicy::Create {
                debug!(group = %name, "group not found locally; dropped");
                continue;
            }
            let Some(remote) = scope.remote else {
                warn!(group = %name, "group not found locally and the source has no catalog to copy it from");
                continue;
            };
            match remote.group_show(name).await? {
                Some(definition) => {
                    let created = self.catalog.group_create(&strip_remote_entity(definition)).await?;
                    let local = non_empty_str(created.get("name")).unwrap_or(name);
                    info!(group = %local, "group created from remote definition");
                    groups.push(json!({"name": local}));
                }
                None => warn!(group = %name, "group not found locally or remotely; dropped"),
            }
        }
        Ok(groups)
    }

    async fn resolve_owner_org(&self, scope: &ImportScope<'_>, fields: &JsonMap) -> Result<Option<String>, ReconcileError> {
        let reference = non_empty_str(fields.get("owner_org")).or_else(|| match fields.get("organization") {
            Some(Value::Object(org)) => non_empty_str(org.get("name")).or_else(|| non_empty_str(org.get("id"))),
            other => non_empty_str(other),
        });

        if let Some(reference) = reference {
            if let Some(org) = self.catalog.organization_show(reference).await? {
                return Ok(non_empty_str(org.get("id")).or(Some(reference)).map(str::to_string));
            }
            if scope.source.config.remote_orgs == RemoteEntityPolicy::Create {
                if let Some(remote) = scope.remote {
                    let definition = match remote.organization_show(reference).await? {
                        Some(org) => Some(org),
                        None => remote.group_show(reference).await?,
                    };
                    if let Some(definition) = definition {
                        let created = self
                            .catalog
                            .organization_create(&strip_remote_entity(definition))
                            .await?;
                        info!(organization = %reference, "organization created from remote definition");
                        return Ok(non_empty_str(created.get("id")).or(Some(reference)).map(str::to_string));
                    }
                }
            }
            debug!(organization = %reference, "organization not found locally; using the source owner");
        }
        Ok(scope.source.owner_org.clone())
    }
}

fn package_id_for(record: &CatalogRecord, guid: &str) -> String {
    let key = record.identifier().unwrap_or(guid);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
}

/// A package found by name only counts when its identifier does not contradict the record's.
fn same_dataset(package: &Value, record: &CatalogRecord) -> bool {
    match (non_empty_str(package.get("identifier")), record.identifier()) {
        (Some(stored), Some(incoming)) => stored == incoming,
        _ => true,
    }
}

/// Recency wins when both sides carry one; otherwise any content difference counts as newer.
fn is_newer(obj: &HarvestObject, prior: &HarvestObject) -> bool {
    match (obj.metadata_modified, prior.metadata_modified) {
        (Some(incoming), Some(stored)) => incoming > stored,
        _ => obj.content != prior.content,
    }
}

fn strip_remote_entity(definition: Value) -> Value {
    match definition {
        Value::Object(mut map) => {
            for key in REMOTE_ENTITY_STRIP {
                map.remove(*key);
            }
            Value::Object(map)
        }
        other => other,
    }
}

fn prepare_resource(package_id: &str, idx: usize, mut resource: JsonMap, ids: &mut HashSet<String>) -> JsonMap {
    resource.remove("url_type");
    resource.remove("revision_id");
    if let Some(old_id) = resource.remove("id") {
        if non_empty_str(Some(&old_id)).is_some() && !resource.contains_key("alternate_identifier") {
            resource.insert("alternate_identifier".into(), old_id);
        }
    }

    let url = non_empty_str(resource.get("url")).unwrap_or_default().to_string();
    let mut key = format!("{package_id}/{url}");
    if url.is_empty() || ids.contains(&key) {
        key = format!("{package_id}/{idx}/{url}");
    }
    let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string();
    ids.insert(key);
    resource.insert("id".into(), Value::String(id));

    fill_missing(&mut resource, RESOURCE_DEFAULTS);
    if let Some(format) = detect_format(non_empty_str(resource.get("format")), &url) {
        resource.insert("format".into(), Value::String(format));
    }
    let size = normalize_size(resource.get("size"));
    resource.insert("size".into(), Value::from(size));
    resource
}

/// Match by URL (by id for resources without one). A stored resource is replaced unless both sides
/// carry dates and the incoming one is not newer; unmatched stored resources are kept.
fn merge_resources(stored: &[Value], incoming: Vec<JsonMap>) -> Vec<JsonMap> {
    let mut merged: Vec<JsonMap> = stored.iter().filter_map(|r| r.as_object().cloned()).collect();
    for resource in incoming {
        let url = non_empty_str(resource.get("url")).map(str::to_string);
        let position = match &url {
            Some(url) => merged
                .iter()
                .position(|r| non_empty_str(r.get("url")) == Some(url.as_str())),
            None => merged
                .iter()
                .position(|r| r.get("id").is_some() && r.get("id") == resource.get("id")),
        };
        match position {
            Some(pos) => {
                let replace = match (resource_recency(&resource), resource_recency(&merged[pos])) {
                    (Some(incoming), Some(current)) => incoming > current,
                    _ => true,
                };
                if replace {
                    let mut resource = resource;
                    if let Some(id) = merged[pos].get("id").cloned() {
                        resource.insert("id".into(), id);
                    }
                    merged[pos] = resource;
                }
            }
            None => merged.push(resource),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::{HarvestConfig, HarvestJob, SourceKind};
    use harvest_storage::{MemoryCatalog, MemoryHarvestStore};

    fn source(config: Value) -> HarvestSource {
        HarvestSource {
            id: "remote".into(),
            title: "Remote".into(),
            kind: SourceKind::CatalogApi,
            url: "http://remote.example".into(),
            owner_org: Some("local-org".into()),
            enabled: true,
            config: HarvestConfig::from_value(&config).expect("config"),
        }
    }

    fn object(job: &HarvestJob, guid: &str, status: ObjectStatus, record: Value) -> HarvestObject {
        let record = CatalogRecord::from_value(record).expect("record");
        let mut obj = HarvestObject::new(job, guid, status);
        obj.metadata_modified = record.recency();
        obj.content = Some(serde_json::to_string(&record).expect("content"));
        obj
    }

    struct Fixture {
        store: Arc<MemoryHarvestStore>,
        catalog: Arc<MemoryCatalog>,
        reconciler: Reconciler,
    }

    fn fixture(catalog: MemoryCatalog) -> Fixture {
        let store = Arc::new(MemoryHarvestStore::new());
        let catalog = Arc::new(catalog);
        let reconciler = Reconciler::new(catalog.clone(), store.clone(), ImportSettings::default());
        Fixture {
            store,
            catalog,
            reconciler,
        }
    }

    async fn run_one(fx: &Fixture, src: &HarvestSource, obj: HarvestObject) -> Outcome {
        fx.store.persist_gathered(std::slice::from_ref(&obj)).await.expect("persist");
        let scope = ImportScope {
            source: src,
            job_id: obj.job_id,
            remote: None,
        };
        let mut owners = PackageOwners::new();
        fx.reconciler.reconcile(&scope, &obj, &mut owners).await.expect("reconcile")
    }

    #[tokio::test]
    async fn new_records_get_a_deterministic_id_and_defaults() {
        let fx = fixture(MemoryCatalog::new());
        let src = source(json!({"default_extras": {"harvest_url": "{harvest_source_url}/{dataset_id}"}}));
        let job = fx.store.create_job(&src.id).await.expect("job");
        let obj = object(
            &job,
            "D1",
            ObjectStatus::New,
            json!({
                "identifier": "D1",
                "name": "rivers",
                "title": "Rivers",
                "tag_string": "Agua, Ríos",
                "resources": [{"url": "http://x/r.csv", "id": "old", "size": "1.024"}]
            }),
        );
        assert_eq!(run_one(&fx, &src, obj).await, Outcome::Created);

        let packages = fx.catalog.packages().await;
        assert_eq!(packages.len(), 1);
        let pkg = &packages[0];
        let expected_id = Uuid::new_v5(&Uuid::NAMESPACE_URL, b"D1").to_string();
        assert_eq!(pkg["id"], json!(expected_id));
        assert_eq!(pkg["owner_org"], json!("local-org"));
        assert_eq!(pkg["license_id"], json!("cc-by"));
        assert_eq!(pkg["tags"][1]["name"], json!("rios"));
        assert_eq!(pkg["resources"][0]["alternate_identifier"], json!("old"));
        assert_eq!(pkg["resources"][0]["format"], json!("CSV"));
        assert_eq!(pkg["resources"][0]["size"], json!(1024));
        assert_eq!(
            pkg["extras"][0]["value"],
            json!(format!("http://remote.example/{expected_id}"))
        );
    }

    #[tokio::test]
    async fn taken_names_get_a_numeric_suffix() {
        let catalog = MemoryCatalog::new();
        catalog
            .package_create(&json!({"id": "other", "name": "rivers", "identifier": "OTHER"}))
            .await
            .expect("seed");
        let fx = fixture(catalog);
        let src = source(json!({}));
        let job = fx.store.create_job(&src.id).await.expect("job");
        let obj = object(&job, "D1", ObjectStatus::New, json!({"identifier": "D1", "name": "rivers"}));
        assert_eq!(run_one(&fx, &src, obj).await, Outcome::Created);

        let names: Vec<Value> = fx.catalog.packages().await.iter().map(|p| p["name"].clone()).collect();
        assert!(names.contains(&json!("rivers-1")));
    }

    #[tokio::test]
    async fn not_newer_changes_leave_the_package_alone() {
        let fx = fixture(MemoryCatalog::new());
        let src = source(json!({}));
        let record = json!({"identifier": "D1", "name": "rivers", "modified": "2024-01-01"});

        let job = fx.store.create_job(&src.id).await.expect("job");
        let first = object(&job, "D1", ObjectStatus::New, record.clone());
        assert_eq!(run_one(&fx, &src, first).await, Outcome::Created);
        fx.store.finish_job(job.id, JobStatus::Finished).await.expect("finish");
        let writes = fx.catalog.writes().await;

        let job = fx.store.create_job(&src.id).await.expect("job");
        let mut again = object(&job, "D1", ObjectStatus::Change, record);
        let prior = fx.store.current_object(&src.id, "D1").await.expect("current").expect("prior");
        again.package_id = prior.package_id.clone();
        let again_id = again.id;
        assert_eq!(run_one(&fx, &src, again).await, Outcome::Unchanged);
        assert_eq!(fx.catalog.writes().await, writes);

        let current = fx.store.current_object(&src.id, "D1").await.expect("current").expect("still current");
        assert_eq!(current.id, prior.id);
        assert_ne!(current.id, again_id);
    }

    #[tokio::test]
    async fn deletes_respect_the_override_setting() {
        let fx = fixture(MemoryCatalog::new());
        let kept = source(json!({}));
        let job = fx.store.create_job(&kept.id).await.expect("job");
        let created = object(&job, "D1", ObjectStatus::New, json!({"identifier": "D1", "name": "rivers"}));
        assert_eq!(run_one(&fx, &kept, created).await, Outcome::Created);
        fx.store.finish_job(job.id, JobStatus::Finished).await.expect("finish");
        let package_id = fx.catalog.packages().await[0]["id"].as_str().map(str::to_string);

        let job = fx.store.create_job(&kept.id).await.expect("job");
        let mut gone = HarvestObject::new(&job, "D1", ObjectStatus::Delete);
        gone.package_id = package_id.clone();
        assert_eq!(run_one(&fx, &kept, gone).await, Outcome::Unchanged);
        assert_eq!(fx.catalog.packages().await[0]["state"], json!("active"));

        let overriding = source(json!({"override_local_datasets": true}));
        let mut gone = HarvestObject::new(&job, "D1", ObjectStatus::Delete);
        gone.package_id = package_id;
        assert_eq!(run_one(&fx, &overriding, gone).await, Outcome::Deleted);
        assert_eq!(fx.catalog.packages().await[0]["state"], json!("deleted"));
    }

    #[tokio::test]
    async fn a_package_owned_by_another_guid_is_a_conflict() {
        let fx = fixture(MemoryCatalog::new());
        let src = source(json!({}));
        let job = fx.store.create_job(&src.id).await.expect("job");
        let first = object(&job, "uri:a", ObjectStatus::New, json!({"identifier": "D1", "uri": "uri:a"}));
        let second = object(&job, "uri:b", ObjectStatus::New, json!({"identifier": "D1", "uri": "uri:b"}));
        fx.store
            .persist_gathered(&[first.clone(), second.clone()])
            .await
            .expect("persist");

        let scope = ImportScope {
            source: &src,
            job_id: job.id,
            remote: None,
        };
        let mut owners = PackageOwners::new();
        let r = &fx.reconciler;
        assert_eq!(r.reconcile(&scope, &first, &mut owners).await.expect("first"), Outcome::Created);
        assert_eq!(r.reconcile(&scope, &second, &mut owners).await.expect("second"), Outcome::Failed);

        let errors = fx.store.job_errors(job.id).await.expect("errors");
        assert!(errors[0].message.contains("already has package"));
        assert!(errors[0].message.contains("under guid uri:a"));
    }

    #[tokio::test]
    async fn catalog_validation_errors_fail_only_the_object() {
        let fx = fixture(MemoryCatalog::new().with_required_fields(&["title"]));
        let src = source(json!({}));
        let job = fx.store.create_job(&src.id).await.expect("job");
        let obj = object(&job, "D1", ObjectStatus::New, json!({"identifier": "D1", "name": "rivers"}));
        let obj_id = obj.id;
        assert_eq!(run_one(&fx, &src, obj).await, Outcome::Failed);

        let errors = fx.store.job_errors(job.id).await.expect("errors");
        assert!(errors[0].message.contains("Validation Error: title"));
        let stored = fx.store.all_objects().await;
        let failed = stored.iter().find(|o| o.id == obj_id).expect("object");
        assert_eq!(failed.state, ObjectState::Error);
        assert!(!failed.current);
    }

    #[test]
    fn resources_merge_by_url_and_keep_unmatched_ones() {
        let stored = vec![
            json!({"id": "r1", "url": "http://x/a.csv", "modified": "2024-01-01"}),
            json!({"id": "r2", "url": "http://x/b.csv", "modified": "2024-01-01"}),
        ];
        let mut newer = JsonMap::new();
        newer.insert("url".into(), json!("http://x/a.csv"));
        newer.insert("modified".into(), json!("2024-06-01"));
        newer.insert("id".into(), json!("fresh"));
        let mut older = JsonMap::new();
        older.insert("url".into(), json!("http://x/b.csv"));
        older.insert("modified".into(), json!("2023-01-01"));
        let mut added = JsonMap::new();
        added.insert("url".into(), json!("http://x/c.csv"));

        let merged = merge_resources(&stored, vec![newer, older, added]);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0]["modified"], json!("2024-06-01"));
        assert_eq!(merged[0]["id"], json!("r1"));
        assert_eq!(merged[1]["modified"], json!("2024-01-01"));
        assert_eq!(merged[2]["url"], json!("http://x/c.csv"));
    }

    #[test]
    fn remote_entities_lose_their_volatile_keys() {
        let stripped = strip_remote_entity(json!({
            "name": "env", "title": "Environment", "packages": [], "users": [], "type": "organization"
        }));
        assert_eq!(stripped, json!({"name": "env", "title": "Environment"}));
    }

    #[tokio::test]
    async fn organizations_and_groups_are_copied_from_the_remote_on_demand() {
        let local = MemoryCatalog::new();
        local.insert_group(json!({"id": "g-maps", "name": "maps"})).await;
        let fx = fixture(local);

        let remote = MemoryCatalog::new();
        remote
            .insert_organization(json!({"id": "r-hydro", "name": "hydro", "users": [{"name": "ana"}], "packages": []}))
            .await;
        remote
            .insert_group(json!({"id": "r-water", "name": "water", "display_name": "Water", "packages": []}))
            .await;

        let src = source(json!({"remote_orgs": "create", "remote_groups": "create"}));
        let job = fx.store.create_job(&src.id).await.expect("job");
        let obj = object(
            &job,
            "D9",
            ObjectStatus::New,
            json!({"identifier": "D9", "name": "lakes", "title": "Lakes", "owner_org": "hydro", "groups": ["water", "maps", "nowhere"]}),
        );
        fx.store.persist_gathered(std::slice::from_ref(&obj)).await.expect("persist");
        let scope = ImportScope {
            source: &src,
            job_id: obj.job_id,
            remote: Some(&remote),
        };
        let outcome = fx
            .reconciler
            .reconcile(&scope, &obj, &mut PackageOwners::new())
            .await
            .expect("reconcile");
        assert_eq!(outcome, Outcome::Created);

        let org = fx.catalog.organization_show("hydro").await.expect("show").expect("org copied");
        assert!(org.get("users").is_none());
        assert!(org.get("packages").is_none());
        assert!(fx.catalog.group_show("water").await.expect("show").is_some());

        let pkg = &fx.catalog.packages().await[0];
        assert_eq!(pkg["owner_org"], json!("r-hydro"));
        assert_eq!(pkg["groups"], json!([{"name": "water"}, {"name": "maps"}]));
    }

    #[tokio::test]
    async fn local_only_policy_falls_back_to_the_source_owner() {
        let fx = fixture(MemoryCatalog::new());
        let src = source(json!({}));
        let job = fx.store.create_job(&src.id).await.expect("job");
        let obj = object(
            &job,
            "D10",
            ObjectStatus::New,
            json!({"identifier": "D10", "name": "wells", "title": "Wells", "owner_org": "hydro", "groups": ["water"]}),
        );
        assert_eq!(run_one(&fx, &src, obj).await, Outcome::Created);

        let pkg = &fx.catalog.packages().await[0];
        assert_eq!(pkg["owner_org"], json!("local-org"));
        assert_eq!(pkg["groups"], json!([]));
        assert!(fx.catalog.organization_show("hydro").await.expect("show").is_none());
    }

    #[tokio::test]
    async fn source_url_placeholder_has_no_trailing_slash() {
        let fx = fixture(MemoryCatalog::new());
        let mut src = source(json!({"default_extras": {"harvest_url": "{harvest_source_url}/{dataset_id}"}}));
        src.url = "http://remote.example/".into();
        let job = fx.store.create_job(&src.id).await.expect("job");
        let obj = object(&job, "D11", ObjectStatus::New, json!({"identifier": "D11", "name": "springs", "title": "Springs"}));
        assert_eq!(run_one(&fx, &src, obj).await, Outcome::Created);

        let pkg = &fx.catalog.packages().await[0];
        let id = pkg["id"].as_str().unwrap_or_default();
        assert_eq!(pkg["extras"][0]["value"], json!(format!("http://remote.example/{id}")));
    }
}
