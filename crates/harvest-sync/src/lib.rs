//! Harvest pipeline orchestration: source registry, gather, import, reports and scheduling.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use harvest_adapters::{adapter_for_kind, SourceAdapter};
use harvest_core::{HarvestConfig, HarvestSource, Outcome, SourceKind};
use harvest_storage::{
    CatalogClient, CkanActionClient, HarvestStore, HttpClientConfig, HttpFetcher, MemoryCatalog,
    MemoryHarvestStore, PayloadArchive, PgHarvestStore, TokenBucketConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod defaults;
pub mod gather;
pub mod reconcile;
pub mod schema;
pub mod transform;

pub use gather::{classify, Classification, GatherReport, GatherSettings, Gatherer};
pub use reconcile::{ImportReport, ImportScope, ImportSettings, PackageOwners, Reconciler};
pub use schema::SchemaCache;
pub use transform::{transform_record, TransformedRecord};

pub const CRATE_NAME: &str = "harvest-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub id: String,
    pub title: String,
    pub kind: SourceKind,
    pub url: String,
    #[serde(default)]
    pub owner_org: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Configuration document, as a YAML mapping or a JSON string.
    #[serde(default)]
    pub config: Value,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceEntry {
    pub fn into_source(self) -> Result<HarvestSource> {
        let config = HarvestConfig::from_value(&self.config)
            .with_context(|| format!("configuration of source {}", self.id))?;
        Ok(HarvestSource {
            id: self.id,
            title: self.title,
            kind: self.kind,
            url: self.url,
            owner_org: self.owner_org,
            enabled: self.enabled,
            config,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub sources_path: PathBuf,
    /// `None` selects the in-memory catalog (dry run).
    pub catalog_url: Option<String>,
    pub catalog_api_key: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Minimum spacing between requests, shared by every source.
    pub http_min_interval_ms: Option<u64>,
    pub transform_concurrency: usize,
    pub source_concurrency: usize,
    pub watermark_skew_secs: i64,
    pub required_lang: String,
    pub not_overwrite_fields: Vec<String>,
    pub force_import: bool,
    /// Ignore incremental watermarks for this process.
    pub full_fetch: bool,
    pub scheduler_enabled: bool,
    pub cron: String,
    pub reports_dir: PathBuf,
    pub archive_dir: Option<PathBuf>,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: env_non_empty("DATABASE_URL").filter(|v| v != "memory"),
            sources_path: std::env::var("HARVEST_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
            catalog_url: env_non_empty("HARVEST_CATALOG_URL"),
            catalog_api_key: env_non_empty("HARVEST_CATALOG_API_KEY"),
            user_agent: std::env::var("HARVEST_USER_AGENT")
                .unwrap_or_else(|_| "metadata-harvester/0.1".to_string()),
            http_timeout_secs: std::env::var("HARVEST_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            http_min_interval_ms: std::env::var("HARVEST_HTTP_MIN_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|ms| *ms > 0),
            transform_concurrency: std::env::var("HARVEST_TRANSFORM_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            source_concurrency: std::env::var("HARVEST_SOURCE_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            watermark_skew_secs: std::env::var("HARVEST_WATERMARK_SKEW_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3600),
            required_lang: std::env::var("HARVEST_REQUIRED_LANG").unwrap_or_else(|_| "en".to_string()),
            not_overwrite_fields: std::env::var("HARVEST_NOT_OVERWRITE_FIELDS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|f| !f.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            force_import: env_flag("HARVEST_FORCE_IMPORT"),
            full_fetch: false,
            scheduler_enabled: env_flag("HARVEST_SCHEDULER_ENABLED"),
            cron: std::env::var("HARVEST_CRON").unwrap_or_else(|_| "0 0 3 * * *".to_string()),
            reports_dir: std::env::var("HARVEST_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            archive_dir: env_non_empty("HARVEST_ARCHIVE_DIR").map(PathBuf::from),
        }
    }

    pub fn gather_settings(&self) -> GatherSettings {
        GatherSettings {
            transform_concurrency: self.transform_concurrency,
            watermark_skew: chrono::Duration::seconds(self.watermark_skew_secs),
            force: self.full_fetch,
            required_lang: self.required_lang.clone(),
        }
    }

    pub fn import_settings(&self) -> ImportSettings {
        ImportSettings {
            force: self.force_import,
            not_overwrite_fields: self.not_overwrite_fields.clone(),
        }
    }
}

/// Called around every package write of the import stage.
pub trait PackageHook: Send + Sync {
    /// May edit the package; an error fails the object.
    fn before_write(&self, source: &HarvestSource, package: &mut Value) -> Result<()>;
    fn after_write(&self, source: &HarvestSource, package: &Value, outcome: Outcome) -> Result<()>;
}

#[derive(Default)]
pub struct NoopPackageHook;

impl PackageHook for NoopPackageHook {
    fn before_write(&self, _source: &HarvestSource, _package: &mut Value) -> Result<()> {
        Ok(())
    }

    fn after_write(&self, _source: &HarvestSource, _package: &Value, _outcome: Outcome) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRunReport {
    pub source_id: String,
    pub kind: SourceKind,
    pub job_id: Option<Uuid>,
    pub gather: Option<GatherReport>,
    pub import: Option<ImportReport>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_sources: usize,
    pub failed_sources: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub failed_objects: usize,
    pub sources: Vec<SourceRunReport>,
    pub reports_dir: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceValidation {
    pub source_id: String,
    pub ok: bool,
    pub message: Option<String>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn HarvestStore>,
    catalog: Arc<dyn CatalogClient>,
    http: Arc<HttpFetcher>,
    archive: Option<PayloadArchive>,
    schema_cache: SchemaCache,
    hook: Arc<dyn PackageHook>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    cancel: CancellationToken,
}

impl SyncPipeline {
    /// Build the store and catalog the configuration names.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let store: Arc<dyn HarvestStore> = match config.database_url.as_deref() {
            Some(url) => {
                let store = PgHarvestStore::connect(url)
                    .await
                    .context("connecting to the harvest database")?;
                store.migrate().await.context("running migrations")?;
                Arc::new(store)
            }
            None => {
                warn!("DATABASE_URL not set; harvest state is kept in memory");
                Arc::new(MemoryHarvestStore::new())
            }
        };
        let http = Arc::new(build_http(&config)?);
        let catalog: Arc<dyn CatalogClient> = match config.catalog_url.as_deref() {
            Some(url) => Arc::new(CkanActionClient::new(
                url,
                config.catalog_api_key.clone(),
                Arc::clone(&http),
            )),
            None => {
                warn!("HARVEST_CATALOG_URL not set; writing to an in-memory catalog");
                Arc::new(MemoryCatalog::new())
            }
        };
        Ok(Self::assemble(config, store, catalog, http))
    }

    pub fn with_backends(
        config: SyncConfig,
        store: Arc<dyn HarvestStore>,
        catalog: Arc<dyn CatalogClient>,
    ) -> Result<Self> {
        let http = Arc::new(build_http(&config)?);
        Ok(Self::assemble(config, store, catalog, http))
    }

    fn assemble(
        config: SyncConfig,
        store: Arc<dyn HarvestStore>,
        catalog: Arc<dyn CatalogClient>,
        http: Arc<HttpFetcher>,
    ) -> Self {
        let archive = config.archive_dir.clone().map(PayloadArchive::new);
        Self {
            config,
            store,
            catalog,
            http,
            archive,
            schema_cache: SchemaCache::new(),
            hook: Arc::new(NoopPackageHook),
            adapters: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn PackageHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Use `adapter` for every source of its kind instead of the built-in one.
    pub fn with_adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.adapters.retain(|a| a.kind() != adapter.kind());
        self.adapters.push(adapter);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn HarvestStore> {
        Arc::clone(&self.store)
    }

    pub fn schema_cache(&self) -> &SchemaCache {
        &self.schema_cache
    }

    fn adapter(&self, kind: SourceKind) -> Arc<dyn SourceAdapter> {
        self.adapters
            .iter()
            .find(|a| a.kind() == kind)
            .cloned()
            .unwrap_or_else(|| Arc::from(adapter_for_kind(kind)))
    }

    pub async fn load_sources(&self) -> Result<Vec<HarvestSource>> {
        let registry = load_source_registry(&self.config.sources_path).await?;
        registry.sources.into_iter().map(SourceEntry::into_source).collect()
    }

    pub async fn source(&self, source_id: &str) -> Result<HarvestSource> {
        self.load_sources()
            .await?
            .into_iter()
            .find(|s| s.id == source_id)
            .with_context(|| format!("source {source_id} is not in {}", self.config.sources_path.display()))
    }

    /// Gather and import every enabled source of the registry.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let sources: Vec<_> = self.load_sources().await?.into_iter().filter(|s| s.enabled).collect();
        self.run_sources(&sources).await
    }

    pub async fn run_sources(&self, sources: &[HarvestSource]) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, sources = sources.len(), "harvest run started");

        let mut reports: Vec<SourceRunReport> = stream::iter(sources.iter().cloned())
            .map(|source| async move { self.run_source(run_id, &source).await })
            .buffer_unordered(self.config.source_concurrency.max(1))
            .collect()
            .await;
        reports.sort_by(|a, b| a.source_id.cmp(&b.source_id));

        let reports_dir = self.config.reports_dir.join(run_id.to_string());
        let imports = reports.iter().filter_map(|r| r.import.as_ref());
        let (mut created, mut updated, mut unchanged, mut deleted, mut failed_objects) = (0, 0, 0, 0, 0);
        for import in imports {
            created += import.created;
            updated += import.updated;
            unchanged += import.unchanged;
            deleted += import.deleted;
            failed_objects += import.failed;
        }
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            enabled_sources: sources.len(),
            failed_sources: reports.iter().filter(|r| r.error.is_some()).count(),
            created,
            updated,
            unchanged,
            deleted,
            failed_objects,
            sources: reports,
            reports_dir: reports_dir.display().to_string(),
        };
        self.write_reports(&reports_dir, &summary).await?;
        info!(
            %run_id,
            created,
            updated,
            deleted,
            failed_sources = summary.failed_sources,
            "harvest run finished"
        );
        Ok(summary)
    }

    /// Gather then import one source. Failures end up in the report, not in the return value.
    pub async fn run_source(&self, run_id: Uuid, source: &HarvestSource) -> SourceRunReport {
        let mut report = SourceRunReport {
            source_id: source.id.clone(),
            kind: source.kind,
            job_id: None,
            gather: None,
            import: None,
            error: None,
        };
        let gathered = match self.gather(run_id, source).await {
            Ok(gathered) => gathered,
            Err(err) => {
                error!(source_id = %source.id, error = %format!("{err:#}"), "gather failed");
                report.error = Some(format!("{err:#}"));
                return report;
            }
        };
        let job_id = gathered.job_id;
        report.job_id = Some(job_id);
        report.gather = Some(gathered);

        match self.import(run_id, source, job_id).await {
            Ok(imported) => report.import = Some(imported),
            Err(err) => {
                error!(source_id = %source.id, %job_id, error = %format!("{err:#}"), "import failed");
                report.error = Some(format!("{err:#}"));
            }
        }
        report
    }

    pub async fn gather(&self, run_id: Uuid, source: &HarvestSource) -> Result<GatherReport> {
        let settings = self.config.gather_settings();
        let adapter = self.adapter(source.kind);
        let gatherer = Gatherer {
            store: self.store.as_ref(),
            schema_cache: &self.schema_cache,
            archive: self.archive.as_ref(),
            http: Arc::clone(&self.http),
            cancel: self.cancel.clone(),
            run_id,
            settings: &settings,
        };
        gatherer.gather_with(adapter.as_ref(), source).await
    }

    pub async fn import(&self, run_id: Uuid, source: &HarvestSource, job_id: Uuid) -> Result<ImportReport> {
        let remote = match source.kind {
            SourceKind::CatalogApi => Some(
                CkanActionClient::new(source.base_url(), source.config.api_key.clone(), Arc::clone(&self.http))
                    .for_run(run_id, &source.id),
            ),
            _ => None,
        };
        let scope = ImportScope {
            source,
            job_id,
            remote: remote.as_ref().map(|client| client as &dyn CatalogClient),
        };
        let reconciler = Reconciler::new(
            Arc::clone(&self.catalog),
            Arc::clone(&self.store),
            self.config.import_settings(),
        )
        .with_hook(Arc::clone(&self.hook));
        reconciler.import_job(&scope, &self.cancel).await
    }

    /// Check each source's configuration and its mappings against the local schema.
    pub async fn validate_sources(&self, only: Option<&str>) -> Result<Vec<SourceValidation>> {
        let registry = load_source_registry(&self.config.sources_path).await?;
        let local_schema = match self.schema_cache.local_schema(self.catalog.as_ref()).await {
            Ok(schema) => schema,
            Err(err) => {
                warn!(error = %err, "local schema unavailable; mapped fields are not checked");
                None
            }
        };

        let mut results = Vec::new();
        for entry in registry.sources {
            if only.is_some_and(|id| id != entry.id) {
                continue;
            }
            let source_id = entry.id.clone();
            let checked = entry.into_source().and_then(|source| {
                self.adapter(source.kind).validate_config(&source)?;
                if let Some(schema) = &local_schema {
                    schema::check_local_fields(schema, &source.config.mappings)?;
                }
                Ok(())
            });
            results.push(match checked {
                Ok(()) => SourceValidation {
                    source_id,
                    ok: true,
                    message: None,
                },
                Err(err) => SourceValidation {
                    source_id,
                    ok: false,
                    message: Some(format!("{err:#}")),
                },
            });
        }
        if let Some(id) = only {
            if results.is_empty() {
                anyhow::bail!("source {id} is not in {}", self.config.sources_path.display());
            }
        }
        Ok(results)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = &self.config.cron;
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled harvest finished"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled harvest failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    async fn write_reports(&self, reports_dir: &Path, summary: &SyncRunSummary) -> Result<()> {
        fs::create_dir_all(reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let json = serde_json::to_vec_pretty(summary).context("serializing harvest summary")?;
        fs::write(reports_dir.join("harvest_summary.json"), json)
            .await
            .context("writing harvest_summary.json")?;

        let brief = format!(
            "# Harvest Run\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Sources: {} ({} failed)\n- Packages: {} created, {} updated, {} unchanged, {} deleted, {} failed\n\n## Sources\n{}\n",
            summary.run_id,
            summary.started_at,
            summary.finished_at,
            summary.enabled_sources,
            summary.failed_sources,
            summary.created,
            summary.updated,
            summary.unchanged,
            summary.deleted,
            summary.failed_objects,
            summary
                .sources
                .iter()
                .map(|s| match &s.error {
                    Some(err) => format!("- {}: failed ({err})", s.source_id),
                    None => format!(
                        "- {}: {} new, {} changed, {} gone",
                        s.source_id,
                        s.gather.as_ref().map(|g| g.new).unwrap_or_default(),
                        s.gather.as_ref().map(|g| g.change).unwrap_or_default(),
                        s.gather.as_ref().map(|g| g.delete).unwrap_or_default()
                    ),
                })
                .collect::<Vec<_>>()
                .join("\n")
        );
        fs::write(reports_dir.join("harvest_brief.md"), brief)
            .await
            .context("writing harvest_brief.md")?;
        Ok(())
    }
}

fn build_http(config: &SyncConfig) -> Result<HttpFetcher> {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        token_bucket: config.http_min_interval_ms.map(|ms| TokenBucketConfig {
            capacity: 1,
            refill_every: Duration::from_millis(ms),
        }),
        ..Default::default()
    })
}

pub async fn load_source_registry(path: &Path) -> Result<SourceRegistry> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Apply the SQL migrations to the configured database.
pub async fn migrate(config: &SyncConfig) -> Result<()> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is not set; nothing to migrate")?;
    let store = PgHarvestStore::connect(url)
        .await
        .context("connecting to the harvest database")?;
    store.migrate().await.context("running migrations")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn registry_accepts_yaml_and_json_string_configs() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("sources.yaml");
        std::fs::write(
            &path,
            r#"
sources:
  - id: env
    title: Environment portal
    kind: catalog_api
    url: https://data.example.org
    owner_org: env-agency
    config:
      default_tags: [water]
      remote_orgs: create
  - id: sheet
    title: Inventory
    kind: spreadsheet
    url: doc-123
    enabled: false
    config: '{"dataset_sheet": "Datasets", "credentials": {"api_key": "k"}}'
"#,
        )
        .expect("write");

        let registry = load_source_registry(&path).await.expect("registry");
        let sources: Vec<HarvestSource> = registry
            .sources
            .into_iter()
            .map(|e| e.into_source().expect("source"))
            .collect();
        assert_eq!(sources.len(), 2);
        assert!(sources[0].enabled);
        assert_eq!(sources[0].config.default_tags[0].name(), "water");
        assert!(!sources[1].enabled);
        assert_eq!(sources[1].kind, SourceKind::Spreadsheet);
    }

    #[tokio::test]
    async fn invalid_source_configs_name_the_source() {
        let entry = SourceEntry {
            id: "broken".into(),
            title: "Broken".into(),
            kind: SourceKind::CatalogApi,
            url: "http://x".into(),
            owner_org: None,
            enabled: true,
            config: serde_json::json!({"remote_orgs": "sometimes"}),
        };
        let err = entry.into_source().expect_err("invalid");
        assert!(format!("{err:#}").contains("broken"));
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn scheduled_runs_can_cross_threads() {
        let dir = tempdir().expect("tempdir");
        let mut config = SyncConfig::from_env();
        config.database_url = None;
        config.catalog_url = None;
        config.reports_dir = dir.path().to_path_buf();
        config.scheduler_enabled = true;
        config.cron = "0 0 3 * * *".to_string();
        let pipeline = Arc::new(
            SyncPipeline::with_backends(config, Arc::new(MemoryHarvestStore::new()), Arc::new(MemoryCatalog::new()))
                .expect("pipeline"),
        );

        let sources: Vec<HarvestSource> = Vec::new();
        assert_send(&pipeline.run_sources(&sources));
        assert_send(&pipeline.run_once());

        assert!(pipeline.maybe_build_scheduler().await.expect("scheduler").is_some());
    }
}
