//! Local and per-source remote schemas, cached for the life of a pipeline.

use std::collections::HashMap;

use harvest_adapters::{AdapterContext, AdapterError, SourceAdapter};
use harvest_core::{HarvestError, HarvestSource, NormalizedMapping, SourceMappings};
use harvest_storage::{CatalogClient, CatalogError, CatalogSchema};
use tokio::sync::RwLock;
use tracing::debug;

/// Core package/resource keys every catalog accepts whether or not its schema lists them.
const CORE_DATASET_FIELDS: &[&str] = &[
    "id",
    "name",
    "title",
    "notes",
    "url",
    "version",
    "state",
    "type",
    "tags",
    "tag_string",
    "groups",
    "owner_org",
    "organization",
    "extras",
    "resources",
    "metadata_created",
    "metadata_modified",
];
const CORE_RESOURCE_FIELDS: &[&str] = &["id", "url", "name", "description", "format", "size", "created", "last_modified"];

#[derive(Debug, Clone)]
struct CachedRemote {
    fingerprint: String,
    schema: Option<CatalogSchema>,
}

/// Schemas shared by every job of a pipeline. A source's entry is dropped when its configuration changes.
#[derive(Debug, Default)]
pub struct SchemaCache {
    local: RwLock<Option<Option<CatalogSchema>>>,
    remote: RwLock<HashMap<String, CachedRemote>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn local_schema(&self, catalog: &dyn CatalogClient) -> Result<Option<CatalogSchema>, CatalogError> {
        if let Some(cached) = self.local.read().await.as_ref() {
            return Ok(cached.clone());
        }
        let schema = catalog.schema_show().await?;
        *self.local.write().await = Some(schema.clone());
        Ok(schema)
    }

    pub async fn remote_schema(
        &self,
        adapter: &dyn SourceAdapter,
        ctx: &AdapterContext,
        source: &HarvestSource,
    ) -> Result<Option<CatalogSchema>, AdapterError> {
        let fingerprint = source.config.fingerprint();
        if let Some(cached) = self.remote.read().await.get(&source.id) {
            if cached.fingerprint == fingerprint {
                return Ok(cached.schema.clone());
            }
            debug!(source_id = %source.id, "source configuration changed; refreshing remote schema");
        }
        let schema = adapter.remote_schema(ctx, source).await?;
        self.remote.write().await.insert(
            source.id.clone(),
            CachedRemote {
                fingerprint,
                schema: schema.clone(),
            },
        );
        Ok(schema)
    }

    pub async fn invalidate(&self, source_id: &str) {
        self.remote.write().await.remove(source_id);
    }

    pub async fn invalidate_local(&self) {
        *self.local.write().await = None;
    }
}

fn missing_references<'a>(
    mapping: &'a NormalizedMapping,
    known: impl Fn(&str) -> bool,
) -> Vec<&'a str> {
    mapping
        .direct_references()
        .into_iter()
        .filter(|name| !known(*name))
        .collect()
}

/// Every field a mapping reads by name must exist in the remote schema.
pub fn check_remote_fields(schema: &CatalogSchema, mappings: &SourceMappings) -> Result<(), HarvestError> {
    let mut missing = Vec::new();
    if let Some(mapping) = &mappings.dataset {
        missing.extend(missing_references(mapping, |name| {
            CORE_DATASET_FIELDS.contains(&name) || schema.has_dataset_field(name)
        }));
    }
    if let Some(mapping) = &mappings.distribution {
        missing.extend(missing_references(mapping, |name| {
            CORE_RESOURCE_FIELDS.contains(&name) || schema.has_resource_field(name)
        }));
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(HarvestError::SchemaMismatch(format!(
            "remote schema has no field(s): {}",
            missing.join(", ")
        )))
    }
}

/// Every local field a mapping writes must exist in the local schema (translated fields by stem or full name).
pub fn check_local_fields(schema: &CatalogSchema, mappings: &SourceMappings) -> Result<(), HarvestError> {
    let known_dataset = |name: &str| {
        let stem = name.strip_suffix("_translated").unwrap_or(name);
        CORE_DATASET_FIELDS.contains(&name) || schema.has_dataset_field(name) || schema.has_dataset_field(stem)
    };
    let known_resource = |name: &str| {
        let stem = name.strip_suffix("_translated").unwrap_or(name);
        CORE_RESOURCE_FIELDS.contains(&name) || schema.has_resource_field(name) || schema.has_resource_field(stem)
    };

    let mut unknown: Vec<String> = Vec::new();
    if let Some(mapping) = &mappings.dataset {
        unknown.extend(mapping.fields.keys().filter(|f| !known_dataset(f.as_str())).cloned());
    }
    if let Some(mapping) = &mappings.distribution {
        unknown.extend(mapping.fields.keys().filter(|f| !known_resource(f.as_str())).cloned());
    }
    if unknown.is_empty() {
        Ok(())
    } else {
        Err(HarvestError::Configuration(format!(
            "field mapping targets fields missing from the local schema: {}",
            unknown.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use harvest_adapters::FetchOutcome;
    use harvest_core::{HarvestConfig, SourceKind};
    use harvest_storage::{HttpClientConfig, HttpFetcher, SchemaField};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn field(name: &str) -> SchemaField {
        SchemaField {
            field_name: name.to_string(),
            ..Default::default()
        }
    }

    fn schema() -> CatalogSchema {
        CatalogSchema {
            dataset_type: Some("dataset".into()),
            dataset_fields: vec![field("title_translated"), field("spatial_uri")],
            resource_fields: vec![field("rights")],
        }
    }

    fn source(config: serde_json::Value) -> HarvestSource {
        HarvestSource {
            id: "remote".into(),
            title: "Remote".into(),
            kind: SourceKind::CatalogApi,
            url: "http://remote.example".into(),
            owner_org: None,
            enabled: true,
            config: HarvestConfig::from_value(&config).expect("config"),
        }
    }

    #[test]
    fn missing_remote_fields_are_a_schema_mismatch() {
        let src = source(json!({
            "field_mapping_schema_version": 2,
            "dataset_field_mapping": {
                "title": {"field_name": "title"},
                "spatial": {"field_name": "spatial_uri"},
                "theme": {"field_name": "theme_code"}
            },
            "distribution_field_mapping": {"license": {"field_name": "rights"}}
        }));
        let err = check_remote_fields(&schema(), &src.config.mappings).expect_err("mismatch");
        assert!(matches!(err, HarvestError::SchemaMismatch(_)));
        assert!(err.to_string().contains("theme_code"));
        assert!(!err.to_string().contains("spatial_uri"));
    }

    #[test]
    fn local_fields_accept_translated_stems() {
        let src = source(json!({
            "field_mapping_schema_version": 1,
            "dataset_field_mapping": {"title": "t", "owner_org": "org"}
        }));
        assert!(check_local_fields(&schema(), &src.config.mappings).is_ok());

        let src = source(json!({
            "field_mapping_schema_version": 1,
            "dataset_field_mapping": {"colour": "c"}
        }));
        let err = check_local_fields(&schema(), &src.config.mappings).expect_err("unknown");
        assert!(err.to_string().contains("colour"));
    }

    struct CountingAdapter(AtomicUsize);

    #[async_trait]
    impl SourceAdapter for CountingAdapter {
        fn kind(&self) -> SourceKind {
            SourceKind::CatalogApi
        }

        fn validate_config(&self, _source: &HarvestSource) -> Result<(), HarvestError> {
            Ok(())
        }

        async fn fetch(&self, _ctx: &AdapterContext, _source: &HarvestSource) -> Result<FetchOutcome, AdapterError> {
            Ok(FetchOutcome::full(Vec::new()))
        }

        async fn remote_schema(
            &self,
            _ctx: &AdapterContext,
            _source: &HarvestSource,
        ) -> Result<Option<CatalogSchema>, AdapterError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Some(schema()))
        }
    }

    #[tokio::test]
    async fn remote_schemas_are_refetched_after_a_config_change() {
        let adapter = CountingAdapter(AtomicUsize::new(0));
        let ctx = AdapterContext::new(Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("http")));
        let cache = SchemaCache::new();

        let src = source(json!({"clean_tags": true}));
        cache.remote_schema(&adapter, &ctx, &src).await.expect("first");
        cache.remote_schema(&adapter, &ctx, &src).await.expect("cached");
        assert_eq!(adapter.0.load(Ordering::SeqCst), 1);

        let changed = source(json!({"clean_tags": false}));
        cache.remote_schema(&adapter, &ctx, &changed).await.expect("changed");
        assert_eq!(adapter.0.load(Ordering::SeqCst), 2);

        cache.invalidate(&changed.id).await;
        cache.remote_schema(&adapter, &ctx, &changed).await.expect("invalidated");
        assert_eq!(adapter.0.load(Ordering::SeqCst), 3);
    }
}
