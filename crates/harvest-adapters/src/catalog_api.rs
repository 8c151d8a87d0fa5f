//! Paged harvesting from a remote CKAN-style catalog search API.

use std::collections::HashSet;

use async_trait::async_trait;
use harvest_core::{HarvestError, HarvestSource, RawRecord, SourceKind};
use harvest_storage::{CatalogClient, CatalogError, CatalogSchema, CkanActionClient};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{AdapterContext, AdapterError, FetchOutcome, FetchScope, RawPayload, SourceAdapter};

pub const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CatalogApiOptions {
    #[serde(default)]
    pub organizations_filter_include: Vec<String>,
    #[serde(default)]
    pub organizations_filter_exclude: Vec<String>,
    #[serde(default)]
    pub groups_filter_include: Vec<String>,
    #[serde(default)]
    pub groups_filter_exclude: Vec<String>,
}

impl CatalogApiOptions {
    /// `fq` terms for the organization/group filters; an include list wins over an exclude list.
    pub fn filter_terms(&self) -> Vec<String> {
        let mut terms = Vec::new();
        push_filter(
            &mut terms,
            "organization",
            &self.organizations_filter_include,
            &self.organizations_filter_exclude,
        );
        push_filter(&mut terms, "groups", &self.groups_filter_include, &self.groups_filter_exclude);
        terms
    }
}

fn push_filter(terms: &mut Vec<String>, field: &str, include: &[String], exclude: &[String]) {
    if !include.is_empty() {
        terms.push(
            include
                .iter()
                .map(|name| format!("{field}:{name}"))
                .collect::<Vec<_>>()
                .join(" OR "),
        );
    } else {
        terms.extend(exclude.iter().map(|name| format!("-{field}:{name}")));
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CatalogApiAdapter;

impl CatalogApiAdapter {
    pub fn search_url(source: &HarvestSource) -> String {
        format!("{}/api/3/action/package_search", source.base_url())
    }

    async fn search(
        &self,
        ctx: &AdapterContext,
        source: &HarvestSource,
        fq_terms: &[String],
        payloads: &mut Vec<RawPayload>,
    ) -> Result<Vec<Value>, AdapterError> {
        let fq = fq_terms.join(" ");
        let rows = PAGE_SIZE.to_string();
        let headers: Vec<(&str, &str)> = match source.config.api_key.as_deref() {
            Some(key) if !key.is_empty() => vec![("Authorization", key)],
            _ => Vec::new(),
        };

        let mut start = 0usize;
        let mut previous_body: Option<Vec<u8>> = None;
        let mut seen = HashSet::new();
        let mut packages = Vec::new();

        loop {
            ctx.ensure_active()?;
            let start_param = start.to_string();
            let mut params = vec![
                ("rows", rows.as_str()),
                ("start", start_param.as_str()),
                ("sort", "id asc"),
            ];
            if !fq.is_empty() {
                params.push(("fq", fq.as_str()));
            }
            let url = Url::parse_with_params(&Self::search_url(source), &params)
                .map_err(|err| AdapterError::Message(format!("invalid search url: {err}")))?;

            let resp = ctx.http.get(ctx.run_id, &source.id, url.as_str(), &headers).await?;
            if previous_body.as_deref() == Some(resp.body.as_slice()) {
                return Err(AdapterError::Message(format!(
                    "The paging doesn't seem to work. URL: {url}"
                )));
            }

            let value: Value = serde_json::from_slice(&resp.body).map_err(|err| {
                AdapterError::Message(format!("Response from remote catalog was not JSON: {err}"))
            })?;
            let results = value
                .get("result")
                .and_then(|r| r.get("results"))
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    AdapterError::Message(format!("Response JSON did not contain result/results: {url}"))
                })?;

            if results.is_empty() {
                break;
            }

            for package in results {
                if let Some(id) = package.get("id").and_then(Value::as_str) {
                    if !seen.insert(id.to_string()) {
                        debug!(source_id = %source.id, package_id = id, "dropping package repeated across pages");
                        continue;
                    }
                }
                packages.push(package.clone());
            }

            payloads.push(RawPayload {
                extension: "json",
                bytes: resp.body.clone(),
            });
            previous_body = Some(resp.body);
            start += PAGE_SIZE;
        }

        Ok(packages)
    }
}

#[async_trait]
impl SourceAdapter for CatalogApiAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::CatalogApi
    }

    fn validate_config(&self, source: &HarvestSource) -> Result<(), HarvestError> {
        Url::parse(&source.url)
            .map_err(|err| HarvestError::Configuration(format!("invalid catalog url {}: {err}", source.url)))?;
        let _: CatalogApiOptions = source.config.options()?;
        Ok(())
    }

    async fn fetch(&self, ctx: &AdapterContext, source: &HarvestSource) -> Result<FetchOutcome, AdapterError> {
        let options: CatalogApiOptions = source.config.options()?;
        let base_terms = options.filter_terms();
        let mut payloads = Vec::new();

        let (packages, scope) = match ctx.since {
            Some(since) => {
                let mut terms = base_terms.clone();
                terms.push(format!(
                    "metadata_modified:[{} TO *]",
                    since.format("%Y-%m-%dT%H:%M:%S%.fZ")
                ));
                match self.search(ctx, source, &terms, &mut payloads).await {
                    Ok(packages) => (packages, FetchScope::ChangedSince(since)),
                    Err(AdapterError::Cancelled) => return Err(AdapterError::Cancelled),
                    Err(err) => {
                        warn!(source_id = %source.id, error = %err, "incremental search failed; falling back to a full listing");
                        payloads.clear();
                        (self.search(ctx, source, &base_terms, &mut payloads).await?, FetchScope::Full)
                    }
                }
            }
            None => (self.search(ctx, source, &base_terms, &mut payloads).await?, FetchScope::Full),
        };

        let mut records = Vec::with_capacity(packages.len());
        let mut rejects = Vec::new();
        for package in packages {
            let id = package
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or("<no id>")
                .to_string();
            match RawRecord::from_value(package) {
                Ok(record) => records.push(record),
                Err(err) => rejects.push(format!("package {id}: {err}")),
            }
        }
        info!(source_id = %source.id, records = records.len(), "catalog search complete");

        Ok(FetchOutcome {
            records,
            scope,
            rejects,
            payloads,
        })
    }

    async fn remote_schema(
        &self,
        ctx: &AdapterContext,
        source: &HarvestSource,
    ) -> Result<Option<CatalogSchema>, AdapterError> {
        let client = CkanActionClient::new(source.base_url(), source.config.api_key.clone(), ctx.http.clone())
            .for_run(ctx.run_id, &source.id);
        client.schema_show().await.map_err(|err| match err {
            CatalogError::Transport(fetch) => AdapterError::Fetch(fetch),
            other => AdapterError::Message(other.to_string()),
        })
    }

    fn original_url(&self, source: &HarvestSource, guid: &str) -> Option<String> {
        Some(format!("{}/api/3/action/package_show?id={guid}", source.base_url()))
    }
}
