//! Target catalog boundary: package/organization/group operations plus the local schema.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::http::{FetchError, HttpFetcher};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{}", render_validation(.0))]
    Validation(BTreeMap<String, String>),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("catalog rejected the request: {0}")]
    Rejected(String),
    #[error("catalog transport error: {0}")]
    Transport(#[from] FetchError),
    #[error("malformed catalog response: {0}")]
    Malformed(String),
}

fn render_validation(errors: &BTreeMap<String, String>) -> String {
    let parts = errors
        .iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("Validation Error: {parts}")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub field_name: String,
    #[serde(default)]
    pub label: Option<Value>,
    #[serde(default)]
    pub required: bool,
}

/// Dataset and resource field definitions as published by a scheming-style schema endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogSchema {
    #[serde(default)]
    pub dataset_type: Option<String>,
    #[serde(default)]
    pub dataset_fields: Vec<SchemaField>,
    #[serde(default)]
    pub resource_fields: Vec<SchemaField>,
}

impl CatalogSchema {
    pub fn has_dataset_field(&self, name: &str) -> bool {
        self.dataset_fields.iter().any(|f| f.field_name == name)
    }

    pub fn has_resource_field(&self, name: &str) -> bool {
        self.resource_fields.iter().any(|f| f.field_name == name)
    }
}

#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn package_show(&self, id_or_name: &str) -> Result<Option<Value>, CatalogError>;
    /// First package whose `field` equals `value`.
    async fn package_find(&self, field: &str, value: &str) -> Result<Option<Value>, CatalogError>;
    async fn package_create(&self, package: &Value) -> Result<Value, CatalogError>;
    async fn package_update(&self, package: &Value) -> Result<Value, CatalogError>;
    async fn package_delete(&self, id: &str) -> Result<(), CatalogError>;
    async fn organization_show(&self, id_or_name: &str) -> Result<Option<Value>, CatalogError>;
    async fn organization_create(&self, organization: &Value) -> Result<Value, CatalogError>;
    async fn group_show(&self, id_or_name: &str) -> Result<Option<Value>, CatalogError>;
    async fn group_create(&self, group: &Value) -> Result<Value, CatalogError>;
    async fn schema_show(&self) -> Result<Option<CatalogSchema>, CatalogError>;
}

/// Client for a CKAN-compatible action API (`{base}/api/3/action/{action}`).
#[derive(Debug, Clone)]
pub struct CkanActionClient {
    base_url: String,
    api_key: Option<String>,
    http: Arc<HttpFetcher>,
    run_id: Uuid,
    limiter_key: String,
}

impl CkanActionClient {
    pub fn new(base_url: &str, api_key: Option<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            http,
            run_id: Uuid::new_v4(),
            limiter_key: "catalog".to_string(),
        }
    }

    /// Tag HTTP spans with the run and share a rate-limit bucket with the given key.
    pub fn for_run(mut self, run_id: Uuid, limiter_key: &str) -> Self {
        self.run_id = run_id;
        self.limiter_key = limiter_key.to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn action_url(&self, action: &str) -> String {
        format!("{}/api/3/action/{action}", self.base_url)
    }

    fn headers(&self) -> Vec<(&str, &str)> {
        match self.api_key.as_deref() {
            Some(key) if !key.is_empty() => vec![("Authorization", key)],
            _ => Vec::new(),
        }
    }

    pub async fn action_get(&self, action: &str, params: &[(&str, &str)]) -> Result<Value, CatalogError> {
        let url = Url::parse_with_params(&self.action_url(action), params)
            .map_err(|err| CatalogError::Malformed(format!("invalid catalog url: {err}")))?;
        let resp = self
            .http
            .get(self.run_id, &self.limiter_key, url.as_str(), &self.headers())
            .await
            .map_err(catalog_error_from_fetch)?;
        unwrap_envelope(&resp.body)
    }

    pub async fn action_post(&self, action: &str, body: &Value) -> Result<Value, CatalogError> {
        let resp = self
            .http
            .post_json(self.run_id, &self.limiter_key, &self.action_url(action), body, &self.headers())
            .await
            .map_err(catalog_error_from_fetch)?;
        unwrap_envelope(&resp.body)
    }

    async fn show(&self, action: &str, id: &str) -> Result<Option<Value>, CatalogError> {
        match self.action_get(action, &[("id", id)]).await {
            Ok(value) => Ok(Some(value)),
            Err(CatalogError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

fn unwrap_envelope(body: &[u8]) -> Result<Value, CatalogError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|err| CatalogError::Malformed(format!("response is not JSON: {err}")))?;
    if value.get("success").and_then(Value::as_bool) == Some(true) {
        return Ok(value.get("result").cloned().unwrap_or(Value::Null));
    }
    Err(error_from_payload(&value))
}

fn error_from_payload(value: &Value) -> CatalogError {
    let Some(error) = value.get("error").and_then(Value::as_object) else {
        return CatalogError::Malformed("response carries neither result nor error".to_string());
    };
    let kind = error.get("__type").and_then(Value::as_str).unwrap_or_default();
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or(kind)
        .to_string();
    match kind {
        "Validation Error" => {
            let fields = error
                .iter()
                .filter(|(k, _)| k.as_str() != "__type" && k.as_str() != "message")
                .map(|(k, v)| (k.clone(), flatten_messages(v)))
                .collect::<BTreeMap<_, _>>();
            if fields.is_empty() {
                CatalogError::Validation(BTreeMap::from([("message".to_string(), message)]))
            } else {
                CatalogError::Validation(fields)
            }
        }
        "Not Found Error" => CatalogError::NotFound(message),
        _ => CatalogError::Rejected(message),
    }
}

fn flatten_messages(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(flatten_messages).collect::<Vec<_>>().join("; "),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{k}: {}", flatten_messages(v)))
            .collect::<Vec<_>>()
            .join("; "),
        other => other.to_string(),
    }
}

fn catalog_error_from_fetch(err: FetchError) -> CatalogError {
    if let FetchError::HttpStatus { status, url, body } = &err {
        if let Ok(value) = serde_json::from_str::<Value>(body) {
            if value.get("error").is_some() {
                return error_from_payload(&value);
            }
        }
        if *status == 404 {
            return CatalogError::NotFound(url.clone());
        }
    }
    CatalogError::Transport(err)
}

fn search_term(field: &str, value: &str) -> String {
    format!("{field}:\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[async_trait]
impl CatalogClient for CkanActionClient {
    async fn package_show(&self, id_or_name: &str) -> Result<Option<Value>, CatalogError> {
        self.show("package_show", id_or_name).await
    }

    async fn package_find(&self, field: &str, value: &str) -> Result<Option<Value>, CatalogError> {
        let fq = search_term(field, value);
        let result = self
            .action_get(
                "package_search",
                &[("fq", fq.as_str()), ("rows", "1"), ("include_private", "true")],
            )
            .await?;
        Ok(result
            .get("results")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .cloned())
    }

    async fn package_create(&self, package: &Value) -> Result<Value, CatalogError> {
        self.action_post("package_create", package).await
    }

    async fn package_update(&self, package: &Value) -> Result<Value, CatalogError> {
        self.action_post("package_update", package).await
    }

    async fn package_delete(&self, id: &str) -> Result<(), CatalogError> {
        self.action_post("package_delete", &json!({ "id": id })).await.map(|_| ())
    }

    async fn organization_show(&self, id_or_name: &str) -> Result<Option<Value>, CatalogError> {
        self.show("organization_show", id_or_name).await
    }

    async fn organization_create(&self, organization: &Value) -> Result<Value, CatalogError> {
        self.action_post("organization_create", organization).await
    }

    async fn group_show(&self, id_or_name: &str) -> Result<Option<Value>, CatalogError> {
        self.show("group_show", id_or_name).await
    }

    async fn group_create(&self, group: &Value) -> Result<Value, CatalogError> {
        self.action_post("group_create", group).await
    }

    async fn schema_show(&self) -> Result<Option<CatalogSchema>, CatalogError> {
        match self
            .action_get("scheming_dataset_schema_show", &[("type", "dataset")])
            .await
        {
            Ok(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|err| CatalogError::Malformed(format!("schema: {err}"))),
            Err(CatalogError::NotFound(_)) | Err(CatalogError::Rejected(_)) => {
                debug!(base_url = %self.base_url, "catalog exposes no schema endpoint");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryCatalogState {
    packages: BTreeMap<String, Value>,
    organizations: BTreeMap<String, Value>,
    groups: BTreeMap<String, Value>,
    writes: usize,
}

/// In-process catalog with create/update/delete semantics close to a CKAN instance.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: Mutex<MemoryCatalogState>,
    required_fields: Vec<String>,
    schema: Option<CatalogSchema>,
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn find_entity<'a>(entities: &'a BTreeMap<String, Value>, id_or_name: &str) -> Option<&'a Value> {
    entities.get(id_or_name).or_else(|| {
        entities
            .values()
            .find(|e| str_field(e, "name") == Some(id_or_name))
    })
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_required_fields(mut self, fields: &[&str]) -> Self {
        self.required_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_schema(mut self, schema: CatalogSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub async fn insert_organization(&self, organization: Value) {
        let mut state = self.state.lock().await;
        let id = str_field(&organization, "id")
            .or_else(|| str_field(&organization, "name"))
            .unwrap_or_default()
            .to_string();
        state.organizations.insert(id, organization);
    }

    pub async fn insert_group(&self, group: Value) {
        let mut state = self.state.lock().await;
        let id = str_field(&group, "id")
            .or_else(|| str_field(&group, "name"))
            .unwrap_or_default()
            .to_string();
        state.groups.insert(id, group);
    }

    pub async fn packages(&self) -> Vec<Value> {
        self.state.lock().await.packages.values().cloned().collect()
    }

    /// Number of create/update/delete calls that reached the catalog.
    pub async fn writes(&self) -> usize {
        self.state.lock().await.writes
    }

    fn validate(&self, package: &Value) -> Result<(), CatalogError> {
        let missing = self
            .required_fields
            .iter()
            .filter(|f| match package.get(f.as_str()) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.trim().is_empty(),
                _ => false,
            })
            .map(|f| (f.clone(), "Missing value".to_string()))
            .collect::<BTreeMap<_, _>>();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CatalogError::Validation(missing))
        }
    }
}

#[async_trait]
impl CatalogClient for MemoryCatalog {
    async fn package_show(&self, id_or_name: &str) -> Result<Option<Value>, CatalogError> {
        let state = self.state.lock().await;
        Ok(find_entity(&state.packages, id_or_name).cloned())
    }

    async fn package_find(&self, field: &str, value: &str) -> Result<Option<Value>, CatalogError> {
        let state = self.state.lock().await;
        Ok(state
            .packages
            .values()
            .find(|p| str_field(p, field) == Some(value))
            .cloned())
    }

    async fn package_create(&self, package: &Value) -> Result<Value, CatalogError> {
        self.validate(package)?;
        let mut state = self.state.lock().await;
        let mut stored = package.clone();
        let id = str_field(package, "id")
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if state.packages.contains_key(&id) {
            return Err(CatalogError::Validation(BTreeMap::from([(
                "id".to_string(),
                "Dataset id already exists".to_string(),
            )])));
        }
        if let Some(name) = str_field(package, "name") {
            if state.packages.values().any(|p| str_field(p, "name") == Some(name)) {
                return Err(CatalogError::Validation(BTreeMap::from([(
                    "name".to_string(),
                    "That URL is already in use.".to_string(),
                )])));
            }
        }
        let now = Utc::now().to_rfc3339();
        if let Some(map) = stored.as_object_mut() {
            map.insert("id".to_string(), json!(id));
            map.insert("state".to_string(), json!("active"));
            map.insert("metadata_created".to_string(), json!(now));
            map.insert("metadata_modified".to_string(), json!(now));
        }
        state.packages.insert(id, stored.clone());
        state.writes += 1;
        Ok(stored)
    }

    async fn package_update(&self, package: &Value) -> Result<Value, CatalogError> {
        self.validate(package)?;
        let mut state = self.state.lock().await;
        let key = str_field(package, "id")
            .or_else(|| str_field(package, "name"))
            .ok_or_else(|| CatalogError::NotFound("package without id".to_string()))?;
        let id = find_entity(&state.packages, key)
            .and_then(|p| str_field(p, "id"))
            .map(str::to_string)
            .ok_or_else(|| CatalogError::NotFound(key.to_string()))?;
        let mut stored = package.clone();
        if let Some(map) = stored.as_object_mut() {
            map.insert("id".to_string(), json!(id));
            map.insert("state".to_string(), json!("active"));
            map.insert("metadata_modified".to_string(), json!(Utc::now().to_rfc3339()));
        }
        state.packages.insert(id, stored.clone());
        state.writes += 1;
        Ok(stored)
    }

    async fn package_delete(&self, id: &str) -> Result<(), CatalogError> {
        let mut state = self.state.lock().await;
        let key = find_entity(&state.packages, id)
            .and_then(|p| str_field(p, "id"))
            .map(str::to_string)
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;
        if let Some(map) = state.packages.get_mut(&key).and_then(Value::as_object_mut) {
            map.insert("state".to_string(), json!("deleted"));
        }
        state.writes += 1;
        Ok(())
    }

    async fn organization_show(&self, id_or_name: &str) -> Result<Option<Value>, CatalogError> {
        let state = self.state.lock().await;
        Ok(find_entity(&state.organizations, id_or_name).cloned())
    }

    async fn organization_create(&self, organization: &Value) -> Result<Value, CatalogError> {
        let mut stored = organization.clone();
        let id = str_field(organization, "id")
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Some(map) = stored.as_object_mut() {
            map.insert("id".to_string(), json!(id));
        }
        let mut state = self.state.lock().await;
        state.organizations.insert(id, stored.clone());
        state.writes += 1;
        Ok(stored)
    }

    async fn group_show(&self, id_or_name: &str) -> Result<Option<Value>, CatalogError> {
        let state = self.state.lock().await;
        Ok(find_entity(&state.groups, id_or_name).cloned())
    }

    async fn group_create(&self, group: &Value) -> Result<Value, CatalogError> {
        let mut stored = group.clone();
        let id = str_field(group, "id")
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Some(map) = stored.as_object_mut() {
            map.insert("id".to_string(), json!(id));
        }
        let mut state = self.state.lock().await;
        state.groups.insert(id, stored.clone());
        state.writes += 1;
        Ok(stored)
    }

    async fn schema_show(&self) -> Result<Option<CatalogSchema>, CatalogError> {
        Ok(self.schema.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpClientConfig;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> CkanActionClient {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("http"));
        CkanActionClient::new(&server.uri(), Some("secret".to_string()), http)
    }

    #[test]
    fn validation_errors_render_per_field() {
        let err = CatalogError::Validation(BTreeMap::from([
            ("name".to_string(), "That URL is already in use.".to_string()),
            ("title".to_string(), "Missing value".to_string()),
        ]));
        assert_eq!(
            err.to_string(),
            "Validation Error: name: That URL is already in use., title: Missing value"
        );
    }

    #[tokio::test]
    async fn package_show_sends_the_api_key_and_unwraps_the_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/3/action/package_show"))
            .and(query_param("id", "rivers"))
            .and(header("Authorization", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "result": {"id": "p1", "name": "rivers"}
            })))
            .mount(&server)
            .await;

        let pkg = client(&server).package_show("rivers").await.expect("show").expect("found");
        assert_eq!(pkg["id"], json!("p1"));
    }

    #[tokio::test]
    async fn missing_packages_are_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/3/action/package_show"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "success": false,
                "error": {"__type": "Not Found Error", "message": "Not found"}
            })))
            .mount(&server)
            .await;

        assert!(client(&server).package_show("nope").await.expect("show").is_none());
    }

    #[tokio::test]
    async fn rejected_writes_surface_field_messages() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/3/action/package_create"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "success": false,
                "error": {"__type": "Validation Error", "name": ["That URL is already in use."]}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server)
            .package_create(&json!({"name": "rivers"}))
            .await
            .expect_err("conflict");
        assert_eq!(err.to_string(), "Validation Error: name: That URL is already in use.");
    }

    #[tokio::test]
    async fn memory_catalog_enforces_unique_names_and_required_fields() {
        let catalog = MemoryCatalog::new().with_required_fields(&["title"]);
        let err = catalog
            .package_create(&json!({"id": "a", "name": "rivers"}))
            .await
            .expect_err("missing title");
        assert!(matches!(err, CatalogError::Validation(_)));

        catalog
            .package_create(&json!({"id": "a", "name": "rivers", "title": "Rivers"}))
            .await
            .expect("create");
        let err = catalog
            .package_create(&json!({"id": "b", "name": "rivers", "title": "Rivers 2"}))
            .await
            .expect_err("name clash");
        assert!(err.to_string().contains("name"));

        let found = catalog.package_find("title", "Rivers").await.expect("find").expect("hit");
        assert_eq!(found["id"], json!("a"));
        catalog.package_delete("rivers").await.expect("delete");
        let gone = catalog.package_show("a").await.expect("show").expect("kept");
        assert_eq!(gone["state"], json!("deleted"));
        assert_eq!(catalog.writes().await, 2);
    }
}
