//! Raw (adapter output) and catalog-ready (transform output) record shapes.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::HarvestError;

pub type JsonMap = serde_json::Map<String, Value>;

/// Entry of the free-form key/value bag carried by catalog records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extra {
    pub key: String,
    #[serde(default)]
    pub value: Value,
}

/// A record exactly as a source adapter produced it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord {
    pub fields: JsonMap,
    pub resources: Vec<JsonMap>,
    pub extras: Vec<Extra>,
    /// Header order of tabular sources, used to resolve column-letter references.
    pub columns: Vec<String>,
    pub resource_columns: Vec<String>,
}

impl RawRecord {
    pub fn from_fields(fields: JsonMap) -> Self {
        Self {
            fields,
            ..Default::default()
        }
    }

    /// Split a catalog-API style JSON object into fields, resources and extras.
    pub fn from_value(value: Value) -> Result<Self, HarvestError> {
        let Value::Object(mut fields) = value else {
            return Err(HarvestError::Transform("remote record is not a JSON object".to_string()));
        };
        let resources = match fields.remove("resources") {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        let extras = match fields.remove("extras") {
            Some(value @ Value::Array(_)) => serde_json::from_value(value).map_err(|err| {
                HarvestError::Transform(format!("malformed extras in remote record: {err}"))
            })?,
            _ => Vec::new(),
        };
        Ok(Self {
            fields,
            resources,
            extras,
            columns: Vec::new(),
            resource_columns: Vec::new(),
        })
    }

    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extras.iter().find(|e| e.key == key).map(|e| &e.value)
    }
}

/// Local-schema-shaped record handed to the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    #[serde(flatten)]
    pub fields: JsonMap,
    #[serde(default)]
    pub resources: Vec<JsonMap>,
    #[serde(default)]
    pub extras: Vec<Extra>,
}

impl CatalogRecord {
    pub fn from_value(value: Value) -> Result<Self, HarvestError> {
        serde_json::from_value(value)
            .map_err(|err| HarvestError::Reconciliation(format!("malformed catalog record: {err}")))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Non-empty, trimmed string value of a top-level field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        non_empty_str(self.fields.get(key))
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn extra(&self, key: &str) -> Option<&Extra> {
        self.extras.iter().find(|e| e.key == key)
    }

    pub fn identifier(&self) -> Option<&str> {
        self.get_str("identifier")
    }

    /// Timestamp used to decide whether a record is newer than its stored counterpart.
    /// The catalog's own `metadata_modified` wins over the descriptive `modified` date.
    /// Read it before date normalization, which truncates to the day.
    pub fn recency(&self) -> Option<DateTime<Utc>> {
        self.get_str("metadata_modified")
            .and_then(parse_timestamp)
            .or_else(|| self.get_str("modified").and_then(parse_timestamp))
    }

    /// Externally stable identifier: URI, identifier, `{source_url}/{name}`, name, then a content hash.
    pub fn guid(&self, source_url: Option<&str>) -> String {
        if let Some(uri) = self.get_str("uri").or_else(|| self.get_str("identifier")) {
            return uri.to_string();
        }
        if let Some(name) = self.get_str("name") {
            return match source_url {
                Some(url) => format!("{}/{}", url.trim_end_matches('/'), name),
                None => name.to_string(),
            };
        }
        let canonical = serde_json::to_string(&self.fields).unwrap_or_default();
        Uuid::new_v5(&Uuid::NAMESPACE_URL, sha256_hex(canonical.as_bytes()).as_bytes()).to_string()
    }
}

pub fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim()),
        _ => None,
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Identifier for records that carry none: uuid5 (DNS namespace) of the hashed, dash-joined lowercase title.
pub fn deterministic_identifier(title: &str) -> String {
    let slug = title
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-");
    let hash = sha256_hex(slug.as_bytes());
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, hash.as_bytes()).to_string()
}

/// Parse the timestamp shapes catalogs emit: RFC 3339, naive ISO date-times and plain dates (UTC).
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}
