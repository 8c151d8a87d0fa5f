//! Typed view of a source's JSON configuration document (keys shared by every source kind).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HarvestError, MappingError};
use crate::mapping::{self, NormalizedMapping};
use crate::record::{sha256_hex, CatalogRecord, JsonMap, RawRecord};

/// Date layouts accepted for `source_date_format`.
pub const COMMON_DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d-%m-%Y",
    "%m-%d-%Y",
    "%Y/%m/%d",
    "%d/%m/%Y",
    "%m/%d/%Y",
    "%Y-%m-%d %H:%M:%S",
    "%d-%m-%Y %H:%M:%S",
    "%m-%d-%Y %H:%M:%S",
    "%Y/%m/%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%SZ",
];

/// How remote organization/group references are resolved against the local catalog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteEntityPolicy {
    /// Keep the reference only if the entity already exists locally.
    #[default]
    OnlyLocal,
    /// Create missing entities from the remote definition.
    Create,
}

/// A tag or group given either as a bare string or as `{"name": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NameRef {
    Name(String),
    Object { name: String },
}

impl NameRef {
    pub fn name(&self) -> &str {
        match self {
            NameRef::Name(name) | NameRef::Object { name } => name,
        }
    }
}

/// Validated mappings for the three logical tables a source can expose.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceMappings {
    pub dataset: Option<NormalizedMapping>,
    pub distribution: Option<NormalizedMapping>,
    pub datadictionary: Option<NormalizedMapping>,
}

impl SourceMappings {
    pub fn is_empty(&self) -> bool {
        self.dataset.is_none() && self.distribution.is_none() && self.datadictionary.is_none()
    }

    pub fn apply(&self, record: &RawRecord, required_lang: &str) -> Result<CatalogRecord, MappingError> {
        mapping::apply(record, self.dataset.as_ref(), self.distribution.as_ref(), required_lang)
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestConfig {
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub field_mapping_schema_version: Option<i64>,
    #[serde(default)]
    pub dataset_field_mapping: Option<Value>,
    #[serde(default)]
    pub distribution_field_mapping: Option<Value>,
    #[serde(default)]
    pub datadictionary_field_mapping: Option<Value>,
    #[serde(default)]
    pub default_tags: Vec<NameRef>,
    #[serde(default)]
    pub default_groups: Vec<NameRef>,
    #[serde(default)]
    pub default_extras: BTreeMap<String, Value>,
    #[serde(default)]
    pub override_extras: bool,
    #[serde(default)]
    pub remote_orgs: RemoteEntityPolicy,
    #[serde(default)]
    pub remote_groups: RemoteEntityPolicy,
    #[serde(default)]
    pub allow_harvest_datasets: bool,
    #[serde(default)]
    pub override_local_datasets: bool,
    #[serde(default = "default_true")]
    pub clean_tags: bool,
    #[serde(default)]
    pub force_all: bool,
    #[serde(default)]
    pub source_date_format: Option<String>,
    #[serde(default)]
    pub not_overwrite_fields: Vec<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Whole document; adapters read their kind-specific options from it.
    #[serde(skip)]
    pub raw: JsonMap,
    #[serde(skip)]
    pub mappings: SourceMappings,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            schema: None,
            field_mapping_schema_version: None,
            dataset_field_mapping: None,
            distribution_field_mapping: None,
            datadictionary_field_mapping: None,
            default_tags: Vec::new(),
            default_groups: Vec::new(),
            default_extras: BTreeMap::new(),
            override_extras: false,
            remote_orgs: RemoteEntityPolicy::default(),
            remote_groups: RemoteEntityPolicy::default(),
            allow_harvest_datasets: false,
            override_local_datasets: false,
            clean_tags: true,
            force_all: false,
            source_date_format: None,
            not_overwrite_fields: Vec::new(),
            api_key: None,
            raw: JsonMap::new(),
            mappings: SourceMappings::default(),
        }
    }
}

impl PartialEq for HarvestConfig {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl HarvestConfig {
    pub fn from_json(text: &str) -> Result<Self, HarvestError> {
        if text.trim().is_empty() {
            return Self::from_value(&Value::Null);
        }
        let value: Value = serde_json::from_str(text)
            .map_err(|err| HarvestError::Configuration(format!("config is not valid JSON: {err}")))?;
        Self::from_value(&value)
    }

    /// Parse and validate; mapping documents are normalized here, once.
    pub fn from_value(value: &Value) -> Result<Self, HarvestError> {
        let raw = match value {
            Value::Null => JsonMap::new(),
            Value::Object(map) => map.clone(),
            Value::String(text) => return Self::from_json(text),
            _ => {
                return Err(HarvestError::Configuration(
                    "config must be a JSON object".to_string(),
                ))
            }
        };
        let mut config: HarvestConfig = serde_json::from_value(Value::Object(raw.clone()))
            .map_err(|err| HarvestError::Configuration(err.to_string()))?;

        if let Some(format) = &config.source_date_format {
            if !COMMON_DATE_FORMATS.contains(&format.as_str()) {
                return Err(HarvestError::Configuration(format!(
                    "source_date_format: {format} is not a valid date format. Accepted formats are: {}",
                    COMMON_DATE_FORMATS.join(" | ")
                )));
            }
        }

        config.mappings = config.validate_mappings()?;
        config.raw = raw;
        Ok(config)
    }

    fn validate_mappings(&self) -> Result<SourceMappings, HarvestError> {
        let documents = [
            ("dataset_field_mapping", &self.dataset_field_mapping),
            ("distribution_field_mapping", &self.distribution_field_mapping),
            ("datadictionary_field_mapping", &self.datadictionary_field_mapping),
        ];
        let present = documents.iter().any(|(_, doc)| doc.as_ref().is_some_and(|d| !d.is_null()));
        if !present {
            return Ok(SourceMappings::default());
        }
        let version = self.field_mapping_schema_version.ok_or_else(|| {
            HarvestError::Configuration(
                "Insert the schema version: \"field_mapping_schema_version: <version>\", one of: 1, 2".to_string(),
            )
        })?;

        let normalize = |name: &str, doc: &Option<Value>| -> Result<Option<NormalizedMapping>, HarvestError> {
            match doc {
                None | Some(Value::Null) => Ok(None),
                Some(doc) => mapping::validate(doc, version).map(Some).map_err(|err| {
                    HarvestError::Configuration(format!("The field mapping {name} is invalid: {err}"))
                }),
            }
        };
        Ok(SourceMappings {
            dataset: normalize(documents[0].0, documents[0].1)?,
            distribution: normalize(documents[1].0, documents[1].1)?,
            datadictionary: normalize(documents[2].0, documents[2].1)?,
        })
    }

    /// Stable digest of the document; a change invalidates cached schemas for the source.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_string(&self.raw).unwrap_or_default();
        sha256_hex(canonical.as_bytes())
    }

    /// Kind-specific options deserialized from the same document.
    pub fn options<T: serde::de::DeserializeOwned>(&self) -> Result<T, HarvestError> {
        serde_json::from_value(Value::Object(self.raw.clone()))
            .map_err(|err| HarvestError::Configuration(err.to_string()))
    }
}
