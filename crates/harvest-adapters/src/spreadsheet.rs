//! Spreadsheet-backed sources: dataset, distribution and data-dictionary sheets joined into records.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use harvest_core::mapping;
use harvest_core::record::{deterministic_identifier, non_empty_str};
use harvest_core::{HarvestError, HarvestSource, JsonMap, NormalizedMapping, RawRecord, SourceKind};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::{AdapterContext, AdapterError, FetchOutcome, MappingStage, SourceAdapter};

/// Fields whose comma-separated cell text becomes a list.
pub const LIST_FIELDS: &[&str] = &[
    "tag_string",
    "keywords",
    "groups",
    "theme",
    "theme_es",
    "theme_eu",
    "conforms_to",
    "tag_uri",
    "reference",
    "lineage_source",
    "lineage_process_steps",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    #[default]
    Gspread,
    Onedrive,
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SheetCredentials {
    Token(String),
    Keys {
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default)]
        token: Option<String>,
    },
}

impl SheetCredentials {
    fn token(&self) -> Option<&str> {
        match self {
            SheetCredentials::Token(token) => Some(token.as_str()),
            SheetCredentials::Keys { token, .. } => token.as_deref(),
        }
    }

    fn api_key(&self) -> Option<&str> {
        match self {
            SheetCredentials::Token(_) => None,
            SheetCredentials::Keys { api_key, .. } => api_key.as_deref(),
        }
    }
}

fn default_distribution_prefix() -> String {
    "resource_".to_string()
}

fn default_dataset_id_colname() -> String {
    "dataset_id".to_string()
}

fn default_datadictionary_prefix() -> String {
    "datadictionary_".to_string()
}

fn default_distribution_id_colname() -> String {
    "resource_id".to_string()
}

fn default_sheets_api_url() -> String {
    "https://sheets.googleapis.com".to_string()
}

fn default_graph_api_url() -> String {
    "https://graph.microsoft.com".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpreadsheetOptions {
    #[serde(default)]
    pub storage_type: StorageType,
    #[serde(default)]
    pub dataset_sheet: Option<String>,
    #[serde(default)]
    pub distribution_sheet: Option<String>,
    #[serde(default)]
    pub datadictionary_sheet: Option<String>,
    #[serde(default)]
    pub credentials: Option<SheetCredentials>,
    #[serde(default = "default_distribution_prefix")]
    pub distribution_prefix_colnames: String,
    #[serde(default = "default_dataset_id_colname")]
    pub dataset_id_colname: String,
    #[serde(default = "default_datadictionary_prefix")]
    pub datadictionary_prefix_colnames: String,
    #[serde(default = "default_distribution_id_colname")]
    pub distribution_id_colname: String,
    #[serde(default = "default_sheets_api_url")]
    pub sheets_api_url: String,
    #[serde(default = "default_graph_api_url")]
    pub graph_api_url: String,
    #[serde(default)]
    pub drive_id: Option<String>,
}

impl SpreadsheetOptions {
    pub fn from_source(source: &HarvestSource) -> Result<Self, HarvestError> {
        let options: SpreadsheetOptions = source.config.options()?;
        if options.dataset_sheet.as_deref().map_or(true, |s| s.trim().is_empty()) {
            return Err(HarvestError::Configuration(
                "dataset_sheet is required for spreadsheet sources".to_string(),
            ));
        }
        if options.storage_type != StorageType::Local && options.credentials.is_none() {
            return Err(HarvestError::Configuration(
                "credentials are required for remote spreadsheet storage".to_string(),
            ));
        }
        if options.storage_type == StorageType::Onedrive
            && options.credentials.as_ref().and_then(SheetCredentials::token).is_none()
        {
            return Err(HarvestError::Configuration(
                "onedrive storage needs a bearer token in credentials".to_string(),
            ));
        }
        Ok(options)
    }
}

/// Reads one sheet as a grid of cell strings, header row first.
#[async_trait]
pub trait SheetReader: Send + Sync {
    async fn read_sheet(&self, ctx: &AdapterContext, source: &HarvestSource, sheet: &str)
        -> Result<Vec<Vec<String>>, AdapterError>;
}

#[derive(Debug, Clone)]
pub struct GoogleSheetsReader {
    api_url: String,
    credentials: SheetCredentials,
}

impl GoogleSheetsReader {
    /// Accepts a bare document id or a full `/spreadsheets/d/<id>/...` link.
    pub fn document_id(url: &str) -> &str {
        match url.split_once("/spreadsheets/d/") {
            Some((_, rest)) => rest.split('/').next().unwrap_or(rest),
            None => url.trim(),
        }
    }
}

#[async_trait]
impl SheetReader for GoogleSheetsReader {
    async fn read_sheet(
        &self,
        ctx: &AdapterContext,
        source: &HarvestSource,
        sheet: &str,
    ) -> Result<Vec<Vec<String>>, AdapterError> {
        let mut url = Url::parse(&self.api_url)
            .map_err(|err| AdapterError::Message(format!("invalid sheets api url: {err}")))?;
        url.path_segments_mut()
            .map_err(|_| AdapterError::Message("sheets api url cannot be a base".to_string()))?
            .extend(["v4", "spreadsheets", Self::document_id(&source.url), "values", sheet]);
        if let Some(key) = self.credentials.api_key() {
            url.query_pairs_mut().append_pair("key", key);
        }
        let bearer = self.credentials.token().map(|t| format!("Bearer {t}"));
        let headers: Vec<(&str, &str)> = bearer.iter().map(|b| ("Authorization", b.as_str())).collect();

        let resp = ctx.http.get(ctx.run_id, &source.id, url.as_str(), &headers).await?;
        grid_from_values(&resp.body)
    }
}

#[derive(Debug, Clone)]
pub struct GraphWorkbookReader {
    api_url: String,
    drive_id: Option<String>,
    token: String,
}

#[async_trait]
impl SheetReader for GraphWorkbookReader {
    async fn read_sheet(
        &self,
        ctx: &AdapterContext,
        source: &HarvestSource,
        sheet: &str,
    ) -> Result<Vec<Vec<String>>, AdapterError> {
        let mut url = Url::parse(&self.api_url)
            .map_err(|err| AdapterError::Message(format!("invalid graph api url: {err}")))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| AdapterError::Message("graph api url cannot be a base".to_string()))?;
            segments.push("v1.0");
            match &self.drive_id {
                Some(drive) => segments.extend(["drives", drive.as_str()]),
                None => segments.extend(["me", "drive"]),
            };
            segments.extend(["items", source.url.trim(), "workbook", "worksheets", sheet, "usedRange"]);
        }
        url.query_pairs_mut().append_pair("$select", "values");
        let bearer = format!("Bearer {}", self.token);

        let resp = ctx
            .http
            .get(ctx.run_id, &source.id, url.as_str(), &[("Authorization", bearer.as_str())])
            .await?;
        grid_from_values(&resp.body)
    }
}

/// `<root>/<sheet>.csv`, one file per sheet.
#[derive(Debug, Clone)]
pub struct CsvDirectoryReader {
    root: PathBuf,
}

impl CsvDirectoryReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SheetReader for CsvDirectoryReader {
    async fn read_sheet(
        &self,
        _ctx: &AdapterContext,
        _source: &HarvestSource,
        sheet: &str,
    ) -> Result<Vec<Vec<String>>, AdapterError> {
        let path = self.root.join(format!("{sheet}.csv"));
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|err| AdapterError::Message(format!("reading {}: {err}", path.display())))?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes.as_slice());
        let mut grid = Vec::new();
        for row in reader.records() {
            let row = row.map_err(|err| AdapterError::Message(format!("parsing {}: {err}", path.display())))?;
            grid.push(row.iter().map(str::to_string).collect());
        }
        Ok(grid)
    }
}

/// `{"values": [[...], ...]}` as returned by both the Sheets and Graph APIs.
fn grid_from_values(body: &[u8]) -> Result<Vec<Vec<String>>, AdapterError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|err| AdapterError::Message(format!("sheet response is not JSON: {err}")))?;
    let rows = match value.get("values") {
        Some(Value::Array(rows)) => rows,
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(_) => return Err(AdapterError::Message("sheet values must be an array".to_string())),
    };
    Ok(rows
        .iter()
        .map(|row| match row {
            Value::Array(cells) => cells.iter().map(cell_text).collect(),
            _ => Vec::new(),
        })
        .collect())
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Header-keyed rows of one sheet, with the header order kept for column-letter references.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<JsonMap>,
}

impl Table {
    pub fn from_grid(grid: Vec<Vec<String>>) -> Self {
        let mut rows_iter = grid.into_iter();
        let headers: Vec<String> = rows_iter
            .next()
            .unwrap_or_default()
            .into_iter()
            .map(|h| h.trim().to_string())
            .collect();
        let rows = rows_iter
            .filter(|cells| cells.iter().any(|c| !c.trim().is_empty()))
            .map(|cells| {
                let mut row = JsonMap::new();
                for (idx, header) in headers.iter().enumerate() {
                    if header.is_empty() {
                        continue;
                    }
                    let cell = cells.get(idx).map(|c| c.trim()).unwrap_or_default();
                    let value = if cell.is_empty() {
                        Value::Null
                    } else {
                        Value::String(cell.to_string())
                    };
                    row.insert(header.clone(), value);
                }
                row
            })
            .collect();
        Self { headers, rows }
    }

    /// Every column a mapping reads by name must be a header of the sheet.
    pub fn check_columns(&self, mapping: &NormalizedMapping, sheet: &str) -> Result<(), HarvestError> {
        if self.headers.iter().all(|h| h.is_empty()) {
            return Ok(());
        }
        let missing: Vec<&str> = mapping
            .direct_references()
            .into_iter()
            .filter(|name| !self.headers.iter().any(|h| h == name))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(HarvestError::SchemaMismatch(format!(
                "{sheet} sheet has no column(s): {}",
                missing.join(", ")
            )))
        }
    }

    /// Apply a mapping to every row; unmapped columns pass through.
    fn mapped(
        self,
        mapping: Option<&NormalizedMapping>,
        sheet: &str,
        required_lang: &str,
    ) -> Result<Vec<JsonMap>, HarvestError> {
        if let Some(mapping) = mapping {
            self.check_columns(mapping, sheet)?;
        }
        let Table { headers, rows } = self;
        rows.into_iter()
            .map(|row| {
                let raw = RawRecord {
                    fields: row,
                    columns: headers.clone(),
                    ..Default::default()
                };
                mapping::apply(&raw, mapping, None, required_lang)
                    .map(|record| record.fields)
                    .map_err(HarvestError::from)
            })
            .collect()
    }
}

fn strip_prefix_keys(row: JsonMap, prefix: &str) -> JsonMap {
    if prefix.is_empty() {
        return row;
    }
    row.into_iter()
        .map(|(k, v)| match k.strip_prefix(prefix) {
            Some(stripped) if !stripped.is_empty() => (stripped.to_string(), v),
            _ => (k, v),
        })
        .collect()
}

fn split_list_fields(row: &mut JsonMap) {
    for field in LIST_FIELDS {
        if let Some(Value::String(text)) = row.get(*field) {
            let items = text
                .split(',')
                .map(|item| item.trim_matches(|c: char| c == ' ' || c == '-'))
                .filter(|item| !item.is_empty())
                .map(|item| Value::String(item.to_string()))
                .collect::<Vec<_>>();
            row.insert(field.to_string(), Value::Array(items));
        }
    }
}

fn join_key(row: &JsonMap, column: &str) -> Option<String> {
    non_empty_str(row.get(column)).map(str::to_string)
}

/// Group rows by `column`, removing the join column from each row.
fn group_by(rows: Vec<JsonMap>, column: &str) -> (HashMap<String, Vec<JsonMap>>, usize) {
    let mut groups: HashMap<String, Vec<JsonMap>> = HashMap::new();
    let mut orphans = 0usize;
    for mut row in rows {
        match join_key(&row, column) {
            Some(key) => {
                row.remove(column);
                groups.entry(key).or_default().push(row);
            }
            None => orphans += 1,
        }
    }
    (groups, orphans)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SpreadsheetAdapter;

impl SpreadsheetAdapter {
    fn reader(options: &SpreadsheetOptions, source: &HarvestSource) -> Result<Box<dyn SheetReader>, HarvestError> {
        let credentials = options.credentials.clone();
        Ok(match options.storage_type {
            StorageType::Local => Box::new(CsvDirectoryReader::new(
                source.url.trim_start_matches("file://"),
            )),
            StorageType::Gspread => Box::new(GoogleSheetsReader {
                api_url: options.sheets_api_url.clone(),
                credentials: credentials.ok_or_else(|| {
                    HarvestError::Configuration("missing spreadsheet credentials".to_string())
                })?,
            }),
            StorageType::Onedrive => Box::new(GraphWorkbookReader {
                api_url: options.graph_api_url.clone(),
                drive_id: options.drive_id.clone(),
                token: credentials
                    .as_ref()
                    .and_then(SheetCredentials::token)
                    .map(str::to_string)
                    .ok_or_else(|| HarvestError::Configuration("missing bearer token".to_string()))?,
            }),
        })
    }

    /// Join the three logical tables into dataset records. Mappings are applied before grouping.
    pub fn assemble(
        source: &HarvestSource,
        options: &SpreadsheetOptions,
        datasets: Table,
        distributions: Option<Table>,
        dictionaries: Option<Table>,
        required_lang: &str,
    ) -> Result<Vec<RawRecord>, HarvestError> {
        let mappings = &source.config.mappings;
        let dataset_rows = datasets.mapped(mappings.dataset.as_ref(), "dataset", required_lang)?;

        let mut dictionary_groups = HashMap::new();
        if let Some(table) = dictionaries {
            let rows = table
                .mapped(mappings.datadictionary.as_ref(), "data-dictionary", required_lang)?
                .into_iter()
                .map(|row| strip_prefix_keys(row, &options.datadictionary_prefix_colnames))
                .collect();
            let (groups, orphans) = group_by(rows, &options.distribution_id_colname);
            if orphans > 0 {
                debug!(source_id = %source.id, orphans, "data-dictionary rows without a distribution id");
            }
            dictionary_groups = groups;
        }

        let mut distribution_groups = HashMap::new();
        if let Some(table) = distributions {
            let rows = table
                .mapped(mappings.distribution.as_ref(), "distribution", required_lang)?
                .into_iter()
                .map(|row| strip_prefix_keys(row, &options.distribution_prefix_colnames))
                .map(|mut row| {
                    let id = join_key(&row, "id").or_else(|| join_key(&row, &options.distribution_id_colname));
                    if let Some(entries) = id.and_then(|id| dictionary_groups.remove(&id)) {
                        row.insert(
                            "datadictionary".to_string(),
                            Value::Array(entries.into_iter().map(Value::Object).collect()),
                        );
                    }
                    row
                })
                .collect();
            let (groups, orphans) = group_by(rows, &options.dataset_id_colname);
            if orphans > 0 {
                debug!(source_id = %source.id, orphans, "distribution rows without a dataset id");
            }
            distribution_groups = groups;
        }

        let sheet_names: HashSet<String> = dataset_rows
            .iter()
            .filter_map(|row| non_empty_str(row.get("name")).map(str::to_string))
            .collect();
        let mut taken: HashSet<String> = HashSet::new();
        let mut records = Vec::with_capacity(dataset_rows.len());
        for mut row in dataset_rows {
            split_list_fields(&mut row);

            if non_empty_str(row.get("identifier")).is_none() {
                if let Some(title) = non_empty_str(row.get("title")).map(str::to_string) {
                    row.insert("identifier".to_string(), Value::String(deterministic_identifier(&title)));
                }
            }

            if let Some(name) = non_empty_str(row.get("name")).map(str::to_string) {
                // Suffixed candidates also avoid names that later rows carry literally.
                let mut unique = name.clone();
                let mut suffix = 0;
                while taken.contains(&unique) || (suffix > 0 && sheet_names.contains(&unique)) {
                    suffix += 1;
                    unique = format!("{name}-{suffix}");
                }
                row.insert("name".to_string(), Value::String(unique.clone()));
                taken.insert(unique);
            }

            let resources = ["identifier", "alternate_identifier", "inspire_id"]
                .iter()
                .filter_map(|key| join_key(&row, key))
                .find_map(|key| distribution_groups.remove(&key))
                .unwrap_or_default();

            records.push(RawRecord {
                fields: row,
                resources,
                ..Default::default()
            });
        }
        Ok(records)
    }
}

#[async_trait]
impl SourceAdapter for SpreadsheetAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Spreadsheet
    }

    fn validate_config(&self, source: &HarvestSource) -> Result<(), HarvestError> {
        SpreadsheetOptions::from_source(source).map(|_| ())
    }

    fn mapping_stage(&self) -> MappingStage {
        MappingStage::Adapter
    }

    async fn fetch(&self, ctx: &AdapterContext, source: &HarvestSource) -> Result<FetchOutcome, AdapterError> {
        let options = SpreadsheetOptions::from_source(source)?;
        let reader = Self::reader(&options, source)?;
        let dataset_sheet = options.dataset_sheet.clone().unwrap_or_default();

        ctx.ensure_active()?;
        let datasets = Table::from_grid(reader.read_sheet(ctx, source, &dataset_sheet).await?);

        let mut distributions = None;
        if let Some(sheet) = options.distribution_sheet.as_deref().filter(|s| !s.is_empty()) {
            ctx.ensure_active()?;
            distributions = Some(Table::from_grid(reader.read_sheet(ctx, source, sheet).await?));
        }
        let mut dictionaries = None;
        if let Some(sheet) = options.datadictionary_sheet.as_deref().filter(|s| !s.is_empty()) {
            ctx.ensure_active()?;
            dictionaries = Some(Table::from_grid(reader.read_sheet(ctx, source, sheet).await?));
        }

        let records = Self::assemble(
            source,
            &options,
            datasets,
            distributions,
            dictionaries,
            &ctx.required_lang,
        )?;
        info!(source_id = %source.id, records = records.len(), "spreadsheet read complete");
        Ok(FetchOutcome::full(records))
    }
}
