//! Raw record -> catalog record: mappings, translations, dates, names and the guid.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use harvest_adapters::MappingStage;
use harvest_core::config::COMMON_DATE_FORMATS;
use harvest_core::record::{non_empty_str, parse_timestamp};
use harvest_core::{mapping, CatalogRecord, HarvestError, HarvestSource, JsonMap, RawRecord};
use serde_json::Value;

const TRANSLATED_SUFFIX: &str = "_translated";
const RESOURCE_DATE_FIELDS: &[&str] = &["created", "issued", "modified", "metadata_modified", "last_modified"];
const NAME_MAX_LEN: usize = 100;

/// Output of the transform stage for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformedRecord {
    pub guid: String,
    pub record: CatalogRecord,
    /// Full-precision remote timestamp, taken before dates are cut to the day.
    pub recency: Option<DateTime<Utc>>,
}

/// Parse a date with the source's declared layout, then the common layouts, then timestamp shapes.
pub fn normalize_date(text: &str, source_format: Option<&str>) -> Option<String> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let layouts = source_format.into_iter().chain(COMMON_DATE_FORMATS.iter().copied());
    for layout in layouts {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, layout) {
            return Some(dt.date().format("%Y-%m-%d").to_string());
        }
        if let Ok(date) = NaiveDate::parse_from_str(text, layout) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    parse_timestamp(text).map(|ts| ts.format("%Y-%m-%d").to_string())
}

fn date_field(fields: &JsonMap, key: &str, source_format: Option<&str>) -> Option<String> {
    non_empty_str(fields.get(key)).and_then(|text| normalize_date(text, source_format))
}

fn set_or_remove(fields: &mut JsonMap, key: &str, value: Option<String>) {
    match value {
        Some(value) => {
            fields.insert(key.to_string(), Value::String(value));
        }
        None => {
            fields.remove(key);
        }
    }
}

/// `created` <- issued, `modified` <- metadata_modified <- issued; others have no fallback.
/// A record without any date keeps none here: the import stage supplies `issued` so the
/// gathered content stays the same from one run to the next.
pub fn normalize_dataset_dates(fields: &mut JsonMap, source_format: Option<&str>) {
    let issued = date_field(fields, "issued", source_format);
    let created = date_field(fields, "created", source_format).or_else(|| issued.clone());
    let modified = date_field(fields, "modified", source_format)
        .or_else(|| date_field(fields, "metadata_modified", source_format))
        .or_else(|| issued.clone());

    set_or_remove(fields, "issued", issued);
    set_or_remove(fields, "created", created);
    set_or_remove(fields, "modified", modified);

    for key in ["valid", "temporal_start", "temporal_end"] {
        if fields.contains_key(key) {
            let value = date_field(fields, key, source_format);
            set_or_remove(fields, key, value);
        }
    }
}

fn normalize_resource_dates(resource: &mut JsonMap, source_format: Option<&str>) {
    for key in ["created", "issued", "modified"] {
        if resource.contains_key(key) {
            let value = date_field(resource, key, source_format);
            set_or_remove(resource, key, value);
        }
    }
}

/// Fill `{field}` from `{field}_translated` when the plain field is empty.
pub fn fill_from_translations(fields: &mut JsonMap, required_lang: &str) {
    let stems: Vec<String> = fields
        .keys()
        .filter_map(|k| k.strip_suffix(TRANSLATED_SUFFIX))
        .map(str::to_string)
        .collect();
    for stem in stems {
        if non_empty_str(fields.get(&stem)).is_some() {
            continue;
        }
        let Some(Value::Object(translations)) = fields.get(&format!("{stem}{TRANSLATED_SUFFIX}")) else {
            continue;
        };
        let value = non_empty_str(translations.get(required_lang))
            .or_else(|| translations.values().find_map(|v| non_empty_str(Some(v))))
            .map(str::to_string);
        if let Some(value) = value {
            fields.insert(stem, Value::String(value));
        }
    }
}

/// URL-safe dataset name from a title.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for c in title.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').chars().take(NAME_MAX_LEN).collect::<String>().trim_end_matches('-').to_string()
}

/// Transform one raw record for `source`. Failures are per-record `Transform` errors.
pub fn transform_record(
    raw: &RawRecord,
    source: &HarvestSource,
    stage: MappingStage,
    required_lang: &str,
) -> Result<TransformedRecord, HarvestError> {
    let mapped = match stage {
        MappingStage::Transform => source.config.mappings.apply(raw, required_lang),
        MappingStage::Adapter => mapping::apply(raw, None, None, required_lang),
    };
    let mut record = mapped.map_err(|err| HarvestError::Transform(err.to_string()))?;
    if record.fields.is_empty() {
        return Err(HarvestError::Transform("record has no fields".to_string()));
    }

    let CatalogRecord { fields, resources, extras } = &mut record;
    extras.retain(|extra| !fields.contains_key(&extra.key));
    fill_from_translations(fields, required_lang);

    let source_format = source.config.source_date_format.as_deref();
    let recency = remote_recency(fields, source_format);
    normalize_dataset_dates(fields, source_format);
    for resource in resources.iter_mut() {
        normalize_resource_dates(resource, source_format);
    }

    if non_empty_str(fields.get("name")).is_none() {
        if let Some(title) = non_empty_str(fields.get("title")) {
            let name = slugify(title);
            if !name.is_empty() {
                fields.insert("name".to_string(), Value::String(name));
            }
        }
    }

    let guid = record.guid(Some(source.base_url()));
    Ok(TransformedRecord { guid, record, recency })
}

/// Untruncated `metadata_modified`, else `modified`, read with the source's date layout as a fallback.
fn remote_recency(fields: &JsonMap, source_format: Option<&str>) -> Option<DateTime<Utc>> {
    ["metadata_modified", "modified"].iter().find_map(|key| {
        let text = non_empty_str(fields.get(*key))?;
        parse_timestamp(text).or_else(|| {
            let layout = source_format?;
            NaiveDateTime::parse_from_str(text, layout)
                .ok()
                .or_else(|| {
                    NaiveDate::parse_from_str(text, layout)
                        .ok()
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                })
                .map(|naive| Utc.from_utc_datetime(&naive))
        })
    })
}

/// Most recent of a resource's date fields.
pub fn resource_recency(resource: &JsonMap) -> Option<DateTime<Utc>> {
    RESOURCE_DATE_FIELDS
        .iter()
        .filter_map(|key| non_empty_str(resource.get(*key)).and_then(parse_timestamp))
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::{HarvestConfig, SourceKind};
    use serde_json::json;

    fn source(config: Value) -> HarvestSource {
        HarvestSource {
            id: "remote".into(),
            title: "Remote".into(),
            kind: SourceKind::CatalogApi,
            url: "http://remote.example/".into(),
            owner_org: None,
            enabled: true,
            config: HarvestConfig::from_value(&config).expect("config"),
        }
    }

    #[test]
    fn dates_use_the_declared_layout_first() {
        assert_eq!(normalize_date("03/04/2024", Some("%d/%m/%Y")).as_deref(), Some("2024-04-03"));
        assert_eq!(normalize_date("03/04/2024", None).as_deref(), Some("2024-04-03"));
        assert_eq!(normalize_date("2024-04-03T10:00:00+02:00", None).as_deref(), Some("2024-04-03"));
        assert_eq!(normalize_date("2024-04-03T10:00:00.123456", None).as_deref(), Some("2024-04-03"));
        assert_eq!(normalize_date("soon", None), None);
    }

    #[test]
    fn dataset_dates_fall_back_in_order() {
        let mut fields = JsonMap::new();
        fields.insert("issued".into(), json!("2020-01-02"));
        fields.insert("metadata_modified".into(), json!("2021-05-06T07:08:09"));
        fields.insert("valid".into(), json!("never"));
        normalize_dataset_dates(&mut fields, None);
        assert_eq!(fields["created"], json!("2020-01-02"));
        assert_eq!(fields["modified"], json!("2021-05-06"));
        assert!(!fields.contains_key("valid"));

        let mut empty = JsonMap::new();
        normalize_dataset_dates(&mut empty, None);
        assert!(empty.is_empty());
    }

    #[test]
    fn recency_keeps_the_time_of_day() {
        let src = source(json!({}));
        let raw = RawRecord::from_value(json!({
            "identifier": "R-1",
            "title": "Rivers",
            "modified": "2024-06-01",
            "metadata_modified": "2024-06-01T15:30:00"
        }))
        .expect("raw");
        let out = transform_record(&raw, &src, MappingStage::Adapter, "en").expect("transform");
        assert_eq!(
            out.recency.map(|t| t.to_rfc3339()),
            Some("2024-06-01T15:30:00+00:00".to_string())
        );
        assert_eq!(out.record.get_str("modified"), Some("2024-06-01"));
    }

    #[test]
    fn undated_records_transform_the_same_on_every_run() {
        let src = source(json!({}));
        let raw = RawRecord::from_value(json!({"identifier": "U-1", "title": "Undated"})).expect("raw");
        let out = transform_record(&raw, &src, MappingStage::Adapter, "en").expect("transform");
        assert_eq!(out.recency, None);
        assert_eq!(out.record.get("issued"), None);
        assert_eq!(out.record.get("modified"), None);
    }

    #[test]
    fn translations_fill_the_plain_field_with_the_required_language() {
        let mut fields = JsonMap::new();
        fields.insert("title_translated".into(), json!({"es": "Ríos", "en": "Rivers"}));
        fields.insert("notes_translated".into(), json!({"es": "Datos"}));
        fill_from_translations(&mut fields, "en");
        assert_eq!(fields["title"], json!("Rivers"));
        assert_eq!(fields["notes"], json!("Datos"));
    }

    #[test]
    fn transform_maps_fields_and_derives_name_and_guid() {
        let src = source(json!({
            "field_mapping_schema_version": 1,
            "dataset_field_mapping": {"title": "dataset_title"}
        }));
        let raw = RawRecord::from_value(json!({
            "dataset_title": "Water Quality 2020",
            "spatial": "top-level",
            "extras": [{"key": "spatial", "value": "dup"}, {"key": "owner", "value": "x"}]
        }))
        .expect("raw");
        let out = transform_record(&raw, &src, MappingStage::Transform, "en").expect("transform");
        assert_eq!(out.record.get_str("title"), Some("Water Quality 2020"));
        assert_eq!(out.record.get_str("name"), Some("water-quality-2020"));
        assert_eq!(out.guid, "http://remote.example/water-quality-2020");
        assert_eq!(out.record.extras.len(), 1);
        assert_eq!(out.record.extras[0].key, "owner");
    }

    #[test]
    fn adapter_mapped_records_are_not_mapped_twice() {
        let src = source(json!({
            "field_mapping_schema_version": 1,
            "dataset_field_mapping": {"title": "dataset_title"}
        }));
        let raw = RawRecord::from_value(json!({"title": "Lakes", "identifier": "L-1"})).expect("raw");
        let out = transform_record(&raw, &src, MappingStage::Adapter, "en").expect("transform");
        assert_eq!(out.record.get_str("title"), Some("Lakes"));
        assert_eq!(out.guid, "L-1");
    }

    #[test]
    fn slugs_collapse_separators() {
        assert_eq!(slugify("  Río  Ebro: caudales (2020) "), "r-o-ebro-caudales-2020");
    }

    #[test]
    fn resource_recency_takes_the_latest_date() {
        let mut resource = JsonMap::new();
        resource.insert("created".into(), json!("2020-01-01"));
        resource.insert("last_modified".into(), json!("2023-02-03T04:05:06"));
        assert_eq!(
            resource_recency(&resource).map(|t| t.date_naive().to_string()),
            Some("2023-02-03".into())
        );
    }
}
