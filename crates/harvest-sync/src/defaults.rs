//! Default-value injection and normalization of tags, groups, resource formats and extras.

use std::collections::BTreeMap;

use chrono::Utc;
use harvest_core::config::NameRef;
use harvest_core::record::non_empty_str;
use harvest_core::{Extra, JsonMap};
use serde_json::{json, Value};

pub const NO_LIMITATIONS: &str =
    "http://inspire.ec.europa.eu/metadata-codelist/LimitationsOnPublicAccess/noLimitations";
pub const DEFAULT_LICENSE: &str = "http://creativecommons.org/licenses/by/4.0/";
pub const DEFAULT_LICENSE_ID: &str = "cc-by";
pub const TAG_MAX_LEN: usize = 40;

/// Dataset fields filled when the record leaves them empty.
pub const DATASET_DEFAULTS: &[(&str, &str)] = &[
    ("access_rights", NO_LIMITATIONS),
    ("license", DEFAULT_LICENSE),
    ("license_id", DEFAULT_LICENSE_ID),
    ("topic", "http://inspire.ec.europa.eu/metadata-codelist/TopicCategory/biota"),
    ("theme", "http://inspire.ec.europa.eu/theme/hb"),
    ("theme_eu", "http://publications.europa.eu/resource/authority/data-theme/ENVI"),
    ("status", "http://purl.org/adms/status/UnderDevelopment"),
];

/// Resource fields filled when the resource leaves them empty.
pub const RESOURCE_DEFAULTS: &[(&str, &str)] = &[
    ("url", ""),
    ("license", DEFAULT_LICENSE),
    ("license_id", DEFAULT_LICENSE_ID),
    ("rights", NO_LIMITATIONS),
    ("language", "http://publications.europa.eu/resource/authority/language/ENG"),
];

const KNOWN_FORMATS: &[(&str, &str)] = &[
    ("wms", "WMS"),
    ("wfs", "WFS"),
    ("csv", "CSV"),
    ("json", "JSON"),
    ("geojson", "GeoJSON"),
    ("shp", "SHP"),
    ("shapefile", "SHP"),
    ("zip", "ZIP"),
    ("pdf", "PDF"),
    ("xml", "XML"),
    ("kml", "KML"),
    ("gml", "GML"),
    ("api", "API"),
    ("visor", "HTML"),
    ("enlace", "HTML"),
    ("csw", "CSW"),
];

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        _ => false,
    }
}

/// Fill each `(field, default)` pair the target leaves empty.
pub fn fill_missing(target: &mut JsonMap, defaults: &[(&str, &str)]) {
    for (field, default) in defaults {
        if is_blank(target.get(*field)) {
            target.insert(field.to_string(), Value::String(default.to_string()));
        }
    }
}

/// `issued` for a record that carries none: the stored package's, else today. `created` and
/// `modified` follow `issued` when empty.
pub fn fill_release_dates(fields: &mut JsonMap, existing: Option<&Value>) {
    if is_blank(fields.get("issued")) {
        let issued = existing
            .and_then(|pkg| non_empty_str(pkg.get("issued")))
            .map(str::to_string)
            .unwrap_or_else(|| Utc::now().date_naive().format("%Y-%m-%d").to_string());
        fields.insert("issued".to_string(), Value::String(issued));
    }
    let issued = fields.get("issued").cloned().unwrap_or(Value::Null);
    for key in ["created", "modified"] {
        if is_blank(fields.get(key)) {
            fields.insert(key.to_string(), issued.clone());
        }
    }
}

/// Existing values first, then defaults not already present.
pub fn merge_sequence<T: Clone + PartialEq>(existing: &[T], defaults: &[T]) -> Vec<T> {
    let mut merged: Vec<T> = Vec::with_capacity(existing.len() + defaults.len());
    for value in existing.iter().chain(defaults) {
        if !merged.contains(value) {
            merged.push(value.clone());
        }
    }
    merged
}

/// Lowercase, strip diacritics (keeping `ñ`), replace anything outside `[a-zñ0-9_.-]` and cap the length.
pub fn clean_tag(tag: &str) -> String {
    tag.trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            c @ ('a'..='z' | '0'..='9' | '_' | '.' | '-' | 'ñ') => c,
            _ => '-',
        })
        .take(TAG_MAX_LEN)
        .collect()
}

fn tag_names(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(text) => out.extend(
            text.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        ),
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::Object(map) => {
                        if let Some(name) = non_empty_str(map.get("name")) {
                            out.push(name.to_string());
                        }
                    }
                    other => tag_names(other, out),
                }
            }
        }
        // Multilingual keyword bags: {"en": [...], "es": [...]}
        Value::Object(map) => {
            for nested in map.values() {
                tag_names(nested, out);
            }
        }
        _ => {}
    }
}

/// Collect tags from `tags`, `tag_string` and `keywords` (removing the latter two), append the
/// configured defaults and emit `{name, display_name}` objects de-duplicated by name.
pub fn normalize_tags(fields: &mut JsonMap, default_tags: &[NameRef], clean: bool) -> Vec<Value> {
    let mut names = Vec::new();
    for key in ["tags", "tag_string", "keywords"] {
        let value = if key == "tags" {
            fields.get(key).cloned()
        } else {
            fields.remove(key)
        };
        if let Some(value) = value {
            tag_names(&value, &mut names);
        }
    }
    let defaults: Vec<String> = default_tags.iter().map(|t| t.name().to_string()).collect();
    let names = merge_sequence(&names, &defaults);

    let mut tags: Vec<Value> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    for display in names {
        let name = if clean { clean_tag(&display) } else { display.trim().to_string() };
        if name.is_empty() || seen.contains(&name) {
            continue;
        }
        seen.push(name.clone());
        tags.push(json!({"name": name, "display_name": display.trim()}));
    }
    tags
}

fn group_slug(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "-")
}

/// Group names from a comma string or a list of names/objects, plus the configured defaults.
pub fn group_names(value: Option<&Value>, default_groups: &[NameRef]) -> Vec<String> {
    let mut raw = Vec::new();
    match value {
        Some(Value::String(text)) => raw.extend(text.split(',').map(str::to_string)),
        Some(Value::Array(items)) => {
            for item in items {
                match item {
                    Value::String(name) => raw.push(name.clone()),
                    Value::Object(map) => {
                        if let Some(name) = non_empty_str(map.get("name")) {
                            raw.push(name.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    let record: Vec<String> = raw.iter().map(|n| group_slug(n)).filter(|n| !n.is_empty()).collect();
    let defaults: Vec<String> = default_groups
        .iter()
        .map(|g| group_slug(g.name()))
        .filter(|n| !n.is_empty())
        .collect();
    merge_sequence(&record, &defaults)
}

/// Catalog format label for a resource, from its declared format and URL.
pub fn detect_format(format: Option<&str>, url: &str) -> Option<String> {
    let declared = format.map(|f| f.trim().to_lowercase()).unwrap_or_default();
    let url_lower = url.to_lowercase();

    if declared.contains("esri") || declared.contains("arcgis") || url_lower.contains("viewer.html?url=") {
        return Some("HTML".to_string());
    }
    if declared == "html" || declared == "html5" {
        return Some("HTML".to_string());
    }
    if url_lower.contains("getrecordbyid") {
        return Some("XML".to_string());
    }
    if let Some((_, label)) = KNOWN_FORMATS.iter().find(|(key, _)| *key == declared) {
        return Some(label.to_string());
    }
    if !declared.is_empty() {
        return Some(declared.to_uppercase());
    }

    let path = url_lower.split(['?', '#']).next().unwrap_or_default();
    let last = path.rsplit('/').next().unwrap_or_default();
    let ext = last.rsplit_once('.').map(|(_, ext)| ext)?;
    KNOWN_FORMATS
        .iter()
        .find(|(key, _)| *key == ext)
        .map(|(_, label)| label.to_string())
}

/// `"1.024.000"` -> `1024000`; anything unparseable becomes 0.
pub fn normalize_size(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        Some(Value::String(s)) => s.trim().replace('.', "").parse().unwrap_or(0),
        _ => 0,
    }
}

/// Identifiers substituted into `default_extras` string values.
#[derive(Debug, Clone, Default)]
pub struct ExtraPlaceholders {
    pub harvest_source_id: String,
    pub harvest_source_url: String,
    pub harvest_source_title: String,
    pub harvest_job_id: String,
    pub harvest_object_id: String,
    pub dataset_id: String,
}

impl ExtraPlaceholders {
    pub fn render(&self, template: &str) -> String {
        [
            ("{harvest_source_id}", &self.harvest_source_id),
            ("{harvest_source_url}", &self.harvest_source_url),
            ("{harvest_source_title}", &self.harvest_source_title),
            ("{harvest_job_id}", &self.harvest_job_id),
            ("{harvest_object_id}", &self.harvest_object_id),
            ("{dataset_id}", &self.dataset_id),
        ]
        .iter()
        .fold(template.to_string(), |acc, (key, value)| acc.replace(key, value))
    }
}

/// Add configured extras; an extra already on the record is kept unless `override_existing`.
pub fn apply_default_extras(
    extras: &mut Vec<Extra>,
    defaults: &BTreeMap<String, Value>,
    override_existing: bool,
    placeholders: &ExtraPlaceholders,
) {
    for (key, value) in defaults {
        let rendered = match value {
            Value::String(text) => Value::String(placeholders.render(text)),
            other => Value::String(other.to_string()),
        };
        match extras.iter_mut().find(|e| &e.key == key) {
            Some(existing) if override_existing => existing.value = rendered,
            Some(_) => {}
            None => extras.push(Extra {
                key: key.clone(),
                value: rendered,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_defaults_are_appended_without_duplicates() {
        let merged = merge_sequence(&[json!("a"), json!("b")], &[json!("b"), json!("c")]);
        assert_eq!(merged, vec![json!("a"), json!("b"), json!("c")]);

        let mut fields = JsonMap::new();
        fields.insert("tags".into(), json!(["a", "b"]));
        let defaults = [NameRef::Name("b".into()), NameRef::Name("c".into())];
        let tags = normalize_tags(&mut fields, &defaults, false);
        let names: Vec<_> = tags.iter().map(|t| t["name"].as_str().unwrap_or_default()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        let groups = group_names(Some(&json!(["a", "b"])), &defaults);
        assert_eq!(groups, vec!["a", "b", "c"]);
    }

    #[test]
    fn undated_packages_keep_their_stored_issue_date() {
        let mut fields = JsonMap::new();
        fill_release_dates(&mut fields, Some(&json!({"issued": "2023-09-01"})));
        assert_eq!(fields["issued"], json!("2023-09-01"));
        assert_eq!(fields["created"], json!("2023-09-01"));
        assert_eq!(fields["modified"], json!("2023-09-01"));

        let mut fields = JsonMap::new();
        fields.insert("modified".into(), json!("2024-02-02"));
        fill_release_dates(&mut fields, None);
        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        assert_eq!(fields["issued"], json!(today));
        assert_eq!(fields["modified"], json!("2024-02-02"));
    }

    #[test]
    fn tags_lose_accents_but_keep_enye() {
        assert_eq!(clean_tag("  Hidrografía Ñandú "), "hidrografia-ñandu");
        assert_eq!(clean_tag("Calidad/Agua (2020)"), "calidad-agua--2020-");
        assert_eq!(clean_tag(&"x".repeat(60)).chars().count(), TAG_MAX_LEN);
    }

    #[test]
    fn tags_come_from_every_source_field_and_defaults() {
        let mut fields = JsonMap::new();
        fields.insert("tags".into(), json!([{"name": "Agua"}]));
        fields.insert("tag_string".into(), json!("rivers, agua"));
        fields.insert("keywords".into(), json!({"en": ["Lakes"], "es": ["Lagos"]}));
        let tags = normalize_tags(&mut fields, &[NameRef::Name("opendata".into())], true);
        let names: Vec<_> = tags.iter().map(|t| t["name"].as_str().unwrap_or_default()).collect();
        assert_eq!(names, vec!["agua", "rivers", "lakes", "lagos", "opendata"]);
        assert_eq!(tags[0]["display_name"], json!("Agua"));
        assert!(!fields.contains_key("tag_string"));
        assert!(!fields.contains_key("keywords"));
    }

    #[test]
    fn groups_are_slugged_and_merged_with_defaults() {
        let names = group_names(
            Some(&json!("Medio Ambiente, agua")),
            &[NameRef::Object { name: "agua".into() }, NameRef::Name("Open Data".into())],
        );
        assert_eq!(names, vec!["medio-ambiente", "agua", "open-data"]);
    }

    #[test]
    fn formats_follow_custom_rules_then_the_table() {
        assert_eq!(detect_format(Some("Esri REST"), "http://x"), Some("HTML".into()));
        assert_eq!(detect_format(Some("html5"), "http://x"), Some("HTML".into()));
        assert_eq!(
            detect_format(None, "http://x/csw?request=GetRecordById&id=1"),
            Some("XML".into())
        );
        assert_eq!(detect_format(Some("shapefile"), "http://x"), Some("SHP".into()));
        assert_eq!(detect_format(Some("xlsx"), "http://x"), Some("XLSX".into()));
        assert_eq!(detect_format(None, "http://x/data.geojson?v=2"), Some("GeoJSON".into()));
        assert_eq!(detect_format(None, "http://x/page"), None);
    }

    #[test]
    fn sizes_drop_thousand_separators() {
        assert_eq!(normalize_size(Some(&json!("1.024.000"))), 1_024_000);
        assert_eq!(normalize_size(Some(&json!(2048))), 2048);
        assert_eq!(normalize_size(Some(&json!("big"))), 0);
        assert_eq!(normalize_size(None), 0);
    }

    #[test]
    fn default_extras_keep_record_values_unless_overridden() {
        let placeholders = ExtraPlaceholders {
            harvest_source_id: "src".into(),
            dataset_id: "pkg-1".into(),
            ..Default::default()
        };
        let defaults = BTreeMap::from([
            ("origin".to_string(), json!("{harvest_source_id}/{dataset_id}")),
            ("spatial".to_string(), json!("POINT(0 0)")),
        ]);
        let mut extras = vec![Extra {
            key: "spatial".into(),
            value: json!("POINT(1 1)"),
        }];
        apply_default_extras(&mut extras, &defaults, false, &placeholders);
        assert_eq!(extras[0].value, json!("POINT(1 1)"));
        assert_eq!(extras[1].value, json!("src/pkg-1"));

        apply_default_extras(&mut extras, &defaults, true, &placeholders);
        assert_eq!(extras[0].value, json!("POINT(0 0)"));
    }

    #[test]
    fn missing_dataset_fields_get_defaults() {
        let mut fields = JsonMap::new();
        fields.insert("license_id".into(), json!("odc-by"));
        fields.insert("theme".into(), json!([]));
        fill_missing(&mut fields, DATASET_DEFAULTS);
        assert_eq!(fields["license_id"], json!("odc-by"));
        assert_eq!(fields["theme"], json!("http://inspire.ec.europa.eu/theme/hb"));
        assert_eq!(fields["access_rights"], json!(NO_LIMITATIONS));
    }
}
