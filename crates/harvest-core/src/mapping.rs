//! Declarative field mapping: remote field -> local field, literals and per-language variants.
//!
//! Two document shapes are accepted at the boundary and normalized immediately:
//!
//! * v1: `{"title": "remote_title", "title_translated": {"en": "title_en"}}`
//! * v2: `{"title": {"field_name": "remote_title"}, "tags": {"field_position": ["C", "D"], "field_value": ["extra"]}}`
//!
//! Nothing past [`NormalizedMapping`] branches on the version.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::MappingError;
use crate::record::{non_empty_str, CatalogRecord, Extra, JsonMap, RawRecord};

const FIELD_NAME: &str = "field_name";
const FIELD_POSITION: &str = "field_position";
const FIELD_VALUE: &str = "field_value";
const LANGUAGES: &str = "languages";
const EXTRAS_PREFIX: &str = "extras_";
const TRANSLATED_SUFFIX: &str = "_translated";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaVersion {
    V1,
    V2,
}

impl TryFrom<i64> for SchemaVersion {
    type Error = MappingError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SchemaVersion::V1),
            2 => Ok(SchemaVersion::V2),
            other => Err(MappingError::UnsupportedVersion(other)),
        }
    }
}

/// Where a local value comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteFieldRef {
    /// Top-level remote field, by name.
    Direct(String),
    /// Key inside the remote record's extras bag.
    Extra(String),
    /// Spreadsheet column letter (`A`, `B`, ..., `AA`).
    Position(String),
    Literal(Value),
}

impl RemoteFieldRef {
    fn named(name: &str) -> Self {
        match name.strip_prefix(EXTRAS_PREFIX) {
            Some(key) if !key.is_empty() => RemoteFieldRef::Extra(key.to_string()),
            _ => RemoteFieldRef::Direct(name.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldRule {
    /// One reference yields its value; several collect into a de-duplicated sequence.
    Value(Vec<RemoteFieldRef>),
    Languages {
        base: Vec<RemoteFieldRef>,
        languages: BTreeMap<String, Vec<RemoteFieldRef>>,
    },
}

/// Version-tagged mapping document as found in a source configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldMapping {
    V1(JsonMap),
    V2(JsonMap),
}

impl FieldMapping {
    pub fn parse(document: &Value, version: i64) -> Result<Self, MappingError> {
        let version = SchemaVersion::try_from(version)?;
        let Value::Object(map) = document else {
            return Err(MappingError::NotAnObject);
        };
        Ok(match version {
            SchemaVersion::V1 => FieldMapping::V1(map.clone()),
            SchemaVersion::V2 => FieldMapping::V2(map.clone()),
        })
    }

    pub fn normalize(&self) -> Result<NormalizedMapping, MappingError> {
        let map = match self {
            FieldMapping::V1(map) | FieldMapping::V2(map) => map,
        };
        check_local_fields(map)?;
        let mut fields = BTreeMap::new();
        for (local_field, config) in map {
            let rule = match self {
                FieldMapping::V1(_) => normalize_v1(local_field, config)?,
                FieldMapping::V2(_) => normalize_v2(local_field, config)?,
            };
            fields.insert(local_field.clone(), rule);
        }
        Ok(NormalizedMapping { fields })
    }
}

/// Validate a mapping document against an explicit schema version and normalize it.
pub fn validate(document: &Value, version: i64) -> Result<NormalizedMapping, MappingError> {
    FieldMapping::parse(document, version)?.normalize()
}

fn check_local_fields(map: &JsonMap) -> Result<(), MappingError> {
    for local_field in map.keys() {
        if local_field.trim().is_empty() {
            return Err(MappingError::EmptyLocalField);
        }
        if let Some(base) = local_field.strip_suffix(TRANSLATED_SUFFIX) {
            if map.contains_key(base) {
                return Err(MappingError::RedundantTranslatedField {
                    base: base.to_string(),
                    translated: local_field.clone(),
                });
            }
        }
    }
    Ok(())
}

fn is_language_code(lang: &str) -> bool {
    lang.len() == 2 && lang.bytes().all(|b| b.is_ascii_lowercase())
}

fn normalize_v1(local_field: &str, value: &Value) -> Result<FieldRule, MappingError> {
    match value {
        Value::String(name) => Ok(FieldRule::Value(vec![RemoteFieldRef::named(name)])),
        Value::Object(langs) => {
            let mut languages = BTreeMap::new();
            for (lang, name) in langs {
                if !is_language_code(lang) {
                    return Err(MappingError::InvalidLanguage(lang.clone()));
                }
                let Value::String(name) = name else {
                    return Err(MappingError::InvalidV1Value(local_field.to_string()));
                };
                languages.insert(lang.clone(), vec![RemoteFieldRef::named(name)]);
            }
            Ok(FieldRule::Languages {
                base: Vec::new(),
                languages,
            })
        }
        _ => Err(MappingError::InvalidV1Value(local_field.to_string())),
    }
}

#[derive(Default)]
struct V2Flags {
    position: bool,
    name: bool,
}

fn normalize_v2(local_field: &str, config: &Value) -> Result<FieldRule, MappingError> {
    let Value::Object(config) = config else {
        return Err(MappingError::InvalidFieldConfig(local_field.to_string()));
    };
    let mut flags = V2Flags::default();
    let base = field_refs(local_field, config, &mut flags, true)?;

    let rule = match config.get(LANGUAGES) {
        None | Some(Value::Null) => FieldRule::Value(base),
        Some(Value::Object(langs)) => {
            let mut languages = BTreeMap::new();
            for (lang, lang_config) in langs {
                if !is_language_code(lang) {
                    return Err(MappingError::InvalidLanguage(lang.clone()));
                }
                let Value::Object(lang_config) = lang_config else {
                    return Err(MappingError::InvalidLanguages(local_field.to_string()));
                };
                let refs = field_refs(local_field, lang_config, &mut flags, false)?;
                languages.insert(lang.clone(), refs);
            }
            FieldRule::Languages { base, languages }
        }
        Some(_) => return Err(MappingError::InvalidLanguages(local_field.to_string())),
    };

    if flags.position && flags.name {
        return Err(MappingError::PositionAndName(local_field.to_string()));
    }
    Ok(rule)
}

fn field_refs(
    local_field: &str,
    config: &JsonMap,
    flags: &mut V2Flags,
    allow_languages: bool,
) -> Result<Vec<RemoteFieldRef>, MappingError> {
    for prop in config.keys() {
        let known = matches!(prop.as_str(), FIELD_NAME | FIELD_POSITION | FIELD_VALUE)
            || (allow_languages && prop == LANGUAGES);
        if !known {
            return Err(MappingError::InvalidProperty {
                local_field: local_field.to_string(),
                prop: prop.clone(),
            });
        }
    }

    let mut refs = Vec::new();
    if let Some(names) = string_values(local_field, FIELD_NAME, config.get(FIELD_NAME))? {
        flags.name = true;
        refs.extend(names.iter().map(|n| RemoteFieldRef::named(n)));
    }
    if let Some(positions) = string_values(local_field, FIELD_POSITION, config.get(FIELD_POSITION))? {
        flags.position = true;
        for position in positions {
            let position = position.to_uppercase();
            if column_index(&position).is_none() {
                return Err(MappingError::InvalidPosition {
                    local_field: local_field.to_string(),
                    position,
                });
            }
            refs.push(RemoteFieldRef::Position(position));
        }
    }
    // Only validated for shape here; literals carry the original JSON value.
    let literal = config.get(FIELD_VALUE).filter(|v| !v.is_null());
    string_values(local_field, FIELD_VALUE, literal)?;
    if let Some(literal) = literal {
        if !refs.is_empty() && !literal.is_array() {
            return Err(MappingError::ValueNotList(local_field.to_string()));
        }
        refs.push(RemoteFieldRef::Literal(literal.clone()));
    }
    Ok(refs)
}

/// `None` for absent/null; a string or a list of strings otherwise.
fn string_values(local_field: &str, prop: &str, value: Option<&Value>) -> Result<Option<Vec<String>>, MappingError> {
    let invalid = || MappingError::InvalidValue {
        local_field: local_field.to_string(),
        prop: prop.to_string(),
    };
    let values = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| item.as_str().map(ToString::to_string).ok_or_else(invalid))
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(invalid()),
    };
    if prop != FIELD_VALUE && matches!(value, Some(Value::String(s)) if s.contains(',')) {
        return Err(MappingError::CommaInValue {
            local_field: local_field.to_string(),
            prop: prop.to_string(),
        });
    }
    Ok(Some(values))
}

/// Borrowed view of the record side a mapping reads from.
#[derive(Debug, Clone, Copy)]
pub struct FieldSource<'a> {
    pub fields: &'a JsonMap,
    pub extras: &'a [Extra],
    pub columns: &'a [String],
}

/// Validated mapping, keyed by local field name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedMapping {
    pub fields: BTreeMap<String, FieldRule>,
}

impl NormalizedMapping {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Remote field names referenced by name, used to check a remote schema up front.
    pub fn direct_references(&self) -> Vec<&str> {
        let mut out = Vec::new();
        for rule in self.fields.values() {
            let refs: Vec<&RemoteFieldRef> = match rule {
                FieldRule::Value(refs) => refs.iter().collect(),
                FieldRule::Languages { base, languages } => {
                    base.iter().chain(languages.values().flatten()).collect()
                }
            };
            for r in refs {
                if let RemoteFieldRef::Direct(name) = r {
                    if !out.contains(&name.as_str()) {
                        out.push(name.as_str());
                    }
                }
            }
        }
        out
    }

    /// Resolve every mapped local field from `source` into `target`.
    pub fn apply_to(
        &self,
        source: FieldSource<'_>,
        target: &mut JsonMap,
        required_lang: &str,
    ) -> Result<(), MappingError> {
        for (local_field, rule) in &self.fields {
            match rule {
                FieldRule::Value(refs) => {
                    let value = resolve_all(local_field, refs, source)?;
                    target.insert(local_field.clone(), value);
                }
                FieldRule::Languages { base, languages } => {
                    let stem = local_field.strip_suffix(TRANSLATED_SUFFIX).unwrap_or(local_field);
                    let mut translated = JsonMap::new();
                    for (lang, refs) in languages {
                        translated.insert(lang.clone(), resolve_all(local_field, refs, source)?);
                    }
                    let denormalized = if base.is_empty() {
                        non_empty_str(translated.get(required_lang))
                            .or_else(|| translated.values().find_map(|v| non_empty_str(Some(v))))
                            .map(|s| Value::String(s.to_string()))
                            .unwrap_or(Value::Null)
                    } else {
                        resolve_all(local_field, base, source)?
                    };
                    target.insert(format!("{stem}{TRANSLATED_SUFFIX}"), Value::Object(translated));
                    target.insert(stem.to_string(), denormalized);
                }
            }
        }
        Ok(())
    }
}

fn resolve_one(
    local_field: &str,
    reference: &RemoteFieldRef,
    source: FieldSource<'_>,
) -> Result<Option<Value>, MappingError> {
    Ok(match reference {
        RemoteFieldRef::Direct(name) => source.fields.get(name).cloned(),
        RemoteFieldRef::Extra(key) => source
            .extras
            .iter()
            .find(|e| &e.key == key)
            .map(|e| e.value.clone()),
        RemoteFieldRef::Position(position) => {
            if source.columns.is_empty() {
                return Err(MappingError::NoColumnLayout {
                    local_field: local_field.to_string(),
                    position: position.clone(),
                });
            }
            column_index(position)
                .and_then(|idx| source.columns.get(idx))
                .and_then(|header| source.fields.get(header))
                .cloned()
        }
        RemoteFieldRef::Literal(value) => Some(value.clone()),
    })
}

fn resolve_all(local_field: &str, refs: &[RemoteFieldRef], source: FieldSource<'_>) -> Result<Value, MappingError> {
    if let [single] = refs {
        return Ok(resolve_one(local_field, single, source)?.unwrap_or(Value::Null));
    }
    let mut items: Vec<Value> = Vec::new();
    for reference in refs {
        let values = match resolve_one(local_field, reference, source)? {
            None | Some(Value::Null) => continue,
            Some(Value::Array(values)) => values,
            Some(value) => vec![value],
        };
        for value in values {
            if !items.contains(&value) {
                items.push(value);
            }
        }
    }
    Ok(if items.is_empty() && refs.is_empty() {
        Value::Null
    } else {
        Value::Array(items)
    })
}

/// Map a raw record into local-schema shape. Unmapped remote fields pass through untouched.
pub fn apply(
    record: &RawRecord,
    dataset: Option<&NormalizedMapping>,
    distribution: Option<&NormalizedMapping>,
    required_lang: &str,
) -> Result<CatalogRecord, MappingError> {
    let mut fields = record.fields.clone();
    if let Some(mapping) = dataset {
        let source = FieldSource {
            fields: &record.fields,
            extras: &record.extras,
            columns: &record.columns,
        };
        mapping.apply_to(source, &mut fields, required_lang)?;
    }

    let mut resources = Vec::with_capacity(record.resources.len());
    for resource in &record.resources {
        let mut out = resource.clone();
        if let Some(mapping) = distribution {
            let source = FieldSource {
                fields: resource,
                extras: &[],
                columns: &record.resource_columns,
            };
            mapping.apply_to(source, &mut out, required_lang)?;
        }
        resources.push(out);
    }

    Ok(CatalogRecord {
        fields,
        resources,
        extras: record.extras.clone(),
    })
}

/// Spreadsheet column letter for a zero-based index: 0 -> A, 25 -> Z, 26 -> AA.
pub fn column_letter(index: usize) -> String {
    let mut letters = Vec::new();
    let mut j = index;
    loop {
        letters.push(b'A' + (j % 26) as u8);
        if j < 26 {
            break;
        }
        j = j / 26 - 1;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

/// Inverse of [`column_letter`]; `None` unless the input is one or more ASCII letters.
pub fn column_index(letters: &str) -> Option<usize> {
    if letters.is_empty() {
        return None;
    }
    let mut n: usize = 0;
    for b in letters.bytes() {
        if !b.is_ascii_alphabetic() {
            return None;
        }
        let digit = (b.to_ascii_uppercase() - b'A') as usize + 1;
        n = n.checked_mul(26)?.checked_add(digit)?;
    }
    Some(n - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawRecord {
        RawRecord::from_value(value).expect("raw record")
    }

    #[test]
    fn column_letters_follow_bijective_base_26() {
        assert_eq!(column_letter(0), "A");
        assert_eq!(column_letter(25), "Z");
        assert_eq!(column_letter(26), "AA");
        assert_eq!(column_letter(701), "ZZ");
        assert_eq!(column_letter(702), "AAA");
        for idx in [0, 1, 25, 26, 27, 51, 52, 701, 702, 18_277] {
            assert_eq!(column_index(&column_letter(idx)), Some(idx));
        }
        assert_eq!(column_index("ab"), Some(27));
        assert_eq!(column_index("A1"), None);
        assert_eq!(column_index(""), None);
    }

    #[test]
    fn unsupported_versions_are_rejected() {
        let err = validate(&json!({"title": "t"}), 3).expect_err("v3");
        assert_eq!(err, MappingError::UnsupportedVersion(3));
    }

    #[test]
    fn position_and_name_together_are_rejected() {
        let doc = json!({"title": {"field_name": "t", "field_position": "B"}});
        assert_eq!(
            validate(&doc, 2).expect_err("both"),
            MappingError::PositionAndName("title".into())
        );

        let across_languages = json!({"title_translated": {"languages": {
            "en": {"field_name": "title_en"},
            "es": {"field_position": "C"}
        }}});
        assert!(matches!(
            validate(&across_languages, 2),
            Err(MappingError::PositionAndName(_))
        ));
    }

    #[test]
    fn bad_language_codes_are_rejected() {
        let v2 = json!({"notes_translated": {"languages": {"eng": {"field_name": "n"}}}});
        assert_eq!(
            validate(&v2, 2).expect_err("eng"),
            MappingError::InvalidLanguage("eng".into())
        );
        let v1 = json!({"notes_translated": {"EN": "notes"}});
        assert!(matches!(validate(&v1, 1), Err(MappingError::InvalidLanguage(_))));
    }

    #[test]
    fn translated_field_with_its_base_is_redundant() {
        let doc = json!({"title": "t", "title_translated": {"en": "t_en"}});
        assert!(matches!(
            validate(&doc, 1),
            Err(MappingError::RedundantTranslatedField { .. })
        ));
    }

    #[test]
    fn field_value_next_to_a_reference_must_be_a_list() {
        let scalar = json!({"tags": {"field_name": "keywords", "field_value": "extra"}});
        assert_eq!(
            validate(&scalar, 2).expect_err("scalar"),
            MappingError::ValueNotList("tags".into())
        );
        let list = json!({"tags": {"field_name": "keywords", "field_value": ["extra"]}});
        assert!(validate(&list, 2).is_ok());
    }

    #[test]
    fn commas_are_only_allowed_in_literals() {
        let doc = json!({"tags": {"field_name": "a,b"}});
        assert!(matches!(validate(&doc, 2), Err(MappingError::CommaInValue { .. })));
        let doc = json!({"notes": {"field_value": "a, b"}});
        assert!(validate(&doc, 2).is_ok());
    }

    #[test]
    fn unknown_properties_and_value_types_are_rejected() {
        assert!(matches!(
            validate(&json!({"title": {"field": "t"}}), 2),
            Err(MappingError::InvalidProperty { .. })
        ));
        assert!(matches!(
            validate(&json!({"title": {"field_name": 3}}), 2),
            Err(MappingError::InvalidValue { .. })
        ));
        assert!(matches!(validate(&json!({"title": 3}), 1), Err(MappingError::InvalidV1Value(_))));
        assert!(matches!(validate(&json!(["title"]), 2), Err(MappingError::NotAnObject)));
    }

    #[test]
    fn positions_are_upper_cased() {
        let mapping = validate(&json!({"title": {"field_position": "ab"}}), 2).expect("valid");
        assert_eq!(
            mapping.fields["title"],
            FieldRule::Value(vec![RemoteFieldRef::Position("AB".into())])
        );
    }

    #[test]
    fn extras_prefix_normalizes_to_extra_reference() {
        let mapping = validate(&json!({"spatial": {"field_name": "extras_spatial"}}), 2).expect("valid");
        assert_eq!(
            mapping.fields["spatial"],
            FieldRule::Value(vec![RemoteFieldRef::Extra("spatial".into())])
        );
        let record = raw(json!({"extras": [{"key": "spatial", "value": "POINT(1 2)"}]}));
        let out = apply(&record, Some(&mapping), None, "en").expect("apply");
        assert_eq!(out.get("spatial"), Some(&json!("POINT(1 2)")));
    }

    #[test]
    fn v1_and_equivalent_v2_produce_identical_records() {
        let v1 = validate(
            &json!({
                "title": "remote_title",
                "notes_translated": {"en": "notes_en", "es": "notes_es"},
                "license_id": "extras_licence"
            }),
            1,
        )
        .expect("v1");
        let v2 = validate(
            &json!({
                "title": {"field_name": "remote_title"},
                "notes_translated": {"languages": {
                    "en": {"field_name": "notes_en"},
                    "es": {"field_name": "notes_es"}
                }},
                "license_id": {"field_name": "extras_licence"}
            }),
            2,
        )
        .expect("v2");
        let record = raw(json!({
            "remote_title": "Rivers",
            "notes_en": "River gauges",
            "notes_es": "Aforos",
            "extras": [{"key": "licence", "value": "cc-by"}]
        }));
        let a = apply(&record, Some(&v1), None, "es").expect("v1 apply");
        let b = apply(&record, Some(&v2), None, "es").expect("v2 apply");
        assert_eq!(a, b);
        assert_eq!(a.get("notes"), Some(&json!("Aforos")));
        assert_eq!(a.get("notes_translated"), Some(&json!({"en": "River gauges", "es": "Aforos"})));
        assert_eq!(a.get("license_id"), Some(&json!("cc-by")));
    }

    #[test]
    fn applying_a_mapping_leaves_no_mapped_key_missing() {
        let mapping = validate(
            &json!({
                "title": {"field_name": "t"},
                "tag_string": {"field_name": ["k1", "k2"], "field_value": ["base"]},
                "theme": {"field_value": "http://inspire.ec.europa.eu/theme/hy"},
                "description_translated": {"languages": {"fr": {"field_name": "d_fr"}}}
            }),
            2,
        )
        .expect("valid");
        let record = raw(json!({"t": "T", "k1": ["a", "b"], "k2": "b", "d_fr": "Desc"}));
        let out = apply(&record, Some(&mapping), None, "en").expect("apply");
        for key in ["title", "tag_string", "theme", "description", "description_translated"] {
            assert!(out.fields.contains_key(key), "missing {key}");
        }
        assert_eq!(out.get("tag_string"), Some(&json!(["a", "b", "base"])));
        // required language absent: first available translation is used
        assert_eq!(out.get("description"), Some(&json!("Desc")));
    }

    #[test]
    fn positions_resolve_through_the_column_layout() {
        let mapping = validate(&json!({"title": {"field_position": "B"}}), 2).expect("valid");
        let mut record = RawRecord::from_fields(
            json!({"Code": "x1", "Name": "Forests"})
                .as_object()
                .cloned()
                .expect("object"),
        );
        let err = apply(&record, Some(&mapping), None, "en").expect_err("no layout");
        assert!(matches!(err, MappingError::NoColumnLayout { .. }));

        record.columns = vec!["Code".into(), "Name".into()];
        let out = apply(&record, Some(&mapping), None, "en").expect("apply");
        assert_eq!(out.get("title"), Some(&json!("Forests")));
    }

    #[test]
    fn distribution_mapping_applies_to_each_resource() {
        let mapping = validate(&json!({"url": "access_url"}), 1).expect("valid");
        let record = raw(json!({"resources": [{"access_url": "http://a"}, {"access_url": "http://b"}]}));
        let out = apply(&record, None, Some(&mapping), "en").expect("apply");
        let urls: Vec<_> = out.resources.iter().map(|r| r["url"].clone()).collect();
        assert_eq!(urls, vec![json!("http://a"), json!("http://b")]);
    }
}
