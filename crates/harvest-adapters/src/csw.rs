//! OGC CSW 2.0.2 catalog service: paged GetRecords over ISO 19139 metadata.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{HarvestError, HarvestSource, JsonMap, RawRecord, SourceKind};
use quick_xml::events::{BytesStart, Event};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::{AdapterContext, AdapterError, FetchOutcome, FetchScope, RawPayload, SourceAdapter};

pub const GMD_NAMESPACE: &str = "http://www.isotc211.org/2005/gmd";

fn default_output_schema() -> String {
    GMD_NAMESPACE.to_string()
}

fn default_page_size() -> usize {
    10
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CswConstraints {
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CswOptions {
    #[serde(default = "default_output_schema")]
    pub output_schema: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default)]
    pub constraints: CswConstraints,
}

impl CswOptions {
    /// CQL text for the incremental watermark and keyword filters, if any.
    pub fn constraint(&self, since: Option<DateTime<Utc>>) -> Option<String> {
        let mut clauses = Vec::new();
        if let Some(since) = since {
            clauses.push(format!("Modified >= '{}'", since.format("%Y-%m-%dT%H:%M:%SZ")));
        }
        if !self.constraints.keywords.is_empty() {
            let any = self
                .constraints
                .keywords
                .iter()
                .map(|kw| format!("AnyText LIKE '%{}%'", kw.replace('\'', "''")))
                .collect::<Vec<_>>()
                .join(" OR ");
            clauses.push(format!("({any})"));
        }
        if clauses.is_empty() {
            None
        } else {
            Some(clauses.join(" AND "))
        }
    }
}

/// One parsed GetRecords response page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CswPage {
    pub records: Vec<RawRecord>,
    pub matched: Option<usize>,
    pub next_record: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CswAdapter;

impl CswAdapter {
    pub fn get_records_url(
        source: &HarvestSource,
        options: &CswOptions,
        start_position: usize,
        constraint: Option<&str>,
    ) -> Result<Url, AdapterError> {
        let start = start_position.to_string();
        let max = options.page_size.max(1).to_string();
        let mut params = vec![
            ("SERVICE", "CSW"),
            ("VERSION", "2.0.2"),
            ("REQUEST", "GetRecords"),
            ("TYPENAMES", "gmd:MD_Metadata"),
            ("NAMESPACE", "xmlns(gmd=http://www.isotc211.org/2005/gmd)"),
            ("RESULTTYPE", "results"),
            ("ELEMENTSETNAME", "full"),
            ("OUTPUTSCHEMA", options.output_schema.as_str()),
            ("OUTPUTFORMAT", "application/xml"),
            ("startPosition", start.as_str()),
            ("maxRecords", max.as_str()),
        ];
        if let Some(cql) = constraint {
            params.push(("CONSTRAINTLANGUAGE", "CQL_TEXT"));
            params.push(("CONSTRAINT_LANGUAGE_VERSION", "1.1.0"));
            params.push(("CONSTRAINT", cql));
        }
        Url::parse_with_params(source.url.trim(), &params)
            .map_err(|err| AdapterError::Message(format!("invalid CSW url {}: {err}", source.url)))
    }

    pub fn get_record_by_id_url(source: &HarvestSource, output_schema: &str, guid: &str) -> Option<String> {
        Url::parse_with_params(
            source.url.trim(),
            &[
                ("SERVICE", "CSW"),
                ("VERSION", "2.0.2"),
                ("REQUEST", "GetRecordById"),
                ("OUTPUTSCHEMA", output_schema),
                ("OUTPUTFORMAT", "application/xml"),
                ("ID", guid),
            ],
        )
        .ok()
        .map(String::from)
    }
}

#[async_trait]
impl SourceAdapter for CswAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Csw
    }

    fn validate_config(&self, source: &HarvestSource) -> Result<(), HarvestError> {
        Url::parse(source.url.trim())
            .map_err(|err| HarvestError::Configuration(format!("invalid CSW url {}: {err}", source.url)))?;
        let options: CswOptions = source.config.options()?;
        if options.page_size == 0 {
            return Err(HarvestError::Configuration("page_size must be positive".to_string()));
        }
        Ok(())
    }

    async fn fetch(&self, ctx: &AdapterContext, source: &HarvestSource) -> Result<FetchOutcome, AdapterError> {
        let options: CswOptions = source.config.options()?;
        let constraint = options.constraint(ctx.since);
        let mut records = Vec::new();
        let mut payloads = Vec::new();
        let mut start = 1usize;

        loop {
            ctx.ensure_active()?;
            let url = Self::get_records_url(source, &options, start, constraint.as_deref())?;
            let resp = ctx.http.get(ctx.run_id, &source.id, url.as_str(), &[]).await?;
            let page = parse_get_records(&resp.body)?;
            payloads.push(RawPayload {
                extension: "xml",
                bytes: resp.body,
            });

            let returned = page.records.len();
            debug!(source_id = %source.id, start, returned, next = ?page.next_record, "csw page");
            records.extend(page.records);

            let next = match page.next_record {
                Some(next) if next > 0 && returned > 0 => next,
                _ => break,
            };
            if next <= start {
                return Err(AdapterError::Message(format!(
                    "The paging doesn't seem to work: nextRecord {next} after startPosition {start}"
                )));
            }
            if page.matched.is_some_and(|matched| next > matched) {
                break;
            }
            start = next;
        }

        info!(source_id = %source.id, records = records.len(), "csw harvest listing complete");
        Ok(FetchOutcome {
            records,
            scope: match ctx.since {
                Some(since) => FetchScope::ChangedSince(since),
                None => FetchScope::Full,
            },
            rejects: Vec::new(),
            payloads,
        })
    }

    fn original_url(&self, source: &HarvestSource, guid: &str) -> Option<String> {
        let schema = source
            .config
            .options::<CswOptions>()
            .map(|o| o.output_schema)
            .unwrap_or_else(|_| default_output_schema());
        Self::get_record_by_id_url(source, &schema, guid)
    }
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attribute(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == name.as_bytes())
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()))
}

fn ends_with(stack: &[String], suffix: &[&str]) -> bool {
    stack.len() >= suffix.len()
        && stack[stack.len() - suffix.len()..]
            .iter()
            .zip(suffix)
            .all(|(a, b)| a == b)
}

#[derive(Debug, Default)]
struct RecordBuilder {
    fields: JsonMap,
    keywords: Vec<Value>,
    resources: Vec<JsonMap>,
    resource: Option<JsonMap>,
}

impl RecordBuilder {
    fn set_once(&mut self, key: &str, text: &str) {
        if !self.fields.contains_key(key) {
            self.fields.insert(key.to_string(), Value::String(text.to_string()));
        }
    }

    fn set_resource(&mut self, key: &str, text: &str) {
        if let Some(resource) = self.resource.as_mut() {
            resource
                .entry(key.to_string())
                .or_insert_with(|| Value::String(text.to_string()));
        }
    }

    fn text(&mut self, stack: &[String], text: &str) {
        let in_identification = stack.iter().any(|s| s == "identificationInfo");
        if ends_with(stack, &["fileIdentifier", "CharacterString"]) {
            self.set_once("identifier", text);
        } else if in_identification && ends_with(stack, &["citation", "CI_Citation", "title", "CharacterString"]) {
            self.set_once("title", text);
        } else if in_identification && ends_with(stack, &["abstract", "CharacterString"]) {
            self.set_once("notes", text);
        } else if ends_with(stack, &["keyword", "CharacterString"]) || ends_with(stack, &["keyword", "Anchor"]) {
            let value = Value::String(text.to_string());
            if !self.keywords.contains(&value) {
                self.keywords.push(value);
            }
        } else if ends_with(stack, &["dateStamp", "DateTime"]) || ends_with(stack, &["dateStamp", "Date"]) {
            self.set_once("metadata_modified", text);
        } else if ends_with(stack, &["language", "CharacterString"]) {
            self.set_once("language", text);
        } else if ends_with(stack, &["contact", "CI_ResponsibleParty", "organisationName", "CharacterString"]) {
            self.set_once("contact_name", text);
        } else if ends_with(stack, &["contact", "CI_ResponsibleParty", "electronicMailAddress", "CharacterString"]) {
            self.set_once("contact_email", text);
        } else if ends_with(stack, &["CI_OnlineResource", "linkage", "URL"]) {
            self.set_resource("url", text);
        } else if ends_with(stack, &["CI_OnlineResource", "name", "CharacterString"]) {
            self.set_resource("name", text);
        } else if ends_with(stack, &["CI_OnlineResource", "protocol", "CharacterString"]) {
            self.set_resource("format", text);
        } else if ends_with(stack, &["CI_OnlineResource", "description", "CharacterString"]) {
            self.set_resource("description", text);
        }
    }

    fn finish(mut self) -> RawRecord {
        if !self.keywords.is_empty() {
            self.fields.insert("keywords".to_string(), Value::Array(self.keywords));
        }
        RawRecord {
            fields: self.fields,
            resources: self.resources,
            ..Default::default()
        }
    }
}

/// Parse a GetRecords response carrying `gmd:MD_Metadata` records.
pub fn parse_get_records(xml: &[u8]) -> Result<CswPage, AdapterError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut stack: Vec<String> = Vec::new();
    let mut page = CswPage::default();
    let mut current: Option<RecordBuilder> = None;
    let mut exception: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = local_name(&e);
                match name.as_str() {
                    "SearchResults" => {
                        page.matched = attribute(&e, "numberOfRecordsMatched").and_then(|v| v.parse().ok());
                        page.next_record = attribute(&e, "nextRecord").and_then(|v| v.parse().ok());
                    }
                    "MD_Metadata" => current = Some(RecordBuilder::default()),
                    "CI_OnlineResource" => {
                        if let Some(builder) = current.as_mut() {
                            builder.resource = Some(JsonMap::new());
                        }
                    }
                    "LanguageCode" => {
                        if let (Some(builder), Some(code)) = (current.as_mut(), attribute(&e, "codeListValue")) {
                            builder.set_once("language", &code);
                        }
                    }
                    _ => {}
                }
                stack.push(name);
            }
            Ok(Event::Empty(e)) => {
                let name = local_name(&e);
                if name == "SearchResults" {
                    page.matched = attribute(&e, "numberOfRecordsMatched").and_then(|v| v.parse().ok());
                    page.next_record = attribute(&e, "nextRecord").and_then(|v| v.parse().ok());
                } else if name == "LanguageCode" {
                    if let (Some(builder), Some(code)) = (current.as_mut(), attribute(&e, "codeListValue")) {
                        builder.set_once("language", &code);
                    }
                }
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                match name.as_str() {
                    "MD_Metadata" => {
                        if let Some(builder) = current.take() {
                            page.records.push(builder.finish());
                        }
                    }
                    "CI_OnlineResource" => {
                        if let Some(builder) = current.as_mut() {
                            if let Some(resource) = builder.resource.take().filter(|r| r.contains_key("url")) {
                                builder.resources.push(resource);
                            }
                        }
                    }
                    _ => {}
                }
                stack.pop();
            }
            Ok(Event::Text(te)) => {
                let text = te
                    .unescape()
                    .map_err(|err| AdapterError::Message(format!("invalid CSW text: {err}")))?;
                if ends_with(&stack, &["ExceptionText"]) {
                    exception = Some(text.into_owned());
                } else if let Some(builder) = current.as_mut() {
                    builder.text(&stack, text.trim());
                }
            }
            Ok(Event::CData(cdata)) => {
                if let Some(builder) = current.as_mut() {
                    let bytes = cdata.into_inner();
                    let text = String::from_utf8_lossy(&bytes);
                    builder.text(&stack, text.trim());
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(AdapterError::Message(format!("CSW response is not valid XML: {err}"))),
            _ => {}
        }
        buf.clear();
    }

    if let Some(message) = exception {
        return Err(AdapterError::Message(format!("CSW exception: {message}")));
    }
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use harvest_core::HarvestConfig;
    use serde_json::json;

    const PAGE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<csw:GetRecordsResponse xmlns:csw="http://www.opengis.net/cat/csw/2.0.2"
    xmlns:gmd="http://www.isotc211.org/2005/gmd" xmlns:gco="http://www.isotc211.org/2005/gco">
  <csw:SearchResults numberOfRecordsMatched="2" numberOfRecordsReturned="1" nextRecord="2">
    <gmd:MD_Metadata>
      <gmd:fileIdentifier><gco:CharacterString>rec-1</gco:CharacterString></gmd:fileIdentifier>
      <gmd:language><gmd:LanguageCode codeList="x" codeListValue="spa"/></gmd:language>
      <gmd:dateStamp><gco:DateTime>2024-05-01T10:00:00</gco:DateTime></gmd:dateStamp>
      <gmd:identificationInfo>
        <gmd:MD_DataIdentification>
          <gmd:citation><gmd:CI_Citation>
            <gmd:title><gco:CharacterString>Rivers &amp; Lakes</gco:CharacterString></gmd:title>
          </gmd:CI_Citation></gmd:citation>
          <gmd:abstract><gco:CharacterString>Hydrography</gco:CharacterString></gmd:abstract>
          <gmd:descriptiveKeywords><gmd:MD_Keywords>
            <gmd:keyword><gco:CharacterString>water</gco:CharacterString></gmd:keyword>
            <gmd:keyword><gco:CharacterString>water</gco:CharacterString></gmd:keyword>
            <gmd:keyword><gco:CharacterString>inland</gco:CharacterString></gmd:keyword>
          </gmd:MD_Keywords></gmd:descriptiveKeywords>
        </gmd:MD_DataIdentification>
      </gmd:identificationInfo>
      <gmd:distributionInfo><gmd:MD_Distribution><gmd:transferOptions><gmd:MD_DigitalTransferOptions>
        <gmd:onLine><gmd:CI_OnlineResource>
          <gmd:linkage><gmd:URL>http://maps/wms</gmd:URL></gmd:linkage>
          <gmd:protocol><gco:CharacterString>OGC:WMS</gco:CharacterString></gmd:protocol>
          <gmd:name><gco:CharacterString>Rivers WMS</gco:CharacterString></gmd:name>
        </gmd:CI_OnlineResource></gmd:onLine>
        <gmd:onLine><gmd:CI_OnlineResource>
          <gmd:name><gco:CharacterString>No link</gco:CharacterString></gmd:name>
        </gmd:CI_OnlineResource></gmd:onLine>
      </gmd:MD_DigitalTransferOptions></gmd:transferOptions></gmd:MD_Distribution></gmd:distributionInfo>
    </gmd:MD_Metadata>
  </csw:SearchResults>
</csw:GetRecordsResponse>"#;

    fn source() -> HarvestSource {
        HarvestSource {
            id: "csw".into(),
            title: "CSW".into(),
            kind: SourceKind::Csw,
            url: "http://csw.example/csw".into(),
            owner_org: None,
            enabled: true,
            config: HarvestConfig::from_value(&json!({"constraints": {"keywords": ["o'hare"]}})).expect("config"),
        }
    }

    #[test]
    fn iso_records_are_flattened() {
        let page = parse_get_records(PAGE.as_bytes()).expect("page");
        assert_eq!(page.matched, Some(2));
        assert_eq!(page.next_record, Some(2));
        assert_eq!(page.records.len(), 1);
        let record = &page.records[0];
        assert_eq!(record.fields["identifier"], json!("rec-1"));
        assert_eq!(record.fields["title"], json!("Rivers & Lakes"));
        assert_eq!(record.fields["notes"], json!("Hydrography"));
        assert_eq!(record.fields["language"], json!("spa"));
        assert_eq!(record.fields["keywords"], json!(["water", "inland"]));
        assert_eq!(record.fields["metadata_modified"], json!("2024-05-01T10:00:00"));
        assert_eq!(record.resources.len(), 1);
        assert_eq!(record.resources[0]["format"], json!("OGC:WMS"));
    }

    #[test]
    fn exception_reports_are_errors() {
        let xml = r#"<ows:ExceptionReport xmlns:ows="http://www.opengis.net/ows"><ows:Exception>
            <ows:ExceptionText>bad constraint</ows:ExceptionText></ows:Exception></ows:ExceptionReport>"#;
        let err = parse_get_records(xml.as_bytes()).expect_err("exception");
        assert!(err.to_string().contains("bad constraint"));
    }

    #[test]
    fn constraints_combine_watermark_and_keywords() {
        let options: CswOptions = source().config.options().expect("options");
        assert_eq!(options.page_size, 10);
        let since = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).single().expect("ts");
        assert_eq!(
            options.constraint(Some(since)).as_deref(),
            Some("Modified >= '2024-01-02T03:04:05Z' AND (AnyText LIKE '%o''hare%')")
        );
    }

    #[test]
    fn record_by_id_url_carries_the_protocol_parameters() {
        let url = CswAdapter::get_record_by_id_url(&source(), GMD_NAMESPACE, "rec-1").expect("url");
        assert!(url.starts_with("http://csw.example/csw?SERVICE=CSW&VERSION=2.0.2&REQUEST=GetRecordById"));
        assert!(url.ends_with("&ID=rec-1"));
    }
}
