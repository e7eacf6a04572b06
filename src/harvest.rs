// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The harvest driver (C6): Identify → first page (by date or all) → loop by
//! resumption token → finalize, with the stuck-token safeguard and the
//! OAI-to-record-envelope translation (id normalization, delete detection,
//! namespace-complete metadata payloads).

use std::{future::Future, pin::Pin};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use tracing::{error, warn};

use crate::{
    cfg::config::{DataSourceConfig, Granularity},
    error::HarvestError,
    http::HttpRequester,
    id::IdNormalizer,
    record::RecordEnvelope,
    xml::{
        XmlElement, XsltTransform, extract_granularity, extract_records, extract_resumption_token,
        extract_response_date, process_response, serialize,
    },
};

/// Consumer of one harvested record (§6 "Callback contract"). The returned
/// count is added to `changedRecords`; the driver adds to `deletedRecords`
/// itself whenever it emits a delete, independent of what the callback
/// returns. Must tolerate being invoked in the parent process.
pub trait HarvestCallback: Send {
    fn on_record<'a>(
        &'a mut self,
        record: RecordEnvelope,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<usize>> + Send + 'a>>;
}

/// One harvested identifier, as delivered by the reduced `listIdentifiers`
/// state machine: no payload is ever fetched for this verb.
#[derive(Debug, Clone)]
pub struct IdentifierEnvelope {
    pub source_id: String,
    pub record_id: String,
    pub deleted: bool,
}

pub trait IdentifierCallback: Send {
    fn on_identifier<'a>(
        &'a mut self,
        record: IdentifierEnvelope,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;
}

/// Outcome of a completed harvest run. `persisted_date` is `Some` only when
/// the harvest finished cleanly; callers must not persist `lastHarvestedDate`
/// otherwise (§3 invariant).
#[derive(Debug, Clone)]
pub struct HarvestOutcome {
    pub changed_records: u64,
    pub deleted_records: u64,
    pub persisted_date: Option<String>,
}

/// Drives one data source's OAI-PMH session end to end.
pub struct Harvester {
    source_id: String,
    cfg: DataSourceConfig,
    id_norm: IdNormalizer,
}

impl Harvester {
    pub fn new(source_id: impl Into<String>, cfg: DataSourceConfig) -> anyhow::Result<Self> {
        let rules = cfg.id_rewrite_rules()?;
        let id_norm = IdNormalizer::compile(&cfg.id_prefix, &rules)?;
        Ok(Self { source_id: source_id.into(), cfg, id_norm })
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Runs `ListRecords` to completion, delivering every non-deleted record
    /// as a namespace-complete metadata fragment and every deleted record as
    /// a nil-payload envelope.
    pub async fn run(
        &self,
        http: &HttpRequester,
        xslt: Option<&dyn XsltTransform>,
        callback: &mut dyn HarvestCallback,
    ) -> Result<HarvestOutcome, HarvestError> {
        let (server_date, granularity) = self.identify(http, xslt).await?;

        let mut changed = 0u64;
        let mut deleted = 0u64;

        let mut token = match self.cfg.resumption_token.clone() {
            Some(t) => t,
            None => {
                let root = self
                    .list_records(http, xslt, None, self.cfg.start_date.as_deref(), self.cfg.end_date.as_deref(), false)
                    .await?;
                let (c, d) = self.process_records_page(&root, callback).await?;
                changed += c;
                deleted += d;
                match extract_resumption_token(&root) {
                    Some(t) => t,
                    None => return Ok(self.finish(changed, deleted, server_date, granularity)),
                }
            },
        };

        let mut repeat_count = 0u32;
        loop {
            let root = self.list_records(http, xslt, Some(&token), None, None, true).await?;
            let (c, d) = self.process_records_page(&root, callback).await?;
            changed += c;
            deleted += d;

            let Some(next_token) = extract_resumption_token(&root) else { break };
            repeat_count = self.check_safeguard(&token, &next_token, repeat_count)?;
            token = next_token;
        }

        Ok(self.finish(changed, deleted, server_date, granularity))
    }

    /// Runs `ListIdentifiers` to completion: the same token loop and
    /// safeguard, but the callback only ever sees `(source, id, deleted)`.
    pub async fn run_identifiers(
        &self,
        http: &HttpRequester,
        xslt: Option<&dyn XsltTransform>,
        callback: &mut dyn IdentifierCallback,
    ) -> Result<HarvestOutcome, HarvestError> {
        let (server_date, granularity) = self.identify(http, xslt).await?;

        let mut changed = 0u64;
        let mut deleted = 0u64;

        let mut token = match self.cfg.resumption_token.clone() {
            Some(t) => t,
            None => {
                let root = self
                    .list_identifiers(http, xslt, None, self.cfg.start_date.as_deref(), self.cfg.end_date.as_deref(), false)
                    .await?;
                let (c, d) = self.process_identifiers_page(&root, callback).await?;
                changed += c;
                deleted += d;
                match extract_resumption_token(&root) {
                    Some(t) => t,
                    None => return Ok(self.finish(changed, deleted, server_date, granularity)),
                }
            },
        };

        let mut repeat_count = 0u32;
        loop {
            let root = self.list_identifiers(http, xslt, Some(&token), None, None, true).await?;
            let (c, d) = self.process_identifiers_page(&root, callback).await?;
            changed += c;
            deleted += d;

            let Some(next_token) = extract_resumption_token(&root) else { break };
            repeat_count = self.check_safeguard(&token, &next_token, repeat_count)?;
            token = next_token;
        }

        Ok(self.finish(changed, deleted, server_date, granularity))
    }

    fn finish(
        &self,
        changed: u64,
        deleted: u64,
        server_date: Option<DateTime<Utc>>,
        granularity: Granularity,
    ) -> HarvestOutcome {
        HarvestOutcome {
            changed_records: changed,
            deleted_records: deleted,
            persisted_date: server_date.map(|dt| granularity.format(dt)),
        }
    }

    /// Counts a request as "stuck" when the token it requested with is the
    /// same one the response handed back; fails once that has happened
    /// `sameResumptionTokenLimit` times in a row (§8's "for all pairs
    /// (token, next_token)" invariant).
    fn check_safeguard(
        &self,
        requested: &str,
        returned: &str,
        repeat_count: u32,
    ) -> Result<u32, HarvestError> {
        if requested == returned {
            let repeat_count = repeat_count + 1;
            if repeat_count >= self.cfg.same_resumption_token_limit {
                error!(source_id = %self.source_id, token = requested, repeat_count, "resumption token did not advance");
                return Err(HarvestError::StuckResumptionToken { repeats: repeat_count });
            }
            Ok(repeat_count)
        } else {
            Ok(0)
        }
    }

    async fn identify(
        &self,
        http: &HttpRequester,
        xslt: Option<&dyn XsltTransform>,
    ) -> Result<(Option<DateTime<Utc>>, Granularity), HarvestError> {
        let (_, body) = http
            .get(&self.cfg.base_url, &[("verb", "Identify")])
            .await
            .map_err(|e| HarvestError::TransportFailed(e.to_string()))?;
        let root =
            process_response(body.as_bytes(), &self.source_id, false, self.cfg.ignore_no_records_match, xslt)
                .await?;

        let server_date = extract_response_date(&root).and_then(|s| parse_oai_datetime(&s));

        let granularity = if matches!(self.cfg.date_granularity, Granularity::Auto) {
            extract_granularity(&root)
                .and_then(|s| s.parse::<Granularity>().ok())
                .unwrap_or(Granularity::Seconds)
        } else {
            self.cfg.date_granularity
        };

        Ok((server_date, granularity))
    }

    async fn list_records(
        &self,
        http: &HttpRequester,
        xslt: Option<&dyn XsltTransform>,
        resumption_token: Option<&str>,
        from: Option<&str>,
        until: Option<&str>,
        is_resumption_request: bool,
    ) -> Result<XmlElement, HarvestError> {
        self.list(http, xslt, "ListRecords", resumption_token, from, until, is_resumption_request).await
    }

    async fn list_identifiers(
        &self,
        http: &HttpRequester,
        xslt: Option<&dyn XsltTransform>,
        resumption_token: Option<&str>,
        from: Option<&str>,
        until: Option<&str>,
        is_resumption_request: bool,
    ) -> Result<XmlElement, HarvestError> {
        self.list(http, xslt, "ListIdentifiers", resumption_token, from, until, is_resumption_request).await
    }

    async fn list(
        &self,
        http: &HttpRequester,
        xslt: Option<&dyn XsltTransform>,
        verb: &str,
        resumption_token: Option<&str>,
        from: Option<&str>,
        until: Option<&str>,
        is_resumption_request: bool,
    ) -> Result<XmlElement, HarvestError> {
        let params = self.build_params(verb, resumption_token, from, until);
        let param_refs: Vec<(&str, &str)> =
            params.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let (_, body) = http
            .get(&self.cfg.base_url, &param_refs)
            .await
            .map_err(|e| HarvestError::TransportFailed(e.to_string()))?;
        process_response(body.as_bytes(), &self.source_id, is_resumption_request, self.cfg.ignore_no_records_match, xslt)
            .await
    }

    /// A resumption-token request carries `verb` and `resumptionToken` only,
    /// per the OAI-PMH protocol — no other parameter may accompany it.
    fn build_params(
        &self,
        verb: &str,
        resumption_token: Option<&str>,
        from: Option<&str>,
        until: Option<&str>,
    ) -> Vec<(String, String)> {
        let mut params = vec![("verb".to_string(), verb.to_string())];
        if let Some(token) = resumption_token {
            params.push(("resumptionToken".to_string(), token.to_string()));
            return params;
        }
        params.push(("metadataPrefix".to_string(), self.cfg.metadata_prefix.clone()));
        if let Some(set) = &self.cfg.set {
            params.push(("set".to_string(), set.clone()));
        }
        if let Some(from) = from {
            params.push(("from".to_string(), from.to_string()));
        }
        if let Some(until) = until {
            params.push(("until".to_string(), until.to_string()));
        }
        params
    }

    async fn process_records_page(
        &self,
        root: &XmlElement,
        callback: &mut dyn HarvestCallback,
    ) -> Result<(u64, u64), HarvestError> {
        let mut changed = 0u64;
        let mut deleted = 0u64;

        for record_el in extract_records(root, "ListRecords") {
            let Some(header) = record_el.children_by_tag("header").into_iter().next() else {
                warn!(source_id = %self.source_id, "record has no header, skipping");
                continue;
            };
            let Some(identifier_el) = header.children_by_tag("identifier").into_iter().next() else {
                warn!(source_id = %self.source_id, "record header has no identifier, skipping");
                continue;
            };
            let record_id = self.id_norm.normalize(&identifier_el.text());
            let is_deleted =
                header.attr("status").is_some_and(|s| s.eq_ignore_ascii_case("deleted"));

            let envelope = if is_deleted {
                deleted += 1;
                RecordEnvelope::delete(self.source_id.clone(), record_id)
            } else {
                let Some(metadata) = record_el.children_by_tag("metadata").into_iter().next()
                else {
                    warn!(source_id = %self.source_id, record_id, "record has no metadata element, skipping");
                    continue;
                };
                let Some(payload_root) = metadata.first_child_element() else {
                    warn!(source_id = %self.source_id, record_id, "metadata element has no child, skipping");
                    continue;
                };
                let mut payload_root = payload_root.clone();
                payload_root.inherit_namespaces();
                RecordEnvelope::upsert(self.source_id.clone(), record_id, serialize(&payload_root))
            };

            let n = callback.on_record(envelope).await.map_err(HarvestError::Other)?;
            changed += n as u64;
        }

        Ok((changed, deleted))
    }

    async fn process_identifiers_page(
        &self,
        root: &XmlElement,
        callback: &mut dyn IdentifierCallback,
    ) -> Result<(u64, u64), HarvestError> {
        let mut changed = 0u64;
        let mut deleted = 0u64;

        for header in extract_records_headers(root) {
            let Some(identifier_el) = header.children_by_tag("identifier").into_iter().next()
            else {
                warn!(source_id = %self.source_id, "header has no identifier, skipping");
                continue;
            };
            let record_id = self.id_norm.normalize(&identifier_el.text());
            let is_deleted =
                header.attr("status").is_some_and(|s| s.eq_ignore_ascii_case("deleted"));
            if is_deleted {
                deleted += 1;
            } else {
                changed += 1;
            }

            callback
                .on_identifier(IdentifierEnvelope {
                    source_id: self.source_id.clone(),
                    record_id,
                    deleted: is_deleted,
                })
                .await
                .map_err(HarvestError::Other)?;
        }

        Ok((changed, deleted))
    }
}

/// Immediate `<header>` children of `<ListIdentifiers>`.
fn extract_records_headers(root: &XmlElement) -> Vec<&XmlElement> {
    let Some(list) = root.first_descendant("ListIdentifiers") else { return Vec::new() };
    list.children_by_tag("header")
}

fn parse_oai_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|ndt| Utc.from_local_datetime(&ndt).single())
}

#[cfg(test)]
mod tests {
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, query_param},
    };

    use super::*;
    use crate::cfg::config::HttpConfig;

    struct CollectingCallback {
        records: Vec<RecordEnvelope>,
    }

    impl HarvestCallback for CollectingCallback {
        fn on_record<'a>(
            &'a mut self,
            record: RecordEnvelope,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<usize>> + Send + 'a>> {
            Box::pin(async move {
                let indexed = usize::from(!record.deleted);
                self.records.push(record);
                Ok(indexed)
            })
        }
    }

    fn base_cfg(base_url: String) -> DataSourceConfig {
        DataSourceConfig {
            base_url,
            set: None,
            metadata_prefix: "oai_dc".to_string(),
            id_prefix: String::new(),
            id_search: Vec::new(),
            id_replace: Vec::new(),
            date_granularity: Granularity::Day,
            start_date: Some("2024-01-01".to_string()),
            end_date: None,
            resumption_token: None,
            debuglog: None,
            oaipmh_transformation: None,
            ignore_no_records_match: false,
            same_resumption_token_limit: 3,
        }
    }

    fn http_cfg() -> HttpConfig {
        HttpConfig {
            max_tries: 2,
            retry_wait: std::time::Duration::from_millis(1),
            timeout: std::time::Duration::from_secs(5),
            user_agent: "test-agent/1".to_string(),
        }
    }

    fn identify_body(date: &str) -> String {
        format!(
            r#"<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/"><responseDate>{date}</responseDate>
               <Identify><granularity>YYYY-MM-DD</granularity></Identify></OAI-PMH>"#
        )
    }

    fn list_records_page(records_xml: &str, token: Option<&str>) -> String {
        let token_xml = token.map(|t| format!("<resumptionToken>{t}</resumptionToken>")).unwrap_or_default();
        format!(
            r#"<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/"><responseDate>2024-03-05T00:00:00Z</responseDate>
               <ListRecords>{records_xml}{token_xml}</ListRecords></OAI-PMH>"#
        )
    }

    fn record_xml(id: &str) -> String {
        format!(
            r#"<record><header><identifier>{id}</identifier><datestamp>2024-01-02</datestamp></header>
               <metadata><dc:dc xmlns:dc="http://purl.org/dc/elements/1.1/"><dc:title>T</dc:title></dc:dc></metadata></record>"#
        )
    }

    #[tokio::test]
    async fn happy_path_two_pages_no_deletes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("verb", "Identify"))
            .respond_with(ResponseTemplate::new(200).set_body_string(identify_body("2024-03-05T00:00:00Z")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("verb", "ListRecords"))
            .and(query_param("metadataPrefix", "oai_dc"))
            .respond_with(ResponseTemplate::new(200).set_body_string(list_records_page(
                &format!("{}{}{}", record_xml("a1"), record_xml("a2"), record_xml("a3")),
                Some("t1"),
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("verb", "ListRecords"))
            .and(query_param("resumptionToken", "t1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(list_records_page(
                &format!("{}{}", record_xml("b1"), record_xml("b2")),
                None,
            )))
            .mount(&server)
            .await;

        let http = HttpRequester::new(http_cfg()).unwrap();
        let harvester = Harvester::new("demo", base_cfg(server.uri())).unwrap();
        let mut cb = CollectingCallback { records: Vec::new() };

        let outcome = harvester.run(&http, None, &mut cb).await.unwrap();

        assert_eq!(cb.records.len(), 5);
        assert!(cb.records.iter().all(|r| !r.deleted));
        assert_eq!(outcome.changed_records, 5);
        assert_eq!(outcome.deleted_records, 0);
        assert_eq!(outcome.persisted_date.as_deref(), Some("2024-03-05"));
    }

    #[tokio::test]
    async fn stuck_resumption_token_is_fatal_and_date_not_persisted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("verb", "Identify"))
            .respond_with(ResponseTemplate::new(200).set_body_string(identify_body("2024-03-05T00:00:00Z")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("verb", "ListRecords"))
            .and(query_param("metadataPrefix", "oai_dc"))
            .respond_with(ResponseTemplate::new(200).set_body_string(list_records_page(&record_xml("a1"), Some("t1"))))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("verb", "ListRecords"))
            .and(query_param("resumptionToken", "t1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(list_records_page(&record_xml("a2"), Some("t1"))))
            .mount(&server)
            .await;

        let http = HttpRequester::new(http_cfg()).unwrap();
        let mut cfg = base_cfg(server.uri());
        cfg.same_resumption_token_limit = 3;
        let harvester = Harvester::new("demo", cfg).unwrap();
        let mut cb = CollectingCallback { records: Vec::new() };

        let err = harvester.run(&http, None, &mut cb).await.unwrap_err();
        assert!(matches!(err, HarvestError::StuckResumptionToken { repeats: 3 }));
    }

    #[tokio::test]
    async fn deleted_record_emits_nil_payload_and_increments_deleted_counter() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("verb", "Identify"))
            .respond_with(ResponseTemplate::new(200).set_body_string(identify_body("2024-03-05T00:00:00Z")))
            .mount(&server)
            .await;
        let deleted_record = r#"<record><header status="deleted"><identifier>gone1</identifier></header></record>"#;
        Mock::given(method("GET"))
            .and(query_param("verb", "ListRecords"))
            .respond_with(ResponseTemplate::new(200).set_body_string(list_records_page(
                &format!("{deleted_record}{}", record_xml("kept1")),
                None,
            )))
            .mount(&server)
            .await;

        let http = HttpRequester::new(http_cfg()).unwrap();
        let harvester = Harvester::new("demo", base_cfg(server.uri())).unwrap();
        let mut cb = CollectingCallback { records: Vec::new() };

        let outcome = harvester.run(&http, None, &mut cb).await.unwrap();

        assert_eq!(outcome.deleted_records, 1);
        assert_eq!(outcome.changed_records, 1);
        let deleted = cb.records.iter().find(|r| r.deleted).unwrap();
        assert!(deleted.payload.is_none());
        let kept = cb.records.iter().find(|r| !r.deleted).unwrap();
        assert!(kept.payload.as_ref().unwrap().contains("xmlns:dc"));
    }
}
