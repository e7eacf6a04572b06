// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-record enrichment against an external vocabulary service (C7):
//! whitelist filter, local cache lookup, remote JSON fetch, `exactMatch`
//! traversal, label accumulation. The vocabulary service itself is the
//! external collaborator §1 calls out; the HTTP transport to reach it
//! (`reqwest`, via [`crate::http::HttpRequester`]) is implemented for real.

use std::{future::Future, pin::Pin, sync::Arc};

use anyhow::Context;
use dashmap::DashMap;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    cfg::config::EnrichConfig,
    http::HttpRequester,
    record::{FlatDocument, append_field},
};

/// Everything outside `unreserved` per RFC 3986, which is what the fetch
/// URL's `uri` query parameter needs escaped.
const FRAGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'#')
    .add(b'?')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b':')
    .add(b'&')
    .add(b'=');

/// One cached vocabulary lookup, keyed by the canonical fetch URL. Pipe-
/// delimited on the wire (§3 "Enrichment cache entry"); structured once in
/// memory.
#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    pub pref_labels: Vec<String>,
    pub alt_labels: Vec<String>,
}

impl CacheEntry {
    pub fn encode(&self) -> (String, String) {
        (self.pref_labels.join("|"), self.alt_labels.join("|"))
    }

    pub fn decode(pref_labels: &str, alt_labels: &str) -> Self {
        let split = |s: &str| -> Vec<String> {
            if s.is_empty() { Vec::new() } else { s.split('|').map(String::from).collect() }
        };
        Self { pref_labels: split(pref_labels), alt_labels: split(alt_labels) }
    }
}

/// Local cache of vocabulary lookups, keyed by canonical fetch URL.
/// Immutable once written; TTL is the caller's concern (§3).
pub trait EnrichCache: Send + Sync {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<CacheEntry>> + Send + 'a>>;

    fn put<'a>(
        &'a self,
        key: String,
        entry: CacheEntry,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;
}

/// `DashMap`-backed cache, correct within one process. §3 describes the
/// cache as "external (database-backed)"; this is the in-process stand-in —
/// a production deployment swaps in a DB-backed `EnrichCache` to share
/// lookups across worker processes.
#[derive(Default)]
pub struct InMemoryEnrichCache {
    entries: DashMap<String, (String, String)>,
}

impl EnrichCache for InMemoryEnrichCache {
    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<CacheEntry>> + Send + 'a>> {
        Box::pin(async move {
            self.entries.get(key).map(|e| CacheEntry::decode(&e.0, &e.1))
        })
    }

    fn put<'a>(
        &'a self,
        key: String,
        entry: CacheEntry,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.entries.insert(key, entry.encode());
            Ok(())
        })
    }
}

/// Per-record enrichment orchestrator (C7).
pub struct Enricher {
    http: HttpRequester,
    cfg: EnrichConfig,
    cache: Arc<dyn EnrichCache>,
}

impl Enricher {
    pub fn new(http: HttpRequester, cfg: EnrichConfig, cache: Arc<dyn EnrichCache>) -> Self {
        Self { http, cfg, cache }
    }

    fn is_whitelisted(&self, uri: &str) -> bool {
        self.cfg.url_prefix_whitelist.iter().any(|p| uri.starts_with(p.as_str()))
    }

    fn is_exact_match_source(&self, uri: &str) -> bool {
        self.cfg.uri_prefix_exact_matches.iter().any(|p| uri.starts_with(p.as_str()))
    }

    /// `<base>/data?format=application/json&uri=<urlencode(uri)>`.
    fn canonical_url(&self, uri: &str) -> String {
        let encoded = utf8_percent_encode(uri, FRAGMENT);
        format!("{}/data?format=application/json&uri={encoded}", self.cfg.base_url.trim_end_matches('/'))
    }

    /// Enriches `doc[field]` from the vocabulary concept at `uri`. The URI
    /// is always recorded in `{field}_uri_str_mv`, whitelisted or not.
    pub async fn enrich(&self, doc: &mut FlatDocument, uri: &str, field: &str) -> anyhow::Result<()> {
        append_field(doc, &format!("{field}_uri_str_mv"), uri.to_string());

        if !self.is_whitelisted(uri) {
            debug!(uri, field, "enrichment URI is not whitelisted, skipping");
            return Ok(());
        }

        let fetch_url = self.canonical_url(uri);

        if let Some(cached) = self.cache.get(&fetch_url).await {
            for label in cached.pref_labels.iter().chain(cached.alt_labels.iter()) {
                append_field(doc, field, label.clone());
            }
            return Ok(());
        }

        let (status, body) = self
            .http
            .get(&fetch_url, &[])
            .await
            .with_context(|| format!("fetching enrichment data for {uri}"))?;
        if status >= 300 {
            warn!(uri, status, "enrichment fetch returned a non-success status");
            return Ok(());
        }

        let payload: Value = serde_json::from_str(&body)
            .with_context(|| format!("parsing enrichment JSON for {uri}"))?;
        let graph = payload.get("graph").and_then(Value::as_array).cloned().unwrap_or_default();

        let mut alt_labels = Vec::new();
        let mut pref_labels = Vec::new();

        if let Some(concept) = find_concept(&graph, uri) {
            alt_labels.extend(collect_label_values(concept, "altLabel"));

            if self.is_exact_match_source(uri)
                && let Some(refs) = concept.get("exactMatch").and_then(Value::as_array)
            {
                for reference in refs {
                    let Some(ref_uri) = reference.as_str() else { continue };
                    match self.fetch_exact_match(ref_uri).await {
                        Ok(Some((alt, pref))) => {
                            alt_labels.extend(alt);
                            pref_labels.extend(pref);
                        },
                        Ok(None) => {},
                        Err(e) => warn!(ref_uri, error = %e, "exactMatch fetch failed"),
                    }
                }
            }
        }

        for label in pref_labels.iter().chain(alt_labels.iter()) {
            append_field(doc, field, label.clone());
        }

        self.cache
            .put(fetch_url, CacheEntry { pref_labels, alt_labels })
            .await
            .context("failed to write enrichment cache entry")?;
        Ok(())
    }

    async fn fetch_exact_match(
        &self,
        ref_uri: &str,
    ) -> anyhow::Result<Option<(Vec<String>, Vec<String>)>> {
        let url = self.canonical_url(ref_uri);
        let (status, body) = self.http.get(&url, &[]).await?;
        if status >= 300 {
            return Ok(None);
        }
        let payload: Value = serde_json::from_str(&body)?;
        let graph = payload.get("graph").and_then(Value::as_array).cloned().unwrap_or_default();
        Ok(find_concept(&graph, ref_uri)
            .map(|c| (collect_label_values(c, "altLabel"), collect_label_values(c, "prefLabel"))))
    }
}

/// Finds the `skos:Concept` (or a `type` array containing it) in `graph`
/// whose `uri` equals `uri`.
fn find_concept<'a>(graph: &'a [Value], uri: &str) -> Option<&'a Value> {
    graph.iter().find(|item| {
        is_skos_concept(item) && item.get("uri").and_then(Value::as_str) == Some(uri)
    })
}

fn is_skos_concept(item: &Value) -> bool {
    match item.get("type") {
        Some(Value::String(s)) => s == "skos:Concept",
        Some(Value::Array(arr)) => arr.iter().any(|v| v.as_str() == Some("skos:Concept")),
        _ => false,
    }
}

/// Collects `item[field].value` (an object) or `item[field][*].value` (an
/// array of language-tagged labels).
fn collect_label_values(item: &Value, field: &str) -> Vec<String> {
    match item.get(field) {
        Some(Value::Object(_)) => item
            .get(field)
            .and_then(|v| v.get("value"))
            .and_then(Value::as_str)
            .map(|s| vec![s.to_string()])
            .unwrap_or_default(),
        Some(Value::Array(arr)) => arr
            .iter()
            .filter_map(|v| v.get("value").and_then(Value::as_str))
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}
