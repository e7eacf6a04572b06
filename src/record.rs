// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The record envelope handed from the harvester to the pipeline, and the
//! narrow `RecordDriver` interface that turns one into a flat, Solr-like
//! document (§1 "Deliberately out of scope": record-format-specific
//! transformations are an external collaborator; this module only fixes the
//! shape of the envelope and the document it becomes).

use std::{collections::HashMap, future::Future, pin::Pin};

use serde::{Deserialize, Serialize};

/// One harvested record, as delivered by the harvest driver (C6) to its
/// callback. `deleted = true` implies `payload = None`; `deleted = false`
/// implies `payload` is a well-formed, namespace-complete XML fragment
/// rooted at the metadata element.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordEnvelope {
    pub source_id: String,
    pub record_id: String,
    pub deleted: bool,
    pub payload: Option<String>,
}

impl RecordEnvelope {
    pub fn upsert(source_id: impl Into<String>, record_id: impl Into<String>, payload: String) -> Self {
        Self {
            source_id: source_id.into(),
            record_id: record_id.into(),
            deleted: false,
            payload: Some(payload),
        }
    }

    pub fn delete(source_id: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self { source_id: source_id.into(), record_id: record_id.into(), deleted: true, payload: None }
    }
}

/// A flat, multi-valued document, the shape the enrichment orchestrator (C7)
/// and the document store expect: field name to an ordered list of values,
/// mirroring a Solr update document.
pub type FlatDocument = HashMap<String, Vec<String>>;

/// Appends `value` to `field`, creating the field if absent. The enrichment
/// orchestrator relies on this for `_uri_str_mv` bookkeeping and label
/// accumulation; duplicates are intentionally not deduplicated here (§4.6:
/// "the downstream indexer normalizes").
pub fn append_field(doc: &mut FlatDocument, field: &str, value: impl Into<String>) {
    doc.entry(field.to_string()).or_default().push(value.into());
}

/// Turns a harvested record into a flat document. This is the "record
/// driver" the specification treats as an external collaborator (MARC, DC,
/// LIDO, EAD, …); the implementation here is a narrow stand-in that carries
/// the envelope's identity and raw payload through unmodified, fixing only
/// the interface the enrichment orchestrator and the sink depend on.
pub trait RecordDriver: Send + Sync {
    fn to_flat_document(&self, record: &RecordEnvelope) -> FlatDocument;
}

/// Stand-in record driver: copies `id`, `deleted`, and the raw metadata
/// payload straight into the flat document without any format-specific
/// parsing.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughRecordDriver;

impl RecordDriver for PassthroughRecordDriver {
    fn to_flat_document(&self, record: &RecordEnvelope) -> FlatDocument {
        let mut doc = FlatDocument::new();
        append_field(&mut doc, "id", record.record_id.clone());
        append_field(&mut doc, "source_str", record.source_id.clone());
        append_field(&mut doc, "deleted_bool", record.deleted.to_string());
        if let Some(payload) = &record.payload {
            append_field(&mut doc, "fullrecord", payload.clone());
        }
        doc
    }
}

/// The work a worker process performs on one dispatched record: run the
/// record driver, then the enrichment orchestrator, returning the resulting
/// flat document for the parent to hand to the sink.
pub trait RecordProcessor: Send + Sync {
    fn process<'a>(
        &'a self,
        record: RecordEnvelope,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<FlatDocument>> + Send + 'a>>;
}
