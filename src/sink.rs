// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The document store a harvested, enriched record is ultimately persisted
//! to. §1 lists this as a deliberately out-of-scope external collaborator;
//! this module fixes the narrow `Sink` trait the pipeline glue (C8) depends
//! on and ships one concrete, append-only stand-in so the crate is runnable
//! end to end without a real search index.

use std::{future::Future, path::PathBuf, pin::Pin, sync::Arc};

use anyhow::{Context, Result};
use tokio::{fs::File, io::AsyncWriteExt, sync::Mutex};
use tracing::debug;

use crate::record::FlatDocument;

/// Persists one flat document, returning the number of documents it counted
/// as indexed (almost always 1; the callback contract in §6 sums this into
/// `changedRecords`).
pub trait Sink: Send + Sync {
    fn persist<'a>(
        &'a self,
        doc: FlatDocument,
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>>;
}

/// Append-only JSON-lines stand-in for a real document store. Each call
/// appends one `FlatDocument` as a line of JSON, matching the spec's note
/// that the cache/sink's persistence is idempotent-on-key and tolerant of
/// concurrent, unordered writers.
pub struct JsonlFileSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlFileSink {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create sink directory {parent:?}"))?;
        }
        let file = File::options()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open sink file {path:?}"))?;
        Ok(Self { path, file: Mutex::new(file) })
    }
}

impl Sink for JsonlFileSink {
    fn persist<'a>(
        &'a self,
        doc: FlatDocument,
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            let mut line = serde_json::to_vec(&doc).context("failed to serialize flat document")?;
            line.push(b'\n');
            let mut file = self.file.lock().await;
            file.write_all(&line)
                .await
                .with_context(|| format!("failed to append to sink file {:?}", self.path))?;
            debug!(path = ?self.path, "persisted document");
            Ok(1)
        })
    }
}

/// Wraps a sink so it can be shared across the async tasks that drain pool
/// results.
pub type SharedSink = Arc<dyn Sink>;

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[tokio::test]
    async fn persisted_documents_round_trip_as_json_lines() {
        let dir = tempfile_dir();
        let path = dir.join("docs.jsonl");
        let sink = JsonlFileSink::open(&path).await.unwrap();

        let mut doc: FlatDocument = HashMap::new();
        doc.insert("id".to_string(), vec!["rec1".to_string()]);
        let n = sink.persist(doc.clone()).await.unwrap();
        assert_eq!(n, 1);

        let n2 = sink.persist(doc).await.unwrap();
        assert_eq!(n2, 1);

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    fn tempfile_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("oai-harvest-pool-sink-test-{}", std::process::id()));
        dir
    }
}
