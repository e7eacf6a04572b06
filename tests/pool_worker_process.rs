// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Exercises the worker pool against a real, spawned `harvest worker`
//! process end to end, rather than the degenerate zero-worker synchronous
//! path the unit tests cover.

use std::{future::Future, path::PathBuf, pin::Pin, sync::Arc};

use oai_harvest_pool::pool::{Job, WorkerPool};
use serde_json::{Value, json};
use serial_test::serial;

fn config_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/worker_config.yaml")
}

/// The pool only runs this job itself in the degenerate zero-worker case;
/// with `workers >= 1` the spawned process runs its own record-processing
/// job internally, so this stand-in is never actually invoked.
struct UnusedJob;

impl Job for UnusedJob {
    fn run<'a>(&'a self, args: Value) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send + 'a>> {
        Box::pin(async move { Ok(args) })
    }
}

#[tokio::test]
#[serial]
async fn worker_process_round_trips_a_passthrough_record() {
    let worker_bin = PathBuf::from(env!("CARGO_BIN_EXE_harvest"));
    let config = config_path();

    let mut pool =
        WorkerPool::spawn("test-pool", 1, 4, Arc::new(UnusedJob), &worker_bin, &config).unwrap();

    let record = json!({
        "source_id": "demo",
        "record_id": "rec-1",
        "deleted": false,
        "payload": "<dc/>",
    });
    pool.add_request(record).await.unwrap();
    pool.wait_until_done().await.unwrap();

    let mut results = pool.drain_results();
    assert_eq!(results.len(), 1);
    let doc = results.remove(0).result.unwrap();
    assert_eq!(doc["id"], json!(["rec-1"]));
    assert_eq!(doc["source_str"], json!(["demo"]));
    assert_eq!(doc["fullrecord"], json!(["<dc/>"]));

    pool.destroy_worker_pools();
}

#[tokio::test]
#[serial]
async fn zero_workers_runs_synchronously_without_spawning_a_process() {
    let worker_bin = PathBuf::from(env!("CARGO_BIN_EXE_harvest"));
    let config = config_path();

    let mut pool =
        WorkerPool::spawn("sync-pool", 0, 4, Arc::new(UnusedJob), &worker_bin, &config).unwrap();

    let id = pool.add_request(json!({"echo": true})).await.unwrap();
    let results = pool.drain_results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, id);
    assert_eq!(results[0].result.as_ref().unwrap(), &json!({"echo": true}));
}
