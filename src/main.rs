// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! CLI entrypoint (C8): the `harvest` subcommand runs the pipeline glue for
//! one or every configured data source; the hidden `worker` subcommand is the
//! re-exec target `WorkerSlot::spawn` launches and is never invoked directly.

use std::{
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
};

use anyhow::{Context, Result, ensure};
use clap::Parser;
use oai_harvest_pool::{
    cfg::{
        cli::{Cli, Command, resolve_config_path},
        config::DeploymentConfig,
        logger::init_logger,
    },
    channel::Channel,
    enrich::{EnrichCache, Enricher, InMemoryEnrichCache},
    error::{HarvestError, PoolError},
    harvest::{HarvestCallback, HarvestOutcome, Harvester},
    http::HttpRequester,
    pool::{Job, PoolResult, RpcReply, RpcRequest, WorkerPool, current_exe},
    record::{FlatDocument, PassthroughRecordDriver, RecordDriver, RecordEnvelope, RecordProcessor, append_field},
    sink::{JsonlFileSink, SharedSink, Sink},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Harvest { config, log_config, source, all } => run_harvest(&config, &log_config, source, all).await,
        Command::Worker { pool, slot, config } => run_worker(pool, slot, config).await,
    }
}

/// Turns a harvested record into a flat document, running the record driver
/// and (when configured) the enrichment orchestrator. This is the unit of
/// work dispatched to each worker process.
struct PipelineProcessor {
    driver: Arc<dyn RecordDriver>,
    enricher: Option<Arc<Enricher>>,
}

impl RecordProcessor for PipelineProcessor {
    fn process<'a>(
        &'a self,
        record: RecordEnvelope,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<FlatDocument>> + Send + 'a>> {
        Box::pin(async move {
            let mut doc = self.driver.to_flat_document(&record);

            // A real record driver populates `<field>_uri_str_mv` with
            // vocabulary URIs extracted from the source metadata; this
            // generic subject-uri hook is where the enrichment orchestrator
            // attaches. `PassthroughRecordDriver` never produces one.
            if let Some(enricher) = &self.enricher {
                let uris = doc.get("subject_uri_str_mv").cloned().unwrap_or_default();
                for uri in uris {
                    enricher.enrich(&mut doc, &uri, "topic").await?;
                }
            }

            Ok(doc)
        })
    }
}

fn build_processor(cfg: &DeploymentConfig) -> Result<Arc<dyn RecordProcessor>> {
    let driver: Arc<dyn RecordDriver> = Arc::new(PassthroughRecordDriver);
    let enricher = match &cfg.enrich {
        Some(enrich_cfg) => {
            let http = HttpRequester::new(cfg.http.clone())?;
            let cache: Arc<dyn EnrichCache> = Arc::new(InMemoryEnrichCache::default());
            Some(Arc::new(Enricher::new(http, enrich_cfg.clone(), cache)))
        },
        None => None,
    };
    Ok(Arc::new(PipelineProcessor { driver, enricher }))
}

/// Adapts [`RecordProcessor`] to the pool's untyped [`Job`] contract, so the
/// same processing logic runs identically in the degenerate synchronous pool
/// (zero workers) and inside a spawned worker process.
struct RecordJob {
    processor: Arc<dyn RecordProcessor>,
}

impl Job for RecordJob {
    fn run<'a>(
        &'a self,
        args: Value,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send + 'a>> {
        Box::pin(async move {
            let record: RecordEnvelope =
                serde_json::from_value(args).context("decoding dispatched record envelope")?;
            let doc = self.processor.process(record).await?;
            serde_json::to_value(doc).context("encoding flat document reply")
        })
    }
}

async fn run_harvest(config: &str, log_config: &str, source: Option<String>, all: bool) -> Result<()> {
    let _guard = init_logger(log_config)?;

    let config_path = resolve_config_path(config)?;
    let cfg = DeploymentConfig::load_from_file(&config_path)?;

    let source_ids: Vec<String> = if all {
        let mut ids: Vec<_> = cfg.sources.keys().cloned().collect();
        ids.sort();
        ids
    } else {
        let id = source.context("--source <id> is required unless --all is given")?;
        ensure!(cfg.sources.contains_key(&id), "unknown data source '{id}'");
        vec![id]
    };

    let http = HttpRequester::new(cfg.http.clone())?;
    let worker_bin = current_exe()?;

    let mut had_failure = false;
    for source_id in source_ids {
        match harvest_one(&cfg, &source_id, &http, &worker_bin, &config_path).await {
            Ok(outcome) => {
                info!(
                    source_id,
                    changed = outcome.changed_records,
                    deleted = outcome.deleted_records,
                    persisted_date = outcome.persisted_date.as_deref(),
                    "harvest completed"
                );
            },
            Err(e) => {
                had_failure = true;
                error!(source_id, error = %e, "harvest failed");
            },
        }
    }

    if had_failure {
        std::process::exit(1);
    }
    Ok(())
}

async fn harvest_one(
    cfg: &DeploymentConfig,
    source_id: &str,
    http: &HttpRequester,
    worker_bin: &Path,
    config_path: &Path,
) -> Result<HarvestOutcome> {
    let mut src_cfg = cfg
        .sources
        .get(source_id)
        .cloned()
        .with_context(|| format!("unknown data source '{source_id}'"))?;

    if let Some(date) = load_state(&cfg.state_dir, source_id)? {
        src_cfg.start_date = Some(date);
    }

    let harvester = Harvester::new(source_id, src_cfg)?;
    let processor = build_processor(cfg)?;
    let job: Arc<dyn Job> = Arc::new(RecordJob { processor });
    let mut pool = WorkerPool::spawn(source_id, cfg.pool.workers, cfg.pool.queue_bound, job, worker_bin, config_path)?;
    let sink: SharedSink = Arc::new(JsonlFileSink::open(format!("output/{source_id}.jsonl")).await?);

    let outcome = {
        let mut callback = PipelineCallback { pool: &mut pool, sink: sink.clone() };
        harvester.run(http, None, &mut callback).await?
    };

    pool.wait_until_done().await.map_err(HarvestError::from)?;
    for result in pool.drain_results() {
        persist_result(&sink, result).await?;
    }
    pool.destroy_worker_pools();

    if let Some(date) = &outcome.persisted_date {
        save_state(&cfg.state_dir, source_id, date).await?;
    }

    Ok(outcome)
}

/// Feeds each harvested record to the worker pool (or persists it directly,
/// for a delete) and opportunistically drains whatever results are already
/// back, so the sink stays roughly caught up with the harvest instead of
/// buffering everything until the end.
struct PipelineCallback<'p> {
    pool: &'p mut WorkerPool,
    sink: SharedSink,
}

impl HarvestCallback for PipelineCallback<'_> {
    fn on_record<'a>(
        &'a mut self,
        record: RecordEnvelope,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            if record.deleted {
                let mut doc = FlatDocument::new();
                append_field(&mut doc, "id", record.record_id.clone());
                append_field(&mut doc, "deleted_bool", "true".to_string());
                self.sink.persist(doc).await?;
                return Ok(0);
            }

            let args = serde_json::to_value(&record).context("encoding record envelope for dispatch")?;
            self.pool.add_request(args).await.map_err(anyhow::Error::from)?;

            for result in self.pool.drain_results() {
                persist_result(&self.sink, result).await?;
            }
            Ok(1)
        })
    }
}

async fn persist_result(sink: &SharedSink, result: PoolResult) -> Result<()> {
    match result.result {
        Ok(value) => {
            let doc: FlatDocument =
                serde_json::from_value(value).context("decoding flat document from worker reply")?;
            sink.persist(doc).await?;
        },
        Err(e) => warn!(error = %e, "worker failed to process a record"),
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct HarvestState {
    last_harvested_date: String,
}

fn state_path(state_dir: &Path, source_id: &str) -> PathBuf {
    state_dir.join(format!("{source_id}.json"))
}

fn load_state(state_dir: &Path, source_id: &str) -> Result<Option<String>> {
    let path = state_path(state_dir, source_id);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path).with_context(|| format!("failed to read state file {path:?}"))?;
    let state: HarvestState =
        serde_json::from_str(&content).with_context(|| format!("failed to parse state file {path:?}"))?;
    Ok(Some(state.last_harvested_date))
}

async fn save_state(state_dir: &Path, source_id: &str, date: &str) -> Result<()> {
    tokio::fs::create_dir_all(state_dir)
        .await
        .with_context(|| format!("failed to create state directory {state_dir:?}"))?;
    let path = state_path(state_dir, source_id);
    let content = serde_json::to_string_pretty(&HarvestState { last_harvested_date: date.to_string() })
        .context("failed to serialize harvest state")?;
    tokio::fs::write(&path, content)
        .await
        .with_context(|| format!("failed to write state file {path:?}"))?;
    Ok(())
}

/// Internal worker-process entrypoint: reads one framed RPC request at a
/// time from stdin, runs the same [`RecordProcessor`] the synchronous pool
/// would, and writes back one framed reply per request until the parent
/// closes its side of the channel.
async fn run_worker(pool_id: String, slot: u32, config: String) -> Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).with_ansi(false).init();

    let cfg = DeploymentConfig::load_from_file(&config)?;
    let processor = build_processor(&cfg)?;
    let job = RecordJob { processor };

    let mut channel = Channel::new(tokio::io::stdin(), tokio::io::stdout());
    info!(pool_id, slot, "worker ready");

    loop {
        let frame = match channel.read_blocking().await {
            Ok(frame) => frame,
            Err(PoolError::ChannelClosed) => break,
            Err(e) => return Err(e.into()),
        };

        let request = RpcRequest::decode(&frame).context("decoding rpc request")?;
        let args = request.args.into_iter().next().context("rpc request carried no argument")?;

        let r = match job.run(args).await {
            Ok(value) => value,
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        };
        let reply = RpcReply { r }.encode().context("encoding rpc reply")?;
        channel.write(&reply).await?;
    }

    info!(pool_id, slot, "worker shutting down");
    Ok(())
}
