// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Bounded-queue parallel dispatcher: fans requests out to long-lived worker
//! processes over framed IPC channels, or (for a zero-worker pool) runs them
//! synchronously on the submitter.

mod job;
mod rpc;
mod worker;

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde_json::Value;
use tracing::{error, info};

pub use job::Job;
pub use rpc::{RpcReply, RpcRequest};
use worker::WorkerSlot;

use crate::error::PoolError;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A request submitted to the pool, not yet necessarily dispatched.
struct PendingRequest {
    id: u64,
    args: Value,
}

/// A completed request.
#[derive(Debug)]
pub struct PoolResult {
    pub id: u64,
    pub result: anyhow::Result<Value>,
}

/// A bounded-queue worker pool. `workers = 0` is the degenerate synchronous
/// case and must behave transparently to the caller except for ordering.
pub struct WorkerPool {
    pool_id: String,
    queue_bound: usize,
    job: Arc<dyn Job>,
    slots: Vec<WorkerSlot>,
    pending: VecDeque<PendingRequest>,
    results: VecDeque<PoolResult>,
    next_id: u64,
}

impl WorkerPool {
    /// Spawns `workers` long-lived worker processes (re-execing `worker_bin`
    /// as `worker --pool <id> --slot <n> --config <path>`). With
    /// `workers == 0`, no process is spawned and `job` runs synchronously on
    /// the submitter.
    pub fn spawn(
        pool_id: impl Into<String>,
        workers: usize,
        queue_bound: usize,
        job: Arc<dyn Job>,
        worker_bin: &Path,
        config_path: &Path,
    ) -> anyhow::Result<Self> {
        let pool_id = pool_id.into();
        let mut slots = Vec::with_capacity(workers);
        for slot in 0..workers {
            slots.push(WorkerSlot::spawn(worker_bin, config_path, &pool_id, slot)?);
        }
        info!(pool_id = %pool_id, workers, "worker pool ready");
        Ok(Self {
            pool_id,
            queue_bound,
            job,
            slots,
            pending: VecDeque::new(),
            results: VecDeque::new(),
            next_id: 0,
        })
    }

    /// `true` iff any worker slot currently has a request in flight.
    /// Checked directly against the slot table, never a decoupled field.
    pub fn requests_active(&self) -> bool {
        self.slots.iter().any(|s| s.active)
    }

    fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Submits one request, assigning it a monotonic id the caller can use to
    /// correlate with its eventual `PoolResult` (the pool does not preserve
    /// submission order for `workers > 0`).
    pub async fn add_request(&mut self, args: Value) -> Result<u64, PoolError> {
        let id = self.next_id;
        self.next_id += 1;

        if self.slots.is_empty() {
            let result = self.job.run(args).await;
            self.results.push_back(PoolResult { id, result });
            return Ok(id);
        }

        while self.pending_count() >= self.queue_bound {
            self.handle_requests().await?;
            if self.pending_count() >= self.queue_bound {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }

        self.pending.push_back(PendingRequest { id, args });
        self.handle_requests().await?;
        Ok(id)
    }

    /// Reaps dead workers, dispatches as much of the pending queue as there
    /// are idle slots for, and drains any replies that have arrived.
    pub async fn handle_requests(&mut self) -> Result<(), PoolError> {
        for slot in &self.slots {
            if let Some(outcome) = slot.exit_outcome() {
                error!(pool_id = %self.pool_id, pid = slot.pid, exit = %outcome, "worker died");
                return Err(PoolError::WorkerDied {
                    pid: slot.pid,
                    exit: outcome.to_string(),
                });
            }
        }

        while !self.pending.is_empty() {
            let Some(idx) = self.slots.iter().position(|s| !s.active) else {
                break;
            };
            let req = self.pending.pop_front().expect("checked non-empty above");
            let frame = RpcRequest { args: vec![req.args] }
                .encode()
                .map_err(|e| PoolError::ChannelProtocol(e.to_string()))?;
            self.slots[idx].channel.write(&frame).await?;
            self.slots[idx].active = true;
            self.slots[idx].in_flight = Some(req.id);
        }

        for slot in &mut self.slots {
            if !slot.active {
                continue;
            }
            if let Some(frame) = slot.channel.read_nonblocking(Duration::ZERO).await? {
                let reply = RpcReply::decode(&frame)
                    .map_err(|e| PoolError::ChannelProtocol(e.to_string()))?;
                let id = slot.in_flight.take().expect("active slot has in_flight id");
                slot.active = false;
                self.results.push_back(PoolResult { id, result: Ok(reply.r) });
            }
        }

        Ok(())
    }

    /// Blocks (asynchronously) until every submitted request has a result.
    pub async fn wait_until_done(&mut self) -> Result<(), PoolError> {
        loop {
            self.handle_requests().await?;
            if self.pending.is_empty() && !self.requests_active() {
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Drains and returns every result collected so far.
    pub fn drain_results(&mut self) -> Vec<PoolResult> {
        self.results.drain(..).collect()
    }

    /// Hard cancellation: drops pending work and kills every worker process.
    pub fn destroy_worker_pools(&mut self) {
        self.pending.clear();
        for slot in &self.slots {
            slot.kill();
        }
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }
}

/// Resolves the path to the current executable, used to re-exec the worker
/// subcommand rather than hand-rolling a fork.
pub fn current_exe() -> anyhow::Result<PathBuf> {
    std::env::current_exe().map_err(anyhow::Error::from)
}

#[cfg(test)]
mod tests {
    use std::{future::Future, pin::Pin};

    use tokio::process::Command;

    use super::*;

    struct UnusedJob;

    impl Job for UnusedJob {
        fn run<'a>(
            &'a self,
            args: Value,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send + 'a>> {
            Box::pin(async move { Ok(args) })
        }
    }

    fn pool_with_dying_slot() -> WorkerPool {
        let mut command = Command::new("sh");
        command.arg("-c").arg("exit 2");
        let slot = super::worker::WorkerSlot::spawn_test(command).unwrap();
        WorkerPool {
            pool_id: "dying-pool".to_string(),
            queue_bound: 4,
            job: Arc::new(UnusedJob),
            slots: vec![slot],
            pending: VecDeque::new(),
            results: VecDeque::new(),
            next_id: 0,
        }
    }

    #[tokio::test]
    async fn handle_requests_surfaces_worker_died_once_the_reaper_observes_it() {
        let mut pool = pool_with_dying_slot();

        let err = loop {
            match pool.handle_requests().await {
                Ok(()) => tokio::time::sleep(Duration::from_millis(5)).await,
                Err(e) => break e,
            }
        };

        assert!(matches!(err, PoolError::WorkerDied { exit, .. } if exit.contains('2')));
    }

    #[tokio::test]
    async fn zero_workers_runs_synchronously_and_preserves_submit_order() {
        let mut pool = WorkerPool::spawn("sync", 0, 4, Arc::new(UnusedJob), Path::new("/unused"), Path::new("/unused"))
            .unwrap();

        let id1 = pool.add_request(Value::from(1)).await.unwrap();
        let id2 = pool.add_request(Value::from(2)).await.unwrap();

        let results = pool.drain_results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, id1);
        assert_eq!(results[1].id, id2);
        assert_eq!(results[0].result.as_ref().unwrap(), &Value::from(1));
        assert_eq!(results[1].result.as_ref().unwrap(), &Value::from(2));
    }
}
