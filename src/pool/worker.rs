// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{path::Path, process::ExitStatus, sync::Arc};

use once_cell::sync::OnceCell;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::Channel;

/// One long-lived worker process and its bookkeeping. `active` is the only
/// source of truth for whether a request is in flight on this slot.
pub struct WorkerSlot {
    pub pid: u32,
    pub channel: Channel<ChildStdout, ChildStdin>,
    pub active: bool,
    /// Submitter-assigned id of the request currently in flight, if any.
    pub in_flight: Option<u64>,
    exited: Arc<OnceCell<ExitOutcome>>,
    kill: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct ExitOutcome {
    pub status: Option<ExitStatus>,
    pub cause: Option<String>,
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.status, &self.cause) {
            (Some(s), _) => write!(f, "{s}"),
            (None, Some(c)) => write!(f, "{c}"),
            (None, None) => write!(f, "unknown"),
        }
    }
}

impl WorkerSlot {
    /// Re-execs the current binary as `worker --pool <id> --slot <n> --config
    /// <path>`, wiring its stdio to a framed channel.
    pub fn spawn(
        worker_bin: &Path,
        config_path: &Path,
        pool_id: &str,
        slot: usize,
    ) -> anyhow::Result<Self> {
        let mut command = Command::new(worker_bin);
        command
            .arg("worker")
            .arg("--pool")
            .arg(pool_id)
            .arg("--slot")
            .arg(slot.to_string())
            .arg("--config")
            .arg(config_path);
        Self::spawn_command(command)
    }

    /// Spawns an arbitrary command with piped stdio, reaped the same way a
    /// real worker is. Exercises the reaper/`exit_outcome` path against a
    /// process that is not the `harvest worker` re-exec — used by tests to
    /// simulate a worker dying (§8 scenario 5) without a real record
    /// pipeline.
    #[cfg(test)]
    pub(crate) fn spawn_test(command: Command) -> anyhow::Result<Self> {
        Self::spawn_command(command)
    }

    fn spawn_command(mut command: Command) -> anyhow::Result<Self> {
        let mut child: Child = command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("spawned worker has no pid"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("worker stdin not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("worker stdout not piped"))?;

        let exited = Arc::new(OnceCell::new());
        let kill = CancellationToken::new();
        spawn_reaper(child, pid, exited.clone(), kill.clone());

        Ok(Self {
            pid,
            channel: Channel::new(stdout, stdin),
            active: false,
            in_flight: None,
            exited,
            kill,
        })
    }

    /// Returns the worker's exit outcome, if the reaper has already observed
    /// termination.
    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        self.exited.get().cloned()
    }

    /// Requests termination of the worker process.
    pub fn kill(&self) {
        self.kill.cancel();
    }
}

fn spawn_reaper(
    mut child: Child,
    pid: u32,
    exited: Arc<OnceCell<ExitOutcome>>,
    kill: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => {
                let outcome = match status {
                    Ok(s) => ExitOutcome { status: Some(s), cause: None },
                    Err(e) => ExitOutcome { status: None, cause: Some(e.to_string()) },
                };
                debug!(pid, exit = %outcome, "worker process exited");
                let _ = exited.set(outcome);
            }
            () = kill.cancelled() => {
                if let Err(e) = child.start_kill() {
                    warn!(pid, error = %e, "failed to signal worker termination");
                }
                let status = child.wait().await.ok();
                let _ = exited.set(ExitOutcome { status, cause: None });
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn exit_outcome_observes_a_nonzero_exit_code() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("exit 2");
        let slot = WorkerSlot::spawn_test(command).unwrap();

        let outcome = loop {
            if let Some(outcome) = slot.exit_outcome() {
                break outcome;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        assert_eq!(outcome.status.unwrap().code(), Some(2));
    }

    #[tokio::test]
    async fn kill_forces_an_exit_outcome_for_a_long_running_child() {
        let mut command = Command::new("sh");
        command.arg("-c").arg("sleep 30");
        let slot = WorkerSlot::spawn_test(command).unwrap();
        assert!(slot.exit_outcome().is_none());

        slot.kill();

        let outcome = loop {
            if let Some(outcome) = slot.exit_outcome() {
                break outcome;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(outcome.status.is_some() || outcome.cause.is_none());
    }
}
