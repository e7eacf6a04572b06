// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Fatal errors that stop a harvest run. A harvest that fails with any of
/// these does not persist `lastHarvestedDate`.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("transport failed after retries: {0}")]
    TransportFailed(String),

    #[error("malformed XML response (errors: {errors}, saved to {path})")]
    MalformedResponse { errors: String, path: String },

    #[error("OAI-PMH server reported error {code}: {text}")]
    OaiError { code: String, text: String },

    #[error("resumption token did not advance after {repeats} attempts")]
    StuckResumptionToken { repeats: u32 },

    /// Includes `PoolError::WorkerDied` — a pool-owned worker exiting is
    /// fatal to the harvest it was serving.
    #[error(transparent)]
    Channel(#[from] PoolError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors local to the framed IPC channel and the worker pool (C1/C2).
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("channel closed before a full frame was read")]
    ChannelClosed,

    #[error("channel protocol violation: {0}")]
    ChannelProtocol(String),

    #[error("channel write broken: {0}")]
    ChannelBroken(String),

    #[error("worker {pid} died with {exit}")]
    WorkerDied { pid: u32, exit: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
