// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

/// Canonicalizes a possibly-relative path against the current working directory.
pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}

#[derive(Debug, Parser)]
#[command(name = "harvest", version, about = "OAI-PMH incremental harvester")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run an incremental harvest for one or all configured data sources.
    Harvest {
        /// Path to the deployment configuration YAML file.
        #[arg(long, short = 'c')]
        config: String,
        /// Path to the logger configuration YAML file.
        #[arg(long)]
        log_config: String,
        /// Data source id to harvest, or omit with `--all`.
        #[arg(long)]
        source: Option<String>,
        /// Harvest every configured data source in turn.
        #[arg(long, conflicts_with = "source")]
        all: bool,
    },
    /// Internal worker-process entrypoint. Re-exec'd by the pool, never
    /// invoked directly by an operator.
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        pool: String,
        #[arg(long)]
        slot: u32,
        #[arg(long)]
        config: String,
    },
}
