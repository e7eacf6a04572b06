// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashMap, fs, path::Path, path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail, ensure};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Negotiated OAI-PMH date precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Granularity {
    /// Not yet known; resolved from the server's `Identify` response.
    Auto,
    /// `YYYY-MM-DD`.
    Day,
    /// `YYYY-MM-DDThh:mm:ssZ`.
    Seconds,
}

impl std::str::FromStr for Granularity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "YYYY-MM-DD" => Ok(Self::Day),
            "YYYY-MM-DDThh:mm:ssZ" | "seconds" => Ok(Self::Seconds),
            other => bail!("unknown dateGranularity '{other}'"),
        }
    }
}

impl<'de> Deserialize<'de> for Granularity {
    fn deserialize<D>(d: D) -> std::result::Result<Self, D::Error>
    where D: Deserializer<'de> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Granularity {
    /// Formats a captured server response date to this granularity.
    pub fn format(&self, dt: DateTime<Utc>) -> String {
        match self {
            Self::Day => dt.format("%Y-%m-%d").to_string(),
            Self::Seconds | Self::Auto => dt.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        }
    }
}

/// One (pattern, replacement) pair in the ID rewrite pipeline, position-correlated
/// with every other pair from the same `idSearch`/`idReplace` lists.
#[derive(Debug, Clone)]
pub struct IdRewriteRule {
    pub search: String,
    pub replace: String,
}

/// Per-data-source settings.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceConfig {
    /// OAI-PMH base URL to harvest from.
    pub base_url: String,
    /// Optional `set` filter.
    #[serde(default)]
    pub set: Option<String>,
    /// `metadataPrefix` negotiated with the server.
    pub metadata_prefix: String,
    /// Prefix stripped from the raw OAI identifier before rewrite rules apply.
    #[serde(default)]
    pub id_prefix: String,
    /// Ordered regex patterns, position-correlated with `id_replace`.
    #[serde(default)]
    pub id_search: Vec<String>,
    /// Ordered replacements, position-correlated with `id_search`.
    #[serde(default)]
    pub id_replace: Vec<String>,
    /// Negotiated date precision for `from`/`until`.
    #[serde(default = "default_granularity")]
    pub date_granularity: Granularity,
    /// Inclusive start of the harvest window, in `date_granularity`.
    #[serde(default)]
    pub start_date: Option<String>,
    /// Inclusive end of the harvest window, in `date_granularity`.
    #[serde(default)]
    pub end_date: Option<String>,
    /// Skip Identify/first-page and resume directly from this token.
    #[serde(default)]
    pub resumption_token: Option<String>,
    /// Append raw request/response bodies here when set.
    #[serde(default)]
    pub debuglog: Option<PathBuf>,
    /// XSL stylesheet applied to every response before record extraction.
    #[serde(default)]
    pub oaipmh_transformation: Option<PathBuf>,
    /// Tolerate `noRecordsMatch` even on a resumption-token request.
    #[serde(default)]
    pub ignore_no_records_match: bool,
    /// Fail the harvest after this many consecutive identical tokens.
    #[serde(default = "default_same_token_limit")]
    pub same_resumption_token_limit: u32,
}

fn default_granularity() -> Granularity {
    Granularity::Auto
}

fn default_same_token_limit() -> u32 {
    100
}

impl DataSourceConfig {
    /// Parses `id_search`/`id_replace` into position-correlated rewrite rules.
    pub fn id_rewrite_rules(&self) -> Result<Vec<IdRewriteRule>> {
        ensure!(
            self.id_search.len() == self.id_replace.len(),
            "idSearch ({} entries) and idReplace ({} entries) must have the same length",
            self.id_search.len(),
            self.id_replace.len()
        );
        Ok(self
            .id_search
            .iter()
            .zip(self.id_replace.iter())
            .map(|(search, replace)| IdRewriteRule {
                search: search.clone(),
                replace: replace.clone(),
            })
            .collect())
    }
}

/// Worker-pool sizing, shared across all data sources in a deployment.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Number of long-lived worker processes. Zero runs requests synchronously
    /// on the submitter.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Maximum number of pending (not yet dispatched) requests.
    #[serde(default = "default_queue_bound")]
    pub queue_bound: usize,
}

fn default_workers() -> usize {
    4
}

fn default_queue_bound() -> usize {
    8
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_bound: default_queue_bound(),
        }
    }
}

/// HTTP retry/backoff policy shared by the OAI client (C3) and the
/// enrichment fetcher (C7).
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    #[serde(default = "default_retry_wait", with = "serde_secs")]
    pub retry_wait: Duration,
    #[serde(default = "default_timeout", with = "serde_secs")]
    pub timeout: Duration,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_max_tries() -> u32 {
    3
}

fn default_retry_wait() -> Duration {
    Duration::from_secs(2)
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_user_agent() -> String {
    "oai-harvest-pool/0.1".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_tries: default_max_tries(),
            retry_wait: default_retry_wait(),
            timeout: default_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

/// Enrichment orchestrator configuration.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct EnrichConfig {
    pub base_url: String,
    #[serde(default)]
    pub url_prefix_whitelist: Vec<String>,
    #[serde(default)]
    pub uri_prefix_exact_matches: Vec<String>,
}

/// Top-level deployment configuration: every data source plus the shared
/// pool/http/enrichment settings.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    pub sources: HashMap<String, DataSourceConfig>,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub enrich: Option<EnrichConfig>,
    /// Directory `lastHarvestedDate` is persisted under, one JSON file per
    /// source id.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

impl DeploymentConfig {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let s = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path:?}"))?;
        let mut cfg: Self = serde_yaml::from_str(&s)
            .with_context(|| format!("failed to parse config YAML {path:?}"))?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants across every configured data source.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(!self.sources.is_empty(), "at least one data source is required");
        ensure!(self.pool.queue_bound >= 1, "pool.queueBound must be >= 1");
        ensure!(self.http.max_tries >= 1, "http.maxTries must be >= 1");

        for (id, src) in &self.sources {
            ensure!(
                !src.metadata_prefix.is_empty(),
                "source '{id}': metadataPrefix must not be empty"
            );
            ensure!(
                !src.base_url.is_empty(),
                "source '{id}': baseUrl must not be empty"
            );
            ensure!(
                src.same_resumption_token_limit >= 1,
                "source '{id}': sameResumptionTokenLimit must be >= 1"
            );
            src.id_rewrite_rules()
                .with_context(|| format!("source '{id}'"))?;
        }

        if let Some(enrich) = &self.enrich {
            ensure!(
                !enrich.base_url.is_empty(),
                "enrich.baseUrl must not be empty"
            );
        }

        Ok(())
    }
}

/// Serde helper for representing `Duration` as a number of seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
