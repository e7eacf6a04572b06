// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! GET with retries, fixed backoff, and an optional raw request/response
//! trace log (C3).

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::Client;
use tracing::{debug, warn};

use crate::{cfg::config::HttpConfig, cfg::logger::perform_save_to_file};

/// Thin wrapper around a `reqwest::Client` that applies the retry/backoff
/// policy shared by the OAI client (C6) and the enrichment fetcher (C7).
#[derive(Debug, Clone)]
pub struct HttpRequester {
    client: Client,
    cfg: HttpConfig,
    debug_trace: Option<std::path::PathBuf>,
}

impl HttpRequester {
    pub fn new(cfg: HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, cfg, debug_trace: None })
    }

    /// Appends timestamped request/response bodies to `path` for every
    /// subsequent call. Kept separate from the tracing subscriber (§10.3)
    /// since it must capture raw wire bodies regardless of log level.
    pub fn with_debug_trace(mut self, path: Option<std::path::PathBuf>) -> Self {
        self.debug_trace = path;
        self
    }

    /// GETs `url` with `params`, retrying up to `max_tries` times on
    /// transport failure or a non-2xx/3xx status, with a fixed sleep between
    /// attempts. Fails with the last observed status or transport error
    /// after the final attempt.
    pub async fn get(&self, url: &str, params: &[(&str, &str)]) -> Result<(u16, String)> {
        let mut last_err: Option<anyhow::Error> = None;

        for attempt in 1..=self.cfg.max_tries {
            self.trace("request", url, params).await;

            match self.try_once(url, params).await {
                Ok((status, body)) if status < 300 => {
                    self.trace_response(status, &body).await;
                    return Ok((status, body));
                },
                Ok((status, body)) => {
                    self.trace_response(status, &body).await;
                    warn!(url, status, attempt, "upstream returned non-success status");
                    last_err = Some(anyhow::anyhow!("upstream status {status}"));
                },
                Err(e) => {
                    warn!(url, attempt, error = %e, "transport failure");
                    last_err = Some(e);
                },
            }

            if attempt < self.cfg.max_tries {
                tokio::time::sleep(self.cfg.retry_wait).await;
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("request failed with no recorded cause")))
            .with_context(|| format!("GET {url} failed after {} attempts", self.cfg.max_tries))
    }

    async fn try_once(&self, url: &str, params: &[(&str, &str)]) -> Result<(u16, String)> {
        let resp = self
            .client
            .get(url)
            .query(params)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        let status = resp.status().as_u16();
        let body = resp.text().await.context("failed to read response body")?;
        Ok((status, body))
    }

    async fn trace(&self, label: &str, url: &str, params: &[(&str, &str)]) {
        let Some(path) = &self.debug_trace else { return };
        let query: HashMap<_, _> = params.iter().copied().collect();
        let line = format!("{} {label} {url} {query:?}\n", Utc::now().to_rfc3339());
        if let Err(e) = perform_save_to_file(path, line).await {
            debug!(error = %e, "failed to append HTTP debug trace");
        }
    }

    async fn trace_response(&self, status: u16, body: &str) {
        let Some(path) = &self.debug_trace else { return };
        let line = format!("{} response {status}\n{body}\n", Utc::now().to_rfc3339());
        if let Err(e) = perform_save_to_file(path, line).await {
            debug!(error = %e, "failed to append HTTP debug trace");
        }
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;

    fn cfg(max_tries: u32) -> HttpConfig {
        HttpConfig {
            max_tries,
            retry_wait: std::time::Duration::from_millis(5),
            timeout: std::time::Duration::from_secs(5),
            user_agent: "test-agent/1".to_string(),
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_try() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hi"))
            .mount(&server)
            .await;

        let req = HttpRequester::new(cfg(3)).unwrap();
        let (status, body) = req.get(&format!("{}/ok", server.uri()), &[]).await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, "hi");
    }

    #[tokio::test]
    async fn retries_on_5xx_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("recovered"))
            .mount(&server)
            .await;

        let req = HttpRequester::new(cfg(3)).unwrap();
        let (status, body) = req.get(&format!("{}/flaky", server.uri()), &[]).await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, "recovered");
    }

    #[tokio::test]
    async fn fails_after_exhausting_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let req = HttpRequester::new(cfg(2)).unwrap();
        let err = req.get(&format!("{}/down", server.uri()), &[]).await.unwrap_err();
        assert!(err.to_string().contains("failed after 2 attempts"));
    }
}
