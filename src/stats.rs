//! Post-run statistics check against the deployment's counters.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Counter polled after every test when the statistics check is enabled.
pub const LATENCY_STAT: &str = "latency_us";

/// Latency summary reported by the deployment, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub low: f64,
    pub average: f64,
    pub high: f64,
    #[serde(default)]
    pub count: u64,
}

impl LatencyStats {
    /// Ordering invariants: low <= average <= high, and average under the
    /// ceiling. Returns a description of every violation.
    pub fn violations(&self, ceiling: Duration) -> Vec<String> {
        let mut out = Vec::new();
        if self.low > self.average {
            out.push(format!("low watermark {} above average {}", self.low, self.average));
        }
        if self.average > self.high {
            out.push(format!("average {} above high watermark {}", self.average, self.high));
        }
        let ceiling_us = ceiling.as_secs_f64() * 1_000_000.0;
        if self.average >= ceiling_us {
            out.push(format!("average latency {}us not below {}us", self.average, ceiling_us));
        }
        out
    }
}

#[async_trait::async_trait]
pub trait StatsSource: Send + Sync {
    async fn latency(&self, stat: &str) -> Result<LatencyStats>;
}

/// Polls `<base>/<stat>` for a JSON [`LatencyStats`] document.
pub struct HttpStatsSource {
    client: Client,
    base: String,
}

impl HttpStatsSource {
    pub fn new(base: &str) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(5)).build()?,
            base: base.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait::async_trait]
impl StatsSource for HttpStatsSource {
    async fn latency(&self, stat: &str) -> Result<LatencyStats> {
        let url = format!("{}/{}", self.base, stat);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to poll {url}"))?
            .error_for_status()?;
        Ok(resp.json().await?)
    }
}
