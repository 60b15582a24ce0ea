//! Scraping `/stats` from the serving tier.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forecast_core::{MetricsSample, ServingStats};
use forecast_resilience::CircuitBreaker;
use std::time::Duration;
use tracing::{debug, warn};

/// One aggregated observation and how many targets answered for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Scrape { pub sample: MetricsSample, pub answered: usize }

#[async_trait]
pub trait StatsSource: Send + Sync {
    /// `None` when no target answered.
    async fn scrape(&self, at: DateTime<Utc>) -> Option<Scrape>;
}

struct Target { base: String, breaker: CircuitBreaker }

pub struct HttpStatsSource { client: reqwest::Client, targets: Vec<Target> }

impl HttpStatsSource {
    pub fn new(targets: &[String], timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let targets = targets.iter().map(|t| Target { base: t.trim_end_matches('/').to_string(), breaker: CircuitBreaker::new(3, Duration::from_secs(60)) }).collect();
        Ok(Self { client, targets })
    }

    async fn fetch(&self, target: &Target) -> Option<ServingStats> {
        if !target.breaker.allow() {
            debug!(target = %target.base, "circuit open, skipping target");
            return None;
        }
        let url = format!("{}/stats", target.base);
        let res = async { self.client.get(&url).send().await?.error_for_status()?.json::<ServingStats>().await }.await;
        match res {
            Ok(stats) => { target.breaker.record_success(); Some(stats) }
            Err(e) => { target.breaker.record_failure(); warn!(target = %target.base, error = %e, "stats scrape failed"); None }
        }
    }
}

#[async_trait]
impl StatsSource for HttpStatsSource {
    async fn scrape(&self, at: DateTime<Utc>) -> Option<Scrape> {
        let all = futures::future::join_all(self.targets.iter().map(|t| self.fetch(t))).await;
        let answered: Vec<ServingStats> = all.into_iter().flatten().collect();
        let sample = aggregate(&answered, at)?;
        Some(Scrape { sample, answered: answered.len() })
    }
}

/// Worst latency and peak, mean queue depth and resource use.
pub fn aggregate(stats: &[ServingStats], at: DateTime<Utc>) -> Option<MetricsSample> {
    if stats.is_empty() { return None; }
    let n = stats.len() as f64;
    let mean_of = |f: fn(&ServingStats) -> Option<f64>| {
        let vals: Vec<f64> = stats.iter().filter_map(f).collect();
        (!vals.is_empty()).then(|| vals.iter().sum::<f64>() / vals.len() as f64)
    };
    Some(MetricsSample {
        at,
        p95_latency_ms: stats.iter().map(|s| s.p95_latency_ms).fold(0.0, f64::max),
        queue_depth_avg: stats.iter().map(|s| s.queue_depth as f64).sum::<f64>() / n,
        queue_depth_peak: stats.iter().map(|s| s.queue_peak.max(s.queue_depth) as f64).fold(0.0, f64::max),
        cpu_utilization: mean_of(|s| s.cpu_utilization),
        memory_utilization: mean_of(|s| s.memory_utilization),
    })
}
