//! Serving metrics: the prometheus families scraped on `/metrics` and the
//! rolling figures behind `/stats`.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use prometheus::{register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge, Histogram, IntCounter, IntCounterVec, IntGauge};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub struct GatewayMetrics {
    pub latency: Histogram,
    pub queue_wait: Histogram,
    pub queue_depth: IntGauge,
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    /// `outcome` = ok | cached | rejected | invalid | unavailable | timeout | error
    pub requests: IntCounterVec,
    pub rejected: IntCounter,
    pub batch_size: Histogram,
    pub model_ready: IntGauge,
    /// `result` = loaded | unchanged | failed
    pub model_loads: IntCounterVec,
}

pub static GATEWAY_METRICS: Lazy<GatewayMetrics> = Lazy::new(|| GatewayMetrics {
    latency: register_histogram!("forecast_inference_latency_seconds", "End-to-end predict latency", vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0]).expect("register forecast_inference_latency_seconds"),
    queue_wait: register_histogram!("forecast_inference_queue_wait_seconds", "Time between admission and a worker picking the request up", vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]).expect("register forecast_inference_queue_wait_seconds"),
    queue_depth: register_int_gauge!("forecast_inference_queue_depth", "Requests admitted and not yet answered").expect("register forecast_inference_queue_depth"),
    cache_hits: register_int_counter!("forecast_inference_cache_hits_total", "Predictions served from cache").expect("register forecast_inference_cache_hits_total"),
    cache_misses: register_int_counter!("forecast_inference_cache_misses_total", "Cache lookups that fell through to the model").expect("register forecast_inference_cache_misses_total"),
    requests: register_int_counter_vec!("forecast_inference_requests_total", "Predict requests by outcome", &["outcome"]).expect("register forecast_inference_requests_total"),
    rejected: register_int_counter!("forecast_inference_rejected_total", "Requests turned away by backpressure").expect("register forecast_inference_rejected_total"),
    batch_size: register_histogram!("forecast_inference_batch_size", "Inputs per model invocation", vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0]).expect("register forecast_inference_batch_size"),
    model_ready: register_int_gauge!("forecast_inference_model_ready", "1 while a model is loaded").expect("register forecast_inference_model_ready"),
    model_loads: register_int_counter_vec!("forecast_inference_model_loads_total", "Promotion poll outcomes", &["result"]).expect("register forecast_inference_model_loads_total"),
});

/// End-to-end latencies over a trailing time window.
pub struct LatencyWindow {
    span: Duration,
    samples: Mutex<VecDeque<(Instant, f64)>>,
}

impl LatencyWindow {
    pub fn new(span: Duration) -> Self { Self { span, samples: Mutex::new(VecDeque::new()) } }

    pub fn record(&self, latency: Duration) { self.record_at(Instant::now(), latency) }

    pub fn record_at(&self, at: Instant, latency: Duration) {
        let mut s = self.samples.lock();
        s.push_back((at, latency.as_secs_f64() * 1000.0));
        Self::prune(&mut s, at, self.span);
    }

    fn prune(s: &mut VecDeque<(Instant, f64)>, now: Instant, span: Duration) {
        while let Some((t, _)) = s.front() {
            if now.saturating_duration_since(*t) > span { s.pop_front(); } else { break; }
        }
    }

    /// p95 in milliseconds and the number of samples it covers.
    pub fn p95_at(&self, now: Instant) -> (f64, usize) {
        let mut s = self.samples.lock();
        Self::prune(&mut s, now, self.span);
        if s.is_empty() { return (0.0, 0); }
        let mut v: Vec<f64> = s.iter().map(|(_, ms)| *ms).collect();
        v.sort_by(f64::total_cmp);
        let rank = ((v.len() as f64) * 0.95).ceil() as usize;
        (v[rank.clamp(1, v.len()) - 1], v.len())
    }

    pub fn p95(&self) -> (f64, usize) { self.p95_at(Instant::now()) }
}

/// CPU and memory utilisation of this process, where the platform reports them.
pub struct ResourceProbe {
    memory_limit: Option<u64>,
    last_cpu: Mutex<Option<(Instant, u64)>>,
}

#[cfg(target_os = "linux")]
const USER_HZ: f64 = 100.0;

impl ResourceProbe {
    pub fn new(memory_limit: Option<u64>) -> Self { Self { memory_limit, last_cpu: Mutex::new(None) } }

    /// `(cpu, memory)` as fractions. CPU needs two samples; the first call yields `None` for it.
    pub fn sample(&self) -> (Option<f64>, Option<f64>) { (self.cpu(), self.memory()) }

    #[cfg(target_os = "linux")]
    fn cpu(&self) -> Option<f64> {
        let ticks = proc_cpu_ticks()?;
        let now = Instant::now();
        let prev = self.last_cpu.lock().replace((now, ticks))?;
        let elapsed = now.saturating_duration_since(prev.0).as_secs_f64();
        if elapsed <= 0.0 { return None; }
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1) as f64;
        Some((ticks.saturating_sub(prev.1) as f64 / USER_HZ / elapsed / cpus).clamp(0.0, 1.0))
    }

    #[cfg(not(target_os = "linux"))]
    fn cpu(&self) -> Option<f64> { let _ = &self.last_cpu; None }

    #[cfg(target_os = "linux")]
    fn memory(&self) -> Option<f64> {
        let rss = proc_kib("/proc/self/status", "VmRSS:")? * 1024;
        let limit = match self.memory_limit { Some(l) if l > 0 => l, _ => proc_kib("/proc/meminfo", "MemTotal:")? * 1024 };
        Some((rss as f64 / limit as f64).clamp(0.0, 1.0))
    }

    #[cfg(not(target_os = "linux"))]
    fn memory(&self) -> Option<f64> { let _ = self.memory_limit; None }
}

#[cfg(target_os = "linux")]
fn proc_cpu_ticks() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // fields after the parenthesised command name start at field 3 (state)
    let rest = &stat[stat.rfind(')')? + 1..];
    let f: Vec<&str> = rest.split_whitespace().collect();
    Some(f.get(11)?.parse::<u64>().ok()? + f.get(12)?.parse::<u64>().ok()?)
}

#[cfg(target_os = "linux")]
fn proc_kib(path: &str, field: &str) -> Option<u64> {
    let text = std::fs::read_to_string(path).ok()?;
    text.lines().find(|l| l.starts_with(field))?.split_whitespace().nth(1)?.parse().ok()
}
