//! SLO-driven replica controller for the serving tier.
//!
//! Latency and queue depth are the primary triggers, CPU/memory a guard rail.
//! Scale-up reacts within a short stabilization window with a proportional
//! step; scale-down needs a long calm window and steps down slowly. Every
//! decision is computed from the observation passed in, so a restarted
//! controller arrives at the same answer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::AutoscaleConfig;

/// One scrape of the serving tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    pub at: DateTime<Utc>,
    pub p95_latency_ms: f64,
    pub queue_depth_avg: f64,
    pub queue_depth_peak: f64,
    pub cpu_utilization: Option<f64>,    // 0.0 - 1.0
    pub memory_utilization: Option<f64>, // 0.0 - 1.0
}

/// `GET /stats` body of one serving instance; the control loop scrapes and
/// aggregates these into a [`MetricsSample`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServingStats {
    pub p95_latency_ms: f64,
    pub queue_depth: usize,
    pub queue_peak: usize,
    pub queue_capacity: usize,
    pub paused: bool,
    pub model_state: String,
    pub model_ready: bool,
    pub run_id: Option<String>,
    pub model_variant: Option<String>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub requests_in_window: usize,
    pub cpu_utilization: Option<f64>,
    pub memory_utilization: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedMetrics {
    pub current_replicas: u32,
    /// Recent samples, any order.
    pub samples: Vec<MetricsSample>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingReason {
    QueueHardCap,
    LatencyHard,
    LatencySustained,
    ResourcePressure,
    SustainedCalm,
    Cooldown,
    OutOfBounds,
    AtBound,
    StaleMetrics,
    Steady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScalingAction { ScaleOut(u32), ScaleIn(u32), NoAction }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingDecision {
    pub current_replicas: u32,
    pub desired_replicas: u32,
    pub action: ScalingAction,
    pub reason: ScalingReason,
}

/// Read by the deployment platform; written only by the controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScalingState {
    pub current_replicas: u32,
    pub desired_replicas: u32,
    pub last_scale_up_time: Option<DateTime<Utc>>,
    pub last_scale_down_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ScalingPolicy {
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub latency_activation_ms: f64,
    pub latency_hard_ms: f64,
    pub queue_hard_cap: f64,
    pub queue_low_water: f64,
    pub cpu_high: f64,
    pub memory_high: f64,
    pub cpu_low: f64,
    pub scale_up_window: Duration,
    pub queue_window: Duration,
    pub scale_down_window: Duration,
    pub scale_up_percent: f64,
    pub scale_up_pods: u32,
    pub scale_down_pods: u32,
    pub scale_down_latency_ratio: f64,
    pub stale_after: Duration,
    /// Slack when checking that samples cover a window; one poll interval.
    pub coverage_slack: Duration,
}

impl Default for ScalingPolicy { fn default() -> Self { Self::from(&AutoscaleConfig::default()) } }

impl From<&AutoscaleConfig> for ScalingPolicy {
    fn from(c: &AutoscaleConfig) -> Self {
        Self {
            min_replicas: c.min_replicas,
            max_replicas: c.max_replicas.max(c.min_replicas),
            latency_activation_ms: c.latency_activation_ms,
            latency_hard_ms: c.latency_hard_ms,
            queue_hard_cap: c.queue_hard_cap,
            queue_low_water: c.queue_low_water,
            cpu_high: c.cpu_high,
            memory_high: c.memory_high,
            cpu_low: c.cpu_low,
            scale_up_window: Duration::from_secs(c.scale_up_window_secs),
            queue_window: Duration::from_secs(c.queue_window_secs),
            scale_down_window: Duration::from_secs(c.scale_down_window_secs),
            scale_up_percent: c.scale_up_percent,
            scale_up_pods: c.scale_up_pods,
            scale_down_pods: c.scale_down_pods,
            scale_down_latency_ratio: c.scale_down_latency_ratio,
            stale_after: Duration::from_secs(c.stale_after_secs),
            coverage_slack: Duration::from_secs(c.poll_interval_secs),
        }
    }
}

impl ScalingPolicy {
    pub fn clamp(&self, n: u32) -> u32 { n.clamp(self.min_replicas, self.max_replicas) }

    /// Largest of the proportional and the fixed increment.
    pub fn scale_up_step(&self, current: u32) -> u32 {
        let pct = (current as f64 * self.scale_up_percent).ceil() as u32;
        pct.max(self.scale_up_pods).max(1)
    }
}

pub struct AutoscaleController {
    policy: ScalingPolicy,
    state: ScalingState,
}

impl AutoscaleController {
    pub fn new(policy: ScalingPolicy) -> Self { Self { policy, state: ScalingState::default() } }

    /// Resume from persisted state; timestamps only gate cooldowns.
    pub fn with_state(policy: ScalingPolicy, state: ScalingState) -> Self { Self { policy, state } }

    pub fn policy(&self) -> &ScalingPolicy { &self.policy }
    pub fn state(&self) -> &ScalingState { &self.state }

    pub fn tick(&mut self, obs: &ObservedMetrics, now: DateTime<Utc>) -> ScalingDecision {
        let p = self.policy.clone();
        let current = obs.current_replicas;
        self.state.current_replicas = current;

        if current < p.min_replicas || current > p.max_replicas {
            return self.commit(current, p.clamp(current), ScalingReason::OutOfBounds, now);
        }

        let horizon = p.scale_down_window.max(p.scale_up_window) + p.coverage_slack;
        let mut recent: Vec<&MetricsSample> = obs.samples.iter().filter(|s| s.at <= now && within(now, s.at, horizon)).collect();
        recent.sort_by_key(|s| s.at);
        let fresh = recent.last().map(|s| within(now, s.at, p.stale_after)).unwrap_or(false);
        if !fresh {
            // fail-static: keep whatever was last decided
            let held = if self.state.desired_replicas == 0 { current } else { p.clamp(self.state.desired_replicas) };
            return self.decision(current, held, ScalingReason::StaleMetrics);
        }
        let latest = recent[recent.len() - 1];

        if let Some(reason) = self.scale_up_reason(&recent, latest, now) {
            let cooling = match reason {
                // queue buildup may add capacity once per queue window, and never twice in one poll
                ScalingReason::QueueHardCap => recently(self.state.last_scale_up_time, p.queue_window.max(p.coverage_slack), now),
                _ => self.cooling_down(self.state.last_scale_up_time, p.scale_up_window, now),
            };
            if cooling {
                let held = p.clamp(self.state.desired_replicas.max(current));
                return self.decision(current, held, ScalingReason::Cooldown);
            }
            let desired = p.clamp(current.saturating_add(p.scale_up_step(current)));
            if desired == current { return self.decision(current, current, ScalingReason::AtBound); }
            return self.commit(current, desired, reason, now);
        }

        if sustained(&recent, now, p.scale_down_window, p.coverage_slack, |s| self.calm(s)) {
            if self.cooling_down(self.state.last_scale_up_time, p.scale_down_window, now)
                || self.cooling_down(self.state.last_scale_down_time, p.scale_down_window, now) {
                let held = p.clamp(self.state.desired_replicas.min(current).max(p.min_replicas));
                return self.decision(current, held, ScalingReason::Cooldown);
            }
            let desired = p.clamp(current.saturating_sub(p.scale_down_pods));
            if desired == current { return self.decision(current, current, ScalingReason::AtBound); }
            return self.commit(current, desired, ScalingReason::SustainedCalm, now);
        }

        self.decision(current, current, ScalingReason::Steady)
    }

    fn scale_up_reason(&self, recent: &[&MetricsSample], latest: &MetricsSample, now: DateTime<Utc>) -> Option<ScalingReason> {
        let p = &self.policy;
        let queue_hot = |s: &MetricsSample| s.queue_depth_peak >= p.queue_hard_cap;
        if queue_hot(latest) && (p.queue_window.is_zero() || sustained(recent, now, p.queue_window, p.coverage_slack, queue_hot)) {
            return Some(ScalingReason::QueueHardCap);
        }
        if latest.p95_latency_ms >= p.latency_hard_ms { return Some(ScalingReason::LatencyHard); }
        if sustained(recent, now, p.scale_up_window, p.coverage_slack, |s| s.p95_latency_ms > p.latency_activation_ms) {
            return Some(ScalingReason::LatencySustained);
        }
        let cpu_hot = latest.cpu_utilization.map(|c| c > p.cpu_high).unwrap_or(false);
        let mem_hot = latest.memory_utilization.map(|m| m > p.memory_high).unwrap_or(false);
        if cpu_hot || mem_hot { return Some(ScalingReason::ResourcePressure); }
        None
    }

    fn calm(&self, s: &MetricsSample) -> bool {
        let p = &self.policy;
        s.p95_latency_ms < p.latency_activation_ms * p.scale_down_latency_ratio
            && s.queue_depth_avg <= p.queue_low_water
            && s.cpu_utilization.map(|c| c < p.cpu_low).unwrap_or(true)
            && s.memory_utilization.map(|m| m < p.memory_high).unwrap_or(true)
    }

    fn cooling_down(&self, last: Option<DateTime<Utc>>, window: Duration, now: DateTime<Utc>) -> bool {
        last.map(|t| t <= now && within(now, t, window)).unwrap_or(false)
    }

    fn commit(&mut self, current: u32, desired: u32, reason: ScalingReason, now: DateTime<Utc>) -> ScalingDecision {
        if desired > current { self.state.last_scale_up_time = Some(now); }
        if desired < current { self.state.last_scale_down_time = Some(now); }
        self.decision(current, desired, reason)
    }

    fn decision(&mut self, current: u32, desired: u32, reason: ScalingReason) -> ScalingDecision {
        self.state.desired_replicas = desired;
        let action = match desired.cmp(&current) {
            std::cmp::Ordering::Greater => ScalingAction::ScaleOut(desired - current),
            std::cmp::Ordering::Less => ScalingAction::ScaleIn(current - desired),
            std::cmp::Ordering::Equal => ScalingAction::NoAction,
        };
        ScalingDecision { current_replicas: current, desired_replicas: desired, action, reason }
    }
}

/// Strictly younger than `window`.
fn recently(last: Option<DateTime<Utc>>, window: Duration, now: DateTime<Utc>) -> bool {
    last.map(|t| t <= now && (now - t).to_std().map(|age| age < window).unwrap_or(false)).unwrap_or(false)
}

fn within(now: DateTime<Utc>, at: DateTime<Utc>, window: Duration) -> bool {
    (now - at).to_std().map(|age| age <= window).unwrap_or(true)
}

/// True when samples span `window` (up to `slack`) and every one of them holds.
fn sustained(recent: &[&MetricsSample], now: DateTime<Utc>, window: Duration, slack: Duration, pred: impl Fn(&MetricsSample) -> bool) -> bool {
    let in_window: Vec<&&MetricsSample> = recent.iter().filter(|s| within(now, s.at, window)).collect();
    let Some(oldest) = in_window.first() else { return false };
    let covered = (now - oldest.at).to_std().map(|span| span + slack >= window).unwrap_or(false);
    covered && in_window.iter().all(|s| pred(**s))
}
