use async_trait::async_trait;
use autoscaler::{ControlLoop, ControlSettings, HttpStatsSource, ReplicaSink, Scrape, SinkError, StatsSource};
use axum::{routing::get, Json, Router};
use chrono::{DateTime, TimeDelta, Utc};
use forecast_core::{MetricsSample, ScalingAction, ScalingPolicy, ScalingReason, ScalingState, ServingStats};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

fn t0() -> DateTime<Utc> { DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z").unwrap().with_timezone(&Utc) }

fn hot(at: DateTime<Utc>) -> MetricsSample {
    MetricsSample { at, p95_latency_ms: 900.0, queue_depth_avg: 3.0, queue_depth_peak: 4.0, cpu_utilization: Some(0.4), memory_utilization: Some(0.4) }
}

/// Hands out pre-scripted scrapes, then reports that nobody answered.
#[derive(Default)]
struct ScriptedSource { script: Mutex<VecDeque<Option<Scrape>>> }

impl ScriptedSource {
    fn with(script: Vec<Option<Scrape>>) -> Arc<Self> { Arc::new(Self { script: Mutex::new(script.into()) }) }
}

#[async_trait]
impl StatsSource for ScriptedSource {
    async fn scrape(&self, at: DateTime<Utc>) -> Option<Scrape> {
        let next = self.script.lock().unwrap().pop_front().flatten()?;
        Some(Scrape { sample: MetricsSample { at, ..next.sample }, answered: next.answered })
    }
}

fn answered(n: usize, sample: MetricsSample) -> Option<Scrape> { Some(Scrape { sample, answered: n }) }

/// In-memory sink; `gate` holds every write until notified.
#[derive(Default)]
struct MemorySink { state: Mutex<Option<ScalingState>>, writes: Mutex<Vec<u32>>, gate: Option<Arc<Notify>> }

#[async_trait]
impl ReplicaSink for MemorySink {
    async fn load(&self) -> Result<Option<ScalingState>, SinkError> { Ok(self.state.lock().unwrap().clone()) }
    async fn apply(&self, state: &ScalingState) -> Result<(), SinkError> {
        if let Some(gate) = &self.gate { gate.notified().await; }
        self.writes.lock().unwrap().push(state.desired_replicas);
        *self.state.lock().unwrap() = Some(state.clone());
        Ok(())
    }
}

fn policy() -> ScalingPolicy { ScalingPolicy { coverage_slack: Duration::from_secs(15), ..ScalingPolicy::default() } }

fn settings() -> ControlSettings { ControlSettings { poll_interval: Duration::from_secs(15), action_timeout: Duration::from_secs(5) } }

#[tokio::test]
async fn sustained_latency_scales_out_and_persists() {
    let source = ScriptedSource::with((0..3).map(|_| answered(3, hot(t0()))).collect());
    let sink = Arc::new(MemorySink::default());
    let mut ctl = ControlLoop::resume(policy(), source, sink.clone(), settings()).await;

    let first = ctl.tick(t0()).await;
    assert_eq!(first.decision.action, ScalingAction::NoAction);
    assert_eq!(first.decision.current_replicas, 3, "no state yet, answering targets count");
    assert!(first.actuated, "initial state is written");
    ctl.settle().await;

    let second = ctl.tick(t0() + TimeDelta::seconds(15)).await;
    assert_eq!(second.decision.reason, ScalingReason::LatencySustained);
    assert_eq!(second.decision.desired_replicas, 5);
    assert!(second.actuated);
    ctl.settle().await;
    assert_eq!(*sink.writes.lock().unwrap(), vec![3, 5]);
    let persisted = sink.state.lock().unwrap().clone().unwrap();
    assert_eq!(persisted.current_replicas, 3);
    assert!(persisted.last_scale_up_time.is_some());

    let third = ctl.tick(t0() + TimeDelta::seconds(30)).await;
    assert_eq!(third.decision.current_replicas, 5);
    assert_eq!(third.decision.reason, ScalingReason::Cooldown);
    assert!(!third.actuated);
}

#[tokio::test]
async fn only_one_action_in_flight() {
    let gate = Arc::new(Notify::new());
    let sink = Arc::new(MemorySink { gate: Some(gate.clone()), ..MemorySink::default() });
    let mut queue_hot = hot(t0());
    queue_hot.queue_depth_peak = 80.0;
    let source = ScriptedSource::with(vec![answered(2, queue_hot.clone()), answered(2, queue_hot)]);
    let mut ctl = ControlLoop::resume(policy(), source, sink.clone(), settings()).await;

    let first = ctl.tick(t0()).await;
    assert_eq!(first.decision.reason, ScalingReason::QueueHardCap);
    assert!(first.actuated);
    assert!(ctl.action_in_flight());

    let second = ctl.tick(t0() + TimeDelta::seconds(15)).await;
    assert!(!second.actuated);
    assert!(sink.writes.lock().unwrap().is_empty());

    gate.notify_one();
    ctl.settle().await;
    assert_eq!(*sink.writes.lock().unwrap(), vec![first.decision.desired_replicas]);
}

#[tokio::test]
async fn silent_targets_hold_the_persisted_count() {
    let sink = Arc::new(MemorySink::default());
    *sink.state.lock().unwrap() = Some(ScalingState { current_replicas: 4, desired_replicas: 4, ..ScalingState::default() });
    let mut ctl = ControlLoop::resume(policy(), ScriptedSource::with(vec![None, None]), sink.clone(), settings()).await;
    for i in 0..2 {
        let out = ctl.tick(t0() + TimeDelta::seconds(15 * i)).await;
        assert!(!out.scraped);
        assert_eq!(out.decision.reason, ScalingReason::StaleMetrics);
        assert_eq!(out.decision.desired_replicas, 4);
        assert!(!out.actuated);
    }
    assert!(sink.writes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn resumed_cooldown_blocks_immediate_rescale() {
    let sink = Arc::new(MemorySink::default());
    *sink.state.lock().unwrap() = Some(ScalingState { current_replicas: 2, desired_replicas: 4, last_scale_up_time: Some(t0() - TimeDelta::seconds(5)), last_scale_down_time: None });
    let mut spike = hot(t0());
    spike.queue_depth_peak = 80.0;
    let mut ctl = ControlLoop::resume(policy(), ScriptedSource::with(vec![answered(4, spike)]), sink, settings()).await;
    let out = ctl.tick(t0()).await;
    assert_eq!(out.decision.reason, ScalingReason::Cooldown);
    assert_eq!(out.decision.desired_replicas, 4);
}

#[tokio::test]
async fn history_is_bounded() {
    let script = (0..100).map(|_| answered(1, hot(t0()))).collect();
    let mut ctl = ControlLoop::resume(policy(), ScriptedSource::with(script), Arc::new(MemorySink::default()), settings()).await;
    for i in 0..100 { ctl.tick(t0() + TimeDelta::seconds(15 * i)).await; ctl.settle().await; }
    // scale-down window plus two polls of slack, one sample per poll
    assert!(ctl.history_len() <= 300 / 15 + 3);
}

async fn stats_server(stats: ServingStats) -> String {
    let app = Router::new().route("/stats", get(move || { let s = stats.clone(); async move { Json(s) } }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{addr}")
}

#[tokio::test]
async fn http_source_skips_targets_that_do_not_answer() {
    let a = stats_server(ServingStats { p95_latency_ms: 250.0, queue_depth: 6, queue_peak: 12, ..ServingStats::default() }).await;
    let b = stats_server(ServingStats { p95_latency_ms: 700.0, queue_depth: 2, queue_peak: 3, cpu_utilization: Some(0.6), ..ServingStats::default() }).await;
    let dead = "http://127.0.0.1:9".to_string();
    let source = HttpStatsSource::new(&[a, b.clone(), dead.clone()], Duration::from_secs(2)).unwrap();

    let scrape = source.scrape(t0()).await.unwrap();
    assert_eq!(scrape.answered, 2);
    assert_eq!(scrape.sample.p95_latency_ms, 700.0);
    assert_eq!(scrape.sample.queue_depth_avg, 4.0);
    assert_eq!(scrape.sample.queue_depth_peak, 12.0);
    assert_eq!(scrape.sample.cpu_utilization, Some(0.6));
    assert_eq!(scrape.sample.at, t0());

    let nobody = HttpStatsSource::new(&[dead], Duration::from_millis(500)).unwrap();
    assert!(nobody.scrape(t0()).await.is_none());
}
