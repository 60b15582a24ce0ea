//! The periodic control loop around [`AutoscaleController`].
//!
//! Each tick scrapes the serving tier, appends the sample to a bounded
//! history, reads the replica count back from the sink and asks the
//! controller for a decision. Writing the decision is spawned so a slow sink
//! never stalls the loop; while one write is still running, later decisions
//! are computed and logged but not applied.

use chrono::{DateTime, Utc};
use forecast_core::config::AutoscaleConfig;
use forecast_core::{AutoscaleController, MetricsSample, ObservedMetrics, ScalingAction, ScalingDecision, ScalingPolicy, ScalingState, EXTENDED_METRICS};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::actuator::ReplicaSink;
use crate::source::StatsSource;

#[derive(Debug, Clone)]
pub struct ControlSettings {
    pub poll_interval: Duration,
    pub action_timeout: Duration,
}

impl From<&AutoscaleConfig> for ControlSettings {
    fn from(c: &AutoscaleConfig) -> Self {
        Self { poll_interval: Duration::from_secs(c.poll_interval_secs.max(1)), action_timeout: Duration::from_secs(c.action_timeout_secs.max(1)) }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub decision: ScalingDecision,
    /// A sink write was started for this decision.
    pub actuated: bool,
    pub scraped: bool,
}

pub struct ControlLoop {
    controller: AutoscaleController,
    source: Arc<dyn StatsSource>,
    sink: Arc<dyn ReplicaSink>,
    settings: ControlSettings,
    history: VecDeque<MetricsSample>,
    keep_for: Duration,
    in_flight: Option<JoinHandle<()>>,
}

impl ControlLoop {
    /// Pick up cooldown timestamps from the sink's last state, if any.
    pub async fn resume(policy: ScalingPolicy, source: Arc<dyn StatsSource>, sink: Arc<dyn ReplicaSink>, settings: ControlSettings) -> Self {
        let keep_for = policy.scale_down_window.max(policy.scale_up_window) + policy.coverage_slack * 2;
        let controller = match sink.load().await {
            Ok(Some(state)) => {
                info!(desired = state.desired_replicas, "resuming from persisted scaling state");
                AutoscaleController::with_state(policy, state)
            }
            Ok(None) => AutoscaleController::new(policy),
            Err(e) => { warn!(error = %e, "scaling state unreadable, starting fresh"); AutoscaleController::new(policy) }
        };
        Self { controller, source, sink, settings, history: VecDeque::new(), keep_for, in_flight: None }
    }

    pub fn controller(&self) -> &AutoscaleController { &self.controller }
    pub fn history_len(&self) -> usize { self.history.len() }

    pub fn action_in_flight(&self) -> bool { self.in_flight.as_ref().map(|h| !h.is_finished()).unwrap_or(false) }

    /// Wait for the running sink write, if any.
    pub async fn settle(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            if let Err(e) = handle.await { warn!(error = %e, "scaling action task failed"); }
        }
    }

    #[instrument(skip(self))]
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        let started = Instant::now();
        let scrape = self.source.scrape(now).await;
        let answered = scrape.as_ref().map(|s| s.answered).unwrap_or(0);
        let scraped = scrape.is_some();
        match scrape {
            Some(s) => self.history.push_back(s.sample),
            None => warn!("no serving target answered; holding the last decision"),
        }
        self.prune(now);

        let persisted = match self.sink.load().await {
            Ok(state) => state,
            Err(e) => { warn!(error = %e, "replica state unreadable"); None }
        };
        let current = persisted.as_ref().map(|s| s.desired_replicas)
            .or_else(|| (answered > 0).then_some(answered as u32))
            .unwrap_or(self.controller.policy().min_replicas);

        let obs = ObservedMetrics { current_replicas: current, samples: self.history.iter().cloned().collect() };
        let decision = self.controller.tick(&obs, now);
        let m = &EXTENDED_METRICS.autoscale;
        let label = match decision.action { ScalingAction::ScaleOut(_) => "scale_out", ScalingAction::ScaleIn(_) => "scale_in", ScalingAction::NoAction => "none" };
        m.decisions_total.with_label_values(&[label]).inc();
        m.desired_replicas.set(decision.desired_replicas as i64);

        let unchanged = persisted.as_ref().map(|s| s.desired_replicas == decision.desired_replicas).unwrap_or(false);
        let actuated = if unchanged {
            false
        } else if self.action_in_flight() {
            info!(desired = decision.desired_replicas, "previous scaling action still running, not applying");
            false
        } else {
            self.actuate(&decision);
            true
        };
        m.tick_seconds.observe(started.elapsed().as_secs_f64());
        debug!(current, desired = decision.desired_replicas, reason = ?decision.reason, actuated, "tick");
        TickOutcome { decision, actuated, scraped }
    }

    fn actuate(&mut self, decision: &ScalingDecision) {
        let st = self.controller.state();
        let state = ScalingState {
            current_replicas: decision.current_replicas,
            desired_replicas: decision.desired_replicas,
            last_scale_up_time: st.last_scale_up_time,
            last_scale_down_time: st.last_scale_down_time,
        };
        info!(from = decision.current_replicas, to = decision.desired_replicas, reason = ?decision.reason, "applying scaling decision");
        let sink = self.sink.clone();
        let limit = self.settings.action_timeout;
        self.in_flight = Some(tokio::spawn(async move {
            match tokio::time::timeout(limit, sink.apply(&state)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "scaling state write failed"),
                Err(_) => warn!(after = ?limit, "scaling state write timed out"),
            }
        }));
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let keep_for = chrono::TimeDelta::from_std(self.keep_for).unwrap_or_else(|_| chrono::TimeDelta::days(365));
        while self.history.front().map(|s| now - s.at > keep_for).unwrap_or(false) { self.history.pop_front(); }
    }

    /// Tick forever. A tick that overruns the interval swallows the missed ones.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.tick(Utc::now()).await;
        }
    }
}
