//! Bounded admission with pause/resume hysteresis.
//!
//! Occupancy counts every request from admission until its worker finishes
//! with it. Once occupancy rises above the pause mark the gate turns new
//! requests away until it falls below the resume mark again. The gate also
//! remembers the highest occupancy seen over a trailing window, so several
//! readers of the peak all see the same figure.

use forecast_core::config::QueueConfig;
use forecast_core::ForecastError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::telemetry::GATEWAY_METRICS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateLimits { pub capacity: usize, pub pause_at: usize, pub resume_below: usize }

impl From<&QueueConfig> for GateLimits {
    fn from(q: &QueueConfig) -> Self { Self { capacity: q.capacity, pause_at: q.pause_at(), resume_below: q.resume_below() } }
}

const DEFAULT_PEAK_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct GateState {
    occupancy: usize,
    paused: bool,
    /// Occupancy marks with strictly decreasing values; the front is the window max.
    marks: VecDeque<(Instant, usize)>,
}

impl GateState {
    fn mark(&mut self, at: Instant, span: Duration) {
        while self.marks.back().map(|(_, v)| *v <= self.occupancy).unwrap_or(false) { self.marks.pop_back(); }
        self.marks.push_back((at, self.occupancy));
        self.expire(at, span);
    }

    fn expire(&mut self, now: Instant, span: Duration) {
        while self.marks.front().map(|(t, _)| now.saturating_duration_since(*t) > span).unwrap_or(false) { self.marks.pop_front(); }
    }

    fn peak(&mut self, now: Instant, span: Duration) -> usize {
        self.expire(now, span);
        self.marks.front().map(|(_, v)| *v).unwrap_or(0).max(self.occupancy)
    }
}

struct GateInner { limits: GateLimits, peak_window: Duration, state: Mutex<GateState> }

#[derive(Clone)]
pub struct AdmissionGate { inner: Arc<GateInner> }

/// Held for as long as a request occupies the queue. Dropping it releases the slot.
pub struct Permit { inner: Arc<GateInner> }

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateStats { pub occupancy: usize, pub paused: bool, pub peak: usize, pub capacity: usize }

impl AdmissionGate {
    pub fn new(limits: GateLimits) -> Self { Self::with_peak_window(limits, DEFAULT_PEAK_WINDOW) }

    pub fn with_peak_window(limits: GateLimits, peak_window: Duration) -> Self {
        Self { inner: Arc::new(GateInner { limits, peak_window, state: Mutex::new(GateState::default()) }) }
    }

    pub fn limits(&self) -> GateLimits { self.inner.limits }

    pub fn try_admit(&self) -> Result<Permit, ForecastError> {
        let limits = self.inner.limits;
        let mut st = self.inner.state.lock();
        if st.paused {
            if st.occupancy >= limits.resume_below {
                return Err(ForecastError::RequestOverloaded { occupancy: st.occupancy, capacity: limits.capacity });
            }
            st.paused = false;
            info!(occupancy = st.occupancy, "admission resumed");
        }
        if st.occupancy >= limits.capacity {
            return Err(ForecastError::RequestOverloaded { occupancy: st.occupancy, capacity: limits.capacity });
        }
        st.occupancy += 1;
        st.mark(Instant::now(), self.inner.peak_window);
        if st.occupancy > limits.pause_at {
            st.paused = true;
            info!(occupancy = st.occupancy, pause_at = limits.pause_at, "admission paused");
        }
        GATEWAY_METRICS.queue_depth.set(st.occupancy as i64);
        Ok(Permit { inner: self.inner.clone() })
    }

    pub fn occupancy(&self) -> usize { self.inner.state.lock().occupancy }

    pub fn is_paused(&self) -> bool { self.inner.state.lock().paused }

    pub fn stats(&self) -> GateStats { self.stats_at(Instant::now()) }

    /// Reading the peak does not reset it.
    pub fn stats_at(&self, now: Instant) -> GateStats {
        let mut st = self.inner.state.lock();
        let peak = st.peak(now, self.inner.peak_window);
        GateStats { occupancy: st.occupancy, paused: st.paused, peak, capacity: self.inner.limits.capacity }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let limits = self.inner.limits;
        let mut st = self.inner.state.lock();
        st.occupancy = st.occupancy.saturating_sub(1);
        if st.paused && st.occupancy < limits.resume_below {
            st.paused = false;
            debug!(occupancy = st.occupancy, "admission resumed on drain");
        }
        GATEWAY_METRICS.queue_depth.set(st.occupancy as i64);
    }
}
