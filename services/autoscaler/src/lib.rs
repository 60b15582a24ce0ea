//! Replica controller for the serving tier: scrape, decide, write state.

pub mod actuator;
pub mod control;
pub mod source;

pub use actuator::{ReplicaSink, SinkError, StateFileSink};
pub use control::{ControlLoop, ControlSettings, TickOutcome};
pub use source::{aggregate, HttpStatsSource, Scrape, StatsSource};
