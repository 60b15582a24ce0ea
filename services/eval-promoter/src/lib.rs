//! Evaluation & promotion engine plus its batch and service runners.

pub mod engine;
pub mod http;
pub mod runner;

pub use engine::{rank_candidates, PromotionEngine, PromotionSettings, ScoreboardRow};
pub use forecast_core::Runner;
pub use runner::{select_runner, BatchRunner, ServiceRunner};
