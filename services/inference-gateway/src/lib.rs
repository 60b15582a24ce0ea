//! Inference serving tier: admission control, worker pool, prediction cache,
//! microbatching and promotion-driven model reloads behind an HTTP surface.

pub mod admission;
pub mod batcher;
pub mod cache;
pub mod engine;
pub mod http;
pub mod inference_log;
pub mod model;
pub mod runner;
pub mod telemetry;
pub mod watcher;

pub use admission::{AdmissionGate, GateLimits, Permit};
pub use cache::{PredictionCache, PredictionKey};
pub use engine::{resolve_window, EngineSettings, ForecastPoint, InferenceEngine, PredictRequest, Prediction};
pub use model::{LoadedModel, ModelSlot, ModelState};
pub use runner::{select_runner, BatchRunner, ServiceRunner};
pub use watcher::{PromotionWatcher, ReloadReport, ReloadStatus, WatcherSettings};
