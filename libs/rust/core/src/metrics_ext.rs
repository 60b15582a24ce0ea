//! Metric groups for the promotion engine and the autoscaler, registered on the
//! default prometheus registry the first time they are touched.

use once_cell::sync::Lazy;
use prometheus::{register_gauge, register_histogram, register_int_counter_vec, register_int_gauge, Gauge, Histogram, IntCounterVec, IntGauge};

pub struct PromotionMetrics {
    /// `result` = promoted | insufficient | invalid | store_error
    pub promotions_total: IntCounterVec,
    pub last_score: Gauge,
    pub registry_tag_failures: IntCounterVec,
}

pub struct AutoscaleMetrics {
    /// `action` = scale_out | scale_in | none
    pub decisions_total: IntCounterVec,
    pub desired_replicas: IntGauge,
    pub tick_seconds: Histogram,
}

pub struct ExtendedMetrics {
    pub promotion: PromotionMetrics,
    pub autoscale: AutoscaleMetrics,
}

pub static EXTENDED_METRICS: Lazy<ExtendedMetrics> = Lazy::new(|| {
    ExtendedMetrics {
        promotion: PromotionMetrics {
            promotions_total: register_int_counter_vec!("forecast_promotions_total", "Promotion attempts by result", &["result"]).expect("register forecast_promotions_total"),
            last_score: register_gauge!("forecast_promotion_score", "Composite score of the most recently promoted model").expect("register forecast_promotion_score"),
            registry_tag_failures: register_int_counter_vec!("forecast_promotion_tag_failures_total", "Registry tag writes that failed after promotion", &["tag"]).expect("register forecast_promotion_tag_failures_total"),
        },
        autoscale: AutoscaleMetrics {
            decisions_total: register_int_counter_vec!("forecast_autoscale_decisions_total", "Autoscaling decisions by action", &["action"]).expect("register forecast_autoscale_decisions_total"),
            desired_replicas: register_int_gauge!("forecast_autoscale_desired_replicas", "Replica count most recently decided").expect("register forecast_autoscale_desired_replicas"),
            tick_seconds: register_histogram!("forecast_autoscale_tick_seconds", "Time spent in one control tick including the scrape", vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0]).expect("register forecast_autoscale_tick_seconds"),
        },
    }
});
