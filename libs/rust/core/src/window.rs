//! Feature-window construction shared by training-side preparation and the
//! serving tier. Both sides must go through [`FeatureFrame::from_series`];
//! any drift in time-feature derivation or timezone handling silently skews
//! predictions.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeDelta, Timelike};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::f64::consts::PI;
use thiserror::Error;

use crate::error::ForecastError;

/// Cyclical encodings re-derived for every frame, in column order.
pub const TIME_FEATURES: [&str; 6] = ["min_of_day_sin", "min_of_day_cos", "day_of_week_sin", "day_of_week_cos", "day_of_year_sin", "day_of_year_cos"];

const MINUTES_PER_DAY: f64 = 1440.0;
const DAYS_PER_WEEK: f64 = 7.0;
const DAYS_PER_YEAR: f64 = 365.0;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum WindowError {
    #[error("unparseable timestamp {0:?}")]
    BadTimestamp(String),
    #[error("duplicate timestamp {0}")]
    DuplicateTimestamp(NaiveDateTime),
    #[error("column {column:?} has {got} values for {expected} timestamps")]
    RaggedColumn { column: String, expected: usize, got: usize },
    #[error("column {column:?} has a non-finite value at row {row}")]
    NonFinite { column: String, row: usize },
    #[error("series needs at least two rows to infer a step, got {0}")]
    TooFewRows(usize),
    #[error("timestamps are not evenly spaced (step {expected} vs {got} at row {row})")]
    NonUniformStep { expected: TimeDelta, got: TimeDelta, row: usize },
    #[error("window of {needed} rows requested from a series of {available}")]
    WindowTooLong { needed: usize, available: usize },
    #[error("series has no feature columns")]
    NoColumns,
    #[error("forecast step {0} falls outside the representable time range")]
    TimestampOverflow(usize),
}

impl From<WindowError> for ForecastError { fn from(e: WindowError) -> Self { ForecastError::InvalidRequest(e.to_string()) } }

/// Wire form of a time series: string timestamps plus named numeric columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub timestamps: Vec<String>,
    pub columns: BTreeMap<String, Vec<f64>>,
}

/// Parse a timestamp and drop its zone. Offsets are converted to UTC first,
/// naive inputs are taken as already UTC.
pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, WindowError> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) { return Ok(dt.naive_utc()); }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) { return Ok(dt); }
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%z") { return Ok(dt.naive_utc()); }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok().and_then(|d| d.and_hms_opt(0, 0, 0)).ok_or_else(|| WindowError::BadTimestamp(raw.to_string()))
}

pub fn time_features(ts: &NaiveDateTime) -> [f64; 6] {
    let minute = (ts.hour() * 60 + ts.minute()) as f64;
    let dow = ts.weekday().num_days_from_monday() as f64;
    let doy = ts.ordinal0() as f64;
    let enc = |x: f64, period: f64| { let a = 2.0 * PI * x / period; (a.sin(), a.cos()) };
    let (m_s, m_c) = enc(minute, MINUTES_PER_DAY);
    let (w_s, w_c) = enc(dow, DAYS_PER_WEEK);
    let (y_s, y_c) = enc(doy, DAYS_PER_YEAR);
    [m_s, m_c, w_s, w_c, y_s, y_c]
}

/// Normalised, sorted, evenly spaced frame with time features appended.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureFrame {
    pub index: Vec<NaiveDateTime>,
    pub names: Vec<String>,
    /// Column-major, aligned with `names`.
    pub columns: Vec<Vec<f64>>,
    pub step: TimeDelta,
}

impl FeatureFrame {
    pub fn from_series(series: &Series) -> Result<Self, WindowError> {
        let n = series.timestamps.len();
        let base: Vec<(&String, &Vec<f64>)> = series.columns.iter().filter(|(k, _)| !TIME_FEATURES.contains(&k.as_str())).collect();
        if base.is_empty() { return Err(WindowError::NoColumns); }
        for (name, col) in &base {
            if col.len() != n { return Err(WindowError::RaggedColumn { column: (*name).clone(), expected: n, got: col.len() }); }
            if let Some(row) = col.iter().position(|v| !v.is_finite()) { return Err(WindowError::NonFinite { column: (*name).clone(), row }); }
        }
        let parsed = series.timestamps.iter().map(|t| parse_timestamp(t)).collect::<Result<Vec<_>, _>>()?;
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&i| parsed[i]);
        let index: Vec<NaiveDateTime> = order.iter().map(|&i| parsed[i]).collect();
        if let Some(w) = index.windows(2).find(|w| w[0] == w[1]) { return Err(WindowError::DuplicateTimestamp(w[0])); }
        let step = uniform_step(&index)?;

        let mut names: Vec<String> = base.iter().map(|(k, _)| (*k).clone()).collect();
        let mut columns: Vec<Vec<f64>> = base.iter().map(|(_, col)| order.iter().map(|&i| col[i]).collect()).collect();
        let derived: Vec<[f64; 6]> = index.iter().map(time_features).collect();
        for (j, name) in TIME_FEATURES.iter().enumerate() {
            names.push((*name).to_string());
            columns.push(derived.iter().map(|row| row[j]).collect());
        }
        Ok(Self { index, names, columns, step })
    }

    pub fn len(&self) -> usize { self.index.len() }
    pub fn is_empty(&self) -> bool { self.index.is_empty() }

    /// Clamp `start` so a `seq_len` window fits. Returns the start actually used.
    pub fn clamp_start(&self, start: usize, seq_len: usize) -> Result<usize, WindowError> {
        if seq_len == 0 || seq_len > self.len() { return Err(WindowError::WindowTooLong { needed: seq_len, available: self.len() }); }
        Ok(start.min(self.len() - seq_len))
    }

    pub fn window(&self, start: usize, seq_len: usize) -> Result<FeatureWindow, WindowError> {
        if seq_len == 0 || start.checked_add(seq_len).map_or(true, |end| end > self.len()) { return Err(WindowError::WindowTooLong { needed: start.saturating_add(seq_len), available: self.len() }); }
        let range = start..start + seq_len;
        Ok(FeatureWindow {
            timestamps: self.index[range.clone()].to_vec(),
            names: self.names.clone(),
            columns: self.columns.iter().map(|c| c[range.clone()].to_vec()).collect(),
            step: self.step,
        })
    }

    /// The most recent full window, used for prewarm.
    pub fn tail_window(&self, seq_len: usize) -> Result<FeatureWindow, WindowError> {
        let start = self.clamp_start(usize::MAX, seq_len)?;
        self.window(start, seq_len)
    }
}

fn uniform_step(index: &[NaiveDateTime]) -> Result<TimeDelta, WindowError> {
    if index.len() < 2 { return Err(WindowError::TooFewRows(index.len())); }
    let step = index[1] - index[0];
    for (row, w) in index.windows(2).enumerate().skip(1) {
        let got = w[1] - w[0];
        if got != step { return Err(WindowError::NonUniformStep { expected: step, got, row: row + 1 }); }
    }
    Ok(step)
}

/// Exact model input for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureWindow {
    pub timestamps: Vec<NaiveDateTime>,
    pub names: Vec<String>,
    pub columns: Vec<Vec<f64>>,
    pub step: TimeDelta,
}

impl FeatureWindow {
    pub fn len(&self) -> usize { self.timestamps.len() }
    pub fn is_empty(&self) -> bool { self.timestamps.is_empty() }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.names.iter().position(|n| n == name).map(|i| self.columns[i].as_slice())
    }

    /// Content fingerprint over timestamps, feature names and raw value bits.
    pub fn fingerprint(&self) -> String {
        let mut h = Sha256::new();
        for ts in &self.timestamps { h.update(ts.and_utc().timestamp_micros().to_le_bytes()); }
        for (name, col) in self.names.iter().zip(&self.columns) {
            h.update(name.as_bytes());
            h.update([0u8]);
            for v in col { h.update(v.to_bits().to_le_bytes()); }
        }
        hex::encode(&h.finalize()[..16])
    }

    /// Timestamps of the `horizon` steps after the window.
    pub fn forecast_timestamps(&self, horizon: usize) -> Result<Vec<NaiveDateTime>, WindowError> {
        let Some(last) = self.timestamps.last().copied() else { return Ok(Vec::new()) };
        (1..=horizon).map(|k| {
            i32::try_from(k).ok()
                .and_then(|n| self.step.checked_mul(n))
                .and_then(|offset| last.checked_add_signed(offset))
                .ok_or(WindowError::TimestampOverflow(k))
        }).collect()
    }
}
