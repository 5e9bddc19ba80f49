//! Occupancy forecast fetched once at bring-up.
//!
//! The forecast service predicts a `(lower, upper)` occupancy band for every
//! minute of a multi-day horizon. The table is immutable after construction;
//! lookups aggregate overlapping rows for the same minute.

use std::collections::BTreeMap;
use thiserror::Error;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, Duration, PrimitiveDateTime};

pub mod feedback;
pub mod mock;
pub mod remote;

const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] = format_description!(
    "[year]-[month]-[day] [hour]:[minute]:[second][optional [.[subsecond]]]"
);
const DATE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("forecast service unreachable: {0}")]
    Transport(String),
    #[error("forecast service returned http status {0}")]
    Http(u16),
    #[error("failed to decode forecast: {0}")]
    Decode(String),
    #[error("invalid forecast timestamp {value:?}: {message}")]
    Timestamp { value: String, message: String },
    #[error("forecast columns have mismatched lengths")]
    ColumnLength,
}

/// Predicted occupancy band for one minute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForecastRange {
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForecastPoint {
    pub timestamp: PrimitiveDateTime,
    pub prediction: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Source of forecast tables. Implementations make a single attempt per call;
/// retrying is the caller's job.
pub trait ForecastSource {
    fn fetch(&mut self, from_date: Date, horizon_days: u32) -> Result<ForecastTable, ForecastError>;
}

impl<S: ForecastSource + ?Sized> ForecastSource for Box<S> {
    fn fetch(&mut self, from_date: Date, horizon_days: u32) -> Result<ForecastTable, ForecastError> {
        (**self).fetch(from_date, horizon_days)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForecastTable {
    points: Vec<ForecastPoint>,
    index: BTreeMap<PrimitiveDateTime, ForecastRange>,
}

impl ForecastTable {
    pub fn new(points: Vec<ForecastPoint>) -> Self {
        let mut index: BTreeMap<PrimitiveDateTime, ForecastRange> = BTreeMap::new();
        for point in &points {
            index
                .entry(point.timestamp)
                .and_modify(|range| {
                    range.lower = range.lower.min(point.lower);
                    range.upper = range.upper.max(point.upper);
                })
                .or_insert(ForecastRange {
                    lower: point.lower,
                    upper: point.upper,
                });
        }
        Self { points, index }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a table from the parallel columns served by the forecast service.
    pub fn from_columns(
        timestamps: &[String],
        predictions: &[f64],
        lower: &[f64],
        upper: &[f64],
    ) -> Result<Self, ForecastError> {
        let len = timestamps.len();
        if predictions.len() != len || lower.len() != len || upper.len() != len {
            return Err(ForecastError::ColumnLength);
        }

        let mut points = Vec::with_capacity(len);
        for (index, raw) in timestamps.iter().enumerate() {
            points.push(ForecastPoint {
                timestamp: parse_timestamp(raw)?,
                prediction: predictions[index],
                lower: lower[index],
                upper: upper[index],
            });
        }
        Ok(Self::new(points))
    }

    pub fn points(&self) -> &[ForecastPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// First and last covered minute.
    pub fn horizon(&self) -> Option<(PrimitiveDateTime, PrimitiveDateTime)> {
        let first = self.index.keys().next()?;
        let last = self.index.keys().next_back()?;
        Some((*first, *last))
    }

    /// Aggregated range for the minute containing `timestamp`, if any row matches.
    pub fn lookup(&self, timestamp: PrimitiveDateTime) -> Option<ForecastRange> {
        self.index.get(&truncate_to_minute(timestamp)).copied()
    }
}

pub fn truncate_to_minute(timestamp: PrimitiveDateTime) -> PrimitiveDateTime {
    timestamp
        - Duration::seconds(i64::from(timestamp.second()))
        - Duration::nanoseconds(i64::from(timestamp.nanosecond()))
}

/// Parse `YYYY-MM-DD HH:MM:SS[.fff]`, also accepting a `T` date/time separator.
pub fn parse_timestamp(raw: &str) -> Result<PrimitiveDateTime, ForecastError> {
    let normalized = raw.trim().replacen('T', " ", 1);
    PrimitiveDateTime::parse(&normalized, TIMESTAMP_FORMAT).map_err(|err| {
        ForecastError::Timestamp {
            value: raw.to_string(),
            message: err.to_string(),
        }
    })
}

pub fn format_date(date: Date) -> Result<String, ForecastError> {
    date.format(DATE_FORMAT)
        .map_err(|err| ForecastError::Decode(format!("date format: {err}")))
}
