//! Hourly series primitives: bucket resampling, label-inclusive slicing and weather
//! covariate windows.

use chrono::{Duration as ChronoDuration, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::dataset::DatasetError;

pub const WEATHER_VARIABLES: [&str; 3] = ["temperature", "humidity", "apparenttemperature"];

/// Contiguous hourly sequence; `values[i]` is the bucket starting at `start + i hours`.
#[derive(Debug, Clone, PartialEq)]
pub struct HourlySeries {
    pub start: NaiveDateTime,
    pub values: Vec<f64>,
}

impl HourlySeries {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Last bucket label, if any.
    pub fn end(&self) -> Option<NaiveDateTime> {
        let last = self.values.len().checked_sub(1)?;
        Some(self.start + ChronoDuration::hours(last as i64))
    }

    /// Values for buckets `from..=to`. Both labels must be on the grid and inside the series.
    pub fn slice_inclusive(
        &self,
        from: NaiveDateTime,
        to: NaiveDateTime,
    ) -> Result<&[f64], DatasetError> {
        if to < from {
            return Err(DatasetError::EmptyWindow { start: from, end: to });
        }
        let out_of_range = || DatasetError::WindowOutOfRange {
            start: from,
            end: to,
            series_start: self.start,
            series_len: self.values.len(),
        };

        let first = hour_offset(self.start, from).ok_or_else(out_of_range)?;
        let last = hour_offset(self.start, to).ok_or_else(out_of_range)?;
        if last >= self.values.len() {
            return Err(out_of_range());
        }
        Ok(&self.values[first..=last])
    }
}

/// Sum `(timestamp, value)` pairs into hour buckets over `[start, end_exclusive)`.
///
/// Every bucket in range is present; buckets without rows hold `0.0`. Rows outside the
/// range are dropped.
pub fn resample_hourly_sum(
    rows: impl IntoIterator<Item = (NaiveDateTime, f64)>,
    start: NaiveDateTime,
    end_exclusive: NaiveDateTime,
) -> HourlySeries {
    let start = floor_to_hour(start);
    let bucket_count = if end_exclusive > start {
        ceil_hours(end_exclusive - start)
    } else {
        0
    };
    let mut values = vec![0.0; bucket_count];

    for (ts, value) in rows {
        if ts < start || ts >= end_exclusive {
            continue;
        }
        if let Some(idx) = hour_offset(start, floor_to_hour(ts)) {
            if let Some(slot) = values.get_mut(idx) {
                *slot += value;
            }
        }
    }

    HourlySeries { start, values }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeatherObservation {
    pub time: NaiveDateTime,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub apparent_temperature: Option<f64>,
}

/// Weather covariates for one record, ordered as `WEATHER_VARIABLES`.
pub type Covariates = [Vec<f64>; 3];

/// Raw weather observations indexed by time. Not resampled: covariate windows are cut
/// from whatever observations exist and must line up with the target exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherSeries {
    observations: Vec<WeatherObservation>,
}

impl WeatherSeries {
    pub fn new(mut observations: Vec<WeatherObservation>) -> Self {
        observations.sort_by_key(|obs| obs.time);
        Self { observations }
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Observations with `start <= time <= start + (hours - 1)h`, split per variable.
    pub fn covariates(&self, start: NaiveDateTime, hours: usize) -> Result<Covariates, DatasetError> {
        let mut out: Covariates = [
            Vec::with_capacity(hours),
            Vec::with_capacity(hours),
            Vec::with_capacity(hours),
        ];
        if hours == 0 {
            return Ok(out);
        }

        let last = start + ChronoDuration::hours(hours as i64 - 1);
        let lo = self.observations.partition_point(|obs| obs.time < start);
        let hi = self.observations.partition_point(|obs| obs.time <= last);
        let window = &self.observations[lo..hi];

        if window.len() != hours {
            return Err(DatasetError::CovariateLengthMismatch {
                start,
                expected: hours,
                actual: window.len(),
            });
        }

        for obs in window {
            let values = [obs.temperature, obs.humidity, obs.apparent_temperature];
            for (idx, value) in values.into_iter().enumerate() {
                let value = value.ok_or(DatasetError::MissingCovariate {
                    time: obs.time,
                    variable: WEATHER_VARIABLES[idx],
                })?;
                out[idx].push(value);
            }
        }

        Ok(out)
    }
}

pub fn floor_to_hour(ts: NaiveDateTime) -> NaiveDateTime {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

fn hour_offset(origin: NaiveDateTime, ts: NaiveDateTime) -> Option<usize> {
    let delta = ts - origin;
    if delta < ChronoDuration::zero() || delta.num_seconds() % 3_600 != 0 || delta.subsec_nanos() != 0
    {
        return None;
    }
    usize::try_from(delta.num_hours()).ok()
}

fn ceil_hours(delta: ChronoDuration) -> usize {
    let seconds = delta.num_seconds() + i64::from(delta.subsec_nanos() > 0);
    ((seconds + 3_599) / 3_600) as usize
}
