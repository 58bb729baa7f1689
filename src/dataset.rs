//! Training/testing record construction for the forecasting model.
//!
//! Windows are cut on the hourly grid:
//! - `start_dataset = data_start 00:00`
//! - `end_dataset = data_end 00:00 - 1h`
//! - `end_training = end_dataset - horizon_hours * NUM_TEST_WINDOWS`
//!
//! Training targets cover `[start_dataset, end_training]`, testing targets cover
//! `[start_dataset, end_dataset]`, both inclusive.

use chrono::{Duration as ChronoDuration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::JobConfig;
use crate::series::{HourlySeries, WeatherSeries};

pub const NUM_TEST_WINDOWS: u32 = 2;
const START_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetWindows {
    pub start_dataset: NaiveDateTime,
    pub end_dataset: NaiveDateTime,
    pub end_training: NaiveDateTime,
    pub forecast_horizon_hours: i64,
    pub num_test_windows: u32,
}

impl DatasetWindows {
    pub fn training_hours(&self) -> usize {
        inclusive_hours(self.start_dataset, self.end_training)
    }

    pub fn testing_hours(&self) -> usize {
        inclusive_hours(self.start_dataset, self.end_dataset)
    }

    /// `[start_dataset, end_dataset + 1h)`, the range every series must cover.
    pub fn data_range(&self) -> (NaiveDateTime, NaiveDateTime) {
        (self.start_dataset, self.end_dataset + ChronoDuration::hours(1))
    }
}

/// One JSON line of the output datasets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub start: String,
    pub target: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_feat: Option<Vec<Vec<f64>>>,
}

/// Consumption series for one sampled meter, in sample order.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterSeries {
    pub meter_id: String,
    pub series: HourlySeries,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedDatasets {
    pub windows: DatasetWindows,
    pub training: Vec<SeriesRecord>,
    pub testing: Vec<SeriesRecord>,
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error(
        "training window is empty: end_training {end_training} is before start_dataset {start_dataset}"
    )]
    TrainingWindowEmpty {
        start_dataset: NaiveDateTime,
        end_training: NaiveDateTime,
    },
    #[error(
        "forecast period of {forecast_period_days} days cannot be held out before {end_dataset}"
    )]
    HorizonOutOfRange {
        forecast_period_days: u32,
        end_dataset: NaiveDateTime,
    },
    #[error("window end {end} precedes window start {start}")]
    EmptyWindow {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
    #[error(
        "window [{start}, {end}] not covered by series starting {series_start} with {series_len} hours"
    )]
    WindowOutOfRange {
        start: NaiveDateTime,
        end: NaiveDateTime,
        series_start: NaiveDateTime,
        series_len: usize,
    },
    #[error("no entities were sampled from the warehouse")]
    NoEntities,
    #[error("no readings for meter {meter_id} in the requested range")]
    MissingEntityData { meter_id: String },
    #[error("weather covariates from {start}: expected {expected} hours, found {actual}")]
    CovariateLengthMismatch {
        start: NaiveDateTime,
        expected: usize,
        actual: usize,
    },
    #[error("weather observation at {time} has no {variable}")]
    MissingCovariate {
        time: NaiveDateTime,
        variable: &'static str,
    },
    #[error("record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("malformed record on line {line}: {source}")]
    Decode {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

pub fn compute_windows(job: &JobConfig) -> Result<DatasetWindows, DatasetError> {
    let forecast_horizon_hours = job.forecast_horizon_hours();
    let start_dataset = job.data_start.and_time(chrono::NaiveTime::MIN);
    let end_dataset = job.data_end.and_time(chrono::NaiveTime::MIN) - ChronoDuration::hours(1);
    let end_training = forecast_horizon_hours
        .checked_mul(i64::from(NUM_TEST_WINDOWS))
        .and_then(ChronoDuration::try_hours)
        .and_then(|held_out| end_dataset.checked_sub_signed(held_out))
        .ok_or(DatasetError::HorizonOutOfRange {
            forecast_period_days: job.forecast_period_days,
            end_dataset,
        })?;

    if end_training < start_dataset {
        return Err(DatasetError::TrainingWindowEmpty {
            start_dataset,
            end_training,
        });
    }

    Ok(DatasetWindows {
        start_dataset,
        end_dataset,
        end_training,
        forecast_horizon_hours,
        num_test_windows: NUM_TEST_WINDOWS,
    })
}

pub fn build_training_records(
    meters: &[MeterSeries],
    windows: &DatasetWindows,
    weather: Option<&WeatherSeries>,
) -> Result<Vec<SeriesRecord>, DatasetError> {
    meters
        .iter()
        .map(|meter| build_record(meter, windows.start_dataset, windows.end_training, weather))
        .collect()
}

/// One record per `(window, meter)` pair, window-major.
///
/// Every window uses the full `[start_dataset, end_dataset]` range, so the records of
/// one meter are identical across windows.
pub fn build_testing_records(
    meters: &[MeterSeries],
    windows: &DatasetWindows,
    weather: Option<&WeatherSeries>,
) -> Result<Vec<SeriesRecord>, DatasetError> {
    let per_window = meters
        .iter()
        .map(|meter| build_record(meter, windows.start_dataset, windows.end_dataset, weather))
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(per_window.len() * windows.num_test_windows as usize);
    for _window in 1..=windows.num_test_windows {
        out.extend(per_window.iter().cloned());
    }
    Ok(out)
}

pub fn build_datasets(
    job: &JobConfig,
    meters: &[MeterSeries],
    weather: Option<&WeatherSeries>,
) -> Result<PreparedDatasets, DatasetError> {
    let windows = compute_windows(job)?;
    if meters.is_empty() {
        return Err(DatasetError::NoEntities);
    }

    let training = build_training_records(meters, &windows, weather)?;
    let testing = build_testing_records(meters, &windows, weather)?;

    info!(
        component = "dataset",
        event = "dataset.build.finish",
        meters = meters.len(),
        start_dataset = %windows.start_dataset,
        end_training = %windows.end_training,
        end_dataset = %windows.end_dataset,
        training_records = training.len(),
        testing_records = testing.len(),
        with_weather = weather.is_some()
    );

    Ok(PreparedDatasets {
        windows,
        training,
        testing,
    })
}

/// Newline-delimited JSON, one record per line, each line terminated by `\n`.
pub fn encode_json_lines(records: &[SeriesRecord]) -> Result<Vec<u8>, DatasetError> {
    let mut buf = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buf, record)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

pub fn decode_json_lines(bytes: &[u8]) -> Result<Vec<SeriesRecord>, DatasetError> {
    let mut out = Vec::new();
    for (idx, line) in bytes.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let record = serde_json::from_slice(line).map_err(|source| DatasetError::Decode {
            line: idx + 1,
            source,
        })?;
        out.push(record);
    }
    Ok(out)
}

pub fn format_start(ts: NaiveDateTime) -> String {
    ts.format(START_FORMAT).to_string()
}

fn build_record(
    meter: &MeterSeries,
    start: NaiveDateTime,
    end: NaiveDateTime,
    weather: Option<&WeatherSeries>,
) -> Result<SeriesRecord, DatasetError> {
    if meter.series.is_empty() {
        return Err(DatasetError::MissingEntityData {
            meter_id: meter.meter_id.clone(),
        });
    }

    let target = meter.series.slice_inclusive(start, end)?.to_vec();
    let dynamic_feat = match weather {
        Some(weather) => Some(Vec::from(weather.covariates(start, target.len())?)),
        None => None,
    };

    Ok(SeriesRecord {
        start: format_start(start),
        target,
        dynamic_feat,
    })
}

fn inclusive_hours(start: NaiveDateTime, end: NaiveDateTime) -> usize {
    if end < start {
        0
    } else {
        (end - start).num_hours() as usize + 1
    }
}
