//! End-to-end training-data preparation: sample, fetch, window, serialize, upload.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::config::{ConfigError, ResolvedJob};
use crate::dataset::{build_datasets, encode_json_lines, DatasetError, MeterSeries};
use crate::series::{resample_hourly_sum, HourlySeries, WeatherSeries};
use crate::storage::{sha256_hex, ObjectSink, StorageError};
use crate::warehouse::{Warehouse, WarehouseError};

pub const TRAINING_KEY: &str = "train/training.json";
pub const TESTING_KEY: &str = "test/testing.json";
pub const INITIAL_PASS_KEY: &str = "initial_pass";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    InvalidConfig,
    QueryFailure,
    DataShapeMismatch,
    StorageWriteFailure,
}

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("warehouse query failed during {stage}: {source}")]
    Query {
        stage: &'static str,
        #[source]
        source: WarehouseError,
    },
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("failed to write s3://{bucket}/{key}: {source}")]
    Storage {
        bucket: String,
        key: String,
        #[source]
        source: StorageError,
    },
}

impl PrepareError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Config(_) => FailureKind::InvalidConfig,
            Self::Query { .. } => FailureKind::QueryFailure,
            Self::Dataset(DatasetError::Serialize(_)) | Self::Storage { .. } => {
                FailureKind::StorageWriteFailure
            }
            Self::Dataset(_) => FailureKind::DataShapeMismatch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrittenObject {
    pub bucket: String,
    pub key: String,
    pub bytes: usize,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareReport {
    pub meters_sampled: usize,
    pub training_records: usize,
    pub testing_records: usize,
    pub training_target_len: usize,
    pub testing_target_len: usize,
    pub objects: Vec<WrittenObject>,
}

/// Run one preparation job.
///
/// All datasets are built in memory before the first put, so any query or shape
/// failure leaves the sink untouched. `input_echo` is the raw job payload; when present
/// and echoing is enabled it is written to `<prefix>/initial_pass`.
pub fn prepare_training_data<W, S>(
    resolved: &ResolvedJob,
    warehouse: &W,
    sink: &S,
    input_echo: Option<&serde_json::Value>,
) -> Result<PrepareReport, PrepareError>
where
    W: Warehouse + ?Sized,
    S: ObjectSink + ?Sized,
{
    let result = run(resolved, warehouse, sink, input_echo);
    if let Err(err) = &result {
        error!(
            component = "pipeline",
            event = "pipeline.failed",
            kind = ?err.kind(),
            error = %err
        );
    }
    result
}

fn run<W, S>(
    resolved: &ResolvedJob,
    warehouse: &W,
    sink: &S,
    input_echo: Option<&serde_json::Value>,
) -> Result<PrepareReport, PrepareError>
where
    W: Warehouse + ?Sized,
    S: ObjectSink + ?Sized,
{
    let job = &resolved.job;
    job.validate()?;
    let windows = crate::dataset::compute_windows(job)?;
    let (range_start, range_end) = windows.data_range();

    info!(
        component = "pipeline",
        event = "pipeline.start",
        data_start = %job.data_start,
        data_end = %job.data_end,
        forecast_period_days = job.forecast_period_days,
        training_samples = job.training_samples,
        use_weather = job.use_weather,
        bucket = %resolved.bucket
    );

    let meter_ids = warehouse
        .sample_meter_ids(job.training_samples as usize)
        .map_err(|source| PrepareError::Query {
            stage: "sample_meters",
            source,
        })?;
    if meter_ids.is_empty() {
        return Err(DatasetError::NoEntities.into());
    }

    let rows = warehouse
        .hourly_consumption(&meter_ids, range_start, range_end)
        .map_err(|source| PrepareError::Query {
            stage: "hourly_consumption",
            source,
        })?;

    let mut per_meter: HashMap<String, Vec<(chrono::NaiveDateTime, f64)>> = HashMap::new();
    for row in rows {
        per_meter
            .entry(row.meter_id)
            .or_default()
            .push((row.hour, row.consumption));
    }

    let mut meters = Vec::with_capacity(meter_ids.len());
    for meter_id in &meter_ids {
        let readings = per_meter
            .remove(meter_id)
            .ok_or_else(|| DatasetError::MissingEntityData {
                meter_id: meter_id.clone(),
            })?;
        let series: HourlySeries = resample_hourly_sum(readings, range_start, range_end);
        meters.push(MeterSeries {
            meter_id: meter_id.clone(),
            series,
        });
    }

    let weather = if job.use_weather {
        let observations = warehouse
            .weather_between(range_start, range_end)
            .map_err(|source| PrepareError::Query {
                stage: "weather",
                source,
            })?;
        Some(WeatherSeries::new(observations))
    } else {
        None
    };

    let datasets = build_datasets(job, &meters, weather.as_ref())?;
    let training_body = encode_json_lines(&datasets.training)?;
    let testing_body = encode_json_lines(&datasets.testing)?;

    let mut uploads: Vec<(String, Vec<u8>)> = Vec::with_capacity(3);
    if resolved.echo_input {
        if let Some(echo) = input_echo {
            let body = serde_json::to_vec(echo).map_err(DatasetError::Serialize)?;
            uploads.push((object_key(&resolved.output_prefix, INITIAL_PASS_KEY), body));
        }
    }
    uploads.push((object_key(&resolved.output_prefix, TRAINING_KEY), training_body));
    uploads.push((object_key(&resolved.output_prefix, TESTING_KEY), testing_body));

    let mut objects = Vec::with_capacity(uploads.len());
    for (key, body) in uploads {
        sink.put_object(&resolved.bucket, &key, &body)
            .map_err(|source| PrepareError::Storage {
                bucket: resolved.bucket.clone(),
                key: key.clone(),
                source,
            })?;
        objects.push(WrittenObject {
            bucket: resolved.bucket.clone(),
            key,
            bytes: body.len(),
            sha256: sha256_hex(&body),
        });
    }

    let report = PrepareReport {
        meters_sampled: meters.len(),
        training_records: datasets.training.len(),
        testing_records: datasets.testing.len(),
        training_target_len: datasets.windows.training_hours(),
        testing_target_len: datasets.windows.testing_hours(),
        objects,
    };

    info!(
        component = "pipeline",
        event = "pipeline.finish",
        meters_sampled = report.meters_sampled,
        training_records = report.training_records,
        testing_records = report.testing_records,
        objects_written = report.objects.len()
    );

    Ok(report)
}

pub fn object_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_join_prefix_cleanly() {
        assert_eq!(object_key("meteranalytics", TRAINING_KEY), "meteranalytics/train/training.json");
        assert_eq!(object_key("/nested/prefix/", TESTING_KEY), "nested/prefix/test/testing.json");
        assert_eq!(object_key("", INITIAL_PASS_KEY), "initial_pass");
    }

    #[test]
    fn failure_kinds_map_coarsely() {
        let shape = PrepareError::from(DatasetError::NoEntities);
        assert_eq!(shape.kind(), FailureKind::DataShapeMismatch);

        let query = PrepareError::Query {
            stage: "sample_meters",
            source: WarehouseError::InvalidSchema("main".to_string()),
        };
        assert_eq!(query.kind(), FailureKind::QueryFailure);

        let storage = PrepareError::Storage {
            bucket: "b".to_string(),
            key: "k".to_string(),
            source: StorageError::InvalidKey("k".to_string()),
        };
        assert_eq!(storage.kind(), FailureKind::StorageWriteFailure);

        let config = PrepareError::from(ConfigError::InvalidJob("x".to_string()));
        assert_eq!(config.kind(), FailureKind::InvalidConfig);
    }
}
