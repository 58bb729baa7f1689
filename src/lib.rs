//! Meter consumption dataset preparation.
//!
//! Current implemented scope:
//! - job configuration from trigger payloads and the process environment
//! - warehouse sampling and hourly aggregation over SQLite
//! - windowed training/testing record construction with optional weather covariates
//! - newline-delimited JSON output to object storage

mod config;
mod dataset;
mod ingest;
mod observability;
mod pipeline;
mod series;
mod storage;
#[cfg(test)]
mod test_env;
mod warehouse;

pub use config::{
    pipeline_config_from_env, resolve_job, ConfigError, JobConfig, JobRequest, PipelineConfig,
    ResolvedJob, DEFAULT_OUTPUT_PREFIX, DEFAULT_WAREHOUSE_PATH,
};
pub use dataset::{
    build_datasets, build_testing_records, build_training_records, compute_windows,
    decode_json_lines, encode_json_lines, format_start, DatasetError, DatasetWindows,
    MeterSeries, PreparedDatasets, SeriesRecord, NUM_TEST_WINDOWS,
};
pub use ingest::{IngestError, LoadReport, WarehouseLoader};
pub use observability::{
    init_logging, log_app_start, log_job_resolved, log_sink_selected, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use pipeline::{
    object_key, prepare_training_data, FailureKind, PrepareError, PrepareReport, WrittenObject,
    INITIAL_PASS_KEY, TESTING_KEY, TRAINING_KEY,
};
pub use series::{
    floor_to_hour, resample_hourly_sum, Covariates, HourlySeries, WeatherObservation,
    WeatherSeries, WEATHER_VARIABLES,
};
pub use storage::{
    sha256_hex, HttpObjectStore, HttpStoreConfig, InMemoryObjectStore, LocalObjectStore,
    ObjectSink, StorageError,
};
pub use warehouse::{
    format_stored_timestamp, format_timestamp, quote_identifier, ConsumptionRow, SqliteWarehouse,
    Warehouse, WarehouseConfig, WarehouseError, STORED_TIMESTAMP_FORMAT, TIMESTAMP_FORMAT,
};
