//! Job and pipeline configuration.
//!
//! A run is described by two inputs:
//! - the job payload (`JobRequest`): date range, horizon, sample count, optional overrides
//! - the process configuration (`PipelineConfig`): buckets, schema, weather flag, paths
//!
//! Both are resolved once into an immutable `JobConfig` before any query runs.

use std::env;
use std::path::PathBuf;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const DEFAULT_OUTPUT_PREFIX: &str = "meteranalytics";
pub const DEFAULT_WAREHOUSE_PATH: &str = "data/warehouse.sqlite";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConfig {
    pub data_start: NaiveDate,
    pub data_end: NaiveDate,
    pub forecast_period_days: u32,
    pub training_samples: u32,
    pub use_weather: bool,
}

impl JobConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_end <= self.data_start {
            return Err(ConfigError::InvalidJob(format!(
                "Data_end ({}) must be after Data_start ({})",
                self.data_end, self.data_start
            )));
        }
        if self.forecast_period_days == 0 {
            return Err(ConfigError::InvalidJob(
                "Forecast_period must be >= 1 day".to_string(),
            ));
        }
        if self.training_samples == 0 {
            return Err(ConfigError::InvalidJob(
                "Training_samples must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn forecast_horizon_hours(&self) -> i64 {
        i64::from(self.forecast_period_days) * 24
    }
}

/// Job payload as delivered by the trigger. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobRequest {
    #[serde(rename = "Data_start")]
    pub data_start: NaiveDate,
    #[serde(rename = "Data_end")]
    pub data_end: NaiveDate,
    #[serde(rename = "Forecast_period")]
    pub forecast_period: u32,
    #[serde(rename = "Training_samples")]
    pub training_samples: u32,
    #[serde(rename = "With_weather_data", default, deserialize_with = "de_opt_flag")]
    pub with_weather_data: Option<bool>,
    #[serde(rename = "Athena_bucket", default)]
    pub athena_bucket: Option<String>,
    #[serde(rename = "S3_bucket", default)]
    pub s3_bucket: Option<String>,
}

impl JobRequest {
    pub fn from_json(raw: &[u8]) -> Result<Self, ConfigError> {
        serde_json::from_slice(raw).map_err(ConfigError::Payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub athena_bucket: Option<String>,
    pub working_bucket: String,
    pub db_schema: String,
    pub with_weather_data: bool,
    pub warehouse_path: PathBuf,
    pub output_prefix: String,
    pub echo_input: bool,
}

impl PipelineConfig {
    pub fn new(working_bucket: impl Into<String>, db_schema: impl Into<String>) -> Self {
        Self {
            athena_bucket: None,
            working_bucket: working_bucket.into(),
            db_schema: db_schema.into(),
            with_weather_data: false,
            warehouse_path: PathBuf::from(DEFAULT_WAREHOUSE_PATH),
            output_prefix: DEFAULT_OUTPUT_PREFIX.to_string(),
            echo_input: true,
        }
    }
}

/// A job ready to run: validated parameters plus the bucket its outputs land in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedJob {
    pub job: JobConfig,
    pub bucket: String,
    pub output_prefix: String,
    pub echo_input: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),
    #[error("invalid value for {name}: '{value}'")]
    InvalidEnv { name: &'static str, value: String },
    #[error("invalid job payload: {0}")]
    Payload(#[source] serde_json::Error),
    #[error("invalid job: {0}")]
    InvalidJob(String),
}

pub fn pipeline_config_from_env() -> Result<PipelineConfig, ConfigError> {
    let working_bucket = required_env("Working_bucket")?;
    let db_schema = required_env("Db_schema")?;
    let mut config = PipelineConfig::new(working_bucket, db_schema);

    config.athena_bucket = optional_env("Athena_bucket");

    if let Some(raw) = optional_env("With_weather_data") {
        config.with_weather_data = parse_flag(&raw).ok_or(ConfigError::InvalidEnv {
            name: "With_weather_data",
            value: raw,
        })?;
    }

    if let Some(path) = optional_env("METERPREP_WAREHOUSE_PATH") {
        config.warehouse_path = PathBuf::from(path);
    }

    if let Some(prefix) = optional_env("METERPREP_OUTPUT_PREFIX") {
        config.output_prefix = prefix.trim_matches('/').to_string();
    }

    if let Some(raw) = optional_env("METERPREP_ECHO_INPUT") {
        config.echo_input = parse_flag(&raw).ok_or(ConfigError::InvalidEnv {
            name: "METERPREP_ECHO_INPUT",
            value: raw,
        })?;
    }

    Ok(config)
}

/// Merge payload and process configuration. Payload values win where both exist.
pub fn resolve_job(req: &JobRequest, pipeline: &PipelineConfig) -> Result<ResolvedJob, ConfigError> {
    let job = JobConfig {
        data_start: req.data_start,
        data_end: req.data_end,
        forecast_period_days: req.forecast_period,
        training_samples: req.training_samples,
        use_weather: req.with_weather_data.unwrap_or(pipeline.with_weather_data),
    };
    job.validate()?;

    let bucket = req
        .s3_bucket
        .as_deref()
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .unwrap_or(pipeline.working_bucket.trim())
        .to_string();
    if bucket.is_empty() {
        return Err(ConfigError::InvalidJob(
            "output bucket must not be empty".to_string(),
        ));
    }

    Ok(ResolvedJob {
        job,
        bucket,
        output_prefix: pipeline.output_prefix.clone(),
        echo_input: pipeline.echo_input,
    })
}

fn required_env(name: &'static str) -> Result<String, ConfigError> {
    optional_env(name).ok_or(ConfigError::MissingEnv(name))
}

pub(crate) fn optional_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFlag {
    Bool(bool),
    Int(i64),
    Text(String),
}

fn de_opt_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawFlag>::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(RawFlag::Bool(b)) => Ok(Some(b)),
        // The trigger sends 1 for "on"; anything else means off.
        Some(RawFlag::Int(i)) => Ok(Some(i == 1)),
        Some(RawFlag::Text(s)) => parse_flag(&s)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid flag value '{s}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_env::with_env_vars;

    const PIPELINE_VARS: [&str; 7] = [
        "Athena_bucket",
        "Working_bucket",
        "Db_schema",
        "With_weather_data",
        "METERPREP_WAREHOUSE_PATH",
        "METERPREP_OUTPUT_PREFIX",
        "METERPREP_ECHO_INPUT",
    ];

    fn cleared_with(overrides: &[(&'static str, &'static str)]) -> Vec<(&'static str, Option<&'static str>)> {
        PIPELINE_VARS
            .iter()
            .map(|name| {
                let value = overrides
                    .iter()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| *v);
                (*name, value)
            })
            .collect()
    }

    fn sample_request() -> JobRequest {
        JobRequest {
            data_start: NaiveDate::from_ymd_opt(2013, 6, 1).unwrap(),
            data_end: NaiveDate::from_ymd_opt(2014, 1, 1).unwrap(),
            forecast_period: 7,
            training_samples: 50,
            with_weather_data: None,
            athena_bucket: None,
            s3_bucket: None,
        }
    }

    #[test]
    fn parses_trigger_payload_and_ignores_unknown_fields() {
        let raw = br#"{
            "Athena_bucket": "aws-athena-query-results",
            "S3_bucket": "meter-data-bucket",
            "Data_start": "2013-06-01",
            "Data_end": "2014-01-01",
            "Forecast_period": 7,
            "Training_samples": 50,
            "With_weather_data": 1,
            "Training_instance_type": "ml.c4.2xlarge",
            "ML_endpoint_name": "ml-endpoint"
        }"#;

        let req = JobRequest::from_json(raw).unwrap();
        assert_eq!(req.data_start, NaiveDate::from_ymd_opt(2013, 6, 1).unwrap());
        assert_eq!(req.forecast_period, 7);
        assert_eq!(req.training_samples, 50);
        assert_eq!(req.with_weather_data, Some(true));
        assert_eq!(req.s3_bucket.as_deref(), Some("meter-data-bucket"));
    }

    #[test]
    fn weather_flag_accepts_zero_bool_and_text() {
        let base = r#""Data_start":"2013-06-01","Data_end":"2013-07-01","Forecast_period":1,"Training_samples":2"#;
        let zero = JobRequest::from_json(format!("{{{base},\"With_weather_data\":0}}").as_bytes()).unwrap();
        let yes = JobRequest::from_json(format!("{{{base},\"With_weather_data\":true}}").as_bytes()).unwrap();
        let text = JobRequest::from_json(format!("{{{base},\"With_weather_data\":\"on\"}}").as_bytes()).unwrap();
        let absent = JobRequest::from_json(format!("{{{base}}}").as_bytes()).unwrap();

        assert_eq!(zero.with_weather_data, Some(false));
        assert_eq!(yes.with_weather_data, Some(true));
        assert_eq!(text.with_weather_data, Some(true));
        assert_eq!(absent.with_weather_data, None);
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let err = JobRequest::from_json(br#"{"Data_start":"2013-13-01"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Payload(_)));
    }

    #[test]
    fn env_config_requires_bucket_and_schema() {
        let err = with_env_vars(&cleared_with(&[("Db_schema", "meter")]), pipeline_config_from_env)
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv("Working_bucket")));
    }

    #[test]
    fn env_config_reads_recognized_options() {
        let cfg = with_env_vars(
            &cleared_with(&[
                ("Athena_bucket", "athena-results"),
                ("Working_bucket", "work"),
                ("Db_schema", "meterdb"),
                ("With_weather_data", "1"),
                ("METERPREP_OUTPUT_PREFIX", "/forecast/"),
                ("METERPREP_ECHO_INPUT", "off"),
            ]),
            pipeline_config_from_env,
        )
        .unwrap();

        assert_eq!(cfg.athena_bucket.as_deref(), Some("athena-results"));
        assert_eq!(cfg.working_bucket, "work");
        assert_eq!(cfg.db_schema, "meterdb");
        assert!(cfg.with_weather_data);
        assert_eq!(cfg.output_prefix, "forecast");
        assert!(!cfg.echo_input);
        assert_eq!(cfg.warehouse_path, PathBuf::from(DEFAULT_WAREHOUSE_PATH));
    }

    #[test]
    fn invalid_weather_env_flag_is_an_error() {
        let err = with_env_vars(
            &cleared_with(&[
                ("Working_bucket", "work"),
                ("Db_schema", "meterdb"),
                ("With_weather_data", "sometimes"),
            ]),
            pipeline_config_from_env,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv {
                name: "With_weather_data",
                ..
            }
        ));
    }

    #[test]
    fn payload_overrides_environment() {
        let mut pipeline = PipelineConfig::new("env-bucket", "meterdb");
        pipeline.with_weather_data = true;

        let mut req = sample_request();
        let resolved = resolve_job(&req, &pipeline).unwrap();
        assert_eq!(resolved.bucket, "env-bucket");
        assert!(resolved.job.use_weather);

        req.s3_bucket = Some("payload-bucket".to_string());
        req.with_weather_data = Some(false);
        let resolved = resolve_job(&req, &pipeline).unwrap();
        assert_eq!(resolved.bucket, "payload-bucket");
        assert!(!resolved.job.use_weather);
    }

    #[test]
    fn resolve_rejects_inverted_range_and_zero_counts() {
        let pipeline = PipelineConfig::new("bucket", "meterdb");

        let mut req = sample_request();
        req.data_end = req.data_start;
        assert!(matches!(
            resolve_job(&req, &pipeline),
            Err(ConfigError::InvalidJob(_))
        ));

        let mut req = sample_request();
        req.forecast_period = 0;
        assert!(matches!(
            resolve_job(&req, &pipeline),
            Err(ConfigError::InvalidJob(_))
        ));

        let mut req = sample_request();
        req.training_samples = 0;
        assert!(matches!(
            resolve_job(&req, &pipeline),
            Err(ConfigError::InvalidJob(_))
        ));
    }
}
