use std::io::Read;
use std::path::PathBuf;

use meterprep::{
    init_logging, log_app_start, log_job_resolved, log_sink_selected, logging_config_from_env,
    pipeline_config_from_env, prepare_training_data, resolve_job, HttpObjectStore,
    HttpStoreConfig, JobRequest, LocalObjectStore, ObjectSink, SqliteWarehouse, WarehouseConfig,
};

const DEFAULT_STORE_ROOT: &str = "data/objects";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("prepare_training", &logging_cfg);

    let pipeline = pipeline_config_from_env()?;
    let payload = read_payload()?;
    let request = JobRequest::from_json(&payload)?;
    let echo: serde_json::Value = serde_json::from_slice(&payload)?;
    let resolved = resolve_job(&request, &pipeline)?;
    log_job_resolved(&resolved, &pipeline.warehouse_path, &pipeline.db_schema);

    let warehouse = SqliteWarehouse::open(&WarehouseConfig {
        database_path: pipeline.warehouse_path.clone(),
        schema: pipeline.db_schema.clone(),
        staging_bucket: request
            .athena_bucket
            .clone()
            .or_else(|| pipeline.athena_bucket.clone()),
    })?;
    let sink = sink_from_env()?;

    let report = prepare_training_data(&resolved, &warehouse, sink.as_ref(), Some(&echo))?;
    drop(warehouse);

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Payload from the file named by the first argument, or stdin when absent or `-`.
fn read_payload() -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    match std::env::args().nth(1).filter(|arg| arg != "-") {
        Some(path) => Ok(std::fs::read(PathBuf::from(path))?),
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            Ok(buf)
        }
    }
}

fn sink_from_env() -> Result<Box<dyn ObjectSink>, Box<dyn std::error::Error>> {
    if let Some(endpoint) = std::env::var("METERPREP_STORE_ENDPOINT")
        .ok()
        .filter(|v| !v.trim().is_empty())
    {
        log_sink_selected("http", &endpoint);
        return Ok(Box::new(HttpObjectStore::new(HttpStoreConfig::new(endpoint))?));
    }

    let root = std::env::var("METERPREP_STORE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_STORE_ROOT));
    log_sink_selected("local", &root.display().to_string());
    Ok(Box::new(LocalObjectStore::new(root)))
}
