use std::fs::File;
use std::path::PathBuf;

use meterprep::{
    init_logging, log_app_start, logging_config_from_env, WarehouseLoader, DEFAULT_WAREHOUSE_PATH,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("load_warehouse", &logging_cfg);

    let warehouse_path = std::env::var("METERPREP_WAREHOUSE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_WAREHOUSE_PATH));
    let readings = std::env::var("METERPREP_READINGS_CSV").ok().map(PathBuf::from);
    let weather = std::env::var("METERPREP_WEATHER_CSV").ok().map(PathBuf::from);

    if readings.is_none() && weather.is_none() {
        return Err("set METERPREP_READINGS_CSV and/or METERPREP_WEATHER_CSV".into());
    }

    let mut loader = WarehouseLoader::open(&warehouse_path)?;

    if let Some(path) = readings {
        let report = loader.load_readings_csv(File::open(&path)?)?;
        println!(
            "readings {} -> {} | read={} written={}",
            path.display(),
            warehouse_path.display(),
            report.rows_read,
            report.rows_written
        );
    }

    if let Some(path) = weather {
        let report = loader.load_weather_csv(File::open(&path)?)?;
        println!(
            "weather {} -> {} | read={} written={}",
            path.display(),
            warehouse_path.display(),
            report.rows_read,
            report.rows_written
        );
    }

    Ok(())
}
