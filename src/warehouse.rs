//! Warehouse access: meter sampling, hourly consumption aggregation and weather reads.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::series::WeatherObservation;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Stored form of reading and weather times. Sub-second digits are written only when
/// present, so whole-second values match `TIMESTAMP_FORMAT` and text order is time order.
pub const STORED_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumptionRow {
    pub meter_id: String,
    pub hour: NaiveDateTime,
    pub consumption: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseConfig {
    pub database_path: PathBuf,
    pub schema: String,
    /// Where the engine stages query results. Reported only; SQLite answers in-process.
    pub staging_bucket: Option<String>,
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid warehouse schema name '{0}'")]
    InvalidSchema(String),
    #[error("warehouse database not found at {path}")]
    MissingDatabase { path: PathBuf },
    #[error("invalid timestamp in column {column}: '{value}'")]
    InvalidTimestamp { column: &'static str, value: String },
}

/// Query surface the dataset builder needs from the warehouse.
pub trait Warehouse {
    /// Up to `limit` distinct meter ids, in a stable order.
    fn sample_meter_ids(&self, limit: usize) -> Result<Vec<String>, WarehouseError>;

    /// Per-meter sums of readings truncated to the hour, over `[start, end_exclusive)`.
    fn hourly_consumption(
        &self,
        meter_ids: &[String],
        start: NaiveDateTime,
        end_exclusive: NaiveDateTime,
    ) -> Result<Vec<ConsumptionRow>, WarehouseError>;

    /// Raw weather observations over `[start, end_exclusive)` ordered by time.
    fn weather_between(
        &self,
        start: NaiveDateTime,
        end_exclusive: NaiveDateTime,
    ) -> Result<Vec<WeatherObservation>, WarehouseError>;
}

/// SQLite-backed warehouse. The database file is attached under the configured schema
/// name so that queries address `"<schema>".daily` and `"<schema>".weather`.
///
/// The connection lives exactly as long as this value.
pub struct SqliteWarehouse {
    conn: Connection,
    schema: String,
}

impl SqliteWarehouse {
    pub fn open(cfg: &WarehouseConfig) -> Result<Self, WarehouseError> {
        validate_schema_name(&cfg.schema)?;
        if !cfg.database_path.is_file() {
            return Err(WarehouseError::MissingDatabase {
                path: cfg.database_path.clone(),
            });
        }

        let conn = Connection::open_in_memory()?;
        let attach = format!("ATTACH DATABASE ?1 AS {}", quote_identifier(&cfg.schema));
        conn.execute(&attach, params![path_text(&cfg.database_path)])?;

        info!(
            component = "warehouse",
            event = "warehouse.open",
            path = %cfg.database_path.display(),
            schema = %cfg.schema,
            staging_bucket = cfg.staging_bucket.as_deref().unwrap_or("")
        );

        Ok(Self {
            conn,
            schema: cfg.schema.clone(),
        })
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", quote_identifier(&self.schema), quote_identifier(name))
    }
}

impl Warehouse for SqliteWarehouse {
    fn sample_meter_ids(&self, limit: usize) -> Result<Vec<String>, WarehouseError> {
        let sql = format!(
            "SELECT DISTINCT meter_id FROM {} ORDER BY meter_id LIMIT ?1",
            self.table("daily")
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            component = "warehouse",
            event = "warehouse.sample.finish",
            requested = limit,
            returned = ids.len()
        );
        Ok(ids)
    }

    fn hourly_consumption(
        &self,
        meter_ids: &[String],
        start: NaiveDateTime,
        end_exclusive: NaiveDateTime,
    ) -> Result<Vec<ConsumptionRow>, WarehouseError> {
        if meter_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (1..=meter_ids.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let start_idx = meter_ids.len() + 1;
        let end_idx = meter_ids.len() + 2;
        let sql = format!(
            "
            SELECT
                strftime('%Y-%m-%d %H:00:00', reading_date_time) AS hour_bucket,
                meter_id,
                SUM(reading_value) AS consumption
            FROM {}
            WHERE meter_id IN ({placeholders})
              AND reading_date_time >= ?{start_idx}
              AND reading_date_time < ?{end_idx}
            GROUP BY meter_id, hour_bucket
            ORDER BY meter_id ASC, hour_bucket ASC
            ",
            self.table("daily")
        );

        let mut bind: Vec<String> = meter_ids.to_vec();
        bind.push(format_timestamp(start));
        bind.push(format_timestamp(end_exclusive));

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let hour_raw: Option<String> = row.get(0)?;
            let meter_id: String = row.get(1)?;
            let consumption: Option<f64> = row.get(2)?;
            let hour_raw = hour_raw.unwrap_or_default();
            out.push(ConsumptionRow {
                meter_id,
                hour: parse_timestamp("reading_date_time", &hour_raw)?,
                consumption: consumption.unwrap_or(0.0),
            });
        }

        info!(
            component = "warehouse",
            event = "warehouse.consumption.finish",
            meters = meter_ids.len(),
            start = %start,
            end_exclusive = %end_exclusive,
            rows = out.len()
        );
        Ok(out)
    }

    fn weather_between(
        &self,
        start: NaiveDateTime,
        end_exclusive: NaiveDateTime,
    ) -> Result<Vec<WeatherObservation>, WarehouseError> {
        let sql = format!(
            "
            SELECT time, temperature, apparenttemperature, humidity
            FROM {}
            WHERE time >= ?1
              AND time < ?2
            ORDER BY time ASC
            ",
            self.table("weather")
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![
            format_timestamp(start),
            format_timestamp(end_exclusive)
        ])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let time_raw: String = row.get(0)?;
            out.push(WeatherObservation {
                time: parse_timestamp("time", &time_raw)?,
                temperature: row.get(1)?,
                apparent_temperature: row.get(2)?,
                humidity: row.get(3)?,
            });
        }

        debug!(
            component = "warehouse",
            event = "warehouse.weather.finish",
            start = %start,
            end_exclusive = %end_exclusive,
            rows = out.len()
        );
        Ok(out)
    }
}

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn format_stored_timestamp(ts: NaiveDateTime) -> String {
    ts.format(STORED_TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(column: &'static str, raw: &str) -> Result<NaiveDateTime, WarehouseError> {
    NaiveDateTime::parse_from_str(raw.trim(), STORED_TIMESTAMP_FORMAT).map_err(|_| {
        WarehouseError::InvalidTimestamp {
            column,
            value: raw.to_string(),
        }
    })
}

/// Double-quote an SQL identifier, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn validate_schema_name(schema: &str) -> Result<(), WarehouseError> {
    let valid_chars = !schema.is_empty()
        && schema
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    let reserved = matches!(schema.to_ascii_lowercase().as_str(), "main" | "temp");
    if !valid_chars || reserved {
        return Err(WarehouseError::InvalidSchema(schema.to_string()));
    }
    Ok(())
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
