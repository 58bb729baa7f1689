//! CSV ingestion into the SQLite warehouse tables.

use std::io::Read;
use std::path::Path;

use chrono::NaiveDateTime;
use csv::StringRecord;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::warehouse::format_stored_timestamp;

const ACCEPTED_TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoadReport {
    pub rows_read: u64,
    pub rows_written: u64,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("CSV header is missing column {0}")]
    MissingColumn(&'static str),
    #[error("line {line}: failed to parse {field} value '{value}'")]
    ParseField {
        line: u64,
        field: &'static str,
        value: String,
    },
}

/// Writes meter readings and weather observations into a warehouse database file.
pub struct WarehouseLoader {
    conn: Connection,
}

impl WarehouseLoader {
    pub fn open(path: &Path) -> Result<Self, IngestError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            ",
        )?;
        ensure_schema(&conn)?;

        Ok(Self { conn })
    }

    /// CSV columns: `meter_id`, `reading_date_time`, `reading_value` (empty value → NULL).
    pub fn load_readings_csv<R: Read>(&mut self, reader: R) -> Result<LoadReport, IngestError> {
        let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let headers = csv.headers()?.clone();
        let meter_idx = column_index(&headers, "meter_id")?;
        let ts_idx = column_index(&headers, "reading_date_time")?;
        let value_idx = column_index(&headers, "reading_value")?;

        let mut report = LoadReport::default();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO daily (meter_id, reading_date_time, reading_value)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(meter_id, reading_date_time) DO UPDATE SET
                    reading_value = excluded.reading_value
                ",
            )?;

            for record in csv.records() {
                let record = record?;
                report.rows_read += 1;
                let line = record_line(&record);
                let meter_id = record.get(meter_idx).unwrap_or_default();
                if meter_id.is_empty() {
                    return Err(IngestError::ParseField {
                        line,
                        field: "meter_id",
                        value: String::new(),
                    });
                }
                let ts = parse_timestamp_field(&record, ts_idx, line, "reading_date_time")?;
                let value = parse_optional_f64(&record, value_idx, line, "reading_value")?;

                report.rows_written +=
                    stmt.execute(params![meter_id, format_stored_timestamp(ts), value])? as u64;
            }
        }
        tx.commit()?;

        info!(
            component = "ingest",
            event = "ingest.readings.finish",
            rows_read = report.rows_read,
            rows_written = report.rows_written
        );
        Ok(report)
    }

    /// CSV columns: `time`, `temperature`, `apparenttemperature`, `humidity`.
    pub fn load_weather_csv<R: Read>(&mut self, reader: R) -> Result<LoadReport, IngestError> {
        let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let headers = csv.headers()?.clone();
        let time_idx = column_index(&headers, "time")?;
        let temperature_idx = column_index(&headers, "temperature")?;
        let apparent_idx = column_index(&headers, "apparenttemperature")?;
        let humidity_idx = column_index(&headers, "humidity")?;

        let mut report = LoadReport::default();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO weather (time, temperature, apparenttemperature, humidity)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(time) DO UPDATE SET
                    temperature = excluded.temperature,
                    apparenttemperature = excluded.apparenttemperature,
                    humidity = excluded.humidity
                ",
            )?;

            for record in csv.records() {
                let record = record?;
                report.rows_read += 1;
                let line = record_line(&record);
                let ts = parse_timestamp_field(&record, time_idx, line, "time")?;
                let temperature = parse_optional_f64(&record, temperature_idx, line, "temperature")?;
                let apparent =
                    parse_optional_f64(&record, apparent_idx, line, "apparenttemperature")?;
                let humidity = parse_optional_f64(&record, humidity_idx, line, "humidity")?;

                report.rows_written += stmt.execute(params![
                    format_stored_timestamp(ts),
                    temperature,
                    apparent,
                    humidity
                ])? as u64;
            }
        }
        tx.commit()?;

        info!(
            component = "ingest",
            event = "ingest.weather.finish",
            rows_read = report.rows_read,
            rows_written = report.rows_written
        );
        Ok(report)
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), IngestError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS daily (
            meter_id TEXT NOT NULL,
            reading_date_time TEXT NOT NULL,
            reading_value REAL,
            PRIMARY KEY(meter_id, reading_date_time)
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS weather (
            time TEXT NOT NULL PRIMARY KEY,
            temperature REAL,
            apparenttemperature REAL,
            humidity REAL
        ) WITHOUT ROWID;
        ",
    )?;
    Ok(())
}

fn column_index(headers: &StringRecord, name: &'static str) -> Result<usize, IngestError> {
    headers
        .iter()
        .position(|h| h.eq_ignore_ascii_case(name))
        .ok_or(IngestError::MissingColumn(name))
}

fn record_line(record: &StringRecord) -> u64 {
    record.position().map(|p| p.line()).unwrap_or(0)
}

fn parse_timestamp_field(
    record: &StringRecord,
    idx: usize,
    line: u64,
    field: &'static str,
) -> Result<NaiveDateTime, IngestError> {
    let raw = record.get(idx).unwrap_or_default();
    parse_flexible_timestamp(raw).ok_or_else(|| IngestError::ParseField {
        line,
        field,
        value: raw.to_string(),
    })
}

fn parse_optional_f64(
    record: &StringRecord,
    idx: usize,
    line: u64,
    field: &'static str,
) -> Result<Option<f64>, IngestError> {
    let raw = record.get(idx).unwrap_or_default();
    if raw.is_empty() || raw.eq_ignore_ascii_case("null") {
        return Ok(None);
    }
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(Some(value)),
        _ => Err(IngestError::ParseField {
            line,
            field,
            value: raw.to_string(),
        }),
    }
}

fn parse_flexible_timestamp(raw: &str) -> Option<NaiveDateTime> {
    ACCEPTED_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}
