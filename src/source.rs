use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};

use calamine::{open_workbook_auto_from_rs, Data, DataType, Reader};
use uuid::Uuid;

use crate::error::{EngineError, Result};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Text(String),
    Number(f64),
    Empty,
}

impl RawValue {
    pub fn is_empty(&self) -> bool {
        match self {
            RawValue::Empty => true,
            RawValue::Text(text) => text.trim().is_empty(),
            RawValue::Number(_) => false,
        }
    }
}

pub type Record = Vec<(String, RawValue)>;

pub type SourceRow = std::result::Result<Record, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Csv,
    Spreadsheet,
}

impl FileFormat {
    pub fn from_path(path: &Path) -> Result<FileFormat> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "csv" | "txt" => Ok(FileFormat::Csv),
            "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" => Ok(FileFormat::Spreadsheet),
            other => Err(EngineError::Source(format!(
                "unsupported file extension '{other}' for {}",
                path.display()
            ))),
        }
    }
}

pub trait RowSource: Send + Sync {
    fn read_rows(&self, bytes: &[u8], format: FileFormat) -> Result<Vec<SourceRow>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FileRowSource;

impl RowSource for FileRowSource {
    fn read_rows(&self, bytes: &[u8], format: FileFormat) -> Result<Vec<SourceRow>> {
        match format {
            FileFormat::Csv => parse_csv(bytes),
            FileFormat::Spreadsheet => parse_spreadsheet(bytes),
        }
    }
}

pub fn parse_csv(bytes: &[u8]) -> Result<Vec<SourceRow>> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|err| EngineError::Source(format!("unreadable CSV header: {err}")))?
        .iter()
        .map(str::to_string)
        .collect();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(EngineError::Source("CSV file has no header row".into()));
    }

    let mut rows = Vec::new();
    for result in reader.records() {
        let row = match result {
            Ok(record) => Ok(headers
                .iter()
                .enumerate()
                .map(|(idx, header)| {
                    let value = match record.get(idx) {
                        Some(field) if !field.is_empty() => RawValue::Text(field.to_string()),
                        _ => RawValue::Empty,
                    };
                    (header.clone(), value)
                })
                .collect()),
            Err(err) => Err(err.to_string()),
        };
        rows.push(row);
    }
    Ok(rows)
}

pub fn parse_spreadsheet(bytes: &[u8]) -> Result<Vec<SourceRow>> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|err| EngineError::Source(format!("unreadable spreadsheet: {err}")))?;
    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| EngineError::Source("spreadsheet has no sheets".into()))?;
    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|err| EngineError::Source(format!("failed to read sheet '{sheet_name}': {err}")))?;

    let mut cells = range.rows();
    let headers: Vec<String> = cells
        .next()
        .ok_or_else(|| EngineError::Source(format!("sheet '{sheet_name}' has no header row")))?
        .iter()
        .map(|cell| match cell_value(cell) {
            RawValue::Text(text) => text,
            RawValue::Number(n) => n.to_string(),
            RawValue::Empty => String::new(),
        })
        .collect();

    Ok(cells
        .map(|row| {
            Ok(headers
                .iter()
                .enumerate()
                .map(|(idx, header)| {
                    let value = row.get(idx).map(cell_value).unwrap_or(RawValue::Empty);
                    (header.clone(), value)
                })
                .collect())
        })
        .collect())
}

fn cell_value(cell: &Data) -> RawValue {
    match cell {
        Data::Empty | Data::Error(_) => RawValue::Empty,
        Data::Int(i) => RawValue::Number(*i as f64),
        Data::Float(f) => RawValue::Number(*f),
        Data::String(s) if s.trim().is_empty() => RawValue::Empty,
        Data::String(s) => RawValue::Text(s.trim().to_string()),
        Data::Bool(b) => RawValue::Text(b.to_string()),
        Data::DateTime(_) => cell
            .as_date()
            .map(|date| RawValue::Text(date.format("%Y-%m-%d").to_string()))
            .unwrap_or(RawValue::Empty),
        Data::DateTimeIso(s) | Data::DurationIso(s) => RawValue::Text(s.clone()),
    }
}

#[derive(Debug, Default)]
pub struct RowCache {
    rows: Mutex<HashMap<Uuid, Arc<Vec<SourceRow>>>>,
}

impl RowCache {
    pub fn get(&self, job_id: Uuid) -> Option<Arc<Vec<SourceRow>>> {
        self.rows
            .lock()
            .ok()
            .and_then(|rows| rows.get(&job_id).cloned())
    }

    pub fn insert(&self, job_id: Uuid, rows: Arc<Vec<SourceRow>>) {
        if let Ok(mut cache) = self.rows.lock() {
            cache.insert(job_id, rows);
        }
    }

    pub fn evict(&self, job_id: Uuid) {
        if let Ok(mut cache) = self.rows.lock() {
            cache.remove(&job_id);
        }
    }
}
