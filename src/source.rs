//! Tabular Data Sources
//!
//! The raw series and the reference values come from outside the core.
//! `SeriesSource` is the seam; file-backed sources read wide CSV / Parquet
//! through polars, reference values are read as long CSV records.

use crate::aggregator::{AggregateKey, ReferenceTable};
use crate::error::{ReconError, Result};
use crate::metadata::is_missing_marker;
use crate::series::{SeriesTable, TimePoint};
use chrono::NaiveDate;
use polars::prelude::*;
use serde::Deserialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default name of the date column in wide series files
pub const DATE_COLUMN: &str = "date";

/// Source of raw series
///
/// Implementations:
/// - FileSeriesSource: wide CSV or Parquet file
/// - InMemorySource: an already-built table
pub trait SeriesSource: Send + Sync {
    /// Load every series this source provides
    fn load(&self) -> Result<SeriesTable>;

    /// Unique identifier of the source
    fn source_id(&self) -> &str;

    /// Source type (e.g. "csv", "parquet", "memory")
    fn source_type(&self) -> &str;
}

/// Wide file: one date column plus one column per series id
pub struct FileSeriesSource {
    source_id: String,
    path: PathBuf,
    date_column: String,
}

impl FileSeriesSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            source_id: path.display().to_string(),
            path,
            date_column: DATE_COLUMN.to_string(),
        }
    }

    pub fn with_date_column(mut self, date_column: &str) -> Self {
        self.date_column = date_column.to_string();
        self
    }

    fn is_parquet(&self) -> bool {
        self.path.extension().and_then(|e| e.to_str()) == Some("parquet")
    }

    fn read_frame(&self) -> Result<DataFrame> {
        if !self.path.exists() {
            return Err(ReconError::Source(format!(
                "Series file not found: {}",
                self.path.display()
            )));
        }

        let df = if self.is_parquet() {
            LazyFrame::scan_parquet(&self.path, ScanArgsParquet::default())
                .map_err(|e| ReconError::Source(format!("Failed to scan {}: {}", self.path.display(), e)))?
                .collect()?
        } else {
            LazyCsvReader::new(&self.path)
                .with_has_header(true)
                .with_infer_schema_length(Some(1000))
                .finish()
                .map_err(|e| ReconError::Source(format!("Failed to read CSV {}: {}", self.path.display(), e)))?
                .collect()?
        };
        Ok(df)
    }
}

impl SeriesSource for FileSeriesSource {
    fn load(&self) -> Result<SeriesTable> {
        info!("📂 Loading series: {}", self.path.display());
        let df = self.read_frame()?;
        let table = frame_to_table(&df, &self.date_column)?;
        info!("✅ Loaded {} series over {} dates", table.width(), table.height());
        Ok(table)
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn source_type(&self) -> &str {
        if self.is_parquet() {
            "parquet"
        } else {
            "csv"
        }
    }
}

/// Source wrapping a table built by the caller
pub struct InMemorySource {
    source_id: String,
    table: SeriesTable,
}

impl InMemorySource {
    pub fn new(source_id: &str, table: SeriesTable) -> Self {
        Self {
            source_id: source_id.to_string(),
            table,
        }
    }
}

impl SeriesSource for InMemorySource {
    fn load(&self) -> Result<SeriesTable> {
        Ok(self.table.clone())
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn source_type(&self) -> &str {
        "memory"
    }
}

fn parse_date(raw: &str) -> Result<TimePoint> {
    let raw = raw.trim();
    // Datetime columns stringify with a time part
    let day = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .map_err(|e| ReconError::Source(format!("Invalid date '{}': {}", raw, e)))
}

/// Convert a wide frame into a series table. Non-numeric cells become missing.
pub fn frame_to_table(df: &DataFrame, date_column: &str) -> Result<SeriesTable> {
    let dates_series = df
        .column(date_column)
        .map_err(|_| ReconError::Source(format!("Missing date column '{}'", date_column)))?
        .cast(&DataType::String)?;

    let mut dates = Vec::with_capacity(df.height());
    for (row_idx, raw) in dates_series.str()?.into_iter().enumerate() {
        match raw {
            Some(raw) => dates.push(parse_date(raw)?),
            None => {
                return Err(ReconError::Source(format!(
                    "Row {} has no date",
                    row_idx + 1
                )))
            }
        }
    }

    let mut table = SeriesTable::new();
    table.extend_dates(dates.iter().copied());

    for name in df.get_column_names() {
        if name == date_column {
            continue;
        }
        let values = df.column(name)?.cast(&DataType::Float64)?;
        let values = values.f64()?;
        let series_id = name.trim();
        debug!("series {} ({} non-null)", series_id, values.len() - values.null_count());
        table.insert_series(
            series_id,
            dates.iter().copied().zip(values.into_iter()),
        );
    }

    Ok(table)
}

/// One row of a long-format reference file
#[derive(Debug, Deserialize)]
struct ReferenceRow {
    category: String,
    subcategory: String,
    #[serde(default)]
    third_level: Option<String>,
    date: NaiveDate,
    value: Option<String>,
}

/// Load reference values from `category,subcategory,third_level,date,value` CSV.
pub fn load_reference_csv(path: impl AsRef<Path>) -> Result<ReferenceTable> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .map_err(|e| ReconError::Source(format!("Failed to open {}: {}", path.display(), e)))?;
    let reference = read_reference_csv(file)?;
    info!("📋 Loaded {} reference keys from {}", reference.len(), path.display());
    Ok(reference)
}

/// Rows with an empty or `#N/A` value are skipped: there is nothing to check
/// against. A second row for the same key and date is an error.
pub fn read_reference_csv<R: Read>(reader: R) -> Result<ReferenceTable> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut reference = ReferenceTable::new();
    let mut skipped = 0usize;
    for (idx, row) in rdr.deserialize::<ReferenceRow>().enumerate() {
        let record = idx + 1;
        let row = row.map_err(|e| ReconError::Source(format!("record {}: {}", record, e)))?;
        let key = AggregateKey::new(
            &row.category,
            &row.subcategory,
            row.third_level.as_deref().unwrap_or(""),
        );
        let value = match row.value.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) if is_missing_marker(raw) => None,
            Some(raw) => Some(raw.parse::<f64>().map_err(|_| {
                ReconError::Source(format!("record {}: invalid value '{}'", record, raw))
            })?),
        };
        match value.filter(|v| v.is_finite()) {
            Some(value) => {
                if reference.insert(key.clone(), row.date, value).is_some() {
                    return Err(ReconError::Source(format!(
                        "record {}: duplicate reference value for {} on {}",
                        record, key, row.date
                    )));
                }
            }
            None => skipped += 1,
        }
    }
    debug!("{} blank reference rows skipped", skipped);
    Ok(reference)
}
