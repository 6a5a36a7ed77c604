//! Classification Table
//!
//! Static mapping from series id to its category / subcategory / third level,
//! normalization factor and zero-fill policy. Built once per run and never
//! mutated afterwards.

use crate::error::{ReconError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

/// Third-level value meaning "match regardless of this field"
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesMetadata {
    pub series_id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub category: String,
    pub subcategory: String,
    #[serde(default)]
    pub third_level: String,
    /// Absent means "scaling unknown", which is not the same as 1.0
    #[serde(default)]
    pub normalization_factor: Option<f64>,
    /// Replace missing raw values with 0 before scaling
    pub zero_fill: bool,
}

impl SeriesMetadata {
    /// Classification fields only; the free-text description is ignored
    pub fn same_classification(&self, other: &SeriesMetadata) -> bool {
        self.category == other.category
            && self.subcategory == other.subcategory
            && self.third_level == other.third_level
            && self.normalization_factor == other.normalization_factor
            && self.zero_fill == other.zero_fill
    }

    fn trimmed(mut self) -> Self {
        self.series_id = self.series_id.trim().to_string();
        self.category = self.category.trim().to_string();
        self.subcategory = self.subcategory.trim().to_string();
        self.third_level = self.third_level.trim().to_string();
        self.description = self
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());
        self.normalization_factor = self.normalization_factor.filter(|f| f.is_finite());
        self
    }
}

/// One row of a ticker-list style CSV
#[derive(Debug, Deserialize)]
struct ClassificationRow {
    #[serde(alias = "Ticker", alias = "ticker")]
    series_id: String,
    #[serde(default, alias = "Description")]
    description: Option<String>,
    #[serde(alias = "Category")]
    category: String,
    #[serde(alias = "Region from", alias = "region_from")]
    subcategory: String,
    #[serde(default, alias = "Region to", alias = "region_to")]
    third_level: Option<String>,
    #[serde(default, alias = "Normalization factor")]
    normalization_factor: Option<String>,
    #[serde(default)]
    zero_fill: Option<String>,
    #[serde(default, rename = "Replace blanks with #N/A")]
    keep_blanks: Option<String>,
}

impl ClassificationRow {
    fn into_metadata(self, record: usize) -> Result<SeriesMetadata> {
        let normalization_factor = match self.normalization_factor.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) if is_missing_marker(raw) => None,
            Some(raw) => Some(raw.parse::<f64>().map_err(|_| {
                ReconError::Metadata(format!(
                    "record {}: invalid normalization factor '{}'",
                    record, raw
                ))
            })?),
        };

        let zero_fill = match (self.zero_fill.as_deref(), self.keep_blanks.as_deref()) {
            (Some(flag), _) => parse_flag(flag).ok_or_else(|| {
                ReconError::Metadata(format!(
                    "record {}: invalid zero_fill value '{}'",
                    record, flag
                ))
            })?,
            // Only an explicit "Y" keeps blanks missing
            (None, Some(keep)) => parse_flag(keep) != Some(true),
            (None, None) => {
                return Err(ReconError::Metadata(format!(
                    "record {}: no zero-fill policy for '{}'",
                    record, self.series_id
                )))
            }
        };

        Ok(SeriesMetadata {
            series_id: self.series_id,
            description: self.description,
            category: self.category,
            subcategory: self.subcategory,
            third_level: self.third_level.unwrap_or_default(),
            normalization_factor,
            zero_fill,
        })
    }
}

pub(crate) fn is_missing_marker(raw: &str) -> bool {
    matches!(raw.to_ascii_lowercase().as_str(), "#n/a" | "n/a" | "nan" | "na")
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "true" | "1" => Some(true),
        "n" | "no" | "false" | "0" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClassificationTable {
    records: Vec<SeriesMetadata>,
    by_id: HashMap<String, usize>,
    /// Series listed more than once with identical metadata (1-based record numbers)
    duplicates: Vec<(String, Vec<usize>)>,
}

impl ClassificationTable {
    /// Load from a `.json` or `.csv` file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::load_json(path),
            Some("csv") => {
                let file = std::fs::File::open(path).map_err(|e| {
                    ReconError::Metadata(format!("Failed to read {}: {}", path.display(), e))
                })?;
                Self::from_csv_reader(file)
            }
            _ => Err(ReconError::Metadata(format!(
                "Unsupported classification file: {}",
                path.display()
            ))),
        }
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ReconError::Metadata(format!("Failed to read {}: {}", path.display(), e)))?;
        let value: serde_json::Value = serde_json::from_str(&content)
            .map_err(|e| ReconError::Metadata(format!("Failed to parse {}: {}", path.display(), e)))?;
        // Accept both a bare array and {"series": [...]}
        let records: Vec<SeriesMetadata> = if value.get("series").is_some() {
            serde_json::from_value(value["series"].clone())?
        } else {
            serde_json::from_value(value)?
        };
        Self::from_records(records)
    }

    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut records = Vec::new();
        for (idx, row) in rdr.deserialize::<ClassificationRow>().enumerate() {
            let row = row.map_err(|e| ReconError::Metadata(format!("record {}: {}", idx + 1, e)))?;
            records.push(row.into_metadata(idx + 1)?);
        }
        Self::from_records(records)
    }

    /// Build the table, trimming every field once.
    ///
    /// Identical duplicates collapse into the first occurrence and are kept
    /// for reporting; conflicting duplicates are fatal.
    pub fn from_records(records: Vec<SeriesMetadata>) -> Result<Self> {
        let mut table = ClassificationTable::default();
        let mut rows_by_id: HashMap<String, Vec<usize>> = HashMap::new();

        for (idx, record) in records.into_iter().enumerate() {
            let record_no = idx + 1;
            let record = record.trimmed();
            if record.series_id.is_empty() {
                return Err(ReconError::Metadata(format!(
                    "record {}: empty series id",
                    record_no
                )));
            }

            if let Some(&existing) = table.by_id.get(&record.series_id) {
                let first_row = rows_by_id[&record.series_id][0];
                if !table.records[existing].same_classification(&record) {
                    return Err(ReconError::ConflictingClassification {
                        series_id: record.series_id,
                        first_row,
                        row: record_no,
                    });
                }
                if let Some(rows) = rows_by_id.get_mut(&record.series_id) {
                    rows.push(record_no);
                }
                continue;
            }

            rows_by_id.insert(record.series_id.clone(), vec![record_no]);
            table.by_id.insert(record.series_id.clone(), table.records.len());
            table.records.push(record);
        }

        for record in &table.records {
            if let Some(rows) = rows_by_id.get(&record.series_id) {
                if rows.len() > 1 {
                    table.duplicates.push((record.series_id.clone(), rows.clone()));
                }
            }
        }

        Ok(table)
    }

    pub fn get(&self, series_id: &str) -> Option<&SeriesMetadata> {
        self.by_id.get(series_id).map(|&idx| &self.records[idx])
    }

    pub fn contains(&self, series_id: &str) -> bool {
        self.by_id.contains_key(series_id)
    }

    /// Records in load order
    pub fn records(&self) -> &[SeriesMetadata] {
        &self.records
    }

    /// Position of a series in load order
    pub fn position(&self, series_id: &str) -> Option<usize> {
        self.by_id.get(series_id).copied()
    }

    pub fn duplicates(&self) -> &[(String, Vec<usize>)] {
        &self.duplicates
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
