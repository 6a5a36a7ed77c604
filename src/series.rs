//! Series Store
//!
//! Time-indexed numeric-or-missing values, one column per series id.
//! Columns need not share a date range; the table's date axis is the union
//! of every date seen and a column with no entry at a date is missing there.

use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};

pub type SeriesId = String;

/// A single calendar date, the ordering key across all stores
pub type TimePoint = NaiveDate;

/// Numeric-or-missing. Missing is distinct from zero.
pub type Value = Option<f64>;

/// Collapse NaN / infinities to missing
pub fn clean(value: Value) -> Value {
    value.filter(|v| v.is_finite())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesTable {
    columns: BTreeMap<SeriesId, BTreeMap<TimePoint, Value>>,
    dates: BTreeSet<TimePoint>,
}

impl SeriesTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one cell; NaN is stored as missing
    pub fn insert(&mut self, series_id: &str, date: TimePoint, value: Value) {
        self.dates.insert(date);
        self.columns
            .entry(series_id.to_string())
            .or_default()
            .insert(date, clean(value));
    }

    /// Add a whole column, replacing any column with the same id
    pub fn insert_series<I>(&mut self, series_id: &str, values: I)
    where
        I: IntoIterator<Item = (TimePoint, Value)>,
    {
        let column: BTreeMap<TimePoint, Value> = values
            .into_iter()
            .map(|(date, value)| (date, clean(value)))
            .collect();
        self.dates.extend(column.keys().copied());
        self.columns.insert(series_id.to_string(), column);
    }

    /// Register a date on the axis without any values
    pub fn extend_dates<I: IntoIterator<Item = TimePoint>>(&mut self, dates: I) {
        self.dates.extend(dates);
    }

    pub fn contains(&self, series_id: &str) -> bool {
        self.columns.contains_key(series_id)
    }

    /// Value at a date; missing when the column or the cell does not exist
    pub fn get(&self, series_id: &str, date: TimePoint) -> Value {
        self.columns
            .get(series_id)
            .and_then(|column| column.get(&date).copied())
            .flatten()
    }

    /// Column aligned to the full date axis
    pub fn aligned(&self, series_id: &str) -> Option<Vec<(TimePoint, Value)>> {
        let column = self.columns.get(series_id)?;
        Some(
            self.dates
                .iter()
                .map(|date| (*date, column.get(date).copied().flatten()))
                .collect(),
        )
    }

    pub fn series_ids(&self) -> impl Iterator<Item = &SeriesId> {
        self.columns.keys()
    }

    pub fn dates(&self) -> &BTreeSet<TimePoint> {
        &self.dates
    }

    pub fn first_date(&self) -> Option<TimePoint> {
        self.dates.iter().next().copied()
    }

    pub fn last_date(&self) -> Option<TimePoint> {
        self.dates.iter().next_back().copied()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn height(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Copy of the table restricted to dates accepted by `keep`
    pub fn filter_dates<F>(&self, keep: F) -> SeriesTable
    where
        F: Fn(&TimePoint) -> bool,
    {
        let dates: BTreeSet<TimePoint> = self.dates.iter().copied().filter(|d| keep(d)).collect();
        let columns = self
            .columns
            .iter()
            .map(|(id, column)| {
                let kept = column
                    .iter()
                    .filter(|(date, _)| dates.contains(date))
                    .map(|(date, value)| (*date, *value))
                    .collect();
                (id.clone(), kept)
            })
            .collect();
        SeriesTable { columns, dates }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> TimePoint {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    #[test]
    fn test_outer_join_alignment() {
        let mut table = SeriesTable::new();
        table.insert_series("A", vec![(d(1), Some(1.0)), (d(2), Some(2.0))]);
        table.insert_series("B", vec![(d(2), Some(5.0)), (d(3), Some(6.0))]);

        assert_eq!(table.height(), 3);
        assert_eq!(table.get("A", d(3)), None);
        assert_eq!(table.get("B", d(1)), None);
        assert_eq!(
            table.aligned("A").unwrap(),
            vec![(d(1), Some(1.0)), (d(2), Some(2.0)), (d(3), None)]
        );
    }

    #[test]
    fn test_nan_stored_as_missing() {
        let mut table = SeriesTable::new();
        table.insert("A", d(1), Some(f64::NAN));
        assert_eq!(table.get("A", d(1)), None);
        assert!(table.contains("A"));
    }

    #[test]
    fn test_unknown_series_is_missing_not_zero() {
        let table = SeriesTable::new();
        assert_eq!(table.get("nope", d(1)), None);
        assert!(table.aligned("nope").is_none());
    }
}
