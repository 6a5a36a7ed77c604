//! Normalizer
//!
//! Scales each classified raw series by its normalization factor. Zero-fill
//! (when a series asks for it) happens before scaling; otherwise missing
//! stays missing. Series whose factor is unknown are never silently scaled
//! by 1.0: they are excluded or kept unscaled per policy, and reported.

use crate::config::MissingFactorPolicy;
use crate::diagnostics::{Diagnostic, DiagnosticLog};
use crate::metadata::ClassificationTable;
use crate::series::{SeriesTable, Value};
use tracing::info;

/// Normalized table plus everything worth reporting about how it was built
#[derive(Debug, Clone, Default)]
pub struct NormalizationOutcome {
    pub table: SeriesTable,
    pub diagnostics: DiagnosticLog,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    policy: MissingFactorPolicy,
}

impl Normalizer {
    pub fn new(policy: MissingFactorPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> MissingFactorPolicy {
        self.policy
    }

    /// Produce a new table; `raw` is not modified.
    ///
    /// The output keeps the raw date axis. Raw columns without a
    /// classification row are reported and left out.
    pub fn normalize(&self, raw: &SeriesTable, meta: &ClassificationTable) -> NormalizationOutcome {
        let mut table = SeriesTable::new();
        table.extend_dates(raw.dates().iter().copied());
        let mut diagnostics = DiagnosticLog::new();

        for record in meta.records() {
            let Some(column) = raw.aligned(&record.series_id) else {
                diagnostics.push(Diagnostic::MissingRawSeries {
                    series_id: record.series_id.clone(),
                });
                continue;
            };

            let factor = match (record.normalization_factor, self.policy) {
                (Some(factor), _) => factor,
                (None, MissingFactorPolicy::Exclude) => {
                    diagnostics.push(Diagnostic::MissingNormalizationFactor {
                        series_id: record.series_id.clone(),
                        kept_unscaled: false,
                    });
                    continue;
                }
                (None, MissingFactorPolicy::Unscaled) => {
                    diagnostics.push(Diagnostic::MissingNormalizationFactor {
                        series_id: record.series_id.clone(),
                        kept_unscaled: true,
                    });
                    1.0
                }
            };

            let zero_fill = record.zero_fill;
            table.insert_series(
                &record.series_id,
                column
                    .into_iter()
                    .map(|(date, value)| (date, scale(value, factor, zero_fill))),
            );
        }

        for series_id in raw.series_ids() {
            if !meta.contains(series_id) {
                diagnostics.push(Diagnostic::UnclassifiedRawSeries {
                    series_id: series_id.clone(),
                });
            }
        }

        info!(
            "📐 Normalized {} of {} raw series ({} diagnostics)",
            table.width(),
            raw.width(),
            diagnostics.len()
        );
        NormalizationOutcome { table, diagnostics }
    }
}

fn scale(value: Value, factor: f64, zero_fill: bool) -> Value {
    let value = if zero_fill { value.or(Some(0.0)) } else { value };
    value.map(|v| v * factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::SeriesMetadata;
    use crate::series::TimePoint;
    use chrono::NaiveDate;

    fn d(day: u32) -> TimePoint {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn meta(id: &str, factor: Option<f64>, zero_fill: bool) -> SeriesMetadata {
        SeriesMetadata {
            series_id: id.to_string(),
            description: None,
            category: "Demand".to_string(),
            subcategory: "Italy".to_string(),
            third_level: String::new(),
            normalization_factor: factor,
            zero_fill,
        }
    }

    #[test]
    fn test_zero_fill_before_scaling() {
        let table = ClassificationTable::from_records(vec![
            meta("FILL", Some(2.0), true),
            meta("KEEP", Some(2.0), false),
        ])
        .unwrap();
        let mut raw = SeriesTable::new();
        raw.insert_series("FILL", vec![(d(1), Some(3.0)), (d(2), None)]);
        raw.insert_series("KEEP", vec![(d(1), None), (d(2), Some(4.0))]);

        let outcome = Normalizer::default().normalize(&raw, &table);
        assert_eq!(outcome.table.get("FILL", d(1)), Some(6.0));
        assert_eq!(outcome.table.get("FILL", d(2)), Some(0.0));
        assert_eq!(outcome.table.get("KEEP", d(1)), None);
        assert_eq!(outcome.table.get("KEEP", d(2)), Some(8.0));
        assert!(outcome.diagnostics.is_empty());
    }

    #[test]
    fn test_missing_factor_excluded_by_default() {
        let table = ClassificationTable::from_records(vec![meta("A", None, false)]).unwrap();
        let mut raw = SeriesTable::new();
        raw.insert("A", d(1), Some(5.0));

        let outcome = Normalizer::default().normalize(&raw, &table);
        assert!(!outcome.table.contains("A"));
        assert_eq!(outcome.diagnostics.of_kind("missing_normalization_factor").len(), 1);
    }

    #[test]
    fn test_missing_factor_kept_unscaled_is_still_reported() {
        let table = ClassificationTable::from_records(vec![meta("A", None, false)]).unwrap();
        let mut raw = SeriesTable::new();
        raw.insert("A", d(1), Some(5.0));

        let outcome = Normalizer::new(MissingFactorPolicy::Unscaled).normalize(&raw, &table);
        assert_eq!(outcome.table.get("A", d(1)), Some(5.0));
        assert_eq!(
            outcome.diagnostics.entries(),
            &[Diagnostic::MissingNormalizationFactor {
                series_id: "A".to_string(),
                kept_unscaled: true
            }]
        );
    }

    #[test]
    fn test_absent_and_unclassified_series_are_reported() {
        let table = ClassificationTable::from_records(vec![meta("A", Some(1.0), false)]).unwrap();
        let mut raw = SeriesTable::new();
        raw.insert("Z", d(1), Some(1.0));

        let outcome = Normalizer::default().normalize(&raw, &table);
        assert_eq!(outcome.diagnostics.of_kind("missing_raw_series").len(), 1);
        assert_eq!(outcome.diagnostics.of_kind("unclassified_raw_series").len(), 1);
        assert_eq!(outcome.diagnostics.warnings(), 1);
    }

    #[test]
    fn test_normalizing_twice_differs_from_once() {
        let table = ClassificationTable::from_records(vec![meta("A", Some(2.0), false)]).unwrap();
        let mut raw = SeriesTable::new();
        raw.insert("A", d(1), Some(10.0));

        let normalizer = Normalizer::default();
        let once = normalizer.normalize(&raw, &table).table;
        let twice = normalizer.normalize(&once, &table).table;

        assert_eq!(once.get("A", d(1)), Some(20.0));
        assert_eq!(twice.get("A", d(1)), Some(40.0));
        assert_ne!(once, twice);
    }
}
