use crate::aggregator::AggregateKey;
use crate::diff::{Discrepancy, DiscrepancyKind};
use crate::metadata::{ClassificationTable, SeriesMetadata};
use crate::series::{SeriesId, SeriesTable};
use serde::{Deserialize, Serialize};

/// Localises a single discrepancy to individual series: which one, removed
/// from or added to the aggregate, would bring it within tolerance.
pub struct DrilldownEngine<'a> {
    meta: &'a ClassificationTable,
    normalized: &'a SeriesTable,
    tolerance: f64,
}

impl<'a> DrilldownEngine<'a> {
    pub fn new(meta: &'a ClassificationTable, normalized: &'a SeriesTable, tolerance: f64) -> Self {
        Self {
            meta,
            normalized,
            tolerance,
        }
    }

    /// `members` are the series that were summed into the discrepant aggregate
    pub fn find_divergence(&self, discrepancy: &Discrepancy, members: &[SeriesId]) -> DivergencePoint {
        let date = discrepancy.date;
        let mut point = DivergencePoint {
            key: discrepancy.key.clone(),
            date,
            computed: discrepancy.computed,
            expected: discrepancy.expected,
            missing_members: Vec::new(),
            removals: Vec::new(),
            additions: Vec::new(),
        };

        if discrepancy.kind == DiscrepancyKind::ComputedMissing {
            point.missing_members = members
                .iter()
                .filter(|id| self.normalized.get(id, date).is_none())
                .cloned()
                .collect();
            return point;
        }

        let Some(computed) = discrepancy.computed else {
            return point;
        };

        for id in members {
            if let Some(value) = self.normalized.get(id, date) {
                let residual = computed - value - discrepancy.expected;
                if residual.abs() <= self.tolerance {
                    point.removals.push(GapCloser {
                        series_id: id.clone(),
                        value,
                        residual,
                    });
                }
            }
        }

        for record in self.neighbours(&discrepancy.key, members) {
            if let Some(value) = self.normalized.get(&record.series_id, date) {
                let residual = computed + value - discrepancy.expected;
                if residual.abs() <= self.tolerance {
                    point.additions.push(GapCloser {
                        series_id: record.series_id.clone(),
                        value,
                        residual,
                    });
                }
            }
        }

        point
    }

    /// Series one classification step away from `key`: same category and
    /// subcategory with another third level, or same subcategory under
    /// another category.
    fn neighbours<'m>(&'m self, key: &'m AggregateKey, members: &'m [SeriesId]) -> impl Iterator<Item = &'m SeriesMetadata> {
        self.meta.records().iter().filter(move |record| {
            if members.contains(&record.series_id) {
                return false;
            }
            let sibling = record.category == key.category
                && record.subcategory == key.subcategory
                && !key.third_level.matches(&record.third_level);
            let cousin = record.category != key.category && record.subcategory == key.subcategory;
            sibling || cousin
        })
    }
}

/// Where a discrepancy can be pinned on individual series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivergencePoint {
    pub key: AggregateKey,
    pub date: chrono::NaiveDate,
    pub computed: Option<f64>,
    pub expected: f64,
    /// Members missing at the date (only for computed-missing discrepancies)
    pub missing_members: Vec<SeriesId>,
    pub removals: Vec<GapCloser>,
    pub additions: Vec<GapCloser>,
}

impl DivergencePoint {
    pub fn is_explained(&self) -> bool {
        !self.missing_members.is_empty() || !self.removals.is_empty() || !self.additions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapCloser {
    pub series_id: SeriesId,
    /// Normalized value of the series at the date
    pub value: f64,
    /// Remaining difference after the change
    pub residual: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::TimePoint;
    use chrono::NaiveDate;

    fn date() -> TimePoint {
        NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()
    }

    fn meta(id: &str, category: &str, sub: &str, third: &str) -> SeriesMetadata {
        SeriesMetadata {
            series_id: id.to_string(),
            description: None,
            category: category.to_string(),
            subcategory: sub.to_string(),
            third_level: third.to_string(),
            normalization_factor: Some(1.0),
            zero_fill: false,
        }
    }

    fn fixture() -> (ClassificationTable, SeriesTable) {
        let table = ClassificationTable::from_records(vec![
            meta("A", "Import", "Norway", "Europe"),
            meta("B", "Import", "Norway", "Europe"),
            meta("C", "Import", "Norway", "UK"),
            meta("D", "Export", "Norway", "Europe"),
        ])
        .unwrap();
        let mut normalized = SeriesTable::new();
        normalized.insert("A", date(), Some(10.0));
        normalized.insert("B", date(), Some(4.0));
        normalized.insert("C", date(), Some(3.0));
        normalized.insert("D", date(), None);
        (table, normalized)
    }

    fn mismatch(computed: f64, expected: f64) -> Discrepancy {
        Discrepancy {
            key: AggregateKey::new("Import", "Norway", "Europe"),
            date: date(),
            computed: Some(computed),
            expected,
            difference: Some(computed - expected),
            relative_difference: None,
            kind: DiscrepancyKind::ValueMismatch,
        }
    }

    #[test]
    fn test_removal_closes_overcount() {
        let (table, normalized) = fixture();
        let engine = DrilldownEngine::new(&table, &normalized, 0.01);
        let members = vec!["A".to_string(), "B".to_string()];

        let point = engine.find_divergence(&mismatch(14.0, 10.0), &members);
        assert_eq!(point.removals.len(), 1);
        assert_eq!(point.removals[0].series_id, "B");
        assert!(point.additions.is_empty());
    }

    #[test]
    fn test_neighbour_addition_closes_undercount() {
        let (table, normalized) = fixture();
        let engine = DrilldownEngine::new(&table, &normalized, 0.01);
        let members = vec!["A".to_string(), "B".to_string()];

        let point = engine.find_divergence(&mismatch(14.0, 17.0), &members);
        assert_eq!(point.additions.len(), 1);
        assert_eq!(point.additions[0].series_id, "C");
        assert!(point.is_explained());
    }

    #[test]
    fn test_computed_missing_lists_missing_members() {
        let (table, normalized) = fixture();
        let engine = DrilldownEngine::new(&table, &normalized, 0.01);
        let discrepancy = Discrepancy {
            key: AggregateKey::wildcard("Export", "Norway"),
            date: date(),
            computed: None,
            expected: 2.0,
            difference: None,
            relative_difference: None,
            kind: DiscrepancyKind::ComputedMissing,
        };

        let point = engine.find_divergence(&discrepancy, &["D".to_string()]);
        assert_eq!(point.missing_members, vec!["D".to_string()]);
    }
}
