//! Reconciler
//!
//! Compares computed aggregates against reference values, ranks the
//! discrepancies, summarises the error pattern and checks parent = sum of
//! children consistency on any aggregate table.

use crate::aggregator::{strict_sum, AggregateKey, AggregateTable, ReferenceTable};
use crate::series::TimePoint;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    /// Both values present, difference above tolerance
    ValueMismatch,
    /// Reference has a value, computed aggregate is missing
    ComputedMissing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub key: AggregateKey,
    pub date: TimePoint,
    pub computed: Option<f64>,
    pub expected: f64,
    /// `computed - expected`
    pub difference: Option<f64>,
    /// `difference / expected`, absent when expected is zero
    pub relative_difference: Option<f64>,
    pub kind: DiscrepancyKind,
}

impl Discrepancy {
    pub fn abs_difference(&self) -> Option<f64> {
        self.difference.map(f64::abs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPattern {
    /// Differences are consistent in size: std < mean |difference|
    Systematic,
    Random,
}

/// Statistics over every (key, date) pair where both values were present
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    /// Pairs with both values present
    pub checked: usize,
    pub discrepancies: usize,
    pub computed_missing: usize,
    pub exact_matches: usize,
    pub computed_over: usize,
    pub computed_under: usize,
    pub mean_difference: Option<f64>,
    pub mean_abs_difference: Option<f64>,
    pub max_difference: Option<f64>,
    pub min_difference: Option<f64>,
    /// Sample standard deviation of the differences
    pub std_difference: Option<f64>,
    /// Undetermined with fewer than two differences or when all are exact
    pub pattern: Option<ErrorPattern>,
}

impl SummaryStats {
    fn from_differences(differences: &[f64], exact_match_epsilon: f64) -> Self {
        let mut stats = SummaryStats {
            checked: differences.len(),
            ..SummaryStats::default()
        };
        if differences.is_empty() {
            return stats;
        }

        let n = differences.len() as f64;
        let mean = differences.iter().sum::<f64>() / n;
        let mean_abs = differences.iter().map(|d| d.abs()).sum::<f64>() / n;

        stats.exact_matches = differences.iter().filter(|d| d.abs() <= exact_match_epsilon).count();
        stats.computed_over = differences.iter().filter(|d| **d > exact_match_epsilon).count();
        stats.computed_under = differences.iter().filter(|d| **d < -exact_match_epsilon).count();
        stats.mean_difference = Some(mean);
        stats.mean_abs_difference = Some(mean_abs);
        stats.max_difference = differences.iter().copied().max_by(f64::total_cmp);
        stats.min_difference = differences.iter().copied().min_by(f64::total_cmp);

        if differences.len() > 1 {
            let variance = differences.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (n - 1.0);
            let std = variance.sqrt();
            stats.std_difference = Some(std);
            if mean_abs > exact_match_epsilon {
                stats.pattern = Some(if std < mean_abs {
                    ErrorPattern::Systematic
                } else {
                    ErrorPattern::Random
                });
            }
        }
        stats
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeySummary {
    pub key: AggregateKey,
    pub stats: SummaryStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscrepancyReport {
    pub tolerance: f64,
    /// Value mismatches by |difference| descending, then computed-missing
    pub discrepancies: Vec<Discrepancy>,
    pub summary: SummaryStats,
    pub by_key: Vec<KeySummary>,
    /// Computed keys with no reference values; not checked
    pub unchecked_keys: Vec<AggregateKey>,
}

impl DiscrepancyReport {
    pub fn is_clean(&self) -> bool {
        self.discrepancies.is_empty()
    }

    pub fn for_key(&self, key: &AggregateKey) -> Vec<&Discrepancy> {
        self.discrepancies.iter().filter(|d| &d.key == key).collect()
    }
}

/// Parent total that should equal the sum of its children
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyRule {
    pub parent: AggregateKey,
    pub children: Vec<AggregateKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyViolation {
    /// Which table was checked, e.g. "reference" or "computed"
    pub source: String,
    pub parent: AggregateKey,
    pub date: TimePoint,
    pub parent_value: f64,
    pub children_sum: f64,
    /// `parent_value - children_sum`
    pub difference: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyReport {
    pub source: String,
    /// (rule, date) pairs where parent and every child were present
    pub checked: usize,
    /// Rules whose parent or a child is absent from the table
    pub skipped_rules: Vec<AggregateKey>,
    pub violations: Vec<ConsistencyViolation>,
}

pub struct Reconciler {
    tolerance: f64,
    exact_match_epsilon: f64,
}

impl Reconciler {
    pub fn new(tolerance: f64) -> Self {
        Self {
            tolerance,
            exact_match_epsilon: 1e-9,
        }
    }

    pub fn with_exact_match_epsilon(mut self, epsilon: f64) -> Self {
        self.exact_match_epsilon = epsilon;
        self
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Check every (key, date) in `reference` against `computed`
    pub fn reconcile(&self, computed: &AggregateTable, reference: &ReferenceTable) -> DiscrepancyReport {
        let mut discrepancies = Vec::new();
        let mut all_differences = Vec::new();
        let mut by_key = Vec::new();
        let mut computed_missing = 0usize;

        for (key, expected_column) in reference.iter() {
            let mut differences = Vec::with_capacity(expected_column.len());
            let mut key_missing = 0usize;

            for (&date, &expected) in expected_column {
                let computed_value = computed.value(key, date);
                match computed_value {
                    Some(value) => {
                        let difference = value - expected;
                        differences.push(difference);
                        if difference.abs() > self.tolerance {
                            discrepancies.push(Discrepancy {
                                key: key.clone(),
                                date,
                                computed: Some(value),
                                expected,
                                difference: Some(difference),
                                relative_difference: (expected != 0.0).then(|| difference / expected),
                                kind: DiscrepancyKind::ValueMismatch,
                            });
                        }
                    }
                    None => {
                        key_missing += 1;
                        discrepancies.push(Discrepancy {
                            key: key.clone(),
                            date,
                            computed: None,
                            expected,
                            difference: None,
                            relative_difference: None,
                            kind: DiscrepancyKind::ComputedMissing,
                        });
                    }
                }
            }

            let mut stats = SummaryStats::from_differences(&differences, self.exact_match_epsilon);
            stats.computed_missing = key_missing;
            stats.discrepancies = differences.iter().filter(|d| d.abs() > self.tolerance).count() + key_missing;
            debug!("{}: {} checked, {} discrepancies", key, stats.checked, stats.discrepancies);

            computed_missing += key_missing;
            all_differences.extend(differences);
            by_key.push(KeySummary {
                key: key.clone(),
                stats,
            });
        }

        discrepancies.sort_by(rank);

        let mut summary = SummaryStats::from_differences(&all_differences, self.exact_match_epsilon);
        summary.computed_missing = computed_missing;
        summary.discrepancies = discrepancies.len();

        let unchecked_keys: Vec<AggregateKey> = computed
            .keys()
            .filter(|key| !reference.contains_key(key))
            .cloned()
            .collect();

        info!(
            "🔍 Reconciled {} pairs: {} discrepancies ({} computed missing), {} keys unchecked",
            summary.checked + summary.computed_missing,
            summary.discrepancies,
            summary.computed_missing,
            unchecked_keys.len()
        );

        DiscrepancyReport {
            tolerance: self.tolerance,
            discrepancies,
            summary,
            by_key,
            unchecked_keys,
        }
    }

    /// Verify parent = sum(children) on `table` wherever all of them are present
    pub fn check_hierarchy(&self, table: &AggregateTable, rules: &[HierarchyRule], source: &str) -> HierarchyReport {
        let mut report = HierarchyReport {
            source: source.to_string(),
            checked: 0,
            skipped_rules: Vec::new(),
            violations: Vec::new(),
        };

        for rule in rules {
            let all_known = table.contains(&rule.parent) && rule.children.iter().all(|c| table.contains(c));
            if !all_known || rule.children.is_empty() {
                debug!("{}: hierarchy rule skipped on {}", rule.parent, source);
                report.skipped_rules.push(rule.parent.clone());
                continue;
            }

            for &date in table.dates() {
                let parent_value = table.value(&rule.parent, date);
                let children_sum = strict_sum(rule.children.iter().map(|child| table.value(child, date)));
                let (Some(parent_value), Some(children_sum)) = (parent_value, children_sum) else {
                    continue;
                };

                report.checked += 1;
                let difference = parent_value - children_sum;
                if difference.abs() > self.tolerance {
                    report.violations.push(ConsistencyViolation {
                        source: source.to_string(),
                        parent: rule.parent.clone(),
                        date,
                        parent_value,
                        children_sum,
                        difference,
                    });
                }
            }
        }

        info!(
            "🧮 Hierarchy check on {}: {} checked, {} violations",
            source,
            report.checked,
            report.violations.len()
        );
        report
    }
}

/// Largest |difference| first; computed-missing after every value mismatch
fn rank(a: &Discrepancy, b: &Discrepancy) -> Ordering {
    let by_size = match (a.abs_difference(), b.abs_difference()) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_size
        .then_with(|| a.key.cmp(&b.key))
        .then_with(|| a.date.cmp(&b.date))
}

/// Discrepancies grouped per key, preserving rank order within each key
pub fn group_by_key(discrepancies: &[Discrepancy]) -> BTreeMap<&AggregateKey, Vec<&Discrepancy>> {
    let mut grouped: BTreeMap<&AggregateKey, Vec<&Discrepancy>> = BTreeMap::new();
    for discrepancy in discrepancies {
        grouped.entry(&discrepancy.key).or_default().push(discrepancy);
    }
    grouped
}
