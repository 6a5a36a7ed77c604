//! Aggregator
//!
//! Strict sums of normalized series over a (category, subcategory, third level)
//! predicate. A total is missing at a date as soon as one contributing series
//! is missing there; it is never treated as zero.

use crate::diagnostics::{Diagnostic, DiagnosticLog};
use crate::error::{ReconError, Result};
use crate::matcher::{near_misses, resolve_candidates};
use crate::metadata::{ClassificationTable, SeriesMetadata, WILDCARD};
use crate::series::{SeriesId, SeriesTable, TimePoint, Value};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Third component of an aggregate key
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ThirdLevel {
    /// Matches any third level, including the empty string
    #[default]
    Any,
    Exact(String),
}

impl ThirdLevel {
    pub fn matches(&self, third_level: &str) -> bool {
        match self {
            ThirdLevel::Any => true,
            ThirdLevel::Exact(expected) => expected == third_level,
        }
    }
}

impl From<String> for ThirdLevel {
    fn from(raw: String) -> Self {
        let raw = raw.trim();
        if raw == WILDCARD {
            ThirdLevel::Any
        } else {
            ThirdLevel::Exact(raw.to_string())
        }
    }
}

impl From<ThirdLevel> for String {
    fn from(level: ThirdLevel) -> Self {
        match level {
            ThirdLevel::Any => WILDCARD.to_string(),
            ThirdLevel::Exact(value) => value,
        }
    }
}

impl fmt::Display for ThirdLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThirdLevel::Any => write!(f, "{}", WILDCARD),
            ThirdLevel::Exact(value) => write!(f, "{}", value),
        }
    }
}

/// Identifies one target total, e.g. "Demand / Italy / *"
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "KeyFields")]
pub struct AggregateKey {
    pub category: String,
    pub subcategory: String,
    pub third_level: ThirdLevel,
}

/// Wire shape of a key; trimmed on the way in
#[derive(Deserialize)]
struct KeyFields {
    category: String,
    subcategory: String,
    #[serde(default)]
    third_level: ThirdLevel,
}

impl From<KeyFields> for AggregateKey {
    fn from(fields: KeyFields) -> Self {
        Self {
            category: fields.category.trim().to_string(),
            subcategory: fields.subcategory.trim().to_string(),
            third_level: fields.third_level,
        }
    }
}

impl AggregateKey {
    /// `third_level` of `"*"` means wildcard
    pub fn new(category: &str, subcategory: &str, third_level: &str) -> Self {
        Self {
            category: category.trim().to_string(),
            subcategory: subcategory.trim().to_string(),
            third_level: ThirdLevel::from(third_level.to_string()),
        }
    }

    pub fn wildcard(category: &str, subcategory: &str) -> Self {
        Self::new(category, subcategory, WILDCARD)
    }

    /// Exact, case-sensitive match on already-trimmed fields
    pub fn matches(&self, meta: &SeriesMetadata) -> bool {
        self.category == meta.category
            && self.subcategory == meta.subcategory
            && self.third_level.matches(&meta.third_level)
    }
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {} / {}", self.category, self.subcategory, self.third_level)
    }
}

impl FromStr for AggregateKey {
    type Err = ReconError;

    /// Parses "category / subcategory / third" or "category / subcategory"
    /// (the latter as a wildcard). Labels may contain bare slashes.
    fn from_str(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.splitn(3, " / ").collect();
        match parts.as_slice() {
            [category, subcategory] => Ok(AggregateKey::wildcard(category, subcategory)),
            [category, subcategory, third] => Ok(AggregateKey::new(category, subcategory, third)),
            _ => Err(ReconError::InvalidKey(format!(
                "'{}' is not 'category / subcategory [/ third level]'",
                raw
            ))),
        }
    }
}

/// How an aggregate column was produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Provenance {
    /// Strict sum of matched series
    Matched {
        /// Series that contributed, in classification order
        members: Vec<SeriesId>,
        /// Matched by the predicate but absent from the normalized table
        excluded: Vec<SeriesId>,
    },
    /// Sum/difference of other aggregates
    Derived {
        plus: Vec<AggregateKey>,
        minus: Vec<AggregateKey>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateSeries {
    pub key: AggregateKey,
    pub provenance: Provenance,
    /// Aligned with the owning table's dates
    pub values: Vec<Value>,
}

impl AggregateSeries {
    pub fn members(&self) -> &[SeriesId] {
        match &self.provenance {
            Provenance::Matched { members, .. } => members,
            Provenance::Derived { .. } => &[],
        }
    }
}

/// Aggregates over a shared, sorted date axis, kept in insertion order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateTable {
    dates: Vec<TimePoint>,
    series: Vec<AggregateSeries>,
    index: HashMap<AggregateKey, usize>,
}

impl AggregateTable {
    pub fn new(dates: Vec<TimePoint>) -> Self {
        let mut dates = dates;
        dates.sort();
        dates.dedup();
        Self {
            dates,
            series: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Insert or replace a column aligned with `dates()`. A column of the
    /// wrong length is padded with missing values or cut to the axis.
    pub fn insert(&mut self, series: AggregateSeries) {
        let mut series = series;
        if series.values.len() != self.dates.len() {
            warn!(
                "{}: {} values for {} dates, aligning to the date axis",
                series.key,
                series.values.len(),
                self.dates.len()
            );
            series.values.resize(self.dates.len(), None);
        }
        match self.index.get(&series.key) {
            Some(&idx) => self.series[idx] = series,
            None => {
                self.index.insert(series.key.clone(), self.series.len());
                self.series.push(series);
            }
        }
    }

    pub fn get(&self, key: &AggregateKey) -> Option<&AggregateSeries> {
        self.index.get(key).map(|&idx| &self.series[idx])
    }

    pub fn contains(&self, key: &AggregateKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn date_index(&self, date: TimePoint) -> Option<usize> {
        self.dates.binary_search(&date).ok()
    }

    /// Missing when the key or the date is unknown
    pub fn value(&self, key: &AggregateKey, date: TimePoint) -> Value {
        let idx = self.date_index(date)?;
        self.get(key).and_then(|s| s.values.get(idx).copied().flatten())
    }

    pub fn dates(&self) -> &[TimePoint] {
        &self.dates
    }

    pub fn keys(&self) -> impl Iterator<Item = &AggregateKey> {
        self.series.iter().map(|s| &s.key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AggregateSeries> {
        self.series.iter()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Copy restricted to the given (sorted) dates
    pub fn restrict_dates(&self, keep: impl Fn(&TimePoint) -> bool) -> AggregateTable {
        let kept: Vec<usize> = (0..self.dates.len()).filter(|&i| keep(&self.dates[i])).collect();
        let mut table = AggregateTable::new(kept.iter().map(|&i| self.dates[i]).collect());
        for series in &self.series {
            table.insert(AggregateSeries {
                key: series.key.clone(),
                provenance: series.provenance.clone(),
                values: kept.iter().map(|&i| series.values.get(i).copied().flatten()).collect(),
            });
        }
        table
    }
}

/// Externally supplied expected totals; read-only for the core
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceTable {
    values: BTreeMap<AggregateKey, BTreeMap<TimePoint, f64>>,
}

impl ReferenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value previously held for (key, date), if any
    pub fn insert(&mut self, key: AggregateKey, date: TimePoint, value: f64) -> Option<f64> {
        self.values.entry(key).or_default().insert(date, value)
    }

    pub fn get(&self, key: &AggregateKey, date: TimePoint) -> Option<f64> {
        self.values.get(key).and_then(|column| column.get(&date).copied())
    }

    pub fn contains_key(&self, key: &AggregateKey) -> bool {
        self.values.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AggregateKey, &BTreeMap<TimePoint, f64>)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// View the reference as an aggregate table, for structural checks
    pub fn to_aggregate_table(&self) -> AggregateTable {
        let mut dates: Vec<TimePoint> = self
            .values
            .values()
            .flat_map(|column| column.keys().copied())
            .collect();
        dates.sort();
        dates.dedup();

        let mut table = AggregateTable::new(dates);
        for (key, column) in &self.values {
            let values = table.dates().iter().map(|d| column.get(d).copied()).collect();
            table.insert(AggregateSeries {
                key: key.clone(),
                provenance: Provenance::Matched {
                    members: Vec::new(),
                    excluded: Vec::new(),
                },
                values,
            });
        }
        table
    }
}

/// Sum with strict missing semantics: any missing input makes the total missing
pub fn strict_sum<I>(values: I) -> Value
where
    I: IntoIterator<Item = Value>,
{
    values
        .into_iter()
        .try_fold(0.0, |acc, value| value.map(|v| acc + v))
}

/// Total computed from other totals, e.g. a calculated sector or a grand total
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedAggregate {
    pub key: AggregateKey,
    pub plus: Vec<AggregateKey>,
    #[serde(default)]
    pub minus: Vec<AggregateKey>,
}

pub struct Aggregator<'a> {
    meta: &'a ClassificationTable,
    normalized: &'a SeriesTable,
}

impl<'a> Aggregator<'a> {
    pub fn new(meta: &'a ClassificationTable, normalized: &'a SeriesTable) -> Self {
        Self { meta, normalized }
    }

    /// Aggregate one key over the normalized table's date axis.
    ///
    /// Returns an `UnmatchedAggregateKey` diagnostic when the predicate
    /// matches no classified series.
    pub fn aggregate(&self, key: &AggregateKey) -> (AggregateSeries, Option<Diagnostic>) {
        let candidates = resolve_candidates(key, self.meta);
        let (members, excluded): (Vec<SeriesId>, Vec<SeriesId>) = candidates
            .into_iter()
            .partition(|id| self.normalized.contains(id));

        let dates: Vec<TimePoint> = self.normalized.dates().iter().copied().collect();
        let values: Vec<Value> = if members.is_empty() {
            vec![None; dates.len()]
        } else {
            dates
                .iter()
                .map(|date| strict_sum(members.iter().map(|id| self.normalized.get(id, *date))))
                .collect()
        };

        let diagnostic = if members.is_empty() && excluded.is_empty() {
            Some(Diagnostic::UnmatchedAggregateKey {
                key: key.clone(),
                suggestions: near_misses(key, self.meta),
            })
        } else {
            None
        };

        debug!(
            "{}: {} members, {} excluded",
            key,
            members.len(),
            excluded.len()
        );

        (
            AggregateSeries {
                key: key.clone(),
                provenance: Provenance::Matched { members, excluded },
                values,
            },
            diagnostic,
        )
    }

    /// Aggregate every key independently. Each key yields at most one
    /// unmatched-key diagnostic regardless of how many dates it spans.
    pub fn aggregate_all(&self, keys: &[AggregateKey], parallel: bool) -> (AggregateTable, DiagnosticLog) {
        let results: Vec<(AggregateSeries, Option<Diagnostic>)> = if parallel {
            keys.par_iter().map(|key| self.aggregate(key)).collect()
        } else {
            keys.iter().map(|key| self.aggregate(key)).collect()
        };

        let mut table = AggregateTable::new(self.normalized.dates().iter().copied().collect());
        let mut log = DiagnosticLog::new();
        for (series, diagnostic) in results {
            table.insert(series);
            if let Some(diagnostic) = diagnostic {
                log.push(diagnostic);
            }
        }

        info!("📊 Aggregated {} keys over {} dates", table.len(), table.dates().len());
        (table, log)
    }
}

/// Evaluate derived totals in order; later entries may use earlier ones.
/// An operand that is not in the table is a malformed plan.
pub fn apply_derived(table: &mut AggregateTable, derived: &[DerivedAggregate]) -> Result<()> {
    for rule in derived {
        for operand in rule.plus.iter().chain(rule.minus.iter()) {
            if !table.contains(operand) {
                return Err(ReconError::InvalidKey(format!(
                    "derived total '{}' refers to unknown aggregate '{}'",
                    rule.key, operand
                )));
            }
        }

        let values: Vec<Value> = (0..table.dates().len())
            .map(|idx| {
                let column = |key: &AggregateKey| table.get(key).and_then(|s| s.values.get(idx).copied().flatten());
                let plus = strict_sum(rule.plus.iter().map(column));
                let minus = strict_sum(rule.minus.iter().map(column));
                match (plus, minus) {
                    (Some(p), Some(m)) => Some(p - m),
                    _ => None,
                }
            })
            .collect();

        table.insert(AggregateSeries {
            key: rule.key.clone(),
            provenance: Provenance::Derived {
                plus: rule.plus.clone(),
                minus: rule.minus.clone(),
            },
            values,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn d(day: u32) -> TimePoint {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
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

    #[test]
    fn test_strict_sum() {
        assert_eq!(strict_sum(vec![Some(1.0), Some(2.5)]), Some(3.5));
        assert_eq!(strict_sum(vec![Some(1.0), None, Some(2.0)]), None);
        assert_eq!(strict_sum(Vec::<Value>::new()), Some(0.0));
    }

    #[test]
    fn test_key_parse_and_display() {
        let key: AggregateKey = "Import / Norway / Europe".parse().unwrap();
        assert_eq!(key, AggregateKey::new("Import", "Norway", "Europe"));
        assert_eq!(key.to_string(), "Import / Norway / Europe");

        let wildcard: AggregateKey = "Demand / Italy".parse().unwrap();
        assert_eq!(wildcard.third_level, ThirdLevel::Any);

        let slashed: AggregateKey = "Demand / Netherlands / Industrial (calculated to 30/6/22 then actual)"
            .parse()
            .unwrap();
        assert_eq!(
            slashed.third_level,
            ThirdLevel::Exact("Industrial (calculated to 30/6/22 then actual)".to_string())
        );

        assert!("Demand".parse::<AggregateKey>().is_err());
    }

    #[test]
    fn test_concrete_third_level_does_not_substring_match() {
        let key = AggregateKey::new("Demand", "Germany", "Industrial");
        assert!(key.matches(&meta("A", "Demand", "Germany", "Industrial")));
        assert!(!key.matches(&meta("B", "Demand", "Germany", "Industrial and Power")));
        assert!(!key.matches(&meta("C", "demand", "Germany", "Industrial")));
    }

    #[test]
    fn test_unmatched_key_warns_once_and_is_all_missing() {
        let table = ClassificationTable::from_records(vec![meta("A", "Demand", "Italy", "")]).unwrap();
        let mut normalized = SeriesTable::new();
        normalized.insert_series("A", (1..=5).map(|day| (d(day), Some(1.0))));

        let aggregator = Aggregator::new(&table, &normalized);
        let key = AggregateKey::wildcard("Demand", "Spain");
        let (aggregates, log) = aggregator.aggregate_all(&[key.clone()], false);

        assert_eq!(log.for_key(&key).len(), 1);
        assert!(aggregates.get(&key).unwrap().values.iter().all(|v| v.is_none()));
    }

    #[test]
    fn test_derived_total_is_strict() {
        let mut table = AggregateTable::new(vec![d(1), d(2)]);
        let a = AggregateKey::new("Demand", "Germany", "Industrial and Power");
        let b = AggregateKey::new("Intermediate Calculation", "#Germany", "Gas-to-Power");
        for (key, values) in [(&a, vec![Some(10.0), Some(8.0)]), (&b, vec![Some(4.0), None])] {
            table.insert(AggregateSeries {
                key: key.clone(),
                provenance: Provenance::Matched {
                    members: vec![],
                    excluded: vec![],
                },
                values,
            });
        }

        let calculated = AggregateKey::new("Demand", "Germany", "Industrial (calculated)");
        apply_derived(
            &mut table,
            &[DerivedAggregate {
                key: calculated.clone(),
                plus: vec![a],
                minus: vec![b],
            }],
        )
        .unwrap();

        assert_eq!(table.value(&calculated, d(1)), Some(6.0));
        assert_eq!(table.value(&calculated, d(2)), None);
    }

    #[test]
    fn test_derived_with_unknown_operand_is_rejected() {
        let mut table = AggregateTable::new(vec![d(1)]);
        let err = apply_derived(
            &mut table,
            &[DerivedAggregate {
                key: AggregateKey::wildcard("Demand", "Total"),
                plus: vec![AggregateKey::wildcard("Demand", "Nowhere")],
                minus: vec![],
            }],
        )
        .unwrap_err();
        assert!(matches!(err, ReconError::InvalidKey(_)));
    }

    #[test]
    fn test_plan_key_fields_are_trimmed() {
        let key: AggregateKey =
            serde_json::from_str(r#"{"category": "Demand ", "subcategory": " Italy", "third_level": " LDZ "}"#).unwrap();
        assert_eq!(key, AggregateKey::new("Demand", "Italy", "LDZ"));

        let wildcard: AggregateKey = serde_json::from_str(r#"{"category": "Demand", "subcategory": " Italy"}"#).unwrap();
        assert_eq!(wildcard, AggregateKey::wildcard("Demand", "Italy"));
        assert!(wildcard.matches(&meta("ITLDZ", "Demand", "Italy", "LDZ")));
    }

    #[test]
    fn test_misaligned_column_is_fitted_to_axis() {
        let key = AggregateKey::wildcard("Demand", "Italy");
        let mut table = AggregateTable::new(vec![d(1), d(2), d(3)]);
        table.insert(AggregateSeries {
            key: key.clone(),
            provenance: Provenance::Matched {
                members: vec![],
                excluded: vec![],
            },
            values: vec![Some(1.0)],
        });
        assert_eq!(table.value(&key, d(1)), Some(1.0));
        assert_eq!(table.value(&key, d(3)), None);
        assert_eq!(table.get(&key).unwrap().values.len(), 3);
    }
}
