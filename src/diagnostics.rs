//! Run Diagnostics
//!
//! Recoverable per-series and per-key conditions found during a run.
//! Nothing here aborts a run; every entry is collected and reported at the end.

use crate::aggregator::AggregateKey;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

/// Severity of a diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
}

/// A recoverable condition tied to one series or one aggregate key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// Series has raw data but no scaling factor
    MissingNormalizationFactor {
        series_id: String,
        /// True when the series was kept at scale 1.0 instead of excluded
        kept_unscaled: bool,
    },

    /// Classified series has no raw column
    MissingRawSeries { series_id: String },

    /// Raw column with no classification row
    UnclassifiedRawSeries { series_id: String },

    /// Same series listed more than once with identical metadata
    DuplicateClassification { series_id: String, rows: Vec<usize> },

    /// Aggregate predicate resolved to zero series
    UnmatchedAggregateKey {
        key: AggregateKey,
        /// Near-miss labels present in the classification table
        suggestions: Vec<String>,
    },

    /// Computed aggregate exceeds its reference by more than tolerance
    OvercountedAggregateKey {
        key: AggregateKey,
        date: NaiveDate,
        computed: f64,
        expected: f64,
    },

    /// Candidate set too large for exhaustive subset search
    SubsetSearchBoundExceeded {
        key: AggregateKey,
        candidates: usize,
        bound: usize,
    },
}

impl Diagnostic {
    pub fn severity(&self) -> Severity {
        match self {
            Diagnostic::UnclassifiedRawSeries { .. } => Severity::Info,
            _ => Severity::Warning,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Diagnostic::MissingNormalizationFactor { .. } => "missing_normalization_factor",
            Diagnostic::MissingRawSeries { .. } => "missing_raw_series",
            Diagnostic::UnclassifiedRawSeries { .. } => "unclassified_raw_series",
            Diagnostic::DuplicateClassification { .. } => "duplicate_classification",
            Diagnostic::UnmatchedAggregateKey { .. } => "unmatched_aggregate_key",
            Diagnostic::OvercountedAggregateKey { .. } => "overcounted_aggregate_key",
            Diagnostic::SubsetSearchBoundExceeded { .. } => "subset_search_bound_exceeded",
        }
    }

    /// Aggregate key this diagnostic concerns, if any
    pub fn key(&self) -> Option<&AggregateKey> {
        match self {
            Diagnostic::UnmatchedAggregateKey { key, .. }
            | Diagnostic::OvercountedAggregateKey { key, .. }
            | Diagnostic::SubsetSearchBoundExceeded { key, .. } => Some(key),
            _ => None,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::MissingNormalizationFactor { series_id, kept_unscaled } => {
                if *kept_unscaled {
                    write!(f, "{}: no normalization factor, kept unscaled", series_id)
                } else {
                    write!(f, "{}: no normalization factor, excluded from aggregates", series_id)
                }
            }
            Diagnostic::MissingRawSeries { series_id } => {
                write!(f, "{}: classified but absent from raw data", series_id)
            }
            Diagnostic::UnclassifiedRawSeries { series_id } => {
                write!(f, "{}: raw column has no classification", series_id)
            }
            Diagnostic::DuplicateClassification { series_id, rows } => {
                write!(f, "{}: listed on rows {:?} with identical metadata", series_id, rows)
            }
            Diagnostic::UnmatchedAggregateKey { key, suggestions } => {
                write!(f, "{}: matches no series", key)?;
                if !suggestions.is_empty() {
                    write!(f, " (did you mean: {})", suggestions.join(", "))?;
                }
                Ok(())
            }
            Diagnostic::OvercountedAggregateKey { key, date, computed, expected } => write!(
                f,
                "{} @ {}: computed {:.4} exceeds reference {:.4}",
                key, date, computed, expected
            ),
            Diagnostic::SubsetSearchBoundExceeded { key, candidates, bound } => write!(
                f,
                "{}: unresolved, {} candidates exceed search bound {}",
                key, candidates, bound
            ),
        }
    }
}

/// Ordered collection of diagnostics for one run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticLog {
    entries: Vec<Diagnostic>,
}

impl DiagnosticLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a diagnostic and emit it to the tracing subscriber
    pub fn push(&mut self, diagnostic: Diagnostic) {
        match diagnostic.severity() {
            Severity::Warning => warn!(kind = diagnostic.kind(), "{}", diagnostic),
            Severity::Info => info!(kind = diagnostic.kind(), "{}", diagnostic),
        }
        self.entries.push(diagnostic);
    }

    /// Append entries that were already logged elsewhere
    pub fn absorb(&mut self, other: DiagnosticLog) {
        self.entries.extend(other.entries);
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn of_kind(&self, kind: &str) -> Vec<&Diagnostic> {
        self.entries.iter().filter(|d| d.kind() == kind).collect()
    }

    pub fn for_key(&self, key: &AggregateKey) -> Vec<&Diagnostic> {
        self.entries
            .iter()
            .filter(|d| d.key() == Some(key))
            .collect()
    }

    pub fn warnings(&self) -> usize {
        self.entries
            .iter()
            .filter(|d| d.severity() == Severity::Warning)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
