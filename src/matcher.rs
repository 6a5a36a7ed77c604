//! Matcher / Ambiguity Resolver
//!
//! Resolves which classified series feed an aggregate key and, when a
//! computed total overshoots its reference, searches the candidate power set
//! for the subset that best reproduces the reference. Findings are advisory:
//! nothing here rewrites the classification or the aggregates.

use crate::aggregator::{AggregateKey, ThirdLevel};
use crate::metadata::ClassificationTable;
use crate::series::{SeriesId, SeriesTable, TimePoint};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Minimum label similarity for a near-miss suggestion
const SUGGESTION_THRESHOLD: f64 = 0.85;
const MAX_SUGGESTIONS: usize = 3;
/// Alternatives kept in a report; the total count is always reported
const MAX_REPORTED_ALTERNATIVES: usize = 16;

/// Series matching `key`, in classification order
pub fn resolve_candidates(key: &AggregateKey, meta: &ClassificationTable) -> Vec<SeriesId> {
    meta.records()
        .iter()
        .filter(|record| key.matches(record))
        .map(|record| record.series_id.clone())
        .collect()
}

/// Labels in the classification table that look like `key` without equalling it.
/// Only used to annotate an unmatched key, never to match.
pub fn near_misses(key: &AggregateKey, meta: &ClassificationTable) -> Vec<String> {
    let wanted = key.to_string();
    let labels: BTreeSet<String> = meta
        .records()
        .iter()
        .map(|record| {
            let third = match &key.third_level {
                ThirdLevel::Any => ThirdLevel::Any,
                ThirdLevel::Exact(_) => ThirdLevel::Exact(record.third_level.clone()),
            };
            AggregateKey {
                category: record.category.clone(),
                subcategory: record.subcategory.clone(),
                third_level: third,
            }
            .to_string()
        })
        .collect();

    let mut scored: Vec<(f64, String)> = labels
        .into_iter()
        .filter(|label| *label != wanted)
        .map(|label| (strsim::jaro_winkler(&wanted, &label), label))
        .filter(|(score, _)| *score >= SUGGESTION_THRESHOLD)
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    scored
        .into_iter()
        .take(MAX_SUGGESTIONS)
        .map(|(_, label)| label)
        .collect()
}

/// True when `computed` exceeds `expected` by more than `tolerance`
pub fn is_overcounted(computed: f64, expected: f64, tolerance: f64) -> bool {
    computed - expected > tolerance
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsetMatch {
    /// Members in classification order
    pub members: Vec<SeriesId>,
    pub sum: f64,
    /// `sum - target`
    pub residual: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisStatus {
    /// Exactly one subset within tolerance
    Resolved,
    /// More than one subset within tolerance
    Ambiguous,
    /// Closest subset found, but none within tolerance
    NoSubsetWithinTolerance,
    /// Too many candidates; no search was run
    BoundExceeded,
}

/// Advisory result of a subset search for one key at one date
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbiguityReport {
    pub key: AggregateKey,
    pub date: TimePoint,
    pub target: f64,
    pub tolerance: f64,
    pub status: DiagnosisStatus,
    /// Candidates with a value at `date`, searched
    pub candidates: Vec<SeriesId>,
    /// Candidates missing at `date`, not searched
    pub unavailable: Vec<SeriesId>,
    /// Sum over all searched candidates
    pub full_sum: f64,
    pub best: Option<SubsetMatch>,
    /// Candidates outside the best subset: probable duplicate classification
    pub excluded: Vec<SeriesId>,
    /// Subsets within tolerance (capped); see `matches_within_tolerance`
    pub alternatives: Vec<SubsetMatch>,
    pub matches_within_tolerance: usize,
}

impl AmbiguityReport {
    pub fn is_ambiguous(&self) -> bool {
        self.status == DiagnosisStatus::Ambiguous
    }
}

pub struct Matcher<'a> {
    meta: &'a ClassificationTable,
    subset_search_bound: usize,
    tolerance: f64,
}

impl<'a> Matcher<'a> {
    pub fn new(meta: &'a ClassificationTable, subset_search_bound: usize, tolerance: f64) -> Self {
        Self {
            meta,
            subset_search_bound,
            tolerance,
        }
    }

    pub fn resolve_candidates(&self, key: &AggregateKey) -> Vec<SeriesId> {
        resolve_candidates(key, self.meta)
    }

    /// Search subsets of `candidates` for the one whose sum at `date` is
    /// closest to `target`.
    ///
    /// Ties go to the smaller subset, then to the earlier one in
    /// classification order. Candidates missing at `date` are left out of
    /// the search and listed as unavailable.
    pub fn diagnose(
        &self,
        key: &AggregateKey,
        candidates: &[SeriesId],
        normalized: &SeriesTable,
        date: TimePoint,
        target: f64,
    ) -> AmbiguityReport {
        let mut ordered: Vec<&SeriesId> = candidates.iter().collect();
        ordered.sort_by_key(|id| self.meta.position(id).unwrap_or(usize::MAX));
        ordered.dedup();

        let mut available: Vec<(SeriesId, f64)> = Vec::new();
        let mut unavailable = Vec::new();
        for id in ordered {
            match normalized.get(id, date) {
                Some(value) => available.push((id.clone(), value)),
                None => unavailable.push(id.clone()),
            }
        }

        let full_sum: f64 = available.iter().map(|(_, v)| v).sum();
        let searched: Vec<SeriesId> = available.iter().map(|(id, _)| id.clone()).collect();

        let mut report = AmbiguityReport {
            key: key.clone(),
            date,
            target,
            tolerance: self.tolerance,
            status: DiagnosisStatus::BoundExceeded,
            candidates: searched.clone(),
            unavailable,
            full_sum,
            best: None,
            excluded: Vec::new(),
            alternatives: Vec::new(),
            matches_within_tolerance: 0,
        };

        if available.len() > self.subset_search_bound {
            debug!(
                "{}: {} candidates exceed bound {}, skipping search",
                key,
                available.len(),
                self.subset_search_bound
            );
            return report;
        }

        let mut best: Option<(Vec<usize>, f64)> = None;
        let mut within = 0usize;
        let mut alternatives = Vec::new();

        // powerset yields subsets by increasing size, lexicographic within a size,
        // so keeping the first strictly-better subset implements the tie-break
        for subset in (0..available.len()).powerset() {
            let sum: f64 = subset.iter().map(|&i| available[i].1).sum();
            let residual = sum - target;

            if residual.abs() <= self.tolerance {
                within += 1;
                if alternatives.len() < MAX_REPORTED_ALTERNATIVES {
                    alternatives.push(self.subset_match(&available, &subset, sum, residual));
                }
            }

            let better = match &best {
                Some((_, best_sum)) => residual.abs() < (best_sum - target).abs(),
                None => true,
            };
            if better {
                best = Some((subset, sum));
            }
        }

        if let Some((subset, sum)) = best {
            let chosen: BTreeSet<usize> = subset.iter().copied().collect();
            report.excluded = (0..available.len())
                .filter(|i| !chosen.contains(i))
                .map(|i| available[i].0.clone())
                .collect();
            report.best = Some(self.subset_match(&available, &subset, sum, sum - target));
        }

        report.status = match within {
            0 => DiagnosisStatus::NoSubsetWithinTolerance,
            1 => DiagnosisStatus::Resolved,
            _ => DiagnosisStatus::Ambiguous,
        };
        report.alternatives = alternatives;
        report.matches_within_tolerance = within;
        report
    }

    fn subset_match(
        &self,
        available: &[(SeriesId, f64)],
        subset: &[usize],
        sum: f64,
        residual: f64,
    ) -> SubsetMatch {
        SubsetMatch {
            members: subset.iter().map(|&i| available[i].0.clone()).collect(),
            sum,
            residual,
        }
    }
}
