use crate::aggregator::{apply_derived, AggregateKey, AggregateTable, Aggregator, DerivedAggregate, ReferenceTable};
use crate::config::ReconConfig;
use crate::diagnostics::{Diagnostic, DiagnosticLog};
use crate::diff::{group_by_key, DiscrepancyKind, DiscrepancyReport, HierarchyReport, HierarchyRule, Reconciler};
use crate::drilldown::{DivergencePoint, DrilldownEngine};
use crate::error::{ReconError, Result};
use crate::matcher::{is_overcounted, AmbiguityReport, DiagnosisStatus, Matcher};
use crate::metadata::ClassificationTable;
use crate::normalizer::Normalizer;
use crate::series::SeriesTable;
use crate::time;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

/// Which totals to build and which structural checks to run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunPlan {
    pub aggregates: Vec<AggregateKey>,
    /// Evaluated in order after the matched aggregates
    #[serde(default)]
    pub derived: Vec<DerivedAggregate>,
    #[serde(default)]
    pub hierarchy: Vec<HierarchyRule>,
}

impl RunPlan {
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ReconError::Config(format!("Failed to read plan {}: {}", path.display(), e)))?;
        let plan: RunPlan = serde_json::from_str(&content)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Duplicate keys would silently overwrite each other
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for key in self.aggregates.iter().chain(self.derived.iter().map(|d| &d.key)) {
            if !seen.insert(key) {
                return Err(ReconError::InvalidKey(format!("'{}' is listed more than once in the plan", key)));
            }
        }
        Ok(())
    }
}

/// Everything one run consumes; read-only for the engine
pub struct RunInputs<'a> {
    pub classification: &'a ClassificationTable,
    pub raw: &'a SeriesTable,
    pub reference: Option<&'a ReferenceTable>,
    pub plan: &'a RunPlan,
}

/// Tables produced by a run plus the report
#[derive(Debug, Clone)]
pub struct RunResult {
    pub normalized: SeriesTable,
    pub aggregates: AggregateTable,
    pub report: RunReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: String,
    pub config: ReconConfig,
    pub classified_series: usize,
    pub raw_series: usize,
    pub normalized_series: usize,
    pub aggregate_keys: usize,
    pub dates: usize,
    pub diagnostics: DiagnosticLog,
    pub reconciliation: Option<DiscrepancyReport>,
    pub hierarchy: Vec<HierarchyReport>,
    /// Advisory subset searches for overcounted keys; never applied
    pub ambiguities: Vec<AmbiguityReport>,
    pub divergences: Vec<DivergencePoint>,
}

impl RunReport {
    pub fn discrepancy_count(&self) -> usize {
        self.reconciliation.as_ref().map(|r| r.discrepancies.len()).unwrap_or(0)
    }

    pub fn violation_count(&self) -> usize {
        self.hierarchy.iter().map(|h| h.violations.len()).sum()
    }
}

pub struct ReconciliationEngine {
    config: ReconConfig,
}

impl ReconciliationEngine {
    pub fn new(config: ReconConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReconConfig {
        &self.config
    }

    /// One full pass: preprocess, normalize, aggregate, reconcile, diagnose
    pub fn run(&self, inputs: &RunInputs) -> Result<RunResult> {
        self.config.validate()?;
        inputs.plan.validate()?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = chrono::Utc::now().to_rfc3339();
        info!("🚀 Run {} starting", run_id);

        let mut diagnostics = DiagnosticLog::new();
        for (series_id, rows) in inputs.classification.duplicates() {
            diagnostics.push(Diagnostic::DuplicateClassification {
                series_id: series_id.clone(),
                rows: rows.clone(),
            });
        }

        // Step 1: normalization, zero-fill included
        info!("📐 STEP 1: normalization");
        let normalized = Normalizer::new(self.config.missing_factor_policy).normalize(inputs.raw, inputs.classification);
        diagnostics.absorb(normalized.diagnostics);

        // Step 2: calendar preprocessing on the normalized table
        let normalized = self.preprocess(normalized.table);

        // Step 3: aggregation
        info!("📊 STEP 3: aggregation of {} keys", inputs.plan.aggregates.len());
        let aggregator = Aggregator::new(inputs.classification, &normalized);
        let (mut aggregates, aggregate_log) = aggregator.aggregate_all(&inputs.plan.aggregates, self.config.parallel);
        diagnostics.absorb(aggregate_log);
        apply_derived(&mut aggregates, &inputs.plan.derived)?;
        if self.config.calendar.truncate_to_last_common_date {
            aggregates = time::truncate_to_last_common_date(&aggregates);
        }

        // Step 4: reconciliation and structural checks
        let reconciler =
            Reconciler::new(self.config.tolerance).with_exact_match_epsilon(self.config.exact_match_epsilon);
        let mut hierarchy = Vec::new();
        let mut ambiguities = Vec::new();
        let mut divergences = Vec::new();

        let reconciliation = match inputs.reference {
            Some(reference) => {
                info!("🔍 STEP 4: reconciliation against {} reference keys", reference.len());
                let report = reconciler.reconcile(&aggregates, reference);
                if !inputs.plan.hierarchy.is_empty() {
                    hierarchy.push(reconciler.check_hierarchy(
                        &reference.to_aggregate_table(),
                        &inputs.plan.hierarchy,
                        "reference",
                    ));
                }

                // Step 5: root-causing, worst date per key
                info!("🧭 STEP 5: diagnosing {} discrepancies", report.discrepancies.len());
                let matcher = Matcher::new(inputs.classification, self.config.subset_search_bound, self.config.tolerance);
                let drilldown = DrilldownEngine::new(inputs.classification, &normalized, self.config.tolerance);

                for (key, discrepancies) in group_by_key(&report.discrepancies) {
                    let Some(worst) = discrepancies.first() else {
                        continue;
                    };
                    let Some(series) = aggregates.get(key) else {
                        continue;
                    };
                    let members = series.members();
                    if members.is_empty() {
                        debug!("{}: derived total, no series-level diagnosis", key);
                        continue;
                    }

                    divergences.push(drilldown.find_divergence(worst, members));

                    let overcounted = discrepancies.iter().find(|d| {
                        d.kind == DiscrepancyKind::ValueMismatch
                            && d.computed
                                .map(|c| is_overcounted(c, d.expected, self.config.tolerance))
                                .unwrap_or(false)
                    });
                    if let Some((over, computed)) = overcounted.and_then(|d| d.computed.map(|c| (d, c))) {
                        diagnostics.push(Diagnostic::OvercountedAggregateKey {
                            key: key.clone(),
                            date: over.date,
                            computed,
                            expected: over.expected,
                        });
                        let ambiguity = matcher.diagnose(key, members, &normalized, over.date, over.expected);
                        if ambiguity.status == DiagnosisStatus::BoundExceeded {
                            diagnostics.push(Diagnostic::SubsetSearchBoundExceeded {
                                key: key.clone(),
                                candidates: ambiguity.candidates.len(),
                                bound: self.config.subset_search_bound,
                            });
                        }
                        ambiguities.push(ambiguity);
                    }
                }
                Some(report)
            }
            None => {
                info!("⏭️  No reference supplied, skipping reconciliation");
                None
            }
        };

        if !inputs.plan.hierarchy.is_empty() {
            hierarchy.push(reconciler.check_hierarchy(&aggregates, &inputs.plan.hierarchy, "computed"));
        }

        let report = RunReport {
            run_id,
            started_at,
            config: self.config.clone(),
            classified_series: inputs.classification.len(),
            raw_series: inputs.raw.width(),
            normalized_series: normalized.width(),
            aggregate_keys: aggregates.len(),
            dates: aggregates.dates().len(),
            diagnostics,
            reconciliation,
            hierarchy,
            ambiguities,
            divergences,
        };
        info!(
            "✅ Run {} complete: {} discrepancies, {} hierarchy violations, {} diagnostics",
            report.run_id,
            report.discrepancy_count(),
            report.violation_count(),
            report.diagnostics.len()
        );

        Ok(RunResult {
            normalized,
            aggregates,
            report,
        })
    }

    /// Interpolation runs before leap days are dropped, so 29 February
    /// still anchors its neighbours
    fn preprocess(&self, normalized: SeriesTable) -> SeriesTable {
        let calendar = &self.config.calendar;
        let mut table = normalized;
        if let Some(limit) = calendar.interpolation_limit {
            info!("📅 STEP 2: interpolating gaps of up to {} dates", limit);
            table = time::interpolate_gaps(&table, limit);
        }
        if calendar.drop_leap_days {
            info!("📅 STEP 2: dropping 29 February");
            table = time::drop_leap_days(&table);
        }
        table
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Reconciliation run {}", self.run_id)?;
        writeln!(
            f,
            "Series: {} classified | {} raw | {} normalized",
            self.classified_series, self.raw_series, self.normalized_series
        )?;
        writeln!(f, "Aggregates: {} keys over {} dates", self.aggregate_keys, self.dates)?;
        writeln!(f, "Tolerance: {}", self.config.tolerance)?;

        writeln!(f, "\n=== Diagnostics ({}) ===", self.diagnostics.len())?;
        for diagnostic in self.diagnostics.entries() {
            writeln!(f, "- [{}] {}", diagnostic.kind(), diagnostic)?;
        }

        if let Some(reconciliation) = &self.reconciliation {
            let summary = &reconciliation.summary;
            writeln!(f, "\n=== Reconciliation ===")?;
            writeln!(
                f,
                "Checked: {} | Exact: {} | Discrepancies: {} | Computed missing: {}",
                summary.checked, summary.exact_matches, summary.discrepancies, summary.computed_missing
            )?;
            if let (Some(mean), Some(mean_abs)) = (summary.mean_difference, summary.mean_abs_difference) {
                writeln!(f, "Mean diff: {:.4} | Mean |diff|: {:.4}", mean, mean_abs)?;
            }
            if let Some(pattern) = summary.pattern {
                writeln!(f, "Error pattern: {:?}", pattern)?;
            }
            for discrepancy in reconciliation.discrepancies.iter().take(20) {
                match discrepancy.difference {
                    Some(difference) => writeln!(
                        f,
                        "  {} @ {}: computed {:.4} vs expected {:.4} (diff {:+.4})",
                        discrepancy.key,
                        discrepancy.date,
                        discrepancy.computed.unwrap_or(f64::NAN),
                        discrepancy.expected,
                        difference
                    )?,
                    None => writeln!(
                        f,
                        "  {} @ {}: computed missing, expected {:.4}",
                        discrepancy.key, discrepancy.date, discrepancy.expected
                    )?,
                }
            }
            if reconciliation.discrepancies.len() > 20 {
                writeln!(f, "  ... {} more", reconciliation.discrepancies.len() - 20)?;
            }
            if !reconciliation.unchecked_keys.is_empty() {
                writeln!(f, "Unchecked keys: {}", reconciliation.unchecked_keys.len())?;
            }
        }

        for check in &self.hierarchy {
            writeln!(f, "\n=== Hierarchy ({}) ===", check.source)?;
            writeln!(f, "Checked: {} | Violations: {}", check.checked, check.violations.len())?;
            for violation in check.violations.iter().take(10) {
                writeln!(
                    f,
                    "  {} @ {}: parent {:.4} vs children {:.4}",
                    violation.parent, violation.date, violation.parent_value, violation.children_sum
                )?;
            }
        }

        if !self.ambiguities.is_empty() {
            writeln!(f, "\n=== Ambiguity (advisory) ===")?;
            for ambiguity in &self.ambiguities {
                write!(f, "  {} @ {}: {:?}", ambiguity.key, ambiguity.date, ambiguity.status)?;
                if let Some(best) = &ambiguity.best {
                    write!(f, " best {:?} (residual {:+.4})", best.members, best.residual)?;
                }
                if !ambiguity.excluded.is_empty() {
                    write!(f, " probable duplicates {:?}", ambiguity.excluded)?;
                }
                writeln!(f)?;
            }
        }

        let explained: Vec<&DivergencePoint> = self.divergences.iter().filter(|d| d.is_explained()).collect();
        if !explained.is_empty() {
            writeln!(f, "\n=== Divergence Points ===")?;
            for point in explained {
                writeln!(f, "  {} @ {}", point.key, point.date)?;
                if !point.missing_members.is_empty() {
                    writeln!(f, "    missing: {:?}", point.missing_members)?;
                }
                for removal in &point.removals {
                    writeln!(f, "    remove {} ({:.4})", removal.series_id, removal.value)?;
                }
                for addition in &point.additions {
                    writeln!(f, "    add {} ({:.4})", addition.series_id, addition.value)?;
                }
            }
        }

        Ok(())
    }
}
