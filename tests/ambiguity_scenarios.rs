use balance_recon::aggregator::{AggregateKey, ReferenceTable};
use balance_recon::config::ReconConfig;
use balance_recon::matcher::{DiagnosisStatus, Matcher};
use balance_recon::metadata::{ClassificationTable, SeriesMetadata};
use balance_recon::rca::{ReconciliationEngine, RunInputs, RunPlan};
use balance_recon::series::{SeriesTable, TimePoint};
use chrono::NaiveDate;

fn date() -> TimePoint {
    NaiveDate::from_ymd_opt(2023, 11, 15).unwrap()
}

/// Five Norway→Europe candidates; only B + D reproduces 11.05
fn five_candidates() -> (ClassificationTable, SeriesTable) {
    let values = [("A", 1.3), ("B", 2.9), ("C", 4.7), ("D", 8.15), ("E", 11.6)];
    let classification = ClassificationTable::from_records(
        values
            .iter()
            .map(|(id, _)| SeriesMetadata {
                series_id: id.to_string(),
                description: None,
                category: "Import".to_string(),
                subcategory: "Norway".to_string(),
                third_level: "Europe".to_string(),
                normalization_factor: Some(1.0),
                zero_fill: false,
            })
            .collect(),
    )
    .unwrap();

    let mut normalized = SeriesTable::new();
    for (id, value) in values {
        normalized.insert(id, date(), Some(value));
    }
    (classification, normalized)
}

#[test]
fn test_single_size_two_subset_is_found() {
    println!("\n🧪 Subset search over 5 candidates");
    let (classification, normalized) = five_candidates();
    let matcher = Matcher::new(&classification, 20, 0.01);
    let key = AggregateKey::new("Import", "Norway", "Europe");
    let candidates = matcher.resolve_candidates(&key);
    assert_eq!(candidates.len(), 5);

    let report = matcher.diagnose(&key, &candidates, &normalized, date(), 11.05);

    assert_eq!(report.status, DiagnosisStatus::Resolved);
    let best = report.best.as_ref().unwrap();
    assert_eq!(best.members, vec!["B".to_string(), "D".to_string()]);
    assert!(best.residual.abs() <= 0.01);
    assert_eq!(report.excluded, vec!["A".to_string(), "C".to_string(), "E".to_string()]);
    assert_eq!(report.matches_within_tolerance, 1);
    assert!((report.full_sum - 28.65).abs() < 1e-9);
    println!("✅ best {:?}, probable duplicates {:?}", best.members, report.excluded);
}

#[test]
fn test_engine_surfaces_overcount_without_correcting_it() {
    let (classification, normalized) = five_candidates();
    let key = AggregateKey::new("Import", "Norway", "Europe");
    let mut reference = ReferenceTable::new();
    reference.insert(key.clone(), date(), 11.05);
    let plan = RunPlan {
        aggregates: vec![key.clone()],
        ..RunPlan::default()
    };

    let mut config = ReconConfig::default();
    config.tolerance = 0.01;
    let result = ReconciliationEngine::new(config)
        .run(&RunInputs {
            classification: &classification,
            raw: &normalized,
            reference: Some(&reference),
            plan: &plan,
        })
        .unwrap();

    let computed = result.aggregates.value(&key, date()).unwrap();
    assert!((computed - 28.65).abs() < 1e-9);
    assert_eq!(result.report.diagnostics.of_kind("overcounted_aggregate_key").len(), 1);
    assert_eq!(result.report.ambiguities.len(), 1);
    assert_eq!(
        result.report.ambiguities[0].excluded,
        vec!["A".to_string(), "C".to_string(), "E".to_string()]
    );
}

#[test]
fn test_bound_exceeded_is_reported_not_searched() {
    let (classification, normalized) = five_candidates();
    let key = AggregateKey::new("Import", "Norway", "Europe");
    let mut reference = ReferenceTable::new();
    reference.insert(key.clone(), date(), 11.05);
    let plan = RunPlan {
        aggregates: vec![key.clone()],
        ..RunPlan::default()
    };

    let mut config = ReconConfig::default();
    config.subset_search_bound = 4;
    let result = ReconciliationEngine::new(config)
        .run(&RunInputs {
            classification: &classification,
            raw: &normalized,
            reference: Some(&reference),
            plan: &plan,
        })
        .unwrap();

    let bound = result.report.diagnostics.of_kind("subset_search_bound_exceeded");
    assert_eq!(bound.len(), 1);
    assert_eq!(result.report.ambiguities[0].status, DiagnosisStatus::BoundExceeded);
    assert!(result.report.ambiguities[0].best.is_none());
}
