pub mod aggregator;
pub mod config;
pub mod diagnostics;
pub mod diff;
pub mod drilldown;
pub mod error;
pub mod matcher;
pub mod metadata;
pub mod normalizer;
pub mod output;
pub mod rca;
pub mod series;
pub mod source;
pub mod time;

pub use aggregator::{AggregateKey, AggregateTable, Aggregator, ReferenceTable, ThirdLevel};
pub use config::{MissingFactorPolicy, ReconConfig};
pub use diagnostics::{Diagnostic, DiagnosticLog};
pub use diff::{Discrepancy, DiscrepancyReport, HierarchyRule, Reconciler};
pub use error::{ReconError, Result};
pub use matcher::{AmbiguityReport, Matcher};
pub use metadata::{ClassificationTable, SeriesMetadata};
pub use normalizer::Normalizer;
pub use rca::{ReconciliationEngine, RunInputs, RunPlan, RunReport};
pub use series::SeriesTable;
