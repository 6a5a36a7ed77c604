//! Export of run results: the aggregate table as wide CSV (one column per
//! key label) and the run report as JSON.

use crate::aggregator::AggregateTable;
use crate::error::Result;
use crate::rca::RunReport;
use crate::source::DATE_COLUMN;
use polars::prelude::*;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::info;

/// Wide frame: the date column, then one Float64 column per aggregate key
pub fn aggregates_to_frame(table: &AggregateTable) -> Result<DataFrame> {
    let dates: Vec<String> = table.dates().iter().map(|d| d.format("%Y-%m-%d").to_string()).collect();
    let mut columns = vec![Series::new(DATE_COLUMN, dates)];
    for series in table.iter() {
        columns.push(Series::new(&series.key.to_string(), series.values.clone()));
    }
    Ok(DataFrame::new(columns)?)
}

pub fn write_aggregates_csv(table: &AggregateTable, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let mut df = aggregates_to_frame(table)?;
    let mut file = File::create(path)?;
    CsvWriter::new(&mut file)
        .include_header(true)
        .with_separator(b',')
        .finish(&mut df)?;
    info!("💾 Wrote {} aggregates to {}", table.len(), path.display());
    Ok(())
}

pub fn write_report_json(report: &RunReport, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, report)?;
    info!("💾 Wrote report {} to {}", report.run_id, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{AggregateKey, AggregateSeries, Provenance};
    use chrono::NaiveDate;

    #[test]
    fn test_aggregates_frame_keeps_missing_as_null() {
        let key = AggregateKey::wildcard("Demand", "Italy");
        let mut table = AggregateTable::new(vec![
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
        ]);
        table.insert(AggregateSeries {
            key,
            provenance: Provenance::Matched {
                members: vec!["A".to_string()],
                excluded: vec![],
            },
            values: vec![Some(30.0), None],
        });

        let df = aggregates_to_frame(&table).unwrap();
        assert_eq!(df.shape(), (2, 2));
        let column = df.column("Demand / Italy / *").unwrap().f64().unwrap();
        assert_eq!(column.get(0), Some(30.0));
        assert_eq!(column.null_count(), 1);
    }
}
