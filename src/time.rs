//! Calendar preprocessing
//!
//! Date-axis adjustments applied around the core pipeline: leap-day removal
//! and short-gap interpolation on normalized series, common-end truncation,
//! monthly resampling and year-over-year change on aggregate tables.

use crate::aggregator::{AggregateSeries, AggregateTable};
use crate::series::{SeriesTable, TimePoint, Value};
use chrono::Datelike;
use std::collections::BTreeMap;
use tracing::debug;

pub fn is_leap_day(date: &TimePoint) -> bool {
    date.month() == 2 && date.day() == 29
}

/// Copy of `table` without 29 February
pub fn drop_leap_days(table: &SeriesTable) -> SeriesTable {
    table.filter_dates(|date| !is_leap_day(date))
}

/// Linearly interpolate interior gaps, filling at most `limit` consecutive
/// missing dates per gap (the first ones). Leading and trailing gaps are
/// never filled. The last date is left out entirely: it stays as reported
/// and never anchors a gap before it. Interpolation is by position on the
/// date axis, not by calendar distance.
pub fn interpolate_gaps(table: &SeriesTable, limit: usize) -> SeriesTable {
    let mut out = SeriesTable::new();
    out.extend_dates(table.dates().iter().copied());

    for series_id in table.series_ids() {
        let Some(column) = table.aligned(series_id) else {
            continue;
        };
        let (dates, mut values): (Vec<TimePoint>, Vec<Value>) = column.into_iter().unzip();
        let settled = values.len().saturating_sub(1);
        let filled = fill_interior(&mut values[..settled], limit);
        if filled > 0 {
            debug!("{}: interpolated {} values", series_id, filled);
        }
        out.insert_series(series_id, dates.into_iter().zip(values));
    }
    out
}

fn fill_interior(values: &mut [Value], limit: usize) -> usize {
    let mut filled = 0;
    let mut last_present: Option<usize> = None;

    for idx in 0..values.len() {
        let Some(end_value) = values[idx] else {
            continue;
        };
        if let Some(start) = last_present {
            let gap = idx - start - 1;
            if gap > 0 {
                if let Some(start_value) = values[start] {
                    let step = (end_value - start_value) / (gap + 1) as f64;
                    for offset in 1..=gap.min(limit) {
                        values[start + offset] = Some(start_value + step * offset as f64);
                        filled += 1;
                    }
                }
            }
        }
        last_present = Some(idx);
    }
    filled
}

/// Cut the date axis at the earliest "last present date" across aggregates.
/// Columns with no present value at all do not constrain the cut.
pub fn truncate_to_last_common_date(table: &AggregateTable) -> AggregateTable {
    let cutoff = table
        .iter()
        .filter_map(|series| {
            series
                .values
                .iter()
                .rposition(|v| v.is_some())
                .map(|idx| table.dates()[idx])
        })
        .min();

    match cutoff {
        Some(cutoff) => {
            debug!("truncating aggregates after {}", cutoff);
            table.restrict_dates(|date| *date <= cutoff)
        }
        None => table.clone(),
    }
}

fn month_end(date: TimePoint) -> TimePoint {
    let mut end = date;
    while let Some(next) = end.succ_opt() {
        if next.month() != date.month() {
            break;
        }
        end = next;
    }
    end
}

/// Calendar-month means, dated on the last day of each month. Missing
/// values are skipped; a month with no present value is missing.
pub fn monthly_means(table: &AggregateTable) -> AggregateTable {
    let mut months: BTreeMap<TimePoint, Vec<usize>> = BTreeMap::new();
    for (idx, date) in table.dates().iter().enumerate() {
        months.entry(month_end(*date)).or_default().push(idx);
    }

    let mut out = AggregateTable::new(months.keys().copied().collect());
    for series in table.iter() {
        let values = months
            .values()
            .map(|indices| {
                let present: Vec<f64> = indices.iter().filter_map(|&i| series.values.get(i).copied().flatten()).collect();
                if present.is_empty() {
                    None
                } else {
                    Some(present.iter().sum::<f64>() / present.len() as f64)
                }
            })
            .collect();
        out.insert(AggregateSeries {
            key: series.key.clone(),
            provenance: series.provenance.clone(),
            values,
        });
    }
    out
}

/// Change against the value `lag` rows earlier (12 on a monthly table)
#[derive(Debug, Clone, PartialEq)]
pub struct YearOverYear {
    /// `x - x[lag]`
    pub absolute: AggregateTable,
    /// `(x / x[lag] - 1) * 100`, missing when the base is zero
    pub percent: AggregateTable,
}

/// Positional year-over-year change. The first `lag` rows and any row where
/// either side is missing come out missing.
pub fn year_over_year(table: &AggregateTable, lag: usize) -> YearOverYear {
    let dates = table.dates().to_vec();
    let mut absolute = AggregateTable::new(dates.clone());
    let mut percent = AggregateTable::new(dates);

    for series in table.iter() {
        let pairs: Vec<(Value, Value)> = (0..series.values.len())
            .map(|idx| {
                let current = series.values[idx];
                let base = idx.checked_sub(lag).and_then(|b| series.values[b]);
                (current, base)
            })
            .collect();

        absolute.insert(AggregateSeries {
            key: series.key.clone(),
            provenance: series.provenance.clone(),
            values: pairs
                .iter()
                .map(|&(current, base)| Some(current? - base?))
                .collect(),
        });
        percent.insert(AggregateSeries {
            key: series.key.clone(),
            provenance: series.provenance.clone(),
            values: pairs
                .iter()
                .map(|&(current, base)| {
                    let base = base.filter(|b| *b != 0.0)?;
                    Some((current? / base - 1.0) * 100.0)
                })
                .collect(),
        });
    }
    debug!("year-over-year change over {} keys (lag {})", table.len(), lag);
    YearOverYear { absolute, percent }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{AggregateKey, Provenance};
    use chrono::NaiveDate;

    fn ymd(y: i32, m: u32, d: u32) -> TimePoint {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn aggregate(key: &AggregateKey, values: Vec<Value>) -> AggregateSeries {
        AggregateSeries {
            key: key.clone(),
            provenance: Provenance::Matched {
                members: vec![],
                excluded: vec![],
            },
            values,
        }
    }

    #[test]
    fn test_drop_leap_days() {
        let mut table = SeriesTable::new();
        table.insert_series(
            "A",
            vec![(ymd(2024, 2, 28), Some(1.0)), (ymd(2024, 2, 29), Some(2.0)), (ymd(2024, 3, 1), Some(3.0))],
        );
        let dropped = drop_leap_days(&table);
        assert_eq!(dropped.height(), 2);
        assert_eq!(dropped.get("A", ymd(2024, 2, 29)), None);
        assert_eq!(dropped.get("A", ymd(2024, 3, 1)), Some(3.0));
    }

    #[test]
    fn test_interpolation_respects_limit_and_edges() {
        let mut values = vec![None, Some(0.0), None, Some(2.0), None, None, None, Some(8.0), None];
        let filled = fill_interior(&mut values, 2);
        assert_eq!(filled, 3);
        assert_eq!(
            values,
            vec![None, Some(0.0), Some(1.0), Some(2.0), Some(3.5), Some(5.0), None, Some(8.0), None]
        );
    }

    #[test]
    fn test_interpolate_gaps_on_table() {
        let mut table = SeriesTable::new();
        table.insert_series(
            "A",
            vec![
                (ymd(2024, 1, 1), Some(1.0)),
                (ymd(2024, 1, 2), None),
                (ymd(2024, 1, 3), Some(3.0)),
                (ymd(2024, 1, 4), Some(5.0)),
            ],
        );
        let out = interpolate_gaps(&table, 2);
        assert_eq!(out.get("A", ymd(2024, 1, 2)), Some(2.0));
        assert_eq!(out.get("A", ymd(2024, 1, 4)), Some(5.0));
    }

    #[test]
    fn test_last_date_never_anchors_a_gap() {
        let mut table = SeriesTable::new();
        table.insert_series(
            "A",
            vec![(ymd(2024, 1, 1), Some(1.0)), (ymd(2024, 1, 2), None), (ymd(2024, 1, 3), Some(3.0))],
        );
        let out = interpolate_gaps(&table, 2);
        assert_eq!(out.get("A", ymd(2024, 1, 2)), None);
        assert_eq!(out.get("A", ymd(2024, 1, 3)), Some(3.0));
    }

    #[test]
    fn test_truncate_to_last_common_date() {
        let a = AggregateKey::wildcard("Demand", "A");
        let b = AggregateKey::wildcard("Demand", "B");
        let mut table = AggregateTable::new((1..=4).map(|d| ymd(2024, 1, d)).collect());
        table.insert(aggregate(&a, vec![Some(1.0), Some(1.0), Some(1.0), Some(1.0)]));
        table.insert(aggregate(&b, vec![Some(1.0), Some(1.0), None, None]));

        let cut = truncate_to_last_common_date(&table);
        assert_eq!(cut.dates(), &[ymd(2024, 1, 1), ymd(2024, 1, 2)]);
    }

    #[test]
    fn test_monthly_means_skip_missing() {
        let a = AggregateKey::wildcard("Demand", "A");
        let mut table = AggregateTable::new(vec![ymd(2024, 1, 30), ymd(2024, 1, 31), ymd(2024, 2, 1)]);
        table.insert(aggregate(&a, vec![Some(2.0), Some(4.0), None]));

        let monthly = monthly_means(&table);
        assert_eq!(monthly.dates(), &[ymd(2024, 1, 31), ymd(2024, 2, 29)]);
        assert_eq!(monthly.value(&a, ymd(2024, 1, 31)), Some(3.0));
        assert_eq!(monthly.value(&a, ymd(2024, 2, 29)), None);
    }

    #[test]
    fn test_year_over_year_change() {
        let a = AggregateKey::wildcard("Demand", "A");
        let mut table = AggregateTable::new(vec![
            ymd(2023, 1, 31),
            ymd(2023, 2, 28),
            ymd(2023, 3, 31),
            ymd(2024, 1, 31),
            ymd(2024, 2, 29),
            ymd(2024, 3, 31),
        ]);
        table.insert(aggregate(&a, vec![Some(100.0), Some(0.0), None, Some(110.0), Some(5.0), Some(7.0)]));

        let yoy = year_over_year(&table, 3);
        assert_eq!(yoy.absolute.value(&a, ymd(2023, 1, 31)), None);
        assert_eq!(yoy.absolute.value(&a, ymd(2024, 1, 31)), Some(10.0));
        assert!((yoy.percent.value(&a, ymd(2024, 1, 31)).unwrap() - 10.0).abs() < 1e-9);

        // zero base: absolute change exists, percent does not
        assert_eq!(yoy.absolute.value(&a, ymd(2024, 2, 29)), Some(5.0));
        assert_eq!(yoy.percent.value(&a, ymd(2024, 2, 29)), None);

        // missing base
        assert_eq!(yoy.absolute.value(&a, ymd(2024, 3, 31)), None);
        assert_eq!(yoy.percent.value(&a, ymd(2024, 3, 31)), None);
    }
}
