//! Per-state aggregation of canonical listings into the summary tables.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;
use zre_core::{CanonicalListing, Category, StateSummary};
use zre_storage::{Warehouse, WarehouseConnector};
use zre_telemetry::Telemetry;

pub const TASK: &str = "gold";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GoldReport {
    pub sales_summary_rows: usize,
    pub rentals_summary_rows: usize,
}

#[derive(Debug, Default)]
struct Mean {
    sum: f64,
    n: u32,
}

impl Mean {
    fn push(&mut self, value: Option<f64>) {
        if let Some(v) = value {
            self.sum += v;
            self.n += 1;
        }
    }

    fn value(&self) -> Option<f64> {
        (self.n > 0).then(|| self.sum / f64::from(self.n))
    }
}

#[derive(Debug, Default)]
struct Accumulator {
    total: i64,
    price: Mean,
    bedrooms: Mean,
    bathrooms: Mean,
    sqft: Mean,
}

/// Group priced listings by state. Listings without a price are not counted anywhere;
/// other null columns only drop out of their own average. Output is ordered by state with
/// the null-state group first.
pub fn summarize(listings: &[CanonicalListing]) -> Vec<StateSummary> {
    let mut groups: BTreeMap<Option<&str>, Accumulator> = BTreeMap::new();
    for listing in listings.iter().filter(|l| l.price.is_some()) {
        let acc = groups.entry(listing.state.as_deref()).or_default();
        acc.total += 1;
        acc.price.push(listing.price);
        acc.bedrooms.push(listing.bedrooms.map(f64::from));
        acc.bathrooms.push(listing.bathrooms);
        acc.sqft.push(listing.sqft.map(f64::from));
    }

    groups
        .into_iter()
        .map(|(state, acc)| StateSummary {
            state: state.map(str::to_string),
            total_listings: acc.total,
            avg_price: acc.price.value(),
            avg_bedrooms: acc.bedrooms.value(),
            avg_bathrooms: acc.bathrooms.value(),
            avg_sqft: acc.sqft.value(),
        })
        .collect()
}

/// Recompute both summary tables from the canonical tables on a fresh connection.
pub async fn run_gold<C: WarehouseConnector>(connector: &C, telemetry: &Telemetry) -> Result<GoldReport> {
    telemetry
        .run_task(TASK, async {
            let mut conn = connector
                .connect()
                .await
                .context("connecting to warehouse for gold")?;
            let outcome = aggregate_all(&mut conn, telemetry).await;
            let closed = conn.close().await;
            let report = outcome?;
            closed.context("closing gold connection")?;
            Ok(report)
        })
        .await
}

async fn aggregate_all<W: Warehouse>(conn: &mut W, telemetry: &Telemetry) -> Result<GoldReport> {
    conn.ensure_derived_schema()
        .await
        .context("creating canonical and summary tables")?;

    let mut report = GoldReport::default();
    for category in Category::ALL {
        let source = category.canonical_table();
        let target = category.summary_table();
        let listings = conn
            .load_listings(category)
            .await
            .with_context(|| format!("loading {source}"))?;
        let summaries = summarize(&listings);
        let written = conn
            .replace_summaries(category, &summaries)
            .await
            .with_context(|| format!("replacing {target}"))?;

        info!(table = target, listings = listings.len(), "aggregated {written} state rows into {target}");
        telemetry.row_count(target, &summaries);
        telemetry.count(target, "summary_rows", written);
        match category {
            Category::Sale => report.sales_summary_rows = written,
            Category::Rental => report.rentals_summary_rows = written,
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(state: Option<&str>, price: Option<f64>, bedrooms: Option<i32>) -> CanonicalListing {
        CanonicalListing {
            state: state.map(str::to_string),
            price,
            bedrooms,
            bathrooms: Some(2.0),
            sqft: Some(1000),
            ..Default::default()
        }
    }

    #[test]
    fn groups_by_state_and_skips_unpriced_rows() {
        let rows = vec![
            listing(Some("TX"), Some(100.0), Some(2)),
            listing(Some("TX"), Some(300.0), None),
            listing(Some("TX"), None, Some(9)),
            listing(Some("CA"), Some(50.0), Some(1)),
        ];
        let summaries = summarize(&rows);
        assert_eq!(summaries.len(), 2);

        let ca = &summaries[0];
        assert_eq!(ca.state.as_deref(), Some("CA"));
        assert_eq!(ca.total_listings, 1);

        let tx = &summaries[1];
        assert_eq!(tx.total_listings, 2);
        assert_eq!(tx.avg_price, Some(200.0));
        assert_eq!(tx.avg_bedrooms, Some(2.0));
        assert_eq!(tx.avg_sqft, Some(1000.0));
    }

    #[test]
    fn null_state_is_its_own_group_and_sorts_first() {
        let rows = vec![
            listing(Some("AK"), Some(10.0), None),
            listing(None, Some(20.0), None),
        ];
        let summaries = summarize(&rows);
        assert_eq!(summaries[0].state, None);
        assert_eq!(summaries[0].avg_bedrooms, None);
        assert_eq!(summaries[1].state.as_deref(), Some("AK"));
    }

    #[test]
    fn empty_input_has_no_groups() {
        assert!(summarize(&[]).is_empty());
        assert!(summarize(&[listing(Some("TX"), None, Some(3))]).is_empty());
    }
}
