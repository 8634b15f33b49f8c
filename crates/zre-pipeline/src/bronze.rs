//! Raw capture: query the listings API per category/region and append what comes back.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{error, info, warn};
use zre_core::EndpointDescriptor;
use zre_storage::{ListingSource, Warehouse, WarehouseConnector};
use zre_telemetry::Telemetry;

pub const TASK: &str = "bronze";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BronzeReport {
    pub endpoints: usize,
    pub fetch_failures: usize,
    pub write_failures: usize,
    pub records_fetched: usize,
    pub rows_appended: usize,
}

/// Result of one endpoint query. A failed query carries no documents.
#[derive(Debug, Clone, Default)]
pub struct Fetched {
    pub documents: Vec<JsonValue>,
    pub failed: bool,
}

/// Query one endpoint; transient and HTTP failures degrade to zero records.
pub async fn fetch_or_empty(source: &dyn ListingSource, endpoint: &EndpointDescriptor) -> Fetched {
    match source.fetch_listings(endpoint).await {
        Ok(documents) => {
            info!(
                category = %endpoint.category,
                region = %endpoint.region,
                records = documents.len(),
                "fetched {} listings",
                documents.len()
            );
            Fetched {
                documents,
                failed: false,
            }
        }
        Err(err) => {
            error!(
                category = %endpoint.category,
                region = %endpoint.region,
                error = %err,
                "failed to fetch listings; treating as zero records"
            );
            Fetched {
                documents: Vec::new(),
                failed: true,
            }
        }
    }
}

/// Run the raw-capture stage over `endpoints` on a fresh connection.
pub async fn run_bronze<C: WarehouseConnector>(
    connector: &C,
    source: &dyn ListingSource,
    endpoints: &[EndpointDescriptor],
    telemetry: &Telemetry,
) -> Result<BronzeReport> {
    telemetry
        .run_task(TASK, async {
            let mut conn = connector
                .connect()
                .await
                .context("connecting to warehouse for bronze")?;
            let outcome = ingest(&mut conn, source, endpoints).await;
            let closed = conn.close().await;
            let report = outcome?;
            closed.context("closing bronze connection")?;

            telemetry.count(TASK, "records_fetched", report.records_fetched);
            telemetry.count(TASK, "fetch_failures", report.fetch_failures);
            telemetry.count(TASK, "raw_rows_appended", report.rows_appended);
            telemetry.count(TASK, "raw_write_failures", report.write_failures);
            info!(
                endpoints = report.endpoints,
                fetch_failures = report.fetch_failures,
                rows_appended = report.rows_appended,
                "bronze ingestion complete"
            );
            Ok(report)
        })
        .await
}

async fn ingest<W: Warehouse>(
    conn: &mut W,
    source: &dyn ListingSource,
    endpoints: &[EndpointDescriptor],
) -> Result<BronzeReport> {
    let mut report = BronzeReport {
        endpoints: endpoints.len(),
        ..Default::default()
    };

    for endpoint in endpoints {
        let fetched = fetch_or_empty(source, endpoint).await;
        if fetched.failed {
            report.fetch_failures += 1;
            continue;
        }

        let table = endpoint.raw_table();
        report.records_fetched += fetched.documents.len();
        if fetched.documents.is_empty() {
            warn!(table = %table, "no data to insert into {table}");
            continue;
        }

        let documents: Vec<String> = fetched.documents.iter().map(JsonValue::to_string).collect();
        let written = match conn.ensure_raw_table(&table).await {
            Ok(()) => conn.append_raw(&table, &documents).await,
            Err(err) => Err(err),
        };
        match written {
            Ok(rows) => {
                info!(table = %table, rows, "inserted {rows} rows into {table}");
                report.rows_appended += rows;
            }
            Err(err) if err.is_connection_lost() => {
                return Err(err).with_context(|| format!("writing raw rows to {table}"));
            }
            Err(err) => {
                error!(table = %table, error = %err, "error inserting data into {table}");
                report.write_failures += 1;
            }
        }
    }

    Ok(report)
}
