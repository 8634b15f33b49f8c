//! Canonicalization: project every raw document onto the fixed listing schema and
//! replace each canonical table wholesale.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};
use zre_core::{CanonicalListing, Category};
use zre_storage::{Warehouse, WarehouseConnector};
use zre_telemetry::Telemetry;

pub const TASK: &str = "silver";

#[derive(Debug, Error, PartialEq)]
pub enum ProjectionError {
    #[error("raw document is not valid JSON: {0}")]
    Malformed(String),
    #[error("raw document is {0}, expected an object")]
    NotAnObject(&'static str),
    #[error("raw document is empty")]
    Empty,
    #[error("field {field}: cannot store {found} as {expected}")]
    Coercion {
        field: &'static str,
        expected: &'static str,
        found: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CategoryCounts {
    pub raw_tables: usize,
    pub rows_read: usize,
    pub rows_transformed: usize,
    pub rows_skipped: usize,
    pub rows_inserted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SilverReport {
    pub sales: CategoryCounts,
    pub rentals: CategoryCounts,
}

impl SilverReport {
    pub fn for_category(&self, category: Category) -> &CategoryCounts {
        match category {
            Category::Sale => &self.sales,
            Category::Rental => &self.rentals,
        }
    }

    fn slot(&mut self, category: Category) -> &mut CategoryCounts {
        match category {
            Category::Sale => &mut self.sales,
            Category::Rental => &mut self.rentals,
        }
    }
}

fn kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn describe(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => format!("string {s:?}"),
        JsonValue::Number(n) => format!("number {n}"),
        other => kind(other).to_string(),
    }
}

fn coercion(field: &'static str, expected: &'static str, value: &JsonValue) -> ProjectionError {
    ProjectionError::Coercion {
        field,
        expected,
        found: describe(value),
    }
}

/// Strings containing NUL are rejected; Postgres TEXT cannot store them.
fn text(doc: &Map<String, JsonValue>, field: &'static str) -> Result<Option<String>, ProjectionError> {
    match doc.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) if s.contains('\0') => Err(ProjectionError::Coercion {
            field,
            expected: "text",
            found: "string containing NUL".to_string(),
        }),
        Some(JsonValue::String(s)) => Ok(Some(s.clone())),
        Some(JsonValue::Number(n)) => Ok(Some(n.to_string())),
        Some(JsonValue::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(coercion(field, "text", other)),
    }
}

fn decimal(doc: &Map<String, JsonValue>, field: &'static str) -> Result<Option<f64>, ProjectionError> {
    let value = match doc.get(field) {
        None | Some(JsonValue::Null) => return Ok(None),
        Some(value) => value,
    };
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(coercion(field, "decimal", value)),
    }
}

fn integer(doc: &Map<String, JsonValue>, field: &'static str) -> Result<Option<i32>, ProjectionError> {
    let value = match doc.get(field) {
        None | Some(JsonValue::Null) => return Ok(None),
        Some(value) => value,
    };
    let wide = match value {
        JsonValue::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64)),
        JsonValue::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    wide.and_then(|v| i32::try_from(v).ok())
        .map(Some)
        .ok_or_else(|| coercion(field, "integer", value))
}

fn timestamp(
    doc: &Map<String, JsonValue>,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, ProjectionError> {
    let value = match doc.get(field) {
        None | Some(JsonValue::Null) => return Ok(None),
        Some(value) => value,
    };
    let JsonValue::String(raw) = value else {
        return Err(coercion(field, "timestamp", value));
    };
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(Some(naive.and_utc()));
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Some(naive.and_utc()))
        .ok_or_else(|| coercion(field, "timestamp", value))
}

/// Project one parsed listing document. Missing fields become `None`; values that do not
/// fit their column type reject the whole document.
pub fn project_listing(doc: &JsonValue, category: Category) -> Result<CanonicalListing, ProjectionError> {
    let JsonValue::Object(doc) = doc else {
        return Err(ProjectionError::NotAnObject(kind(doc)));
    };
    if doc.is_empty() {
        return Err(ProjectionError::Empty);
    }

    let listing_office = match doc.get("listingOffice") {
        Some(JsonValue::Object(office)) => text(office, "name")?,
        _ => None,
    };
    let listed_date = if category.has_listed_date() {
        timestamp(doc, "listedDate")?
    } else {
        None
    };

    Ok(CanonicalListing {
        address: text(doc, "formattedAddress")?,
        city: text(doc, "city")?,
        state: text(doc, "state")?,
        zip_code: text(doc, "zipCode")?,
        price: decimal(doc, "price")?,
        bedrooms: integer(doc, "bedrooms")?,
        bathrooms: decimal(doc, "bathrooms")?,
        sqft: integer(doc, "squareFootage")?,
        property_type: text(doc, "propertyType")?,
        status: text(doc, "status")?,
        listed_date,
        listing_office,
    })
}

/// Parse a stored raw document and project it.
pub fn canonicalize(raw_json: &str, category: Category) -> Result<CanonicalListing, ProjectionError> {
    let doc: JsonValue =
        serde_json::from_str(raw_json).map_err(|e| ProjectionError::Malformed(e.to_string()))?;
    project_listing(&doc, category)
}

/// Rebuild every canonical table from the raw store on a fresh connection.
pub async fn run_silver<C: WarehouseConnector>(
    connector: &C,
    telemetry: &Telemetry,
) -> Result<SilverReport> {
    telemetry
        .run_task(TASK, async {
            let mut conn = connector
                .connect()
                .await
                .context("connecting to warehouse for silver")?;
            let outcome = normalize_all(&mut conn, telemetry).await;
            let closed = conn.close().await;
            let report = outcome?;
            closed.context("closing silver connection")?;
            Ok(report)
        })
        .await
}

async fn normalize_all<W: Warehouse>(conn: &mut W, telemetry: &Telemetry) -> Result<SilverReport> {
    conn.ensure_derived_schema()
        .await
        .context("creating canonical and summary tables")?;

    let mut report = SilverReport::default();
    for category in Category::ALL {
        *report.slot(category) = normalize_category(conn, category, telemetry).await?;
    }
    Ok(report)
}

async fn normalize_category<W: Warehouse>(
    conn: &mut W,
    category: Category,
    telemetry: &Telemetry,
) -> Result<CategoryCounts> {
    let target = category.canonical_table();
    let prefix = category.raw_table_prefix();
    let tables = conn
        .list_raw_tables(&prefix)
        .await
        .with_context(|| format!("discovering raw tables with prefix {prefix}"))?;

    let mut counts = CategoryCounts {
        raw_tables: tables.len(),
        ..Default::default()
    };
    let mut listings = Vec::new();

    for table in &tables {
        let rows = conn
            .read_raw(table)
            .await
            .with_context(|| format!("reading raw table {table}"))?;
        info!(table = %table, rows = rows.len(), "loaded {} rows from {table}", rows.len());
        counts.rows_read += rows.len();

        for row in rows {
            match canonicalize(&row.raw_json, category) {
                Ok(listing) => listings.push(listing),
                Err(err) => {
                    warn!(table = %table, raw_id = row.id, error = %err, "skipping raw row");
                    counts.rows_skipped += 1;
                }
            }
        }
    }
    counts.rows_transformed = listings.len();
    telemetry.row_count(target, &listings);

    counts.rows_inserted = conn
        .replace_listings(category, &listings)
        .await
        .with_context(|| format!("replacing {target}"))?;

    info!(
        table = target,
        rows_read = counts.rows_read,
        rows_transformed = counts.rows_transformed,
        rows_skipped = counts.rows_skipped,
        rows_inserted = counts.rows_inserted,
        "inserted {} rows into {target}",
        counts.rows_inserted
    );
    telemetry.count(target, "rows_read", counts.rows_read);
    telemetry.count(target, "rows_transformed", counts.rows_transformed);
    telemetry.count(target, "rows_skipped", counts.rows_skipped);
    telemetry.count(target, "rows_inserted", counts.rows_inserted);
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_rental() -> JsonValue {
        json!({
            "formattedAddress": "123 Main St, Austin, TX 78701",
            "city": "Austin",
            "state": "TX",
            "zipCode": "78701",
            "price": 2450,
            "bedrooms": 2,
            "bathrooms": 1.5,
            "squareFootage": 1100,
            "propertyType": "Apartment",
            "status": "Active",
            "listedDate": "2024-03-01T00:00:00.000Z",
            "listingOffice": {"name": "Lone Star Realty", "phone": "5125550100"},
            "history": {"2024-03-01": {"event": "Rental Listing"}}
        })
    }

    #[test]
    fn projects_every_field_of_a_rental() {
        let listing = project_listing(&full_rental(), Category::Rental).expect("project");
        assert_eq!(listing.address.as_deref(), Some("123 Main St, Austin, TX 78701"));
        assert_eq!(listing.zip_code.as_deref(), Some("78701"));
        assert_eq!(listing.price, Some(2450.0));
        assert_eq!(listing.bedrooms, Some(2));
        assert_eq!(listing.bathrooms, Some(1.5));
        assert_eq!(listing.sqft, Some(1100));
        assert_eq!(listing.listing_office.as_deref(), Some("Lone Star Realty"));
        assert_eq!(
            listing.listed_date.map(|d| d.to_rfc3339()),
            Some("2024-03-01T00:00:00+00:00".to_string())
        );
    }

    #[test]
    fn sales_never_carry_listed_date() {
        let listing = project_listing(&full_rental(), Category::Sale).expect("project");
        assert!(listing.listed_date.is_none());
        assert_eq!(listing.city.as_deref(), Some("Austin"));
    }

    #[test]
    fn missing_fields_become_null() {
        let listing = project_listing(&json!({"state": "TX", "price": 100000}), Category::Sale)
            .expect("project");
        assert_eq!(listing.bedrooms, None);
        assert_eq!(listing.address, None);
        assert_eq!(listing.listing_office, None);
        assert_eq!(listing.state.as_deref(), Some("TX"));
    }

    #[test]
    fn numeric_strings_coerce_and_garbage_rejects() {
        let ok = project_listing(
            &json!({"price": " 350000.50 ", "bedrooms": "3", "squareFootage": 1450.6}),
            Category::Sale,
        )
        .expect("project");
        assert_eq!(ok.price, Some(350000.5));
        assert_eq!(ok.bedrooms, Some(3));
        assert_eq!(ok.sqft, Some(1451));

        let err = project_listing(&json!({"price": "call for price"}), Category::Sale).unwrap_err();
        assert!(matches!(err, ProjectionError::Coercion { field: "price", .. }));

        let err = project_listing(&json!({"bedrooms": "2.5"}), Category::Sale).unwrap_err();
        assert!(matches!(err, ProjectionError::Coercion { field: "bedrooms", .. }));

        let err = project_listing(&json!({"squareFootage": 9_999_999_999i64}), Category::Sale)
            .unwrap_err();
        assert!(matches!(err, ProjectionError::Coercion { field: "squareFootage", .. }));
    }

    #[test]
    fn text_columns_accept_scalars_but_not_structures() {
        let listing = project_listing(&json!({"zipCode": 78701, "status": true}), Category::Sale)
            .expect("project");
        assert_eq!(listing.zip_code.as_deref(), Some("78701"));
        assert_eq!(listing.status.as_deref(), Some("true"));

        let err = project_listing(&json!({"city": ["Austin"]}), Category::Sale).unwrap_err();
        assert!(matches!(err, ProjectionError::Coercion { field: "city", .. }));
    }

    #[test]
    fn nul_bytes_in_text_reject_the_row() {
        let err = canonicalize(r#"{"city":"A\u0000B","price":1}"#, Category::Sale).unwrap_err();
        assert!(matches!(
            err,
            ProjectionError::Coercion { field: "city", expected: "text", .. }
        ));

        let err = project_listing(
            &json!({"listingOffice": {"name": "Acme\u{0}"}}),
            Category::Rental,
        )
        .unwrap_err();
        assert!(matches!(err, ProjectionError::Coercion { field: "name", .. }));
    }

    #[test]
    fn listed_date_accepts_common_shapes() {
        for raw in ["2024-03-01T12:30:00Z", "2024-03-01T12:30:00.250", "2024-03-01 12:30:00", "2024-03-01"] {
            let listing = project_listing(&json!({"listedDate": raw}), Category::Rental)
                .unwrap_or_else(|e| panic!("{raw}: {e}"));
            assert!(listing.listed_date.is_some(), "{raw}");
        }
        let err = project_listing(&json!({"listedDate": "last tuesday"}), Category::Rental)
            .unwrap_err();
        assert!(matches!(err, ProjectionError::Coercion { field: "listedDate", .. }));
    }

    #[test]
    fn unparseable_and_non_object_documents_are_rejected() {
        assert!(matches!(
            canonicalize("{not json", Category::Sale),
            Err(ProjectionError::Malformed(_))
        ));
        assert_eq!(
            canonicalize("[1, 2]", Category::Sale),
            Err(ProjectionError::NotAnObject("array"))
        );
        assert_eq!(canonicalize("{}", Category::Sale), Err(ProjectionError::Empty));
    }
}
