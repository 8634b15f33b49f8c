use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Connection, PgConnection, Postgres, QueryBuilder, Row};
use tracing::debug;
use zre_core::{CanonicalListing, Category, RawRecord, RawTableName, StateSummary};

use crate::{StorageError, Warehouse, WarehouseConnector};

// Postgres caps a statement at 65535 bind parameters.
const INSERT_CHUNK_ROWS: usize = 1000;

#[derive(Debug, Clone)]
pub struct PgConnector {
    database_url: String,
}

impl PgConnector {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }
}

#[async_trait]
impl WarehouseConnector for PgConnector {
    type Conn = PgWarehouse;

    async fn connect(&self) -> Result<PgWarehouse, StorageError> {
        let conn = PgConnection::connect(&self.database_url).await?;
        debug!("opened postgres connection");
        Ok(PgWarehouse { conn: Some(conn) })
    }
}

/// A single Postgres connection held for one stage invocation.
#[derive(Debug)]
pub struct PgWarehouse {
    conn: Option<PgConnection>,
}

impl PgWarehouse {
    fn conn(&mut self) -> Result<&mut PgConnection, StorageError> {
        self.conn.as_mut().ok_or(StorageError::Closed)
    }
}

fn canonical_columns(category: Category) -> &'static str {
    if category.has_listed_date() {
        "address, city, state, zip_code, price, bedrooms, bathrooms, sqft, property_type, status, listing_office, listed_date"
    } else {
        "address, city, state, zip_code, price, bedrooms, bathrooms, sqft, property_type, status, listing_office"
    }
}

fn canonical_ddl(category: Category) -> String {
    let listed_date = if category.has_listed_date() {
        ",\n            listed_date TIMESTAMPTZ"
    } else {
        ""
    };
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            id BIGSERIAL PRIMARY KEY,
            address TEXT,
            city TEXT,
            state TEXT,
            zip_code TEXT,
            price DOUBLE PRECISION,
            bedrooms INTEGER,
            bathrooms DOUBLE PRECISION,
            sqft INTEGER,
            property_type TEXT,
            status TEXT,
            listing_office TEXT{listed_date}
        )
        "#,
        table = category.canonical_table(),
    )
}

fn summary_ddl(category: Category) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            state TEXT,
            total_listings BIGINT NOT NULL,
            avg_price DOUBLE PRECISION,
            avg_bedrooms DOUBLE PRECISION,
            avg_bathrooms DOUBLE PRECISION,
            avg_sqft DOUBLE PRECISION
        )
        "#,
        table = category.summary_table(),
    )
}

/// `LIKE` pattern matching names that start with `prefix` literally.
fn prefix_like_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 4);
    for ch in prefix.chars() {
        if matches!(ch, '_' | '%' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

fn listing_from_row(row: &PgRow, category: Category) -> Result<CanonicalListing, sqlx::Error> {
    let listed_date: Option<DateTime<Utc>> = if category.has_listed_date() {
        row.try_get("listed_date")?
    } else {
        None
    };
    Ok(CanonicalListing {
        address: row.try_get("address")?,
        city: row.try_get("city")?,
        state: row.try_get("state")?,
        zip_code: row.try_get("zip_code")?,
        price: row.try_get("price")?,
        bedrooms: row.try_get("bedrooms")?,
        bathrooms: row.try_get("bathrooms")?,
        sqft: row.try_get("sqft")?,
        property_type: row.try_get("property_type")?,
        status: row.try_get("status")?,
        listed_date,
        listing_office: row.try_get("listing_office")?,
    })
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn ensure_raw_table(&mut self, table: &RawTableName) -> Result<(), StorageError> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id BIGSERIAL PRIMARY KEY,
                raw_json TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#
        );
        sqlx::query(&ddl).execute(self.conn()?).await?;
        Ok(())
    }

    async fn append_raw(
        &mut self,
        table: &RawTableName,
        documents: &[String],
    ) -> Result<usize, StorageError> {
        if documents.is_empty() {
            return Ok(0);
        }
        let mut tx = self.conn()?.begin().await?;
        for chunk in documents.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {table} (raw_json) "));
            builder.push_values(chunk, |mut b, doc| {
                b.push_bind(doc.as_str());
            });
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(documents.len())
    }

    async fn list_raw_tables(&mut self, prefix: &str) -> Result<Vec<RawTableName>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT table_name::text AS table_name
              FROM information_schema.tables
             WHERE table_schema = current_schema()
               AND table_name LIKE $1 ESCAPE '\'
             ORDER BY table_name
            "#,
        )
        .bind(prefix_like_pattern(prefix))
        .fetch_all(self.conn()?)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("table_name")?;
            out.push(RawTableName::parse(&name)?);
        }
        Ok(out)
    }

    async fn read_raw(&mut self, table: &RawTableName) -> Result<Vec<RawRecord>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT id, raw_json, created_at FROM {table} ORDER BY id"
        ))
        .fetch_all(self.conn()?)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RawRecord {
                id: row.try_get("id")?,
                raw_json: row.try_get("raw_json")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(out)
    }

    async fn ensure_derived_schema(&mut self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        for category in Category::ALL {
            sqlx::query(&canonical_ddl(category))
                .execute(&mut *conn)
                .await?;
            sqlx::query(&summary_ddl(category))
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    async fn replace_listings(
        &mut self,
        category: Category,
        rows: &[CanonicalListing],
    ) -> Result<usize, StorageError> {
        let table = category.canonical_table();
        let mut tx = self.conn()?.begin().await?;
        sqlx::query(&format!("TRUNCATE TABLE {table} RESTART IDENTITY"))
            .execute(&mut *tx)
            .await?;

        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {table} ({}) ",
                canonical_columns(category)
            ));
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.address.clone())
                    .push_bind(row.city.clone())
                    .push_bind(row.state.clone())
                    .push_bind(row.zip_code.clone())
                    .push_bind(row.price)
                    .push_bind(row.bedrooms)
                    .push_bind(row.bathrooms)
                    .push_bind(row.sqft)
                    .push_bind(row.property_type.clone())
                    .push_bind(row.status.clone())
                    .push_bind(row.listing_office.clone());
                if category.has_listed_date() {
                    b.push_bind(row.listed_date);
                }
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(rows.len())
    }

    async fn load_listings(
        &mut self,
        category: Category,
    ) -> Result<Vec<CanonicalListing>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM {} ORDER BY id",
            canonical_columns(category),
            category.canonical_table()
        ))
        .fetch_all(self.conn()?)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(listing_from_row(row, category)?);
        }
        Ok(out)
    }

    async fn replace_summaries(
        &mut self,
        category: Category,
        rows: &[StateSummary],
    ) -> Result<usize, StorageError> {
        let table = category.summary_table();
        let mut tx = self.conn()?.begin().await?;
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(&mut *tx)
            .await?;

        for chunk in rows.chunks(INSERT_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {table} (state, total_listings, avg_price, avg_bedrooms, avg_bathrooms, avg_sqft) "
            ));
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.state.clone())
                    .push_bind(row.total_listings)
                    .push_bind(row.avg_price)
                    .push_bind(row.avg_bedrooms)
                    .push_bind(row.avg_bathrooms)
                    .push_bind(row.avg_sqft);
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(rows.len())
    }

    async fn load_summaries(
        &mut self,
        category: Category,
    ) -> Result<Vec<StateSummary>, StorageError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT state, total_listings, avg_price, avg_bedrooms, avg_bathrooms, avg_sqft
              FROM {}
             ORDER BY state NULLS FIRST
            "#,
            category.summary_table()
        ))
        .fetch_all(self.conn()?)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(StateSummary {
                state: row.try_get("state")?,
                total_listings: row.try_get("total_listings")?,
                avg_price: row.try_get("avg_price")?,
                avg_bedrooms: row.try_get("avg_bedrooms")?,
                avg_bathrooms: row.try_get("avg_bathrooms")?,
                avg_sqft: row.try_get("avg_sqft")?,
            });
        }
        Ok(out)
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        if let Some(conn) = self.conn.take() {
            conn.close().await?;
            debug!("closed postgres connection");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_escapes_underscores() {
        assert_eq!(prefix_like_pattern("bronze_sales_"), "bronze\\_sales\\_%");
        assert_eq!(prefix_like_pattern("a%b"), "a\\%b%");
    }

    #[test]
    fn rental_tables_carry_listed_date() {
        assert!(canonical_ddl(Category::Rental).contains("listed_date TIMESTAMPTZ"));
        assert!(!canonical_ddl(Category::Sale).contains("listed_date"));
        assert!(canonical_columns(Category::Rental).ends_with("listed_date"));
    }

    #[test]
    fn summary_ddl_targets_category_table() {
        assert!(summary_ddl(Category::Sale).contains("gold_sales_summary"));
        assert!(summary_ddl(Category::Rental).contains("gold_rentals_summary"));
    }
}
