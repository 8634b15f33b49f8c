//! Runs against a real Postgres when `ZRE_TEST_DATABASE_URL` is set; otherwise each test
//! returns early. The tests drop and recreate the pipeline tables in the current schema, so
//! point the variable at a scratch database.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{TimeZone, Utc};
use sqlx::{Connection, PgConnection};
use zre_core::{CanonicalListing, Category, RawTableName, Region, StateSummary};
use zre_storage::{PgConnector, PgWarehouse, StorageError, Warehouse, WarehouseConnector};

// Every test shares the same fixed table names.
static DB_LOCK: Mutex<()> = Mutex::new(());

fn database_url() -> Option<String> {
    let url = std::env::var("ZRE_TEST_DATABASE_URL")
        .ok()
        .filter(|v| !v.trim().is_empty());
    if url.is_none() {
        eprintln!("ZRE_TEST_DATABASE_URL not set; skipping postgres test");
    }
    url
}

fn lock() -> MutexGuard<'static, ()> {
    DB_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn fresh_warehouse(url: &str) -> PgWarehouse {
    let mut conn = PgConnection::connect(url).await.expect("connect for reset");
    let names: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT table_name::text
          FROM information_schema.tables
         WHERE table_schema = current_schema()
           AND (table_name LIKE 'bronze%'
                OR table_name IN ('silver_sales', 'silver_rentals',
                                  'gold_sales_summary', 'gold_rentals_summary'))
        "#,
    )
    .fetch_all(&mut conn)
    .await
    .expect("list tables");
    for name in names {
        sqlx::query(&format!("DROP TABLE IF EXISTS \"{name}\""))
            .execute(&mut conn)
            .await
            .expect("drop table");
    }
    conn.close().await.expect("close reset connection");

    PgConnector::new(url).connect().await.expect("connect")
}

fn rental(city: &str, price: f64, day: u32) -> CanonicalListing {
    CanonicalListing {
        address: Some(format!("{day} Elm St")),
        city: Some(city.to_string()),
        state: Some("TX".to_string()),
        zip_code: Some("78701".to_string()),
        price: Some(price),
        bedrooms: Some(2),
        bathrooms: Some(1.5),
        sqft: None,
        property_type: Some("Apartment".to_string()),
        status: Some("Active".to_string()),
        listed_date: Utc.with_ymd_and_hms(2024, 5, day, 0, 0, 0).single(),
        listing_office: Some("Lone Star Realty".to_string()),
    }
}

#[tokio::test]
async fn raw_tables_append_discover_and_read_in_order() {
    let Some(url) = database_url() else { return };
    let _guard = lock();
    let mut wh = fresh_warehouse(&url).await;

    let tx = RawTableName::for_shard(Category::Sale, &Region::new("TX").expect("region"));
    let ca = RawTableName::for_shard(Category::Sale, &Region::new("CA").expect("region"));
    let rentals = RawTableName::for_shard(Category::Rental, &Region::new("TX").expect("region"));
    // matches "bronze_sales_%" only if the underscores are not escaped
    let lookalike = RawTableName::parse("bronzexsalesxnv").expect("name");
    for table in [&tx, &ca, &rentals, &lookalike] {
        wh.ensure_raw_table(table).await.expect("ensure");
    }
    wh.ensure_raw_table(&tx).await.expect("ensure is idempotent");

    let first = vec![r#"{"price": 1, "state": "TX"}"#.to_string(), r#"{"a":[1,2]}"#.to_string()];
    assert_eq!(wh.append_raw(&tx, &first).await.expect("append"), 2);
    let second = vec![r#"{"price":"3"}"#.to_string()];
    assert_eq!(wh.append_raw(&tx, &second).await.expect("append"), 1);

    let listed = wh.list_raw_tables(&Category::Sale.raw_table_prefix()).await.expect("list");
    assert_eq!(listed, vec![ca.clone(), tx.clone()]);

    let rows = wh.read_raw(&tx).await.expect("read");
    let docs: Vec<_> = rows.iter().map(|r| r.raw_json.as_str()).collect();
    assert_eq!(docs, vec![first[0].as_str(), first[1].as_str(), second[0].as_str()]);
    assert!(rows.windows(2).all(|w| w[0].id < w[1].id));
    assert!(wh.read_raw(&ca).await.expect("read").is_empty());

    wh.close().await.expect("close");
}

#[tokio::test]
async fn failed_listing_replace_keeps_previous_snapshot() {
    let Some(url) = database_url() else { return };
    let _guard = lock();
    let mut wh = fresh_warehouse(&url).await;
    wh.ensure_derived_schema().await.expect("schema");
    wh.ensure_derived_schema().await.expect("schema is idempotent");

    let snapshot = vec![rental("Austin", 1800.0, 1), rental("Dallas", 2100.5, 2)];
    assert_eq!(wh.replace_listings(Category::Rental, &snapshot).await.expect("replace"), 2);
    assert_eq!(wh.load_listings(Category::Rental).await.expect("load"), snapshot);

    // the truncate succeeds, the insert fails on NUL, and the whole transaction rolls back
    let bad = vec![rental("Houston", 1500.0, 3), rental("Aus\u{0}tin", 1.0, 4)];
    let err = wh.replace_listings(Category::Rental, &bad).await.unwrap_err();
    assert!(matches!(err, StorageError::Database(_)), "{err}");
    assert_eq!(wh.load_listings(Category::Rental).await.expect("load"), snapshot);

    let sale = CanonicalListing {
        listed_date: None,
        ..rental("El Paso", 250000.0, 5)
    };
    wh.replace_listings(Category::Sale, &[sale.clone()]).await.expect("replace sales");
    assert_eq!(wh.load_listings(Category::Sale).await.expect("load"), vec![sale]);

    wh.close().await.expect("close");
}

#[tokio::test]
async fn summaries_round_trip_across_insert_chunks() {
    let Some(url) = database_url() else { return };
    let _guard = lock();
    let mut wh = fresh_warehouse(&url).await;
    wh.ensure_derived_schema().await.expect("schema");

    let mut summaries = vec![StateSummary {
        state: None,
        total_listings: 1,
        avg_price: Some(10.0),
        avg_bedrooms: None,
        avg_bathrooms: None,
        avg_sqft: None,
    }];
    summaries.extend((0..2500i32).map(|i| StateSummary {
        state: Some(format!("S{i:04}")),
        total_listings: i64::from(i) + 1,
        avg_price: Some(f64::from(i) * 1.25),
        avg_bedrooms: Some(2.5),
        avg_bathrooms: None,
        avg_sqft: Some(1234.5),
    }));

    let written = wh
        .replace_summaries(Category::Sale, &summaries)
        .await
        .expect("replace");
    assert_eq!(written, summaries.len());
    assert_eq!(wh.load_summaries(Category::Sale).await.expect("load"), summaries);

    wh.replace_summaries(Category::Sale, &[]).await.expect("clear");
    assert!(wh.load_summaries(Category::Sale).await.expect("load").is_empty());
    assert!(wh.load_summaries(Category::Rental).await.expect("load").is_empty());

    wh.close().await.expect("close");
    assert!(matches!(
        wh.load_summaries(Category::Sale).await,
        Err(StorageError::Closed)
    ));
}
