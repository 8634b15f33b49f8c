use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;
use zre_core::{CanonicalListing, Category, RawRecord, RawTableName, StateSummary};

use crate::{StorageError, Warehouse, WarehouseConnector};

#[derive(Debug, Default)]
struct MemoryState {
    raw: BTreeMap<RawTableName, Vec<RawRecord>>,
    next_raw_id: i64,
    derived_schema: bool,
    listings: HashMap<Category, Vec<CanonicalListing>>,
    summaries: HashMap<Category, Vec<StateSummary>>,
    rejected_tables: BTreeSet<String>,
    connections_opened: usize,
    connections_closed: usize,
}

/// Point-in-time copy of everything held by a [`MemoryWarehouse`].
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshot {
    pub derived_schema: bool,
    pub raw: BTreeMap<RawTableName, Vec<RawRecord>>,
    pub listings: HashMap<Category, Vec<CanonicalListing>>,
    pub summaries: HashMap<Category, Vec<StateSummary>>,
    pub connections_opened: usize,
    pub connections_closed: usize,
}

/// Process-local warehouse with the same replace semantics as Postgres.
///
/// Clones share state, so each stage can "connect" independently and still see what the
/// previous stage wrote. Writes to tables registered with [`reject_writes_to`] fail
/// before touching state, which leaves the prior snapshot in place.
///
/// [`reject_writes_to`]: MemoryWarehouse::reject_writes_to
#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    state: Arc<Mutex<MemoryState>>,
    open: bool,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.open {
            Ok(())
        } else {
            Err(StorageError::Closed)
        }
    }

    pub fn reject_writes_to(&self, table: &str) {
        self.state().rejected_tables.insert(table.to_string());
    }

    pub fn accept_writes_to(&self, table: &str) {
        self.state().rejected_tables.remove(table);
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let state = self.state();
        MemorySnapshot {
            derived_schema: state.derived_schema,
            raw: state.raw.clone(),
            listings: state.listings.clone(),
            summaries: state.summaries.clone(),
            connections_opened: state.connections_opened,
            connections_closed: state.connections_closed,
        }
    }
}

#[async_trait]
impl WarehouseConnector for MemoryWarehouse {
    type Conn = MemoryWarehouse;

    async fn connect(&self) -> Result<MemoryWarehouse, StorageError> {
        self.state().connections_opened += 1;
        Ok(MemoryWarehouse {
            state: Arc::clone(&self.state),
            open: true,
        })
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn ensure_raw_table(&mut self, table: &RawTableName) -> Result<(), StorageError> {
        self.check_open()?;
        self.state().raw.entry(table.clone()).or_default();
        Ok(())
    }

    async fn append_raw(
        &mut self,
        table: &RawTableName,
        documents: &[String],
    ) -> Result<usize, StorageError> {
        self.check_open()?;
        let mut state = self.state();
        if state.rejected_tables.contains(table.as_str()) {
            return Err(StorageError::WriteRejected(table.to_string()));
        }
        if !state.raw.contains_key(table) {
            return Err(StorageError::UnknownTable(table.to_string()));
        }

        let created_at = Utc::now();
        let first_id = state.next_raw_id + 1;
        state.next_raw_id += documents.len() as i64;
        let rows = documents
            .iter()
            .enumerate()
            .map(|(offset, doc)| RawRecord {
                id: first_id + offset as i64,
                raw_json: doc.clone(),
                created_at,
            })
            .collect::<Vec<_>>();
        if let Some(existing) = state.raw.get_mut(table) {
            existing.extend(rows);
        }
        debug!(table = %table, rows = documents.len(), "appended raw rows");
        Ok(documents.len())
    }

    async fn list_raw_tables(&mut self, prefix: &str) -> Result<Vec<RawTableName>, StorageError> {
        self.check_open()?;
        let state = self.state();
        let tables = state
            .raw
            .keys()
            .filter(|name| name.as_str().starts_with(prefix))
            .cloned()
            .collect();
        Ok(tables)
    }

    async fn read_raw(&mut self, table: &RawTableName) -> Result<Vec<RawRecord>, StorageError> {
        self.check_open()?;
        let state = self.state();
        let rows = state.raw.get(table).cloned();
        rows.ok_or_else(|| StorageError::UnknownTable(table.to_string()))
    }

    async fn ensure_derived_schema(&mut self) -> Result<(), StorageError> {
        self.check_open()?;
        self.state().derived_schema = true;
        Ok(())
    }

    async fn replace_listings(
        &mut self,
        category: Category,
        rows: &[CanonicalListing],
    ) -> Result<usize, StorageError> {
        self.check_open()?;
        let mut state = self.state();
        let table = category.canonical_table();
        if state.rejected_tables.contains(table) {
            return Err(StorageError::WriteRejected(table.to_string()));
        }
        state.listings.insert(category, rows.to_vec());
        Ok(rows.len())
    }

    async fn load_listings(
        &mut self,
        category: Category,
    ) -> Result<Vec<CanonicalListing>, StorageError> {
        self.check_open()?;
        let state = self.state();
        let rows = state.listings.get(&category).cloned().unwrap_or_default();
        Ok(rows)
    }

    async fn replace_summaries(
        &mut self,
        category: Category,
        rows: &[StateSummary],
    ) -> Result<usize, StorageError> {
        self.check_open()?;
        let mut state = self.state();
        let table = category.summary_table();
        if state.rejected_tables.contains(table) {
            return Err(StorageError::WriteRejected(table.to_string()));
        }
        state.summaries.insert(category, rows.to_vec());
        Ok(rows.len())
    }

    async fn load_summaries(
        &mut self,
        category: Category,
    ) -> Result<Vec<StateSummary>, StorageError> {
        self.check_open()?;
        let state = self.state();
        let rows = state.summaries.get(&category).cloned().unwrap_or_default();
        Ok(rows)
    }

    async fn close(&mut self) -> Result<(), StorageError> {
        if self.open {
            self.open = false;
            self.state().connections_closed += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str) -> RawTableName {
        RawTableName::parse(name).expect("table name")
    }

    #[tokio::test]
    async fn raw_tables_are_append_only_and_ordered() {
        let warehouse = MemoryWarehouse::new();
        let mut conn = warehouse.connect().await.expect("connect");
        let t = table("bronze_sales_tx");

        conn.ensure_raw_table(&t).await.expect("ensure");
        conn.ensure_raw_table(&t).await.expect("ensure is idempotent");
        conn.append_raw(&t, &["{\"a\":1}".into()]).await.expect("first");
        conn.append_raw(&t, &["{\"a\":2}".into(), "{\"a\":3}".into()])
            .await
            .expect("second");

        let rows = conn.read_raw(&t).await.expect("read");
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(rows[0].raw_json, "{\"a\":1}");
    }

    #[tokio::test]
    async fn append_to_missing_table_fails() {
        let warehouse = MemoryWarehouse::new();
        let mut conn = warehouse.connect().await.expect("connect");
        let err = conn
            .append_raw(&table("bronze_sales_zz"), &["{}".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UnknownTable(_)));
    }

    #[tokio::test]
    async fn discovery_filters_by_prefix() {
        let warehouse = MemoryWarehouse::new();
        let mut conn = warehouse.connect().await.expect("connect");
        for name in ["bronze_sales_tx", "bronze_rentals_tx", "bronze_sales_ca"] {
            conn.ensure_raw_table(&table(name)).await.expect("ensure");
        }
        let found = conn.list_raw_tables("bronze_sales_").await.expect("list");
        let names: Vec<_> = found.iter().map(|t| t.as_str()).collect();
        assert_eq!(names, vec!["bronze_sales_ca", "bronze_sales_tx"]);
    }

    #[tokio::test]
    async fn rejected_replace_keeps_previous_snapshot() {
        let warehouse = MemoryWarehouse::new();
        let mut conn = warehouse.connect().await.expect("connect");
        let old = vec![CanonicalListing {
            city: Some("Austin".into()),
            ..Default::default()
        }];
        conn.replace_listings(Category::Sale, &old).await.expect("seed");

        warehouse.reject_writes_to("silver_sales");
        let err = conn
            .replace_listings(Category::Sale, &vec![CanonicalListing::default(); 3])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::WriteRejected(_)));
        assert_eq!(conn.load_listings(Category::Sale).await.expect("load"), old);
    }

    #[tokio::test]
    async fn closed_handles_refuse_work_and_are_counted_once() {
        let warehouse = MemoryWarehouse::new();
        let mut conn = warehouse.connect().await.expect("connect");
        conn.close().await.expect("close");
        conn.close().await.expect("second close is a no-op");
        assert!(matches!(
            conn.load_summaries(Category::Sale).await,
            Err(StorageError::Closed)
        ));
        let snap = warehouse.snapshot();
        assert_eq!(snap.connections_opened, 1);
        assert_eq!(snap.connections_closed, 1);
    }
}
