//! Raw/canonical/summary table access and the listings HTTP client.
//!
//! Raw tables are append-only. Canonical and summary tables are only ever written through
//! a whole-table replace that runs as one transaction.

use async_trait::async_trait;
use thiserror::Error;
use zre_core::{CanonicalListing, Category, DomainError, RawRecord, RawTableName, StateSummary};

mod http;
mod memory;
mod postgres;

pub use http::{BackoffPolicy, FetchError, HttpClientConfig, HttpListingSource, ListingSource};
pub use memory::{MemorySnapshot, MemoryWarehouse};
pub use postgres::{PgConnector, PgWarehouse};

pub const CRATE_NAME: &str = "zre-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("raw table {0} does not exist")]
    UnknownTable(String),
    #[error("write to {0} rejected")]
    WriteRejected(String),
    #[error("connection already closed")]
    Closed,
}

impl StorageError {
    /// The connection can no longer be used for this stage.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            StorageError::Closed
                | StorageError::Database(
                    sqlx::Error::Io(_)
                        | sqlx::Error::Tls(_)
                        | sqlx::Error::PoolClosed
                        | sqlx::Error::WorkerCrashed
                )
        )
    }
}

/// One logical unit of work against the relational store.
#[async_trait]
pub trait Warehouse: Send {
    /// Create the append-only raw table if it is missing.
    async fn ensure_raw_table(&mut self, table: &RawTableName) -> Result<(), StorageError>;

    /// Append each document as one row; returns the number of rows written.
    async fn append_raw(
        &mut self,
        table: &RawTableName,
        documents: &[String],
    ) -> Result<usize, StorageError>;

    /// Raw tables whose names begin with `prefix`, sorted by name.
    async fn list_raw_tables(&mut self, prefix: &str) -> Result<Vec<RawTableName>, StorageError>;

    async fn read_raw(&mut self, table: &RawTableName) -> Result<Vec<RawRecord>, StorageError>;

    /// Create canonical and summary tables if they are missing.
    async fn ensure_derived_schema(&mut self) -> Result<(), StorageError>;

    /// Clear and repopulate the canonical table for `category` in one transaction.
    async fn replace_listings(
        &mut self,
        category: Category,
        rows: &[CanonicalListing],
    ) -> Result<usize, StorageError>;

    /// Canonical rows in insertion order.
    async fn load_listings(&mut self, category: Category)
        -> Result<Vec<CanonicalListing>, StorageError>;

    /// Clear and repopulate the summary table for `category` in one transaction.
    async fn replace_summaries(
        &mut self,
        category: Category,
        rows: &[StateSummary],
    ) -> Result<usize, StorageError>;

    async fn load_summaries(&mut self, category: Category)
        -> Result<Vec<StateSummary>, StorageError>;

    /// Release the underlying connection. Further calls fail with [`StorageError::Closed`].
    async fn close(&mut self) -> Result<(), StorageError>;
}

/// Opens a fresh [`Warehouse`] per stage invocation.
#[async_trait]
pub trait WarehouseConnector: Send + Sync {
    type Conn: Warehouse;

    async fn connect(&self) -> Result<Self::Conn, StorageError>;
}
