//! Core domain model for the ZRE listings pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "zre-core";

pub const US_STATES: [&str; 50] = [
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "FL", "GA", "HI", "ID", "IL", "IN", "IA",
    "KS", "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV", "NH", "NJ",
    "NM", "NY", "NC", "ND", "OH", "OK", "OR", "PA", "RI", "SC", "SD", "TN", "TX", "UT", "VT",
    "VA", "WA", "WV", "WI", "WY",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid region code {0:?}: expected a two-letter state code")]
    InvalidRegion(String),
    #[error("invalid table name {0:?}: only [a-z0-9_] is allowed")]
    InvalidTableName(String),
    #[error("unknown category {0:?}")]
    UnknownCategory(String),
}

/// Listing category; decides the API path and every table name a stage touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Sale,
    Rental,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::Sale, Category::Rental];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Sale => "sales",
            Category::Rental => "rentals",
        }
    }

    pub fn api_path(self) -> &'static str {
        match self {
            Category::Sale => "/sale",
            Category::Rental => "/rental/long-term",
        }
    }

    pub fn raw_table_prefix(self) -> String {
        format!("bronze_{}_", self.as_str())
    }

    pub fn canonical_table(self) -> &'static str {
        match self {
            Category::Sale => "silver_sales",
            Category::Rental => "silver_rentals",
        }
    }

    pub fn summary_table(self) -> &'static str {
        match self {
            Category::Sale => "gold_sales_summary",
            Category::Rental => "gold_rentals_summary",
        }
    }

    /// Only rental documents carry a listed date.
    pub fn has_listed_date(self) -> bool {
        matches!(self, Category::Rental)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sale" | "sales" => Ok(Category::Sale),
            "rental" | "rentals" => Ok(Category::Rental),
            other => Err(DomainError::UnknownCategory(other.to_string())),
        }
    }
}

/// Two-letter upper-case state code.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Region(String);

impl Region {
    pub fn new(code: &str) -> Result<Self, DomainError> {
        let code = code.trim().to_ascii_uppercase();
        if code.len() == 2 && code.chars().all(|c| c.is_ascii_uppercase()) {
            Ok(Self(code))
        } else {
            Err(DomainError::InvalidRegion(code))
        }
    }

    pub fn all_states() -> Vec<Region> {
        US_STATES.iter().map(|s| Region(s.to_string())).collect()
    }

    pub fn code(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Region {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Region::new(&value)
    }
}

impl From<Region> for String {
    fn from(value: Region) -> Self {
        value.0
    }
}

/// SQL-safe raw table identifier. Table names are interpolated into DDL, so this is the
/// only path by which one may reach SQL text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RawTableName(String);

impl RawTableName {
    pub fn parse(name: &str) -> Result<Self, DomainError> {
        let valid = !name.is_empty()
            && name.len() <= 63
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if valid {
            Ok(Self(name.to_string()))
        } else {
            Err(DomainError::InvalidTableName(name.to_string()))
        }
    }

    pub fn for_shard(category: Category, region: &Region) -> Self {
        Self(format!(
            "{}{}",
            category.raw_table_prefix(),
            region.code().to_ascii_lowercase()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RawTableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One query against the listings API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub category: Category,
    pub region: Region,
    pub status: String,
    pub limit: u32,
    pub city: Option<String>,
}

impl EndpointDescriptor {
    pub fn raw_table(&self) -> RawTableName {
        RawTableName::for_shard(self.category, &self.region)
    }

    /// Query parameters in the order the API documents them.
    pub fn query_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::with_capacity(4);
        if let Some(city) = &self.city {
            params.push(("city", city.clone()));
        }
        params.push(("state", self.region.code().to_string()));
        params.push(("status", self.status.clone()));
        params.push(("limit", self.limit.to_string()));
        params
    }
}

/// Unmodified captured document, as stored in a raw table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: i64,
    pub raw_json: String,
    pub created_at: DateTime<Utc>,
}

/// Typed projection of a raw listing document into the reporting schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CanonicalListing {
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
    pub price: Option<f64>,
    pub bedrooms: Option<i32>,
    pub bathrooms: Option<f64>,
    pub sqft: Option<i32>,
    pub property_type: Option<String>,
    pub status: Option<String>,
    pub listed_date: Option<DateTime<Utc>>,
    pub listing_office: Option<String>,
}

/// Per-region aggregate over canonical listings with a non-null price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSummary {
    pub state: Option<String>,
    pub total_listings: i64,
    pub avg_price: Option<f64>,
    pub avg_bedrooms: Option<f64>,
    pub avg_bathrooms: Option<f64>,
    pub avg_sqft: Option<f64>,
}
