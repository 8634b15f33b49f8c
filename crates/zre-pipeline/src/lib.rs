//! Listings pipeline: raw capture (bronze), canonicalization (silver) and per-state
//! aggregation (gold), run in order by [`Pipeline`] or on a cron schedule.

pub mod bronze;
pub mod config;
pub mod gold;
pub mod runner;
pub mod silver;

pub use bronze::{fetch_or_empty, run_bronze, BronzeReport, Fetched};
pub use config::PipelineConfig;
pub use gold::{run_gold, summarize, GoldReport};
pub use runner::{
    build_scheduler, Pipeline, PipelineRunSummary, Stage, StageReport, StageRetryPolicy,
};
pub use silver::{
    canonicalize, project_listing, run_silver, CategoryCounts, ProjectionError, SilverReport,
};

pub const CRATE_NAME: &str = "zre-pipeline";
