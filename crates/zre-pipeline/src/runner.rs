//! In-order stage execution with whole-stage retries, plus the cron trigger.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;
use zre_core::EndpointDescriptor;
use zre_storage::{ListingSource, WarehouseConnector};
use zre_telemetry::Telemetry;

use crate::bronze::{run_bronze, BronzeReport};
use crate::gold::{run_gold, GoldReport};
use crate::silver::{run_silver, SilverReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Bronze,
    Silver,
    Gold,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Bronze, Stage::Silver, Stage::Gold];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Bronze => "bronze",
            Stage::Silver => "silver",
            Stage::Gold => "gold",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow!("unknown stage {s:?}; expected bronze, silver or gold"))
    }
}

/// How many times a failed stage is re-run as a whole, and the fixed pause between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageRetryPolicy {
    pub retries: usize,
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageReport {
    Bronze(BronzeReport),
    Silver(SilverReport),
    Gold(GoldReport),
}

impl StageReport {
    pub fn stage(&self) -> Stage {
        match self {
            StageReport::Bronze(_) => Stage::Bronze,
            StageReport::Silver(_) => Stage::Silver,
            StageReport::Gold(_) => Stage::Gold,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<StageReport>,
}

pub struct Pipeline<C> {
    connector: C,
    source: Arc<dyn ListingSource>,
    endpoints: Vec<EndpointDescriptor>,
    telemetry: Telemetry,
    retry: StageRetryPolicy,
}

impl<C: WarehouseConnector> Pipeline<C> {
    pub fn new(
        connector: C,
        source: Arc<dyn ListingSource>,
        endpoints: Vec<EndpointDescriptor>,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            connector,
            source,
            endpoints,
            telemetry,
            retry: StageRetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: StageRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// One attempt at `stage`.
    pub async fn run_stage(&self, stage: Stage) -> Result<StageReport> {
        match stage {
            Stage::Bronze => run_bronze(
                &self.connector,
                self.source.as_ref(),
                &self.endpoints,
                &self.telemetry,
            )
            .await
            .map(StageReport::Bronze),
            Stage::Silver => run_silver(&self.connector, &self.telemetry)
                .await
                .map(StageReport::Silver),
            Stage::Gold => run_gold(&self.connector, &self.telemetry)
                .await
                .map(StageReport::Gold),
        }
    }

    pub async fn run_stage_with_retries(&self, stage: Stage) -> Result<StageReport> {
        let attempts = self.retry.retries + 1;
        let mut attempt = 1;
        loop {
            match self.run_stage(stage).await {
                Ok(report) => return Ok(report),
                Err(err) if attempt < attempts => {
                    warn!(
                        host = self.telemetry.host(),
                        stage = %stage,
                        attempt,
                        attempts,
                        delay_secs = self.retry.delay.as_secs_f64(),
                        error = %err,
                        "{stage} failed; retrying"
                    );
                    tokio::time::sleep(self.retry.delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("{stage} failed after {attempts} attempt(s)"))
                }
            }
        }
    }

    /// bronze, silver, gold in order. A stage that exhausts its retries ends the run and
    /// downstream stages are not started.
    pub async fn run_all(&self) -> Result<PipelineRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(host = self.telemetry.host(), %run_id, "pipeline run started");

        let mut stages = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            let report = self
                .run_stage_with_retries(stage)
                .await
                .with_context(|| format!("pipeline run {run_id} stopped at {stage}"))?;
            stages.push(report);
        }

        let finished_at = Utc::now();
        info!(
            host = self.telemetry.host(),
            %run_id,
            elapsed_ms = (finished_at - started_at).num_milliseconds(),
            "pipeline run finished"
        );
        Ok(PipelineRunSummary {
            run_id,
            started_at,
            finished_at,
            stages,
        })
    }
}

/// Scheduler with one job that runs the whole pipeline on `cron` (six-field, seconds first).
pub async fn build_scheduler<C>(pipeline: Arc<Pipeline<C>>, cron: &str) -> Result<JobScheduler>
where
    C: WarehouseConnector + 'static,
{
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            let host = pipeline.telemetry().host();
            match pipeline.run_all().await {
                Ok(summary) => info!(host, run_id = %summary.run_id, "scheduled pipeline run succeeded"),
                Err(err) => error!(host, error = ?err, "scheduled pipeline run failed: {err:#}"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
