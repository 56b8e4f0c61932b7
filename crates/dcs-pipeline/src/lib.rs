//! Pipeline orchestration: fetch, validate, clean, store, and the recurring
//! schedule that drives it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Local;
use dcs_core::{PipelineResult, PipelineStatus, RawRecord};
use dcs_fetch::{CatalogFetcher, FetchConfig, FetchError};
use dcs_store::{SnapshotStore, StoreConfig, StoreError, StoreReport};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "dcs-pipeline";

/// Static configuration surface, loaded once at process start and passed
/// into the orchestrator at construction.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub source_url: String,
    pub db_path: PathBuf,
    pub table_name: String,
    pub max_fetch_attempts: u32,
    pub retry_delay: Duration,
    pub http_timeout: Duration,
    pub user_agent: Option<String>,
    pub required_fields: Vec<String>,
    pub min_expected_records: usize,
    pub scheduler_enabled: bool,
    pub ingest_cron: String,
}

impl PipelineConfig {
    pub fn default_required_fields() -> Vec<String> {
        ["id", "title", "category", "price", "rating.rate", "rating.count"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    pub fn from_env() -> Self {
        Self {
            source_url: std::env::var("DCS_SOURCE_URL")
                .unwrap_or_else(|_| "https://fakestoreapi.com/products".to_string()),
            db_path: std::env::var("DCS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("catalog_snapshots.db")),
            table_name: std::env::var("DCS_TABLE_NAME")
                .unwrap_or_else(|_| "daily_catalog".to_string()),
            max_fetch_attempts: std::env::var("DCS_MAX_FETCH_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            retry_delay: Duration::from_secs(
                std::env::var("DCS_RETRY_DELAY_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(5),
            ),
            http_timeout: Duration::from_secs(
                std::env::var("DCS_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
            user_agent: std::env::var("DCS_USER_AGENT").ok(),
            required_fields: std::env::var("DCS_REQUIRED_FIELDS")
                .map(|v| {
                    v.split(',')
                        .map(|field| field.trim().to_string())
                        .filter(|field| !field.is_empty())
                        .collect()
                })
                .unwrap_or_else(|_| Self::default_required_fields()),
            min_expected_records: std::env::var("DCS_MIN_EXPECTED_RECORDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            scheduler_enabled: std::env::var("DCS_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            ingest_cron: std::env::var("DCS_INGEST_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
        }
    }
}

/// Typed failure for each pipeline stage. Data-quality rejections are not
/// here on purpose: they are metrics, not errors.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("schema validation failed - catalog structure may have changed")]
    SchemaDrift,
    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// A finalized run that ended in FAILED. Carries the result record so the
/// caller still gets the structured outcome while the error propagates to
/// the invoking scheduler.
#[derive(Debug, Error)]
#[error("pipeline failed: {source}")]
pub struct PipelineFailure {
    pub result: PipelineResult,
    #[source]
    pub source: StageError,
}

/// Seam between the orchestrator and the remote catalog, so runs can be
/// driven from canned batches in tests.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch(&self, url: &str, max_attempts: u32) -> Result<Vec<RawRecord>, FetchError>;
}

#[async_trait]
impl CatalogSource for CatalogFetcher {
    async fn fetch(&self, url: &str, max_attempts: u32) -> Result<Vec<RawRecord>, FetchError> {
        CatalogFetcher::fetch(self, url, max_attempts).await
    }
}

pub struct CatalogPipeline {
    config: PipelineConfig,
    source: Box<dyn CatalogSource>,
}

impl CatalogPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let fetcher = CatalogFetcher::new(FetchConfig {
            timeout: config.http_timeout,
            user_agent: config.user_agent.clone(),
            retry_delay: config.retry_delay,
        })?;
        Ok(Self {
            config,
            source: Box::new(fetcher),
        })
    }

    pub fn with_source(mut self, source: Box<dyn CatalogSource>) -> Self {
        self.source = source;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Execute one full pipeline invocation.
    ///
    /// Always produces a finalized `PipelineResult`. A stage failure yields
    /// `Err(PipelineFailure)` carrying that result with `status = FAILED`,
    /// after it has been logged; the caller decides how loudly to fail.
    pub async fn run(&self) -> Result<PipelineResult, PipelineFailure> {
        let mut result = PipelineResult::started();
        let span = info_span!("pipeline_run", run_id = %result.run_id);

        let outcome = async {
            info!("================ starting catalog pipeline ================");
            self.run_stages(&mut result).await
        }
        .instrument(span.clone())
        .await;

        span.in_scope(|| {
            if let Err(err) = &outcome {
                result.status = PipelineStatus::Failed;
                result.error_message = Some(err.to_string());
                error!(error = %err, "pipeline failed");
            }
            info!(
                status = %result.status,
                fetched = result.records_fetched,
                stored = result.records_stored,
                "================ pipeline finished ================"
            );
        });

        match outcome {
            Ok(()) => Ok(result),
            Err(source) => Err(PipelineFailure { result, source }),
        }
    }

    async fn run_stages(&self, result: &mut PipelineResult) -> Result<(), StageError> {
        // FETCHING
        let raw = self
            .source
            .fetch(&self.config.source_url, self.config.max_fetch_attempts)
            .await?;
        result.records_fetched = raw.len() as u64;

        // VALIDATING
        if !dcs_quality::validate_schema(&raw, &self.config.required_fields) {
            return Err(StageError::SchemaDrift);
        }

        // CLEANING never aborts the run; rejections land in the metrics.
        let fetch_date = Local::now().date_naive();
        let (clean, metrics) = dcs_quality::clean(&raw, fetch_date);
        result.quality_metrics = metrics;
        if clean.len() < self.config.min_expected_records {
            warn!(
                clean = clean.len(),
                expected = self.config.min_expected_records,
                "clean record count below expected minimum"
            );
        }

        // STORING: the connection lives exactly as long as this block.
        let stored = {
            let mut store = SnapshotStore::open(&self.store_config())?;
            store.write(fetch_date, &clean)?
        };
        result.records_stored = stored as u64;
        result.status = if stored > 0 {
            PipelineStatus::Success
        } else {
            PipelineStatus::Skipped
        };
        Ok(())
    }

    /// Read-only store summary for the reporting collaborators.
    pub fn report(&self) -> Result<StoreReport, StoreError> {
        let store = SnapshotStore::open(&self.store_config())?;
        store.report(Local::now().date_naive())
    }

    fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.config.db_path.clone(),
            table: self.config.table_name.clone(),
        }
    }

    /// Build the recurring trigger when the config enables it. Each tick
    /// runs the pipeline once; a failed run is logged and the schedule
    /// keeps going.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.ingest_cron.clone();
        let pipeline = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                if let Err(err) = pipeline.run().await {
                    warn!(error = %err, "scheduled pipeline run failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_drift_message_matches_the_operator_runbook() {
        assert_eq!(
            StageError::SchemaDrift.to_string(),
            "schema validation failed - catalog structure may have changed"
        );
    }

    #[test]
    fn default_required_fields_cover_the_catalog_contract() {
        let fields = PipelineConfig::default_required_fields();
        assert_eq!(fields.len(), 6);
        assert!(fields.contains(&"rating.rate".to_string()));
        assert!(fields.contains(&"rating.count".to_string()));
    }

    #[test]
    fn fetch_errors_surface_through_the_failure_record() {
        let failure = PipelineFailure {
            result: PipelineResult::started(),
            source: StageError::Fetch(FetchError::Exhausted { attempts: 3 }),
        };
        assert!(failure.to_string().contains("after 3 attempts"));
        assert_eq!(failure.result.status, PipelineStatus::Failed);
    }
}
