//! Scheduler entry points and read operations
//!
//! The four `run_*` jobs are re-entrant and idempotent. None of them returns
//! an error: failures are folded into the `JobStatus` they return, logged, and
//! announced on the event bus.

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use airsight_common::events::{EventBus, PipelineEvent};
use airsight_common::time::{add_hours, hour_bucket};

use crate::config::PipelineConfig;
use crate::db::{candidates, canonical, raw_readings};
use crate::error::{PipelineError, PipelineResult};
use crate::features::HourlySeries;
use crate::forecast::{ForecastOutcome, Forecaster};
use crate::harmonize::aqi::{self, Aqi};
use crate::harmonize::Harmonizer;
use crate::ingest::{build_adapters, IngestionAdapter};
use crate::registry::ModelRegistry;
use crate::trainer::{Trainer, TrainingOutcome};
use crate::types::{
    CanonicalRecord, ConfidenceBand, HarmonizedCandidate, Location, LocationBinId, Parameter,
    Pollutant,
};
use crate::validate::{QualityReport, Validator};

/// Pollutants retrained when no pollutant is named
pub const DEFAULT_TRAINING_POLLUTANTS: [Pollutant; 4] =
    [Pollutant::Pm25, Pollutant::Pm10, Pollutant::O3, Pollutant::No2];

/// Raw readings harmonized per run
const HARMONIZE_BATCH_LIMIT: i64 = 10_000;

/// Candidates validated per run
const VALIDATE_BATCH_LIMIT: i64 = 10_000;

/// Scheduler job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Ingestion,
    Harmonization,
    Validation,
    Retrain,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Ingestion => "ingestion",
            JobKind::Harmonization => "harmonization",
            JobKind::Validation => "validation",
            JobKind::Retrain => "retrain",
        }
    }
}

/// Result of one scheduler run
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub run_id: Uuid,
    pub job: JobKind,
    pub ok: bool,
    pub processed: usize,
    pub rejected: usize,
    pub detail: Option<String>,
    /// Per-pollutant training outcomes (retrain only)
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub outcomes: BTreeMap<Pollutant, TrainingOutcome>,
    /// Quality summary of the validated batch (validation only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// What a job body reports back before timestamps are attached
#[derive(Debug, Default)]
struct JobReport {
    ok: bool,
    processed: usize,
    rejected: usize,
    detail: Option<String>,
    outcomes: BTreeMap<Pollutant, TrainingOutcome>,
    quality: Option<QualityReport>,
}

impl JobReport {
    fn ok(processed: usize, rejected: usize) -> Self {
        Self {
            ok: true,
            processed,
            rejected,
            ..Default::default()
        }
    }
}

/// Confidence of the latest canonical record at a location
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentConfidence {
    pub pollutant: Pollutant,
    pub location_bin_id: String,
    pub hour_bucket: DateTime<Utc>,
    pub value: f64,
    pub confidence: f64,
    pub band: ConfidenceBand,
    pub reason: Option<String>,
    pub contributing_sources: Vec<String>,
    pub aqi: Option<Aqi>,
}

/// Pipeline handle shared by the scheduler and the HTTP surface
pub struct Pipeline {
    db: SqlitePool,
    config: PipelineConfig,
    adapters: Vec<Arc<dyn IngestionAdapter>>,
    harmonizer: Harmonizer,
    validator: Validator,
    forecaster: Forecaster,
    registry: Arc<ModelRegistry>,
    trainer: Trainer,
    events: EventBus,
}

impl Pipeline {
    /// Build a pipeline with the adapters enabled by configuration
    pub fn new(db: SqlitePool, config: PipelineConfig, events: EventBus) -> PipelineResult<Self> {
        let adapters = build_adapters(&config.ingestion)?;
        Ok(Self::with_adapters(db, config, events, adapters))
    }

    pub fn with_adapters(
        db: SqlitePool,
        config: PipelineConfig,
        events: EventBus,
        adapters: Vec<Arc<dyn IngestionAdapter>>,
    ) -> Self {
        let registry = Arc::new(ModelRegistry::new(db.clone(), events.clone()));
        let trainer = Trainer::new(
            db.clone(),
            config.trainer.clone(),
            Arc::clone(&registry),
            events.clone(),
        );
        Self {
            harmonizer: Harmonizer::new(&config.harmonizer),
            validator: Validator::new(&config.validator),
            forecaster: Forecaster::new(&config.forecaster),
            db,
            config,
            adapters,
            registry,
            trainer,
            events,
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ------------------------------------------------------------------------
    // Scheduler entry points
    // ------------------------------------------------------------------------

    /// Fetch from every adapter and stage new readings
    pub async fn run_ingestion(&self) -> JobStatus {
        self.run_job(JobKind::Ingestion, self.ingest()).await
    }

    /// Harmonize pending raw readings into candidates
    pub async fn run_harmonization(&self) -> JobStatus {
        self.run_job(JobKind::Harmonization, self.harmonize_pending()).await
    }

    /// Validate pending candidates and upsert canonical records
    pub async fn run_validation_and_persist(&self) -> JobStatus {
        self.run_job(JobKind::Validation, self.validate_pending()).await
    }

    /// Retrain one pollutant, or the default set concurrently
    pub async fn run_retrain(&self, pollutant: Option<Pollutant>) -> JobStatus {
        self.run_job(JobKind::Retrain, self.retrain(pollutant)).await
    }

    async fn run_job<F>(&self, job: JobKind, body: F) -> JobStatus
    where
        F: Future<Output = PipelineResult<JobReport>>,
    {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(run_id = %run_id, job = job.as_str(), "Job started");
        self.events.emit_lossy(PipelineEvent::JobStarted {
            run_id,
            job: job.as_str().to_string(),
            timestamp: started_at,
        });

        let report = match body.await {
            Ok(report) => report,
            Err(e) => {
                error!(run_id = %run_id, job = job.as_str(), error = %e, "Job failed");
                JobReport {
                    ok: false,
                    detail: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };

        let finished_at = Utc::now();
        info!(
            run_id = %run_id,
            job = job.as_str(),
            ok = report.ok,
            processed = report.processed,
            rejected = report.rejected,
            duration_ms = (finished_at - started_at).num_milliseconds(),
            "Job finished"
        );
        self.events.emit_lossy(PipelineEvent::JobFinished {
            run_id,
            job: job.as_str().to_string(),
            ok: report.ok,
            processed: report.processed,
            rejected: report.rejected,
            timestamp: finished_at,
        });

        JobStatus {
            run_id,
            job,
            ok: report.ok,
            processed: report.processed,
            rejected: report.rejected,
            detail: report.detail,
            outcomes: report.outcomes,
            quality: report.quality,
            started_at,
            finished_at,
        }
    }

    async fn ingest(&self) -> PipelineResult<JobReport> {
        let results = join_all(self.adapters.iter().map(|adapter| async move {
            (adapter.name().to_string(), adapter.fetch().await)
        }))
        .await;

        let mut readings = Vec::new();
        let mut failures = Vec::new();
        for (name, result) in results {
            match result {
                Ok(mut batch) => {
                    debug!(adapter = %name, count = batch.len(), "Adapter fetch complete");
                    readings.append(&mut batch);
                }
                Err(e) => {
                    warn!(adapter = %name, error = %e, "Adapter fetch failed");
                    failures.push(e.to_string());
                }
            }
        }

        let fetched = readings.len();
        let inserted = raw_readings::insert_readings(&self.db, &readings).await?;

        let mut report = JobReport::ok(inserted, 0);
        report.ok = failures.is_empty() || failures.len() < self.adapters.len();
        report.detail = Some(if failures.is_empty() {
            format!(
                "{} readings fetched, {} new, {} already staged",
                fetched,
                inserted,
                fetched - inserted
            )
        } else {
            format!(
                "{} readings fetched, {} new; adapter failures: {}",
                fetched,
                inserted,
                failures.join("; ")
            )
        });
        Ok(report)
    }

    async fn harmonize_pending(&self) -> PipelineResult<JobReport> {
        let pending = raw_readings::load_pending(&self.db, HARMONIZE_BATCH_LIMIT).await?;
        if pending.is_empty() {
            return Ok(JobReport::ok(0, 0));
        }

        // Hours whose candidates can change: each pollutant reading's hour,
        // and every hour a weather reading is close enough to be merged into
        let gap_hours = self.harmonizer.weather_max_gap().num_hours();
        let mut affected: BTreeSet<DateTime<Utc>> = BTreeSet::new();
        for stored in &pending {
            let hour = hour_bucket(stored.reading.timestamp);
            match stored.reading.parameter {
                Parameter::Pollutant(_) => {
                    affected.insert(hour);
                }
                Parameter::Weather(_) => {
                    for offset in -gap_hours..=gap_hours {
                        affected.insert(add_hours(hour, offset));
                    }
                }
            }
        }
        let (Some(&first), Some(&last)) = (affected.first(), affected.last()) else {
            return Ok(JobReport::ok(0, 0));
        };

        // Every reading that can contribute to an affected hour
        let gap = self.harmonizer.weather_max_gap();
        let context = raw_readings::load_range(
            &self.db,
            first - gap,
            last + gap + Duration::hours(1),
        )
        .await?;
        let readings: Vec<_> = context.iter().map(|s| s.reading.clone()).collect();
        let output = self.harmonizer.harmonize(&readings);

        let candidates: Vec<_> = output
            .candidates
            .into_iter()
            .filter(|c| affected.contains(&c.key.hour_bucket))
            .collect();
        candidates::upsert_candidates(&self.db, &candidates).await?;

        let rejected_ids: BTreeMap<i64, String> = output
            .rejected
            .into_iter()
            .filter_map(|r| context.get(r.index).map(|s| (s.id, r.reason)))
            .collect();
        let outcomes: Vec<(i64, Option<String>)> = pending
            .iter()
            .map(|s| (s.id, rejected_ids.get(&s.id).cloned()))
            .collect();
        let rejected = outcomes.iter().filter(|(_, r)| r.is_some()).count();
        raw_readings::mark_processed(&self.db, &outcomes).await?;

        info!(
            pending = pending.len(),
            context = context.len(),
            candidates = candidates.len(),
            rejected,
            "Harmonized pending readings"
        );

        let mut report = JobReport::ok(pending.len() - rejected, rejected);
        report.detail = Some(format!(
            "{} candidates across {} hours",
            candidates.len(),
            affected.len()
        ));
        Ok(report)
    }

    async fn validate_pending(&self) -> PipelineResult<JobReport> {
        let pending = candidates::load_unvalidated(&self.db, VALIDATE_BATCH_LIMIT).await?;
        if pending.is_empty() {
            return Ok(JobReport::ok(0, 0));
        }

        let history = self.anomaly_context(&pending).await?;
        let records = self.validator.validate_batch_with_history(&pending, &history);
        canonical::upsert_records(&self.db, &records).await?;
        let keys: Vec<_> = pending.iter().map(|c| c.key).collect();
        candidates::mark_validated(&self.db, &keys).await?;

        let quality = QualityReport::from_records(&records, self.validator.discrepancy_threshold());
        info!(
            records = quality.total,
            high = quality.high,
            medium = quality.medium,
            low = quality.low,
            anomalies = quality.anomalies,
            "Persisted canonical records"
        );

        let mut report = JobReport::ok(records.len(), 0);
        report.detail = Some(format!(
            "{} high, {} medium, {} low confidence",
            quality.high, quality.medium, quality.low
        ));
        report.quality = Some(quality);
        Ok(report)
    }

    /// Stored records in the trailing anomaly window of every pending series
    async fn anomaly_context(
        &self,
        pending: &[HarmonizedCandidate],
    ) -> PipelineResult<Vec<CanonicalRecord>> {
        let mut spans: BTreeMap<(LocationBinId, Pollutant), (DateTime<Utc>, DateTime<Utc>)> =
            BTreeMap::new();
        for c in pending {
            let hour = c.key.hour_bucket;
            spans
                .entry((c.key.location_bin_id, c.key.pollutant))
                .and_modify(|(first, last)| {
                    *first = (*first).min(hour);
                    *last = (*last).max(hour);
                })
                .or_insert((hour, hour));
        }

        let window = self.config.validator.anomaly_window_hours;
        let mut history = Vec::new();
        for ((bin, pollutant), (first, last)) in spans {
            let hours = (last - first).num_hours() + window;
            history.extend(canonical::load_history(&self.db, bin, pollutant, last, hours).await?);
        }
        Ok(history)
    }

    async fn retrain(&self, pollutant: Option<Pollutant>) -> PipelineResult<JobReport> {
        let pollutants: Vec<Pollutant> = match pollutant {
            Some(p) => vec![p],
            None => DEFAULT_TRAINING_POLLUTANTS.to_vec(),
        };

        let results = join_all(
            pollutants
                .iter()
                .map(|p| async move { (*p, self.trainer.train(*p).await) }),
        )
        .await;
        let outcomes: BTreeMap<Pollutant, TrainingOutcome> = results.into_iter().collect();

        let trained = outcomes
            .values()
            .filter(|o| matches!(o, TrainingOutcome::Trained { .. }))
            .count();
        let skipped = outcomes
            .values()
            .filter(|o| matches!(o, TrainingOutcome::Skipped { .. }))
            .count();
        let failed = outcomes.values().filter(|o| o.is_failure()).count();

        Ok(JobReport {
            ok: failed == 0,
            processed: trained,
            rejected: failed,
            detail: Some(format!(
                "{} trained, {} skipped, {} failed",
                trained, skipped, failed
            )),
            outcomes,
            quality: None,
        })
    }

    // ------------------------------------------------------------------------
    // Read operations
    // ------------------------------------------------------------------------

    /// Forecast `horizon_hours` ahead of the latest record at `location`
    ///
    /// A missing model or missing history is an `Unavailable` outcome, not an
    /// error. `timeout` defaults to the configured forecast timeout.
    pub async fn get_forecast(
        &self,
        location: Location,
        pollutant: Pollutant,
        horizon_hours: u32,
        timeout: Option<std::time::Duration>,
    ) -> PipelineResult<ForecastOutcome> {
        if !location.is_valid() {
            return Err(PipelineError::InvalidRequest(format!(
                "invalid location ({}, {})",
                location.lat, location.lon
            )));
        }
        self.forecaster.validate_horizon(horizon_hours)?;

        let timeout = timeout
            .unwrap_or_else(|| std::time::Duration::from_millis(self.config.forecaster.timeout_ms));
        match tokio::time::timeout(timeout, self.forecast(location, pollutant, horizon_hours)).await
        {
            Ok(result) => result,
            Err(_) => {
                let ms = timeout.as_millis() as u64;
                warn!(pollutant = %pollutant, timeout_ms = ms, "Forecast timed out");
                Err(PipelineError::Timeout(ms))
            }
        }
    }

    async fn forecast(
        &self,
        location: Location,
        pollutant: Pollutant,
        horizon_hours: u32,
    ) -> PipelineResult<ForecastOutcome> {
        // One snapshot for the whole call; a concurrent swap does not affect it
        let Some(model) = self.registry.get(pollutant).await else {
            return Ok(ForecastOutcome::Unavailable {
                pollutant,
                reason: format!("No trained model for {}", pollutant),
            });
        };

        let bin = self.harmonizer.grid().bin_for(location.lat, location.lon);
        let Some(latest) = canonical::latest(&self.db, bin, pollutant).await? else {
            return Ok(ForecastOutcome::Unavailable {
                pollutant,
                reason: format!("No {} history for location bin {}", pollutant, bin),
            });
        };
        let origin = latest.hour_bucket;

        let history = canonical::load_history(
            &self.db,
            bin,
            pollutant,
            origin,
            self.config.forecaster.history_hours,
        )
        .await?;
        let series = HourlySeries::from_records(&history)
            .unwrap_or_else(|| HourlySeries::new(latest.lat, latest.lon));

        // Off the async workers so the caller's deadline can fire mid-recursion
        let forecaster = self.forecaster.clone();
        let snapshot = Arc::clone(&model);
        let steps = tokio::task::spawn_blocking(move || {
            forecaster.forecast(&snapshot, series, origin, horizon_hours)
        })
        .await
        .map_err(|e| {
            PipelineError::Common(airsight_common::Error::Internal(format!(
                "Forecast task failed: {}",
                e
            )))
        })?;

        let points = match steps {
            Ok(points) => points,
            Err(PipelineError::ForecastUnavailable { reason, .. }) => {
                warn!(pollutant = %pollutant, reason = %reason, "Forecast unavailable");
                return Ok(ForecastOutcome::Unavailable { pollutant, reason });
            }
            Err(e) => return Err(e),
        };

        debug!(
            pollutant = %pollutant,
            bin = %bin,
            model_version = model.version,
            horizon_hours,
            history = history.len(),
            "Forecast complete"
        );
        Ok(ForecastOutcome::Available {
            pollutant,
            location_bin_id: bin.to_string(),
            model_version: model.version,
            origin,
            points,
        })
    }

    /// Confidence of the latest canonical record at `location`
    pub async fn get_current_confidence(
        &self,
        location: Location,
        pollutant: Pollutant,
    ) -> PipelineResult<Option<CurrentConfidence>> {
        if !location.is_valid() {
            return Err(PipelineError::InvalidRequest(format!(
                "invalid location ({}, {})",
                location.lat, location.lon
            )));
        }

        let bin = self.harmonizer.grid().bin_for(location.lat, location.lon);
        let record = canonical::latest(&self.db, bin, pollutant).await?;
        Ok(record.map(|r| CurrentConfidence {
            pollutant,
            location_bin_id: bin.to_string(),
            hour_bucket: r.hour_bucket,
            value: r.value,
            confidence: r.confidence,
            band: r.band,
            reason: r.reason,
            aqi: aqi::compute(pollutant, r.value),
            contributing_sources: r.contributing_sources,
        }))
    }

    /// Pollutants with an active model, for health reporting
    pub async fn active_models(&self) -> BTreeMap<Pollutant, i64> {
        self.registry.active_versions().await.into_iter().collect()
    }

    /// Names of the registered adapters
    pub fn adapter_names(&self) -> Vec<String> {
        self.adapters.iter().map(|a| a.name().to_string()).collect()
    }
}
