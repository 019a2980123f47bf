use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use unvr_adapters::{connector_for_source, crawl, Connector, CrawlContext};
use unvr_core::{DataSource, RunStats, RunStatus, VacancyStatus};
use unvr_storage::{HttpFetcher, OrganizationDirectory, RunTracker, VacancyStore};
use uuid::Uuid;

use crate::{
    reconcile, ReconcileContext, ReconcilePlan, OrganizationResolver, SourceRegistry, SyncConfig,
    SyncError,
};

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub data_source: DataSource,
    pub job_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: RunStats,
    pub error_message: Option<String>,
    pub reports_dir: Option<String>,
}

/// Runs one source end to end: crawl, reconcile, apply, track, report.
pub struct SyncPipeline {
    config: SyncConfig,
    registry: SourceRegistry,
    http: HttpFetcher,
    store: Arc<dyn VacancyStore>,
    tracker: Arc<dyn RunTracker>,
    directory: Arc<dyn OrganizationDirectory>,
    connectors: HashMap<DataSource, Arc<dyn Connector>>,
    run_locks: HashMap<DataSource, Arc<Mutex<()>>>,
    write_reports: bool,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        registry: SourceRegistry,
        store: Arc<dyn VacancyStore>,
        tracker: Arc<dyn RunTracker>,
        directory: Arc<dyn OrganizationDirectory>,
    ) -> Result<Self> {
        let http = HttpFetcher::new(config.http_config())?;
        let connectors = DataSource::ALL
            .into_iter()
            .map(|source| {
                let page_size = registry.get(source).and_then(|s| s.page_size);
                (source, Arc::from(connector_for_source(source, page_size)))
            })
            .collect();
        let run_locks = DataSource::ALL
            .into_iter()
            .map(|source| (source, Arc::new(Mutex::new(()))))
            .collect();
        Ok(Self {
            config,
            registry,
            http,
            store,
            tracker,
            directory,
            connectors,
            run_locks,
            write_reports: true,
        })
    }

    /// Replace the connector used for its source.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connectors.insert(connector.data_source(), connector);
        self
    }

    pub fn without_reports(mut self) -> Self {
        self.write_reports = false;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn store(&self) -> Arc<dyn VacancyStore> {
        self.store.clone()
    }

    pub fn tracker(&self) -> Arc<dyn RunTracker> {
        self.tracker.clone()
    }

    /// Run the ETL for one source. Concurrent calls for the same source are
    /// rejected with [`SyncError::RunInProgress`]; a store failure ends the run
    /// as `failed` in the tracker and is returned.
    pub async fn run_etl(&self, source: DataSource) -> Result<RunSummary, SyncError> {
        let lock = self.run_locks[&source].clone();
        let Ok(_guard) = lock.try_lock() else {
            return Err(SyncError::RunInProgress(source));
        };

        let run_id = Uuid::new_v4();
        let span = info_span!("etl_run", %source, %run_id);
        self.run_locked(source, run_id).instrument(span).await
    }

    async fn run_locked(&self, source: DataSource, run_id: Uuid) -> Result<RunSummary, SyncError> {
        let job_name = source.job_name();
        let started_at = Utc::now();
        let clock = Instant::now();
        let tracker_id = self.tracker.start_run(&job_name, run_id, started_at).await?;
        info!(job_name = %job_name, "etl run started");

        let mut stats = RunStats::default();
        let result = self.execute(source, run_id, started_at, &mut stats).await;
        stats.duration_ms = clock.elapsed().as_millis() as u64;
        let finished_at = Utc::now();

        let (status, error_message) = match &result {
            Ok(_) => (RunStatus::Completed, None),
            Err(err) => {
                error!(error = %err, "etl run failed");
                (RunStatus::Failed, Some(err.to_string()))
            }
        };
        self.tracker
            .finish_run(
                tracker_id,
                status,
                &stats,
                error_message.as_deref(),
                finished_at,
            )
            .await?;

        let mut summary = RunSummary {
            run_id,
            data_source: source,
            job_name,
            status,
            started_at,
            finished_at,
            stats,
            error_message,
            reports_dir: None,
        };
        if self.write_reports {
            let plan = result.as_ref().ok();
            match write_run_report(&self.config.workspace_root, &summary, plan).await {
                Ok(dir) => summary.reports_dir = Some(dir.display().to_string()),
                Err(err) => warn!(error = %err, "writing run report failed"),
            }
        }

        info!(
            status = status.as_str(),
            inserted = summary.stats.inserted,
            updated = summary.stats.updated,
            ghost_closed = summary.stats.ghost_closed,
            expired_closed = summary.stats.expired_closed,
            duration_ms = summary.stats.duration_ms,
            "etl run finished"
        );
        result.map(|_| summary)
    }

    async fn execute(
        &self,
        source: DataSource,
        run_id: Uuid,
        now: DateTime<Utc>,
        stats: &mut RunStats,
    ) -> Result<ReconcilePlan, SyncError> {
        let connector = self.connectors[&source].clone();
        let ctx = CrawlContext {
            run_id,
            fetched_at: now,
        };
        let settings = self.config.crawl_settings();
        let outcome = crawl(connector.as_ref(), &self.http, &ctx, &settings).await;
        stats.pages_fetched = outcome.stats.pages_fetched;
        stats.page_failures = outcome.stats.page_failures;
        stats.listing_failures = outcome.stats.listing_failures;

        let existing = self.store.active_by_data_source(source).await?;
        let closed_keys = self.store.closed_keys_by_data_source(source).await?;
        let resolver = OrganizationResolver::new(self.directory.clone(), self.config.default_org_id);
        let reconcile_ctx = ReconcileContext {
            now,
            resolver: &resolver,
            closed_keys: &closed_keys,
        };
        let plan = reconcile(source, outcome.listings, &existing, &reconcile_ctx).await;
        stats.listings_seen = plan.listings_seen;
        stats.duplicate_ids = plan.duplicate_ids;
        stats.unchanged = plan.unchanged;
        stats.already_closed = plan.already_closed;
        if plan.duplicate_ids > 0 {
            warn!(duplicates = plan.duplicate_ids, "duplicate source ids in feed; last one kept");
        }

        self.apply(source, &plan, stats).await?;
        Ok(plan)
    }

    /// Inserts, then updates, then ghost closures, then expiry closures; one write per row.
    async fn apply(
        &self,
        source: DataSource,
        plan: &ReconcilePlan,
        stats: &mut RunStats,
    ) -> Result<(), SyncError> {
        for vacancy in &plan.inserts {
            if self.store.insert(vacancy).await?.is_some() {
                stats.inserted += 1;
                if vacancy.status == VacancyStatus::Closed {
                    stats.expired_closed += 1;
                }
            }
        }

        for planned in &plan.updates {
            if self
                .store
                .update(source, &planned.source_job_id, &planned.update)
                .await?
            {
                stats.updated += 1;
            }
        }

        if stats.feed_unavailable() && !plan.ghost_closures.is_empty() {
            warn!(
                withheld = plan.ghost_closures.len(),
                "first listing page failed; ghost closures withheld"
            );
            stats.ghost_withheld = plan.ghost_closures.len();
        } else {
            for closure in &plan.ghost_closures {
                if self
                    .store
                    .close(source, &closure.source_job_id, &closure.note)
                    .await?
                {
                    stats.ghost_closed += 1;
                }
            }
        }

        for closure in plan.expired_closures.iter().filter(|c| !c.applied_on_insert) {
            if self
                .store
                .close(source, &closure.source_job_id, &closure.note)
                .await?
            {
                stats.expired_closed += 1;
            }
        }
        Ok(())
    }

    /// Run every enabled source in registry order; one failure does not stop the rest.
    pub async fn run_all(&self) -> Vec<(DataSource, Result<RunSummary, SyncError>)> {
        let sources = self.registry.enabled().map(|s| s.source_id).collect::<Vec<_>>();
        let mut results = Vec::with_capacity(sources.len());
        for source in sources {
            results.push((source, self.run_etl(source).await));
        }
        results
    }
}

/// Scheduler with one daily job per enabled source, or `None` when scheduling is off.
pub async fn build_scheduler(pipeline: Arc<SyncPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for source in pipeline.registry().enabled() {
        let data_source = source.source_id;
        let cron = source.schedule.clone();
        let pipeline = pipeline.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.run_etl(data_source).await {
                    Ok(summary) => info!(
                        source = %data_source,
                        run_id = %summary.run_id,
                        "scheduled etl run completed"
                    ),
                    Err(err) => warn!(source = %data_source, error = %err, "scheduled etl run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for {data_source} ({cron})"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(source = %data_source, cron = %cron, "scheduled etl job");
    }
    Ok(Some(sched))
}

#[derive(Debug, Serialize)]
struct PlanDigest<'a> {
    inserted: Vec<&'a str>,
    updated: Vec<&'a str>,
    ghost_closed: Vec<&'a str>,
    expired_closed: Vec<&'a str>,
}

impl<'a> PlanDigest<'a> {
    fn from_plan(plan: &'a ReconcilePlan) -> Self {
        Self {
            inserted: plan
                .inserts
                .iter()
                .map(|v| v.listing.source_job_id.as_str())
                .collect(),
            updated: plan
                .updates
                .iter()
                .map(|u| u.source_job_id.as_str())
                .collect(),
            ghost_closed: plan
                .ghost_closures
                .iter()
                .map(|c| c.source_job_id.as_str())
                .collect(),
            expired_closed: plan
                .expired_closures
                .iter()
                .map(|c| c.source_job_id.as_str())
                .collect(),
        }
    }
}

fn key_list(keys: &[&str]) -> String {
    if keys.is_empty() {
        return "- none".to_string();
    }
    keys.iter()
        .map(|k| format!("- `{k}`"))
        .collect::<Vec<_>>()
        .join("\n")
}

async fn write_run_report(
    workspace_root: &std::path::Path,
    summary: &RunSummary,
    plan: Option<&ReconcilePlan>,
) -> Result<PathBuf> {
    let reports_dir = workspace_root
        .join("reports")
        .join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let digest = plan.map(PlanDigest::from_plan);
    let json = serde_json::to_vec_pretty(&serde_json::json!({
        "run": summary,
        "plan": digest,
    }))
    .context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    let stats = &summary.stats;
    let mut brief = format!(
        "# UNVR Run Brief: {}\n\n- Run ID: `{}`\n- Status: {}\n- Started: {}\n- Finished: {}\n- Pages fetched: {} ({} failed)\n- Listings seen: {} ({} failed, {} duplicate ids)\n- Inserted: {}\n- Updated: {}\n- Unchanged: {}\n- Ghost closed: {} ({} withheld)\n- Expired closed: {}\n- Already closed: {}\n",
        summary.data_source,
        summary.run_id,
        summary.status.as_str(),
        summary.started_at,
        summary.finished_at,
        stats.pages_fetched,
        stats.page_failures,
        stats.listings_seen,
        stats.listing_failures,
        stats.duplicate_ids,
        stats.inserted,
        stats.updated,
        stats.unchanged,
        stats.ghost_closed,
        stats.ghost_withheld,
        stats.expired_closed,
        stats.already_closed,
    );
    if let Some(message) = &summary.error_message {
        brief.push_str(&format!("\n## Error\n{message}\n"));
    }
    if let Some(digest) = &digest {
        brief.push_str(&format!(
            "\n## Inserted\n{}\n\n## Updated\n{}\n\n## Ghost Closed\n{}\n\n## Expired Closed\n{}\n",
            key_list(&digest.inserted),
            key_list(&digest.updated),
            key_list(&digest.ghost_closed),
            key_list(&digest.expired_closed),
        ));
    }
    fs::write(reports_dir.join("brief.md"), brief)
        .await
        .context("writing brief.md")?;

    Ok(reports_dir)
}
