use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::{Mutex, Notify};
use unvr_adapters::{
    AdapterError, Connector, CrawlContext, DetailStub, ListingEntry, ListingPage,
};
use unvr_core::{DataSource, Listing, NewVacancy, RunStatus, StoredVacancy, VacancyStatus};
use unvr_storage::{
    FetchRequest, HttpFetcher, MemoryOrganizationDirectory, MemoryRunTracker, MemoryVacancyStore,
    OrganizationEntry, RunTracker, StoreError, VacancyStore,
};
use unvr_sync::{build_scheduler, SourceRegistry, SyncConfig, SyncError, SyncPipeline};

/// In-memory feed served as a single page; tests swap its contents between runs.
/// `broken_details` keys are listed as detail stubs whose fetch always fails.
#[derive(Default)]
struct FeedConnector {
    listings: Mutex<Vec<Listing>>,
    broken_details: Mutex<Vec<String>>,
    fail_listing: Mutex<bool>,
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl FeedConnector {
    async fn set(&self, listings: Vec<Listing>) {
        *self.listings.lock().await = listings;
    }
}

#[async_trait]
impl Connector for FeedConnector {
    fn data_source(&self) -> DataSource {
        DataSource::Wfp
    }

    fn page_size(&self) -> usize {
        1000
    }

    fn listing_request(&self, _page: usize) -> FetchRequest {
        FetchRequest::get("https://feed.invalid/jobs")
    }

    fn parse_listing(&self, _body: &[u8]) -> Result<ListingPage, AdapterError> {
        unreachable!("feed connector never parses bodies")
    }

    fn parse_detail(&self, _stub: &DetailStub, _body: &[u8]) -> Result<Listing, AdapterError> {
        unreachable!("feed connector never parses bodies")
    }

    async fn fetch_listing(
        &self,
        _http: &HttpFetcher,
        _ctx: &CrawlContext,
        _page: usize,
    ) -> Result<ListingPage, AdapterError> {
        if let Some((entered, release)) = &self.gate {
            entered.notify_one();
            release.notified().await;
        }
        if *self.fail_listing.lock().await {
            return Err(AdapterError::Malformed("feed offline".into()));
        }
        let listings = self.listings.lock().await.clone();
        let broken = self.broken_details.lock().await.clone();
        let mut entries = listings.into_iter().map(ListingEntry::Ready).collect::<Vec<_>>();
        entries.extend(broken.into_iter().map(|key| {
            ListingEntry::NeedsDetail(DetailStub {
                request: FetchRequest::get(format!("https://feed.invalid/jobs/{key}")),
                summary: serde_json::json!({"id": key}),
                key,
            })
        }));
        Ok(ListingPage {
            total_count: entries.len(),
            entries,
            failures: Vec::new(),
        })
    }

    async fn fetch_detail(
        &self,
        _http: &HttpFetcher,
        _ctx: &CrawlContext,
        stub: &DetailStub,
    ) -> Result<Listing, AdapterError> {
        Err(AdapterError::Malformed(format!("detail for {} unavailable", stub.key)))
    }
}

fn listing(id: &str, title: &str, end_in_days: i64) -> Listing {
    Listing {
        source_job_id: id.to_string(),
        title: title.to_string(),
        duty_station: "Rome".to_string(),
        department: "World Food Programme".to_string(),
        end_date: Some(Utc::now() + Duration::days(end_in_days)),
        ..Listing::default()
    }
}

struct Harness {
    pipeline: Arc<SyncPipeline>,
    feed: Arc<FeedConnector>,
    store: Arc<MemoryVacancyStore>,
    tracker: Arc<MemoryRunTracker>,
}

fn harness_with(feed: FeedConnector) -> Harness {
    let feed = Arc::new(feed);
    let store = Arc::new(MemoryVacancyStore::new());
    let tracker = Arc::new(MemoryRunTracker::new());
    let directory = Arc::new(MemoryOrganizationDirectory::new(vec![OrganizationEntry::new(
        12,
        "WFP",
        "World Food Programme",
        "WFP",
        "United Nations World Food Programme",
    )]));
    let pipeline = SyncPipeline::new(
        SyncConfig::default(),
        SourceRegistry::builtin(),
        store.clone(),
        tracker.clone(),
        directory,
    )
    .unwrap()
    .with_connector(feed.clone())
    .without_reports();
    Harness {
        pipeline: Arc::new(pipeline),
        feed,
        store,
        tracker,
    }
}

fn harness() -> Harness {
    harness_with(FeedConnector::default())
}

fn by_key(rows: &[StoredVacancy]) -> HashMap<String, Vec<&StoredVacancy>> {
    let mut map: HashMap<String, Vec<&StoredVacancy>> = HashMap::new();
    for row in rows {
        map.entry(row.source_job_id().to_string()).or_default().push(row);
    }
    map
}

fn assert_single_active_per_key(rows: &[StoredVacancy]) {
    for (key, versions) in by_key(rows) {
        let active = versions.iter().filter(|r| r.is_active()).count();
        assert!(active <= 1, "{key} has {active} active rows");
    }
}

#[tokio::test]
async fn second_identical_run_changes_nothing() {
    let h = harness();
    h.feed
        .set(vec![
            listing("A", "Driver", 10),
            listing("B", "Clerk", 10),
            listing("C", "Analyst", -1),
        ])
        .await;

    let first = h.pipeline.run_etl(DataSource::Wfp).await.unwrap();
    assert_eq!(first.stats.inserted, 3);
    assert_eq!(first.stats.expired_closed, 1);

    let second = h.pipeline.run_etl(DataSource::Wfp).await.unwrap();
    let stats = second.stats;
    assert_eq!(
        (stats.inserted, stats.updated, stats.ghost_closed, stats.expired_closed),
        (0, 0, 0, 0)
    );
    assert_eq!(stats.unchanged, 2);
    assert_eq!(stats.already_closed, 1);
    assert_eq!(h.store.rows().await.len(), 3);

    let runs = h.tracker.recent_runs(10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == RunStatus::Completed));
    assert!(runs.iter().all(|r| r.job_name == "etl:wfp"));
}

#[tokio::test]
async fn expired_listing_is_never_stored_active() {
    let h = harness();
    h.feed.set(vec![listing("OLD", "Archivist", -1)]).await;
    h.pipeline.run_etl(DataSource::Wfp).await.unwrap();

    let rows = h.store.rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, VacancyStatus::Closed);
    assert!(rows[0].notes.as_deref().unwrap().starts_with("expired by end date"));
}

#[tokio::test]
async fn ghost_then_reappearance_creates_fresh_row() {
    let h = harness();
    h.feed
        .set(vec![listing("A", "Driver", 10), listing("B", "Clerk", 10)])
        .await;
    h.pipeline.run_etl(DataSource::Wfp).await.unwrap();

    h.feed.set(vec![listing("A", "Driver", 10)]).await;
    let summary = h.pipeline.run_etl(DataSource::Wfp).await.unwrap();
    assert_eq!(summary.stats.ghost_closed, 1);

    h.feed
        .set(vec![listing("A", "Driver", 10), listing("B", "Clerk", 10)])
        .await;
    let summary = h.pipeline.run_etl(DataSource::Wfp).await.unwrap();
    assert_eq!(summary.stats.inserted, 1);

    let rows = h.store.rows().await;
    assert_single_active_per_key(&rows);
    let versions = &by_key(&rows)["B"];
    assert_eq!(versions.len(), 2);
    let closed = versions.iter().find(|r| !r.is_active()).unwrap();
    assert!(closed
        .notes
        .as_deref()
        .unwrap()
        .contains("no longer present in source feed"));
}

#[tokio::test]
async fn title_change_updates_row_and_keeps_audit_trail() {
    let h = harness();
    h.feed.set(vec![listing("A", "Analyst", 10)]).await;
    h.pipeline.run_etl(DataSource::Wfp).await.unwrap();

    let mut changed = h.store.rows().await[0].listing.clone();
    changed.title = "Senior Analyst".into();
    h.feed.set(vec![changed]).await;
    let summary = h.pipeline.run_etl(DataSource::Wfp).await.unwrap();
    assert_eq!(summary.stats.updated, 1);

    let rows = h.store.rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].listing.title, "Senior Analyst");
    let notes = rows[0].notes.as_deref().unwrap();
    assert!(notes.contains("Analyst") && notes.contains("Senior Analyst"));
    assert_eq!(rows[0].organization_id, 12);
}

#[tokio::test]
async fn store_failure_marks_run_failed_and_keeps_earlier_writes() {
    let h = harness();
    h.feed
        .set(vec![
            listing("A", "Driver", 10),
            listing("B", "Clerk", 10),
            listing("C", "Analyst", 10),
        ])
        .await;
    h.store.fail_writes_after(2).await;

    let err = h.pipeline.run_etl(DataSource::Wfp).await.unwrap_err();
    assert!(matches!(err, SyncError::Store(StoreError::Unavailable(_))));
    assert_eq!(h.store.rows().await.len(), 2);

    let run = h.tracker.latest_run("etl:wfp").await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error_message.unwrap().contains("injected failure"));
    assert_eq!(run.stats.unwrap().inserted, 2);
}

#[tokio::test]
async fn failed_detail_fetch_does_not_block_ghost_closures() {
    let h = harness();
    h.feed
        .set(vec![listing("A", "Driver", 10), listing("B", "Clerk", 10)])
        .await;
    h.pipeline.run_etl(DataSource::Wfp).await.unwrap();

    h.feed.set(vec![listing("A", "Driver", 10)]).await;
    *h.feed.broken_details.lock().await = vec!["D".to_string()];
    let summary = h.pipeline.run_etl(DataSource::Wfp).await.unwrap();
    assert_eq!(summary.stats.listing_failures, 1);
    assert_eq!(summary.stats.ghost_closed, 1);
    assert_eq!(summary.stats.ghost_withheld, 0);

    let rows = h.store.rows().await;
    let b = by_key(&rows)["B"][0];
    assert_eq!(b.status, VacancyStatus::Closed);
    assert!(!by_key(&rows).contains_key("D"));
}

#[tokio::test]
async fn unavailable_feed_withholds_ghosts_but_still_expires() {
    let h = harness();
    h.feed
        .set(vec![listing("A", "Driver", 10), listing("B", "Clerk", 10)])
        .await;
    h.pipeline.run_etl(DataSource::Wfp).await.unwrap();
    h.store
        .insert(&NewVacancy {
            data_source: DataSource::Wfp,
            organization_id: 12,
            status: VacancyStatus::Active,
            notes: None,
            listing: listing("C", "Archivist", -1),
        })
        .await
        .unwrap()
        .unwrap();

    *h.feed.fail_listing.lock().await = true;
    let summary = h.pipeline.run_etl(DataSource::Wfp).await.unwrap();
    assert_eq!(summary.stats.pages_fetched, 0);
    assert_eq!(summary.stats.page_failures, 1);
    assert_eq!(summary.stats.ghost_closed, 0);
    assert_eq!(summary.stats.ghost_withheld, 2);
    assert_eq!(summary.stats.expired_closed, 1);

    let rows = h.store.rows().await;
    let keyed = by_key(&rows);
    assert!(keyed["A"][0].is_active() && keyed["B"][0].is_active());
    let c = keyed["C"][0];
    assert_eq!(c.status, VacancyStatus::Closed);
    assert!(c.notes.as_deref().unwrap().starts_with("expired by end date"));
}

#[tokio::test]
async fn unseen_expired_row_closes_on_a_lossy_run() {
    let h = harness();
    h.store
        .insert(&NewVacancy {
            data_source: DataSource::Wfp,
            organization_id: 12,
            status: VacancyStatus::Active,
            notes: None,
            listing: listing("C", "Archivist", -1),
        })
        .await
        .unwrap()
        .unwrap();

    h.feed.set(vec![listing("A", "Driver", 10)]).await;
    *h.feed.broken_details.lock().await = vec!["D".to_string()];
    let summary = h.pipeline.run_etl(DataSource::Wfp).await.unwrap();
    assert_eq!(summary.stats.listing_failures, 1);
    assert_eq!(summary.stats.inserted, 1);
    assert_eq!(summary.stats.expired_closed, 1);
    assert_eq!(summary.stats.ghost_closed, 0);

    let rows = h.store.rows().await;
    assert_single_active_per_key(&rows);
    let c = by_key(&rows)["C"][0];
    assert!(!c.is_active());
    assert!(c.notes.as_deref().unwrap().contains("expired"));
}

#[tokio::test]
async fn overlapping_runs_for_one_source_are_rejected() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let h = harness_with(FeedConnector {
        gate: Some((entered.clone(), release.clone())),
        ..FeedConnector::default()
    });

    let pipeline = h.pipeline.clone();
    let first = tokio::spawn(async move { pipeline.run_etl(DataSource::Wfp).await });
    entered.notified().await;

    let err = h.pipeline.run_etl(DataSource::Wfp).await.unwrap_err();
    assert!(matches!(err, SyncError::RunInProgress(DataSource::Wfp)));

    release.notify_one();
    let summary = first.await.unwrap().unwrap();
    assert_eq!(summary.status, RunStatus::Completed);
}

#[tokio::test]
async fn run_reports_land_under_workspace_reports() {
    let dir = tempfile::tempdir().unwrap();
    let feed = Arc::new(FeedConnector::default());
    feed.set(vec![listing("A", "Driver", 10)]).await;
    let config = SyncConfig {
        workspace_root: dir.path().to_path_buf(),
        ..SyncConfig::default()
    };
    let pipeline = SyncPipeline::new(
        config,
        SourceRegistry::builtin(),
        Arc::new(MemoryVacancyStore::new()),
        Arc::new(MemoryRunTracker::new()),
        Arc::new(MemoryOrganizationDirectory::default()),
    )
    .unwrap()
    .with_connector(feed);

    let summary = pipeline.run_etl(DataSource::Wfp).await.unwrap();
    let reports_dir = dir.path().join("reports").join(summary.run_id.to_string());
    assert_eq!(summary.reports_dir.as_deref(), Some(reports_dir.to_str().unwrap()));

    let json: serde_json::Value =
        serde_json::from_slice(&std::fs::read(reports_dir.join("run_summary.json")).unwrap()).unwrap();
    assert_eq!(json["run"]["stats"]["inserted"], 1);
    assert_eq!(json["plan"]["inserted"][0], "A");
    let brief = std::fs::read_to_string(reports_dir.join("brief.md")).unwrap();
    assert!(brief.contains("- Inserted: 1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn scheduler_is_built_only_when_enabled() {
    let pipeline = |scheduler_enabled| {
        SyncPipeline::new(
            SyncConfig {
                scheduler_enabled,
                ..SyncConfig::default()
            },
            SourceRegistry::builtin(),
            Arc::new(MemoryVacancyStore::new()),
            Arc::new(MemoryRunTracker::new()),
            Arc::new(MemoryOrganizationDirectory::default()),
        )
        .map(Arc::new)
        .unwrap()
    };

    assert!(build_scheduler(pipeline(false)).await.unwrap().is_none());
    assert!(build_scheduler(pipeline(true)).await.unwrap().is_some());
}
