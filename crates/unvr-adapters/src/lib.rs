//! Source connectors and the paginated crawl engine that drives them.

use std::pin::pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};
use unvr_core::{DataSource, Listing};
use unvr_storage::{FetchError, FetchRequest, HttpFetcher};
use uuid::Uuid;

mod inspira;
mod undp;
mod workday;
mod worldbank;

pub use inspira::InspiraConnector;
pub use undp::UndpConnector;
pub use workday::WorkdayConnector;
pub use worldbank::WorldBankConnector;

pub const CRATE_NAME: &str = "unvr-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("detail fetch timed out after {0:?}")]
    Timeout(Duration),
}

impl AdapterError {
    pub(crate) fn missing(field: &str) -> Self {
        AdapterError::Malformed(format!("missing `{field}`"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

/// Summary entry whose full record needs one more request.
#[derive(Debug, Clone, PartialEq)]
pub struct DetailStub {
    /// Identifier used in logs and failure reports; not necessarily the final `source_job_id`.
    pub key: String,
    pub request: FetchRequest,
    pub summary: JsonValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListingEntry {
    Ready(Listing),
    NeedsDetail(DetailStub),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingPage {
    pub total_count: usize,
    pub entries: Vec<ListingEntry>,
    /// Entries dropped while parsing the page, counted as listing failures.
    pub failures: Vec<ListingFailure>,
}

impl ListingPage {
    pub(crate) fn from_parsed(
        total_count: usize,
        parsed: impl IntoIterator<Item = Result<ListingEntry, ListingFailure>>,
    ) -> Self {
        let mut page = Self {
            total_count,
            ..Self::default()
        };
        for entry in parsed {
            match entry {
                Ok(entry) => page.entries.push(entry),
                Err(failure) => page.failures.push(failure),
            }
        }
        page
    }
}

/// One paginated source. Request building and parsing are pure; the provided
/// fetch methods only add the network round trip.
#[async_trait]
pub trait Connector: Send + Sync {
    fn data_source(&self) -> DataSource;

    fn page_size(&self) -> usize;

    /// Request for the zero-based `page`.
    fn listing_request(&self, page: usize) -> FetchRequest;

    fn parse_listing(&self, body: &[u8]) -> Result<ListingPage, AdapterError>;

    fn parse_detail(&self, stub: &DetailStub, body: &[u8]) -> Result<Listing, AdapterError>;

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &CrawlContext,
        page: usize,
    ) -> Result<ListingPage, AdapterError> {
        let request = self.listing_request(page);
        let response = http
            .send(ctx.run_id, self.data_source().as_str(), &request)
            .await?;
        self.parse_listing(&response.body)
    }

    async fn fetch_detail(
        &self,
        http: &HttpFetcher,
        ctx: &CrawlContext,
        stub: &DetailStub,
    ) -> Result<Listing, AdapterError> {
        let response = http
            .send(ctx.run_id, self.data_source().as_str(), &stub.request)
            .await?;
        self.parse_detail(stub, &response.body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlSettings {
    pub detail_concurrency: usize,
    pub detail_timeout: Duration,
    pub max_pages: usize,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            detail_concurrency: 4,
            detail_timeout: Duration::from_secs(30),
            max_pages: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingFailure {
    pub key: String,
    pub error: String,
}

impl ListingFailure {
    /// Page entry at `position` that carries no identifier in `field`.
    pub(crate) fn unidentified(position: usize, field: &str) -> Self {
        Self {
            key: format!("entry #{position}"),
            error: AdapterError::missing(field).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    Fetched {
        page: usize,
        listings: Vec<Listing>,
        failures: Vec<ListingFailure>,
    },
    Failed {
        page: usize,
        error: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlStats {
    pub pages_fetched: usize,
    pub page_failures: usize,
    pub listing_failures: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrawlOutcome {
    pub listings: Vec<Listing>,
    pub stats: CrawlStats,
}

#[derive(Debug, Clone, Copy, Default)]
struct CrawlCursor {
    page: usize,
    total_pages: Option<usize>,
    exhausted: bool,
}

impl CrawlCursor {
    fn finished(&self, max_pages: usize) -> bool {
        self.exhausted
            || self.page >= max_pages
            || self.total_pages.is_some_and(|total| self.page >= total)
    }
}

/// Lazily crawl every page of `connector`, yielding one outcome per page in order.
///
/// The page count is fixed by the first successful response. A failed first page
/// leaves the total unknown and ends the crawl; later failures only skip their page.
pub fn crawl_pages<'a>(
    connector: &'a dyn Connector,
    http: &'a HttpFetcher,
    ctx: &'a CrawlContext,
    settings: &'a CrawlSettings,
) -> impl Stream<Item = PageOutcome> + Send + 'a {
    stream::unfold(CrawlCursor::default(), move |mut cursor| async move {
        if cursor.finished(settings.max_pages) {
            return None;
        }
        let page = cursor.page;
        cursor.page += 1;

        let outcome = match connector.fetch_listing(http, ctx, page).await {
            Ok(listing_page) => {
                if cursor.total_pages.is_none() {
                    let total = listing_page
                        .total_count
                        .div_ceil(connector.page_size().max(1));
                    if total > settings.max_pages {
                        warn!(
                            source = %connector.data_source(),
                            total,
                            max_pages = settings.max_pages,
                            "page count exceeds ceiling; truncating crawl"
                        );
                    }
                    cursor.total_pages = Some(total);
                }
                let (listings, mut failures) =
                    resolve_entries(connector, http, ctx, settings, listing_page.entries).await;
                for failure in &listing_page.failures {
                    warn!(
                        source = %connector.data_source(),
                        key = %failure.key,
                        error = %failure.error,
                        "listing skipped"
                    );
                }
                failures.splice(0..0, listing_page.failures);
                debug!(
                    source = %connector.data_source(),
                    page,
                    listings = listings.len(),
                    failures = failures.len(),
                    "page crawled"
                );
                PageOutcome::Fetched {
                    page,
                    listings,
                    failures,
                }
            }
            Err(err) => {
                if cursor.total_pages.is_none() {
                    cursor.exhausted = true;
                }
                warn!(source = %connector.data_source(), page, error = %err, "page skipped");
                PageOutcome::Failed {
                    page,
                    error: err.to_string(),
                }
            }
        };
        Some((outcome, cursor))
    })
}

async fn resolve_entries(
    connector: &dyn Connector,
    http: &HttpFetcher,
    ctx: &CrawlContext,
    settings: &CrawlSettings,
    entries: Vec<ListingEntry>,
) -> (Vec<Listing>, Vec<ListingFailure>) {
    let results = stream::iter(entries)
        .map(|entry| async move {
            let stub = match entry {
                ListingEntry::Ready(listing) => return Ok(listing),
                ListingEntry::NeedsDetail(stub) => stub,
            };
            let detail = tokio::time::timeout(
                settings.detail_timeout,
                connector.fetch_detail(http, ctx, &stub),
            )
            .await
            .unwrap_or(Err(AdapterError::Timeout(settings.detail_timeout)));
            detail.map_err(|err| {
                warn!(
                    source = %connector.data_source(),
                    key = %stub.key,
                    error = %err,
                    "listing skipped"
                );
                ListingFailure {
                    key: stub.key.clone(),
                    error: err.to_string(),
                }
            })
        })
        .buffered(settings.detail_concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

    let mut listings = Vec::with_capacity(results.len());
    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok(listing) => listings.push(listing),
            Err(failure) => failures.push(failure),
        }
    }
    (listings, failures)
}

/// Drain [`crawl_pages`] into a finite listing sequence plus statistics.
pub async fn crawl(
    connector: &dyn Connector,
    http: &HttpFetcher,
    ctx: &CrawlContext,
    settings: &CrawlSettings,
) -> CrawlOutcome {
    let mut outcome = CrawlOutcome::default();
    let mut pages = pin!(crawl_pages(connector, http, ctx, settings));
    while let Some(page) = pages.next().await {
        match page {
            PageOutcome::Fetched {
                listings, failures, ..
            } => {
                outcome.stats.pages_fetched += 1;
                outcome.stats.listing_failures += failures.len();
                outcome.listings.extend(listings);
            }
            PageOutcome::Failed { .. } => outcome.stats.page_failures += 1,
        }
    }
    info!(
        source = %connector.data_source(),
        listings = outcome.listings.len(),
        pages = outcome.stats.pages_fetched,
        page_failures = outcome.stats.page_failures,
        listing_failures = outcome.stats.listing_failures,
        "crawl finished"
    );
    outcome
}

/// Connector for `source`, optionally overriding its default page size.
pub fn connector_for_source(source: DataSource, page_size: Option<usize>) -> Box<dyn Connector> {
    match source {
        DataSource::Imf => Box::new(WorkdayConnector::imf().with_page_size(page_size)),
        DataSource::Unhcr => Box::new(WorkdayConnector::unhcr().with_page_size(page_size)),
        DataSource::Wfp => Box::new(WorkdayConnector::wfp().with_page_size(page_size)),
        DataSource::Undp => Box::new(UndpConnector::new().with_page_size(page_size)),
        DataSource::Inspira => Box::new(InspiraConnector::new().with_page_size(page_size)),
        DataSource::WorldBank => Box::new(WorldBankConnector::new().with_page_size(page_size)),
    }
}

pub(crate) fn parse_body(body: &[u8]) -> Result<JsonValue, AdapterError> {
    Ok(serde_json::from_slice(body)?)
}

pub(crate) fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

/// Trimmed text at `path`; numbers are rendered, anything else is empty.
pub(crate) fn json_text(value: &JsonValue, path: &[&str]) -> String {
    match json_at(value, path) {
        Some(JsonValue::String(s)) => s.trim().to_string(),
        Some(JsonValue::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

pub(crate) fn json_count(value: &JsonValue, path: &[&str]) -> Option<usize> {
    match json_at(value, path)? {
        JsonValue::Number(n) => n.as_u64().map(|n| n as usize),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn json_array<'a>(value: &'a JsonValue, path: &[&str]) -> Result<&'a Vec<JsonValue>, AdapterError> {
    json_at(value, path)
        .and_then(JsonValue::as_array)
        .ok_or_else(|| AdapterError::missing(&path.join(".")))
}

pub(crate) fn json_timestamp(value: &JsonValue, path: &[&str]) -> Option<DateTime<Utc>> {
    parse_timestamp(&json_text(value, path))
}

/// Accepts RFC 3339, naive date-times (assumed UTC), plain dates and `20-Mar-2026`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    for fmt in ["%Y-%m-%d", "%d-%b-%Y", "%d %b %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}
