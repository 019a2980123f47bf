//! ETL orchestration: per-source runs, reconciliation, scheduling and run reports.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use unvr_adapters::CrawlSettings;
use unvr_core::{DataSource, DEFAULT_ORGANIZATION_ID};
use unvr_storage::{BackoffPolicy, HttpClientConfig, StoreError};

mod featured;
mod pipeline;
mod reconcile;
mod resolver;

pub use featured::{select_featured, FeaturedVacancy, DEFAULT_FEATURED_LIMIT};
pub use pipeline::{build_scheduler, RunSummary, SyncPipeline};
pub use reconcile::{
    expired_note, ghost_note, reconcile, Closure, ClosureReason, FieldChange, PlannedUpdate,
    ReconcileContext, ReconcilePlan, NOTE_VALUE_LIMIT,
};
pub use resolver::OrganizationResolver;

pub const CRATE_NAME: &str = "unvr-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("an etl run for {0} is already in progress")]
    RunInProgress(DataSource),
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: DataSource,
    pub display_name: String,
    pub enabled: bool,
    /// Six-field cron expression (seconds first).
    pub schedule: String,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    /// Reads `sources.yaml` under `workspace_root`, or the built-in daily schedule when absent.
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        if !path.exists() {
            info!(path = %path.display(), "no sources.yaml; using built-in source schedule");
            return Ok(Self::builtin());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn builtin() -> Self {
        let hours = [
            (DataSource::Imf, 1),
            (DataSource::Unhcr, 2),
            (DataSource::Wfp, 3),
            (DataSource::Inspira, 4),
            (DataSource::Undp, 5),
            (DataSource::WorldBank, 6),
        ];
        Self {
            sources: hours
                .into_iter()
                .map(|(source, hour)| SourceConfig {
                    source_id: source,
                    display_name: source.agency_name().to_string(),
                    enabled: true,
                    schedule: format!("0 0 {hour} * * *"),
                    page_size: None,
                    notes: None,
                })
                .collect(),
        }
    }

    pub fn get(&self, source: DataSource) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub scheduler_enabled: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub detail_concurrency: usize,
    pub detail_timeout_secs: u64,
    pub max_pages: usize,
    pub default_org_id: i32,
    pub public_base_url: String,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            workspace_root: PathBuf::from("."),
            scheduler_enabled: false,
            user_agent: "unvr-bot/0.1".to_string(),
            http_timeout_secs: 20,
            http_max_retries: 0,
            detail_concurrency: 4,
            detail_timeout_secs: 30,
            max_pages: 500,
            default_org_id: DEFAULT_ORGANIZATION_ID,
            public_base_url: "https://www.unjobzone.com".to_string(),
            web_port: 8000,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            workspace_root: std::env::var("UNVR_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            scheduler_enabled: std::env::var("UNVR_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            user_agent: std::env::var("UNVR_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("UNVR_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            http_max_retries: env_parse("UNVR_HTTP_MAX_RETRIES", defaults.http_max_retries),
            detail_concurrency: env_parse("UNVR_DETAIL_CONCURRENCY", defaults.detail_concurrency),
            detail_timeout_secs: env_parse("UNVR_DETAIL_TIMEOUT_SECS", defaults.detail_timeout_secs),
            max_pages: env_parse("UNVR_MAX_PAGES", defaults.max_pages),
            default_org_id: env_parse("UNVR_DEFAULT_ORG_ID", defaults.default_org_id),
            public_base_url: std::env::var("UNVR_PUBLIC_BASE_URL")
                .unwrap_or(defaults.public_base_url),
            web_port: env_parse("UNVR_WEB_PORT", defaults.web_port),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..BackoffPolicy::default()
            },
            ..HttpClientConfig::default()
        }
    }

    pub fn crawl_settings(&self) -> CrawlSettings {
        CrawlSettings {
            detail_concurrency: self.detail_concurrency.max(1),
            detail_timeout: Duration::from_secs(self.detail_timeout_secs),
            max_pages: self.max_pages,
        }
    }
}
