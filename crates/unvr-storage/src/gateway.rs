//! Store gateway contracts. Backing engines live in [`crate::postgres`] and [`crate::memory`].

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use unvr_core::{
    DataSource, FeaturedSelection, NewVacancy, RecentUpdate, RunRecord, RunStats, RunStatus,
    StatusCount, StoredVacancy, VacancyUpdate,
};
use uuid::Uuid;

use crate::StoreError;

/// Per-row vacancy persistence. Every mutation is a single atomic write and is
/// idempotent under retry: re-applying it leaves the store unchanged.
#[async_trait]
pub trait VacancyStore: Send + Sync {
    /// Active rows for one source keyed by `source_job_id`.
    async fn active_by_data_source(
        &self,
        source: DataSource,
    ) -> Result<HashMap<String, StoredVacancy>, StoreError>;

    /// Keys of the source that have at least one closed row.
    async fn closed_keys_by_data_source(
        &self,
        source: DataSource,
    ) -> Result<HashSet<String>, StoreError>;

    /// Returns the new row id, or `None` when an active row already holds the natural key.
    async fn insert(&self, vacancy: &NewVacancy) -> Result<Option<i64>, StoreError>;

    /// Returns `false` when the row is not active or already carries these field values.
    async fn update(
        &self,
        source: DataSource,
        source_job_id: &str,
        update: &VacancyUpdate,
    ) -> Result<bool, StoreError>;

    /// Returns `false` when there is no active row to close.
    async fn close(
        &self,
        source: DataSource,
        source_job_id: &str,
        note: &str,
    ) -> Result<bool, StoreError>;

    async fn status_counts(&self) -> Result<Vec<StatusCount>, StoreError>;

    async fn recent_updates(&self, limit: usize) -> Result<Vec<RecentUpdate>, StoreError>;

    /// Active rows matching the selection, newest first.
    async fn featured_candidates(
        &self,
        selection: &FeaturedSelection,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredVacancy>, StoreError>;
}

/// Audit trail of ETL runs (one row per run).
#[async_trait]
pub trait RunTracker: Send + Sync {
    async fn start_run(
        &self,
        job_name: &str,
        run_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    async fn finish_run(
        &self,
        id: i64,
        status: RunStatus,
        stats: &RunStats,
        error_message: Option<&str>,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn latest_run(&self, job_name: &str) -> Result<Option<RunRecord>, StoreError>;

    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError>;
}

/// Organization catalogue lookup: case-insensitive substring match on code,
/// name, short name or long name; first match wins.
#[async_trait]
pub trait OrganizationDirectory: Send + Sync {
    async fn find_organization(&self, name: &str) -> Result<Option<i32>, StoreError>;
}
