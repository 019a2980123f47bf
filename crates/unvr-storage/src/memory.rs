//! In-process store, tracker and organization directory for tests and dry runs.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use unvr_core::{
    append_note, DataSource, FeaturedSelection, NewVacancy, RecentUpdate, RunRecord, RunStats,
    RunStatus, StatusCount, StoredVacancy, VacancyStatus, VacancyUpdate,
};
use uuid::Uuid;

use crate::{OrganizationDirectory, RunTracker, StoreError, VacancyStore};

#[derive(Debug, Default)]
struct VacancyRows {
    rows: Vec<StoredVacancy>,
    next_id: i64,
    writes_left: Option<usize>,
}

impl VacancyRows {
    fn take_write(&mut self) -> Result<(), StoreError> {
        match self.writes_left.as_mut() {
            Some(0) => Err(StoreError::Unavailable(
                "memory store rejected write (injected failure)".to_string(),
            )),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn active_mut(&mut self, source: DataSource, source_job_id: &str) -> Option<&mut StoredVacancy> {
        self.rows
            .iter_mut()
            .find(|r| r.data_source == source && r.is_active() && r.source_job_id() == source_job_id)
    }
}

#[derive(Debug, Default)]
pub struct MemoryVacancyStore {
    state: Mutex<VacancyRows>,
}

impl MemoryVacancyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rows as-is (ids included) and continue numbering after the largest id.
    pub async fn seed(&self, rows: impl IntoIterator<Item = StoredVacancy>) {
        let mut state = self.state.lock().await;
        state.rows.extend(rows);
        state.next_id = state.rows.iter().map(|r| r.id).max().unwrap_or(0);
    }

    pub async fn rows(&self) -> Vec<StoredVacancy> {
        self.state.lock().await.rows.clone()
    }

    /// Allow `writes` more successful mutations, then fail every later one.
    pub async fn fail_writes_after(&self, writes: usize) {
        self.state.lock().await.writes_left = Some(writes);
    }
}

fn featured_matches(vacancy: &StoredVacancy, selection: &FeaturedSelection, now: DateTime<Utc>) -> bool {
    if !vacancy.is_active() {
        return false;
    }
    match selection {
        FeaturedSelection::ExpiringSoon { days } => {
            let until = now + chrono::Duration::days(i64::from(*days));
            vacancy
                .listing
                .end_date
                .is_some_and(|end| end >= now && end < until)
        }
        FeaturedSelection::JobNetwork { name } => vacancy.listing.extra("jn") == Some(name.as_str()),
    }
}

#[async_trait]
impl VacancyStore for MemoryVacancyStore {
    async fn active_by_data_source(
        &self,
        source: DataSource,
    ) -> Result<HashMap<String, StoredVacancy>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .iter()
            .filter(|r| r.data_source == source && r.is_active())
            .map(|r| (r.source_job_id().to_string(), r.clone()))
            .collect())
    }

    async fn closed_keys_by_data_source(
        &self,
        source: DataSource,
    ) -> Result<HashSet<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .iter()
            .filter(|r| r.data_source == source && r.status == VacancyStatus::Closed)
            .map(|r| r.source_job_id().to_string())
            .collect())
    }

    async fn insert(&self, vacancy: &NewVacancy) -> Result<Option<i64>, StoreError> {
        let mut state = self.state.lock().await;
        state.take_write()?;
        if vacancy.status == VacancyStatus::Active
            && state
                .active_mut(vacancy.data_source, &vacancy.listing.source_job_id)
                .is_some()
        {
            return Ok(None);
        }
        state.next_id += 1;
        let id = state.next_id;
        let now = Utc::now();
        state.rows.push(StoredVacancy {
            id,
            data_source: vacancy.data_source,
            organization_id: vacancy.organization_id,
            status: vacancy.status,
            notes: vacancy.notes.clone(),
            created_at: now,
            updated_at: now,
            listing: vacancy.listing.clone(),
        });
        Ok(Some(id))
    }

    async fn update(
        &self,
        source: DataSource,
        source_job_id: &str,
        update: &VacancyUpdate,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.take_write()?;
        let Some(row) = state.active_mut(source, source_job_id) else {
            return Ok(false);
        };
        if row.listing.changed_fields(&update.listing).is_empty() {
            return Ok(false);
        }
        row.listing = update.listing.clone();
        row.organization_id = update.organization_id;
        row.notes = Some(append_note(row.notes.as_deref(), &update.note));
        row.updated_at = Utc::now();
        Ok(true)
    }

    async fn close(
        &self,
        source: DataSource,
        source_job_id: &str,
        note: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.take_write()?;
        let Some(row) = state.active_mut(source, source_job_id) else {
            return Ok(false);
        };
        row.status = VacancyStatus::Closed;
        row.notes = Some(append_note(row.notes.as_deref(), note));
        row.updated_at = Utc::now();
        Ok(true)
    }

    async fn status_counts(&self) -> Result<Vec<StatusCount>, StoreError> {
        let state = self.state.lock().await;
        let mut groups: BTreeMap<(DataSource, i32, &'static str), StatusCount> = BTreeMap::new();
        for row in &state.rows {
            let entry = groups
                .entry((row.data_source, row.organization_id, row.status.as_str()))
                .or_insert_with(|| StatusCount {
                    data_source: row.data_source,
                    organization_id: row.organization_id,
                    status: row.status,
                    count: 0,
                    last_created: None,
                    last_updated: None,
                });
            entry.count += 1;
            entry.last_created = entry.last_created.max(Some(row.created_at));
            entry.last_updated = entry.last_updated.max(Some(row.updated_at));
        }
        Ok(groups.into_values().collect())
    }

    async fn recent_updates(&self, limit: usize) -> Result<Vec<RecentUpdate>, StoreError> {
        let state = self.state.lock().await;
        let mut rows = state
            .rows
            .iter()
            .filter(|r| r.notes.is_some())
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|r| RecentUpdate {
                id: r.id,
                title: r.listing.title.clone(),
                data_source: r.data_source,
                status: r.status,
                notes: r.notes.clone(),
                updated_at: r.updated_at,
            })
            .collect())
    }

    async fn featured_candidates(
        &self,
        selection: &FeaturedSelection,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredVacancy>, StoreError> {
        let state = self.state.lock().await;
        let mut rows = state
            .rows
            .iter()
            .filter(|r| featured_matches(r, selection, now))
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        rows.truncate(limit);
        Ok(rows)
    }
}

#[derive(Debug, Default)]
pub struct MemoryRunTracker {
    runs: Mutex<Vec<RunRecord>>,
}

impl MemoryRunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn runs(&self) -> Vec<RunRecord> {
        self.runs.lock().await.clone()
    }
}

#[async_trait]
impl RunTracker for MemoryRunTracker {
    async fn start_run(
        &self,
        job_name: &str,
        run_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let mut runs = self.runs.lock().await;
        let id = runs.len() as i64 + 1;
        runs.push(RunRecord {
            id,
            run_id,
            job_name: job_name.to_string(),
            status: RunStatus::Running,
            started_at,
            finished_at: None,
            error_message: None,
            stats: None,
        });
        Ok(id)
    }

    async fn finish_run(
        &self,
        id: i64,
        status: RunStatus,
        stats: &RunStats,
        error_message: Option<&str>,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.lock().await;
        let run = runs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::RunNotFound(id))?;
        run.status = status;
        run.stats = Some(stats.clone());
        run.error_message = error_message.map(ToString::to_string);
        run.finished_at = Some(finished_at);
        Ok(())
    }

    async fn latest_run(&self, job_name: &str) -> Result<Option<RunRecord>, StoreError> {
        let runs = self.runs.lock().await;
        Ok(runs
            .iter()
            .filter(|r| r.job_name == job_name)
            .max_by_key(|r| (r.started_at, r.id))
            .cloned())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let runs = self.runs.lock().await;
        let mut out = runs.clone();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        out.truncate(limit);
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganizationEntry {
    pub id: i32,
    pub code: String,
    pub name: String,
    pub short_name: String,
    pub long_name: String,
}

impl OrganizationEntry {
    pub fn new(id: i32, code: &str, name: &str, short_name: &str, long_name: &str) -> Self {
        Self {
            id,
            code: code.to_string(),
            name: name.to_string(),
            short_name: short_name.to_string(),
            long_name: long_name.to_string(),
        }
    }

    fn matches(&self, needle: &str) -> bool {
        [&self.code, &self.name, &self.short_name, &self.long_name]
            .iter()
            .any(|field| field.to_lowercase().contains(needle))
    }
}

#[derive(Debug, Default)]
pub struct MemoryOrganizationDirectory {
    entries: Vec<OrganizationEntry>,
    unavailable: bool,
}

impl MemoryOrganizationDirectory {
    pub fn new(entries: Vec<OrganizationEntry>) -> Self {
        Self {
            entries,
            unavailable: false,
        }
    }

    /// Directory whose every lookup fails, for exercising fallback paths.
    pub fn unavailable() -> Self {
        Self {
            entries: Vec::new(),
            unavailable: true,
        }
    }
}

#[async_trait]
impl OrganizationDirectory for MemoryOrganizationDirectory {
    async fn find_organization(&self, name: &str) -> Result<Option<i32>, StoreError> {
        if self.unavailable {
            return Err(StoreError::Unavailable("organization directory offline".to_string()));
        }
        let needle = name.trim().to_lowercase();
        Ok(self
            .entries
            .iter()
            .find(|entry| entry.matches(&needle))
            .map(|entry| entry.id))
    }
}
