//! Postgres-backed gateway. Every mutation is one guarded statement, so a retried
//! write finds nothing left to do.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::warn;
use unvr_core::{
    DataSource, FeaturedSelection, Listing, NewVacancy, RecentUpdate, RunRecord, RunStats,
    RunStatus, StatusCount, StoredVacancy, VacancyStatus, VacancyUpdate,
};
use uuid::Uuid;

use crate::{OrganizationDirectory, RunTracker, StoreError, VacancyStore};

const VACANCY_COLUMNS: &str = r#"
    id, job_id, data_source, organization_id, job_title, job_description, duty_station,
    department, recruitment_type, start_date, end_date, extra_fields, apply_link,
    status, notes, created_at, updated_at
"#;

fn parse_source(value: String) -> Result<DataSource, StoreError> {
    value
        .parse()
        .map_err(|_| StoreError::InvalidColumn { column: "data_source", value })
}

fn parse_status(value: String) -> Result<VacancyStatus, StoreError> {
    VacancyStatus::parse(&value).ok_or(StoreError::InvalidColumn { column: "status", value })
}

fn vacancy_from_row(row: &PgRow) -> Result<StoredVacancy, StoreError> {
    let extra_fields: Option<Json<BTreeMap<String, String>>> = row.try_get("extra_fields")?;
    Ok(StoredVacancy {
        id: row.try_get("id")?,
        data_source: parse_source(row.try_get("data_source")?)?,
        organization_id: row.try_get("organization_id")?,
        status: parse_status(row.try_get("status")?)?,
        notes: row.try_get("notes")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        listing: Listing {
            source_job_id: row.try_get("job_id")?,
            title: row.try_get("job_title")?,
            description: row.try_get::<Option<String>, _>("job_description")?.unwrap_or_default(),
            duty_station: row.try_get::<Option<String>, _>("duty_station")?.unwrap_or_default(),
            department: row.try_get::<Option<String>, _>("department")?.unwrap_or_default(),
            recruitment_type: row
                .try_get::<Option<String>, _>("recruitment_type")?
                .unwrap_or_default(),
            start_date: row.try_get("start_date")?,
            end_date: row.try_get("end_date")?,
            extra_fields: extra_fields.map(|j| j.0).unwrap_or_default(),
            apply_link: row.try_get::<Option<String>, _>("apply_link")?.unwrap_or_default(),
        },
    })
}

#[derive(Debug, Clone)]
pub struct PgVacancyStore {
    pool: PgPool,
}

impl PgVacancyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn select_vacancies(
        &self,
        source: DataSource,
        status: VacancyStatus,
    ) -> Result<Vec<StoredVacancy>, StoreError> {
        let sql = format!(
            "SELECT {VACANCY_COLUMNS} FROM job_vacancies WHERE data_source = $1 AND status = $2 ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(source.as_str())
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(vacancy_from_row).collect()
    }
}

#[async_trait]
impl VacancyStore for PgVacancyStore {
    async fn active_by_data_source(
        &self,
        source: DataSource,
    ) -> Result<HashMap<String, StoredVacancy>, StoreError> {
        let rows = self.select_vacancies(source, VacancyStatus::Active).await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.source_job_id().to_string(), r))
            .collect())
    }

    async fn closed_keys_by_data_source(
        &self,
        source: DataSource,
    ) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT job_id
              FROM job_vacancies
             WHERE data_source = $1
               AND status = 'closed'
            "#,
        )
        .bind(source.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("job_id").map_err(StoreError::from))
            .collect()
    }

    async fn insert(&self, vacancy: &NewVacancy) -> Result<Option<i64>, StoreError> {
        let listing = &vacancy.listing;
        let row = sqlx::query(
            r#"
            INSERT INTO job_vacancies (
                job_id, data_source, organization_id, job_title, job_description, duty_station,
                department, recruitment_type, start_date, end_date, extra_fields, apply_link,
                status, notes, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NOW(), NOW())
            ON CONFLICT (job_id, data_source) WHERE status = 'active' DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&listing.source_job_id)
        .bind(vacancy.data_source.as_str())
        .bind(vacancy.organization_id)
        .bind(&listing.title)
        .bind(&listing.description)
        .bind(&listing.duty_station)
        .bind(&listing.department)
        .bind(&listing.recruitment_type)
        .bind(listing.start_date)
        .bind(listing.end_date)
        .bind(Json(&listing.extra_fields))
        .bind(&listing.apply_link)
        .bind(vacancy.status.as_str())
        .bind(vacancy.notes.as_deref())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.try_get::<i64, _>("id"))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn update(
        &self,
        source: DataSource,
        source_job_id: &str,
        update: &VacancyUpdate,
    ) -> Result<bool, StoreError> {
        let listing = &update.listing;
        let result = sqlx::query(
            r#"
            UPDATE job_vacancies
               SET job_title = $3,
                   job_description = $4,
                   duty_station = $5,
                   end_date = $6,
                   department = $7,
                   recruitment_type = $8,
                   start_date = $9,
                   extra_fields = $10,
                   apply_link = $11,
                   organization_id = $12,
                   notes = CASE WHEN notes IS NULL OR notes = '' THEN $13
                                ELSE notes || '; ' || $13 END,
                   updated_at = NOW()
             WHERE job_id = $1
               AND data_source = $2
               AND status = 'active'
               AND (job_title IS DISTINCT FROM $3
                    OR COALESCE(job_description, '') IS DISTINCT FROM $4
                    OR COALESCE(duty_station, '') IS DISTINCT FROM $5
                    OR end_date IS DISTINCT FROM $6)
            "#,
        )
        .bind(source_job_id)
        .bind(source.as_str())
        .bind(&listing.title)
        .bind(&listing.description)
        .bind(&listing.duty_station)
        .bind(listing.end_date)
        .bind(&listing.department)
        .bind(&listing.recruitment_type)
        .bind(listing.start_date)
        .bind(Json(&listing.extra_fields))
        .bind(&listing.apply_link)
        .bind(update.organization_id)
        .bind(&update.note)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn close(
        &self,
        source: DataSource,
        source_job_id: &str,
        note: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_vacancies
               SET status = 'closed',
                   notes = CASE WHEN notes IS NULL OR notes = '' THEN $3
                                ELSE notes || '; ' || $3 END,
                   updated_at = NOW()
             WHERE job_id = $1
               AND data_source = $2
               AND status = 'active'
            "#,
        )
        .bind(source_job_id)
        .bind(source.as_str())
        .bind(note)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn status_counts(&self) -> Result<Vec<StatusCount>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT data_source,
                   organization_id,
                   status,
                   COUNT(*) AS count,
                   MAX(created_at) AS last_created,
                   MAX(updated_at) AS last_updated
              FROM job_vacancies
             GROUP BY data_source, organization_id, status
             ORDER BY data_source, organization_id, status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let raw_source: String = row.try_get("data_source")?;
            let Ok(data_source) = raw_source.parse::<DataSource>() else {
                warn!(data_source = %raw_source, "skipping rows from unknown data source");
                continue;
            };
            out.push(StatusCount {
                data_source,
                organization_id: row.try_get("organization_id")?,
                status: parse_status(row.try_get("status")?)?,
                count: row.try_get("count")?,
                last_created: row.try_get("last_created")?,
                last_updated: row.try_get("last_updated")?,
            });
        }
        Ok(out)
    }

    async fn recent_updates(&self, limit: usize) -> Result<Vec<RecentUpdate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_title, data_source, status, notes, updated_at
              FROM job_vacancies
             WHERE notes IS NOT NULL AND notes <> ''
             ORDER BY updated_at DESC, id DESC
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let raw_source: String = row.try_get("data_source")?;
            let Ok(data_source) = raw_source.parse::<DataSource>() else {
                warn!(data_source = %raw_source, "skipping rows from unknown data source");
                continue;
            };
            out.push(RecentUpdate {
                id: row.try_get("id")?,
                title: row.try_get("job_title")?,
                data_source,
                status: parse_status(row.try_get("status")?)?,
                notes: row.try_get("notes")?,
                updated_at: row.try_get("updated_at")?,
            });
        }
        Ok(out)
    }

    async fn featured_candidates(
        &self,
        selection: &FeaturedSelection,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredVacancy>, StoreError> {
        let rows = match selection {
            FeaturedSelection::ExpiringSoon { days } => {
                let sql = format!(
                    "SELECT {VACANCY_COLUMNS} FROM job_vacancies
                      WHERE status = 'active' AND end_date >= $1 AND end_date < $2
                      ORDER BY created_at DESC, id DESC LIMIT $3"
                );
                sqlx::query(&sql)
                    .bind(now)
                    .bind(now + chrono::Duration::days(i64::from(*days)))
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
            FeaturedSelection::JobNetwork { name } => {
                let sql = format!(
                    "SELECT {VACANCY_COLUMNS} FROM job_vacancies
                      WHERE status = 'active' AND extra_fields ->> 'jn' = $1
                      ORDER BY created_at DESC, id DESC LIMIT $2"
                );
                sqlx::query(&sql)
                    .bind(name)
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(vacancy_from_row).collect()
    }
}

#[derive(Debug, Clone)]
pub struct PgRunTracker {
    pool: PgPool,
}

impl PgRunTracker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn run_from_row(row: &PgRow) -> Result<RunRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let stats: Option<Json<RunStats>> = row.try_get("stats")?;
    Ok(RunRecord {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        job_name: row.try_get("job_name")?,
        status: RunStatus::parse(&status).ok_or(StoreError::InvalidColumn {
            column: "status",
            value: status,
        })?,
        started_at: row.try_get("start_time")?,
        finished_at: row.try_get("end_time")?,
        error_message: row.try_get("error_message")?,
        stats: stats.map(|j| j.0),
    })
}

#[async_trait]
impl RunTracker for PgRunTracker {
    async fn start_run(
        &self,
        job_name: &str,
        run_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO job_executions (run_id, job_name, status, start_time)
            VALUES ($1, $2, 'running', $3)
            RETURNING id
            "#,
        )
        .bind(run_id)
        .bind(job_name)
        .bind(started_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    async fn finish_run(
        &self,
        id: i64,
        status: RunStatus,
        stats: &RunStats,
        error_message: Option<&str>,
        finished_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_executions
               SET status = $2,
                   end_time = $3,
                   error_message = $4,
                   stats = $5
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(finished_at)
        .bind(error_message)
        .bind(Json(stats))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(id));
        }
        Ok(())
    }

    async fn latest_run(&self, job_name: &str) -> Result<Option<RunRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, run_id, job_name, status, start_time, end_time, error_message, stats
              FROM job_executions
             WHERE job_name = $1
             ORDER BY start_time DESC, id DESC
             LIMIT 1
            "#,
        )
        .bind(job_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, job_name, status, start_time, end_time, error_message, stats
              FROM job_executions
             ORDER BY start_time DESC, id DESC
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }
}

#[derive(Debug, Clone)]
pub struct PgOrganizationDirectory {
    pool: PgPool,
}

impl PgOrganizationDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// `%needle%` for ILIKE with `\` escaping the pattern metacharacters.
fn contains_pattern(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len() + 2);
    escaped.push('%');
    for ch in needle.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

#[async_trait]
impl OrganizationDirectory for PgOrganizationDirectory {
    async fn find_organization(&self, name: &str) -> Result<Option<i32>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id
              FROM organization
             WHERE code ILIKE $1 ESCAPE '\'
                OR name ILIKE $1 ESCAPE '\'
                OR short_name ILIKE $1 ESCAPE '\'
                OR long_name ILIKE $1 ESCAPE '\'
             ORDER BY id
             LIMIT 1
            "#,
        )
        .bind(contains_pattern(name.trim()))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get::<i32, _>("id"))
            .transpose()
            .map_err(StoreError::from)
    }
}
