//! Core domain model for UNVR: normalized listings, stored vacancies and run statistics.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "unvr-core";

/// Organization id used when a department name cannot be resolved ("UN").
pub const DEFAULT_ORGANIZATION_ID: i32 = 128;

/// Separator between entries of the append-only `notes` audit string.
pub const NOTE_SEPARATOR: &str = "; ";

/// One tag per connector. Half of the natural key `(source_job_id, data_source)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Imf,
    Unhcr,
    Wfp,
    Undp,
    Inspira,
    WorldBank,
}

impl DataSource {
    pub const ALL: [DataSource; 6] = [
        DataSource::Imf,
        DataSource::Unhcr,
        DataSource::Wfp,
        DataSource::Inspira,
        DataSource::Undp,
        DataSource::WorldBank,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DataSource::Imf => "imf",
            DataSource::Unhcr => "unhcr",
            DataSource::Wfp => "wfp",
            DataSource::Undp => "undp",
            DataSource::Inspira => "inspira",
            DataSource::WorldBank => "worldbank",
        }
    }

    /// Agency name fed to the organization resolver when a listing carries no department.
    pub fn agency_name(self) -> &'static str {
        match self {
            DataSource::Imf => "IMF",
            DataSource::Unhcr => "UNHCR",
            DataSource::Wfp => "WFP",
            DataSource::Undp => "UNDP",
            DataSource::Inspira => "United Nations Secretariat",
            DataSource::WorldBank => "World Bank",
        }
    }

    /// Name recorded in the run tracker (`job_executions.job_name`).
    pub fn job_name(self) -> String {
        format!("etl:{}", self.as_str())
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDataSource(pub String);

impl fmt::Display for UnknownDataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown data source `{}`", self.0)
    }
}

impl std::error::Error for UnknownDataSource {}

impl FromStr for DataSource {
    type Err = UnknownDataSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "imf" => Ok(DataSource::Imf),
            "unhcr" => Ok(DataSource::Unhcr),
            "wfp" => Ok(DataSource::Wfp),
            "undp" => Ok(DataSource::Undp),
            "inspira" | "un-secretariat" => Ok(DataSource::Inspira),
            "worldbank" | "world-bank" | "wb" => Ok(DataSource::WorldBank),
            other => Err(UnknownDataSource(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VacancyStatus {
    Active,
    Closed,
}

impl VacancyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VacancyStatus::Active => "active",
            VacancyStatus::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(VacancyStatus::Active),
            "closed" => Some(VacancyStatus::Closed),
            _ => None,
        }
    }
}

/// Normalized vacancy emitted by a connector for one fetch cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Listing {
    pub source_job_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub duty_station: String,
    pub department: String,
    pub recruitment_type: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub extra_fields: BTreeMap<String, String>,
    pub apply_link: String,
}

impl Listing {
    /// Open-ended listings (no end date) never expire.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.end_date.is_some_and(|end| end < now)
    }

    pub fn extra(&self, key: &str) -> Option<&str> {
        self.extra_fields.get(key).map(String::as_str)
    }

    /// Mutable fields whose values differ between `self` (stored) and `incoming`.
    pub fn changed_fields(&self, incoming: &Listing) -> Vec<TrackedField> {
        TrackedField::ALL
            .into_iter()
            .filter(|field| field.value_of(self) != field.value_of(incoming))
            .collect()
    }
}

/// Fields compared between runs to decide whether a stored vacancy changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedField {
    Title,
    Description,
    EndDate,
    DutyStation,
}

impl TrackedField {
    pub const ALL: [TrackedField; 4] = [
        TrackedField::Title,
        TrackedField::Description,
        TrackedField::EndDate,
        TrackedField::DutyStation,
    ];

    pub fn label(self) -> &'static str {
        match self {
            TrackedField::Title => "Title",
            TrackedField::Description => "Description",
            TrackedField::EndDate => "End date",
            TrackedField::DutyStation => "Duty station",
        }
    }

    /// Display value used for comparison and in audit notes; missing dates render as `none`.
    pub fn value_of(self, listing: &Listing) -> String {
        match self {
            TrackedField::Title => listing.title.clone(),
            TrackedField::Description => listing.description.clone(),
            TrackedField::EndDate => listing
                .end_date
                .map(|d| d.to_rfc3339())
                .unwrap_or_else(|| "none".to_string()),
            TrackedField::DutyStation => listing.duty_station.clone(),
        }
    }
}

/// Persisted vacancy row with lifecycle status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredVacancy {
    pub id: i64,
    pub data_source: DataSource,
    pub organization_id: i32,
    pub status: VacancyStatus,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub listing: Listing,
}

impl StoredVacancy {
    pub fn is_active(&self) -> bool {
        self.status == VacancyStatus::Active
    }

    pub fn source_job_id(&self) -> &str {
        &self.listing.source_job_id
    }
}

/// Row to insert. `status` is `Closed` when the listing is already expired at run time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewVacancy {
    pub data_source: DataSource,
    pub organization_id: i32,
    pub status: VacancyStatus,
    pub notes: Option<String>,
    pub listing: Listing,
}

/// Replacement field values for an active row plus the note describing the change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VacancyUpdate {
    pub organization_id: i32,
    pub listing: Listing,
    pub note: String,
}

/// Append `entry` to an audit string without ever dropping earlier entries.
pub fn append_note(existing: Option<&str>, entry: &str) -> String {
    match existing {
        Some(prev) if !prev.trim().is_empty() => format!("{prev}{NOTE_SEPARATOR}{entry}"),
        _ => entry.to_string(),
    }
}

/// Stable public listing URL for a stored vacancy.
pub fn public_listing_url(base_url: &str, vacancy_id: i64) -> String {
    format!("{}/job/{}", base_url.trim_end_matches('/'), vacancy_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// Structured per-run statistics, enough for the status dashboard to render as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunStats {
    pub pages_fetched: usize,
    pub page_failures: usize,
    pub listing_failures: usize,
    pub listings_seen: usize,
    pub duplicate_ids: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub already_closed: usize,
    pub ghost_closed: usize,
    /// Ghost closures not applied because the first listing page never arrived.
    pub ghost_withheld: usize,
    pub expired_closed: usize,
    pub duration_ms: u64,
}

impl RunStats {
    /// True when the first listing page failed, so nothing at all was crawled.
    pub fn feed_unavailable(&self) -> bool {
        self.pages_fetched == 0 && self.page_failures > 0
    }
}

/// One row of the run audit table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub run_id: Uuid,
    pub job_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub stats: Option<RunStats>,
}

/// Aggregate row for the status dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCount {
    pub data_source: DataSource,
    pub organization_id: i32,
    pub status: VacancyStatus,
    pub count: i64,
    pub last_created: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Recently annotated vacancy for the status dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentUpdate {
    pub id: i64,
    pub title: String,
    pub data_source: DataSource,
    pub status: VacancyStatus,
    pub notes: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Read-side selection for social publishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeaturedSelection {
    /// Active vacancies whose end date falls within the next `days` days.
    ExpiringSoon { days: u32 },
    /// Active vacancies whose `jn` extra field equals the given job network.
    JobNetwork { name: String },
}
