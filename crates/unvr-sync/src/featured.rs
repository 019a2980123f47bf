use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use unvr_core::{public_listing_url, DataSource, FeaturedSelection};
use unvr_storage::{StoreError, VacancyStore};

pub const DEFAULT_FEATURED_LIMIT: usize = 5;

/// Candidates pulled from the store per requested slot before diversity selection.
const CANDIDATE_FACTOR: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeaturedVacancy {
    pub id: i64,
    pub title: String,
    pub data_source: DataSource,
    pub organization_id: i32,
    pub duty_station: String,
    pub end_date: Option<DateTime<Utc>>,
    pub url: String,
}

/// Pick up to `limit` active vacancies for social posts: the newest row of each
/// organization first, then the newest remaining rows regardless of organization.
pub async fn select_featured(
    store: &dyn VacancyStore,
    selection: &FeaturedSelection,
    limit: usize,
    now: DateTime<Utc>,
    public_base_url: &str,
) -> Result<Vec<FeaturedVacancy>, StoreError> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let candidates = store
        .featured_candidates(selection, now, limit.saturating_mul(CANDIDATE_FACTOR))
        .await?;

    let mut organizations = HashSet::new();
    let mut picked = HashSet::new();
    let mut chosen = Vec::with_capacity(limit);
    for vacancy in &candidates {
        if chosen.len() == limit {
            break;
        }
        if organizations.insert(vacancy.organization_id) {
            picked.insert(vacancy.id);
            chosen.push(vacancy);
        }
    }
    for vacancy in &candidates {
        if chosen.len() == limit {
            break;
        }
        if picked.insert(vacancy.id) {
            chosen.push(vacancy);
        }
    }

    Ok(chosen
        .into_iter()
        .map(|v| FeaturedVacancy {
            id: v.id,
            title: v.listing.title.clone(),
            data_source: v.data_source,
            organization_id: v.organization_id,
            duty_station: v.listing.duty_station.clone(),
            end_date: v.listing.end_date,
            url: public_listing_url(public_base_url, v.id),
        })
        .collect())
}
