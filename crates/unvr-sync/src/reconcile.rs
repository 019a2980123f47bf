//! Diff of one source's fresh listings against its stored active rows.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use unvr_core::{
    DataSource, Listing, NewVacancy, StoredVacancy, TrackedField, VacancyStatus, VacancyUpdate,
    NOTE_SEPARATOR,
};

use crate::OrganizationResolver;

/// Before/after values in update notes are cut to this many characters.
pub const NOTE_VALUE_LIMIT: usize = 120;

pub struct ReconcileContext<'a> {
    pub now: DateTime<Utc>,
    pub resolver: &'a OrganizationResolver,
    /// Keys of the source that already have a closed row.
    pub closed_keys: &'a HashSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub field: TrackedField,
    pub before: String,
    pub after: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedUpdate {
    pub source_job_id: String,
    pub changes: Vec<FieldChange>,
    pub update: VacancyUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosureReason {
    Ghost,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Closure {
    pub source_job_id: String,
    pub reason: ClosureReason,
    pub note: String,
    /// The row is inserted already closed; there is no separate close write.
    pub applied_on_insert: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcilePlan {
    pub inserts: Vec<NewVacancy>,
    pub updates: Vec<PlannedUpdate>,
    pub ghost_closures: Vec<Closure>,
    pub expired_closures: Vec<Closure>,
    pub listings_seen: usize,
    pub unchanged: usize,
    pub duplicate_ids: usize,
    pub already_closed: usize,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.ghost_closures.is_empty()
            && self.expired_closures.is_empty()
    }
}

fn stamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn clip(value: &str) -> String {
    if value.chars().count() <= NOTE_VALUE_LIMIT {
        return value.to_string();
    }
    let mut clipped = value.chars().take(NOTE_VALUE_LIMIT).collect::<String>();
    clipped.push_str("...");
    clipped
}

pub fn ghost_note(now: DateTime<Utc>) -> String {
    format!("no longer present in source feed as of {}", stamp(now))
}

pub fn expired_note(end_date: DateTime<Utc>, now: DateTime<Utc>) -> String {
    format!("expired by end date {} as of {}", stamp(end_date), stamp(now))
}

fn update_note(changes: &[FieldChange], now: DateTime<Utc>) -> String {
    let at = stamp(now);
    changes
        .iter()
        .map(|c| {
            format!(
                "{} changed from \"{}\" to \"{}\" on {}",
                c.field.label(),
                clip(&c.before),
                clip(&c.after),
                at
            )
        })
        .collect::<Vec<_>>()
        .join(NOTE_SEPARATOR)
}

/// Classify every incoming listing and every existing active row of `source`.
///
/// Duplicate keys in `incoming` keep their first position but take the last value.
/// Listings that are already past their end date and have no active row are
/// inserted closed, or skipped when the key already has a closed row.
pub async fn reconcile(
    source: DataSource,
    incoming: impl IntoIterator<Item = Listing>,
    existing_active: &HashMap<String, StoredVacancy>,
    ctx: &ReconcileContext<'_>,
) -> ReconcilePlan {
    let mut plan = ReconcilePlan::default();

    let mut order = Vec::new();
    let mut latest: HashMap<String, Listing> = HashMap::new();
    for listing in incoming {
        plan.listings_seen += 1;
        let key = listing.source_job_id.clone();
        if latest.insert(key.clone(), listing).is_some() {
            plan.duplicate_ids += 1;
        } else {
            order.push(key);
        }
    }
    let seen = order.iter().cloned().collect::<HashSet<_>>();

    for key in order {
        let Some(listing) = latest.remove(&key) else {
            continue;
        };
        let expired = listing.end_date.filter(|_| listing.is_expired_at(ctx.now));

        let Some(stored) = existing_active.get(&key) else {
            if expired.is_some() && ctx.closed_keys.contains(&key) {
                plan.already_closed += 1;
                continue;
            }
            let organization_id = ctx
                .resolver
                .resolve_department(source, &listing.department)
                .await;
            let (status, notes) = match expired {
                Some(end) => {
                    let note = expired_note(end, ctx.now);
                    plan.expired_closures.push(Closure {
                        source_job_id: key.clone(),
                        reason: ClosureReason::Expired,
                        note: note.clone(),
                        applied_on_insert: true,
                    });
                    (VacancyStatus::Closed, Some(note))
                }
                None => (VacancyStatus::Active, None),
            };
            plan.inserts.push(NewVacancy {
                data_source: source,
                organization_id,
                status,
                notes,
                listing,
            });
            continue;
        };

        let changed = stored.listing.changed_fields(&listing);
        if changed.is_empty() {
            plan.unchanged += 1;
        } else {
            let changes = changed
                .into_iter()
                .map(|field| FieldChange {
                    field,
                    before: field.value_of(&stored.listing),
                    after: field.value_of(&listing),
                })
                .collect::<Vec<_>>();
            let organization_id = ctx
                .resolver
                .resolve_department(source, &listing.department)
                .await;
            plan.updates.push(PlannedUpdate {
                source_job_id: key.clone(),
                update: VacancyUpdate {
                    organization_id,
                    note: update_note(&changes, ctx.now),
                    listing,
                },
                changes,
            });
        }

        if let Some(end) = expired {
            plan.expired_closures.push(Closure {
                source_job_id: key,
                reason: ClosureReason::Expired,
                note: expired_note(end, ctx.now),
                applied_on_insert: false,
            });
        }
    }

    // Unseen rows past their end date close as expired; the rest are ghosts.
    let mut unseen = existing_active
        .iter()
        .filter(|(key, _)| !seen.contains(*key))
        .collect::<Vec<_>>();
    unseen.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (key, stored) in unseen {
        let expired = stored
            .listing
            .end_date
            .filter(|_| stored.listing.is_expired_at(ctx.now));
        match expired {
            Some(end) => plan.expired_closures.push(Closure {
                source_job_id: key.clone(),
                reason: ClosureReason::Expired,
                note: expired_note(end, ctx.now),
                applied_on_insert: false,
            }),
            None => plan.ghost_closures.push(Closure {
                source_job_id: key.clone(),
                reason: ClosureReason::Ghost,
                note: ghost_note(ctx.now),
                applied_on_insert: false,
            }),
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;
    use unvr_core::DEFAULT_ORGANIZATION_ID;
    use unvr_storage::{MemoryOrganizationDirectory, OrganizationEntry};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap()
    }

    fn resolver() -> OrganizationResolver {
        OrganizationResolver::new(
            Arc::new(MemoryOrganizationDirectory::new(vec![OrganizationEntry::new(
                12,
                "WFP",
                "World Food Programme",
                "WFP",
                "United Nations World Food Programme",
            )])),
            DEFAULT_ORGANIZATION_ID,
        )
    }

    fn listing(id: &str, title: &str) -> Listing {
        Listing {
            source_job_id: id.to_string(),
            title: title.to_string(),
            duty_station: "Rome".to_string(),
            department: "World Food Programme".to_string(),
            end_date: Some(now() + Duration::days(10)),
            ..Listing::default()
        }
    }

    fn stored(id: i64, listing: Listing) -> StoredVacancy {
        StoredVacancy {
            id,
            data_source: DataSource::Wfp,
            organization_id: 12,
            status: VacancyStatus::Active,
            notes: None,
            created_at: now() - Duration::days(3),
            updated_at: now() - Duration::days(3),
            listing,
        }
    }

    fn active(rows: Vec<StoredVacancy>) -> HashMap<String, StoredVacancy> {
        rows.into_iter()
            .map(|r| (r.source_job_id().to_string(), r))
            .collect()
    }

    async fn plan_for(
        incoming: Vec<Listing>,
        existing: &HashMap<String, StoredVacancy>,
        closed: &HashSet<String>,
    ) -> ReconcilePlan {
        let resolver = resolver();
        let ctx = ReconcileContext {
            now: now(),
            resolver: &resolver,
            closed_keys: closed,
        };
        reconcile(DataSource::Wfp, incoming, existing, &ctx).await
    }

    #[tokio::test]
    async fn unseen_listing_is_inserted_active_with_resolved_org() {
        let plan = plan_for(vec![listing("A", "Driver")], &HashMap::new(), &HashSet::new()).await;
        assert_eq!(plan.inserts.len(), 1);
        assert_eq!(plan.inserts[0].status, VacancyStatus::Active);
        assert_eq!(plan.inserts[0].organization_id, 12);
        assert!(plan.expired_closures.is_empty());
    }

    #[tokio::test]
    async fn missing_rows_are_ghost_closed() {
        let existing = active(vec![
            stored(1, listing("A", "Driver")),
            stored(2, listing("B", "Clerk")),
            stored(3, listing("C", "Analyst")),
        ]);
        let plan = plan_for(
            vec![listing("A", "Driver"), listing("C", "Analyst")],
            &existing,
            &HashSet::new(),
        )
        .await;

        assert_eq!(plan.ghost_closures.len(), 1);
        assert_eq!(plan.ghost_closures[0].source_job_id, "B");
        assert!(plan.ghost_closures[0]
            .note
            .starts_with("no longer present in source feed as of 2026-04-01T12:00:00Z"));
        assert_eq!(plan.unchanged, 2);
        assert!(plan.inserts.is_empty() && plan.updates.is_empty());
    }

    #[tokio::test]
    async fn title_change_is_an_update_with_before_and_after() {
        let existing = active(vec![stored(1, listing("A", "Analyst"))]);
        let plan = plan_for(vec![listing("A", "Senior Analyst")], &existing, &HashSet::new()).await;

        assert_eq!(plan.updates.len(), 1);
        let note = &plan.updates[0].update.note;
        assert!(note.contains("\"Analyst\""));
        assert!(note.contains("\"Senior Analyst\""));
        assert_eq!(
            note,
            "Title changed from \"Analyst\" to \"Senior Analyst\" on 2026-04-01T12:00:00Z"
        );
    }

    #[tokio::test]
    async fn multiple_changes_join_into_one_note() {
        let existing = active(vec![stored(1, listing("A", "Analyst"))]);
        let mut incoming = listing("A", "Analyst");
        incoming.duty_station = "Dakar".to_string();
        incoming.description = "x".repeat(300);
        let plan = plan_for(vec![incoming], &existing, &HashSet::new()).await;

        let update = &plan.updates[0];
        assert_eq!(update.changes.len(), 2);
        let parts = update.update.note.split(NOTE_SEPARATOR).collect::<Vec<_>>();
        assert_eq!(parts.len(), 2);
        assert!(parts[0].starts_with("Description changed from \"\" to \"xxx"));
        assert!(parts[0].contains(&format!("{}...\"", "x".repeat(NOTE_VALUE_LIMIT))));
        assert!(parts[1].starts_with("Duty station changed from \"Rome\" to \"Dakar\""));
    }

    #[tokio::test]
    async fn past_end_date_closes_existing_active_row() {
        let mut old = listing("A", "Driver");
        old.end_date = Some(now() - Duration::days(1));
        let existing = active(vec![stored(1, old.clone())]);
        let plan = plan_for(vec![old], &existing, &HashSet::new()).await;

        assert_eq!(plan.expired_closures.len(), 1);
        let closure = &plan.expired_closures[0];
        assert!(!closure.applied_on_insert);
        assert!(closure.note.starts_with("expired by end date 2026-03-31T12:00:00Z"));
        assert!(plan.updates.is_empty());
    }

    #[tokio::test]
    async fn unseen_row_past_end_date_closes_as_expired_not_ghost() {
        let mut lapsed = listing("B", "Clerk");
        lapsed.end_date = Some(now() - Duration::days(1));
        let existing = active(vec![
            stored(1, listing("A", "Driver")),
            stored(2, lapsed),
            stored(3, listing("C", "Analyst")),
        ]);
        let plan = plan_for(vec![listing("A", "Driver")], &existing, &HashSet::new()).await;

        assert_eq!(plan.expired_closures.len(), 1);
        assert_eq!(plan.expired_closures[0].source_job_id, "B");
        assert_eq!(plan.expired_closures[0].reason, ClosureReason::Expired);
        assert!(plan.expired_closures[0].note.starts_with("expired by end date"));
        let ghosts = plan
            .ghost_closures
            .iter()
            .map(|c| c.source_job_id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ghosts, vec!["C"]);
    }

    #[tokio::test]
    async fn new_expired_listing_is_inserted_closed() {
        let mut old = listing("A", "Driver");
        old.end_date = Some(now() - Duration::days(1));
        let plan = plan_for(vec![old], &HashMap::new(), &HashSet::new()).await;

        assert_eq!(plan.inserts.len(), 1);
        assert_eq!(plan.inserts[0].status, VacancyStatus::Closed);
        assert!(plan.inserts[0].notes.as_deref().unwrap().contains("expired"));
        assert!(plan.expired_closures[0].applied_on_insert);
    }

    #[tokio::test]
    async fn expired_listing_with_closed_history_is_skipped() {
        let mut old = listing("A", "Driver");
        old.end_date = Some(now() - Duration::days(1));
        let closed = HashSet::from(["A".to_string()]);
        let plan = plan_for(vec![old], &HashMap::new(), &closed).await;

        assert!(plan.is_noop());
        assert_eq!(plan.already_closed, 1);
    }

    #[tokio::test]
    async fn reappearing_closed_key_becomes_a_new_row() {
        let closed = HashSet::from(["A".to_string()]);
        let plan = plan_for(vec![listing("A", "Driver")], &HashMap::new(), &closed).await;
        assert_eq!(plan.inserts.len(), 1);
        assert_eq!(plan.inserts[0].status, VacancyStatus::Active);
    }

    #[tokio::test]
    async fn open_ended_listing_is_never_expired() {
        let mut open = listing("A", "Driver");
        open.end_date = None;
        let existing = active(vec![stored(1, open.clone())]);
        let plan = plan_for(vec![open], &existing, &HashSet::new()).await;
        assert!(plan.is_noop());
    }

    #[tokio::test]
    async fn duplicate_ids_keep_the_last_value() {
        let plan = plan_for(
            vec![
                listing("A", "First"),
                listing("B", "Other"),
                listing("A", "Second"),
            ],
            &HashMap::new(),
            &HashSet::new(),
        )
        .await;

        assert_eq!(plan.duplicate_ids, 1);
        assert_eq!(plan.listings_seen, 3);
        let titles = plan
            .inserts
            .iter()
            .map(|v| v.listing.title.as_str())
            .collect::<Vec<_>>();
        assert_eq!(titles, vec!["Second", "Other"]);
    }

    #[tokio::test]
    async fn unknown_department_falls_back_to_default_org() {
        let mut odd = listing("A", "Driver");
        odd.department = "NonexistentAgencyXYZ".to_string();
        let plan = plan_for(vec![odd], &HashMap::new(), &HashSet::new()).await;
        assert_eq!(plan.inserts[0].organization_id, DEFAULT_ORGANIZATION_ID);
    }
}
