use serde_json::{json, Value as JsonValue};
use unvr_core::{DataSource, Listing};
use unvr_storage::FetchRequest;

use crate::{
    json_array, json_at, json_count, json_text, json_timestamp, parse_body, AdapterError,
    Connector, DetailStub, ListingEntry, ListingFailure, ListingPage,
};

const DEFAULT_PAGE_SIZE: usize = 10;
const LIST_URL: &str = "https://careers.un.org/api/public/opening/jo/list/filteredV2/en";
const DETAIL_BASE: &str = "https://careers.un.org/api/public/opening/jo";
const APPLY_BASE: &str = "https://careers.un.org/jobSearchDescription/";

/// UN Secretariat careers portal (Inspira).
#[derive(Debug, Clone)]
pub struct InspiraConnector {
    page_size: usize,
}

impl Default for InspiraConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl InspiraConnector {
    pub fn new() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: Option<usize>) -> Self {
        if let Some(size) = page_size.filter(|s| *s > 0) {
            self.page_size = size;
        }
        self
    }
}

fn opening_to_listing(opening: &JsonValue) -> Listing {
    let job_id = json_text(opening, &["jobId"]);
    let mut listing = Listing {
        apply_link: format!("{APPLY_BASE}{job_id}?language=en"),
        source_job_id: job_id,
        title: json_text(opening, &["jobTitle"]),
        description: json_text(opening, &["jobDescription"]),
        duty_station: opening
            .get("dutyStation")
            .and_then(|stations| stations.get(0))
            .map(|station| json_text(station, &["description"]))
            .unwrap_or_default(),
        department: json_text(opening, &["dept", "name"]),
        recruitment_type: json_text(opening, &["recruitmentType"]),
        start_date: json_timestamp(opening, &["startDate"]),
        end_date: json_timestamp(opening, &["endDate"]),
        ..Listing::default()
    };

    let extras = [
        ("jn", json_text(opening, &["jn", "name"])),
        ("jf", json_text(opening, &["jf", "Name"])),
        ("jc", json_text(opening, &["jc", "name"])),
        ("jl", json_text(opening, &["jl", "name"])),
        ("category_code", json_text(opening, &["categoryCode"])),
        ("job_code_title", json_text(opening, &["jobCodeTitle"])),
        ("job_family_code", json_text(opening, &["jobFamilyCode"])),
        ("job_level", json_text(opening, &["jobLevel"])),
        ("language", json_text(opening, &["language"])),
    ];
    for (key, value) in extras {
        if !value.is_empty() {
            listing.extra_fields.insert(key.to_string(), value);
        }
    }
    listing
}

impl Connector for InspiraConnector {
    fn data_source(&self) -> DataSource {
        DataSource::Inspira
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn listing_request(&self, page: usize) -> FetchRequest {
        FetchRequest::post_json(
            LIST_URL,
            json!({
                "filterConfig": { "keyword": "" },
                "pagination": {
                    "page": page,
                    "itemPerPage": self.page_size,
                    "sortBy": "startDate",
                    "sortDirection": -1,
                },
            }),
        )
    }

    fn parse_listing(&self, body: &[u8]) -> Result<ListingPage, AdapterError> {
        let value = parse_body(body)?;
        let total_count =
            json_count(&value, &["data", "count"]).ok_or_else(|| AdapterError::missing("data.count"))?;
        let mut page = ListingPage {
            total_count,
            ..ListingPage::default()
        };
        for (position, opening) in json_array(&value, &["data", "list"])?.iter().enumerate() {
            let listing = opening_to_listing(opening);
            if listing.source_job_id.is_empty() {
                page.failures.push(ListingFailure::unidentified(position, "jobId"));
                continue;
            }
            if !listing.description.is_empty() {
                page.entries.push(ListingEntry::Ready(listing));
                continue;
            }
            page.entries.push(ListingEntry::NeedsDetail(DetailStub {
                request: FetchRequest::get(format!("{DETAIL_BASE}/{}/en", listing.source_job_id)),
                key: listing.source_job_id,
                summary: opening.clone(),
            }));
        }
        Ok(page)
    }

    fn parse_detail(&self, stub: &DetailStub, body: &[u8]) -> Result<Listing, AdapterError> {
        let value = parse_body(body)?;
        let detail = json_at(&value, &["data"]).ok_or_else(|| AdapterError::missing("data"))?;
        let full = opening_to_listing(detail);
        let mut listing = opening_to_listing(&stub.summary);
        listing.description = full.description;
        if listing.title.is_empty() {
            listing.title = full.title;
        }
        if listing.end_date.is_none() {
            listing.end_date = full.end_date;
        }
        for (key, value) in full.extra_fields {
            listing.extra_fields.entry(key).or_insert(value);
        }
        Ok(listing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_request_uses_zero_based_page_payload() {
        let body = InspiraConnector::new().listing_request(4).json_body.unwrap();
        assert_eq!(body["pagination"]["page"], 4);
        assert_eq!(body["pagination"]["itemPerPage"], 10);
        assert_eq!(body["pagination"]["sortDirection"], -1);
    }

    #[test]
    fn openings_without_job_id_are_recorded_as_failures() {
        let page = InspiraConnector::new()
            .parse_listing(
                br#"{"data": {"count": 2, "list": [
                    {"jobTitle": "Associate Expert"},
                    {"jobId": 250002, "jobTitle": "Statistician", "jobDescription": "<p>Data</p>"}
                ]}}"#,
            )
            .unwrap();
        assert_eq!(page.total_count, 2);
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.failures.len(), 1);
        assert!(page.failures[0].error.contains("jobId"));
    }

    #[test]
    fn opening_maps_nested_names() {
        let listing = opening_to_listing(&json!({
            "jobId": 250001,
            "jobTitle": "Programme Officer",
            "dutyStation": [{"description": "NAIROBI"}],
            "dept": {"name": "United Nations Environment Programme"},
            "jn": {"name": "Economic, Social and Development"},
            "jf": {"Name": "Programme Management"},
        }));
        assert_eq!(listing.source_job_id, "250001");
        assert_eq!(listing.duty_station, "NAIROBI");
        assert_eq!(listing.extra("jn"), Some("Economic, Social and Development"));
        assert_eq!(listing.extra("jf"), Some("Programme Management"));
        assert_eq!(
            listing.apply_link,
            "https://careers.un.org/jobSearchDescription/250001?language=en"
        );
    }
}
