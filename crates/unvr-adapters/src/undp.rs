use serde_json::Value as JsonValue;
use unvr_core::{DataSource, Listing};
use unvr_storage::FetchRequest;

use crate::{
    json_array, json_count, json_text, json_timestamp, parse_body, AdapterError, Connector,
    DetailStub, ListingEntry, ListingFailure, ListingPage,
};

const DEFAULT_PAGE_SIZE: usize = 25;
const API_BASE: &str = "https://estm.fa.em2.oraclecloud.com/hcmRestApi/resources/latest";
const APPLY_BASE: &str = "https://estm.fa.em2.oraclecloud.com/hcmUI/CandidateExperience/en/sites/CX_1/job/";

/// UNDP's Oracle HCM candidate experience site.
#[derive(Debug, Clone)]
pub struct UndpConnector {
    page_size: usize,
}

impl Default for UndpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl UndpConnector {
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

/// Value of the requisition flex field labelled `prompt`, wherever it sits in the list.
fn flex_field(item: &JsonValue, prompt: &str) -> Option<String> {
    item.get("requisitionFlexFields")?
        .as_array()?
        .iter()
        .find(|field| json_text(field, &["Prompt"]).eq_ignore_ascii_case(prompt))
        .map(|field| json_text(field, &["Value"]))
        .filter(|value| !value.is_empty())
}

impl Connector for UndpConnector {
    fn data_source(&self) -> DataSource {
        DataSource::Undp
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn listing_request(&self, page: usize) -> FetchRequest {
        FetchRequest::get(format!(
            "{API_BASE}/recruitingCEJobRequisitions?onlyData=true&expand=all&finder=findReqs;limit={},offset={}",
            self.page_size,
            page * self.page_size
        ))
    }

    fn parse_listing(&self, body: &[u8]) -> Result<ListingPage, AdapterError> {
        let value = parse_body(body)?;
        let search = json_array(&value, &["items"])?
            .first()
            .ok_or_else(|| AdapterError::missing("items[0]"))?;
        let total_count = json_count(search, &["TotalJobsCount"])
            .ok_or_else(|| AdapterError::missing("items[0].TotalJobsCount"))?;
        let parsed = json_array(search, &["requisitionList"])?
            .iter()
            .enumerate()
            .map(|(position, requisition)| {
                let id = json_text(requisition, &["Id"]);
                if id.is_empty() {
                    return Err(ListingFailure::unidentified(position, "Id"));
                }
                let url = format!(
                    "{API_BASE}/recruitingCEJobRequisitionDetails?expand=all&onlyData=true&finder=ById;Id=%22{id}%22,siteNumber=CX_1"
                );
                Ok(ListingEntry::NeedsDetail(DetailStub {
                    key: id,
                    request: FetchRequest::get(url),
                    summary: requisition.clone(),
                }))
            });
        Ok(ListingPage::from_parsed(total_count, parsed))
    }

    fn parse_detail(&self, stub: &DetailStub, body: &[u8]) -> Result<Listing, AdapterError> {
        let value = parse_body(body)?;
        let item = json_array(&value, &["items"])?
            .first()
            .ok_or_else(|| AdapterError::missing("items[0]"))?;
        let summary = &stub.summary;

        let mut title = json_text(summary, &["Title"]);
        if title.is_empty() {
            title = json_text(item, &["Title"]);
        }
        let mut listing = Listing {
            source_job_id: stub.key.clone(),
            title,
            description: json_text(item, &["ExternalDescriptionStr"]),
            duty_station: json_text(summary, &["PrimaryLocation"]),
            department: flex_field(item, "Agency").unwrap_or_else(|| "UNDP".to_string()),
            recruitment_type: json_text(item, &["RequisitionType"]),
            start_date: json_timestamp(item, &["ExternalPostedStartDate"]),
            end_date: json_timestamp(item, &["ExternalPostedEndDate"]),
            apply_link: format!("{APPLY_BASE}{}", stub.key),
            ..Listing::default()
        };

        let extras = [
            ("jn", flex_field(item, "Practice Area")),
            ("jl", flex_field(item, "Grade")),
            ("category_code", Some(json_text(item, &["Category"]))),
            ("job_family_code", Some(json_text(summary, &["JobFamily"]))),
            ("job_code_title", Some(json_text(summary, &["JobFunction"]))),
            ("language", Some(json_text(summary, &["Language"]))),
        ];
        for (key, value) in extras {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                listing.extra_fields.insert(key.to_string(), value);
            }
        }
        Ok(listing)
    }
}
