use serde_json::json;
use unvr_core::{DataSource, Listing};
use unvr_storage::FetchRequest;

use crate::{
    json_array, json_count, json_text, json_timestamp, parse_body, AdapterError, Connector,
    DetailStub, ListingEntry, ListingFailure, ListingPage,
};

const DEFAULT_PAGE_SIZE: usize = 20;

/// Workday candidate-experience tenant (IMF, UNHCR and WFP all publish through one).
#[derive(Debug, Clone)]
pub struct WorkdayConnector {
    source: DataSource,
    api_base: &'static str,
    apply_base: &'static str,
    page_size: usize,
}

impl WorkdayConnector {
    pub fn imf() -> Self {
        Self::new(
            DataSource::Imf,
            "https://imf.wd5.myworkdayjobs.com/wday/cxs/imf/IMF",
            "https://imf.wd5.myworkdayjobs.com/en-US/IMF/details/",
        )
    }

    pub fn unhcr() -> Self {
        Self::new(
            DataSource::Unhcr,
            "https://unhcr.wd3.myworkdayjobs.com/wday/cxs/unhcr/External",
            "https://unhcr.wd3.myworkdayjobs.com/en-US/External/details/",
        )
    }

    pub fn wfp() -> Self {
        Self::new(
            DataSource::Wfp,
            "https://wd3.myworkdaysite.com/wday/cxs/wfp/job_openings",
            "https://wd3.myworkdaysite.com/en-US/recruiting/wfp/job_openings/details/",
        )
    }

    fn new(source: DataSource, api_base: &'static str, apply_base: &'static str) -> Self {
        Self {
            source,
            api_base,
            apply_base,
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

impl Connector for WorkdayConnector {
    fn data_source(&self) -> DataSource {
        self.source
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn listing_request(&self, page: usize) -> FetchRequest {
        FetchRequest::post_json(
            format!("{}/jobs", self.api_base),
            json!({
                "appliedFacets": {},
                "limit": self.page_size,
                "offset": page * self.page_size,
                "searchText": "",
            }),
        )
    }

    fn parse_listing(&self, body: &[u8]) -> Result<ListingPage, AdapterError> {
        let value = parse_body(body)?;
        let total_count = json_count(&value, &["total"]).ok_or_else(|| AdapterError::missing("total"))?;
        let parsed = json_array(&value, &["jobPostings"])?
            .iter()
            .enumerate()
            .map(|(position, posting)| {
                let path = json_text(posting, &["externalPath"]);
                if path.is_empty() {
                    return Err(ListingFailure::unidentified(position, "externalPath"));
                }
                Ok(ListingEntry::NeedsDetail(DetailStub {
                    key: path.clone(),
                    request: FetchRequest::get(format!("{}{}", self.api_base, path)),
                    summary: posting.clone(),
                }))
            });
        Ok(ListingPage::from_parsed(total_count, parsed))
    }

    fn parse_detail(&self, stub: &DetailStub, body: &[u8]) -> Result<Listing, AdapterError> {
        let value = parse_body(body)?;
        let info = value
            .get("jobPostingInfo")
            .ok_or_else(|| AdapterError::missing("jobPostingInfo"))?;

        let source_job_id = json_text(info, &["id"]);
        if source_job_id.is_empty() {
            return Err(AdapterError::missing("jobPostingInfo.id"));
        }
        let mut title = json_text(info, &["title"]);
        if title.is_empty() {
            title = json_text(&stub.summary, &["title"]);
        }
        let posting_id = json_text(info, &["jobPostingId"]);

        let mut listing = Listing {
            source_job_id,
            title,
            description: json_text(info, &["jobDescription"]),
            duty_station: json_text(info, &["location"]),
            department: json_text(&value, &["hiringOrganization", "name"]),
            recruitment_type: json_text(info, &["timeType"]),
            start_date: json_timestamp(info, &["startDate"]),
            end_date: json_timestamp(info, &["endDate"]),
            apply_link: format!("{}{}", self.apply_base, posting_id),
            ..Listing::default()
        };

        let category = stub
            .summary
            .get("bulletFields")
            .and_then(|fields| fields.get(0))
            .and_then(|field| field.as_str())
            .unwrap_or_default()
            .trim();
        if !category.is_empty() {
            listing.extra_fields.insert("category_code".into(), category.to_string());
        }
        if !posting_id.is_empty() {
            listing.extra_fields.insert("job_code_title".into(), posting_id);
        }
        Ok(listing)
    }
}
