use unvr_core::{DataSource, Listing};
use unvr_storage::FetchRequest;

use crate::{
    json_array, json_count, json_text, json_timestamp, parse_body, AdapterError, Connector,
    DetailStub, ListingEntry, ListingFailure, ListingPage,
};

const DEFAULT_PAGE_SIZE: usize = 1000;
const SEARCH_URL: &str = "https://www.worldbank.org/en/about/careers/search?api=true&format=json";
const APPLY_BASE: &str = "https://worldbank.csod.com/ux/ats/careersite/1/home/requisition/";

/// World Bank careers search API. The list already carries every field we keep.
#[derive(Debug, Clone)]
pub struct WorldBankConnector {
    page_size: usize,
}

impl Default for WorldBankConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl WorldBankConnector {
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

impl Connector for WorldBankConnector {
    fn data_source(&self) -> DataSource {
        DataSource::WorldBank
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn listing_request(&self, page: usize) -> FetchRequest {
        FetchRequest::get(format!(
            "{SEARCH_URL}&rows={}&start={}",
            self.page_size,
            page * self.page_size
        ))
    }

    fn parse_listing(&self, body: &[u8]) -> Result<ListingPage, AdapterError> {
        let value = parse_body(body)?;
        let total_count = json_count(&value, &["response", "numFound"])
            .ok_or_else(|| AdapterError::missing("response.numFound"))?;
        let parsed = json_array(&value, &["response", "docs"])?
            .iter()
            .enumerate()
            .map(|(position, doc)| {
                let id = json_text(doc, &["id"]);
                if id.is_empty() {
                    return Err(ListingFailure::unidentified(position, "id"));
                }
                let mut listing = Listing {
                    apply_link: format!("{APPLY_BASE}{id}?c=worldbank"),
                    source_job_id: id,
                    title: json_text(doc, &["title"]),
                    duty_station: json_text(doc, &["location"]),
                    department: DataSource::WorldBank.agency_name().to_string(),
                    start_date: json_timestamp(doc, &["opendate"]),
                    end_date: json_timestamp(doc, &["closedate"]),
                    ..Listing::default()
                };
                let grade = json_text(doc, &["grade"]);
                if !grade.is_empty() {
                    listing.extra_fields.insert("jl".to_string(), grade);
                }
                Ok(ListingEntry::Ready(listing))
            });
        Ok(ListingPage::from_parsed(total_count, parsed))
    }

    fn parse_detail(&self, stub: &DetailStub, _body: &[u8]) -> Result<Listing, AdapterError> {
        Err(AdapterError::Malformed(format!(
            "world bank listings have no detail page (requested for {})",
            stub.key
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_ids_become_text_keys() {
        let page = WorldBankConnector::new()
            .parse_listing(
                br#"{"response": {"numFound": 1, "docs": [
                    {"id": 31277, "title": "Economist", "grade": "GF", "location": "Washington, DC",
                     "opendate": "2026-03-01", "closedate": "2026-03-31"}
                ]}}"#,
            )
            .unwrap();
        assert_eq!(page.total_count, 1);
        match &page.entries[0] {
            ListingEntry::Ready(listing) => {
                assert_eq!(listing.source_job_id, "31277");
                assert_eq!(listing.extra("jl"), Some("GF"));
                assert_eq!(listing.department, "World Bank");
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn docs_without_id_are_recorded_as_failures() {
        let page = WorldBankConnector::new()
            .parse_listing(
                br#"{"response": {"numFound": 3, "docs": [
                    {"id": 31277, "title": "Economist"},
                    {"title": "Analyst"},
                    {"id": "", "title": "Consultant"}
                ]}}"#,
            )
            .unwrap();
        assert_eq!(page.entries.len(), 1);
        let keys: Vec<_> = page.failures.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, vec!["entry #1", "entry #2"]);
    }

    #[test]
    fn start_advances_by_rows() {
        let url = WorldBankConnector::new().listing_request(1).url;
        assert!(url.ends_with("&rows=1000&start=1000"));
    }
}
