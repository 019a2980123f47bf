//! Store gateway, run tracking and HTTP fetch utilities for UNVR.

use thiserror::Error;

mod gateway;
mod http;
pub mod memory;
pub mod postgres;

pub use gateway::{OrganizationDirectory, RunTracker, VacancyStore};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchMethod, FetchRequest,
    FetchedResponse, HttpClientConfig, HttpFetcher, RetryDisposition,
};
pub use memory::{MemoryOrganizationDirectory, MemoryRunTracker, MemoryVacancyStore, OrganizationEntry};
pub use postgres::{PgOrganizationDirectory, PgRunTracker, PgVacancyStore};

pub const CRATE_NAME: &str = "unvr-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("column `{column}` holds unexpected value `{value}`")]
    InvalidColumn { column: &'static str, value: String },
    #[error("run {0} not found")]
    RunNotFound(i64),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}
