use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;
use unvr_core::DataSource;
use unvr_storage::OrganizationDirectory;

/// Maps free-text department names to organization ids. Never fails: unknown
/// names and directory errors both resolve to the fallback id. One instance per run.
pub struct OrganizationResolver {
    directory: Arc<dyn OrganizationDirectory>,
    fallback_id: i32,
    cache: Mutex<HashMap<String, i32>>,
}

impl OrganizationResolver {
    pub fn new(directory: Arc<dyn OrganizationDirectory>, fallback_id: i32) -> Self {
        Self {
            directory,
            fallback_id,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn fallback_id(&self) -> i32 {
        self.fallback_id
    }

    pub async fn resolve(&self, name: &str) -> i32 {
        let key = name.trim().to_lowercase();
        if key.is_empty() {
            return self.fallback_id;
        }
        if let Some(id) = self.cache.lock().await.get(&key) {
            return *id;
        }

        let id = match self.directory.find_organization(&key).await {
            Ok(Some(id)) => id,
            Ok(None) => self.fallback_id,
            Err(err) => {
                // Not cached, so the next listing retries the lookup.
                warn!(name, error = %err, "organization lookup failed; using fallback");
                return self.fallback_id;
            }
        };
        self.cache.lock().await.insert(key, id);
        id
    }

    /// Resolve a listing's department, falling back to the source agency when it is blank.
    pub async fn resolve_department(&self, source: DataSource, department: &str) -> i32 {
        if department.trim().is_empty() {
            self.resolve(source.agency_name()).await
        } else {
            self.resolve(department).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use unvr_core::DEFAULT_ORGANIZATION_ID;
    use unvr_storage::{MemoryOrganizationDirectory, OrganizationEntry, StoreError};

    fn directory() -> Arc<MemoryOrganizationDirectory> {
        Arc::new(MemoryOrganizationDirectory::new(vec![
            OrganizationEntry::new(
                12,
                "WFP",
                "World Food Programme",
                "WFP",
                "United Nations World Food Programme",
            ),
            OrganizationEntry::new(7, "WB", "World Bank", "WBG", "World Bank Group"),
        ]))
    }

    #[tokio::test]
    async fn unknown_agency_resolves_to_fallback() {
        let resolver = OrganizationResolver::new(directory(), DEFAULT_ORGANIZATION_ID);
        assert_eq!(resolver.resolve("NonexistentAgencyXYZ").await, 128);
        assert_eq!(resolver.resolve("  ").await, 128);
    }

    #[tokio::test]
    async fn matches_case_insensitively() {
        let resolver = OrganizationResolver::new(directory(), DEFAULT_ORGANIZATION_ID);
        assert_eq!(resolver.resolve("world food programme").await, 12);
        assert_eq!(resolver.resolve("World Bank").await, 7);
    }

    #[tokio::test]
    async fn directory_failure_never_propagates() {
        let resolver = OrganizationResolver::new(
            Arc::new(MemoryOrganizationDirectory::unavailable()),
            99,
        );
        assert_eq!(resolver.resolve("WFP").await, 99);
    }

    #[tokio::test]
    async fn blank_department_uses_source_agency() {
        let resolver = OrganizationResolver::new(directory(), DEFAULT_ORGANIZATION_ID);
        assert_eq!(resolver.resolve_department(DataSource::Wfp, "").await, 12);
        assert_eq!(resolver.resolve_department(DataSource::Imf, "").await, 128);
    }

    struct CountingDirectory(AtomicUsize);

    #[async_trait]
    impl OrganizationDirectory for CountingDirectory {
        async fn find_organization(&self, _name: &str) -> Result<Option<i32>, StoreError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Some(5))
        }
    }

    #[tokio::test]
    async fn lookups_are_memoized_per_name() {
        let counting = Arc::new(CountingDirectory(AtomicUsize::new(0)));
        let resolver = OrganizationResolver::new(counting.clone(), DEFAULT_ORGANIZATION_ID);
        for name in ["UNEP", "unep", " UNEP ", "OCHA"] {
            assert_eq!(resolver.resolve(name).await, 5);
        }
        assert_eq!(counting.0.load(Ordering::SeqCst), 2);
    }
}
