//! In-memory bank driver, primarily for tests and embedders without a
//! durable backend.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use super::{BankDriver, BankError, ListQuery, SortDir};

/// Bank driver storing all records in a concurrent in-process map.
///
/// Single-key writes are atomic (one map entry per key). Each instance gets
/// a fresh owner id, so two drivers never alias each other's namespace.
pub struct MemoryBankDriver {
    objects: DashMap<String, Value>,
    owner_id: String,
}

impl MemoryBankDriver {
    /// Create an empty driver with a unique owner id.
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            owner_id: Uuid::new_v4().to_string(),
        }
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl Default for MemoryBankDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BankDriver for MemoryBankDriver {
    async fn create(&self, key: &str, value: Value) -> Result<(), BankError> {
        self.objects.insert(key.to_string(), value);
        Ok(())
    }

    async fn update(&self, key: &str, value: Value) -> Result<(), BankError> {
        match self.objects.get_mut(key) {
            Some(mut entry) => {
                *entry = value;
                Ok(())
            }
            None => Err(BankError::NotFound(key.to_string())),
        }
    }

    async fn get(&self, key: &str) -> Result<Value, BankError> {
        self.objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| BankError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), BankError> {
        self.objects.remove(key);
        Ok(())
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<String>, BankError> {
        let prefix = query.prefix.as_deref().unwrap_or("");
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort_unstable();
        if query.sort_dir == SortDir::Desc {
            keys.reverse();
        }
        if let Some(marker) = &query.marker {
            if let Some(pos) = keys.iter().position(|k| k == marker) {
                keys.drain(..=pos);
            }
        }
        if let Some(limit) = query.limit {
            keys.truncate(limit);
        }
        Ok(keys)
    }

    fn owner_id(&self) -> String {
        self.owner_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn list_orders_pages_and_filters() {
        let driver = MemoryBankDriver::new();
        for key in ["/a/1", "/a/2", "/a/3", "/b/1"] {
            driver.create(key, json!(key)).await.unwrap();
        }

        let all = driver
            .list(&ListQuery::with_prefix("/a/"))
            .await
            .unwrap();
        assert_eq!(all, vec!["/a/1", "/a/2", "/a/3"]);

        let page = driver
            .list(&ListQuery {
                prefix: Some("/a/".into()),
                marker: Some("/a/1".into()),
                limit: Some(1),
                sort_dir: SortDir::Asc,
            })
            .await
            .unwrap();
        assert_eq!(page, vec!["/a/2"]);

        let descending = driver
            .list(&ListQuery {
                prefix: Some("/a/".into()),
                sort_dir: SortDir::Desc,
                ..ListQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(descending, vec!["/a/3", "/a/2", "/a/1"]);
    }

    #[tokio::test]
    async fn delete_is_noop_safe() {
        let driver = MemoryBankDriver::new();
        driver.delete("/never/created").await.unwrap();
    }

    #[test]
    fn owner_ids_are_distinct_per_driver() {
        assert_ne!(
            MemoryBankDriver::new().owner_id(),
            MemoryBankDriver::new().owner_id()
        );
    }
}
