//! Prefix-addressable key/value storage for protection state and artifacts.
//!
//! A [`Bank`] is a logical namespace over a pluggable [`BankDriver`]. A
//! [`BankSection`] is a view of a bank restricted to one path prefix: every
//! key written through a section is transparently prefixed, and keys read
//! back are stripped of the prefix. Resource-level isolation is guaranteed
//! purely by this naming discipline.
//!
//! Write policy: `create` is an upsert, `update` requires the key to exist.
//! Reads after writes are immediately visible to the same caller. Drivers
//! must make single-key writes atomic; no cross-key transactions are assumed.

mod memory;

pub use memory::MemoryBankDriver;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Errors raised by bank operations.
#[derive(Error, Debug)]
pub enum BankError {
    /// The key is absent from the bank.
    #[error("bank key not found: {0}")]
    NotFound(String),

    /// The key does not satisfy the bank key grammar.
    #[error("invalid bank key: {0}")]
    InvalidKey(String),

    /// The storage backend failed.
    #[error("bank backend error: {0}")]
    Backend(String),
}

/// Sort direction for key listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDir {
    /// Lexicographically ascending (the default).
    #[default]
    Asc,
    /// Lexicographically descending.
    Desc,
}

/// Parameters for a paginated, ordered key listing.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Only keys starting with this prefix. Empty or absent matches all.
    pub prefix: Option<String>,
    /// Cap on the number of keys returned.
    pub limit: Option<usize>,
    /// Resume after this key (exclusive).
    pub marker: Option<String>,
    /// Listing order.
    pub sort_dir: SortDir,
}

impl ListQuery {
    /// Query for all keys under `prefix`.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ..Self::default()
        }
    }
}

/// Storage backend contract consumed by [`Bank`].
///
/// Any conforming backend (object store, database, in-memory map) may be
/// plugged in. Single-key writes must be atomic.
#[async_trait]
pub trait BankDriver: Send + Sync {
    /// Write `value` under `key`, creating or replacing it.
    async fn create(&self, key: &str, value: Value) -> Result<(), BankError>;

    /// Replace the value of an existing `key`; fails with
    /// [`BankError::NotFound`] if the key was never created.
    async fn update(&self, key: &str, value: Value) -> Result<(), BankError>;

    /// Read the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Value, BankError>;

    /// Remove `key`. Removing an absent key is a no-op.
    async fn delete(&self, key: &str) -> Result<(), BankError>;

    /// Keys matching `query`, ordered per `query.sort_dir`.
    async fn list(&self, query: &ListQuery) -> Result<Vec<String>, BankError>;

    /// Opaque identifier of the backend's authorization context. Used to
    /// detect cross-tenant leakage between banks.
    fn owner_id(&self) -> String;
}

/// A logical key/value namespace backed by a pluggable storage driver.
#[derive(Clone)]
pub struct Bank {
    driver: Arc<dyn BankDriver>,
}

impl Bank {
    /// Wrap a storage driver.
    pub fn new(driver: Arc<dyn BankDriver>) -> Self {
        Self { driver }
    }

    fn validate_key(key: &str) -> Result<(), BankError> {
        if !key.starts_with('/') {
            return Err(BankError::InvalidKey(format!(
                "key must start with '/': {key}"
            )));
        }
        if key.len() < 2 || key.ends_with('/') || key.contains("//") {
            return Err(BankError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    /// Write `value` under `key`, creating or replacing it.
    pub async fn create(&self, key: &str, value: Value) -> Result<(), BankError> {
        Self::validate_key(key)?;
        self.driver.create(key, value).await
    }

    /// Replace the value of an existing key.
    pub async fn update(&self, key: &str, value: Value) -> Result<(), BankError> {
        Self::validate_key(key)?;
        self.driver.update(key, value).await
    }

    /// Read the value stored under `key`.
    pub async fn get(&self, key: &str) -> Result<Value, BankError> {
        Self::validate_key(key)?;
        self.driver.get(key).await
    }

    /// Remove `key`.
    pub async fn delete(&self, key: &str) -> Result<(), BankError> {
        Self::validate_key(key)?;
        self.driver.delete(key).await
    }

    /// Keys matching `query`.
    pub async fn list(&self, query: &ListQuery) -> Result<Vec<String>, BankError> {
        self.driver.list(query).await
    }

    /// Authorization-context identifier of the underlying driver.
    pub fn owner_id(&self) -> String {
        self.driver.owner_id()
    }

    /// A view of this bank restricted to `prefix`.
    pub fn section(&self, prefix: &str) -> BankSection {
        BankSection::new(self.clone(), prefix)
    }
}

/// A view over a [`Bank`] restricted to a path prefix.
///
/// Every key passed in is joined under the prefix before delegation, so a
/// section cannot read or write outside its assigned namespace.
#[derive(Clone)]
pub struct BankSection {
    bank: Bank,
    prefix: String,
}

impl BankSection {
    /// Create a section over `bank` scoped to `prefix`. The prefix is
    /// normalized to the form `/a/b/`.
    pub fn new(bank: Bank, prefix: &str) -> Self {
        let trimmed = prefix.trim_matches('/');
        let prefix = if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{trimmed}/")
        };
        Self { bank, prefix }
    }

    /// The normalized prefix of this section.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn qualify(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.trim_start_matches('/'))
    }

    /// Write `value` under the section-relative `key`.
    pub async fn create(&self, key: &str, value: Value) -> Result<(), BankError> {
        self.bank.create(&self.qualify(key), value).await
    }

    /// Replace the value of an existing section-relative `key`.
    pub async fn update(&self, key: &str, value: Value) -> Result<(), BankError> {
        self.bank.update(&self.qualify(key), value).await
    }

    /// Read the value stored under the section-relative `key`.
    pub async fn get(&self, key: &str) -> Result<Value, BankError> {
        self.bank.get(&self.qualify(key)).await
    }

    /// Remove the section-relative `key`.
    pub async fn delete(&self, key: &str) -> Result<(), BankError> {
        self.bank.delete(&self.qualify(key)).await
    }

    /// Keys under this section, relative to its prefix.
    pub async fn list(&self, query: &ListQuery) -> Result<Vec<String>, BankError> {
        let full_prefix = match &query.prefix {
            Some(p) => self.qualify(p),
            None => self.prefix.clone(),
        };
        let full = ListQuery {
            prefix: Some(full_prefix),
            limit: query.limit,
            marker: query.marker.as_ref().map(|m| self.qualify(m)),
            sort_dir: query.sort_dir,
        };
        let keys = self.bank.list(&full).await?;
        Ok(keys
            .into_iter()
            .map(|k| k[self.prefix.len()..].to_string())
            .collect())
    }

    /// All keys under this section.
    pub async fn list_all(&self) -> Result<Vec<String>, BankError> {
        self.list(&ListQuery::default()).await
    }

    /// Remove every key under this section.
    pub async fn delete_all(&self) -> Result<(), BankError> {
        for key in self.list_all().await? {
            self.delete(&key).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bank() -> Bank {
        Bank::new(Arc::new(MemoryBankDriver::new()))
    }

    #[tokio::test]
    async fn get_returns_what_was_written() {
        let bank = bank();
        bank.create("/a/b", json!({"x": 1})).await.unwrap();
        assert_eq!(bank.get("/a/b").await.unwrap(), json!({"x": 1}));

        bank.update("/a/b", json!(2)).await.unwrap();
        assert_eq!(bank.get("/a/b").await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn update_requires_existing_key() {
        let bank = bank();
        let err = bank.update("/missing", json!(1)).await.unwrap_err();
        assert!(matches!(err, BankError::NotFound(_)));
    }

    #[tokio::test]
    async fn invalid_keys_are_rejected() {
        let bank = bank();
        for key in ["no-slash", "/trailing/", "/dou//ble", "/"] {
            let err = bank.create(key, json!(1)).await.unwrap_err();
            assert!(matches!(err, BankError::InvalidKey(_)), "key: {key}");
        }
    }

    #[tokio::test]
    async fn section_prefixes_and_strips_keys() {
        let bank = bank();
        let section = bank.section("/resource_data/cp1/r1");
        section.create("status", json!("protecting")).await.unwrap();

        assert_eq!(
            bank.get("/resource_data/cp1/r1/status").await.unwrap(),
            json!("protecting")
        );
        assert_eq!(section.list_all().await.unwrap(), vec!["status"]);
        assert_eq!(section.get("status").await.unwrap(), json!("protecting"));
    }

    #[tokio::test]
    async fn section_delete_all_leaves_siblings_alone() {
        let bank = bank();
        let r1 = bank.section("/resource_data/cp1/r1");
        let r2 = bank.section("/resource_data/cp1/r2");
        r1.create("status", json!("available")).await.unwrap();
        r1.create("metadata", json!({})).await.unwrap();
        r2.create("status", json!("available")).await.unwrap();

        r1.delete_all().await.unwrap();

        assert!(r1.list_all().await.unwrap().is_empty());
        assert_eq!(r2.list_all().await.unwrap(), vec!["status"]);
    }
}
