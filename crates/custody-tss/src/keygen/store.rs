//! Keychain record persistence
//!
//! The custodian-side key record written at round 3 is the only persistent
//! side effect in the whole protocol. Records are written once and never
//! mutated.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::{Error, KeychainRecord, KeychainSource, Result};

/// Persistence seam for keychain records
#[async_trait]
pub trait KeychainStore: Send + Sync {
    /// Persist a record; re-inserting an identical record is a no-op,
    /// inserting a conflicting record for the same source is an error
    async fn put(&self, record: KeychainRecord) -> Result<()>;

    /// Fetch the record for one party, if written
    async fn get(&self, source: KeychainSource) -> Result<Option<KeychainRecord>>;

    /// Number of records written
    async fn len(&self) -> usize;
}

/// In-memory keychain store for tests and local flows
#[derive(Clone, Default)]
pub struct MemoryKeychainStore {
    records: Arc<DashMap<KeychainSource, KeychainRecord>>,
}

impl MemoryKeychainStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeychainStore for MemoryKeychainStore {
    async fn put(&self, record: KeychainRecord) -> Result<()> {
        if let Some(existing) = self.records.get(&record.source) {
            if existing.common_keychain != record.common_keychain {
                return Err(Error::Internal(format!(
                    "Keychain record for {:?} already persisted with a different value",
                    record.source
                )));
            }
            return Ok(());
        }
        self.records.insert(record.source, record);
        Ok(())
    }

    async fn get(&self, source: KeychainSource) -> Result<Option<KeychainRecord>> {
        Ok(self.records.get(&source).map(|r| r.clone()))
    }

    async fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CommonKeychain;

    fn record(chain_byte: u8) -> KeychainRecord {
        KeychainRecord::new(
            KeychainSource::Custodian,
            &CommonKeychain {
                public_key: [2u8; 33],
                chain_code: [chain_byte; 32],
            },
        )
    }

    #[tokio::test]
    async fn put_is_idempotent_for_identical_records() {
        let store = MemoryKeychainStore::new();
        store.put(record(1)).await.unwrap();
        store.put(record(1)).await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn put_rejects_conflicting_record() {
        let store = MemoryKeychainStore::new();
        store.put(record(1)).await.unwrap();
        assert!(store.put(record(2)).await.is_err());
    }
}
