//! Persistence for discovered register readability is an external collaborator, but
//! the scanner needs a trait to upsert through. `InMemoryResultStore` is the trait's
//! reference implementation, used by this crate's own tests and suitable for a host
//! that doesn't need real persistence.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::Result;

/// One register's discovered state: `{readable, scanned_at, value}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResult {
    pub readable: bool,
    pub scanned_at: DateTime<Utc>,
    pub value: Option<[u8; 2]>,
}

/// `upsert(device_id, register, result)`, keyed by `(device_id, register)`.
///
/// Implementations must honor the upgrade-only policy: a stored `readable = true`
/// is never overwritten by a later `readable = false` for the same key.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn upsert(&self, device_id: &str, register: u16, result: RegisterResult) -> Result<()>;

    /// All registers this device has scanned results for, in any order. Used by
    /// `scanner::calculate_pending_ranges` callers to resume a partial scan.
    async fn scanned_registers(&self, device_id: &str) -> Result<Vec<u16>>;
}

/// A `HashMap`-backed `ResultStore`, matching the sparse-map style used for
/// register-addressed state elsewhere (see `mock::MockDevice`'s register memory).
#[derive(Default)]
pub struct InMemoryResultStore {
    entries: Mutex<HashMap<(String, u16), RegisterResult>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All `(register, result)` pairs recorded for `device_id`, sorted by address.
    /// Not part of the `ResultStore` contract; a convenience for callers (the CLI's
    /// summary printout, this crate's own tests) that want the full snapshot.
    pub async fn all(&self, device_id: &str) -> Vec<(u16, RegisterResult)> {
        let entries = self.entries.lock().await;
        let mut out: Vec<_> = entries
            .iter()
            .filter(|((id, _), _)| id == device_id)
            .map(|((_, reg), result)| (*reg, result.clone()))
            .collect();
        out.sort_by_key(|(reg, _)| *reg);
        out
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn upsert(&self, device_id: &str, register: u16, result: RegisterResult) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let key = (device_id.to_string(), register);
        match entries.get(&key) {
            Some(existing) if existing.readable && !result.readable => {
                // Keep the better outcome: a previous success is not downgraded by a
                // later transient failure.
            }
            _ => {
                entries.insert(key, result);
            }
        }
        Ok(())
    }

    async fn scanned_registers(&self, device_id: &str) -> Result<Vec<u16>> {
        let entries = self.entries.lock().await;
        let mut registers: Vec<u16> = entries
            .keys()
            .filter(|(id, _)| id == device_id)
            .map(|(_, reg)| *reg)
            .collect();
        registers.sort_unstable();
        Ok(registers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(readable: bool, value: Option<[u8; 2]>) -> RegisterResult {
        RegisterResult {
            readable,
            scanned_at: Utc::now(),
            value,
        }
    }

    #[tokio::test]
    async fn upsert_then_read_back() {
        let store = InMemoryResultStore::new();
        store
            .upsert("dev-1", 10, result(true, Some([0x00, 0x64])))
            .await
            .unwrap();
        let all = store.all("dev-1").await;
        assert_eq!(all, vec![(10, result(true, Some([0x00, 0x64])))]);
    }

    #[tokio::test]
    async fn readable_true_is_never_downgraded() {
        let store = InMemoryResultStore::new();
        store
            .upsert("dev-1", 5, result(true, Some([0xAB, 0xCD])))
            .await
            .unwrap();
        store.upsert("dev-1", 5, result(false, None)).await.unwrap();

        let all = store.all("dev-1").await;
        assert_eq!(all, vec![(5, result(true, Some([0xAB, 0xCD])))]);
    }

    #[tokio::test]
    async fn upgrade_from_false_to_true_is_allowed() {
        let store = InMemoryResultStore::new();
        store.upsert("dev-1", 5, result(false, None)).await.unwrap();
        store
            .upsert("dev-1", 5, result(true, Some([0x01, 0x02])))
            .await
            .unwrap();

        let all = store.all("dev-1").await;
        assert_eq!(all, vec![(5, result(true, Some([0x01, 0x02])))]);
    }

    #[tokio::test]
    async fn scanned_registers_is_sorted_and_scoped_per_device() {
        let store = InMemoryResultStore::new();
        store.upsert("dev-1", 5, result(true, None)).await.unwrap();
        store.upsert("dev-1", 2, result(false, None)).await.unwrap();
        store.upsert("dev-2", 99, result(true, None)).await.unwrap();

        let scanned = store.scanned_registers("dev-1").await.unwrap();
        assert_eq!(scanned, vec![2, 5]);
    }
}
