// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of Dynamolock.
//
// Dynamolock is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// Dynamolock is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with Dynamolock. If not, see <https://www.gnu.org/licenses/>.

//! In-memory lock store implementation (for testing).

use crate::error::StoreError;
use crate::store::{LockStore, RemoteLock, WriteOutcome};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory lock store (for testing).
///
/// ## Purpose
/// Provides a simple HashMap-backed implementation of [`LockStore`] for
/// tests and single-process scenarios. Each primitive holds the map's
/// write lock across its condition check and mutation, which gives the
/// same atomicity the protocol requires from a real store.
///
/// ## Limitations
/// - Not persistent (locks lost on restart)
/// - Not distributed (single process only)
#[derive(Clone, Default)]
pub struct InMemoryLockStore {
    items: Arc<RwLock<HashMap<String, RemoteLock>>>,
}

impl InMemoryLockStore {
    /// Create a new in-memory lock store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn get(&self, name: &str) -> Result<Option<RemoteLock>, StoreError> {
        let items = self.items.read().await;
        Ok(items.get(name).cloned())
    }

    async fn put_if_absent(&self, item: RemoteLock) -> Result<WriteOutcome, StoreError> {
        let mut items = self.items.write().await;
        if let Some(existing) = items.get(&item.name) {
            return Ok(WriteOutcome::Conflict(Some(existing.clone())));
        }
        items.insert(item.name.clone(), item);
        Ok(WriteOutcome::Written)
    }

    async fn put_if_matches(
        &self,
        expected_owner: &str,
        expected_version: u64,
        item: RemoteLock,
    ) -> Result<WriteOutcome, StoreError> {
        let mut items = self.items.write().await;
        let existing = items.get(&item.name).ok_or(StoreError::NotFound)?;
        if existing.owner != expected_owner || existing.version != expected_version {
            return Ok(WriteOutcome::Conflict(Some(existing.clone())));
        }
        items.insert(item.name.clone(), item);
        Ok(WriteOutcome::Written)
    }

    async fn delete_if_matches(
        &self,
        name: &str,
        expected_owner: &str,
        expected_version: u64,
    ) -> Result<WriteOutcome, StoreError> {
        let mut items = self.items.write().await;
        let existing = items.get(name).ok_or(StoreError::NotFound)?;
        if existing.owner != expected_owner || existing.version != expected_version {
            return Ok(WriteOutcome::Conflict(Some(existing.clone())));
        }
        items.remove(name);
        Ok(WriteOutcome::Written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, owner: &str, version: u64) -> RemoteLock {
        RemoteLock {
            name: name.to_string(),
            owner: owner.to_string(),
            version,
            duration_ms: 1_000,
            payload: None,
        }
    }

    #[tokio::test]
    async fn put_if_absent_creates_once() {
        let store = InMemoryLockStore::new();
        assert_eq!(
            store.put_if_absent(item("a", "c1", 1)).await.unwrap(),
            WriteOutcome::Written
        );

        let outcome = store.put_if_absent(item("a", "c2", 1)).await.unwrap();
        match outcome {
            WriteOutcome::Conflict(Some(current)) => assert_eq!(current.owner, "c1"),
            other => panic!("expected conflict with current item, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn put_if_matches_requires_exact_witness() {
        let store = InMemoryLockStore::new();
        store.put_if_absent(item("a", "c1", 1)).await.unwrap();

        // Wrong version
        let outcome = store
            .put_if_matches("c1", 2, item("a", "c2", 3))
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Conflict(Some(_))));

        // Wrong owner
        let outcome = store
            .put_if_matches("c3", 1, item("a", "c2", 2))
            .await
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Conflict(Some(_))));

        // A failed CAS must not mutate the item
        let current = store.get("a").await.unwrap().unwrap();
        assert_eq!(current.owner, "c1");
        assert_eq!(current.version, 1);

        // Exact witness succeeds
        let outcome = store
            .put_if_matches("c1", 1, item("a", "c2", 2))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        let current = store.get("a").await.unwrap().unwrap();
        assert_eq!(current.owner, "c2");
        assert_eq!(current.version, 2);
    }

    #[tokio::test]
    async fn put_if_matches_missing_item_is_not_found() {
        let store = InMemoryLockStore::new();
        let result = store.put_if_matches("c1", 1, item("a", "c1", 2)).await;
        assert!(matches!(result, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn delete_if_matches_requires_exact_witness() {
        let store = InMemoryLockStore::new();
        store.put_if_absent(item("a", "c1", 1)).await.unwrap();

        let outcome = store.delete_if_matches("a", "c1", 9).await.unwrap();
        assert!(matches!(outcome, WriteOutcome::Conflict(Some(_))));
        assert!(store.get("a").await.unwrap().is_some());

        let outcome = store.delete_if_matches("a", "c1", 1).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_owner_matches_unowned_item() {
        let store = InMemoryLockStore::new();
        store.put_if_absent(item("a", "", 4)).await.unwrap();

        let outcome = store
            .put_if_matches("", 4, item("a", "c2", 5))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
        assert!(store.get("a").await.unwrap().unwrap().is_owned());
    }
}
