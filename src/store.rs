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

//! Backing-store seam for lock items.
//!
//! ## Purpose
//! Captures the backing store as a four-operation capability set: strongly
//! consistent read, create-if-absent, and compare-and-set write/delete on an
//! `(owner, version)` witness. Any value implementing [`LockStore`] is a
//! valid store; the in-memory implementation backs the test suite while the
//! DynamoDB implementation backs production.
//!
//! ## Design Decisions
//! - **Conflict is data, not error**: a failed CAS returns
//!   [`WriteOutcome::Conflict`] so every caller is forced to handle it.
//! - **Strong reads only**: eventually consistent reads break the takeover
//!   protocol, so `get` is specified as strongly consistent.

use crate::error::StoreError;
use async_trait::async_trait;

/// Maximum accepted payload size, in bytes.
///
/// DynamoDB caps a single item at 400 KB including attribute names; the
/// limit leaves headroom for the lock's other attributes. Oversized
/// payloads are rejected at acquire time.
pub const MAX_PAYLOAD_BYTES: usize = 350 * 1024;

/// A lock item as stored remotely, one per lock name.
///
/// An empty `owner` means the item exists but is unowned in the protocol
/// sense (a releaser cleared ownership rather than deleting the row).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLock {
    /// Primary key, chosen by the caller.
    pub name: String,
    /// Identity of the holding client; empty when unowned.
    pub owner: String,
    /// Monotonic CAS witness, strictly increasing per successful write.
    pub version: u64,
    /// Lease length the current owner advertises, in milliseconds.
    pub duration_ms: u64,
    /// Application-supplied value carried with the lock.
    pub payload: Option<Vec<u8>>,
}

impl RemoteLock {
    /// Whether the item is owned in the protocol sense.
    pub fn is_owned(&self) -> bool {
        !self.owner.is_empty()
    }
}

/// Result of a conditional write or delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The condition held and the write was applied atomically.
    Written,
    /// The condition did not hold; nothing was mutated. Carries the
    /// current remote item where the store can return it.
    Conflict(Option<RemoteLock>),
}

/// Capability set required from a backing store.
///
/// ## Contract
/// - `get` must be strongly consistent.
/// - Condition evaluation must be atomic with the write or delete.
/// - A write whose condition does not hold must leave the item untouched
///   and report [`WriteOutcome::Conflict`].
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Read the full item for `name`, or `None` when absent.
    async fn get(&self, name: &str) -> Result<Option<RemoteLock>, StoreError>;

    /// Create `item` only if no item with that name exists.
    async fn put_if_absent(&self, item: RemoteLock) -> Result<WriteOutcome, StoreError>;

    /// Replace the existing item with `item` only if the stored
    /// `(owner, version)` equals `(expected_owner, expected_version)`.
    ///
    /// An `expected_owner` of `""` matches an item whose ownership was
    /// cleared by a previous release.
    async fn put_if_matches(
        &self,
        expected_owner: &str,
        expected_version: u64,
        item: RemoteLock,
    ) -> Result<WriteOutcome, StoreError>;

    /// Delete the item only if the stored `(owner, version)` matches.
    async fn delete_if_matches(
        &self,
        name: &str,
        expected_owner: &str,
        expected_version: u64,
    ) -> Result<WriteOutcome, StoreError>;
}
