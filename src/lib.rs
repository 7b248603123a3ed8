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

//! # Dynamolock
//!
//! ## Purpose
//! Lease-based distributed advisory locks layered on a remote,
//! conditionally-updatable key-value store. A lock is a named record;
//! cooperating clients contend for ownership of that name through
//! compare-and-set writes on an `(owner, version)` witness. At any instant
//! at most one client believes it owns a given lock, provided all
//! participants honor the protocol and the store implements single-item
//! conditional writes correctly.
//!
//! ## How Safety Works
//! No clock synchronization is assumed. A contender that finds a lock owned
//! waits out the owner's advertised lease on its *own* monotonic clock
//! before attempting a CAS takeover on the `(owner, version)` it observed.
//! A holder keeps a local deadline (`CAS issue instant + lease`) past which
//! it will not assert ownership, regardless of remote state; a background
//! renewal task extends that deadline by CAS-renewing the lease. The
//! renewal task is an optimization only; correctness does not depend on it
//! running.
//!
//! ## Key Components
//! - [`LockClient`]: facade owning the client identity; `acquire`,
//!   `unlock`, `delete`, `inspect`, and scoped `with_lock`
//! - [`LockHandle`]: cloneable read-only view of a held lock
//! - [`LockStore`]: four-operation capability set any backend implements
//! - [`InMemoryLockStore`]: HashMap-based store for tests (feature:
//!   `memory-backend`)
//! - [`DynamoDbLockStore`]: production DynamoDB store (feature:
//!   `ddb-backend`)
//!
//! ## Example
//! ```rust,no_run
//! use dynamolock::{AcquireOptions, ClientConfig, InMemoryLockStore, LockClient};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = LockClient::new(Arc::new(InMemoryLockStore::new()), ClientConfig::default());
//!
//! // Scoped acquisition: unlock runs exactly once on every exit path.
//! let report = client
//!     .with_lock("jobs:nightly-report", AcquireOptions::new(), |lock| async move {
//!         assert!(lock.is_held());
//!         "done"
//!     })
//!     .await?;
//! assert_eq!(report, "done");
//! # Ok(())
//! # }
//! ```
//!
//! ## Non-Goals
//! Acquisition is best-effort, not fair; contenders poll rather than being
//! notified of release; reentry by the same client is rejected rather than
//! modeled; and the protocol tolerates bounded clock-rate drift only
//! (rates within about ten percent over a lease window).

#![warn(missing_docs)]
#![warn(clippy::all)]

mod acquire;
mod renewal;

pub mod client;
pub mod config;
pub mod error;
pub mod record;
pub mod store;

#[cfg(feature = "memory-backend")]
pub mod memory;

#[cfg(feature = "ddb-backend")]
pub mod ddb;

pub use client::LockClient;
pub use config::{AcquireOptions, ClientConfig};
pub use error::{LockError, LockResult, StoreError};
pub use record::{LockHandle, LockState};
pub use store::{LockStore, RemoteLock, WriteOutcome, MAX_PAYLOAD_BYTES};

#[cfg(feature = "memory-backend")]
pub use memory::InMemoryLockStore;

#[cfg(feature = "ddb-backend")]
pub use ddb::DynamoDbLockStore;

// Re-exported for callers of `acquire_with_cancellation`.
pub use tokio_util::sync::CancellationToken;
