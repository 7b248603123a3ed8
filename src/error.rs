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

//! Error types for distributed lock operations.

use thiserror::Error;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors surfaced by the client facade.
///
/// CAS conflicts are deliberately absent from this enum: a conflict is a
/// normal protocol outcome and is modeled as a [`WriteOutcome`] variant at
/// the store seam, not as an error.
///
/// [`WriteOutcome`]: crate::store::WriteOutcome
#[derive(Error, Debug)]
pub enum LockError {
    /// `acquire` exceeded its configured wall-clock budget.
    #[error("acquire timed out after {0} ms")]
    Timeout(u64),

    /// `acquire` exhausted its takeover rounds against live contention.
    #[error("lock unavailable after {attempts} takeover attempts")]
    Unavailable {
        /// Number of takeover rounds spent before giving up.
        attempts: u32,
    },

    /// An owner-facing operation detected the lock is no longer held.
    #[error("lock is no longer held")]
    LockLost,

    /// An external cancellation signal was observed.
    #[error("operation canceled")]
    Canceled,

    /// The caller already owns this lock; reentry is rejected.
    #[error("lock is already held by this client")]
    AlreadyHeld,

    /// A write outcome could not be determined after bounded retries.
    /// The caller must treat remote state as indeterminate and rely on
    /// the local deadline.
    #[error("write outcome unknown after bounded retries")]
    Unknown,

    /// The payload exceeds the backing store's per-item budget.
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge {
        /// Size of the rejected payload in bytes.
        size: usize,
        /// Maximum accepted payload size in bytes.
        max: usize,
    },

    /// Authorization, schema, or programmer error; not retryable.
    #[error("fatal backing store error: {0}")]
    Fatal(String),
}

/// Errors surfaced by a backing-store adapter.
///
/// Transient errors are retryable within bounded budgets; fatal errors are
/// not. A failed CAS is not an error (see [`WriteOutcome::Conflict`]).
///
/// [`WriteOutcome::Conflict`]: crate::store::WriteOutcome
#[derive(Error, Debug)]
pub enum StoreError {
    /// The item targeted by a conditional write does not exist.
    #[error("lock item not found")]
    NotFound,

    /// Network partition, throttling, or other retryable failure.
    #[error("transient backing store error: {0}")]
    Transient(String),

    /// Authorization, validation, or other non-retryable failure.
    #[error("fatal backing store error: {0}")]
    Fatal(String),
}

impl From<StoreError> for LockError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => LockError::LockLost,
            StoreError::Transient(_) => LockError::Unknown,
            StoreError::Fatal(msg) => LockError::Fatal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_maps_to_lock_error() {
        assert!(matches!(
            LockError::from(StoreError::NotFound),
            LockError::LockLost
        ));
        assert!(matches!(
            LockError::from(StoreError::Transient("throttled".into())),
            LockError::Unknown
        ));
        assert!(matches!(
            LockError::from(StoreError::Fatal("denied".into())),
            LockError::Fatal(_)
        ));
    }
}
