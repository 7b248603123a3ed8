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

//! Client facade: identity, acquisition, release, inspection.
//!
//! ## Purpose
//! Creates lock records, owns the client identity, hands out handles, and
//! enforces the local-deadline check on every owner-facing operation. The
//! facade is an explicit value passed where it is needed; identity is part
//! of the value, not process-global.

use crate::acquire;
use crate::config::{AcquireOptions, ClientConfig};
use crate::error::{LockError, LockResult, StoreError};
use crate::record::{LockHandle, LockState, RecordInner};
use crate::renewal;
use crate::store::{LockStore, RemoteLock, WriteOutcome, MAX_PAYLOAD_BYTES};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use ulid::Ulid;

enum ReleaseMode {
    Unlock,
    Delete,
}

/// Client for a distributed lock table.
///
/// Holds the process identity (a fresh ULID per construction unless
/// overridden) and the backing store. Cheap to clone.
///
/// ## Example
/// ```rust,no_run
/// use dynamolock::{AcquireOptions, ClientConfig, InMemoryLockStore, LockClient};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = LockClient::new(Arc::new(InMemoryLockStore::new()), ClientConfig::default());
///
/// let lock = client
///     .acquire("jobs:nightly-report", AcquireOptions::new().with_lease_ms(10_000))
///     .await?;
/// assert!(lock.is_held());
///
/// client.unlock(&lock).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LockClient {
    store: Arc<dyn LockStore>,
    owner: String,
    config: ClientConfig,
}

impl LockClient {
    /// Create a client over `store` with the given defaults.
    pub fn new(store: Arc<dyn LockStore>, config: ClientConfig) -> Self {
        let owner = config
            .identity_override
            .clone()
            .unwrap_or_else(|| Ulid::new().to_string());
        Self {
            store,
            owner,
            config,
        }
    }

    /// This client's owner identity.
    pub fn identity(&self) -> &str {
        &self.owner
    }

    /// Acquire the lock named `name`.
    ///
    /// ## Returns
    /// - `Ok(LockHandle)`: the lock is held; a renewal task keeps the lease
    ///   fresh until the handle is unlocked, deleted, or dropped.
    /// - `Err(LockError::Unavailable)`: takeover rounds exhausted against
    ///   live contention.
    /// - `Err(LockError::Timeout)`: the wall-clock budget expired.
    /// - `Err(LockError::AlreadyHeld)`: this client already owns the lock.
    #[instrument(skip(self, options), fields(name = %name, owner = %self.owner))]
    pub async fn acquire(&self, name: &str, options: AcquireOptions) -> LockResult<LockHandle> {
        self.acquire_with_cancellation(name, options, CancellationToken::new())
            .await
    }

    /// Acquire with an external cancellation signal.
    ///
    /// On cancellation during a lease wait or backoff the call returns
    /// [`LockError::Canceled`] promptly with no write issued since the last
    /// read. A CAS already in flight is awaited; if it succeeds after
    /// cancellation, ownership is cleared before returning so no ghost
    /// ownership is left behind.
    #[instrument(skip(self, options, cancel), fields(name = %name, owner = %self.owner))]
    pub async fn acquire_with_cancellation(
        &self,
        name: &str,
        options: AcquireOptions,
        cancel: CancellationToken,
    ) -> LockResult<LockHandle> {
        let resolved = options.resolve(&self.config);
        if let Some(payload) = &resolved.payload {
            if payload.len() > MAX_PAYLOAD_BYTES {
                return Err(LockError::PayloadTooLarge {
                    size: payload.len(),
                    max: MAX_PAYLOAD_BYTES,
                });
            }
        }

        let record = RecordInner::new(
            name.to_string(),
            self.owner.clone(),
            resolved.lease,
            self.config.renew_interval(resolved.lease),
            resolved.retry_initial,
            resolved.payload.clone(),
        );

        let acquisition =
            acquire::run(self.store.as_ref(), &self.owner, name, &resolved, &cancel).await?;
        record.promote_to_held(acquisition.version, acquisition.deadline);
        renewal::spawn(Arc::clone(&self.store), &record);
        Ok(LockHandle::from_inner(record))
    }

    /// Release the lock, clearing ownership but leaving the item in place
    /// (payload unchanged, for forensic inspection).
    ///
    /// Idempotent against loss: a record already `Lost` or `Released`, or a
    /// CAS that mismatches because the lock was taken over, returns `Ok`
    /// without further network effect.
    #[instrument(skip(self, handle), fields(name = %handle.name(), owner = %self.owner))]
    pub async fn unlock(&self, handle: &LockHandle) -> LockResult<()> {
        self.release(handle, ReleaseMode::Unlock).await
    }

    /// Release the lock by deleting the item outright.
    ///
    /// Same disposition as [`unlock`](Self::unlock).
    #[instrument(skip(self, handle), fields(name = %handle.name(), owner = %self.owner))]
    pub async fn delete(&self, handle: &LockHandle) -> LockResult<()> {
        self.release(handle, ReleaseMode::Delete).await
    }

    async fn release(&self, handle: &LockHandle, mode: ReleaseMode) -> LockResult<()> {
        let record = handle.inner();

        // Stop the renewal task before any network call so it cannot bump
        // the version between our snapshot and our CAS.
        record.stop_renewal().await;
        let _guard = record.op_guard().await;

        if record.check_liveness() != LockState::Held {
            debug!(name = %record.name(), "release on a record no longer held");
            return Ok(());
        }

        let expected_version = record.version_seen();
        let mut attempt = 0u32;
        loop {
            let outcome = match mode {
                ReleaseMode::Unlock => {
                    let item = RemoteLock {
                        name: record.name().to_string(),
                        owner: String::new(),
                        version: expected_version + 1,
                        duration_ms: record.lease().as_millis() as u64,
                        payload: record.payload_cloned(),
                    };
                    self.store
                        .put_if_matches(record.owner_id(), expected_version, item)
                        .await
                }
                ReleaseMode::Delete => {
                    self.store
                        .delete_if_matches(record.name(), record.owner_id(), expected_version)
                        .await
                }
            };

            match outcome {
                Ok(WriteOutcome::Written) => {
                    record.mark_released();
                    debug!(name = %record.name(), "lock released");
                    return Ok(());
                }
                Ok(WriteOutcome::Conflict(_)) | Err(StoreError::NotFound) => {
                    record.mark_lost();
                    debug!(name = %record.name(), "lock already lost at release");
                    return Ok(());
                }
                Err(StoreError::Transient(msg)) => {
                    attempt += 1;
                    if attempt >= self.config.max_attempts.max(1) {
                        record.mark_released();
                        warn!(
                            name = %record.name(),
                            error = %msg,
                            "release outcome unknown after retries"
                        );
                        return Err(LockError::Unknown);
                    }
                    debug!(name = %record.name(), error = %msg, "transient release error, retrying");
                    tokio::time::sleep(Duration::from_millis(self.config.retry_initial_ms)).await;
                }
                Err(StoreError::Fatal(msg)) => {
                    // The conditional write did not apply; this client no
                    // longer controls the item, it did not release it.
                    record.mark_lost();
                    error!(name = %record.name(), error = %msg, "fatal error during release");
                    return Err(LockError::Fatal(msg));
                }
            }
        }
    }

    /// Diagnostic read-only view of the remote item for `name`.
    #[instrument(skip(self), fields(name = %name))]
    pub async fn inspect(&self, name: &str) -> LockResult<Option<RemoteLock>> {
        let mut attempt = 0u32;
        loop {
            match self.store.get(name).await {
                Ok(item) => return Ok(item),
                Err(StoreError::NotFound) => return Ok(None),
                Err(StoreError::Transient(msg)) => {
                    attempt += 1;
                    if attempt >= self.config.max_attempts.max(1) {
                        return Err(LockError::Unknown);
                    }
                    debug!(name = %name, error = %msg, "transient inspect error, retrying");
                    tokio::time::sleep(Duration::from_millis(self.config.retry_initial_ms)).await;
                }
                Err(StoreError::Fatal(msg)) => return Err(LockError::Fatal(msg)),
            }
        }
    }

    /// Scoped acquisition with guaranteed release.
    ///
    /// Acquires `name`, runs `body` with a handle, then unlocks exactly
    /// once on every exit path. An unlock failure is reported via `warn!`
    /// but does not mask the body's output.
    pub async fn with_lock<T, F, Fut>(
        &self,
        name: &str,
        options: AcquireOptions,
        body: F,
    ) -> LockResult<T>
    where
        F: FnOnce(LockHandle) -> Fut,
        Fut: Future<Output = T>,
    {
        let handle = self.acquire(name, options).await?;
        let output = body(handle.clone()).await;
        if let Err(err) = self.unlock(&handle).await {
            warn!(name = %handle.name(), error = %err, "unlock failed after scoped section");
        }
        Ok(output)
    }
}

impl std::fmt::Debug for LockClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockClient")
            .field("owner", &self.owner)
            .field("config", &self.config)
            .finish()
    }
}
