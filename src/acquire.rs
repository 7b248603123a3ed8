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

//! Acquisition engine: round-based lock takeover.
//!
//! ## Protocol
//! One round is: strong read, then either create the item (absent), CAS an
//! unowned item, or wait out the advertised lease on the local monotonic
//! clock, re-read, and CAS the unchanged `(owner, version)` witness. No
//! clock synchronization with the owner or the store is required; both
//! sides measure the lease against their own monotonic clocks.
//!
//! ## Liveness Bounds
//! Rounds are bounded by `max_attempts` and by an optional wall-clock
//! budget. Between rounds the engine sleeps with capped exponential
//! backoff and jitter. Cancellation is observed at every suspension point;
//! a CAS already in flight is awaited so that a post-cancel success can be
//! compensated with an immediate ownership clear.

use crate::config::ResolvedAcquire;
use crate::error::{LockError, LockResult, StoreError};
use crate::store::{LockStore, RemoteLock, WriteOutcome};
use rand::Rng;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outcome of a successful takeover CAS.
pub(crate) struct Acquisition {
    pub version: u64,
    pub deadline: Instant,
}

enum RoundOutcome {
    Acquired(Acquisition),
    Restart,
}

/// Run the full acquire protocol for `name` on behalf of `owner_self`.
pub(crate) async fn run(
    store: &dyn LockStore,
    owner_self: &str,
    name: &str,
    opts: &ResolvedAcquire,
    cancel: &CancellationToken,
) -> LockResult<Acquisition> {
    let overall_deadline = opts.timeout.map(|t| Instant::now() + t);
    let mut backoff = opts.retry_initial;
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(LockError::Canceled);
        }
        attempts += 1;

        match one_round(store, owner_self, name, opts, cancel, overall_deadline).await? {
            RoundOutcome::Acquired(acquisition) => {
                if cancel.is_cancelled() {
                    // The CAS resolved after cancellation; hand nothing to
                    // the caller and clear the ghost ownership.
                    release_ghost(store, owner_self, name, &acquisition, opts).await;
                    return Err(LockError::Canceled);
                }
                debug!(
                    name = %name,
                    owner = %owner_self,
                    version = acquisition.version,
                    attempts,
                    "lock acquired"
                );
                return Ok(acquisition);
            }
            RoundOutcome::Restart => {}
        }

        if attempts >= opts.max_attempts {
            debug!(name = %name, attempts, "takeover attempts exhausted");
            return Err(LockError::Unavailable { attempts });
        }

        let pause = jittered(backoff, opts.retry_max);
        wait_until(Instant::now() + pause, overall_deadline, cancel, opts).await?;
        backoff = (backoff * 2).min(opts.retry_max);
    }
}

/// One takeover round: read, branch on ownership, CAS.
async fn one_round(
    store: &dyn LockStore,
    owner_self: &str,
    name: &str,
    opts: &ResolvedAcquire,
    cancel: &CancellationToken,
    overall_deadline: Option<Instant>,
) -> LockResult<RoundOutcome> {
    let read_at = Instant::now();
    let seen = match read(store, name).await? {
        Read::Item(item) => item,
        Read::Absent => return try_create(store, owner_self, name, opts).await,
        Read::Retry => return Ok(RoundOutcome::Restart),
    };

    if seen.owner == owner_self {
        // Reentry is not modeled; the existing handle keeps the lease fresh.
        return Err(LockError::AlreadyHeld);
    }

    let (expected_owner, expected_version) = if seen.is_owned() {
        if opts.no_wait {
            // Fail-fast callers never sleep out a holder's lease.
            debug!(name = %name, owner = %seen.owner, "lock owned, not waiting");
            return Ok(RoundOutcome::Restart);
        }
        // Wait out the advertised lease, measured from the read instant on
        // our own monotonic clock, before presuming the owner dead.
        let lease_over = read_at + Duration::from_millis(seen.duration_ms);
        wait_until(lease_over, overall_deadline, cancel, opts).await?;

        match read(store, name).await? {
            Read::Absent => return try_create(store, owner_self, name, opts).await,
            Read::Retry => return Ok(RoundOutcome::Restart),
            Read::Item(current) => {
                if current.owner != seen.owner || current.version != seen.version {
                    // The owner released or renewed; the wait restarts
                    // against the new lease on the next round.
                    return Ok(RoundOutcome::Restart);
                }
                (current.owner, current.version)
            }
        }
    } else {
        // Item exists but ownership was cleared; take it without waiting.
        (seen.owner, seen.version)
    };

    let issued_at = Instant::now();
    let item = RemoteLock {
        name: name.to_string(),
        owner: owner_self.to_string(),
        version: expected_version + 1,
        duration_ms: opts.lease.as_millis() as u64,
        payload: opts.payload.clone(),
    };
    match store
        .put_if_matches(&expected_owner, expected_version, item)
        .await
    {
        Ok(WriteOutcome::Written) => Ok(RoundOutcome::Acquired(Acquisition {
            version: expected_version + 1,
            deadline: issued_at + opts.lease,
        })),
        Ok(WriteOutcome::Conflict(_)) => Ok(RoundOutcome::Restart),
        Err(StoreError::NotFound) => Ok(RoundOutcome::Restart),
        Err(StoreError::Transient(msg)) => {
            debug!(name = %name, error = %msg, "transient error during takeover CAS");
            Ok(RoundOutcome::Restart)
        }
        Err(StoreError::Fatal(msg)) => Err(LockError::Fatal(msg)),
    }
}

enum Read {
    Item(RemoteLock),
    Absent,
    Retry,
}

async fn read(store: &dyn LockStore, name: &str) -> LockResult<Read> {
    match store.get(name).await {
        Ok(Some(item)) => Ok(Read::Item(item)),
        Ok(None) | Err(StoreError::NotFound) => Ok(Read::Absent),
        Err(StoreError::Transient(msg)) => {
            debug!(name = %name, error = %msg, "transient error reading lock item");
            Ok(Read::Retry)
        }
        Err(StoreError::Fatal(msg)) => Err(LockError::Fatal(msg)),
    }
}

/// Unowned branch: create the item at version 1.
async fn try_create(
    store: &dyn LockStore,
    owner_self: &str,
    name: &str,
    opts: &ResolvedAcquire,
) -> LockResult<RoundOutcome> {
    let issued_at = Instant::now();
    let item = RemoteLock {
        name: name.to_string(),
        owner: owner_self.to_string(),
        version: 1,
        duration_ms: opts.lease.as_millis() as u64,
        payload: opts.payload.clone(),
    };
    match store.put_if_absent(item).await {
        Ok(WriteOutcome::Written) => Ok(RoundOutcome::Acquired(Acquisition {
            version: 1,
            deadline: issued_at + opts.lease,
        })),
        Ok(WriteOutcome::Conflict(_)) => Ok(RoundOutcome::Restart),
        Err(StoreError::NotFound) => Ok(RoundOutcome::Restart),
        Err(StoreError::Transient(msg)) => {
            debug!(name = %name, error = %msg, "transient error creating lock item");
            Ok(RoundOutcome::Restart)
        }
        Err(StoreError::Fatal(msg)) => Err(LockError::Fatal(msg)),
    }
}

/// Compensating release for a CAS that succeeded after cancellation.
async fn release_ghost(
    store: &dyn LockStore,
    owner_self: &str,
    name: &str,
    acquisition: &Acquisition,
    opts: &ResolvedAcquire,
) {
    let item = RemoteLock {
        name: name.to_string(),
        owner: String::new(),
        version: acquisition.version + 1,
        duration_ms: opts.lease.as_millis() as u64,
        payload: opts.payload.clone(),
    };
    match store
        .put_if_matches(owner_self, acquisition.version, item)
        .await
    {
        Ok(WriteOutcome::Written) => {
            debug!(name = %name, "cleared ownership after canceled acquire")
        }
        Ok(WriteOutcome::Conflict(_)) | Err(StoreError::NotFound) => {}
        Err(err) => {
            warn!(
                name = %name,
                error = %err,
                "failed to clear ownership after canceled acquire; lease will expire"
            );
        }
    }
}

/// Sleep until `target`, bounded by the overall acquire deadline and the
/// cancellation signal.
async fn wait_until(
    target: Instant,
    overall_deadline: Option<Instant>,
    cancel: &CancellationToken,
    opts: &ResolvedAcquire,
) -> LockResult<()> {
    let (effective, bounded_by_timeout) = match overall_deadline {
        Some(deadline) if deadline <= target => (deadline, true),
        _ => (target, false),
    };
    tokio::select! {
        _ = cancel.cancelled() => Err(LockError::Canceled),
        _ = sleep_until(effective) => {
            if bounded_by_timeout {
                let timeout_ms = opts.timeout.map(|t| t.as_millis() as u64).unwrap_or(0);
                Err(LockError::Timeout(timeout_ms))
            } else {
                Ok(())
            }
        }
    }
}

/// Backoff with jitter: up to half the base again, capped at `max`.
fn jittered(base: Duration, max: Duration) -> Duration {
    let base = base.min(max);
    let extra_ms = base.as_millis() as u64 / 2;
    if extra_ms == 0 {
        return base;
    }
    let jitter = rand::thread_rng().gen_range(0..=extra_ms);
    (base + Duration::from_millis(jitter)).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(5_000);
        for _ in 0..100 {
            let value = jittered(base, max);
            assert!(value >= base);
            assert!(value <= Duration::from_millis(150));
        }
    }

    #[test]
    fn jitter_respects_cap() {
        let base = Duration::from_millis(400);
        let max = Duration::from_millis(450);
        for _ in 0..100 {
            assert!(jittered(base, max) <= max);
        }
    }

    #[test]
    fn zero_backoff_has_no_jitter() {
        assert_eq!(
            jittered(Duration::ZERO, Duration::from_millis(100)),
            Duration::ZERO
        );
    }
}
