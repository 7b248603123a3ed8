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

//! Renewal engine: per-record heartbeat task.
//!
//! ## Purpose
//! Keeps a held lock's lease fresh by CAS-renewing it every
//! `lease / renew_factor`. The engine is purely an optimization that
//! extends the local deadline; safety rests on the deadline check that the
//! facade performs on every owner-facing operation.
//!
//! ## Teardown
//! The task holds only a weak reference to the record, so dropping every
//! handle ends it. `unlock`/`delete` stop it deterministically (stop flag,
//! notify, join) before issuing their own CAS.

use crate::error::StoreError;
use crate::record::{LockState, RecordInner};
use crate::store::{LockStore, RemoteLock, WriteOutcome};
use std::sync::{Arc, Weak};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

/// Spawn the renewal task for a freshly acquired record.
pub(crate) fn spawn(store: Arc<dyn LockStore>, record: &Arc<RecordInner>) {
    let weak: Weak<RecordInner> = Arc::downgrade(record);
    let stop = record.stop_notify();
    let period = record.renew_interval();

    let task = tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.notified() => break,
                _ = ticker.tick() => {}
            }
            let Some(record) = weak.upgrade() else { break };
            if record.is_stop_requested() {
                break;
            }
            if !renew_once(store.as_ref(), &record).await {
                break;
            }
        }
    });
    record.attach_renewal(task);
}

/// Issue one renewal. Returns `false` when the task should end: the record
/// left `Held`, a release is in progress, or the lease was lost.
async fn renew_once(store: &dyn LockStore, record: &RecordInner) -> bool {
    let _guard = record.op_guard().await;
    if record.is_stop_requested() {
        return false;
    }
    if record.check_liveness() != LockState::Held {
        return false;
    }

    let expected_version = record.version_seen();
    let item = RemoteLock {
        name: record.name().to_string(),
        owner: record.owner_id().to_string(),
        version: expected_version + 1,
        duration_ms: record.lease().as_millis() as u64,
        payload: record.payload_cloned(),
    };
    // Transient failures are retried only while the deadline still leaves
    // one full renewal interval of margin.
    let safety_margin = record.renew_interval();

    loop {
        let issued_at = Instant::now();
        match store
            .put_if_matches(record.owner_id(), expected_version, item.clone())
            .await
        {
            Ok(WriteOutcome::Written) => {
                let version = record.renew_succeeded(issued_at);
                debug!(
                    name = %record.name(),
                    owner = %record.owner_id(),
                    version,
                    "lease renewed"
                );
                return true;
            }
            Ok(WriteOutcome::Conflict(current)) => {
                warn!(
                    name = %record.name(),
                    owner = %record.owner_id(),
                    expected_version,
                    current_owner = current.as_ref().map(|c| c.owner.as_str()).unwrap_or("?"),
                    "renewal conflict, lock was taken over or released"
                );
                record.mark_lost();
                return false;
            }
            Err(StoreError::NotFound) => {
                warn!(name = %record.name(), "lock item vanished during renewal");
                record.mark_lost();
                return false;
            }
            Err(StoreError::Transient(msg)) => {
                if record.deadline() <= Instant::now() + safety_margin {
                    warn!(
                        name = %record.name(),
                        error = %msg,
                        "deadline margin exhausted while retrying renewal"
                    );
                    record.mark_lost();
                    return false;
                }
                debug!(name = %record.name(), error = %msg, "transient renewal error, retrying");
                tokio::time::sleep(record.retry_pause()).await;
            }
            Err(StoreError::Fatal(msg)) => {
                error!(name = %record.name(), error = %msg, "fatal error during renewal");
                record.mark_lost();
                return false;
            }
        }
    }
}
