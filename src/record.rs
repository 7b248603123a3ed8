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

//! Local lock record and its state machine.
//!
//! ## Purpose
//! Holds the client-side view of one held or contended lock: the last
//! version this client wrote for its own ownership, the local deadline past
//! which ownership must not be asserted, and the record's lifecycle state.
//!
//! ## Ownership Model
//! The client facade owns the record; the renewal engine borrows it for
//! mutation under a per-record serialization discipline; callers hold a
//! cloneable [`LockHandle`] that dereferences read-only fields and routes
//! mutations through the facade.
//!
//! ## State Machine
//! ```text
//!            acquire ok
//!   (none) ──────────────▶ Held ──┬── renew ok ─────▶ Held
//!                                 ├── renew conflict ▶ Lost
//!                                 ├── deadline passed ▶ Lost
//!                                 └── unlock/delete ──▶ Released
//! ```
//! `Lost` and `Released` are terminal; a record is never revived.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Lifecycle state of a local lock record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Acquisition is in flight; never observable through a handle.
    Acquiring,
    /// This client owns the lock and the local deadline has not passed.
    Held,
    /// Ownership was lost: a renewal conflicted, the deadline passed, or a
    /// release CAS mismatched. Terminal.
    Lost,
    /// The lock was explicitly unlocked or deleted by this client. Terminal.
    Released,
}

impl LockState {
    /// Whether the state admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LockState::Lost | LockState::Released)
    }
}

#[derive(Debug)]
struct RecordCore {
    state: LockState,
    version_seen: u64,
    deadline: Instant,
}

/// Shared state behind every handle clone for one acquisition.
pub(crate) struct RecordInner {
    name: String,
    owner: String,
    lease: Duration,
    renew_interval: Duration,
    retry_pause: Duration,
    payload: Option<Vec<u8>>,
    core: Mutex<RecordCore>,
    /// Serializes renewal writes against release writes.
    op_lock: AsyncMutex<()>,
    renew_stopped: AtomicBool,
    renew_stop: Arc<Notify>,
    lost: Notify,
    renew_task: Mutex<Option<JoinHandle<()>>>,
}

impl RecordInner {
    pub(crate) fn new(
        name: String,
        owner: String,
        lease: Duration,
        renew_interval: Duration,
        retry_pause: Duration,
        payload: Option<Vec<u8>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            owner,
            lease,
            renew_interval,
            retry_pause,
            payload,
            core: Mutex::new(RecordCore {
                state: LockState::Acquiring,
                version_seen: 0,
                deadline: Instant::now(),
            }),
            op_lock: AsyncMutex::new(()),
            renew_stopped: AtomicBool::new(false),
            renew_stop: Arc::new(Notify::new()),
            lost: Notify::new(),
            renew_task: Mutex::new(None),
        })
    }

    fn core(&self) -> MutexGuard<'_, RecordCore> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn owner_id(&self) -> &str {
        &self.owner
    }

    pub(crate) fn lease(&self) -> Duration {
        self.lease
    }

    pub(crate) fn renew_interval(&self) -> Duration {
        self.renew_interval
    }

    pub(crate) fn retry_pause(&self) -> Duration {
        self.retry_pause
    }

    pub(crate) fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub(crate) fn payload_cloned(&self) -> Option<Vec<u8>> {
        self.payload.clone()
    }

    pub(crate) fn version_seen(&self) -> u64 {
        self.core().version_seen
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.core().deadline
    }

    /// Transition `Acquiring → Held` after a successful takeover CAS.
    pub(crate) fn promote_to_held(&self, version: u64, deadline: Instant) {
        let mut core = self.core();
        if core.state == LockState::Acquiring {
            core.state = LockState::Held;
            core.version_seen = core.version_seen.max(version);
            core.deadline = deadline;
        }
    }

    /// Current state, transitioning `Held → Lost` first if the local
    /// deadline has passed without a successful renewal.
    pub(crate) fn check_liveness(&self) -> LockState {
        let mut core = self.core();
        if core.state == LockState::Held && core.deadline <= Instant::now() {
            core.state = LockState::Lost;
            drop(core);
            self.lost.notify_waiters();
            return LockState::Lost;
        }
        core.state
    }

    /// Record a successful renewal: bump `version_seen` by exactly one and
    /// extend the deadline by one lease from the renewal's issue instant.
    pub(crate) fn renew_succeeded(&self, issued_at: Instant) -> u64 {
        let mut core = self.core();
        core.version_seen += 1;
        core.deadline = issued_at + self.lease;
        core.version_seen
    }

    pub(crate) fn mark_lost(&self) {
        let mut core = self.core();
        if !core.state.is_terminal() {
            core.state = LockState::Lost;
        }
        drop(core);
        self.lost.notify_waiters();
    }

    pub(crate) fn mark_released(&self) {
        let mut core = self.core();
        if !core.state.is_terminal() {
            core.state = LockState::Released;
        }
        drop(core);
        self.lost.notify_waiters();
    }

    /// Acquire the per-record operation lock, serializing renewal writes
    /// against release writes.
    pub(crate) async fn op_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.op_lock.lock().await
    }

    pub(crate) fn attach_renewal(&self, task: JoinHandle<()>) {
        let mut slot = self
            .renew_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(task);
    }

    pub(crate) fn stop_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.renew_stop)
    }

    pub(crate) fn is_stop_requested(&self) -> bool {
        self.renew_stopped.load(Ordering::SeqCst)
    }

    /// Stop the renewal task and wait for it to finish. Idempotent; the
    /// first caller joins the task, later callers return immediately.
    pub(crate) async fn stop_renewal(&self) {
        self.renew_stopped.store(true, Ordering::SeqCst);
        self.renew_stop.notify_one();
        let task = {
            let mut slot = self
                .renew_task
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slot.take()
        };
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn wait_lost(&self) {
        loop {
            let notified = self.lost.notified();
            if self.check_liveness().is_terminal() {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for RecordInner {
    fn drop(&mut self) {
        // The renewal task only holds a weak reference; abort it so a
        // dropped-without-unlock record stops renewing promptly.
        self.renew_stopped.store(true, Ordering::SeqCst);
        let slot = self
            .renew_task
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(task) = slot.take() {
            task.abort();
        }
    }
}

/// Cloneable handle to a held (or formerly held) lock.
///
/// A handle is a read-only view; `unlock` and `delete` go through the
/// [`LockClient`](crate::client::LockClient) that produced it. Dropping
/// every clone of a handle stops its renewal task without releasing the
/// lock remotely; the lease then simply expires.
#[derive(Clone)]
pub struct LockHandle {
    inner: Arc<RecordInner>,
}

impl LockHandle {
    pub(crate) fn from_inner(inner: Arc<RecordInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<RecordInner> {
        &self.inner
    }

    /// The lock name.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// The payload written at acquisition, if any.
    pub fn payload(&self) -> Option<&[u8]> {
        self.inner.payload()
    }

    /// The lease length this client renews with.
    pub fn lease(&self) -> Duration {
        self.inner.lease()
    }

    /// Last version this client wrote for its own ownership.
    pub fn version(&self) -> u64 {
        self.inner.version_seen()
    }

    /// Current record state. Observing an expired deadline transitions the
    /// record to [`LockState::Lost`] before returning.
    pub fn state(&self) -> LockState {
        self.inner.check_liveness()
    }

    /// Whether this client still holds the lock locally: the record is
    /// `Held` and the local deadline has not passed.
    pub fn is_held(&self) -> bool {
        self.state() == LockState::Held
    }

    /// Wait until the record reaches a terminal state (`Lost` or
    /// `Released`). Returns immediately if it already has.
    pub async fn wait_lost(&self) {
        self.inner.wait_lost().await
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("name", &self.name())
            .field("state", &self.inner.core().state)
            .field("version", &self.inner.core().version_seen)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(lease_ms: u64) -> Arc<RecordInner> {
        RecordInner::new(
            "job".to_string(),
            "owner-1".to_string(),
            Duration::from_millis(lease_ms),
            Duration::from_millis(lease_ms / 3),
            Duration::from_millis(10),
            None,
        )
    }

    #[tokio::test]
    async fn promote_then_held() {
        let rec = record(1_000);
        rec.promote_to_held(1, Instant::now() + Duration::from_millis(1_000));
        assert_eq!(rec.check_liveness(), LockState::Held);
        assert_eq!(rec.version_seen(), 1);
    }

    #[tokio::test]
    async fn expired_deadline_transitions_to_lost() {
        let rec = record(1_000);
        rec.promote_to_held(1, Instant::now() - Duration::from_millis(1));
        assert_eq!(rec.check_liveness(), LockState::Lost);
        // Terminal: a later promote must not revive the record.
        rec.promote_to_held(2, Instant::now() + Duration::from_secs(60));
        assert_eq!(rec.check_liveness(), LockState::Lost);
    }

    #[tokio::test]
    async fn renew_extends_deadline_and_bumps_version() {
        let rec = record(1_000);
        rec.promote_to_held(3, Instant::now() + Duration::from_millis(1_000));
        let issued = Instant::now();
        let version = rec.renew_succeeded(issued);
        assert_eq!(version, 4);
        assert_eq!(rec.deadline(), issued + Duration::from_millis(1_000));
        assert!(rec.version_seen() > 3);
    }

    #[tokio::test]
    async fn mark_released_is_terminal() {
        let rec = record(1_000);
        rec.promote_to_held(1, Instant::now() + Duration::from_secs(5));
        rec.mark_released();
        assert_eq!(rec.check_liveness(), LockState::Released);
        rec.mark_lost();
        assert_eq!(rec.check_liveness(), LockState::Released);
    }

    #[tokio::test]
    async fn wait_lost_wakes_on_loss() {
        let rec = record(1_000);
        rec.promote_to_held(1, Instant::now() + Duration::from_secs(5));
        let handle = LockHandle::from_inner(Arc::clone(&rec));

        let waiter = tokio::spawn(async move { handle.wait_lost().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        rec.mark_lost();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake after loss")
            .expect("waiter task should not panic");
    }
}
