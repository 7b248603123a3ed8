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

//! Client configuration and per-acquire options.
//!
//! ## Environment Variables
//! [`ClientConfig::from_env`] reads:
//! - `DYNAMOLOCK_LEASE_MS`: default lease length (default: 30000)
//! - `DYNAMOLOCK_RENEW_FACTOR`: renewals per lease window, minimum 3 (default: 3)
//! - `DYNAMOLOCK_RETRY_INITIAL_MS`: initial backoff between takeover rounds (default: 100)
//! - `DYNAMOLOCK_RETRY_MAX_MS`: backoff cap (default: 5000)
//! - `DYNAMOLOCK_ACQUIRE_TIMEOUT_MS`: wall-clock bound on acquire (default: unbounded)
//! - `DYNAMOLOCK_MAX_ATTEMPTS`: takeover rounds before `Unavailable` (default: 3)
//! - `DYNAMOLOCK_IDENTITY`: fixed client identity instead of a fresh ULID

use std::time::Duration;

/// Minimum number of renewals per lease window. Two consecutive renewal
/// failures must still leave safety margin before the local deadline.
const MIN_RENEW_FACTOR: u32 = 3;

/// Client-wide defaults for lock operations.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Lease length used when an acquire does not specify one, in
    /// milliseconds.
    pub default_lease_ms: u64,
    /// Number of renewal intervals per lease window; values below 3 are
    /// treated as 3.
    pub renew_factor: u32,
    /// Initial backoff between takeover rounds, in milliseconds.
    pub retry_initial_ms: u64,
    /// Backoff cap, in milliseconds.
    pub retry_max_ms: u64,
    /// Upper bound on total wall-clock spent in `acquire`; `None` means
    /// unbounded.
    pub acquire_timeout_ms: Option<u64>,
    /// Maximum number of takeover rounds per acquire.
    pub max_attempts: u32,
    /// Fixed client identity. When `None`, a fresh ULID is generated at
    /// client construction so restarts produce new identities.
    pub identity_override: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_lease_ms: 30_000,
            renew_factor: MIN_RENEW_FACTOR,
            retry_initial_ms: 100,
            retry_max_ms: 5_000,
            acquire_timeout_ms: None,
            max_attempts: 3,
            identity_override: None,
        }
    }
}

impl ClientConfig {
    /// Build a configuration from `DYNAMOLOCK_*` environment variables,
    /// falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_lease_ms: env_u64("DYNAMOLOCK_LEASE_MS")
                .unwrap_or(defaults.default_lease_ms),
            renew_factor: env_u64("DYNAMOLOCK_RENEW_FACTOR")
                .map(|v| v as u32)
                .unwrap_or(defaults.renew_factor),
            retry_initial_ms: env_u64("DYNAMOLOCK_RETRY_INITIAL_MS")
                .unwrap_or(defaults.retry_initial_ms),
            retry_max_ms: env_u64("DYNAMOLOCK_RETRY_MAX_MS").unwrap_or(defaults.retry_max_ms),
            acquire_timeout_ms: env_u64("DYNAMOLOCK_ACQUIRE_TIMEOUT_MS"),
            max_attempts: env_u64("DYNAMOLOCK_MAX_ATTEMPTS")
                .map(|v| v as u32)
                .unwrap_or(defaults.max_attempts),
            identity_override: std::env::var("DYNAMOLOCK_IDENTITY")
                .ok()
                .filter(|s| !s.is_empty()),
        }
    }

    /// Renewal period for a lease: `lease / renew_factor`, with the factor
    /// clamped to at least 3.
    pub fn renew_interval(&self, lease: Duration) -> Duration {
        lease / self.renew_factor.max(MIN_RENEW_FACTOR)
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Per-call options for [`LockClient::acquire`](crate::client::LockClient::acquire).
///
/// Every field is optional; unset fields resolve against the client's
/// [`ClientConfig`].
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    /// Lease length for this acquisition, in milliseconds.
    pub lease_ms: Option<u64>,
    /// Bytes to write into the item on successful acquisition.
    pub payload: Option<Vec<u8>>,
    /// Maximum number of takeover rounds.
    pub max_attempts: Option<u32>,
    /// Upper bound on total wall-clock spent in `acquire`, in milliseconds.
    pub acquire_timeout_ms: Option<u64>,
    /// Initial backoff between rounds, in milliseconds.
    pub retry_initial_ms: Option<u64>,
    /// Backoff cap, in milliseconds.
    pub retry_max_ms: Option<u64>,
    /// Never wait out a holder's advertised lease; a round that finds the
    /// lock owned fails instead of sleeping.
    pub no_wait: bool,
}

impl AcquireOptions {
    /// Options that resolve entirely against the client configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail fast: a single takeover round that never waits out a holder's
    /// lease. Against an owned lock this returns `Unavailable` immediately.
    pub fn no_wait() -> Self {
        Self {
            max_attempts: Some(1),
            no_wait: true,
            ..Self::default()
        }
    }

    /// Set the lease length in milliseconds.
    pub fn with_lease_ms(mut self, lease_ms: u64) -> Self {
        self.lease_ms = Some(lease_ms);
        self
    }

    /// Set the payload carried with the lock.
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Set the maximum number of takeover rounds.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the wall-clock bound on the whole acquire call.
    pub fn with_acquire_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.acquire_timeout_ms = Some(timeout_ms);
        self
    }

    /// Set the backoff range between takeover rounds.
    pub fn with_retry_ms(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.retry_initial_ms = Some(initial_ms);
        self.retry_max_ms = Some(max_ms);
        self
    }

    pub(crate) fn resolve(self, config: &ClientConfig) -> ResolvedAcquire {
        ResolvedAcquire {
            // A zero lease would make the renewal period zero as well.
            lease: Duration::from_millis(self.lease_ms.unwrap_or(config.default_lease_ms).max(1)),
            payload: self.payload,
            max_attempts: self.max_attempts.unwrap_or(config.max_attempts).max(1),
            timeout: self
                .acquire_timeout_ms
                .or(config.acquire_timeout_ms)
                .map(Duration::from_millis),
            retry_initial: Duration::from_millis(
                self.retry_initial_ms.unwrap_or(config.retry_initial_ms),
            ),
            retry_max: Duration::from_millis(self.retry_max_ms.unwrap_or(config.retry_max_ms)),
            no_wait: self.no_wait,
        }
    }
}

/// Acquire options after resolution against the client configuration.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedAcquire {
    pub lease: Duration,
    pub payload: Option<Vec<u8>>,
    pub max_attempts: u32,
    pub timeout: Option<Duration>,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    pub no_wait: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_resolve_against_config() {
        let config = ClientConfig {
            default_lease_ms: 20_000,
            acquire_timeout_ms: Some(60_000),
            ..ClientConfig::default()
        };

        let resolved = AcquireOptions::new().resolve(&config);
        assert_eq!(resolved.lease, Duration::from_millis(20_000));
        assert_eq!(resolved.max_attempts, 3);
        assert_eq!(resolved.timeout, Some(Duration::from_millis(60_000)));

        let resolved = AcquireOptions::new()
            .with_lease_ms(5_000)
            .with_max_attempts(7)
            .with_acquire_timeout_ms(1_000)
            .with_retry_ms(10, 100)
            .resolve(&config);
        assert_eq!(resolved.lease, Duration::from_millis(5_000));
        assert_eq!(resolved.max_attempts, 7);
        assert_eq!(resolved.timeout, Some(Duration::from_millis(1_000)));
        assert_eq!(resolved.retry_initial, Duration::from_millis(10));
        assert_eq!(resolved.retry_max, Duration::from_millis(100));
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        let resolved = AcquireOptions::new()
            .with_max_attempts(0)
            .resolve(&ClientConfig::default());
        assert_eq!(resolved.max_attempts, 1);
    }

    #[test]
    fn renew_factor_is_clamped() {
        let config = ClientConfig {
            renew_factor: 1,
            ..ClientConfig::default()
        };
        assert_eq!(
            config.renew_interval(Duration::from_millis(900)),
            Duration::from_millis(300)
        );

        let config = ClientConfig {
            renew_factor: 5,
            ..ClientConfig::default()
        };
        assert_eq!(
            config.renew_interval(Duration::from_millis(1_000)),
            Duration::from_millis(200)
        );
    }

    #[test]
    fn no_wait_is_a_single_round_without_lease_wait() {
        let resolved = AcquireOptions::no_wait().resolve(&ClientConfig::default());
        assert_eq!(resolved.max_attempts, 1);
        assert!(resolved.no_wait);
        assert!(!AcquireOptions::new().resolve(&ClientConfig::default()).no_wait);
    }
}
