// Copyright (C) 2019-2020  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Per-source admission limiting.
//!
//! Protects a service against a single source range opening connections too
//! fast (token bucket) or holding too many at once (concurrency cap). Both
//! tables are keyed by the subnet-masked source address, so a /24 worth of
//! IPv4 hosts (or a /56 of IPv6, by default) shares one budget.
//!
//! [`AdmissionLimiter::try_enter`] either rejects or returns an
//! [`AdmissionTicket`]; the ticket frees its concurrency slot exactly once,
//! on drop or explicit release. A background sweeper evicts idle rate
//! buckets and bounds the table size.

use fnv::FnvBuildHasher;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;

mod config;
mod key;

pub use config::AdmissionConfig;
pub use key::{is_local_source, normalize, AdmissionKey};

/// Rejection returned by [`AdmissionLimiter::try_enter`]. The caller must
/// not proceed with the connection; typically it closes it immediately.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionRejected {
    /// The source range exhausted its token bucket.
    #[error("connection rate limit exceeded for {key}")]
    Rate { key: AdmissionKey },
    /// The source range is at its concurrent-session cap.
    #[error("concurrent session limit exceeded for {key}")]
    Concurrency { key: AdmissionKey },
}

/// Per-source connection rate and concurrency limiter. Clones share the
/// same tables.
#[derive(Clone)]
pub struct AdmissionLimiter {
    shared: Arc<Shared>,
}

struct Shared {
    config: AdmissionConfig,
    buckets: Mutex<HashMap<AdmissionKey, RateBucket, FnvBuildHasher>>,
    concurrency: Mutex<HashMap<AdmissionKey, usize, FnvBuildHasher>>,
}

struct RateBucket {
    /// Always within `[0, burst]`.
    tokens: f64,
    last_refill: Instant,
    /// Timestamp of the last admission attempt; drives idle eviction.
    last_seen: Instant,
    penalized: bool,
}

impl AdmissionLimiter {
    /// Builds a limiter from `config`. The configuration is sanitized
    /// first: out-of-range values are replaced by the defaults.
    pub fn new(config: AdmissionConfig) -> AdmissionLimiter {
        AdmissionLimiter {
            shared: Arc::new(Shared {
                config: config.sanitize(),
                buckets: Mutex::new(HashMap::default()),
                concurrency: Mutex::new(HashMap::default()),
            }),
        }
    }

    /// Decides whether a connection from `source` may proceed.
    ///
    /// A token consumed by the rate check is not refunded if the
    /// concurrency check then rejects; the two limits are independent.
    pub fn try_enter(&self, source: IpAddr) -> Result<AdmissionTicket, AdmissionRejected> {
        self.try_enter_at(source, Instant::now())
    }

    fn try_enter_at(
        &self,
        source: IpAddr,
        now: Instant,
    ) -> Result<AdmissionTicket, AdmissionRejected> {
        let config = &self.shared.config;
        if !config.enabled {
            return Ok(AdmissionTicket::exempt());
        }

        let source = key::normalize(source);
        if config.exclude_local_network && key::is_local_source(&source) {
            return Ok(AdmissionTicket::exempt());
        }

        let key = AdmissionKey::from_source(
            source,
            config.src_ipv4_subnet_length,
            config.src_ipv6_subnet_length,
        );

        self.rate_check(key, now)?;
        self.concurrency_check(key)?;

        Ok(AdmissionTicket {
            shared: Some(Arc::downgrade(&self.shared)),
            key,
        })
    }

    fn rate_check(&self, key: AdmissionKey, now: Instant) -> Result<(), AdmissionRejected> {
        let config = &self.shared.config;
        let mut buckets = self.shared.buckets.lock();
        let bucket = buckets.entry(key).or_insert_with(|| RateBucket {
            tokens: config.burst,
            last_refill: now,
            last_seen: now,
            penalized: false,
        });

        let elapsed = now
            .checked_duration_since(bucket.last_refill)
            .unwrap_or_default();
        bucket.tokens =
            (bucket.tokens + elapsed.as_secs_f64() * config.limit_per_second).min(config.burst);
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            bucket.penalized = false;
            Ok(())
        } else {
            if config.enable_penalty {
                // An over-rate source pays for hammering: every rejection
                // empties the bucket, so it waits a full token interval
                // from its last rejection.
                bucket.tokens = 0.0;
                if !bucket.penalized {
                    bucket.penalized = true;
                    log::debug!("penalizing {} for over-rate connects", key);
                }
            }
            log::debug!("rate limit rejection for {}", key);
            Err(AdmissionRejected::Rate { key })
        }
    }

    fn concurrency_check(&self, key: AdmissionKey) -> Result<(), AdmissionRejected> {
        let mut concurrency = self.shared.concurrency.lock();
        let count = concurrency.entry(key).or_insert(0);
        if *count < self.shared.config.max_concurrent {
            *count += 1;
            Ok(())
        } else {
            log::debug!("concurrency rejection for {} (at {})", key, *count);
            Err(AdmissionRejected::Concurrency { key })
        }
    }

    /// Number of rate buckets currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.shared.buckets.lock().len()
    }

    /// Spawns the periodic sweeper task. The task holds only a weak
    /// reference and stops by itself once the limiter is dropped.
    pub fn spawn_sweeper(&self) -> async_std::task::JoinHandle<()> {
        let weak = Arc::downgrade(&self.shared);
        let interval = self.shared.config.gc_interval;
        async_std::task::spawn(async move {
            loop {
                async_std::task::sleep(interval).await;
                match weak.upgrade() {
                    Some(shared) => shared.sweep(Instant::now()),
                    None => break,
                }
            }
        })
    }

    #[cfg(test)]
    fn sweep_at(&self, now: Instant) {
        self.shared.sweep(now);
    }
}

impl Shared {
    /// Evicts idle rate buckets, then enforces `max_entries` by dropping
    /// the oldest-idle buckets first. Holds the bucket lock only; admission
    /// checks for other keys resume as soon as the (bounded) walk is done.
    fn sweep(&self, now: Instant) {
        let mut buckets = self.buckets.lock();
        let expires = self.config.expires;
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            now.checked_duration_since(bucket.last_seen)
                .map(|idle| idle < expires)
                .unwrap_or(true)
        });

        if buckets.len() > self.config.max_entries {
            let mut by_idle: Vec<(AdmissionKey, Instant)> = buckets
                .iter()
                .map(|(key, bucket)| (*key, bucket.last_seen))
                .collect();
            by_idle.sort_by_key(|&(_, last_seen)| last_seen);
            let excess = buckets.len() - self.config.max_entries;
            for (key, _) in by_idle.into_iter().take(excess) {
                buckets.remove(&key);
            }
        }

        if before != buckets.len() {
            log::debug!(
                "admission sweep evicted {} buckets ({} tracked)",
                before - buckets.len(),
                buckets.len()
            );
        }
    }

    fn release(&self, key: AdmissionKey) {
        let mut concurrency = self.concurrency.lock();
        match concurrency.get_mut(&key) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                concurrency.remove(&key);
            }
            None => debug_assert!(false, "ticket released for untracked key"),
        }
    }
}

/// Scoped permit for one admitted session.
///
/// Dropping the ticket (or calling [`AdmissionTicket::release`]) frees the
/// concurrency slot; doing both only frees it once. Tickets for exempt
/// sources (limiter disabled, or local network excluded) hold no slot.
#[must_use = "dropping the ticket releases the admission slot"]
pub struct AdmissionTicket {
    shared: Option<Weak<Shared>>,
    key: AdmissionKey,
}

impl AdmissionTicket {
    fn exempt() -> AdmissionTicket {
        AdmissionTicket {
            shared: None,
            key: AdmissionKey::from_source(IpAddr::from([0u8, 0, 0, 0]), 32, 128),
        }
    }

    /// Releases the concurrency slot now. Releasing twice is a no-op.
    pub fn release(&mut self) {
        if let Some(weak) = self.shared.take() {
            if let Some(shared) = weak.upgrade() {
                shared.release(self.key);
            }
        }
    }
}

impl Drop for AdmissionTicket {
    fn drop(&mut self) {
        self.release();
    }
}
