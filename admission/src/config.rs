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

use std::time::Duration;

/// Tuning knobs of the admission limiter.
///
/// Invalid values never abort startup: [`AdmissionConfig::sanitize`]
/// replaces them by the documented defaults, with a warning.
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Master switch. When false, every source is admitted unconditionally.
    pub enabled: bool,
    /// Prefix length applied to IPv4 sources to form the admission key.
    /// Valid range 1..=32.
    pub src_ipv4_subnet_length: u8,
    /// Prefix length applied to IPv6 sources to form the admission key.
    /// Valid range 1..=128.
    pub src_ipv6_subnet_length: u8,
    /// When true, loopback/private/link-local sources bypass limiting.
    pub exclude_local_network: bool,
    /// Token bucket capacity. Must be > 0.
    pub burst: f64,
    /// Token refill rate, per second. Must be > 0.
    pub limit_per_second: f64,
    /// Idle time after which a rate bucket is evicted by the sweeper.
    pub expires: Duration,
    /// Upper bound on tracked rate buckets; the sweeper evicts
    /// oldest-idle-first beyond it.
    pub max_entries: usize,
    /// When true, a rate rejection empties the bucket, so an abusive
    /// source waits at least one full token interval from its last
    /// rejection.
    pub enable_penalty: bool,
    /// Interval between sweeper runs.
    pub gc_interval: Duration,
    /// Maximum number of in-flight sessions per admission key.
    pub max_concurrent: usize,
}

impl Default for AdmissionConfig {
    fn default() -> AdmissionConfig {
        AdmissionConfig {
            enabled: true,
            src_ipv4_subnet_length: 24,
            src_ipv6_subnet_length: 56,
            exclude_local_network: true,
            burst: 10.0,
            limit_per_second: 5.0,
            expires: Duration::from_secs(60),
            max_entries: 10_000,
            enable_penalty: false,
            gc_interval: Duration::from_secs(10),
            max_concurrent: 100,
        }
    }
}

impl AdmissionConfig {
    /// Returns a copy with every out-of-range field replaced by its
    /// default. Each replacement is logged at warn level.
    pub fn sanitize(mut self) -> AdmissionConfig {
        let defaults = AdmissionConfig::default();

        if self.src_ipv4_subnet_length < 1 || self.src_ipv4_subnet_length > 32 {
            log::warn!(
                "invalid src_ipv4_subnet_length {}; using {}",
                self.src_ipv4_subnet_length,
                defaults.src_ipv4_subnet_length
            );
            self.src_ipv4_subnet_length = defaults.src_ipv4_subnet_length;
        }
        if self.src_ipv6_subnet_length < 1 || self.src_ipv6_subnet_length > 128 {
            log::warn!(
                "invalid src_ipv6_subnet_length {}; using {}",
                self.src_ipv6_subnet_length,
                defaults.src_ipv6_subnet_length
            );
            self.src_ipv6_subnet_length = defaults.src_ipv6_subnet_length;
        }
        if !(self.burst > 0.0) || !self.burst.is_finite() {
            log::warn!("invalid burst {}; using {}", self.burst, defaults.burst);
            self.burst = defaults.burst;
        }
        if !(self.limit_per_second > 0.0) || !self.limit_per_second.is_finite() {
            log::warn!(
                "invalid limit_per_second {}; using {}",
                self.limit_per_second,
                defaults.limit_per_second
            );
            self.limit_per_second = defaults.limit_per_second;
        }
        if self.expires == Duration::from_secs(0) {
            log::warn!("invalid expires 0; using {:?}", defaults.expires);
            self.expires = defaults.expires;
        }
        if self.max_entries == 0 {
            log::warn!("invalid max_entries 0; using {}", defaults.max_entries);
            self.max_entries = defaults.max_entries;
        }
        if self.gc_interval == Duration::from_secs(0) {
            log::warn!(
                "invalid gc_interval 0; using {:?}",
                defaults.gc_interval
            );
            self.gc_interval = defaults.gc_interval;
        }
        if self.max_concurrent == 0 {
            log::warn!(
                "invalid max_concurrent 0; using {}",
                defaults.max_concurrent
            );
            self.max_concurrent = defaults.max_concurrent;
        }

        self
    }
}
