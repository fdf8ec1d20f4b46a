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

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Monotonic microsecond clock for packet timestamps.
///
/// The wall clock is read once at construction; every later reading is the
/// monotonic elapsed time added to that base, so timestamps in one capture
/// never go backwards even if the system clock is adjusted. The fixed
/// `utc_offset` is baked into the base at construction.
pub struct CaptureClock {
    base_instant: Instant,
    base_micros: u64,
}

impl CaptureClock {
    pub fn new(utc_offset: Duration) -> CaptureClock {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        CaptureClock {
            base_instant: Instant::now(),
            base_micros: (wall + utc_offset).as_micros() as u64,
        }
    }

    /// Current capture time in microseconds since the Unix epoch (plus the
    /// baked-in offset).
    pub fn now_micros(&self) -> u64 {
        self.base_micros + self.base_instant.elapsed().as_micros() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::CaptureClock;
    use std::time::Duration;

    #[test]
    fn monotonic() {
        let clock = CaptureClock::new(Duration::from_secs(0));
        let a = clock.now_micros();
        let b = clock.now_micros();
        assert!(b >= a);
    }

    #[test]
    fn offset_applied() {
        let base = CaptureClock::new(Duration::from_secs(0)).now_micros();
        let offset = CaptureClock::new(Duration::from_secs(3600)).now_micros();
        let delta = offset.saturating_sub(base);
        assert!(delta >= 3_500_000_000 && delta <= 3_700_000_000);
    }
}
