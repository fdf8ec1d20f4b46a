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

//! Socket telemetry records.
//!
//! The registry emits one record per connect and one per disconnect to a
//! caller-supplied [`TelemetrySink`]. Sinks are external collaborators: a
//! sink that fails must absorb the failure itself, nothing in the core
//! waits on or reacts to sink behavior.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use crate::socket::{Direction, SocketKind, TrafficTotals};

static TELEMETRY_ENABLED: AtomicBool = AtomicBool::new(true);

/// Globally enables or disables telemetry emission. Affects every registry
/// in the process.
pub fn set_enabled(enabled: bool) {
    TELEMETRY_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn enabled() -> bool {
    TELEMETRY_ENABLED.load(Ordering::Relaxed)
}

/// Snapshot describing one registered socket, emitted on connect and again
/// (with `disconnected_at` and final counters) on disconnect.
#[derive(Debug, Clone)]
pub struct SocketRecord {
    /// Name of the network system instance owning the socket.
    pub system: String,
    pub socket_id: u64,
    pub kind: SocketKind,
    pub direction: Direction,
    /// Native descriptor number; only meaningful for log correlation.
    pub raw_handle: i64,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    pub connected_at: SystemTime,
    pub disconnected_at: Option<SystemTime>,
    pub traffic: TrafficTotals,
}

/// Consumer of socket telemetry records.
pub trait TelemetrySink: Send + Sync {
    fn connected(&self, record: &SocketRecord);
    fn disconnected(&self, record: &SocketRecord);
}

/// Default sink: writes records through the `log` facade.
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn connected(&self, record: &SocketRecord) {
        log::info!(
            "[{}] socket {} connected: {} {} local={:?} remote={:?} (handle {})",
            record.system,
            record.socket_id,
            record.kind,
            record.direction,
            record.local,
            record.remote,
            record.raw_handle,
        );
    }

    fn disconnected(&self, record: &SocketRecord) {
        log::info!(
            "[{}] socket {} disconnected: stream {}b out / {}b in, datagram {}b out / {}b in",
            record.system,
            record.socket_id,
            record.traffic.stream_sent,
            record.traffic.stream_received,
            record.traffic.datagram_sent,
            record.traffic.datagram_received,
        );
    }
}
