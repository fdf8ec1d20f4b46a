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

//! Registry of open sockets.
//!
//! One [`SocketRegistry`] tracks the sockets of one logical network system
//! instance. Ids are monotonically increasing and assigned under the
//! registry's single mutex; the same mutex orders telemetry emission
//! before table visibility, so a socket is never observable in
//! [`SocketRegistry::list`] before its "connected" record went out, and is
//! never reported connected after it was reported disconnected.
//!
//! The registry is the sole owner of the id → entry mapping; a socket only
//! carries its assigned id (no back-reference).

use fnv::FnvBuildHasher;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use std::{fmt, mem};

use crate::socket::{Direction, SocketHandle, SocketKind};
use crate::telemetry::{self, SocketRecord, TelemetrySink};

/// Identifier of a socket within one registry. Unique per registry
/// instance, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl From<u64> for SocketId {
    fn from(value: u64) -> SocketId {
        SocketId(value)
    }
}

impl From<SocketId> for u64 {
    fn from(id: SocketId) -> u64 {
        id.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The registry has begun teardown; new sockets are rejected.
    #[error("registry is shutting down")]
    ShuttingDown,
}

/// Point-in-time view of one registry entry.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub id: SocketId,
    pub kind: SocketKind,
    pub direction: Direction,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    pub connected_at: SystemTime,
    pub raw_handle: i64,
}

/// Table of currently open sockets for one network system instance.
pub struct SocketRegistry {
    name: String,
    sink: Arc<dyn TelemetrySink>,
    inner: Mutex<Inner>,
}

struct Inner {
    next_id: u64,
    entries: HashMap<u64, Entry, FnvBuildHasher>,
    shutdown: bool,
}

struct Entry {
    handle: SocketHandle,
    connected_at: SystemTime,
}

impl SocketRegistry {
    /// Creates an empty registry named `name` (the network-system name in
    /// telemetry records), emitting to `sink`.
    pub fn new(name: impl Into<String>, sink: Arc<dyn TelemetrySink>) -> SocketRegistry {
        SocketRegistry {
            name: name.into(),
            sink,
            inner: Mutex::new(Inner {
                next_id: 1,
                entries: HashMap::default(),
                shutdown: false,
            }),
        }
    }

    /// Registers `handle`, assigns it the next id, and emits a "connected"
    /// record. The record goes out before the entry becomes visible in
    /// [`SocketRegistry::list`].
    pub fn register(&self, handle: &SocketHandle) -> Result<SocketId, RegistryError> {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            return Err(RegistryError::ShuttingDown);
        }

        let id = SocketId(inner.next_id);
        inner.next_id += 1;
        let connected_at = SystemTime::now();

        if telemetry::enabled() {
            let record = self.record_for(id, handle, connected_at, None);
            self.sink.connected(&record);
        }

        handle.set_id(Some(id));
        inner.entries.insert(
            id.0,
            Entry {
                handle: handle.clone(),
                connected_at,
            },
        );
        Ok(id)
    }

    /// Removes the entry for `id`, emitting its "disconnected" record
    /// first. Returns false when the entry was already gone (benign:
    /// another path removed it concurrently).
    pub fn unregister(&self, id: SocketId) -> bool {
        let mut inner = self.inner.lock();
        let entry = match inner.entries.get(&id.0) {
            Some(entry) => entry,
            None => return false,
        };

        if telemetry::enabled() {
            let record = self.record_for(
                id,
                &entry.handle,
                entry.connected_at,
                Some(SystemTime::now()),
            );
            self.sink.disconnected(&record);
        }

        let entry = inner.entries.remove(&id.0);
        if let Some(entry) = entry {
            entry.handle.set_id(None);
        }
        true
    }

    /// Snapshots of every live entry, in id order.
    pub fn list(&self) -> Vec<EntrySnapshot> {
        let inner = self.inner.lock();
        let mut snapshots: Vec<EntrySnapshot> = inner
            .entries
            .iter()
            .map(|(id, entry)| EntrySnapshot {
                id: SocketId(*id),
                kind: entry.handle.kind(),
                direction: entry.handle.direction(),
                local: entry.handle.local_endpoint(),
                remote: entry.handle.remote_endpoint(),
                connected_at: entry.connected_at,
                raw_handle: entry.handle.raw_handle(),
            })
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.id);
        snapshots
    }

    pub fn count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tears the registry down: every still-open handle is closed
    /// (best-effort) and the table is cleared. Registrations arriving
    /// after this call are rejected.
    pub fn shutdown(&self) {
        let entries = {
            let mut inner = self.inner.lock();
            inner.shutdown = true;
            mem::replace(&mut inner.entries, HashMap::default())
        };

        for (id, entry) in entries {
            if telemetry::enabled() {
                let record = self.record_for(
                    SocketId(id),
                    &entry.handle,
                    entry.connected_at,
                    Some(SystemTime::now()),
                );
                self.sink.disconnected(&record);
            }
            entry.handle.set_id(None);
            if !entry.handle.is_closed() {
                log::debug!("[{}] closing socket {} at registry teardown", self.name, id);
                entry.handle.close();
            }
        }
    }

    fn record_for(
        &self,
        id: SocketId,
        handle: &SocketHandle,
        connected_at: SystemTime,
        disconnected_at: Option<SystemTime>,
    ) -> SocketRecord {
        SocketRecord {
            system: self.name.clone(),
            socket_id: id.0,
            kind: handle.kind(),
            direction: handle.direction(),
            raw_handle: handle.raw_handle(),
            local: handle.local_endpoint(),
            remote: handle.remote_endpoint(),
            connected_at,
            disconnected_at,
            traffic: handle.traffic(),
        }
    }
}

impl fmt::Debug for SocketRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SocketRegistry")
            .field("name", &self.name)
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{SocketId, SocketRegistry};
    use crate::socket::SocketHandle;
    use crate::telemetry::{self, SocketRecord, TelemetrySink};
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Tests that toggle or depend on the global telemetry flag hold this
    /// lock so they don't interleave.
    static TELEMETRY_FLAG: Mutex<()> = parking_lot::const_mutex(());

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(&'static str, u64)>>,
    }

    impl TelemetrySink for RecordingSink {
        fn connected(&self, record: &SocketRecord) {
            self.events.lock().push(("connect", record.socket_id));
        }

        fn disconnected(&self, record: &SocketRecord) {
            self.events.lock().push(("disconnect", record.socket_id));
        }
    }

    fn datagram() -> SocketHandle {
        SocketHandle::bind_datagram("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[test]
    fn ids_monotonic_and_unique() {
        let registry = SocketRegistry::new("test", Arc::new(RecordingSink::default()));
        let a = registry.register(&datagram()).unwrap();
        let b = registry.register(&datagram()).unwrap();
        let c = registry.register(&datagram()).unwrap();
        assert!(a < b && b < c);
        assert_eq!(registry.count(), 3);

        let listed: Vec<SocketId> = registry.list().iter().map(|s| s.id).collect();
        assert_eq!(listed, vec![a, b, c]);
    }

    #[test]
    fn handle_carries_its_id() {
        let registry = SocketRegistry::new("test", Arc::new(RecordingSink::default()));
        let handle = datagram();
        assert_eq!(handle.id(), None);
        let id = registry.register(&handle).unwrap();
        assert_eq!(handle.id(), Some(id));
        registry.unregister(id);
        assert_eq!(handle.id(), None);
    }

    #[test]
    fn telemetry_order_and_global_disable() {
        let _guard = TELEMETRY_FLAG.lock();
        let sink = Arc::new(RecordingSink::default());
        let registry = SocketRegistry::new("test", sink.clone());

        let handle = datagram();
        let id = registry.register(&handle).unwrap();
        registry.unregister(id);
        {
            let events = sink.events.lock();
            assert_eq!(&*events, &[("connect", u64::from(id)), ("disconnect", u64::from(id))]);
        }

        telemetry::set_enabled(false);
        let silent = registry.register(&datagram()).unwrap();
        registry.unregister(silent);
        telemetry::set_enabled(true);
        assert_eq!(sink.events.lock().len(), 2);
    }

    #[test]
    fn unregister_twice_is_benign() {
        let registry = SocketRegistry::new("test", Arc::new(RecordingSink::default()));
        let id = registry.register(&datagram()).unwrap();
        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
    }

    #[test]
    fn shutdown_closes_and_rejects() {
        let registry = SocketRegistry::new("test", Arc::new(RecordingSink::default()));
        let handle = datagram();
        registry.register(&handle).unwrap();

        registry.shutdown();
        assert!(handle.is_closed());
        assert_eq!(registry.count(), 0);
        assert!(registry.register(&datagram()).is_err());
    }
}
