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

//! Connection establishment and session tracking.
//!
//! This crate holds the socket-level core of gangway: the async socket
//! wrapper ([`socket::SocketHandle`]), the per-instance socket registry with
//! its telemetry records ([`registry::SocketRegistry`]), the pluggable
//! transport capability ([`system::NetSystem`]), the happy-eyeballs-style
//! speculative connector ([`connector::SpeculativeConnector`]), and the
//! bounded accept queue ([`accept_queue::AcceptQueue`]) that decouples
//! low-level accept events from application accept loops.
//!
//! Everything is asynchronous at the I/O boundary and composes over any
//! executor; nothing here requires a dedicated thread. Multiple registries,
//! connectors, and queues can run concurrently and independently; locks are
//! always per-instance.

pub mod accept_queue;
pub mod connector;
pub mod registry;
pub mod socket;
pub mod system;
pub mod telemetry;

pub use accept_queue::{AcceptError, AcceptQueue};
pub use connector::{AttemptError, ConnectAttempt, ConnectorError, SpeculativeConnector, Target};
pub use registry::{RegistryError, SocketId, SocketRegistry};
pub use socket::{AddressFamily, Direction, SocketHandle, SocketKind};
pub use system::{NetSystem, OsNetSystem};
pub use telemetry::{SocketRecord, TelemetrySink};
