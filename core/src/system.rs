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

//! Pluggable transport capability.
//!
//! [`NetSystem`] is the seam between connection logic and the actual
//! transport: the connector and the CLI only ever talk to this trait, so
//! tests substitute a scripted implementation and production code uses
//! [`OsNetSystem`], which forwards to the operating system's stack.

use futures::future::BoxFuture;
use futures::prelude::*;
use std::io;
use std::net::{IpAddr, SocketAddr};

use crate::socket::SocketHandle;

/// Capability to open sockets and resolve names.
pub trait NetSystem: Send + Sync {
    /// Name of the system, used in logs and telemetry records.
    fn name(&self) -> &str;

    /// Opens a stream connection to `addr`.
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'_, io::Result<SocketHandle>>;

    /// Binds a listening stream socket on `addr`.
    fn listen(&self, addr: SocketAddr, backlog: u32) -> BoxFuture<'_, io::Result<SocketHandle>>;

    /// Resolves `host` to its addresses, in the resolver's preference
    /// order. An empty list is a valid answer.
    fn query_address(&self, host: &str) -> BoxFuture<'_, io::Result<Vec<IpAddr>>>;
}

/// [`NetSystem`] backed by the host operating system.
pub struct OsNetSystem {
    name: String,
}

impl OsNetSystem {
    pub fn new() -> OsNetSystem {
        OsNetSystem {
            name: String::from("os"),
        }
    }

    pub fn with_name(name: impl Into<String>) -> OsNetSystem {
        OsNetSystem { name: name.into() }
    }
}

impl Default for OsNetSystem {
    fn default() -> OsNetSystem {
        OsNetSystem::new()
    }
}

impl NetSystem for OsNetSystem {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&self, addr: SocketAddr) -> BoxFuture<'_, io::Result<SocketHandle>> {
        async move {
            log::trace!("[{}] connecting to {}", self.name, addr);
            SocketHandle::connect_stream(addr).await
        }
        .boxed()
    }

    fn listen(&self, addr: SocketAddr, backlog: u32) -> BoxFuture<'_, io::Result<SocketHandle>> {
        async move {
            log::trace!("[{}] listening on {} (backlog {})", self.name, addr, backlog);
            SocketHandle::listen_on(addr, backlog)
        }
        .boxed()
    }

    fn query_address(&self, host: &str) -> BoxFuture<'_, io::Result<Vec<IpAddr>>> {
        let host = host.to_owned();
        async move {
            // Port 0 placeholder; only the addresses are of interest.
            let addrs = async_std::net::ToSocketAddrs::to_socket_addrs(&(host.as_str(), 0)).await?;
            Ok(addrs.map(|addr| addr.ip()).collect())
        }
        .boxed()
    }
}
