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

//! Async socket wrapper.
//!
//! A [`SocketHandle`] owns one native socket (stream, datagram, or
//! listener), caches its endpoints and option values, and can be closed
//! exactly once from any clone. Cached values are refreshed only at the
//! transition points (bind, connect, listen, accept), never polled on
//! access.
//!
//! Handles are cheaply clonable; all clones refer to the same native
//! socket. The registry and the accept queue observe a handle's lifetime
//! through [`SocketHandle::closed_signal`], a one-shot completion signal
//! that is delivered even if the close happened before the wait started.

use async_std::net::{TcpListener, TcpStream, UdpSocket};
use futures::channel::oneshot;
use futures::prelude::*;
use parking_lot::Mutex;
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::{fmt, io, mem};

use crate::registry::SocketId;

/// IP address family of a socket. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    /// Family of the given socket address.
    pub fn of(addr: &SocketAddr) -> AddressFamily {
        match addr {
            SocketAddr::V4(_) => AddressFamily::V4,
            SocketAddr::V6(_) => AddressFamily::V6,
        }
    }

    /// Whether `ip` belongs to this family.
    pub fn matches_ip(&self, ip: &IpAddr) -> bool {
        match (self, ip) {
            (AddressFamily::V4, IpAddr::V4(_)) => true,
            (AddressFamily::V6, IpAddr::V6(_)) => true,
            _ => false,
        }
    }

    fn domain(self) -> socket2::Domain {
        match self {
            AddressFamily::V4 => socket2::Domain::IPV4,
            AddressFamily::V6 => socket2::Domain::IPV6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "ipv4"),
            AddressFamily::V6 => write!(f, "ipv6"),
        }
    }
}

/// Transport kind of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
}

impl fmt::Display for SocketKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketKind::Stream => write!(f, "stream"),
            SocketKind::Datagram => write!(f, "datagram"),
        }
    }
}

/// Which side initiated the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Client,
    Server,
    Unknown,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Client => write!(f, "client"),
            Direction::Server => write!(f, "server"),
            Direction::Unknown => write!(f, "unknown"),
        }
    }
}

/// How many times a datagram operation retries a transient fault before the
/// error propagates.
const DATAGRAM_RETRY_LIMIT: u32 = 8;

/// Cumulative traffic counters of one socket, split by transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficTotals {
    pub stream_sent: u64,
    pub stream_received: u64,
    pub datagram_sent: u64,
    pub datagram_received: u64,
}

/// Handle to one native socket. See the module documentation.
#[derive(Clone)]
pub struct SocketHandle {
    shared: Arc<Shared>,
}

struct Shared {
    kind: SocketKind,
    family: AddressFamily,
    closed: AtomicBool,
    state: Mutex<State>,
    close_waiters: Mutex<Vec<oneshot::Sender<()>>>,
    id: Mutex<Option<SocketId>>,
    stream_sent: AtomicU64,
    stream_received: AtomicU64,
    datagram_sent: AtomicU64,
    datagram_received: AtomicU64,
}

struct State {
    io: Option<Io>,
    direction: Direction,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    no_delay: bool,
    linger_secs: Option<u32>,
    send_buffer: Option<usize>,
    receive_buffer: Option<usize>,
    /// Descriptor number, kept for logging only.
    raw_handle: i64,
}

enum Io {
    /// Freshly created native socket, not yet handed to the async runtime.
    Unbound(socket2::Socket),
    /// A stream connect is in flight; the state is updated when it settles.
    Connecting,
    Stream(TcpStream),
    Listener(Arc<TcpListener>),
    Datagram(Arc<UdpSocket>),
}

impl SocketHandle {
    /// Creates a handle around a fresh, unbound native socket.
    pub fn new(family: AddressFamily, kind: SocketKind) -> io::Result<SocketHandle> {
        let ty = match kind {
            SocketKind::Stream => socket2::Type::STREAM,
            SocketKind::Datagram => socket2::Type::DGRAM,
        };
        let socket = socket2::Socket::new(family.domain(), ty, None)?;
        Ok(SocketHandle::from_io(
            Io::Unbound(socket),
            kind,
            family,
            Direction::Unknown,
        ))
    }

    /// Creates a connected stream handle: `new` + [`SocketHandle::connect`].
    pub async fn connect_stream(addr: SocketAddr) -> io::Result<SocketHandle> {
        let handle = SocketHandle::new(AddressFamily::of(&addr), SocketKind::Stream)?;
        handle.connect(addr).await?;
        Ok(handle)
    }

    /// Creates a listening stream handle: `new` + bind + listen.
    pub fn listen_on(addr: SocketAddr, backlog: u32) -> io::Result<SocketHandle> {
        let handle = SocketHandle::new(AddressFamily::of(&addr), SocketKind::Stream)?;
        handle.bind(addr)?;
        handle.listen(backlog)?;
        Ok(handle)
    }

    /// Creates a bound datagram handle.
    pub fn bind_datagram(addr: SocketAddr) -> io::Result<SocketHandle> {
        let handle = SocketHandle::new(AddressFamily::of(&addr), SocketKind::Datagram)?;
        handle.bind(addr)?;
        Ok(handle)
    }

    fn from_io(io: Io, kind: SocketKind, family: AddressFamily, direction: Direction) -> SocketHandle {
        let mut state = State {
            io: Some(io),
            direction,
            local: None,
            remote: None,
            no_delay: false,
            linger_secs: None,
            send_buffer: None,
            receive_buffer: None,
            raw_handle: -1,
        };
        state.refresh();
        SocketHandle {
            shared: Arc::new(Shared {
                kind,
                family,
                closed: AtomicBool::new(false),
                state: Mutex::new(state),
                close_waiters: Mutex::new(Vec::new()),
                id: Mutex::new(None),
                stream_sent: AtomicU64::new(0),
                stream_received: AtomicU64::new(0),
                datagram_sent: AtomicU64::new(0),
                datagram_received: AtomicU64::new(0),
            }),
        }
    }

    /// Binds the socket to `addr`. Exclusive address use is requested
    /// before binding, so two gangway sockets never silently share a port.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        match state.io.as_ref() {
            Some(Io::Unbound(socket)) => {
                socket.set_reuse_address(false)?;
                socket.bind(&addr.into())?;
                socket.set_nonblocking(true)?;
            }
            Some(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "socket is already bound or connected",
                ))
            }
            None => return Err(closed_error()),
        }

        // Datagram sockets become usable right after binding; stream
        // sockets stay raw until listen().
        if self.shared.kind == SocketKind::Datagram {
            if let Some(Io::Unbound(socket)) = state.io.take() {
                let socket: std::net::UdpSocket = socket.into();
                state.io = Some(Io::Datagram(Arc::new(socket.into())));
            }
        }

        state.refresh();
        Ok(())
    }

    /// Starts listening for incoming stream connections.
    pub fn listen(&self, backlog: u32) -> io::Result<()> {
        if self.shared.kind != SocketKind::Stream {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "only stream sockets can listen",
            ));
        }

        let mut state = self.shared.state.lock();
        match state.io.as_ref() {
            Some(Io::Unbound(socket)) => {
                socket.listen(backlog as i32)?;
                socket.set_nonblocking(true)?;
            }
            Some(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "socket is already connected or listening",
                ))
            }
            None => return Err(closed_error()),
        }

        if let Some(Io::Unbound(socket)) = state.io.take() {
            let listener: std::net::TcpListener = socket.into();
            state.io = Some(Io::Listener(Arc::new(listener.into())));
        }
        state.direction = Direction::Server;
        state.refresh();
        Ok(())
    }

    /// Connects to `addr`. For stream sockets this establishes a TCP
    /// connection; for datagram sockets it sets the default peer.
    pub async fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        match self.shared.kind {
            SocketKind::Stream => self.connect_stream_inner(addr).await,
            SocketKind::Datagram => {
                let socket = self.datagram_socket()?;
                socket.connect(addr).await?;
                let mut state = self.shared.state.lock();
                state.direction = Direction::Client;
                state.refresh();
                Ok(())
            }
        }
    }

    async fn connect_stream_inner(&self, addr: SocketAddr) -> io::Result<()> {
        {
            let mut state = self.shared.state.lock();
            match state.io.as_ref() {
                Some(Io::Unbound(_)) => {
                    // The raw socket is replaced wholesale; a client stream
                    // is created by the async runtime.
                    state.io = Some(Io::Connecting);
                }
                Some(Io::Connecting) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WouldBlock,
                        "a connect is already in progress",
                    ))
                }
                Some(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        "socket is already connected",
                    ))
                }
                None => return Err(closed_error()),
            }
        }

        let result = TcpStream::connect(addr).await;

        let mut state = self.shared.state.lock();
        match result {
            Ok(stream) => {
                if self.shared.closed.load(Ordering::SeqCst) {
                    // Closed while connecting; the fresh stream is dropped.
                    state.io = None;
                    return Err(closed_error());
                }
                state.io = Some(Io::Stream(stream));
                state.direction = Direction::Client;
                state.refresh();
                Ok(())
            }
            Err(err) => {
                state.io = None;
                Err(err)
            }
        }
    }

    /// Accepts one incoming connection from a listening handle. The
    /// returned handle is already connected, direction `Server`.
    pub async fn accept(&self) -> io::Result<SocketHandle> {
        let listener = self.listener_socket()?;
        let (stream, _peer) = listener.accept().await?;
        let handle = SocketHandle::from_io(
            Io::Stream(stream),
            SocketKind::Stream,
            self.shared.family,
            Direction::Server,
        );
        log::debug!(
            "accepted connection from {:?} (handle {})",
            handle.remote_endpoint(),
            handle.raw_handle()
        );
        Ok(handle)
    }

    /// Sends bytes. Streams may transfer a prefix of `buf`; the number of
    /// bytes actually sent is returned.
    pub async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        match self.shared.kind {
            SocketKind::Stream => {
                let stream = self.stream_socket()?;
                let written = (&stream).write(buf).await?;
                self.shared
                    .stream_sent
                    .fetch_add(written as u64, Ordering::Relaxed);
                Ok(written)
            }
            SocketKind::Datagram => {
                let socket = self.datagram_socket()?;
                let mut attempts = 0;
                let sent = loop {
                    match socket.send(buf).await {
                        Ok(sent) => break sent,
                        Err(err) => attempts = next_datagram_attempt(attempts, err)?,
                    }
                };
                self.shared
                    .datagram_sent
                    .fetch_add(sent as u64, Ordering::Relaxed);
                Ok(sent)
            }
        }
    }

    /// Receives bytes into `buf`. Returns 0 on a cleanly closed stream.
    pub async fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.shared.kind {
            SocketKind::Stream => {
                let stream = self.stream_socket()?;
                let read = (&stream).read(buf).await?;
                self.shared
                    .stream_received
                    .fetch_add(read as u64, Ordering::Relaxed);
                Ok(read)
            }
            SocketKind::Datagram => {
                let socket = self.datagram_socket()?;
                let mut attempts = 0;
                let read = loop {
                    match socket.recv(buf).await {
                        Ok(read) => break read,
                        Err(err) => attempts = next_datagram_attempt(attempts, err)?,
                    }
                };
                self.shared
                    .datagram_received
                    .fetch_add(read as u64, Ordering::Relaxed);
                Ok(read)
            }
        }
    }

    /// Sends one datagram to `target`.
    pub async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let socket = self.datagram_socket()?;
        let mut attempts = 0;
        let sent = loop {
            match socket.send_to(buf, target).await {
                Ok(sent) => break sent,
                Err(err) => attempts = next_datagram_attempt(attempts, err)?,
            }
        };
        self.shared
            .datagram_sent
            .fetch_add(sent as u64, Ordering::Relaxed);
        Ok(sent)
    }

    /// Receives one datagram along with its source address.
    pub async fn receive_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let socket = self.datagram_socket()?;
        let mut attempts = 0;
        let (read, from) = loop {
            match socket.recv_from(buf).await {
                Ok(result) => break result,
                Err(err) => attempts = next_datagram_attempt(attempts, err)?,
            }
        };
        self.shared
            .datagram_received
            .fetch_add(read as u64, Ordering::Relaxed);
        Ok((read, from))
    }

    /// Closes the socket. The first call shuts the descriptor down (so any
    /// in-flight read or accept on a clone of it unblocks), releases it,
    /// and fires the close signal; every later call is a no-op.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let io = {
            let mut state = self.shared.state.lock();
            state.io.take()
        };
        // I/O paths operate on clones of the native socket, so merely
        // dropping our reference would leave an in-flight operation blocked
        // on a still-open descriptor.
        match &io {
            Some(Io::Stream(stream)) => {
                if let Err(err) = stream.shutdown(Shutdown::Both) {
                    log::debug!("stream shutdown at close failed: {}", err);
                }
            }
            Some(Io::Listener(listener)) => {
                let _ = socket2::SockRef::from(&**listener).shutdown(Shutdown::Both);
            }
            Some(Io::Datagram(socket)) => {
                let _ = socket2::SockRef::from(&**socket).shutdown(Shutdown::Both);
            }
            Some(Io::Unbound(_)) | Some(Io::Connecting) | None => {}
        }
        drop(io);

        let waiters = mem::replace(&mut *self.shared.close_waiters.lock(), Vec::new());
        for waiter in waiters {
            let _ = waiter.send(());
        }

        log::debug!(
            "closed {} socket (handle {})",
            self.shared.kind,
            self.raw_handle()
        );
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Future resolving once the handle has been closed. A close that
    /// happened before the call resolves the future immediately.
    pub fn closed_signal(&self) -> impl Future<Output = ()> {
        let receiver = {
            let mut waiters = self.shared.close_waiters.lock();
            if self.shared.closed.load(Ordering::SeqCst) {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Some(rx)
            }
        };

        async move {
            if let Some(rx) = receiver {
                let _ = rx.await;
            }
        }
    }

    /// Enables or disables Nagle's algorithm. The value is cached.
    pub fn set_no_delay(&self, no_delay: bool) -> io::Result<()> {
        self.with_sockref(|socket| socket.set_nodelay(no_delay))?;
        self.shared.state.lock().no_delay = no_delay;
        Ok(())
    }

    pub fn no_delay(&self) -> bool {
        self.shared.state.lock().no_delay
    }

    /// Sets SO_LINGER, in whole seconds. `None` disables lingering.
    pub fn set_linger(&self, seconds: Option<u32>) -> io::Result<()> {
        self.with_sockref(|socket| {
            socket.set_linger(seconds.map(|s| Duration::from_secs(u64::from(s))))
        })?;
        self.shared.state.lock().linger_secs = seconds;
        Ok(())
    }

    pub fn linger(&self) -> Option<u32> {
        self.shared.state.lock().linger_secs
    }

    pub fn set_send_buffer_size(&self, bytes: usize) -> io::Result<()> {
        self.with_sockref(|socket| socket.set_send_buffer_size(bytes))?;
        self.shared.state.lock().send_buffer = Some(bytes);
        Ok(())
    }

    pub fn send_buffer_size(&self) -> Option<usize> {
        self.shared.state.lock().send_buffer
    }

    pub fn set_receive_buffer_size(&self, bytes: usize) -> io::Result<()> {
        self.with_sockref(|socket| socket.set_recv_buffer_size(bytes))?;
        self.shared.state.lock().receive_buffer = Some(bytes);
        Ok(())
    }

    pub fn receive_buffer_size(&self) -> Option<usize> {
        self.shared.state.lock().receive_buffer
    }

    pub fn kind(&self) -> SocketKind {
        self.shared.kind
    }

    pub fn family(&self) -> AddressFamily {
        self.shared.family
    }

    pub fn direction(&self) -> Direction {
        self.shared.state.lock().direction
    }

    /// Cached local endpoint; refreshed at bind/connect/listen/accept.
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.shared.state.lock().local
    }

    /// Cached remote endpoint; refreshed at connect/accept.
    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.shared.state.lock().remote
    }

    /// Native descriptor number, for logging only. -1 once closed.
    pub fn raw_handle(&self) -> i64 {
        let state = self.shared.state.lock();
        if state.io.is_some() {
            state.raw_handle
        } else {
            -1
        }
    }

    /// Cumulative byte counters.
    pub fn traffic(&self) -> TrafficTotals {
        TrafficTotals {
            stream_sent: self.shared.stream_sent.load(Ordering::Relaxed),
            stream_received: self.shared.stream_received.load(Ordering::Relaxed),
            datagram_sent: self.shared.datagram_sent.load(Ordering::Relaxed),
            datagram_received: self.shared.datagram_received.load(Ordering::Relaxed),
        }
    }

    /// Id assigned by the registry this handle is registered in, if any.
    pub fn id(&self) -> Option<SocketId> {
        *self.shared.id.lock()
    }

    pub(crate) fn set_id(&self, id: Option<SocketId>) {
        *self.shared.id.lock() = id;
    }

    /// Whether two handles refer to the same native socket.
    pub fn same_socket(&self, other: &SocketHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn stream_socket(&self) -> io::Result<TcpStream> {
        let state = self.shared.state.lock();
        match state.io.as_ref() {
            Some(Io::Stream(stream)) => Ok(stream.clone()),
            Some(_) => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "stream socket is not connected",
            )),
            None => Err(closed_error()),
        }
    }

    fn listener_socket(&self) -> io::Result<Arc<TcpListener>> {
        let state = self.shared.state.lock();
        match state.io.as_ref() {
            Some(Io::Listener(listener)) => Ok(listener.clone()),
            Some(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "socket is not listening",
            )),
            None => Err(closed_error()),
        }
    }

    fn datagram_socket(&self) -> io::Result<Arc<UdpSocket>> {
        let mut state = self.shared.state.lock();
        if let Some(Io::Unbound(socket)) = state.io.as_ref() {
            // A datagram socket used before bind is converted in place; the
            // OS assigns an ephemeral port on first send.
            socket.set_nonblocking(true)?;
            if let Some(Io::Unbound(socket)) = state.io.take() {
                let socket: std::net::UdpSocket = socket.into();
                state.io = Some(Io::Datagram(Arc::new(socket.into())));
                state.refresh();
            }
        }
        match state.io.as_ref() {
            Some(Io::Datagram(socket)) => Ok(socket.clone()),
            Some(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a datagram socket",
            )),
            None => Err(closed_error()),
        }
    }

    fn with_sockref<R>(&self, f: impl FnOnce(&socket2::Socket) -> io::Result<R>) -> io::Result<R> {
        let state = self.shared.state.lock();
        match state.io.as_ref() {
            Some(Io::Unbound(socket)) => f(socket),
            Some(Io::Stream(stream)) => {
                let r = socket2::SockRef::from(stream);
                f(&*r)
            }
            Some(Io::Listener(listener)) => {
                let r = socket2::SockRef::from(&**listener);
                f(&*r)
            }
            Some(Io::Datagram(socket)) => {
                let r = socket2::SockRef::from(&**socket);
                f(&*r)
            }
            Some(Io::Connecting) => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "a connect is in progress",
            )),
            None => Err(closed_error()),
        }
    }
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SocketHandle")
            .field("kind", &self.shared.kind)
            .field("family", &self.shared.family)
            .field("raw", &self.raw_handle())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl State {
    /// Re-reads endpoints and descriptor number from the native socket.
    /// Called at the transition points only.
    fn refresh(&mut self) {
        let (local, remote, raw) = match self.io.as_ref() {
            Some(Io::Unbound(socket)) => (
                socket.local_addr().ok().and_then(|a| a.as_socket()),
                None,
                raw_handle_of(socket),
            ),
            Some(Io::Stream(stream)) => (
                stream.local_addr().ok(),
                stream.peer_addr().ok(),
                raw_handle_of(stream),
            ),
            Some(Io::Listener(listener)) => (
                listener.local_addr().ok(),
                None,
                raw_handle_of(&**listener),
            ),
            Some(Io::Datagram(socket)) => (
                socket.local_addr().ok(),
                socket.peer_addr().ok(),
                raw_handle_of(&**socket),
            ),
            Some(Io::Connecting) | None => return,
        };
        self.local = local;
        self.remote = remote;
        self.raw_handle = raw;
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket handle is closed")
}

/// Transient datagram faults are retried a bounded number of times; see the
/// module documentation. Everything else is a disconnection.
fn transient_datagram_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Advances the retry counter of a datagram operation after `err`, or
/// decides that the error propagates. A non-transient fault with nothing
/// transferred counts as a disconnection of the datagram socket.
fn next_datagram_attempt(attempts: u32, err: io::Error) -> io::Result<u32> {
    if !transient_datagram_error(&err) {
        return Err(io::Error::new(io::ErrorKind::ConnectionAborted, err));
    }
    if attempts + 1 >= DATAGRAM_RETRY_LIMIT {
        log::debug!("datagram retry limit hit: {}", err);
        return Err(err);
    }
    Ok(attempts + 1)
}

#[cfg(unix)]
fn raw_handle_of(socket: &impl std::os::unix::io::AsRawFd) -> i64 {
    i64::from(socket.as_raw_fd())
}

#[cfg(windows)]
fn raw_handle_of(socket: &impl std::os::windows::io::AsRawSocket) -> i64 {
    socket.as_raw_socket() as i64
}

#[cfg(test)]
mod tests {
    use super::{AddressFamily, Direction, SocketHandle, SocketKind};
    use futures::executor::block_on;
    use futures::prelude::*;

    fn loopback() -> std::net::SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn close_is_idempotent() {
        let handle = SocketHandle::bind_datagram(loopback()).unwrap();
        assert!(!handle.is_closed());
        handle.close();
        assert!(handle.is_closed());
        handle.close();
        assert!(handle.is_closed());
        assert_eq!(handle.raw_handle(), -1);
    }

    #[test]
    fn close_signal_observed_before_and_after() {
        let handle = SocketHandle::bind_datagram(loopback()).unwrap();

        let mut early = Box::pin(handle.closed_signal());
        assert!(early.as_mut().now_or_never().is_none());

        handle.close();
        assert!(early.as_mut().now_or_never().is_some());

        // A wait started after the close must still resolve.
        assert!(handle.closed_signal().now_or_never().is_some());
    }

    #[test]
    fn stream_roundtrip() {
        block_on(async {
            let listener = SocketHandle::listen_on(loopback(), 16).unwrap();
            let addr = listener.local_endpoint().unwrap();
            assert_eq!(listener.direction(), Direction::Server);

            let client = SocketHandle::connect_stream(addr).await.unwrap();
            let server = listener.accept().await.unwrap();
            assert_eq!(client.direction(), Direction::Client);
            assert_eq!(server.direction(), Direction::Server);
            assert_eq!(client.remote_endpoint(), Some(addr));

            assert_eq!(client.send(b"ping").await.unwrap(), 4);
            let mut buf = [0u8; 16];
            let read = server.receive(&mut buf).await.unwrap();
            assert_eq!(&buf[..read], b"ping");

            assert_eq!(client.traffic().stream_sent, 4);
            assert_eq!(server.traffic().stream_received, 4);

            client.close();
            server.close();
            listener.close();
        });
    }

    #[test]
    fn datagram_roundtrip() {
        block_on(async {
            let a = SocketHandle::bind_datagram(loopback()).unwrap();
            let b = SocketHandle::bind_datagram(loopback()).unwrap();
            let b_addr = b.local_endpoint().unwrap();

            assert_eq!(a.send_to(b"datagram", b_addr).await.unwrap(), 8);
            let mut buf = [0u8; 32];
            let (read, from) = b.receive_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..read], b"datagram");
            assert_eq!(from, a.local_endpoint().unwrap());

            assert_eq!(a.traffic().datagram_sent, 8);
            assert_eq!(b.traffic().datagram_received, 8);
        });
    }

    #[test]
    fn exclusive_bind() {
        let first = SocketHandle::bind_datagram(loopback()).unwrap();
        let taken = first.local_endpoint().unwrap();
        let second = SocketHandle::new(AddressFamily::V4, SocketKind::Datagram).unwrap();
        assert!(second.bind(taken).is_err());
    }

    #[test]
    fn option_caching() {
        block_on(async {
            let listener = SocketHandle::listen_on(loopback(), 4).unwrap();
            let client = SocketHandle::connect_stream(listener.local_endpoint().unwrap())
                .await
                .unwrap();

            assert!(!client.no_delay());
            client.set_no_delay(true).unwrap();
            assert!(client.no_delay());

            client.set_linger(Some(3)).unwrap();
            assert_eq!(client.linger(), Some(3));

            client.set_send_buffer_size(65536).unwrap();
            assert_eq!(client.send_buffer_size(), Some(65536));
            client.set_receive_buffer_size(65536).unwrap();
            assert_eq!(client.receive_buffer_size(), Some(65536));
        });
    }

    #[test]
    fn datagram_retry_bounded_then_propagates() {
        use super::{next_datagram_attempt, DATAGRAM_RETRY_LIMIT};
        use std::io;

        let mut attempts = 0;
        for _ in 0..DATAGRAM_RETRY_LIMIT - 1 {
            attempts =
                next_datagram_attempt(attempts, io::ErrorKind::Interrupted.into()).unwrap();
        }
        // The next transient fault exhausts the budget and surfaces as-is.
        let exhausted = next_datagram_attempt(attempts, io::ErrorKind::Interrupted.into());
        assert_eq!(exhausted.unwrap_err().kind(), io::ErrorKind::Interrupted);

        // Non-transient faults are never retried; they are reported as a
        // disconnection.
        let fatal = next_datagram_attempt(0, io::ErrorKind::PermissionDenied.into());
        assert_eq!(fatal.unwrap_err().kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn close_unblocks_inflight_read() {
        use std::time::Duration;

        block_on(async {
            let listener = SocketHandle::listen_on(loopback(), 4).unwrap();
            let client = SocketHandle::connect_stream(listener.local_endpoint().unwrap())
                .await
                .unwrap();
            let server = listener.accept().await.unwrap();

            let reader = server.clone();
            let mut pending = Box::pin(async move {
                let mut buf = [0u8; 16];
                reader.receive(&mut buf).await
            });
            assert!((&mut pending).now_or_never().is_none());

            // Closing from another clone must wake the blocked read.
            server.close();
            let outcome = async_std::future::timeout(Duration::from_secs(5), pending)
                .await
                .expect("read still blocked after close");
            match outcome {
                Ok(read) => assert_eq!(read, 0),
                Err(_) => {}
            }
            client.close();
            listener.close();
        });
    }

    #[test]
    fn io_on_closed_handle_fails() {
        block_on(async {
            let handle = SocketHandle::bind_datagram(loopback()).unwrap();
            handle.close();
            let mut buf = [0u8; 8];
            assert!(handle.receive(&mut buf).await.is_err());
            assert!(handle.send(b"x").await.is_err());
        });
    }
}
