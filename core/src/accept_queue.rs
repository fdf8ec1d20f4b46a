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

//! Bounded hand-off queue between a low-level accept loop and application
//! accept calls.
//!
//! The producer side pushes freshly-accepted sockets with
//! [`AcceptQueue::inject`]; the consumer side pulls them with
//! [`AcceptQueue::accept`]. The queue is strictly FIFO and bounded: when
//! `backlog` sockets are already waiting, `inject` reports refusal and the
//! producer is expected to close the socket. Sockets that were closed while
//! queued are discarded transparently on the consumer side.

use futures::channel::oneshot;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::socket::SocketHandle;

/// Backlog used by [`AcceptQueue::new`].
pub const DEFAULT_BACKLOG: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    /// The queue was canceled; no further socket will ever be produced.
    #[error("accept queue has been canceled")]
    Canceled,
}

/// Bounded FIFO of accepted sockets awaiting pick-up.
///
/// Clones share the same queue. Any number of producers and consumers may
/// operate concurrently; each queued socket is delivered to exactly one
/// consumer.
#[derive(Clone)]
pub struct AcceptQueue {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    backlog: usize,
    entries: VecDeque<SocketHandle>,
    /// Consumers parked in `accept`, oldest first. A waiter is woken for
    /// every inject and for cancellation; spurious wakes re-park.
    waiters: VecDeque<oneshot::Sender<()>>,
    canceled: bool,
}

impl AcceptQueue {
    pub fn new() -> AcceptQueue {
        AcceptQueue::with_backlog(DEFAULT_BACKLOG)
    }

    pub fn with_backlog(backlog: usize) -> AcceptQueue {
        debug_assert!(backlog >= 1);
        AcceptQueue {
            inner: Arc::new(Mutex::new(Inner {
                backlog: backlog.max(1),
                entries: VecDeque::new(),
                waiters: VecDeque::new(),
                canceled: false,
            })),
        }
    }

    /// Attempts to enqueue `handle`. Returns false when the queue is full
    /// or canceled; the caller then owns the rejection (normally: close the
    /// socket and log).
    pub fn inject(&self, handle: SocketHandle) -> bool {
        let mut inner = self.inner.lock();
        if inner.canceled || inner.entries.len() >= inner.backlog {
            return false;
        }
        inner.entries.push_back(handle);
        // Wake one live consumer; waiters whose accept future was dropped
        // in the meantime are skipped, not counted.
        while let Some(waiter) = inner.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                break;
            }
        }
        true
    }

    /// Enqueues `handle` and waits until that socket is closed (normally by
    /// the session that consumed it). Returns false immediately, enqueuing
    /// nothing, when the queue is full or canceled.
    ///
    /// This is the natural shape for a producer loop: the loop's own
    /// lifetime then matches the lifetimes of the sockets it handed off.
    pub async fn inject_and_wait(&self, handle: SocketHandle) -> bool {
        let closed = handle.closed_signal();
        if !self.inject(handle) {
            return false;
        }
        closed.await;
        true
    }

    /// Waits for the next queued socket. Entries found already closed are
    /// skipped. Dropping the returned future before completion consumes
    /// nothing.
    pub async fn accept(&self) -> Result<SocketHandle, AcceptError> {
        loop {
            enum Next {
                Ready(SocketHandle),
                Canceled,
                Park(oneshot::Receiver<()>),
            }

            let next = {
                let mut inner = self.inner.lock();
                loop {
                    match inner.entries.pop_front() {
                        Some(handle) if handle.is_closed() => {
                            log::debug!("discarding socket closed while queued for accept");
                            continue;
                        }
                        Some(handle) => break Next::Ready(handle),
                        None if inner.canceled => break Next::Canceled,
                        None => {
                            let (tx, rx) = oneshot::channel();
                            inner.waiters.push_back(tx);
                            break Next::Park(rx);
                        }
                    }
                }
            };

            match next {
                Next::Ready(handle) => return Ok(handle),
                Next::Canceled => return Err(AcceptError::Canceled),
                // A dropped sender also wakes us; loop to re-examine.
                Next::Park(rx) => {
                    let mut guard = ParkGuard {
                        inner: self.inner.clone(),
                        rx: Some(rx),
                    };
                    if let Some(rx) = guard.rx.as_mut() {
                        let _ = rx.await;
                    }
                    // From here to the dequeue above there is no suspension
                    // point, so the wake-up cannot be lost anymore.
                    guard.rx = None;
                }
            }
        }
    }

    /// Cancels the queue: pending and future `accept` calls return
    /// [`AcceptError::Canceled`], later injects are refused, and every
    /// still-queued socket is closed.
    pub fn cancel(&self) {
        let (entries, waiters) = {
            let mut inner = self.inner.lock();
            inner.canceled = true;
            (
                std::mem::take(&mut inner.entries),
                std::mem::take(&mut inner.waiters),
            )
        };
        for handle in entries {
            handle.close();
        }
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }

    /// Number of sockets currently queued, closed-but-undiscarded included.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.lock().canceled
    }
}

impl Default for AcceptQueue {
    fn default() -> AcceptQueue {
        AcceptQueue::new()
    }
}

/// Keeps a parked consumer's wake-up transferable: if the `accept` future
/// is dropped after its one-shot fired but before it could act on it, the
/// undelivered wake-up is passed to the next live waiter instead of being
/// swallowed with the future.
struct ParkGuard {
    inner: Arc<Mutex<Inner>>,
    rx: Option<oneshot::Receiver<()>>,
}

impl Drop for ParkGuard {
    fn drop(&mut self) {
        let mut rx = match self.rx.take() {
            Some(rx) => rx,
            None => return,
        };
        if let Ok(Some(())) = rx.try_recv() {
            let mut inner = self.inner.lock();
            while let Some(waiter) = inner.waiters.pop_front() {
                if waiter.send(()).is_ok() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{AcceptError, AcceptQueue};
    use crate::socket::SocketHandle;
    use futures::executor::block_on;
    use futures::future::FutureExt as _;

    fn socket() -> SocketHandle {
        SocketHandle::bind_datagram("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[test]
    fn backlog_enforced_exactly() {
        let queue = AcceptQueue::with_backlog(2);
        assert!(queue.inject(socket()));
        assert!(queue.inject(socket()));
        assert!(!queue.inject(socket()));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn fifo_order() {
        block_on(async {
            let queue = AcceptQueue::with_backlog(8);
            let a = socket();
            let b = socket();
            let c = socket();
            let a_addr = a.local_endpoint();
            let b_addr = b.local_endpoint();
            let c_addr = c.local_endpoint();
            assert!(queue.inject(a));
            assert!(queue.inject(b));
            assert!(queue.inject(c));

            assert_eq!(queue.accept().await.unwrap().local_endpoint(), a_addr);
            assert_eq!(queue.accept().await.unwrap().local_endpoint(), b_addr);
            assert_eq!(queue.accept().await.unwrap().local_endpoint(), c_addr);
        });
    }

    #[test]
    fn accept_waits_for_inject() {
        block_on(async {
            let queue = AcceptQueue::with_backlog(4);
            let mut accept = Box::pin(queue.accept());
            assert!((&mut accept).now_or_never().is_none());

            assert!(queue.inject(socket()));
            assert!(accept.now_or_never().unwrap().is_ok());
        });
    }

    #[test]
    fn closed_entries_skipped() {
        block_on(async {
            let queue = AcceptQueue::with_backlog(4);
            let dead = socket();
            dead.close();
            let alive = socket();
            let alive_addr = alive.local_endpoint();
            assert!(queue.inject(dead));
            assert!(queue.inject(alive));

            let got = queue.accept().await.unwrap();
            assert_eq!(got.local_endpoint(), alive_addr);
            assert!(queue.is_empty());
        });
    }

    #[test]
    fn cancel_wakes_and_closes() {
        block_on(async {
            let queue = AcceptQueue::with_backlog(4);
            let queued = socket();
            let queued_clone = queued.clone();
            assert!(queue.inject(queued));

            let mut parked = Box::pin({
                let queue = queue.clone();
                async move {
                    // Drain the queued entry, then park.
                    let first = queue.accept().await;
                    let second = queue.accept().await;
                    (first, second)
                }
            });
            assert!((&mut parked).now_or_never().is_none());

            queue.cancel();
            let (first, second) = parked.now_or_never().unwrap();
            assert!(first.is_ok());
            assert!(matches!(second, Err(AcceptError::Canceled)));
            // The entry delivered before cancellation stays usable...
            assert!(!first.unwrap().is_closed());
            // ...but a socket still queued at cancellation would be closed.
            drop(queued_clone);

            assert!(!queue.inject(socket()));
            assert!(matches!(queue.accept().await, Err(AcceptError::Canceled)));
        });
    }

    #[test]
    fn inject_and_wait_tracks_socket_lifetime() {
        block_on(async {
            let queue = AcceptQueue::with_backlog(2);
            let handle = socket();
            let mut producer = Box::pin(queue.inject_and_wait(handle.clone()));
            // Queued but the socket is still open: the producer stays parked.
            assert!((&mut producer).now_or_never().is_none());
            assert_eq!(queue.len(), 1);

            let consumed = queue.accept().await.unwrap();
            assert!((&mut producer).now_or_never().is_none());

            consumed.close();
            assert_eq!(producer.now_or_never(), Some(true));

            // Full queue: refusal is immediate and enqueues nothing.
            assert!(queue.inject(socket()));
            assert!(queue.inject(socket()));
            assert_eq!(
                Box::pin(queue.inject_and_wait(socket())).now_or_never(),
                Some(false)
            );
            assert_eq!(queue.len(), 2);
        });
    }

    #[test]
    fn wake_passed_on_when_woken_accept_dropped() {
        block_on(async {
            let queue = AcceptQueue::with_backlog(4);
            let mut first = Box::pin(queue.accept());
            assert!((&mut first).now_or_never().is_none());
            let mut second = Box::pin(queue.accept());
            assert!((&mut second).now_or_never().is_none());

            // The inject wakes the first consumer; dropping it before it
            // re-polls must hand the wake-up to the second one.
            assert!(queue.inject(socket()));
            drop(first);
            assert!((&mut second).now_or_never().unwrap().is_ok());
            assert!(queue.is_empty());
        });
    }

    #[test]
    fn dropped_accept_consumes_nothing() {
        block_on(async {
            let queue = AcceptQueue::with_backlog(4);
            {
                let mut abandoned = Box::pin(queue.accept());
                assert!((&mut abandoned).now_or_never().is_none());
            }
            assert!(queue.inject(socket()));
            // The abandoned waiter must not swallow the wake-up.
            let got = Box::pin(queue.accept()).now_or_never();
            assert!(got.unwrap().is_ok());
        });
    }
}
