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

//! Speculative multi-attempt connector.
//!
//! Races several connection attempts (typically one per address family,
//! happy-eyeballs style) and keeps the first that succeeds. Losers that
//! also managed to connect are closed before the call returns, so at most
//! one non-closed socket ever escapes.
//!
//! When every attempt fails, the reported error is the most meaningful
//! one: an attempt that failed because the target simply has no address of
//! the requested family ranks below any other failure, so "this family
//! doesn't exist" never masks a genuine connectivity problem.

use futures::channel::oneshot;
use futures::future::{self, Either, FutureExt as _, Shared};
use futures::prelude::*;
use futures::stream::FuturesUnordered;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use std::{fmt, io, mem};

use crate::socket::{AddressFamily, SocketHandle};
use crate::system::NetSystem;

/// Destination of one connection attempt.
#[derive(Debug, Clone)]
pub enum Target {
    /// Host name, resolved through the attempt's network system.
    Host(String),
    /// Literal address; no resolution.
    Ip(IpAddr),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Target::Host(host) => write!(f, "{}", host),
            Target::Ip(ip) => write!(f, "{}", ip),
        }
    }
}

/// One connection attempt in the race. Attempts are transient: a fresh set
/// is built for every connect call.
pub struct ConnectAttempt {
    pub system: Arc<dyn NetSystem>,
    pub target: Target,
    pub port: u16,
    /// Address family this attempt is restricted to.
    pub family: AddressFamily,
    /// Per-attempt connect timeout.
    pub timeout: Option<Duration>,
    /// Extra window granted after another attempt wins, letting this one
    /// finish instead of being abandoned outright. Zero means none.
    pub grace_period: Duration,
}

impl ConnectAttempt {
    pub fn new(
        system: Arc<dyn NetSystem>,
        target: Target,
        port: u16,
        family: AddressFamily,
    ) -> ConnectAttempt {
        ConnectAttempt {
            system,
            target,
            port,
            family,
            timeout: None,
            grace_period: Duration::from_secs(0),
        }
    }
}

/// Failure of a single attempt.
#[derive(Debug, thiserror::Error)]
#[error("connection attempt to {target} failed")]
pub struct AttemptError {
    /// `host:port` or `ip:port` of the attempt, for messages.
    pub target: String,
    /// True when the failure is "the target has no address of the
    /// requested family". Used for weighting only; the error is still
    /// reported if it is all there is.
    pub family_mismatch: bool,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// The attempt list was empty.
    #[error("no connection attempts were configured")]
    NoAttempts,
    /// `connect` was called a second time on the same connector.
    #[error("connector instances are single-use")]
    AlreadyUsed,
    /// Every attempt failed; carries the highest-weighted failure.
    #[error("all {attempts} connection attempts failed")]
    AllFailed {
        attempts: usize,
        #[source]
        source: AttemptError,
    },
}

enum Outcome {
    Connected(SocketHandle),
    Failed(AttemptError),
    /// Abandoned after the winner's grace signal; not an error.
    Abandoned,
}

/// Races a set of [`ConnectAttempt`]s. Single use.
pub struct SpeculativeConnector {
    attempts: Vec<ConnectAttempt>,
    used: bool,
}

impl SpeculativeConnector {
    pub fn new(attempts: Vec<ConnectAttempt>) -> SpeculativeConnector {
        SpeculativeConnector {
            attempts,
            used: false,
        }
    }

    /// Runs the race. Returns the first successful socket; every other
    /// socket that also connected is closed before returning.
    pub async fn connect(&mut self) -> Result<SocketHandle, ConnectorError> {
        if mem::replace(&mut self.used, true) {
            return Err(ConnectorError::AlreadyUsed);
        }
        let attempts = mem::replace(&mut self.attempts, Vec::new());
        if attempts.is_empty() {
            return Err(ConnectorError::NoAttempts);
        }
        let total = attempts.len();

        // The grace signal fires once, when a winner is known. Attempts
        // with a non-zero grace period then get that much longer before
        // being abandoned; everything else is dropped right away.
        let (grace_tx, grace_rx) = oneshot::channel::<()>();
        let grace: Shared<_> = grace_rx.map(|_| ()).shared();

        let mut pending: FuturesUnordered<_> = attempts
            .into_iter()
            .map(|attempt| run_attempt(attempt, grace.clone()))
            .collect();

        let mut winner: Option<SocketHandle> = None;
        let mut failures: Vec<AttemptError> = Vec::new();
        let mut grace_tx = Some(grace_tx);

        while let Some(outcome) = pending.next().await {
            match outcome {
                Outcome::Connected(handle) => {
                    if winner.is_none() {
                        if let Some(tx) = grace_tx.take() {
                            let _ = tx.send(());
                        }
                        winner = Some(handle);
                    } else {
                        // A loser that connected anyway; close it so only
                        // one live socket leaves this call.
                        log::debug!("closing losing connection {:?}", handle.remote_endpoint());
                        handle.close();
                    }
                }
                Outcome::Failed(err) => {
                    log::debug!(
                        "connection attempt to {} failed (mismatch={}): {}",
                        err.target,
                        err.family_mismatch,
                        err.source
                    );
                    failures.push(err);
                }
                Outcome::Abandoned => {}
            }
        }

        match winner {
            Some(handle) => Ok(handle),
            None => Err(ConnectorError::AllFailed {
                attempts: total,
                source: heaviest_failure(failures),
            }),
        }
    }
}

/// Picks the failure to surface: any non-mismatch failure outranks any
/// mismatch failure; among equals, the first seen wins.
fn heaviest_failure(failures: Vec<AttemptError>) -> AttemptError {
    let mut best: Option<AttemptError> = None;
    for failure in failures {
        let replaces = match &best {
            None => true,
            Some(current) => current.family_mismatch && !failure.family_mismatch,
        };
        if replaces {
            best = Some(failure);
        }
    }
    best.unwrap_or_else(|| AttemptError {
        target: String::from("(no attempt completed)"),
        family_mismatch: false,
        source: io::Error::new(io::ErrorKind::Other, "all attempts were abandoned"),
    })
}

async fn run_attempt(attempt: ConnectAttempt, grace: Shared<impl Future<Output = ()>>) -> Outcome {
    let grace_period = attempt.grace_period;

    let connect = connect_one(attempt);
    futures::pin_mut!(connect);

    let abandon = async move {
        grace.await;
        if grace_period > Duration::from_secs(0) {
            async_std::task::sleep(grace_period).await;
        }
    };
    futures::pin_mut!(abandon);

    match future::select(connect, abandon).await {
        Either::Left((Ok(handle), _)) => Outcome::Connected(handle),
        Either::Left((Err(err), _)) => Outcome::Failed(err),
        Either::Right(((), _)) => Outcome::Abandoned,
    }
}

async fn connect_one(attempt: ConnectAttempt) -> Result<SocketHandle, AttemptError> {
    let target = format!("{}:{}", attempt.target, attempt.port);

    let ip = match &attempt.target {
        Target::Ip(ip) => {
            if attempt.family.matches_ip(ip) {
                *ip
            } else {
                return Err(AttemptError {
                    target,
                    family_mismatch: true,
                    source: io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        "literal address is not of the requested family",
                    ),
                });
            }
        }
        Target::Host(host) => {
            let addresses = attempt
                .system
                .query_address(host)
                .await
                .map_err(|err| AttemptError {
                    target: target.clone(),
                    family_mismatch: false,
                    source: err,
                })?;
            match addresses
                .into_iter()
                .find(|candidate| attempt.family.matches_ip(candidate))
            {
                Some(ip) => ip,
                None => {
                    return Err(AttemptError {
                        target,
                        family_mismatch: true,
                        source: io::Error::new(
                            io::ErrorKind::AddrNotAvailable,
                            "target has no address of the requested family",
                        ),
                    })
                }
            }
        }
    };

    let addr = SocketAddr::new(ip, attempt.port);
    let connect = attempt.system.connect(addr);
    let result = match attempt.timeout {
        Some(timeout) => match async_std::future::timeout(timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "connection attempt timed out",
            )),
        },
        None => connect.await,
    };

    result.map_err(|err| AttemptError {
        // An address-family error reported by the OS is weighted like a
        // resolution mismatch.
        family_mismatch: matches!(
            err.kind(),
            io::ErrorKind::AddrNotAvailable | io::ErrorKind::Unsupported
        ),
        target,
        source: err,
    })
}

#[cfg(test)]
mod tests {
    use super::{ConnectAttempt, ConnectorError, SpeculativeConnector, Target};
    use crate::socket::{AddressFamily, SocketHandle, SocketKind};
    use crate::system::NetSystem;
    use futures::executor::block_on;
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use std::net::{IpAddr, SocketAddr};
    use std::sync::Arc;
    use std::time::Duration;
    use std::{io, mem};

    /// Network system whose connects are scripted per destination port.
    struct FakeSystem {
        /// port → (delay, outcome kind). `None` outcome means success.
        script: Mutex<Vec<(u16, Duration, Option<io::ErrorKind>)>>,
        /// Every handle this system ever produced.
        produced: Mutex<Vec<SocketHandle>>,
    }

    impl FakeSystem {
        fn new(script: Vec<(u16, Duration, Option<io::ErrorKind>)>) -> Arc<FakeSystem> {
            Arc::new(FakeSystem {
                script: Mutex::new(script),
                produced: Mutex::new(Vec::new()),
            })
        }

        fn fresh_handle(&self) -> SocketHandle {
            let handle = SocketHandle::bind_datagram("127.0.0.1:0".parse().unwrap()).unwrap();
            self.produced.lock().push(handle.clone());
            handle
        }

        fn live_handles(&self) -> usize {
            self.produced.lock().iter().filter(|h| !h.is_closed()).count()
        }
    }

    impl NetSystem for FakeSystem {
        fn name(&self) -> &str {
            "fake"
        }

        fn connect(&self, addr: SocketAddr) -> BoxFuture<'_, io::Result<SocketHandle>> {
            let entry = self
                .script
                .lock()
                .iter()
                .find(|(port, _, _)| *port == addr.port())
                .cloned();
            Box::pin(async move {
                let (_, delay, outcome) = entry.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "port not scripted")
                })?;
                if delay > Duration::from_secs(0) {
                    async_std::task::sleep(delay).await;
                }
                match outcome {
                    None => Ok(self.fresh_handle()),
                    Some(kind) => Err(io::Error::new(kind, "scripted failure")),
                }
            })
        }

        fn listen(&self, _addr: SocketAddr, _backlog: u32) -> BoxFuture<'_, io::Result<SocketHandle>> {
            Box::pin(async { Err(io::Error::new(io::ErrorKind::Unsupported, "not scripted")) })
        }

        fn query_address(&self, _host: &str) -> BoxFuture<'_, io::Result<Vec<IpAddr>>> {
            Box::pin(async { Ok(vec!["127.0.0.1".parse().unwrap()]) })
        }
    }

    fn attempt(system: &Arc<FakeSystem>, port: u16) -> ConnectAttempt {
        ConnectAttempt::new(
            system.clone() as Arc<dyn NetSystem>,
            Target::Ip("127.0.0.1".parse().unwrap()),
            port,
            AddressFamily::V4,
        )
    }

    #[test]
    fn first_success_wins_and_losers_closed() {
        block_on(async {
            let system = FakeSystem::new(vec![
                (1000, Duration::from_millis(5), None),
                (1001, Duration::from_millis(60), None),
            ]);
            let mut connector = SpeculativeConnector::new(vec![
                {
                    let mut a = attempt(&system, 1000);
                    a.grace_period = Duration::from_millis(200);
                    a
                },
                {
                    let mut a = attempt(&system, 1001);
                    a.grace_period = Duration::from_millis(200);
                    a
                },
            ]);

            let handle = connector.connect().await.unwrap();
            assert!(!handle.is_closed());
            assert_eq!(handle.kind(), SocketKind::Datagram);
            // Exactly one non-closed socket escaped the race.
            assert_eq!(system.live_handles(), 1);
        });
    }

    #[test]
    fn success_beats_failure() {
        block_on(async {
            let system = FakeSystem::new(vec![
                (2000, Duration::from_millis(0), Some(io::ErrorKind::ConnectionRefused)),
                (2001, Duration::from_millis(10), None),
            ]);
            let mut connector =
                SpeculativeConnector::new(vec![attempt(&system, 2000), attempt(&system, 2001)]);
            let handle = connector.connect().await.unwrap();
            assert!(!handle.is_closed());
        });
    }

    #[test]
    fn mismatch_never_masks_real_failure() {
        block_on(async {
            let system = FakeSystem::new(vec![(
                3000,
                Duration::from_millis(0),
                Some(io::ErrorKind::ConnectionRefused),
            )]);
            // First attempt fails with a family mismatch before any I/O:
            // an IPv4 literal with a required family of IPv6.
            let mismatch = ConnectAttempt::new(
                system.clone() as Arc<dyn NetSystem>,
                Target::Ip("127.0.0.1".parse().unwrap()),
                9,
                AddressFamily::V6,
            );
            let mut connector =
                SpeculativeConnector::new(vec![mismatch, attempt(&system, 3000)]);

            match connector.connect().await {
                Err(ConnectorError::AllFailed { attempts, source }) => {
                    assert_eq!(attempts, 2);
                    assert!(!source.family_mismatch);
                    assert_eq!(source.source.kind(), io::ErrorKind::ConnectionRefused);
                }
                other => panic!("unexpected outcome: {:?}", other.map(|_| ())),
            }
        });
    }

    #[test]
    fn mismatch_reported_when_alone() {
        block_on(async {
            let system = FakeSystem::new(vec![]);
            let mismatch = ConnectAttempt::new(
                system.clone() as Arc<dyn NetSystem>,
                Target::Ip("::1".parse().unwrap()),
                9,
                AddressFamily::V4,
            );
            let mut connector = SpeculativeConnector::new(vec![mismatch]);
            match connector.connect().await {
                Err(ConnectorError::AllFailed { source, .. }) => {
                    assert!(source.family_mismatch);
                }
                other => panic!("unexpected outcome: {:?}", other.map(|_| ())),
            }
        });
    }

    #[test]
    fn empty_attempt_list_rejected() {
        block_on(async {
            let mut connector = SpeculativeConnector::new(Vec::new());
            assert!(matches!(
                connector.connect().await,
                Err(ConnectorError::NoAttempts)
            ));
        });
    }

    #[test]
    fn connector_is_single_use() {
        block_on(async {
            let system = FakeSystem::new(vec![(4000, Duration::from_millis(0), None)]);
            let mut connector = SpeculativeConnector::new(vec![attempt(&system, 4000)]);
            let first = connector.connect().await.unwrap();
            mem::drop(first);
            assert!(matches!(
                connector.connect().await,
                Err(ConnectorError::AlreadyUsed)
            ));
        });
    }

    #[test]
    fn timeout_counts_as_failure() {
        block_on(async {
            let system = FakeSystem::new(vec![(5000, Duration::from_millis(500), None)]);
            let mut slow = attempt(&system, 5000);
            slow.timeout = Some(Duration::from_millis(20));
            let mut connector = SpeculativeConnector::new(vec![slow]);
            match connector.connect().await {
                Err(ConnectorError::AllFailed { source, .. }) => {
                    assert_eq!(source.source.kind(), io::ErrorKind::TimedOut);
                }
                other => panic!("unexpected outcome: {:?}", other.map(|_| ())),
            }
        });
    }
}
