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

//! Demonstration echo server wiring the gangway pieces together.
//!
//! One OS-backed network system instance is created here at startup and
//! injected everywhere; nothing else in the workspace constructs one. The
//! accept path runs accept loop → admission limiter → accept queue →
//! per-session task, with sessions registered in the socket registry and
//! optionally recorded to a pcapng capture file.

use async_std::task;
use futures::executor::block_on;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::{fs, io, process};
use structopt::StructOpt;

use gangway_admission::{AdmissionConfig, AdmissionLimiter};
use gangway_capture::CaptureWriter;
use gangway_core::telemetry::LogSink;
use gangway_core::{
    AcceptQueue, AddressFamily, ConnectAttempt, NetSystem, OsNetSystem, SocketHandle,
    SocketRegistry, SpeculativeConnector, Target,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "gangway", about = "Gangway demonstration echo server.")]
struct CliOptions {
    /// Address to listen on.
    #[structopt(long, default_value = "127.0.0.1:7000")]
    listen: SocketAddr,

    /// Accept queue backlog.
    #[structopt(long, default_value = "512")]
    backlog: usize,

    /// Connect to this host instead of serving, racing one attempt per
    /// address family.
    #[structopt(long)]
    connect: Option<String>,

    /// Port used with --connect.
    #[structopt(long, default_value = "7000")]
    port: u16,

    /// Admission: sustained connections per second per source range.
    #[structopt(long, default_value = "5.0")]
    limit_per_second: f64,

    /// Admission: token bucket capacity per source range.
    #[structopt(long, default_value = "10.0")]
    burst: f64,

    /// Admission: maximum concurrent sessions per source range.
    #[structopt(long, default_value = "100")]
    max_concurrent: usize,

    /// Disable the admission limiter entirely.
    #[structopt(long)]
    no_admission: bool,

    /// Record session payloads to this pcapng file.
    #[structopt(long, parse(from_os_str))]
    capture: Option<PathBuf>,
}

type SharedCapture = Arc<Mutex<CaptureWriter<fs::File>>>;

fn main() {
    env_logger::init();
    if let Err(err) = block_on(async_main()) {
        log::error!("{}", err);
        process::exit(1);
    }
}

async fn async_main() -> io::Result<()> {
    let opts = CliOptions::from_args();

    // The single construction site of the default network system.
    let system: Arc<dyn NetSystem> = Arc::new(OsNetSystem::new());

    if let Some(host) = opts.connect.clone() {
        return run_client(system, host, opts.port).await;
    }
    run_server(system, opts).await
}

async fn run_server(system: Arc<dyn NetSystem>, opts: CliOptions) -> io::Result<()> {
    let registry = Arc::new(SocketRegistry::new(system.name(), Arc::new(LogSink)));

    let limiter = if opts.no_admission {
        None
    } else {
        let limiter = AdmissionLimiter::new(AdmissionConfig {
            limit_per_second: opts.limit_per_second,
            burst: opts.burst,
            max_concurrent: opts.max_concurrent,
            ..AdmissionConfig::default()
        });
        // Detached; the sweeper stops itself once the limiter is dropped.
        let _ = limiter.spawn_sweeper();
        Some(limiter)
    };

    let capture: Option<SharedCapture> = match &opts.capture {
        Some(path) => {
            let writer = CaptureWriter::new(fs::File::create(path)?)?;
            log::info!("recording sessions to {}", path.display());
            Some(Arc::new(Mutex::new(writer)))
        }
        None => None,
    };

    let queue = AcceptQueue::with_backlog(opts.backlog);
    let listener = system.listen(opts.listen, opts.backlog as u32).await?;
    log::info!(
        "listening on {} (backlog {})",
        listener.local_endpoint().map_or(opts.listen, |a| a),
        opts.backlog
    );

    // Producer: accept from the OS, run admission, hand off to the queue.
    // Each connection gets a small task whose lifetime matches the socket's,
    // so the admission ticket is released exactly when the session ends.
    task::spawn({
        let queue = queue.clone();
        let limiter = limiter.clone();
        async move {
            loop {
                let handle = match listener.accept().await {
                    Ok(handle) => handle,
                    Err(err) => {
                        log::error!("accept failed: {}", err);
                        break;
                    }
                };
                let peer = match handle.remote_endpoint() {
                    Some(peer) => peer,
                    None => {
                        handle.close();
                        continue;
                    }
                };

                let ticket = match &limiter {
                    Some(limiter) => match limiter.try_enter(peer.ip()) {
                        Ok(ticket) => Some(ticket),
                        Err(err) => {
                            log::warn!("connection from {} refused: {}", peer, err);
                            handle.close();
                            continue;
                        }
                    },
                    None => None,
                };

                task::spawn({
                    let queue = queue.clone();
                    async move {
                        let _ticket = ticket;
                        if !queue.inject_and_wait(handle.clone()).await {
                            log::warn!("accept queue full; dropping connection from {}", peer);
                            handle.close();
                        }
                    }
                });
            }
            queue.cancel();
        }
    });

    // Consumer: pull admitted connections and run echo sessions.
    loop {
        let handle = match queue.accept().await {
            Ok(handle) => handle,
            Err(err) => {
                log::info!("stopping: {}", err);
                break;
            }
        };
        let id = match registry.register(&handle) {
            Ok(id) => id,
            Err(err) => {
                log::warn!("registration refused: {}", err);
                handle.close();
                continue;
            }
        };

        task::spawn({
            let registry = registry.clone();
            let capture = capture.clone();
            async move {
                if let Err(err) = echo_session(&handle, capture.as_ref()).await {
                    log::debug!("session {} ended: {}", id, err);
                }
                handle.close();
                registry.unregister(id);
            }
        });
    }

    registry.shutdown();
    Ok(())
}

/// Echoes everything received back to the sender, recording each received
/// chunk to the capture file when one is configured.
async fn echo_session(handle: &SocketHandle, capture: Option<&SharedCapture>) -> io::Result<()> {
    let comment = format!(
        "{:?} -> {:?}",
        handle.remote_endpoint(),
        handle.local_endpoint()
    );
    let mut buf = [0u8; 4096];
    loop {
        let read = handle.receive(&mut buf).await?;
        if read == 0 {
            return Ok(());
        }
        if let Some(capture) = capture {
            if let Err(err) = capture.lock().write_packet(&buf[..read], None, Some(&comment)) {
                log::warn!("capture write failed: {}", err);
            }
        }
        let mut sent = 0;
        while sent < read {
            sent += handle.send(&buf[sent..read]).await?;
        }
    }
}

/// Connects to `host:port` racing an IPv6 and an IPv4 attempt, sends one
/// probe line, and prints the echoed reply.
async fn run_client(system: Arc<dyn NetSystem>, host: String, port: u16) -> io::Result<()> {
    let make_attempt = |family| {
        let mut attempt = ConnectAttempt::new(
            system.clone(),
            Target::Host(host.clone()),
            port,
            family,
        );
        attempt.timeout = Some(Duration::from_secs(10));
        attempt.grace_period = Duration::from_millis(250);
        attempt
    };

    let mut connector = SpeculativeConnector::new(vec![
        make_attempt(AddressFamily::V6),
        make_attempt(AddressFamily::V4),
    ]);
    let handle = connector
        .connect()
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    log::info!(
        "connected to {:?} via {}",
        handle.remote_endpoint(),
        handle.family()
    );

    handle.send(b"ping\n").await?;
    let mut buf = [0u8; 4096];
    let read = handle.receive(&mut buf).await?;
    println!("{}", String::from_utf8_lossy(&buf[..read]).trim_end());
    handle.close();
    Ok(())
}
