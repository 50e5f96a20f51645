// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! wscast-server - WebSocket echo server with periodic broadcast
//!
//! Binds a WebSocket listener, spawns the reactor and the broadcast timer,
//! and logs reactor events until Ctrl-C.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use wscast::{BroadcastTimer, Config, Reactor, ReactorEvent};

/// WebSocket echo server with periodic cross-thread broadcast
#[derive(Parser, Debug)]
#[command(name = "wscast-server")]
#[command(version = "0.1.0")]
#[command(about = "Echo WebSocket frames and broadcast to all peers on an interval")]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:8000")]
    listen: SocketAddr,

    /// Broadcast interval in seconds
    #[arg(short, long, default_value = "10")]
    interval: u64,

    /// Reactor poll timeout in milliseconds
    #[arg(long, default_value = "100")]
    poll_timeout_ms: u64,

    /// Pending-job capacity of the mailbox
    #[arg(long, default_value = "32")]
    capacity: usize,

    /// Per-broadcast submit timeout in seconds
    #[arg(long, default_value = "5")]
    submit_timeout: u64,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("wscast-server: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> io::Result<()> {
    let config = Config {
        listen_addr: args.listen,
        poll_timeout: Duration::from_millis(args.poll_timeout_ms),
        mailbox_capacity: args.capacity,
        broadcast_interval: Duration::from_secs(args.interval),
        submit_timeout: Duration::from_secs(args.submit_timeout),
        ..Default::default()
    };
    let interval = config.broadcast_interval;
    let submit_timeout = config.submit_timeout;

    let mut handle = Reactor::spawn(config)?;
    let mut timer = BroadcastTimer::spawn(handle.mailbox(), interval, submit_timeout);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::Relaxed))
            .map_err(|e| io::Error::other(format!("failed to install ctrl-c handler: {}", e)))?;
    }

    log::info!("[WS-SERVER] listening on {}", handle.local_addr());

    while !stop.load(Ordering::Relaxed) && handle.is_running() {
        match handle.recv_event_timeout(Duration::from_millis(200)) {
            Some(ReactorEvent::Stopped) => break,
            Some(event) => log::debug!("[WS-SERVER] event: {:?}", event),
            None => {}
        }
    }

    log::info!("[WS-SERVER] shutting down");
    timer.shutdown();
    handle.shutdown()?;

    Ok(())
}
