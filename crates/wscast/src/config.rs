// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime configuration for the reactor and broadcast timer.

use std::net::SocketAddr;
use std::time::Duration;

/// Default WebSocket listen port.
pub const DEFAULT_LISTEN_PORT: u16 = 8000;

/// Default poll timeout.
///
/// The primary liveness tuning knob: a shorter timeout makes mailbox
/// draining more responsive at a CPU-wakeup cost.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Default bound on pending (not yet drained) jobs.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 32;

/// Default broadcast interval.
pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(10);

/// Default per-submission timeout used by the broadcast timer.
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default maximum incoming frame size.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Reactor and timer configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the WebSocket listener binds to.
    pub listen_addr: SocketAddr,

    /// Poll timeout for one reactor iteration.
    pub poll_timeout: Duration,

    /// Maximum number of pending jobs before submit applies back-pressure.
    pub mailbox_capacity: usize,

    /// Interval between broadcast jobs submitted by the timer.
    pub broadcast_interval: Duration,

    /// Timeout the broadcast timer passes to each submit call.
    pub submit_timeout: Duration,

    /// Maximum accepted WebSocket frame size.
    pub max_frame_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_LISTEN_PORT)),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            broadcast_interval: DEFAULT_BROADCAST_INTERVAL,
            submit_timeout: DEFAULT_SUBMIT_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}
