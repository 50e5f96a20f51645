// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # wscast - WebSocket reactor with a cross-thread broadcast mailbox
//!
//! A single-threaded WebSocket echo server built around one primitive: a
//! bounded [`Mailbox`] that lets any foreign thread schedule a callback to
//! run, once per live connection plus a terminal sentinel call, on the
//! reactor's own thread.
//!
//! The mechanism exists to fix a classic hang: a broadcast call that blocks
//! until the event loop drains it deadlocks forever when made *from* the
//! event-loop thread. Here that misuse is a typed, immediate
//! [`MailboxError::ReentrantSubmission`] instead of a silent lockup, and
//! the acknowledgement contract is strict: `submit` returns `Ok` only after
//! the full fan-out, sentinel included, has run.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use wscast::{BroadcastTimer, Config, Reactor};
//!
//! fn main() -> std::io::Result<()> {
//!     let config = Config::default();
//!     let interval = config.broadcast_interval;
//!     let submit_timeout = config.submit_timeout;
//!
//!     // Reactor thread: WebSocket listener + mailbox drain
//!     let handle = Reactor::spawn(config)?;
//!
//!     // Producer thread: one broadcast job per interval
//!     let _timer = BroadcastTimer::spawn(handle.mailbox(), interval, submit_timeout);
//!
//!     loop {
//!         if let Some(event) = handle.recv_event_timeout(Duration::from_secs(1)) {
//!             println!("{:?}", event);
//!         }
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |  producer threads (BroadcastTimer, ...)                      |
//! |        Mailbox::submit(job) -- blocks until fan-out done     |
//! +------------------------------+-------------------------------+
//!                                |
//! +------------------------------v-------------------------------+
//! |  reactor thread (mio poll loop)                              |
//! |    accept / upgrade / frame echo   |   mailbox drain         |
//! |    ConnectionRegistry (owned, unlocked)                      |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Reactor`] | Single-threaded poll loop owning all connection state |
//! | [`ReactorHandle`] | Cross-thread handle: mailbox access, events, shutdown |
//! | [`Mailbox`] | Bounded submission channel with fan-out acknowledgement |
//! | [`Job`] | One unit of cross-thread work (payload + callback) |
//! | [`BroadcastTimer`] | Periodic producer sending `"timer_task"` to peers |

/// Runtime configuration (listen address, poll timeout, capacities).
pub mod config;
/// Error types for mailbox submission.
pub mod error;
/// Bounded cross-thread submission channel.
pub mod mailbox;
/// Single-threaded WebSocket reactor (poll loop, connections, registry).
pub mod reactor;
/// Periodic broadcast producer thread.
pub mod timer;

pub use config::Config;
pub use error::{MailboxError, SubmitResult};
pub use mailbox::{Job, Mailbox};
pub use reactor::connection::{ConnId, ConnState, PeerClass, WsConnection};
pub use reactor::registry::ConnectionRegistry;
pub use reactor::{Reactor, ReactorEvent, ReactorHandle, FRAME_REPLY};
pub use timer::{broadcast_job, BroadcastTimer, TIMER_PAYLOAD};
