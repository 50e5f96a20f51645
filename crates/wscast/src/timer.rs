// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Periodic broadcast producer thread.
//!
//! Every interval, builds a job carrying the fixed `"timer_task"` payload
//! and submits it to the reactor's mailbox. The job callback sends the
//! payload as a text frame to every confirmed peer; unclassified
//! connections get the invocation but no send.
//!
//! Submission outcomes are surfaced per interval instead of fire-and-forget:
//! an acknowledged broadcast logs at info, a timeout (uncertain) at warn,
//! and a reentrant submission, which would indicate a logic error in this
//! producer, at error. The thread keeps running subsequent intervals either
//! way and only exits on shutdown or when the reactor is gone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::MailboxError;
use crate::mailbox::{Job, Mailbox};

/// Fixed broadcast payload.
pub const TIMER_PAYLOAD: &str = "timer_task";

/// Granularity of the shutdown check while waiting out an interval.
const SHUTDOWN_POLL_SLICE: Duration = Duration::from_millis(100);

/// Build the broadcast job: send the payload as text to confirmed peers,
/// no-op for everything else, including the sentinel invocation.
pub fn broadcast_job(payload: Vec<u8>) -> Job {
    Job::new(payload, |conn, payload| {
        let Some(conn) = conn else {
            // Sentinel: fan-out for this job is complete.
            log::debug!("[WS-TIMER] fan-out complete");
            return;
        };
        if !conn.is_confirmed_peer() {
            log::debug!("[WS-TIMER] {} not a confirmed peer, skipping", conn.id());
            return;
        }
        let text = String::from_utf8_lossy(payload);
        if let Err(e) = conn.send_text(&text) {
            log::warn!("[WS-TIMER] broadcast send failed {}: {}", conn.id(), e);
        }
    })
}

/// Periodic producer submitting one broadcast job per interval.
pub struct BroadcastTimer {
    /// Shutdown signal (set to true to stop the timer)
    shutdown: Arc<AtomicBool>,
    /// Background thread handle
    handle: Option<JoinHandle<()>>,
}

impl BroadcastTimer {
    /// Spawn the timer thread.
    ///
    /// `submit_timeout` bounds how long one broadcast may block this thread;
    /// it should be comfortably below `interval`.
    pub fn spawn(mailbox: Arc<Mailbox>, interval: Duration, submit_timeout: Duration) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        #[allow(clippy::expect_used)] // thread spawn failure is unrecoverable
        let handle = thread::Builder::new()
            .name("wscast-timer".to_string())
            .spawn(move || {
                Self::run(mailbox, interval, submit_timeout, flag);
            })
            .expect("failed to spawn broadcast timer thread");

        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    fn run(
        mailbox: Arc<Mailbox>,
        interval: Duration,
        submit_timeout: Duration,
        shutdown: Arc<AtomicBool>,
    ) {
        log::info!("[WS-TIMER] started interval={:?}", interval);

        while !shutdown.load(Ordering::Relaxed) {
            if Self::wait_interval(interval, &shutdown) {
                break;
            }

            log::info!("[WS-TIMER] run");
            let job = broadcast_job(TIMER_PAYLOAD.as_bytes().to_vec());

            match mailbox.submit(job, Some(submit_timeout)) {
                Ok(()) => log::info!("[WS-TIMER] broadcast delivered"),
                Err(MailboxError::Timeout) => {
                    log::warn!("[WS-TIMER] broadcast timed out, outcome uncertain");
                }
                Err(MailboxError::Shutdown) => {
                    log::info!("[WS-TIMER] reactor stopped, exiting");
                    break;
                }
                Err(e @ MailboxError::ReentrantSubmission) => {
                    log::error!("[WS-TIMER] broadcast rejected: {}", e);
                }
            }
        }

        log::info!("[WS-TIMER] stopped");
    }

    /// Sleep one interval in slices. Returns true if shutdown was requested.
    fn wait_interval(interval: Duration, shutdown: &AtomicBool) -> bool {
        let deadline = Instant::now() + interval;
        loop {
            if shutdown.load(Ordering::Relaxed) {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            thread::sleep(remaining.min(SHUTDOWN_POLL_SLICE));
        }
    }

    /// Stop the timer and join its thread.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BroadcastTimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
