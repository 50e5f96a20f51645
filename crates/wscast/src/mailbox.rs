// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounded cross-thread submission channel into the reactor.
//!
//! Producer threads hand the reactor a [`Job`] via [`Mailbox::submit`]; the
//! reactor drains the queue on its own thread during each poll iteration and
//! invokes the job callback once per live connection plus one terminal
//! sentinel invocation (`None`). The submitting thread is released only
//! after the sentinel has run, so an acknowledged submission is always a
//! fully fanned-out one.
//!
//! # Architecture
//!
//! ```text
//! +------------------+   submit()   +-------------------------------+
//! |  producer thread |------------->|            Mailbox            |
//! |  (timer, tests)  |  blocks on   |  Mutex<VecDeque<PendingJob>>  |
//! +------------------+  completion  |  space_free / gate condvars   |
//!                                   +---------------+---------------+
//!                                                   | pop() (reactor
//!                                                   |  thread only)
//!                                                   v
//!                                   +-------------------------------+
//!                                   | Reactor: callback(Some(conn)) |
//!                                   | x N, callback(None), complete |
//!                                   +-------------------------------+
//! ```
//!
//! # Deadlock avoidance
//!
//! The reactor thread is the only consumer. A submit from that thread can
//! never be drained and is rejected with
//! [`MailboxError::ReentrantSubmission`] before any blocking: one thread-id
//! comparison, no lock. Back-pressure (blocking while the queue is full)
//! therefore only ever applies to threads the reactor does not depend on.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use mio::Waker;
use parking_lot::{Condvar, Mutex};

use crate::error::{MailboxError, SubmitResult};
use crate::reactor::connection::WsConnection;

/// Callback invoked once per live connection, then once with `None` as the
/// end-of-fan-out sentinel. Must not block: it runs on the reactor thread.
pub type JobCallback = Box<dyn FnMut(Option<&mut WsConnection>, &[u8]) + Send + 'static>;

/// One unit of cross-thread work.
///
/// Ownership of the payload transfers to the reactor when the mailbox
/// accepts the job.
pub struct Job {
    pub(crate) payload: Vec<u8>,
    pub(crate) callback: JobCallback,
}

impl Job {
    /// Create a job from a payload and a fan-out callback.
    pub fn new<F>(payload: Vec<u8>, callback: F) -> Self
    where
        F: FnMut(Option<&mut WsConnection>, &[u8]) + Send + 'static,
    {
        Self {
            payload,
            callback: Box::new(callback),
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

// ============================================================================
// Completion gate
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum GateState {
    Pending,
    Done,
    Closed,
}

/// Rendezvous between a blocked submitter and the draining reactor.
struct CompletionGate {
    state: Mutex<GateState>,
    done: Condvar,
}

impl CompletionGate {
    fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Pending),
            done: Condvar::new(),
        }
    }

    fn finish(&self, state: GateState) {
        let mut guard = self.state.lock();
        // First writer wins; a gate closed during drain stays closed.
        if *guard == GateState::Pending {
            *guard = state;
        }
        self.done.notify_all();
    }

    fn wait(&self, deadline: Option<Instant>) -> SubmitResult {
        let mut guard = self.state.lock();
        loop {
            match *guard {
                GateState::Done => return Ok(()),
                GateState::Closed => return Err(MailboxError::Shutdown),
                GateState::Pending => {}
            }
            match deadline {
                Some(deadline) => {
                    if self.done.wait_until(&mut guard, deadline).timed_out() {
                        // Drain may have completed exactly at the boundary.
                        return match *guard {
                            GateState::Done => Ok(()),
                            GateState::Closed => Err(MailboxError::Shutdown),
                            GateState::Pending => Err(MailboxError::Timeout),
                        };
                    }
                }
                None => self.done.wait(&mut guard),
            }
        }
    }
}

/// A job accepted into the queue, paired with its completion gate.
pub(crate) struct PendingJob {
    pub(crate) job: Job,
    gate: Arc<CompletionGate>,
}

impl PendingJob {
    /// Signal the submitter that fan-out (including the sentinel) finished.
    pub(crate) fn complete(self) {
        self.gate.finish(GateState::Done);
    }
}

// ============================================================================
// Mailbox
// ============================================================================

struct Inner {
    pending: VecDeque<PendingJob>,
    closed: bool,
}

/// Bounded, thread-safe submission channel from producer threads to the
/// reactor. See the module docs for the fan-out and liveness contract.
pub struct Mailbox {
    capacity: usize,
    inner: Mutex<Inner>,
    space_free: Condvar,
    waker: Arc<Waker>,
    reactor_thread: OnceLock<ThreadId>,
}

impl Mailbox {
    /// Create a mailbox with the given pending-job capacity.
    ///
    /// The waker nudges the reactor poll loop when a job is queued so drain
    /// latency is not bounded by the poll timeout alone.
    pub(crate) fn new(capacity: usize, waker: Arc<Waker>) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                closed: false,
            }),
            space_free: Condvar::new(),
            waker,
            reactor_thread: OnceLock::new(),
        }
    }

    /// Record the reactor's thread id. Called once when the poll loop starts;
    /// submissions from that thread are rejected from then on.
    pub(crate) fn bind_reactor_thread(&self) {
        let _ = self.reactor_thread.set(thread::current().id());
    }

    /// Submit a job for fan-out across all live connections.
    ///
    /// Blocks the calling thread through capacity back-pressure and then
    /// until the reactor has invoked the callback once per live connection
    /// plus the sentinel. `Ok(())` is the acknowledgement that the full
    /// fan-out completed.
    ///
    /// `timeout` bounds the total wait. On [`MailboxError::Timeout`] the job
    /// may still be pending, draining, or just-completed; the caller must
    /// treat the outcome as uncertain.
    ///
    /// Calling from the reactor thread itself returns
    /// [`MailboxError::ReentrantSubmission`] immediately.
    pub fn submit(&self, job: Job, timeout: Option<Duration>) -> SubmitResult {
        if self.reactor_thread.get() == Some(&thread::current().id()) {
            return Err(MailboxError::ReentrantSubmission);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let gate = Arc::new(CompletionGate::new());

        {
            let mut inner = self.inner.lock();
            loop {
                if inner.closed {
                    return Err(MailboxError::Shutdown);
                }
                if inner.pending.len() < self.capacity {
                    break;
                }
                // Back-pressure: wait for the reactor to drain backlog.
                match deadline {
                    Some(deadline) => {
                        if self.space_free.wait_until(&mut inner, deadline).timed_out() {
                            return Err(MailboxError::Timeout);
                        }
                    }
                    None => self.space_free.wait(&mut inner),
                }
            }
            inner.pending.push_back(PendingJob {
                job,
                gate: Arc::clone(&gate),
            });
        }

        if let Err(e) = self.waker.wake() {
            // The reactor still drains on its next poll timeout.
            log::warn!("[WS-MAILBOX] waker failed: {}", e);
        }

        gate.wait(deadline)
    }

    /// Number of jobs accepted but not yet drained.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Pop the oldest pending job. Reactor thread only.
    pub(crate) fn pop(&self) -> Option<PendingJob> {
        let mut inner = self.inner.lock();
        let job = inner.pending.pop_front();
        if job.is_some() {
            self.space_free.notify_one();
        }
        job
    }

    /// Mark the mailbox closed and fail every pending or future submission
    /// with [`MailboxError::Shutdown`]. Called by the reactor on exit so
    /// producers never block on a dead reactor.
    pub(crate) fn close(&self) {
        let drained: Vec<PendingJob> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.pending.drain(..).collect()
        };
        for pending in drained {
            pending.gate.finish(GateState::Closed);
        }
        self.space_free.notify_all();
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("capacity", &self.capacity)
            .field("pending", &self.pending_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Poll, Token};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_mailbox(capacity: usize) -> (Poll, Arc<Mailbox>) {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(0)).unwrap());
        (poll, Arc::new(Mailbox::new(capacity, waker)))
    }

    /// Run one job the way the reactor does for a zero-connection registry:
    /// sentinel invocation, then complete.
    fn drain_one(mb: &Mailbox) -> bool {
        match mb.pop() {
            Some(mut pending) => {
                let payload = std::mem::take(&mut pending.job.payload);
                (pending.job.callback)(None, &payload);
                pending.complete();
                true
            }
            None => false,
        }
    }

    #[test]
    fn test_reentrant_submission_rejected_immediately() {
        let (_poll, mb) = test_mailbox(4);
        mb.bind_reactor_thread();

        let start = Instant::now();
        let result = mb.submit(Job::new(vec![], |_, _| {}), None);
        assert_eq!(result, Err(MailboxError::ReentrantSubmission));
        assert!(start.elapsed() < Duration::from_millis(10));
        assert_eq!(mb.pending_len(), 0, "rejected job must not be queued");
    }

    #[test]
    fn test_submit_acks_only_after_sentinel() {
        let (_poll, mb) = test_mailbox(4);
        let calls = Arc::new(AtomicUsize::new(0));

        let drainer = {
            let mb = Arc::clone(&mb);
            thread::spawn(move || {
                mb.bind_reactor_thread();
                let deadline = Instant::now() + Duration::from_secs(5);
                let mut drained = false;
                while !drained && Instant::now() < deadline {
                    drained = drain_one(&mb);
                    thread::sleep(Duration::from_millis(1));
                }
            })
        };

        let calls_cb = Arc::clone(&calls);
        let job = Job::new(b"ping".to_vec(), move |conn, payload| {
            assert!(conn.is_none(), "no connections registered");
            assert_eq!(payload, b"ping");
            calls_cb.fetch_add(1, Ordering::SeqCst);
        });

        let result = mb.submit(job, Some(Duration::from_secs(5)));
        assert_eq!(result, Ok(()));
        // Ack implies the sentinel already ran.
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        drainer.join().unwrap();
    }

    #[test]
    fn test_fifo_order_preserved() {
        let (_poll, mb) = test_mailbox(8);

        // Zero timeout: accepted into the queue, wait times out right away.
        for i in 0u8..3 {
            let result = mb.submit(Job::new(vec![i], |_, _| {}), Some(Duration::ZERO));
            assert_eq!(result, Err(MailboxError::Timeout));
        }
        assert_eq!(mb.pending_len(), 3);

        for i in 0u8..3 {
            let pending = mb.pop().expect("job queued");
            assert_eq!(pending.job.payload, vec![i]);
            pending.complete();
        }
        assert!(mb.pop().is_none());
    }

    #[test]
    fn test_empty_drain_is_noop() {
        let (_poll, mb) = test_mailbox(4);
        assert!(mb.pop().is_none());
        assert!(!drain_one(&mb));
    }

    #[test]
    fn test_capacity_backpressure_blocks_then_unblocks() {
        let (_poll, mb) = test_mailbox(1);

        // Fill the single slot.
        let result = mb.submit(Job::new(vec![1], |_, _| {}), Some(Duration::ZERO));
        assert_eq!(result, Err(MailboxError::Timeout));
        assert_eq!(mb.pending_len(), 1);

        let producer = {
            let mb = Arc::clone(&mb);
            thread::spawn(move || mb.submit(Job::new(vec![2], |_, _| {}), Some(Duration::from_secs(5))))
        };

        // The producer must be parked on back-pressure, not queued.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(mb.pending_len(), 1);

        // Draining frees the slot and eventually both jobs complete.
        assert!(drain_one(&mb));
        let deadline = Instant::now() + Duration::from_secs(5);
        while mb.pending_len() > 0 || !producer.is_finished() {
            drain_one(&mb);
            assert!(Instant::now() < deadline, "producer never unblocked");
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(producer.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_close_releases_blocked_submitter() {
        let (_poll, mb) = test_mailbox(4);

        let producer = {
            let mb = Arc::clone(&mb);
            thread::spawn(move || mb.submit(Job::new(vec![], |_, _| {}), None))
        };

        thread::sleep(Duration::from_millis(50));
        mb.close();

        assert_eq!(producer.join().unwrap(), Err(MailboxError::Shutdown));
        // Submissions after close fail without blocking.
        let result = mb.submit(Job::new(vec![], |_, _| {}), None);
        assert_eq!(result, Err(MailboxError::Shutdown));
    }

    #[test]
    fn test_timeout_leaves_job_pending() {
        let (_poll, mb) = test_mailbox(4);

        let result = mb.submit(
            Job::new(b"late".to_vec(), |_, _| {}),
            Some(Duration::from_millis(10)),
        );
        assert_eq!(result, Err(MailboxError::Timeout));
        // Uncertain outcome: the job is still queued and drains later.
        assert_eq!(mb.pending_len(), 1);
        assert!(drain_one(&mb));
    }
}
