// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-threaded WebSocket reactor.
//!
//! One dedicated thread owns all connection state and runs a mio poll loop.
//! Each iteration services transport readiness (accept, handshake, frame
//! read/write) and then drains the mailbox completely, fanning every popped
//! job out across the registry snapshot plus one sentinel invocation.
//!
//! # Architecture
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                         Reactor                              |
//! |  +-------------------------------------------------------+  |
//! |  |                    mio::Poll                           |  |
//! |  |  - TCP Listener (accept new connections)              |  |
//! |  |  - WebSocket streams (handshake, read, write)         |  |
//! |  |  - Waker (mailbox submission from producer threads)   |  |
//! |  +-------------------------------------------------------+  |
//! |                              |                               |
//! |                              v                               |
//! |  +-------------+    +-------------+    +-----------------+  |
//! |  |   Accept    |    |   Frames    |    |  Mailbox drain  |  |
//! |  |  + upgrade  |    |  echo reply |    |  fan-out + ack  |  |
//! |  +-------------+    +-------------+    +-----------------+  |
//! |                              |                               |
//! |                              v                               |
//! |  +-------------------------------------------------------+  |
//! |  |            Event Channel -> ReactorHandle              |  |
//! |  +-------------------------------------------------------+  |
//! +-------------------------------------------------------------+
//! ```

pub mod connection;
pub mod registry;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::config::Config;
use crate::mailbox::Mailbox;
use connection::{ConnId, ConnState, HandshakeProgress, ReadOutcome, WsConnection};
use registry::ConnectionRegistry;

// ============================================================================
// Constants
// ============================================================================

/// Token for the WebSocket listener
const LISTENER_TOKEN: Token = Token(0);

/// Token for the waker (mailbox submissions)
const WAKER_TOKEN: Token = Token(1);

/// Starting token for connections
const CONNECTION_TOKEN_START: usize = 2;

/// Maximum events to process per poll
const MAX_EVENTS: usize = 128;

/// Fixed reply sent for every non-empty received frame
pub const FRAME_REPLY: &str = "ws_frame_reply";

// ============================================================================
// Events
// ============================================================================

/// Events emitted by the reactor thread.
#[derive(Debug)]
pub enum ReactorEvent {
    /// Reactor started and is listening
    Started {
        /// Bound listener address
        local_addr: SocketAddr,
    },

    /// HTTP upgrade request received
    HandshakeRequest {
        /// Connection ID
        id: ConnId,
        /// Remote address
        peer_addr: SocketAddr,
    },

    /// WebSocket upgrade completed
    HandshakeDone {
        /// Connection ID
        id: ConnId,
        /// Remote address
        peer_addr: SocketAddr,
    },

    /// Data frame received
    FrameReceived {
        /// Connection ID
        id: ConnId,
        /// Frame payload
        payload: Vec<u8>,
    },

    /// Connection closed or failed
    ConnectionClosed {
        /// Connection ID
        id: ConnId,
        /// Remote address
        peer_addr: SocketAddr,
        /// Reason (if any)
        reason: Option<String>,
    },

    /// Reactor stopped
    Stopped,

    /// Error occurred
    Error {
        /// Connection ID (if connection-specific)
        id: Option<ConnId>,
        /// Error description
        error: String,
    },
}

// ============================================================================
// Reactor Handle
// ============================================================================

/// Handle for interacting with a running reactor from other threads.
///
/// The handle is the only way foreign threads reach the reactor: jobs go
/// through [`mailbox`](Self::mailbox), observations come back on the event
/// channel. Dropping the handle shuts the reactor down.
pub struct ReactorHandle {
    /// Submission channel into the reactor
    mailbox: Arc<Mailbox>,

    /// Event receiver
    event_rx: Receiver<ReactorEvent>,

    /// Bound listener address
    local_addr: SocketAddr,

    /// Waker to wake the poll
    waker: Arc<Waker>,

    /// Thread handle
    thread_handle: Option<JoinHandle<()>>,

    /// Running flag
    running: Arc<AtomicBool>,
}

impl ReactorHandle {
    /// The mailbox accepting cross-thread jobs for this reactor.
    pub fn mailbox(&self) -> Arc<Mailbox> {
        Arc::clone(&self.mailbox)
    }

    /// Address the listener is bound to (useful with ephemeral ports).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv_event(&self) -> Option<ReactorEvent> {
        match self.event_rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(ReactorEvent::Stopped),
        }
    }

    /// Receive an event with timeout.
    pub fn recv_event_timeout(&self, timeout: Duration) -> Option<ReactorEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }

    /// Check if the reactor is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Shutdown the reactor and join its thread.
    pub fn shutdown(&mut self) -> io::Result<()> {
        if !self.is_running() && self.thread_handle.is_none() {
            return Ok(());
        }

        self.running.store(false, Ordering::Relaxed);
        let _ = self.waker.wake();

        if let Some(handle) = self.thread_handle.take() {
            handle
                .join()
                .map_err(|_| io::Error::other("reactor thread panicked"))?;
        }

        Ok(())
    }
}

impl Drop for ReactorHandle {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

// ============================================================================
// Reactor
// ============================================================================

/// Single-threaded poll loop owning the connection registry.
pub struct Reactor {
    /// Configuration
    config: Config,

    /// mio Poll
    poll: Poll,

    /// WebSocket listener
    listener: TcpListener,

    /// Live connections
    registry: ConnectionRegistry,

    /// Cross-thread submission channel
    mailbox: Arc<Mailbox>,

    /// Event sender
    event_tx: Sender<ReactorEvent>,

    /// Running flag
    running: Arc<AtomicBool>,

    /// Next connection token
    next_token: usize,
}

impl Reactor {
    /// Create a new reactor bound to `config.listen_addr`.
    pub fn new(config: Config) -> io::Result<(Self, ReactorHandle)> {
        let poll = Poll::new()?;

        let mut listener = TcpListener::bind(config.listen_addr)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let local_addr = listener.local_addr()?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let mailbox = Arc::new(Mailbox::new(config.mailbox_capacity, Arc::clone(&waker)));

        let (event_tx, event_rx) = channel();
        let running = Arc::new(AtomicBool::new(true));

        let reactor = Self {
            config,
            poll,
            listener,
            registry: ConnectionRegistry::new(),
            mailbox: Arc::clone(&mailbox),
            event_tx,
            running: Arc::clone(&running),
            next_token: CONNECTION_TOKEN_START,
        };

        let handle = ReactorHandle {
            mailbox,
            event_rx,
            local_addr,
            waker,
            thread_handle: None,
            running,
        };

        Ok((reactor, handle))
    }

    /// Spawn the reactor on its own named thread.
    pub fn spawn(config: Config) -> io::Result<ReactorHandle> {
        let (reactor, mut handle) = Self::new(config)?;

        let thread_handle = thread::Builder::new()
            .name("wscast-reactor".to_string())
            .spawn(move || {
                reactor.run();
            })?;

        handle.thread_handle = Some(thread_handle);

        Ok(handle)
    }

    /// Run the poll loop until shutdown.
    pub fn run(mut self) {
        // From here on, submissions from this thread are reentrant.
        self.mailbox.bind_reactor_thread();

        let local_addr = match self.listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                let _ = self.event_tx.send(ReactorEvent::Error {
                    id: None,
                    error: format!("listener address unavailable: {}", e),
                });
                self.config.listen_addr
            }
        };
        log::info!("[WS-REACTOR] started on {}", local_addr);
        let _ = self.event_tx.send(ReactorEvent::Started { local_addr });

        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.running.load(Ordering::Relaxed) {
            if let Err(e) = self
                .poll
                .poll(&mut events, Some(self.config.poll_timeout))
            {
                if e.kind() != io::ErrorKind::Interrupted {
                    let _ = self.event_tx.send(ReactorEvent::Error {
                        id: None,
                        error: format!("poll error: {}", e),
                    });
                }
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.handle_accept(),
                    // Submissions are picked up by the unconditional drain
                    // below; the waker only interrupts the poll wait.
                    WAKER_TOKEN => {}
                    token => self.handle_connection_ready(
                        token,
                        event.is_readable(),
                        event.is_writable(),
                    ),
                }
            }

            self.drain_mailbox();
            self.sweep_closing();
        }

        self.shutdown_cleanup();
    }

    /// Accept incoming connections until the listener would block.
    fn handle_accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer_addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    let id = ConnId(token.0 as u64);

                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        let _ = self.event_tx.send(ReactorEvent::Error {
                            id: Some(id),
                            error: format!("failed to register connection: {}", e),
                        });
                        continue;
                    }

                    log::info!("[WS-REACTOR] accepted {} peer={}", id, peer_addr);
                    let conn = WsConnection::accept(
                        id,
                        peer_addr,
                        stream,
                        self.event_tx.clone(),
                        self.config.max_frame_size,
                    );
                    self.registry.add(conn);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    let _ = self.event_tx.send(ReactorEvent::Error {
                        id: None,
                        error: format!("accept error: {}", e),
                    });
                    break;
                }
            }
        }
    }

    /// Service readiness on one connection.
    fn handle_connection_ready(&mut self, token: Token, readable: bool, writable: bool) {
        let id = ConnId(token.0 as u64);

        let state = match self.registry.get_mut(id) {
            Some(conn) => conn.state(),
            None => return,
        };

        if state == ConnState::Connecting {
            let progress = match self.registry.get_mut(id) {
                Some(conn) => conn.drive_handshake(),
                None => return,
            };
            match progress {
                HandshakeProgress::Pending => return,
                HandshakeProgress::Done => {
                    self.finish_handshake(id);
                    // A frame may already sit in the protocol read buffer.
                    self.read_frames(id);
                }
                HandshakeProgress::Failed(e) => {
                    self.close_connection(id, Some(format!("upgrade failed: {}", e)));
                }
            }
            return;
        }

        if writable {
            if let Some(conn) = self.registry.get_mut(id) {
                conn.flush();
            }
        }

        if readable {
            self.read_frames(id);
        }
    }

    fn finish_handshake(&mut self, id: ConnId) {
        if let Some(peer_addr) = self.registry.mark_handshake_done(id) {
            log::info!("[WS-REACTOR] ws handshake done {} peer={}", id, peer_addr);
            let _ = self
                .event_tx
                .send(ReactorEvent::HandshakeDone { id, peer_addr });
        }
    }

    /// Read all buffered frames on one connection, echoing replies.
    fn read_frames(&mut self, id: ConnId) {
        loop {
            let outcome = match self.registry.get_mut(id) {
                Some(conn) => conn.read_frame(),
                None => return,
            };

            match outcome {
                ReadOutcome::Pending => return,
                ReadOutcome::Closed(reason) => {
                    self.close_connection(id, reason);
                    return;
                }
                ReadOutcome::Frame(payload) => {
                    log::debug!(
                        "[WS-REACTOR] frame {} len={} payload={}",
                        id,
                        payload.len(),
                        String::from_utf8_lossy(&payload)
                    );
                    let reply = !payload.is_empty();
                    let _ = self
                        .event_tx
                        .send(ReactorEvent::FrameReceived { id, payload });

                    if reply {
                        if let Some(conn) = self.registry.get_mut(id) {
                            if let Err(e) = conn.send_text(FRAME_REPLY) {
                                log::warn!("[WS-REACTOR] echo reply failed {}: {}", id, e);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Drain the mailbox completely: oldest job first, each fanned out over
    /// a registry snapshot, sentinel last, then the submitter is released.
    fn drain_mailbox(&mut self) {
        while let Some(mut pending) = self.mailbox.pop() {
            let snapshot = self.registry.snapshot();
            log::debug!(
                "[WS-REACTOR] draining job across {} connection(s)",
                snapshot.len()
            );

            for id in snapshot {
                match self.registry.get_mut(id) {
                    // Closed or closing mid-fan-out: skipped, earlier
                    // invocations stand.
                    Some(conn) if !conn.state().is_terminal() => {
                        (pending.job.callback)(Some(conn), &pending.job.payload);
                    }
                    _ => {}
                }
            }

            (pending.job.callback)(None, &pending.job.payload);
            pending.complete();
        }
    }

    /// Remove connections that entered Closing outside the read path (e.g.
    /// a send failure inside a job callback).
    fn sweep_closing(&mut self) {
        for id in self.registry.closing_ids() {
            self.close_connection(id, None);
        }
    }

    fn close_connection(&mut self, id: ConnId, reason: Option<String>) {
        if let Some(mut conn) = self.registry.remove(id) {
            if let Some(stream) = conn.stream_mut() {
                let _ = self.poll.registry().deregister(stream);
            }
            let peer_addr = conn.peer_addr();
            log::info!(
                "[WS-REACTOR] connection closed {} peer={} reason={:?}",
                id,
                peer_addr,
                reason
            );
            let _ = self.event_tx.send(ReactorEvent::ConnectionClosed {
                id,
                peer_addr,
                reason,
            });
        }
    }

    fn shutdown_cleanup(&mut self) {
        // Release blocked submitters before tearing down connections.
        self.mailbox.close();

        for mut conn in self.registry.drain_all() {
            if let Some(stream) = conn.stream_mut() {
                let _ = self.poll.registry().deregister(stream);
            }
            let _ = self.event_tx.send(ReactorEvent::ConnectionClosed {
                id: conn.id(),
                peer_addr: conn.peer_addr(),
                reason: Some("reactor shutdown".to_string()),
            });
        }

        let _ = self.event_tx.send(ReactorEvent::Stopped);
        log::info!("[WS-REACTOR] stopped");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost_config() -> Config {
        Config {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn test_reactor_creation() {
        let (reactor, handle) = Reactor::new(localhost_config()).unwrap();
        assert_ne!(handle.local_addr().port(), 0);
        assert!(reactor.registry.is_empty());
        assert_eq!(reactor.next_token, CONNECTION_TOKEN_START);
    }

    #[test]
    fn test_spawn_and_shutdown() {
        let mut handle = Reactor::spawn(localhost_config()).unwrap();
        assert!(handle.is_running());

        let started = handle.recv_event_timeout(Duration::from_secs(5));
        assert!(matches!(started, Some(ReactorEvent::Started { .. })));

        handle.shutdown().unwrap();
        assert!(!handle.is_running());
        // Mailbox is closed once the loop exits.
        let result = handle
            .mailbox()
            .submit(crate::mailbox::Job::new(vec![], |_, _| {}), None);
        assert_eq!(result, Err(crate::error::MailboxError::Shutdown));
    }

    #[test]
    fn test_constants() {
        assert_eq!(LISTENER_TOKEN, Token(0));
        assert_eq!(WAKER_TOKEN, Token(1));
        assert_eq!(CONNECTION_TOKEN_START, 2);
        assert_eq!(FRAME_REPLY, "ws_frame_reply");
    }

    #[test]
    fn test_event_debug() {
        let event = ReactorEvent::FrameReceived {
            id: ConnId(2),
            payload: b"hello".to_vec(),
        };
        let _ = format!("{:?}", event);

        let event = ReactorEvent::Error {
            id: None,
            error: "poll error".to_string(),
        };
        let _ = format!("{:?}", event);
    }
}
