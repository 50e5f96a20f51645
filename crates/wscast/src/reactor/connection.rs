// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! WebSocket connection state machine.
//!
//! Wraps a non-blocking [`mio::net::TcpStream`] behind tungstenite's server
//! handshake and frame protocol:
//! - Connection state machine (Connecting -> HandshakeDone -> Closing -> Closed)
//! - Handshake retained across WouldBlock (`MidHandshake`)
//! - Typed peer classification instead of an untyped user-data tag
//!
//! # State Machine
//!
//! ```text
//!      +-----------+
//!      | Connecting|--(upgrade failure)--> Closing
//!      +-----+-----+
//!            | upgrade complete
//!            v
//!      +-------------+
//!      |HandshakeDone|--(error/EOF/close frame)--> Closing
//!      +-----+-------+
//!            | removed by reactor
//!            v
//!      +-----------+
//!      |  Closed   |
//!      +-----------+
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::Sender;

use mio::net::TcpStream;
use tungstenite::handshake::server::{Callback, ErrorResponse, Request, Response, ServerHandshake};
use tungstenite::handshake::MidHandshake;
use tungstenite::protocol::WebSocketConfig;
use tungstenite::{Error as WsError, HandshakeError, Message, WebSocket};

use super::ReactorEvent;

// ============================================================================
// Identity and classification
// ============================================================================

/// Opaque connection handle, unique for the connection's lifetime.
///
/// The raw value doubles as the connection's mio token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub(crate) u64);

impl ConnId {
    /// Raw numeric value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Connection state machine states.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// TCP accepted, WebSocket upgrade in progress
    #[default]
    Connecting,

    /// Upgrade complete, frames can flow
    HandshakeDone,

    /// Disconnect or error observed, pending removal by the reactor
    Closing,

    /// Connection terminated
    Closed,
}

impl ConnState {
    /// Check if the connection can send/receive frames.
    pub fn is_operational(&self) -> bool {
        matches!(self, ConnState::HandshakeDone)
    }

    /// Check if the connection is shutting down or gone.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnState::Closing | ConnState::Closed)
    }
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnState::Connecting => "Connecting",
            ConnState::HandshakeDone => "HandshakeDone",
            ConnState::Closing => "Closing",
            ConnState::Closed => "Closed",
        };
        write!(f, "{}", s)
    }
}

/// Peer classification, set on handshake completion.
///
/// Replaces the untyped "user_data == 1" convention: broadcast sends only go
/// to confirmed peers, everything else gets a no-op invocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PeerClass {
    /// Not yet classified (handshake not complete)
    #[default]
    Unclassified,

    /// Upgrade completed, confirmed WebSocket peer
    Confirmed,
}

// ============================================================================
// Handshake observer
// ============================================================================

/// Surfaces the HTTP upgrade request to the reactor's event channel before
/// tungstenite answers it.
pub(crate) struct UpgradeObserver {
    pub(crate) id: ConnId,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) event_tx: Sender<ReactorEvent>,
}

impl Callback for UpgradeObserver {
    fn on_request(self, request: &Request, response: Response) -> Result<Response, ErrorResponse> {
        log::info!(
            "[WS-REACTOR] ws handshake request {} peer={} path={}",
            self.id,
            self.peer_addr,
            request.uri().path()
        );
        let _ = self.event_tx.send(ReactorEvent::HandshakeRequest {
            id: self.id,
            peer_addr: self.peer_addr,
        });
        Ok(response)
    }
}

type ServerMidHandshake = MidHandshake<ServerHandshake<TcpStream, UpgradeObserver>>;

enum Transport {
    /// Upgrade in progress; the slot is taken while the handshake is driven.
    Handshaking(Option<ServerMidHandshake>),
    /// Upgrade complete
    Open(WebSocket<TcpStream>),
    /// Stream gone (upgrade failed before a MidHandshake existed)
    Detached,
}

/// Progress of one handshake-driving step.
pub(crate) enum HandshakeProgress {
    /// Still waiting on I/O
    Pending,
    /// Upgrade complete; caller transitions the connection state
    Done,
    /// Upgrade failed
    Failed(WsError),
}

/// Outcome of one frame-read step.
pub(crate) enum ReadOutcome {
    /// One data frame received
    Frame(Vec<u8>),
    /// No more data available
    Pending,
    /// Peer closed or transport error
    Closed(Option<String>),
}

// ============================================================================
// Connection
// ============================================================================

/// One live WebSocket endpoint, owned and mutated only by the reactor thread.
///
/// Job callbacks receive `&mut WsConnection` and may call [`send_text`]
/// on it; they must not block.
///
/// [`send_text`]: WsConnection::send_text
pub struct WsConnection {
    id: ConnId,
    peer_addr: SocketAddr,
    state: ConnState,
    peer: PeerClass,
    transport: Transport,
}

impl WsConnection {
    /// Start the server handshake on a freshly accepted stream.
    ///
    /// The stream is non-blocking, so the upgrade usually parks in
    /// `Handshaking` until the client request arrives.
    pub(crate) fn accept(
        id: ConnId,
        peer_addr: SocketAddr,
        stream: TcpStream,
        event_tx: Sender<ReactorEvent>,
        max_frame_size: usize,
    ) -> Self {
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(max_frame_size))
            .max_frame_size(Some(max_frame_size));
        let observer = UpgradeObserver {
            id,
            peer_addr,
            event_tx,
        };

        let (state, transport) =
            match tungstenite::accept_hdr_with_config(stream, observer, Some(ws_config)) {
                Ok(ws) => (ConnState::Connecting, Transport::Open(ws)),
                Err(HandshakeError::Interrupted(mid)) => {
                    (ConnState::Connecting, Transport::Handshaking(Some(mid)))
                }
                Err(HandshakeError::Failure(e)) => {
                    log::warn!("[WS-REACTOR] {} upgrade failed on accept: {}", id, e);
                    (ConnState::Closing, Transport::Detached)
                }
            };

        Self {
            id,
            peer_addr,
            state,
            peer: PeerClass::Unclassified,
            transport,
        }
    }

    /// Connection handle.
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Remote peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Peer classification.
    ///
    /// The tag is meaningless before the upgrade completes, so this reports
    /// `Unclassified` for any state other than HandshakeDone.
    pub fn peer_class(&self) -> PeerClass {
        match self.state {
            ConnState::HandshakeDone => self.peer,
            _ => PeerClass::Unclassified,
        }
    }

    /// Whether broadcast sends should target this connection.
    pub fn is_confirmed_peer(&self) -> bool {
        self.peer_class() == PeerClass::Confirmed
    }

    pub(crate) fn set_state(&mut self, state: ConnState) {
        self.state = state;
    }

    pub(crate) fn set_peer(&mut self, peer: PeerClass) {
        self.peer = peer;
    }

    /// Drive the pending upgrade one step.
    pub(crate) fn drive_handshake(&mut self) -> HandshakeProgress {
        match &mut self.transport {
            Transport::Open(_) => HandshakeProgress::Done,
            Transport::Detached => HandshakeProgress::Pending,
            Transport::Handshaking(slot) => {
                let mid = match slot.take() {
                    Some(mid) => mid,
                    None => return HandshakeProgress::Pending,
                };
                match mid.handshake() {
                    Ok(ws) => {
                        self.transport = Transport::Open(ws);
                        HandshakeProgress::Done
                    }
                    Err(HandshakeError::Interrupted(mid)) => {
                        *slot = Some(mid);
                        HandshakeProgress::Pending
                    }
                    Err(HandshakeError::Failure(e)) => {
                        self.state = ConnState::Closing;
                        self.transport = Transport::Detached;
                        HandshakeProgress::Failed(e)
                    }
                }
            }
        }
    }

    /// Read one data frame, if available.
    ///
    /// Control frames (ping/pong) are consumed internally by tungstenite and
    /// skipped here.
    pub(crate) fn read_frame(&mut self) -> ReadOutcome {
        let ws = match &mut self.transport {
            Transport::Open(ws) => ws,
            _ => return ReadOutcome::Pending,
        };

        loop {
            match ws.read() {
                Ok(msg @ (Message::Text(_) | Message::Binary(_))) => {
                    return ReadOutcome::Frame(msg.into_data().to_vec());
                }
                Ok(Message::Close(frame)) => {
                    self.state = ConnState::Closing;
                    return ReadOutcome::Closed(frame.map(|f| f.reason.as_str().to_owned()));
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
                Err(WsError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    return ReadOutcome::Pending;
                }
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                    self.state = ConnState::Closing;
                    return ReadOutcome::Closed(None);
                }
                Err(e) => {
                    self.state = ConnState::Closing;
                    return ReadOutcome::Closed(Some(e.to_string()));
                }
            }
        }
    }

    /// Send a text frame on this connection.
    ///
    /// A send that would block is queued by the protocol layer and flushed
    /// on the next writable event; that counts as success here. Fatal
    /// transport errors mark the connection Closing so the reactor sweeps it
    /// after the current drain.
    pub fn send_text(&mut self, text: &str) -> Result<(), WsError> {
        let ws = match &mut self.transport {
            Transport::Open(ws) => ws,
            _ => return Err(WsError::AlreadyClosed),
        };

        match ws.send(Message::text(text)) {
            Ok(()) => Ok(()),
            Err(WsError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => {
                self.state = ConnState::Closing;
                Err(e)
            }
        }
    }

    /// Flush frames queued by earlier would-block sends.
    pub(crate) fn flush(&mut self) {
        if let Transport::Open(ws) = &mut self.transport {
            match ws.flush() {
                Ok(()) => {}
                Err(WsError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => self.state = ConnState::Closing,
            }
        }
    }

    /// Access the underlying stream for poll deregistration.
    pub(crate) fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        match &mut self.transport {
            Transport::Handshaking(Some(mid)) => Some(mid.get_mut().get_mut()),
            Transport::Open(ws) => Some(ws.get_mut()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state)
            .field("peer", &self.peer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_state_predicates() {
        assert!(ConnState::HandshakeDone.is_operational());
        assert!(!ConnState::Connecting.is_operational());
        assert!(ConnState::Closing.is_terminal());
        assert!(ConnState::Closed.is_terminal());
        assert!(!ConnState::HandshakeDone.is_terminal());
    }

    #[test]
    fn test_conn_state_display() {
        assert_eq!(ConnState::Connecting.to_string(), "Connecting");
        assert_eq!(ConnState::HandshakeDone.to_string(), "HandshakeDone");
    }

    #[test]
    fn test_conn_id_display() {
        assert_eq!(ConnId(7).to_string(), "conn#7");
        assert_eq!(ConnId(7).raw(), 7);
    }

    #[test]
    fn test_peer_class_default_unclassified() {
        assert_eq!(PeerClass::default(), PeerClass::Unclassified);
    }
}
