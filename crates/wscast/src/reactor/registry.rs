// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registry of live connections.
//!
//! Owned exclusively by the reactor; every mutating operation runs on the
//! reactor thread, so no locking is involved. [`snapshot`] freezes the
//! fan-out set for one job: connections closing mid-iteration are skipped
//! by the id lookup without invalidating invocations already made.
//!
//! [`snapshot`]: ConnectionRegistry::snapshot

use std::collections::HashMap;
use std::net::SocketAddr;

use super::connection::{ConnId, ConnState, PeerClass, WsConnection};

/// Insertion-ordered set of live connections keyed by [`ConnId`].
#[derive(Default)]
pub struct ConnectionRegistry {
    conns: HashMap<ConnId, WsConnection>,
    order: Vec<ConnId>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a newly accepted connection (state Connecting).
    pub fn add(&mut self, conn: WsConnection) {
        let id = conn.id();
        debug_assert!(!self.conns.contains_key(&id), "connection id reused");
        self.order.push(id);
        self.conns.insert(id, conn);
    }

    /// Look up a live connection.
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut WsConnection> {
        self.conns.get_mut(&id)
    }

    /// Transition a connection to HandshakeDone and classify the peer as
    /// confirmed. Returns the peer address for event reporting.
    pub fn mark_handshake_done(&mut self, id: ConnId) -> Option<SocketAddr> {
        let conn = self.conns.get_mut(&id)?;
        conn.set_state(ConnState::HandshakeDone);
        conn.set_peer(PeerClass::Confirmed);
        Some(conn.peer_addr())
    }

    /// Remove a connection (Closing -> Closed).
    pub fn remove(&mut self, id: ConnId) -> Option<WsConnection> {
        let mut conn = self.conns.remove(&id)?;
        self.order.retain(|other| *other != id);
        conn.set_state(ConnState::Closed);
        Some(conn)
    }

    /// Ordered ids of all live connections, frozen for one fan-out.
    pub fn snapshot(&self) -> Vec<ConnId> {
        self.order.clone()
    }

    /// Ids of connections that entered Closing since the last sweep.
    pub fn closing_ids(&self) -> Vec<ConnId> {
        self.order
            .iter()
            .filter(|id| {
                self.conns
                    .get(id)
                    .is_some_and(|conn| conn.state().is_terminal())
            })
            .copied()
            .collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Remove every connection, in insertion order. Used at shutdown.
    pub fn drain_all(&mut self) -> Vec<WsConnection> {
        let ids = std::mem::take(&mut self.order);
        ids.into_iter()
            .filter_map(|id| {
                let mut conn = self.conns.remove(&id)?;
                conn.set_state(ConnState::Closed);
                Some(conn)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpStream;
    use std::sync::mpsc::channel;

    /// Build a real Connecting-state connection over a loopback socket pair.
    /// The client end is returned so the server side does not see EOF.
    fn test_conn(id: u64) -> (WsConnection, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, peer_addr) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let (event_tx, _event_rx) = channel();
        let conn = WsConnection::accept(
            ConnId(id),
            peer_addr,
            TcpStream::from_std(server),
            event_tx,
            64 * 1024,
        );
        (conn, client)
    }

    #[test]
    fn test_add_and_snapshot_order() {
        let mut registry = ConnectionRegistry::new();
        let mut keep = Vec::new();
        for id in [2u64, 3, 4] {
            let (conn, client) = test_conn(id);
            registry.add(conn);
            keep.push(client);
        }

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.snapshot(), vec![ConnId(2), ConnId(3), ConnId(4)]);
    }

    #[test]
    fn test_remove_preserves_order() {
        let mut registry = ConnectionRegistry::new();
        let mut keep = Vec::new();
        for id in [2u64, 3, 4] {
            let (conn, client) = test_conn(id);
            registry.add(conn);
            keep.push(client);
        }

        let removed = registry.remove(ConnId(3)).expect("present");
        assert_eq!(removed.state(), ConnState::Closed);
        assert_eq!(registry.snapshot(), vec![ConnId(2), ConnId(4)]);
        assert!(registry.remove(ConnId(3)).is_none());
    }

    #[test]
    fn test_mark_handshake_done_sets_classification() {
        let mut registry = ConnectionRegistry::new();
        let (conn, _keep) = test_conn(2);
        registry.add(conn);

        let conn = registry.get_mut(ConnId(2)).unwrap();
        assert_eq!(conn.state(), ConnState::Connecting);
        assert!(!conn.is_confirmed_peer());

        assert!(registry.mark_handshake_done(ConnId(2)).is_some());
        let conn = registry.get_mut(ConnId(2)).unwrap();
        assert_eq!(conn.state(), ConnState::HandshakeDone);
        assert!(conn.is_confirmed_peer());
    }

    #[test]
    fn test_peer_class_hidden_before_handshake() {
        let mut registry = ConnectionRegistry::new();
        let (conn, _keep) = test_conn(2);
        registry.add(conn);

        // Even a (mistakenly) set tag stays invisible until HandshakeDone.
        let conn = registry.get_mut(ConnId(2)).unwrap();
        conn.set_peer(PeerClass::Confirmed);
        assert_eq!(conn.peer_class(), PeerClass::Unclassified);
        assert!(!conn.is_confirmed_peer());
    }

    #[test]
    fn test_drain_all_empties_registry() {
        let mut registry = ConnectionRegistry::new();
        let mut keep = Vec::new();
        for id in [2u64, 3] {
            let (conn, client) = test_conn(id);
            registry.add(conn);
            keep.push(client);
        }

        let drained = registry.drain_all();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
        assert!(registry.snapshot().is_empty());
    }
}
