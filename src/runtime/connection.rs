//! Client connections and the registry that owns them.
//!
//! Each connection pairs a non-blocking stream with a stable id. The
//! registry hands out slab keys that double as notifier tokens.

use crate::runtime::buffer::ReadBuffer;
use mio::net::TcpStream;
use mio::Token;
use slab::Slab;
use std::fmt;
use std::io::{self, Read};
use std::net::SocketAddr;
use thiserror::Error;

/// Stable identity of a connection, assigned at accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result of a non-blocking accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// A connection was accepted and registered.
    Accepted(ConnectionId),
    /// Accepted, then dropped (limit reached or registration refused).
    Rejected(SocketAddr),
    /// The backlog produced an aborted connection; nothing to do.
    Skipped,
    /// Nothing waiting despite the readiness signal.
    Empty,
    /// Out of descriptors or memory; accepting resumes next turn.
    Exhausted,
}

/// Result of one read into a connection's buffer.
#[derive(Debug)]
pub enum ReadOutcome {
    /// `n > 0` bytes are in the buffer.
    Data(usize),
    /// No data yet; the connection stays registered.
    WouldBlock,
    /// The peer closed its side.
    Closed,
    /// Any other I/O fault.
    Failed(ConnectionError),
}

/// I/O fault on an established connection.
#[derive(Debug, Error)]
#[error("connection {id} ({peer}) failed: {source}")]
pub struct ConnectionError {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    #[source]
    pub source: io::Error,
}

/// A single accepted client.
#[derive(Debug)]
pub struct ClientConnection {
    id: ConnectionId,
    peer: SocketAddr,
    pub(crate) stream: TcpStream,
}

impl ClientConnection {
    pub fn new(id: ConnectionId, peer: SocketAddr, stream: TcpStream) -> Self {
        Self { id, peer, stream }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Reset `buf` and perform one non-blocking read into it.
    pub fn read_into(&mut self, buf: &mut ReadBuffer) -> ReadOutcome {
        buf.reset();
        loop {
            match self.stream.read(buf.unfilled_mut()) {
                Ok(0) => return ReadOutcome::Closed,
                Ok(n) => {
                    buf.advance(n);
                    return ReadOutcome::Data(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return ReadOutcome::WouldBlock
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(source) => {
                    return ReadOutcome::Failed(ConnectionError {
                        id: self.id,
                        peer: self.peer,
                        source,
                    })
                }
            }
        }
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry {
    connections: Slab<ClientConnection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` (dropping the connection) if the registry is at capacity.
    pub fn insert(&mut self, conn: ClientConnection) -> Option<Token> {
        if self.is_full() {
            return None;
        }
        Some(Token(self.connections.insert(conn)))
    }

    #[cfg(test)]
    pub fn get(&self, token: Token) -> Option<&ClientConnection> {
        self.connections.get(token.0)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut ClientConnection> {
        self.connections.get_mut(token.0)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, token: Token) -> Option<ClientConnection> {
        self.connections.try_remove(token.0)
    }

    #[cfg(test)]
    pub fn contains(&self, token: Token) -> bool {
        self.connections.contains(token.0)
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Tokens of all active connections.
    pub fn tokens(&self) -> Vec<Token> {
        self.connections.iter().map(|(key, _)| Token(key)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{Shutdown, TcpListener};

    /// A connected (server side, client side) pair over loopback.
    fn pair() -> (ClientConnection, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let conn = ClientConnection::new(ConnectionId(1), peer, TcpStream::from_std(server));
        (conn, client)
    }

    /// Read until something other than WouldBlock happens.
    fn read_ready(conn: &mut ClientConnection, buf: &mut ReadBuffer) -> ReadOutcome {
        for _ in 0..200 {
            match conn.read_into(buf) {
                ReadOutcome::WouldBlock => std::thread::sleep(std::time::Duration::from_millis(10)),
                other => return other,
            }
        }
        panic!("connection never became readable");
    }

    #[test]
    fn test_read_into_resets_buffer() {
        let (mut conn, mut client) = pair();
        let mut buf = ReadBuffer::new(16);

        assert!(matches!(conn.read_into(&mut buf), ReadOutcome::WouldBlock));

        client.write_all(b"first message").unwrap();
        assert!(matches!(read_ready(&mut conn, &mut buf), ReadOutcome::Data(13)));
        assert_eq!(buf.filled(), b"first message");

        client.write_all(b"two").unwrap();
        assert!(matches!(read_ready(&mut conn, &mut buf), ReadOutcome::Data(3)));
        assert_eq!(buf.filled(), b"two");
    }

    #[test]
    fn test_read_into_reports_close() {
        let (mut conn, client) = pair();
        let mut buf = ReadBuffer::new(16);

        client.shutdown(Shutdown::Write).unwrap();
        assert!(matches!(read_ready(&mut conn, &mut buf), ReadOutcome::Closed));
        assert_eq!(conn.id(), ConnectionId(1));
        assert_eq!(conn.peer(), client.local_addr().unwrap());
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new(2);

        let (c1, _k1) = pair();
        let (c2, _k2) = pair();
        let (c3, _k3) = pair();

        let t1 = registry.insert(c1).unwrap();
        let t2 = registry.insert(c2).unwrap();

        // At capacity
        assert!(registry.is_full());
        assert!(registry.insert(c3).is_none());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.tokens(), vec![t1, t2]);
        assert_eq!(registry.get(t1).unwrap().id(), ConnectionId(1));

        registry.remove(t1);
        assert!(!registry.contains(t1));
        assert!(registry.remove(t1).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.get_mut(t2).is_some());
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId(42).to_string(), "#42");
    }
}
