//! Application-level handling of received bytes.
//!
//! The dispatcher calls into a [`Handler`] for every chunk it reads. Bytes
//! are opaque: there is no framing, and a chunk is never longer than the
//! connection's buffer capacity.

use crate::runtime::ConnectionId;
use std::net::SocketAddr;
use tracing::info;

/// Callbacks driven by the dispatcher thread.
pub trait Handler {
    /// A new connection was accepted and registered.
    fn on_connect(&mut self, _conn: ConnectionId, _peer: SocketAddr) {}

    /// `data` was read from `conn`. The slice is only valid for this call.
    fn on_data(&mut self, conn: ConnectionId, data: &[u8]);

    /// The connection was closed and deregistered.
    fn on_close(&mut self, _conn: ConnectionId) {}
}

/// Decodes received bytes as text and logs them.
#[derive(Debug, Default)]
pub struct ConsoleHandler {
    messages: u64,
}

impl ConsoleHandler {
    /// Number of chunks surfaced so far.
    pub fn messages(&self) -> u64 {
        self.messages
    }
}

impl Handler for ConsoleHandler {
    fn on_connect(&mut self, conn: ConnectionId, peer: SocketAddr) {
        info!(conn = %conn, peer = %peer, "Client connected");
    }

    fn on_data(&mut self, conn: ConnectionId, data: &[u8]) {
        self.messages += 1;
        let text = String::from_utf8_lossy(data);
        info!(conn = %conn, bytes = data.len(), "from client: {}", text);
    }

    fn on_close(&mut self, conn: ConnectionId) {
        info!(conn = %conn, "Client disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_handler_counts() {
        let mut handler = ConsoleHandler::default();
        handler.on_connect(ConnectionId(1), "127.0.0.1:1".parse().unwrap());
        handler.on_data(ConnectionId(1), b"HELLO, NETTY");
        handler.on_data(ConnectionId(1), &[0xff, 0xfe]);
        handler.on_close(ConnectionId(1));
        assert_eq!(handler.messages(), 2);
    }
}
