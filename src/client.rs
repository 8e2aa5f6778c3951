//! Test-traffic client.
//!
//! Connects without blocking, polls until the connect completes, and
//! writes one message. Only used to exercise the server.

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::debug;

const CLIENT: Token = Token(0);

/// How often the connect loop wakes up while the handshake is in flight.
const CONNECT_TICK: Duration = Duration::from_millis(100);

pub struct Client {
    stream: TcpStream,
    poll: Poll,
    events: Events,
    peer: SocketAddr,
    timeout: Duration,
}

impl Client {
    /// Connect to `addr`, giving up after `timeout`.
    pub fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<Self> {
        let mut stream = TcpStream::connect(addr)?;
        let mut poll = Poll::new()?;
        let mut events = Events::with_capacity(8);
        poll.registry()
            .register(&mut stream, CLIENT, Interest::WRITABLE)?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?;

            match poll.poll(&mut events, Some(remaining.min(CONNECT_TICK))) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            if events.is_empty() {
                // Handshake still in flight; nothing here blocks on it
                debug!(addr = %addr, "Connect in progress, free to do other work");
                continue;
            }

            if let Some(e) = stream.take_error()? {
                return Err(e);
            }
            match stream.peer_addr() {
                Ok(peer) => {
                    debug!(peer = %peer, "Connected");
                    return Ok(Self {
                        stream,
                        poll,
                        events,
                        peer,
                        timeout,
                    });
                }
                Err(ref e) if e.kind() == io::ErrorKind::NotConnected => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Write all of `msg`, waiting for writability when the socket is full.
    pub fn send(&mut self, msg: &[u8]) -> io::Result<()> {
        let mut written = 0;
        while written < msg.len() {
            match self.stream.write(&msg[written..]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => self.wait_writable()?,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        debug!(peer = %self.peer, bytes = written, "Message sent");
        Ok(())
    }

    fn wait_writable(&mut self) -> io::Result<()> {
        loop {
            match self.poll.poll(&mut self.events, Some(self.timeout)) {
                Ok(()) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if self.events.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out"));
        }
        Ok(())
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn test_connect_and_send() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = Client::connect(addr, Duration::from_secs(5)).unwrap();
        assert_eq!(client.peer_addr(), addr);
        client.send(b"HELLO, NETTY").unwrap();

        let (mut server, peer) = listener.accept().unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
        let mut buf = [0u8; 12];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"HELLO, NETTY");
    }

    #[test]
    fn test_send_larger_than_socket_buffer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = Client::connect(addr, Duration::from_secs(5)).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        // Big enough to fill the socket buffers and force waits for writability
        let message = vec![0x5au8; 8 * 1024 * 1024];
        let reader = std::thread::spawn(move || {
            let mut received = Vec::new();
            server.read_to_end(&mut received).unwrap();
            received.len()
        });

        client.send(&message).unwrap();
        drop(client);
        assert_eq!(reader.join().unwrap(), message.len());
    }

    #[test]
    fn test_connect_refused() {
        // Bind then drop to get a port with nothing listening
        let addr = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        assert!(Client::connect(addr, Duration::from_secs(5)).is_err());
    }
}
