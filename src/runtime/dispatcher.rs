//! Single-threaded accept/read loop.
//!
//! Readiness-based model: the notifier tells us when sockets are ready,
//! then we perform non-blocking accept/read syscalls. The only blocking
//! point is [`Notifier::wait`].
//!
//! mio readiness is edge-triggered, so an Acceptable event drains the
//! backlog and a Readable event reads until `WouldBlock`. Reads are capped
//! per turn by `read_budget`; a connection that hits the cap is serviced
//! again on the next turn, whose wait does not block.
//!
//! Running out of descriptors or memory in accept pauses accepting until the
//! next turn. The backlog is retried then even without a new Acceptable edge.

use crate::config::{Config, ConfigError};
use crate::handler::Handler;
use crate::runtime::buffer::{BufferPool, ReadBuffer};
use crate::runtime::connection::{
    AcceptOutcome, ClientConnection, ConnectionId, ConnectionRegistry, ReadOutcome,
};
use crate::runtime::notifier::{
    Interests, Notifier, NotifierError, ReadyEvent, RegistrationError, Timeout,
};
use mio::net::TcpListener;
use mio::{Token, Waker};
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Token of the listening socket.
pub const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Fatal dispatcher errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("listener failed: {0}")]
    Listener(#[source] io::Error),
    #[error(transparent)]
    Register(#[from] RegistrationError),
    #[error(transparent)]
    Notifier(#[from] NotifierError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// In-process counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub accepted: u64,
    pub rejected: u64,
    pub closed: u64,
    pub idle_ticks: u64,
    pub reads: u64,
    pub bytes_read: u64,
    pub connection_errors: u64,
}

/// Requests a cooperative stop of a running dispatcher.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Stop after the current batch and wake the dispatcher if it is waiting.
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake dispatcher");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// The raw flag, for setting from a signal handler.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }
}

/// Owns the listener, the notifier and every client connection.
pub struct Dispatcher<H> {
    listener: TcpListener,
    local_addr: SocketAddr,
    notifier: Notifier<ReadBuffer>,
    connections: ConnectionRegistry,
    buffers: BufferPool,
    handler: H,
    poll_timeout: Timeout,
    read_budget: usize,
    /// Connections that used up their read budget last turn.
    deferred: VecDeque<Token>,
    next_id: u64,
    /// Accept hit resource exhaustion; drain the backlog again next turn.
    retry_accept: bool,
    stats: Stats,
    shutdown: ShutdownHandle,
}

impl<H: Handler> Dispatcher<H> {
    /// Bind the listener and register it for Acceptable.
    pub fn bind(config: &Config, handler: H) -> Result<Self, ServerError> {
        let addr = config.addr()?;
        let mut notifier = Notifier::new(config.events_capacity)?;

        let listener = create_listener(addr, config.backlog)
            .map_err(|source| ServerError::Bind { addr, source })?;
        let mut listener = TcpListener::from_std(listener);
        let local_addr = listener.local_addr().map_err(ServerError::Listener)?;
        notifier.register(&mut listener, LISTENER_TOKEN, Interests::ACCEPTABLE, None)?;

        let waker = notifier.waker(WAKER_TOKEN)?;

        info!(
            addr = %local_addr,
            buffer_size = config.buffer_size,
            max_connections = config.max_connections,
            poll_timeout = ?config.poll_timeout,
            "Listening"
        );

        Ok(Self {
            listener,
            local_addr,
            notifier,
            connections: ConnectionRegistry::new(config.max_connections),
            buffers: BufferPool::new(config.max_connections.min(64), config.buffer_size),
            handler,
            poll_timeout: config.poll_timeout,
            read_budget: config.read_budget,
            deferred: VecDeque::new(),
            next_id: 0,
            retry_accept: false,
            stats: Stats::default(),
            shutdown: ShutdownHandle {
                flag: Arc::new(AtomicBool::new(false)),
                waker: Arc::new(waker),
            },
        })
    }

    /// Run until shut down, then close every connection and the listener.
    ///
    /// Returns the handler so callers can inspect what it saw.
    pub fn run(mut self) -> Result<H, ServerError> {
        let result = loop {
            if self.shutdown.is_shutdown() {
                break Ok(());
            }
            if let Err(e) = self.turn() {
                break Err(e);
            }
        };

        self.close_all();
        info!(
            accepted = self.stats.accepted,
            rejected = self.stats.rejected,
            closed = self.stats.closed,
            reads = self.stats.reads,
            bytes_read = self.stats.bytes_read,
            connection_errors = self.stats.connection_errors,
            "Dispatcher stopped"
        );
        result.map(|()| self.handler)
    }

    /// One Idle/Processing cycle. Returns the number of events processed.
    pub fn turn(&mut self) -> Result<usize, ServerError> {
        let timeout = if self.deferred.is_empty() {
            self.poll_timeout
        } else {
            Timeout::Immediate
        };

        let mut batch = self.notifier.wait(timeout)?;
        for token in self.deferred.drain(..) {
            if !batch.iter().any(|event| event.token == token) {
                batch.push(ReadyEvent::readable(token));
            }
        }
        // Last in the batch, so closes in this turn free descriptors first
        if std::mem::take(&mut self.retry_accept)
            && !batch.iter().any(|event| event.token == LISTENER_TOKEN)
        {
            batch.push(ReadyEvent {
                token: LISTENER_TOKEN,
                ready: Interests::ACCEPTABLE,
            });
        }

        if batch.is_empty() {
            self.stats.idle_ticks += 1;
            debug!(timeout = ?timeout, "No activity");
            return Ok(0);
        }

        let processed = batch.len();
        for event in batch {
            if event.token == LISTENER_TOKEN {
                if event.is_acceptable() {
                    self.accept_pending()?;
                }
            } else if event.is_readable() {
                self.service(event.token);
            }
        }
        Ok(processed)
    }

    /// Accept until the backlog is empty or accept runs out of resources.
    fn accept_pending(&mut self) -> Result<(), ServerError> {
        loop {
            match self.accept_one()? {
                AcceptOutcome::Empty | AcceptOutcome::Exhausted => return Ok(()),
                _ => continue,
            }
        }
    }

    /// Accept one connection and register it for Readable.
    pub fn accept_one(&mut self) -> Result<AcceptOutcome, ServerError> {
        // mio hands back streams already in non-blocking mode
        let (stream, peer) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(AcceptOutcome::Empty)
            }
            Err(e) => return self.accept_failed(e),
        };

        let id = ConnectionId(self.next_id);
        self.next_id += 1;

        let Some(token) = self
            .connections
            .insert(ClientConnection::new(id, peer, stream))
        else {
            warn!(peer = %peer, "Connection limit reached, dropping connection");
            self.stats.rejected += 1;
            return Ok(AcceptOutcome::Rejected(peer));
        };

        let buffer = self.buffers.alloc();
        let registered = match self.connections.get_mut(token) {
            Some(conn) => self.notifier.register(
                &mut conn.stream,
                token,
                Interests::READABLE,
                Some(buffer),
            ),
            None => return Ok(AcceptOutcome::Skipped),
        };
        if let Err(e) = registered {
            warn!(conn = %id, peer = %peer, error = %e, "Registration failed, dropping connection");
            self.connections.remove(token);
            self.stats.rejected += 1;
            return Ok(AcceptOutcome::Rejected(peer));
        }

        self.stats.accepted += 1;
        debug!(conn = %id, peer = %peer, token = token.0, "Accepted connection");
        self.handler.on_connect(id, peer);
        Ok(AcceptOutcome::Accepted(id))
    }

    /// Decide whether an accept failure concerns the listener or only
    /// the connection (or resources) at hand.
    fn accept_failed(&mut self, e: io::Error) -> Result<AcceptOutcome, ServerError> {
        match classify_accept_error(&e) {
            AcceptFailure::Transient => {
                debug!(error = %e, "Transient accept error");
                Ok(AcceptOutcome::Skipped)
            }
            AcceptFailure::Exhausted => {
                warn!(
                    error = %e,
                    open = self.connections.len(),
                    "Out of resources, pausing accept until next turn"
                );
                self.stats.rejected += 1;
                self.retry_accept = true;
                Ok(AcceptOutcome::Exhausted)
            }
            AcceptFailure::Fatal => Err(ServerError::Listener(e)),
        }
    }

    /// Read a ready connection until it would block, closes, or runs out of budget.
    fn service(&mut self, token: Token) {
        for _ in 0..self.read_budget {
            match self.read_one(token) {
                Some(ReadOutcome::Data(_)) => continue,
                Some(ReadOutcome::WouldBlock) | None => return,
                Some(ReadOutcome::Closed) => {
                    self.close(token);
                    return;
                }
                Some(ReadOutcome::Failed(e)) => {
                    warn!(conn = %e.id, peer = %e.peer, error = %e.source, "Connection error");
                    self.stats.connection_errors += 1;
                    self.close(token);
                    return;
                }
            }
        }
        trace!(token = token.0, "Read budget exhausted, deferring");
        self.deferred.push_back(token);
    }

    /// Perform one read on the connection behind `token` and hand any data
    /// to the handler. `None` if the token is not a live connection.
    pub fn read_one(&mut self, token: Token) -> Option<ReadOutcome> {
        let conn = self.connections.get_mut(token)?;
        let buffer = self.notifier.context_mut(token)?;

        let outcome = conn.read_into(buffer);
        if let ReadOutcome::Data(n) = outcome {
            self.stats.reads += 1;
            self.stats.bytes_read += n as u64;
            trace!(conn = %conn.id(), bytes = n, "Read");
            self.handler.on_data(conn.id(), buffer.filled());
        }
        Some(outcome)
    }

    /// Deregister, release the buffer, then drop the socket.
    fn close(&mut self, token: Token) {
        let Some(mut conn) = self.connections.remove(token) else {
            return;
        };
        if let Some(buffer) = self.notifier.deregister(&mut conn.stream, token) {
            self.buffers.release(buffer);
        }
        self.stats.closed += 1;
        debug!(conn = %conn.id(), peer = %conn.peer(), "Connection closed");
        self.handler.on_close(conn.id());
    }

    fn close_all(&mut self) {
        self.deferred.clear();
        for token in self.connections.tokens() {
            self.close(token);
        }
        self.notifier.deregister(&mut self.listener, LISTENER_TOKEN);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Number of open client connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.notifier.is_registered(token)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// Concerns one pending connection only.
    Transient,
    /// Out of descriptors, buffers or memory; retry later.
    Exhausted,
    /// The listener itself is broken.
    Fatal,
}

fn classify_accept_error(e: &io::Error) -> AcceptFailure {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted => AcceptFailure::Transient,
        io::ErrorKind::OutOfMemory => AcceptFailure::Exhausted,
        _ if e.raw_os_error().is_some_and(is_resource_exhaustion) => AcceptFailure::Exhausted,
        _ => AcceptFailure::Fatal,
    }
}

#[cfg(unix)]
fn is_resource_exhaustion(code: i32) -> bool {
    matches!(
        code,
        libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM
    )
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_code: i32) -> bool {
    false
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
