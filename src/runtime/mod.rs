//! Readiness-based runtime.
//!
//! - `Notifier`: registration table over mio (epoll on Linux, kqueue on macOS)
//! - `Dispatcher`: the single-threaded accept/read loop
//! - `ReadBuffer`/`BufferPool`: fixed-capacity per-connection buffers
//! - `ConnectionRegistry`: slab of live connections keyed by token

mod buffer;
mod connection;
mod dispatcher;
mod notifier;

pub use buffer::{BufferPool, ReadBuffer};
pub use connection::{
    AcceptOutcome, ClientConnection, ConnectionError, ConnectionId, ConnectionRegistry,
    ReadOutcome,
};
pub use dispatcher::{Dispatcher, ServerError, ShutdownHandle, Stats, LISTENER_TOKEN};
pub use notifier::{
    Interests, Notifier, NotifierError, ReadyEvent, RegistrationError, Timeout,
};
