//! ready-echo: a single-threaded readiness-driven TCP server
//!
//! One thread multiplexes a listening socket and every client connection:
//! - a readiness notifier reports which sockets can be accepted or read
//! - the dispatcher accepts, reads into a fixed-size buffer per connection,
//!   and hands each chunk to a `Handler`
//! - a small client sends test traffic
//!
//! Configuration comes from CLI arguments or a TOML file.

pub mod client;
pub mod config;
pub mod handler;
pub mod runtime;
