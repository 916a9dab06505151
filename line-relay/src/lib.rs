//! Line-oriented TCP broadcast relay.
//!
//! Every line a client sends is written back, newline-terminated, to every
//! client connected at that moment, the sender included. Modules:
//!
//! - [`relay`] accepts TCP connections and starts a session for each one.
//! - [`session`] runs a connection's inbound and outbound pumps.
//! - [`dispatcher`] owns the set of connected sessions and applies joins,
//!   leaves and broadcasts one at a time.
//! - [`line`] is the newline framing shared by the relay and the client.
//! - [`logging`] wires `tracing` to the console and a time-rotated log file.
//! - [`cli`], [`config`] and [`client`] cover the binary's two modes.
//!
//! The integration tests drive a real [`relay::Relay`] over loopback TCP.

pub mod cli;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod line;
pub mod logging;
pub mod relay;
pub mod session;
