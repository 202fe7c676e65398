//! # tether-server
//!
//! Lifecycle management for many concurrent, long-lived duplex connections.
//!
//! - [`transport`]: the boundary to the wire layer (axum WebSocket adapter and
//!   an in-memory channel transport)
//! - [`registry::ConnectionRegistry`]: concurrent id → [`connection::Connection`] map
//! - [`hub::Hub`] and [`dispatcher::Dispatcher`]: send/broadcast/query operations and
//!   isolated invocation of the application's [`handler::SocketHandler`]
//! - [`session`]: the per-connection authorize → register → receive → disconnect loop
//! - [`reaper::Reaper`]: periodic sweep that tears down connections whose transport died
//! - [`server::TetherServer`]: axum router, listener, and graceful shutdown

#![deny(unsafe_code)]

pub mod connection;
pub mod dispatcher;
pub mod handler;
pub mod health;
pub mod hub;
pub mod metrics;
pub mod reaper;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod transport;

#[cfg(test)]
mod testing;

pub use connection::Connection;
pub use dispatcher::{DisconnectReason, Dispatcher};
pub use handler::{SocketHandler, UpgradeRequest};
pub use hub::{BroadcastReport, Hub};
pub use reaper::Reaper;
pub use registry::ConnectionRegistry;
pub use server::{ServerHandle, TetherServer};
pub use shutdown::ShutdownCoordinator;
pub use session::{LoopState, SessionOutcome, run_authorized, serve};
pub use tether_core::{ConnectionId, HandlerError, StateError, TransportError};
pub use transport::{CloseReason, Incoming, TransportHandle, TransportState};
