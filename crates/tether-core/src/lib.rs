//! # tether-core
//!
//! Foundation types shared by every tether crate:
//!
//! - [`ids::ConnectionId`]: opaque, collision-resistant connection identifier
//! - [`errors`]: transport, application-state and handler error types
//! - [`logging`]: `tracing` subscriber installation

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;

pub use errors::{HandlerError, StateError, TransportError};
pub use ids::ConnectionId;
