//! HTTP surface for the review pipeline.
//!
//! The router is composable: `review_router()` returns a `Router` that can
//! be mounted on any axum server instance. `handle_invocation` is the single
//! entry point the routes delegate to.

pub mod error;
pub mod router;
pub mod server;
pub mod types;

pub use router::review_router;
pub use server::{start_server, ReviewServer, ServerSession};
pub use types::{handle_invocation, ApiContext, InvocationEvent, InvocationResponse};
