//! JSON-lines request/response protocol spoken over stdin/stdout.
//!
//! Success: `{"id", "ok": true, "result"}`.
//! Failure: `{"id", "ok": false, "error": {"code", "message", "details"?}}`.

mod error;
mod handlers;
mod helpers;
mod router;
mod types;

pub use error::err;
pub use router::handle_request;
pub use types::{AppState, Request};
