use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

type TryHandle = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

/// Each family claims the methods it knows and passes on the rest.
const HANDLER_FAMILIES: &[TryHandle] = &[
    handlers::core::try_handle,
    handlers::classes::try_handle,
    handlers::students::try_handle,
    handlers::schemas::try_handle,
    handlers::scores::try_handle,
    handlers::results::try_handle,
    handlers::settings::try_handle,
    handlers::backup::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    for try_handle in HANDLER_FAMILIES {
        if let Some(resp) = try_handle(state, &req) {
            return resp;
        }
    }

    tracing::warn!(method = %req.method, "unknown method");
    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
