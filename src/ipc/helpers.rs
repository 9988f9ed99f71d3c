use crate::calc::AssessmentSchema;
use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn require_schema(conn: &Connection, schema_id: &str) -> Result<AssessmentSchema, HandlerErr> {
    db::load_schema(conn, schema_id)
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::new("not_found", "schema not found"))
}

/// Required, trimmed, non-empty string parameter.
pub fn required_str(req: &Request, key: &str) -> Result<String, HandlerErr> {
    match req.params.get(key).and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(HandlerErr::new("bad_params", format!("missing {}", key))),
    }
}

pub fn optional_trimmed(v: Option<&serde_json::Value>) -> Option<String> {
    v.and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
