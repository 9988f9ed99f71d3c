use crate::db;
use crate::grading::{GradingConfig, SETTINGS_KEY};
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{require_db, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

pub fn load_grading(conn: &Connection) -> Result<GradingConfig, HandlerErr> {
    let saved = db::settings_get_json(conn, SETTINGS_KEY).map_err(HandlerErr::query)?;
    Ok(GradingConfig::from_stored(saved.as_ref()))
}

fn settings_get(state: &AppState, _req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let grading = load_grading(conn)?;
    Ok(json!({ "grading": grading.to_json() }))
}

fn settings_update(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let section = required_str(req, "section")?;
    if section != SETTINGS_KEY {
        return Err(HandlerErr::new(
            "bad_params",
            format!("unknown settings section: {}", section),
        ));
    }
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::new("bad_params", "patch must be an object"));
    };

    let mut grading = load_grading(conn)?;
    grading
        .apply_patch(patch)
        .map_err(|e| HandlerErr::new("bad_params", e))?;
    let value = grading.to_json();
    db::settings_set_json(conn, SETTINGS_KEY, &value)
        .map_err(|e| HandlerErr::update("settings", e))?;
    tracing::info!(section = %section, "settings updated");

    Ok(json!({ "ok": true, "grading": value }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let res = match req.method.as_str() {
        "settings.get" => settings_get(state, req),
        "settings.update" => settings_update(state, req),
        _ => return None,
    };
    Some(match res {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
