use crate::calc::{AssessmentSchema, Component};
use crate::db;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{now_rfc3339, optional_trimmed, require_db, require_schema, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::Transaction;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

const SCORES_BULK_UPSERT_MAX_ENTRIES: usize = 5000;

/// A validated score entry. `None` fields leave stored values untouched;
/// `Some(None)` clears them.
struct ScoreEdit {
    student_id: String,
    component_id: String,
    raw_score: Option<Option<f64>>,
    comments: Option<Option<String>>,
    sub_scores: Vec<(String, f64)>,
}

struct EntryErr {
    code: &'static str,
    message: String,
    sub_criteria_id: Option<String>,
}

impl EntryErr {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            sub_criteria_id: None,
        }
    }
}

fn require_active(schema: &AssessmentSchema) -> Result<(), HandlerErr> {
    if schema.active {
        Ok(())
    } else {
        Err(HandlerErr::new(
            "schema_inactive",
            "score entry is closed for an inactive schema",
        )
        .with_details(json!({ "schemaId": schema.id })))
    }
}

fn check_range(value: f64, max: f64, what: &str) -> Result<f64, EntryErr> {
    if !value.is_finite() {
        return Err(EntryErr::new("bad_params", format!("{} must be a finite number", what)));
    }
    if value < 0.0 {
        return Err(EntryErr::new("negative_score", format!("{} must be >= 0", what)));
    }
    if value > max {
        return Err(EntryErr::new(
            "out_of_range",
            format!("{} {} exceeds max {}", what, value, max),
        ));
    }
    Ok(value)
}

fn parse_entry(
    entry: &serde_json::Value,
    roster: &HashSet<String>,
    components: &HashMap<&str, &Component>,
) -> Result<ScoreEdit, EntryErr> {
    let Some(obj) = entry.as_object() else {
        return Err(EntryErr::new("bad_params", "entry must be an object"));
    };
    let student_id = optional_trimmed(obj.get("studentId"))
        .ok_or_else(|| EntryErr::new("bad_params", "missing studentId"))?;
    let component_id = optional_trimmed(obj.get("componentId"))
        .ok_or_else(|| EntryErr::new("bad_params", "missing componentId"))?;

    if !roster.contains(&student_id) {
        return Err(EntryErr::new("unknown_student", "student is not in this class"));
    }
    let Some(component) = components.get(component_id.as_str()) else {
        return Err(EntryErr::new(
            "unknown_component",
            "component is not part of this schema",
        ));
    };

    let raw_score = match obj.get("rawScore") {
        None => None,
        Some(v) if v.is_null() => Some(None),
        Some(v) => {
            let Some(n) = v.as_f64() else {
                return Err(EntryErr::new("bad_params", "rawScore must be a number or null"));
            };
            Some(Some(check_range(n, component.raw_max(), "rawScore")?))
        }
    };

    let comments = match obj.get("comments") {
        None => None,
        Some(v) if v.is_null() || v.is_string() => Some(optional_trimmed(Some(v))),
        Some(_) => return Err(EntryErr::new("bad_params", "comments must be string or null")),
    };

    let mut sub_scores: Vec<(String, f64)> = Vec::new();
    if let Some(v) = obj.get("subScores") {
        let Some(arr) = v.as_array() else {
            return Err(EntryErr::new("bad_params", "subScores must be an array"));
        };
        if !arr.is_empty() && component.sub_criteria.is_empty() {
            return Err(EntryErr::new(
                "bad_params",
                "component has no sub-criteria",
            ));
        }
        for s in arr {
            let sub_id = optional_trimmed(s.get("subCriteriaId"))
                .ok_or_else(|| EntryErr::new("bad_params", "subScores[] missing subCriteriaId"))?;
            let Some(sc) = component.sub_criteria.iter().find(|sc| sc.id == sub_id) else {
                return Err(EntryErr {
                    sub_criteria_id: Some(sub_id),
                    ..EntryErr::new(
                        "unknown_sub_criteria",
                        "sub-criteria is not part of this component",
                    )
                });
            };
            let Some(n) = s.get("score").and_then(|v| v.as_f64()) else {
                return Err(EntryErr::new("bad_params", "subScores[].score must be a number"));
            };
            let score = check_range(n, sc.max_score, &format!("score for {}", sc.name)).map_err(
                |mut e| {
                    e.sub_criteria_id = Some(sub_id.clone());
                    e
                },
            )?;
            sub_scores.push((sub_id, score));
        }
    }

    if raw_score.is_none() && comments.is_none() && sub_scores.is_empty() {
        return Err(EntryErr::new(
            "empty_entry",
            "entry must set rawScore, subScores or comments",
        ));
    }

    Ok(ScoreEdit {
        student_id,
        component_id,
        raw_score,
        comments,
        sub_scores,
    })
}

fn write_entry(tx: &mut Transaction<'_>, schema_id: &str, edit: &ScoreEdit) -> rusqlite::Result<()> {
    let sp = tx.savepoint()?;
    sp.execute(
        "INSERT INTO component_scores(id, schema_id, component_id, student_id, raw_score, comments, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(component_id, student_id) DO UPDATE SET
           raw_score = CASE WHEN ?8 THEN excluded.raw_score ELSE component_scores.raw_score END,
           comments = CASE WHEN ?9 THEN excluded.comments ELSE component_scores.comments END,
           updated_at = excluded.updated_at",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            schema_id,
            edit.component_id,
            edit.student_id,
            edit.raw_score.flatten(),
            edit.comments.clone().flatten(),
            now_rfc3339(),
            edit.raw_score.is_some(),
            edit.comments.is_some(),
        ],
    )?;
    let entry_id: String = sp.query_row(
        "SELECT id FROM component_scores WHERE component_id = ? AND student_id = ?",
        (&edit.component_id, &edit.student_id),
        |r| r.get(0),
    )?;
    for (sub_id, score) in &edit.sub_scores {
        sp.execute(
            "INSERT INTO sub_criteria_scores(id, component_score_id, sub_criteria_id, score)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(component_score_id, sub_criteria_id) DO UPDATE SET score = excluded.score",
            (Uuid::new_v4().to_string(), &entry_id, sub_id, score),
        )?;
    }
    sp.commit()
}

fn scores_bulk_upsert(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let schema_id = required_str(req, "schemaId")?;
    let Some(entries) = req.params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing entries[]"));
    };

    if entries.len() > SCORES_BULK_UPSERT_MAX_ENTRIES {
        let rejected = entries.len();
        return Ok(json!({
            "ok": true,
            "updated": 0,
            "rejected": rejected,
            "limitExceeded": true,
            "errors": [{
                "index": -1,
                "code": "too_many_entries",
                "message": format!(
                    "bulk payload exceeds max entries: {} > {}",
                    rejected, SCORES_BULK_UPSERT_MAX_ENTRIES
                )
            }]
        }));
    }

    let schema = require_schema(conn, &schema_id)?;
    require_active(&schema)?;
    let class_id = schema.class_id.clone().unwrap_or_default();
    let roster: HashSet<String> = db::load_roster(conn, &class_id)
        .map_err(HandlerErr::query)?
        .into_iter()
        .map(|s| s.id)
        .collect();
    let components: HashMap<&str, &Component> = schema
        .components
        .iter()
        .map(|c| (c.id.as_str(), c))
        .collect();

    let mut tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let mut updated: usize = 0;
    let mut errors: Vec<serde_json::Value> = Vec::new();

    for (i, entry) in entries.iter().enumerate() {
        let student_id = entry.get("studentId").cloned().unwrap_or(serde_json::Value::Null);
        let component_id = entry.get("componentId").cloned().unwrap_or(serde_json::Value::Null);
        let edit = match parse_entry(entry, &roster, &components) {
            Ok(v) => v,
            Err(e) => {
                errors.push(json!({
                    "index": i,
                    "studentId": student_id,
                    "componentId": component_id,
                    "subCriteriaId": e.sub_criteria_id,
                    "code": e.code,
                    "message": e.message,
                }));
                continue;
            }
        };
        match write_entry(&mut tx, &schema.id, &edit) {
            Ok(()) => updated += 1,
            Err(e) => errors.push(json!({
                "index": i,
                "studentId": student_id,
                "componentId": component_id,
                "code": "db_update_failed",
                "message": e.to_string(),
            })),
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    if !errors.is_empty() {
        tracing::debug!(
            schema_id = %schema.id,
            updated,
            rejected = errors.len(),
            "bulk score entry had rejections"
        );
    }

    Ok(json!({
        "ok": true,
        "updated": updated,
        "rejected": errors.len(),
        "errors": errors
    }))
}

fn scores_get(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let schema_id = required_str(req, "schemaId")?;
    let student_id = optional_trimmed(req.params.get("studentId"));
    require_schema(conn, &schema_id)?;

    let entries = db::load_component_scores(conn, &schema_id, student_id.as_deref())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "entries": entries }))
}

fn scores_clear(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let schema_id = required_str(req, "schemaId")?;
    let student_id = optional_trimmed(req.params.get("studentId"));
    let component_id = optional_trimmed(req.params.get("componentId"));

    let schema = require_schema(conn, &schema_id)?;
    require_active(&schema)?;

    let filter = "schema_id = ?1 AND (?2 IS NULL OR student_id = ?2) AND (?3 IS NULL OR component_id = ?3)";
    let args = (&schema_id, &student_id, &component_id);
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        &format!(
            "DELETE FROM sub_criteria_scores
             WHERE component_score_id IN (SELECT id FROM component_scores WHERE {})",
            filter
        ),
        args,
    )
    .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    let cleared = tx
        .execute(
            &format!("DELETE FROM component_scores WHERE {}", filter),
            args,
        )
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    Ok(json!({ "ok": true, "cleared": cleared }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let res = match req.method.as_str() {
        "scores.get" => scores_get(state, req),
        "scores.bulkUpsert" => scores_bulk_upsert(state, req),
        "scores.clear" => scores_clear(state, req),
        _ => return None,
    };
    Some(match res {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
