use crate::calc::{schema_warnings, validate_schema, AssessmentSchema};
use crate::db;
use crate::formula::{Formula, FormulaContext, FormulaError};
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{now_rfc3339, optional_trimmed, require_db, require_schema, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const MAX_COMPONENTS: usize = 64;
const MAX_SUB_CRITERIA: usize = 32;

fn finite_non_negative(v: f64) -> bool {
    v.is_finite() && v >= 0.0
}

fn trimmed(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn bad(message: impl Into<String>) -> HandlerErr {
    HandlerErr::new("bad_params", message)
}

/// Validate an authored schema and assign fresh ids.
fn prepare_schema(raw: &serde_json::Value, class_id: &str) -> Result<AssessmentSchema, HandlerErr> {
    let mut schema: AssessmentSchema = serde_json::from_value(raw.clone())
        .map_err(|e| bad(format!("invalid schema: {}", e)))?;

    schema.id = Uuid::new_v4().to_string();
    schema.class_id = Some(class_id.to_string());
    schema.name = schema.name.trim().to_string();
    if schema.name.is_empty() {
        return Err(bad("schema name must not be empty"));
    }
    schema.term = trimmed(schema.term.take());
    schema.subject = trimmed(schema.subject.take());
    if schema.components.len() > MAX_COMPONENTS {
        return Err(bad(format!("at most {} components are allowed", MAX_COMPONENTS)));
    }

    for (i, c) in schema.components.iter_mut().enumerate() {
        c.id = Uuid::new_v4().to_string();
        c.name = c.name.trim().to_string();
        if c.name.is_empty() {
            return Err(bad(format!("component {} name must not be empty", i)));
        }
        if !finite_non_negative(c.raw_max_score) || !finite_non_negative(c.reduced_score) {
            return Err(bad(format!(
                "component {}: rawMaxScore and reducedScore must be >= 0",
                c.name
            ))
            .with_details(json!({ "componentIndex": i })));
        }
        if let Some(w) = c.weightage {
            if !(0.0..=100.0).contains(&w) {
                return Err(bad(format!("component {}: weightage must be in 0..=100", c.name))
                    .with_details(json!({ "componentIndex": i, "weightage": w })));
            }
        }

        let formula = c.formula_source().map(str::to_string);
        if let Some(src) = &formula {
            if let Err(e) = Formula::parse(src) {
                return Err(HandlerErr::new(
                    "bad_formula",
                    format!("component {}: {}", c.name, e),
                )
                .with_details(json!({ "componentIndex": i, "formula": src })));
            }
        }
        c.formula = formula;

        if c.sub_criteria.len() > MAX_SUB_CRITERIA {
            return Err(bad(format!(
                "component {}: at most {} sub-criteria are allowed",
                c.name, MAX_SUB_CRITERIA
            )));
        }
        c.sub_criteria.sort_by_key(|s| s.order);
        for (k, s) in c.sub_criteria.iter_mut().enumerate() {
            s.id = Uuid::new_v4().to_string();
            s.order = k as i64;
            s.name = s.name.trim().to_string();
            if s.name.is_empty() || !finite_non_negative(s.max_score) {
                return Err(bad(format!(
                    "component {}: sub-criteria need a name and maxScore >= 0",
                    c.name
                ))
                .with_details(json!({ "componentIndex": i, "subCriteriaIndex": k })));
            }
        }
    }

    validate_schema(&schema)?;
    Ok(schema)
}

fn insert_schema(conn: &Connection, schema: &AssessmentSchema) -> Result<(), HandlerErr> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    tx.execute(
        "INSERT INTO assessment_schemas(id, class_id, name, term, subject, total_marks, published, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &schema.id,
            &schema.class_id,
            &schema.name,
            &schema.term,
            &schema.subject,
            schema.total_marks,
            schema.published as i64,
            schema.active as i64,
            now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::insert("assessment_schemas", e))?;

    for (idx, c) in schema.components.iter().enumerate() {
        tx.execute(
            "INSERT INTO schema_components(id, schema_id, idx, name, raw_max_score, reduced_score, weightage, formula)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &c.id,
                &schema.id,
                idx as i64,
                &c.name,
                c.raw_max_score,
                c.reduced_score,
                c.weightage,
                &c.formula,
            ),
        )
        .map_err(|e| HandlerErr::insert("schema_components", e))?;
        for s in &c.sub_criteria {
            tx.execute(
                "INSERT INTO sub_criteria(id, component_id, sort_order, name, max_score)
                 VALUES(?, ?, ?, ?, ?)",
                (&s.id, &c.id, s.order, &s.name, s.max_score),
            )
            .map_err(|e| HandlerErr::insert("sub_criteria", e))?;
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))
}

fn schemas_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = required_str(req, "classId")?;
    let Some(raw) = req.params.get("schema") else {
        return Err(bad("missing schema"));
    };

    let class_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::query)?;
    if class_exists.is_none() {
        return Err(HandlerErr::new("not_found", "class not found"));
    }

    let schema = prepare_schema(raw, &class_id)?;
    insert_schema(conn, &schema)?;
    let warnings = schema_warnings(&schema);
    tracing::info!(
        schema_id = %schema.id,
        components = schema.components.len(),
        warnings = warnings.len(),
        "schema created"
    );

    let components: Vec<serde_json::Value> = schema
        .components
        .iter()
        .map(|c| {
            json!({
                "id": c.id,
                "name": c.name,
                "subCriteria": c.sub_criteria.iter().map(|s| json!({ "id": s.id, "name": s.name })).collect::<Vec<_>>()
            })
        })
        .collect();

    Ok(json!({
        "schemaId": schema.id,
        "components": components,
        "warnings": warnings
    }))
}

fn schemas_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = required_str(req, "classId")?;

    let mut stmt = conn
        .prepare(
            "SELECT
               a.id, a.name, a.term, a.subject, a.total_marks, a.published, a.active,
               (SELECT COUNT(*) FROM schema_components c WHERE c.schema_id = a.id) AS component_count
             FROM assessment_schemas a
             WHERE a.class_id = ?
             ORDER BY a.created_at, a.name",
        )
        .map_err(HandlerErr::query)?;
    let schemas = stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let term: Option<String> = r.get(2)?;
            let subject: Option<String> = r.get(3)?;
            let total_marks: f64 = r.get(4)?;
            let published: i64 = r.get(5)?;
            let active: i64 = r.get(6)?;
            let component_count: i64 = r.get(7)?;
            Ok(json!({
                "id": id,
                "name": name,
                "term": term,
                "subject": subject,
                "totalMarks": total_marks,
                "published": published != 0,
                "active": active != 0,
                "componentCount": component_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    Ok(json!({ "schemas": schemas }))
}

fn schemas_get(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let schema_id = required_str(req, "schemaId")?;
    let schema = require_schema(conn, &schema_id)?;
    let warnings = schema_warnings(&schema);
    Ok(json!({ "schema": schema, "warnings": warnings }))
}

fn schemas_update(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let schema_id = required_str(req, "schemaId")?;
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(bad("patch must be an object"));
    };

    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM assessment_schemas WHERE id = ?",
            [&schema_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "schema not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    for (k, v) in patch {
        let res = match k.as_str() {
            "name" => {
                let Some(name) = optional_trimmed(Some(v)) else {
                    return Err(bad("name must be a non-empty string"));
                };
                tx.execute(
                    "UPDATE assessment_schemas SET name = ? WHERE id = ?",
                    (&name, &schema_id),
                )
            }
            "term" | "subject" => {
                if !(v.is_null() || v.is_string()) {
                    return Err(bad(format!("{} must be string or null", k)));
                }
                tx.execute(
                    &format!("UPDATE assessment_schemas SET {} = ? WHERE id = ?", k),
                    (optional_trimmed(Some(v)), &schema_id),
                )
            }
            "totalMarks" => {
                let Some(t) = v.as_f64().filter(|t| t.is_finite() && *t > 0.0) else {
                    return Err(bad("totalMarks must be a number > 0"));
                };
                tx.execute(
                    "UPDATE assessment_schemas SET total_marks = ? WHERE id = ?",
                    (t, &schema_id),
                )
            }
            "published" | "active" => {
                let Some(b) = v.as_bool() else {
                    return Err(bad(format!("{} must be boolean", k)));
                };
                tx.execute(
                    &format!("UPDATE assessment_schemas SET {} = ? WHERE id = ?", k),
                    (b as i64, &schema_id),
                )
            }
            _ => return Err(bad(format!("unknown schema field: {}", k))),
        };
        res.map_err(|e| HandlerErr::update("assessment_schemas", e))?;
    }
    tx.execute(
        "UPDATE assessment_schemas SET updated_at = ? WHERE id = ?",
        (now_rfc3339(), &schema_id),
    )
    .map_err(|e| HandlerErr::update("assessment_schemas", e))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    Ok(json!({ "ok": true }))
}

fn schemas_delete(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let schema_id = required_str(req, "schemaId")?;
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM assessment_schemas WHERE id = ?",
            [&schema_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "schema not found"));
    }
    db::delete_schema_cascade(conn, &schema_id)
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    tracing::info!(schema_id = %schema_id, "schema deleted");
    Ok(json!({ "ok": true }))
}

fn number_list(v: Option<&serde_json::Value>, key: &str) -> Result<Vec<f64>, HandlerErr> {
    let Some(v) = v else {
        return Ok(Vec::new());
    };
    let Some(arr) = v.as_array() else {
        return Err(bad(format!("{} must be an array of numbers", key)));
    };
    arr.iter()
        .map(|x| {
            x.as_f64()
                .ok_or_else(|| bad(format!("{} must be an array of numbers", key)))
        })
        .collect()
}

fn formula_check(_state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let src = required_str(req, "formula")?;
    let formula = match src.parse::<Formula>() {
        Ok(f) => f,
        Err(e) => {
            let position = match &e {
                FormulaError::Parse { position, .. } => Some(*position),
                _ => None,
            };
            return Ok(json!({
                "valid": false,
                "error": e.to_string(),
                "position": position
            }));
        }
    };

    let mut out = json!({
        "valid": true,
        "formula": formula.source(),
        "normalized": formula.expr().to_string(),
        "variables": formula.variables()
    });

    if let Some(preview) = req.params.get("preview") {
        let Some(p) = preview.as_object() else {
            return Err(bad("preview must be an object"));
        };
        let num = |key: &str| -> Result<Option<f64>, HandlerErr> {
            match p.get(key) {
                None => Ok(None),
                Some(v) if v.is_null() => Ok(None),
                Some(v) => v
                    .as_f64()
                    .map(Some)
                    .ok_or_else(|| bad(format!("preview.{} must be a number", key))),
            }
        };
        let raw = num("raw")?.unwrap_or(0.0);
        let raw_max = num("rawMax")?.unwrap_or(0.0);
        let total_max = num("totalMax")?.unwrap_or(raw_max);
        let sub_scores = number_list(p.get("subScores"), "preview.subScores")?;
        let ctx = FormulaContext {
            raw,
            raw_max,
            sub_scores: &sub_scores,
            total_max,
        };
        match formula.eval(&ctx) {
            Ok(v) => out["value"] = json!(v),
            Err(e) => out["previewError"] = json!(e.to_string()),
        }
    }

    Ok(out)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let res = match req.method.as_str() {
        "schemas.create" => schemas_create(state, req),
        "schemas.list" => schemas_list(state, req),
        "schemas.get" => schemas_get(state, req),
        "schemas.update" => schemas_update(state, req),
        "schemas.delete" => schemas_delete(state, req),
        "formula.check" => formula_check(state, req),
        _ => return None,
    };
    Some(match res {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
