use crate::calc::{
    calculate_roster, calculate_student, summarize_class, AssessmentSchema, CalculatedResult,
    ComponentScore,
};
use crate::db;
use crate::grading::GradingConfig;
use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::handlers::settings::load_grading;
use crate::ipc::helpers::{require_db, require_schema, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::collections::HashSet;

fn pass_stats(results: &[CalculatedResult], grading: &GradingConfig) -> (usize, f64) {
    let pass_count = results
        .iter()
        .filter(|r| grading.is_pass(r.final_percentage))
        .count();
    let pass_rate = if results.is_empty() {
        0.0
    } else {
        pass_count as f64 / results.len() as f64 * 100.0
    };
    (pass_count, pass_rate)
}

fn results_student(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let schema_id = required_str(req, "schemaId")?;
    let student_id = required_str(req, "studentId")?;

    let schema = require_schema(conn, &schema_id)?;
    let class_id = schema.class_id.clone().unwrap_or_default();
    let roster = db::load_roster(conn, &class_id).map_err(HandlerErr::query)?;
    let Some(student) = roster.iter().find(|s| s.id == student_id) else {
        return Err(HandlerErr::new("not_found", "student not found in class"));
    };

    let scores = db::load_component_scores(conn, &schema_id, Some(&student_id))
        .map_err(HandlerErr::query)?;
    let grading = load_grading(conn)?;
    let result = calculate_student(&schema, &student_id, &scores, &grading.scale)?;
    let passed = grading.is_pass(result.final_percentage);

    Ok(json!({
        "schemaId": schema.id,
        "totalMarks": schema.total_marks,
        "displayName": student.display_name,
        "passed": passed,
        "result": result
    }))
}

fn results_dashboard(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let schema_id = required_str(req, "schemaId")?;
    let include_inactive = req
        .params
        .get("includeInactive")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let schema = require_schema(conn, &schema_id)?;
    let class_id = schema.class_id.clone().unwrap_or_default();
    let roster: Vec<db::RosterStudent> = db::load_roster(conn, &class_id)
        .map_err(HandlerErr::query)?
        .into_iter()
        .filter(|s| include_inactive || s.active)
        .collect();
    let student_ids: Vec<String> = roster.iter().map(|s| s.id.clone()).collect();

    let scores = db::load_component_scores(conn, &schema_id, None).map_err(HandlerErr::query)?;
    let grading = load_grading(conn)?;
    let results = calculate_roster(&schema, &student_ids, &scores, &grading.scale)?;
    let summary = summarize_class(&schema, &results, &grading.scale);
    let (pass_count, pass_rate) = pass_stats(&results, &grading);

    let pending_student_count = results.iter().filter(|r| !r.has_any_entry()).count();
    let incomplete_student_count = results.iter().filter(|r| !r.complete).count();

    let students: Vec<serde_json::Value> = roster
        .iter()
        .zip(results.iter())
        .map(|(s, r)| {
            json!({
                "studentId": s.id,
                "displayName": s.display_name,
                "active": s.active,
                "passed": grading.is_pass(r.final_percentage),
                "result": r
            })
        })
        .collect();

    Ok(json!({
        "schemaId": schema.id,
        "schemaName": schema.name,
        "totalMarks": schema.total_marks,
        "summary": summary,
        "passPercent": grading.pass_percent,
        "passCount": pass_count,
        "passRate": pass_rate,
        "pendingStudentCount": pending_student_count,
        "incompleteStudentCount": incomplete_student_count,
        "students": students
    }))
}

/// Students in first-appearance order across the supplied scores.
fn roster_from_scores(scores: &[ComponentScore]) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::new();
    scores
        .iter()
        .filter(|s| seen.insert(s.student_id.as_str()))
        .map(|s| s.student_id.clone())
        .collect()
}

fn calc_evaluate(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let Some(raw_schema) = req.params.get("schema") else {
        return Err(HandlerErr::new("bad_params", "missing schema"));
    };
    let schema: AssessmentSchema = serde_json::from_value(raw_schema.clone())
        .map_err(|e| HandlerErr::new("bad_params", format!("invalid schema: {}", e)))?;
    let scores: Vec<ComponentScore> = match req.params.get("scores") {
        None => Vec::new(),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| HandlerErr::new("bad_params", format!("invalid scores: {}", e)))?,
    };
    let student_ids: Vec<String> = match req.params.get("studentIds") {
        None => roster_from_scores(&scores),
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| {
            HandlerErr::new("bad_params", format!("studentIds must be strings: {}", e))
        })?,
    };

    let mut grading = match state.db.as_ref() {
        Some(conn) => load_grading(conn)?,
        None => GradingConfig::default(),
    };
    if let Some(patch) = req.params.get("grading") {
        let Some(patch) = patch.as_object() else {
            return Err(HandlerErr::new("bad_params", "grading must be an object"));
        };
        grading
            .apply_patch(patch)
            .map_err(|e| HandlerErr::new("bad_params", e))?;
    }

    let results = calculate_roster(&schema, &student_ids, &scores, &grading.scale)?;
    let summary = summarize_class(&schema, &results, &grading.scale);
    let (pass_count, pass_rate) = pass_stats(&results, &grading);

    Ok(json!({
        "results": results,
        "summary": summary,
        "warnings": crate::calc::schema_warnings(&schema),
        "grading": grading.to_json(),
        "passCount": pass_count,
        "passRate": pass_rate
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let res = match req.method.as_str() {
        "results.student" => results_student(state, req),
        "results.dashboard" => results_dashboard(state, req),
        "calc.evaluate" => calc_evaluate(state, req),
        _ => return None,
    };
    Some(match res {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
