use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{now_rfc3339, optional_trimmed, require_db, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::query)
}

fn students_list(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = required_str(req, "classId")?;

    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, admission_no, active, sort_order
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order",
        )
        .map_err(HandlerErr::query)?;
    let students = stmt
        .query_map([&class_id], |r| {
            let id: String = r.get(0)?;
            let last_name: String = r.get(1)?;
            let first_name: String = r.get(2)?;
            let admission_no: Option<String> = r.get(3)?;
            let active: i64 = r.get(4)?;
            let sort_order: i64 = r.get(5)?;
            Ok(json!({
                "id": id,
                "lastName": last_name,
                "firstName": first_name,
                "displayName": format!("{}, {}", last_name, first_name),
                "admissionNo": admission_no,
                "active": active != 0,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    Ok(json!({ "students": students }))
}

fn students_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let class_id = required_str(req, "classId")?;
    let last_name = required_str(req, "lastName")?;
    let first_name = required_str(req, "firstName")?;
    let admission_no = optional_trimmed(req.params.get("admissionNo"));
    let active = req
        .params
        .get("active")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    if !class_exists(conn, &class_id)? {
        return Err(HandlerErr::new("not_found", "class not found"));
    }

    let next_sort: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_id = ?",
            [&class_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, class_id, last_name, first_name, admission_no, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &class_id,
            &last_name,
            &first_name,
            &admission_no,
            active as i64,
            next_sort,
            now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::insert("students", e))?;

    Ok(json!({ "studentId": student_id, "sortOrder": next_sort }))
}

fn students_update(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let student_id = required_str(req, "studentId")?;
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::new("bad_params", "patch must be an object"));
    };

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::query)?;
    if exists.is_none() {
        return Err(HandlerErr::new("not_found", "student not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    for (k, v) in patch {
        let res = match k.as_str() {
            "lastName" | "firstName" => {
                let Some(s) = optional_trimmed(Some(v)) else {
                    return Err(HandlerErr::new(
                        "bad_params",
                        format!("{} must be a non-empty string", k),
                    ));
                };
                let column = if k == "lastName" { "last_name" } else { "first_name" };
                tx.execute(
                    &format!("UPDATE students SET {} = ? WHERE id = ?", column),
                    (&s, &student_id),
                )
            }
            "admissionNo" => tx.execute(
                "UPDATE students SET admission_no = ? WHERE id = ?",
                (optional_trimmed(Some(v)), &student_id),
            ),
            "active" => {
                let Some(b) = v.as_bool() else {
                    return Err(HandlerErr::new("bad_params", "active must be boolean"));
                };
                tx.execute(
                    "UPDATE students SET active = ? WHERE id = ?",
                    (b as i64, &student_id),
                )
            }
            _ => {
                return Err(HandlerErr::new(
                    "bad_params",
                    format!("unknown student field: {}", k),
                ))
            }
        };
        res.map_err(|e| HandlerErr::update("students", e))?;
    }
    tx.execute(
        "UPDATE students SET updated_at = ? WHERE id = ?",
        (now_rfc3339(), &student_id),
    )
    .map_err(|e| HandlerErr::update("students", e))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let res = match req.method.as_str() {
        "students.list" => students_list(state, req),
        "students.create" => students_create(state, req),
        "students.update" => students_update(state, req),
        _ => return None,
    };
    Some(match res {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
