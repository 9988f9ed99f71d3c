use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{require_db, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn classes_list(state: &AppState, _req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let Some(conn) = state.db.as_ref() else {
        return Ok(json!({ "classes": [] }));
    };

    // Correlated subqueries avoid double-counting from joins.
    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               c.name,
               (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
               (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id AND s.active = 1) AS active_count,
               (SELECT COUNT(*) FROM assessment_schemas a WHERE a.class_id = c.id) AS schema_count
             FROM classes c
             ORDER BY c.name",
        )
        .map_err(HandlerErr::query)?;
    let classes = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let student_count: i64 = row.get(2)?;
            let active_count: i64 = row.get(3)?;
            let schema_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "studentCount": student_count,
                "activeStudentCount": active_count,
                "schemaCount": schema_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    Ok(json!({ "classes": classes }))
}

fn classes_create(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_db(state)?;
    let name = required_str(req, "name")?;

    let taken: Option<String> = conn
        .query_row(
            "SELECT id FROM classes WHERE name = ? COLLATE NOCASE",
            [&name],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    if let Some(existing) = taken {
        return Err(HandlerErr::new("conflict", "a class with this name already exists")
            .with_details(json!({ "classId": existing })));
    }

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, name) VALUES(?, ?)",
        (&class_id, &name),
    )
    .map_err(|e| HandlerErr::insert("classes", e))?;
    tracing::info!(class_id = %class_id, "class created");

    Ok(json!({ "classId": class_id, "name": name }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let res = match req.method.as_str() {
        "classes.list" => classes_list(state, req),
        "classes.create" => classes_create(state, req),
        _ => return None,
    };
    Some(match res {
        Ok(v) => ok(&req.id, v),
        Err(e) => e.response(&req.id),
    })
}
