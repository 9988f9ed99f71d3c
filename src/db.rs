use crate::calc::{AssessmentSchema, Component, ComponentScore, SubCriteria, SubCriteriaScore};
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;

pub const DB_FILE_NAME: &str = "assessd.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            admission_no TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_schemas(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            term TEXT,
            subject TEXT,
            total_marks REAL NOT NULL,
            published INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessment_schemas_class ON assessment_schemas(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_components(
            id TEXT PRIMARY KEY,
            schema_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            name TEXT NOT NULL,
            raw_max_score REAL NOT NULL,
            reduced_score REAL NOT NULL,
            weightage REAL,
            formula TEXT,
            FOREIGN KEY(schema_id) REFERENCES assessment_schemas(id),
            UNIQUE(schema_id, idx)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schema_components_schema ON schema_components(schema_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sub_criteria(
            id TEXT PRIMARY KEY,
            component_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            name TEXT NOT NULL,
            max_score REAL NOT NULL,
            FOREIGN KEY(component_id) REFERENCES schema_components(id),
            UNIQUE(component_id, sort_order)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sub_criteria_component ON sub_criteria(component_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS component_scores(
            id TEXT PRIMARY KEY,
            schema_id TEXT NOT NULL,
            component_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            raw_score REAL,
            comments TEXT,
            updated_at TEXT,
            FOREIGN KEY(schema_id) REFERENCES assessment_schemas(id),
            FOREIGN KEY(component_id) REFERENCES schema_components(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(component_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_component_scores_schema ON component_scores(schema_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_component_scores_student ON component_scores(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sub_criteria_scores(
            id TEXT PRIMARY KEY,
            component_score_id TEXT NOT NULL,
            sub_criteria_id TEXT NOT NULL,
            score REAL NOT NULL,
            FOREIGN KEY(component_score_id) REFERENCES component_scores(id),
            FOREIGN KEY(sub_criteria_id) REFERENCES sub_criteria(id),
            UNIQUE(component_score_id, sub_criteria_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sub_criteria_scores_entry ON sub_criteria_scores(component_score_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        // A corrupt value reads as unset so callers fall back to defaults.
        Some(text) => Ok(serde_json::from_str(&text).ok()),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct RosterStudent {
    pub id: String,
    pub display_name: String,
    pub active: bool,
}

pub fn load_roster(conn: &Connection, class_id: &str) -> anyhow::Result<Vec<RosterStudent>> {
    let mut stmt = conn.prepare(
        "SELECT id, last_name, first_name, active
         FROM students
         WHERE class_id = ?
         ORDER BY sort_order",
    )?;
    let rows = stmt
        .query_map([class_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok(RosterStudent {
                id: r.get(0)?,
                display_name: format!("{}, {}", last, first),
                active: r.get::<_, i64>(3)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn load_schema(conn: &Connection, schema_id: &str) -> anyhow::Result<Option<AssessmentSchema>> {
    let head: Option<(String, String, Option<String>, Option<String>, f64, i64, i64)> = conn
        .query_row(
            "SELECT class_id, name, term, subject, total_marks, published, active
             FROM assessment_schemas
             WHERE id = ?",
            [schema_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                ))
            },
        )
        .optional()?;
    let Some((class_id, name, term, subject, total_marks, published, active)) = head else {
        return Ok(None);
    };

    let mut comp_stmt = conn.prepare(
        "SELECT id, name, raw_max_score, reduced_score, weightage, formula
         FROM schema_components
         WHERE schema_id = ?
         ORDER BY idx",
    )?;
    let mut components = comp_stmt
        .query_map([schema_id], |r| {
            Ok(Component {
                id: r.get(0)?,
                name: r.get(1)?,
                raw_max_score: r.get(2)?,
                reduced_score: r.get(3)?,
                weightage: r.get(4)?,
                formula: r.get(5)?,
                sub_criteria: Vec::new(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut sub_stmt = conn.prepare(
        "SELECT sc.component_id, sc.id, sc.name, sc.max_score, sc.sort_order
         FROM sub_criteria sc
         JOIN schema_components c ON c.id = sc.component_id
         WHERE c.schema_id = ?
         ORDER BY sc.component_id, sc.sort_order",
    )?;
    let mut subs_by_component: HashMap<String, Vec<SubCriteria>> = HashMap::new();
    let sub_rows = sub_stmt.query_map([schema_id], |r| {
        Ok((
            r.get::<_, String>(0)?,
            SubCriteria {
                id: r.get(1)?,
                name: r.get(2)?,
                max_score: r.get(3)?,
                order: r.get(4)?,
            },
        ))
    })?;
    for row in sub_rows {
        let (component_id, sub) = row?;
        subs_by_component.entry(component_id).or_default().push(sub);
    }
    for c in components.iter_mut() {
        if let Some(subs) = subs_by_component.remove(&c.id) {
            c.sub_criteria = subs;
        }
    }

    Ok(Some(AssessmentSchema {
        id: schema_id.to_string(),
        name,
        term,
        subject,
        class_id: Some(class_id),
        total_marks,
        components,
        published: published != 0,
        active: active != 0,
    }))
}

/// All stored entries for a schema, optionally narrowed to one student.
pub fn load_component_scores(
    conn: &Connection,
    schema_id: &str,
    student_id: Option<&str>,
) -> anyhow::Result<Vec<ComponentScore>> {
    let mut stmt = conn.prepare(
        "SELECT id, student_id, component_id, raw_score, comments
         FROM component_scores
         WHERE schema_id = ?1 AND (?2 IS NULL OR student_id = ?2)
         ORDER BY student_id, component_id",
    )?;
    let rows = stmt
        .query_map((schema_id, student_id), |r| {
            Ok((
                r.get::<_, String>(0)?,
                ComponentScore {
                    student_id: r.get(1)?,
                    component_id: r.get(2)?,
                    raw_score: r.get(3)?,
                    sub_scores: Vec::new(),
                    comments: r.get(4)?,
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut sub_stmt = conn.prepare(
        "SELECT ss.component_score_id, ss.sub_criteria_id, ss.score
         FROM sub_criteria_scores ss
         JOIN component_scores cs ON cs.id = ss.component_score_id
         JOIN sub_criteria sc ON sc.id = ss.sub_criteria_id
         WHERE cs.schema_id = ?1 AND (?2 IS NULL OR cs.student_id = ?2)
         ORDER BY ss.component_score_id, sc.sort_order",
    )?;
    let mut subs: HashMap<String, Vec<SubCriteriaScore>> = HashMap::new();
    let sub_rows = sub_stmt.query_map((schema_id, student_id), |r| {
        Ok((
            r.get::<_, String>(0)?,
            SubCriteriaScore {
                sub_criteria_id: r.get(1)?,
                score: r.get(2)?,
            },
        ))
    })?;
    for row in sub_rows {
        let (entry_id, s) = row?;
        subs.entry(entry_id).or_default().push(s);
    }

    Ok(rows
        .into_iter()
        .map(|(entry_id, mut score)| {
            if let Some(s) = subs.remove(&entry_id) {
                score.sub_scores = s;
            }
            score
        })
        .collect())
}

pub fn delete_schema_cascade(conn: &Connection, schema_id: &str) -> anyhow::Result<()> {
    let tx = conn.unchecked_transaction()?;
    // Explicit dependency order (no ON DELETE CASCADE).
    tx.execute(
        "DELETE FROM sub_criteria_scores
         WHERE component_score_id IN (SELECT id FROM component_scores WHERE schema_id = ?)",
        [schema_id],
    )?;
    tx.execute("DELETE FROM component_scores WHERE schema_id = ?", [schema_id])?;
    tx.execute(
        "DELETE FROM sub_criteria
         WHERE component_id IN (SELECT id FROM schema_components WHERE schema_id = ?)",
        [schema_id],
    )?;
    tx.execute("DELETE FROM schema_components WHERE schema_id = ?", [schema_id])?;
    tx.execute("DELETE FROM assessment_schemas WHERE id = ?", [schema_id])?;
    tx.commit()?;
    Ok(())
}
