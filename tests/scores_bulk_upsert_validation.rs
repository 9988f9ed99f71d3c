use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_assessd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn assessd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_default()
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

struct Fixture {
    schema_id: String,
    students: Vec<String>,
    quiz_id: String,
    project_id: String,
    design_id: String,
    build_id: String,
}

fn setup(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) -> Fixture {
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class_id = request_ok(stdin, reader, "class", "classes.create", json!({ "name": "9C" }))
        ["classId"]
        .as_str()
        .expect("classId")
        .to_string();
    let mut students = Vec::new();
    for (i, (last, first)) in [("Ng", "Mai"), ("Diaz", "Leo")].iter().enumerate() {
        let sid = request_ok(
            stdin,
            reader,
            &format!("student-{}", i),
            "students.create",
            json!({ "classId": class_id, "lastName": last, "firstName": first }),
        )["studentId"]
            .as_str()
            .expect("studentId")
            .to_string();
        students.push(sid);
    }
    let created = request_ok(
        stdin,
        reader,
        "schema",
        "schemas.create",
        json!({
            "classId": class_id,
            "schema": {
                "name": "Term 2",
                "totalMarks": 15,
                "components": [
                    { "name": "Quiz", "rawMaxScore": 40, "reducedScore": 5 },
                    {
                        "name": "Project",
                        "rawMaxScore": 10,
                        "reducedScore": 10,
                        "subCriteria": [
                            { "name": "Design", "maxScore": 4 },
                            { "name": "Build", "maxScore": 6 }
                        ]
                    }
                ]
            }
        }),
    );
    let comp = |i: usize| created["components"][i]["id"].as_str().expect("id").to_string();
    let sub = |k: usize| {
        created["components"][1]["subCriteria"][k]["id"]
            .as_str()
            .expect("sub id")
            .to_string()
    };
    Fixture {
        schema_id: created["schemaId"].as_str().expect("schemaId").to_string(),
        students,
        quiz_id: comp(0),
        project_id: comp(1),
        design_id: sub(0),
        build_id: sub(1),
    }
}

#[test]
fn bulk_upsert_saves_valid_entries_and_reports_each_rejection() {
    let workspace = temp_dir("assessd-scores-validation");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let f = setup(&mut stdin, &mut reader, &workspace);
    let s0 = &f.students[0];

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "scores.bulkUpsert",
        json!({
            "schemaId": f.schema_id,
            "entries": [
                { "studentId": s0, "componentId": f.quiz_id, "rawScore": 20, "comments": "ok" },
                { "studentId": s0, "componentId": f.project_id, "subScores": [
                    { "subCriteriaId": f.design_id, "score": 3 },
                    { "subCriteriaId": f.build_id, "score": 5.5 }
                ]},
                { "studentId": "ghost", "componentId": f.quiz_id, "rawScore": 1 },
                { "studentId": s0, "componentId": "nope", "rawScore": 1 },
                { "studentId": s0, "componentId": f.quiz_id, "rawScore": -1 },
                { "studentId": s0, "componentId": f.quiz_id, "rawScore": 41 },
                { "studentId": s0, "componentId": f.project_id, "subScores": [
                    { "subCriteriaId": f.design_id, "score": 4.5 }
                ]},
                { "studentId": s0, "componentId": f.project_id, "subScores": [
                    { "subCriteriaId": "other", "score": 1 }
                ]},
                { "studentId": s0, "componentId": f.quiz_id, "subScores": [
                    { "subCriteriaId": f.design_id, "score": 1 }
                ]},
                { "studentId": s0, "componentId": f.quiz_id },
                "not an object"
            ]
        }),
    );
    assert_eq!(res["updated"], json!(2));
    assert_eq!(res["rejected"], json!(9));
    let errors = res["errors"].as_array().expect("errors");
    let codes: Vec<(u64, &str)> = errors
        .iter()
        .map(|e| {
            (
                e["index"].as_u64().expect("index"),
                e["code"].as_str().expect("code"),
            )
        })
        .collect();
    assert_eq!(
        codes,
        vec![
            (2, "unknown_student"),
            (3, "unknown_component"),
            (4, "negative_score"),
            (5, "out_of_range"),
            (6, "out_of_range"),
            (7, "unknown_sub_criteria"),
            (8, "bad_params"),
            (9, "empty_entry"),
            (10, "bad_params"),
        ]
    );
    assert_eq!(errors[4]["subCriteriaId"], json!(f.design_id));

    let stored = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "scores.get",
        json!({ "schemaId": f.schema_id, "studentId": s0 }),
    );
    let entries = stored["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 2);
    let quiz = entries
        .iter()
        .find(|e| e["componentId"] == json!(f.quiz_id))
        .expect("quiz entry");
    assert_eq!(quiz["rawScore"], json!(20.0));
    assert_eq!(quiz["comments"], json!("ok"));
    let project = entries
        .iter()
        .find(|e| e["componentId"] == json!(f.project_id))
        .expect("project entry");
    assert_eq!(project["subScores"].as_array().map(|a| a.len()), Some(2));

    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn bulk_upsert_merges_partial_updates() {
    let workspace = temp_dir("assessd-scores-merge");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let f = setup(&mut stdin, &mut reader, &workspace);
    let s1 = &f.students[1];

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "scores.bulkUpsert",
        json!({
            "schemaId": f.schema_id,
            "entries": [
                { "studentId": s1, "componentId": f.quiz_id, "rawScore": 10, "comments": "late" },
                { "studentId": s1, "componentId": f.project_id, "subScores": [
                    { "subCriteriaId": f.design_id, "score": 2 },
                    { "subCriteriaId": f.build_id, "score": 2 }
                ]}
            ]
        }),
    );
    // Only the fields present are touched.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "scores.bulkUpsert",
        json!({
            "schemaId": f.schema_id,
            "entries": [
                { "studentId": s1, "componentId": f.quiz_id, "rawScore": 30 },
                { "studentId": s1, "componentId": f.project_id, "subScores": [
                    { "subCriteriaId": f.build_id, "score": 6 }
                ]}
            ]
        }),
    );

    let stored = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "scores.get",
        json!({ "schemaId": f.schema_id, "studentId": s1 }),
    );
    let entries = stored["entries"].as_array().expect("entries");
    let quiz = entries
        .iter()
        .find(|e| e["componentId"] == json!(f.quiz_id))
        .expect("quiz");
    assert_eq!(quiz["rawScore"], json!(30.0));
    assert_eq!(quiz["comments"], json!("late"));
    let project = entries
        .iter()
        .find(|e| e["componentId"] == json!(f.project_id))
        .expect("project");
    let total: f64 = project["subScores"]
        .as_array()
        .expect("subScores")
        .iter()
        .map(|s| s["score"].as_f64().expect("score"))
        .sum();
    assert!((total - 8.0).abs() < 1e-9, "{}", total);

    let cleared = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "scores.clear",
        json!({ "schemaId": f.schema_id, "componentId": f.quiz_id }),
    );
    assert_eq!(cleared["cleared"], json!(1));
    let after = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "scores.get",
        json!({ "schemaId": f.schema_id }),
    );
    assert_eq!(after["entries"].as_array().map(|a| a.len()), Some(1));

    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn bulk_upsert_enforces_limits_and_active_schema() {
    let workspace = temp_dir("assessd-scores-limits");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let f = setup(&mut stdin, &mut reader, &workspace);

    let entry = json!({ "studentId": f.students[0], "componentId": f.quiz_id, "rawScore": 1 });
    let too_many: Vec<serde_json::Value> = std::iter::repeat(entry).take(5001).collect();
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "scores.bulkUpsert",
        json!({ "schemaId": f.schema_id, "entries": too_many }),
    );
    assert_eq!(res["limitExceeded"], json!(true));
    assert_eq!(res["updated"], json!(0));
    assert_eq!(res["rejected"], json!(5001));
    assert_eq!(res["errors"][0]["code"], json!("too_many_entries"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "schemas.update",
        json!({ "schemaId": f.schema_id, "patch": { "active": false } }),
    );
    let closed = request(
        &mut stdin,
        &mut reader,
        "3",
        "scores.bulkUpsert",
        json!({
            "schemaId": f.schema_id,
            "entries": [{ "studentId": f.students[0], "componentId": f.quiz_id, "rawScore": 1 }]
        }),
    );
    assert_eq!(error_code(&closed), "schema_inactive");

    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
