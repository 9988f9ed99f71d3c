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

fn setup_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> String {
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    request_ok(stdin, reader, "class", "classes.create", json!({ "name": "8B" }))["classId"]
        .as_str()
        .expect("classId")
        .to_string()
}

fn notebook_schema() -> serde_json::Value {
    json!({
        "name": "Term 1 Science",
        "term": " T1 ",
        "subject": "Science",
        "totalMarks": 25,
        "components": [
            {
                "name": "Notebook",
                "rawMaxScore": 30,
                "reducedScore": 5,
                "formula": "(sum(subScores) / 30) * 5",
                "subCriteria": [
                    { "name": "Neatness", "maxScore": 5, "order": 1 },
                    { "name": "Completeness", "maxScore": 5, "order": 0 },
                    { "name": "Timeliness", "maxScore": 5, "order": 2 },
                    { "name": "Accuracy", "maxScore": 5, "order": 3 },
                    { "name": "Extra", "maxScore": 10, "order": 4 }
                ]
            },
            { "name": "Unit Test", "rawMaxScore": 40, "reducedScore": 20 }
        ]
    })
}

#[test]
fn schema_create_get_update_delete_roundtrip() {
    let workspace = temp_dir("assessd-schema-lifecycle");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let class_id = setup_class(&mut stdin, &mut reader, &workspace);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "schemas.create",
        json!({ "classId": class_id, "schema": notebook_schema() }),
    );
    let schema_id = created["schemaId"].as_str().expect("schemaId").to_string();
    assert_eq!(created["components"].as_array().map(|a| a.len()), Some(2));
    assert_eq!(created["warnings"], json!([]));
    // Sub-criteria come back in authored order, not payload order.
    assert_eq!(
        created["components"][0]["subCriteria"][0]["name"],
        json!("Completeness")
    );

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "schemas.get",
        json!({ "schemaId": schema_id }),
    );
    let schema = &got["schema"];
    assert_eq!(schema["name"], json!("Term 1 Science"));
    assert_eq!(schema["term"], json!("T1"));
    assert_eq!(schema["active"], json!(true));
    assert_eq!(schema["published"], json!(false));
    assert_eq!(
        schema["components"][0]["formula"],
        json!("(sum(subScores) / 30) * 5")
    );
    let subs = schema["components"][0]["subCriteria"]
        .as_array()
        .expect("subCriteria");
    assert_eq!(subs.len(), 5);
    assert_eq!(subs[1]["name"], json!("Neatness"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "schemas.update",
        json!({ "schemaId": schema_id, "patch": { "published": true, "active": false, "name": "Renamed" } }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "schemas.list",
        json!({ "classId": class_id }),
    );
    let row = &listed["schemas"][0];
    assert_eq!(row["name"], json!("Renamed"));
    assert_eq!(row["published"], json!(true));
    assert_eq!(row["active"], json!(false));
    assert_eq!(row["componentCount"], json!(2));

    let bad_patch = request(
        &mut stdin,
        &mut reader,
        "5",
        "schemas.update",
        json!({ "schemaId": schema_id, "patch": { "totalMarks": 0 } }),
    );
    assert_eq!(error_code(&bad_patch), "bad_params");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "schemas.delete",
        json!({ "schemaId": schema_id }),
    );
    let gone = request(
        &mut stdin,
        &mut reader,
        "7",
        "schemas.get",
        json!({ "schemaId": schema_id }),
    );
    assert_eq!(error_code(&gone), "not_found");

    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn schema_create_rejects_invalid_authoring() {
    let workspace = temp_dir("assessd-schema-invalid");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let class_id = setup_class(&mut stdin, &mut reader, &workspace);

    let cases: Vec<(serde_json::Value, &str)> = vec![
        (
            json!({ "name": "Empty", "totalMarks": 10, "components": [] }),
            "invalid_schema",
        ),
        (
            json!({
                "name": "Zero total",
                "totalMarks": 0,
                "components": [{ "name": "A", "rawMaxScore": 10, "reducedScore": 10 }]
            }),
            "invalid_schema",
        ),
        (
            json!({
                "name": "Bad formula",
                "totalMarks": 10,
                "components": [{ "name": "A", "rawMaxScore": 10, "reducedScore": 10, "formula": "raw * (2" }]
            }),
            "bad_formula",
        ),
        (
            json!({
                "name": "Unknown variable",
                "totalMarks": 10,
                "components": [{ "name": "A", "rawMaxScore": 10, "reducedScore": 10, "formula": "bonus + raw" }]
            }),
            "bad_formula",
        ),
        (
            json!({
                "name": "Negative",
                "totalMarks": 10,
                "components": [{ "name": "A", "rawMaxScore": -1, "reducedScore": 10 }]
            }),
            "bad_params",
        ),
        (
            json!({
                "name": "Weightage",
                "totalMarks": 10,
                "components": [{ "name": "A", "rawMaxScore": 10, "reducedScore": 10, "weightage": 150 }]
            }),
            "bad_params",
        ),
    ];
    for (i, (schema, code)) in cases.into_iter().enumerate() {
        let resp = request(
            &mut stdin,
            &mut reader,
            &format!("case-{}", i),
            "schemas.create",
            json!({ "classId": class_id, "schema": schema }),
        );
        assert_eq!(error_code(&resp), code, "case {}: {}", i, resp);
    }

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "schemas.list",
        json!({ "classId": class_id }),
    );
    assert_eq!(listed["schemas"], json!([]));

    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn schema_create_warns_on_mismatched_sums() {
    let workspace = temp_dir("assessd-schema-warnings");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let class_id = setup_class(&mut stdin, &mut reader, &workspace);

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "schemas.create",
        json!({
            "classId": class_id,
            "schema": {
                "name": "Loose",
                "totalMarks": 100,
                "components": [{
                    "name": "Project",
                    "rawMaxScore": 20,
                    "reducedScore": 10,
                    "subCriteria": [
                        { "name": "Design", "maxScore": 5 },
                        { "name": "Build", "maxScore": 5 }
                    ]
                }]
            }
        }),
    );
    let warnings = created["warnings"].as_array().expect("warnings");
    assert_eq!(warnings.len(), 2, "{:?}", warnings);

    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn formula_check_reports_errors_and_previews() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let valid = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "formula.check",
        json!({
            "formula": "(sum(subScores) / 30) * 5",
            "preview": { "subScores": [5, 5, 5, 5, 10], "rawMax": 30 }
        }),
    );
    assert_eq!(valid["valid"], json!(true));
    assert_eq!(valid["variables"], json!(["subScores"]));
    let value = valid["value"].as_f64().expect("preview value");
    assert!((value - 5.0).abs() < 1e-9, "{}", value);

    let invalid = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "formula.check",
        json!({ "formula": "raw +" }),
    );
    assert_eq!(invalid["valid"], json!(false));
    assert!(invalid["position"].as_u64().is_some());

    let div_zero = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "formula.check",
        json!({ "formula": "raw / rawMax", "preview": { "raw": 3, "rawMax": 0 } }),
    );
    assert_eq!(div_zero["valid"], json!(true));
    assert!(div_zero["value"].is_null());
    assert!(div_zero["previewError"].as_str().is_some());

    let _ = child.kill();
    let _ = child.wait();
}
