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
    let exe = env!("CARGO_BIN_EXE_nbjournald");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn nbjournald");
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
    assert!(!line.trim().is_empty(), "empty response for {}", method);
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
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn assert_err_code(value: &serde_json::Value, code: &str) {
    assert_eq!(value["ok"].as_bool(), Some(false), "expected error: {}", value);
    assert_eq!(
        value["error"]["code"].as_str(),
        Some(code),
        "unexpected error: {}",
        value
    );
}

// Week under test: Monday 2026-03-02 .. Saturday 2026-03-07.
const MONDAY: &str = "2026-03-02";
const TUESDAY: &str = "2026-03-03";
const WEDNESDAY: &str = "2026-03-04";
const SATURDAY: &str = "2026-03-07";

fn seed(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> (String, String, String) {
    request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let group = request_ok(
        stdin,
        reader,
        "g1",
        "groups.create",
        json!({ "number": "202", "shift": 2, "facultyId": "fac-1", "curatorId": "cur-1" }),
    );
    let group_id = group["id"].as_str().expect("group id").to_string();
    let s1 = request_ok(
        stdin,
        reader,
        "s1",
        "students.add",
        json!({ "groupId": group_id, "fullName": "Aliev Firdavs" }),
    )["id"]
        .as_str()
        .expect("id")
        .to_string();
    let s2 = request_ok(
        stdin,
        reader,
        "s2",
        "students.add",
        json!({ "groupId": group_id, "fullName": "Saidova Malika" }),
    )["id"]
        .as_str()
        .expect("id")
        .to_string();
    (group_id, s1, s2)
}

fn total_for(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    group_id: &str,
    student_id: &str,
) -> i64 {
    let roster = request_ok(
        stdin,
        reader,
        "roster",
        "students.list",
        json!({ "groupId": group_id }),
    );
    roster["students"]
        .as_array()
        .expect("students")
        .iter()
        .find(|s| s["id"].as_str() == Some(student_id))
        .expect("student")["totalAbsentHours"]
        .as_i64()
        .expect("total")
}

#[test]
fn mark_day_outside_current_week_writes_nothing() {
    let workspace = temp_dir("nbjournal-out-of-window");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (group_id, s1, _) = seed(&mut stdin, &mut reader, &workspace);

    // Previous week's Wednesday while "today" is inside the week under test.
    let resp = request(
        &mut stdin,
        &mut reader,
        "m1",
        "journal.markDay",
        json!({
            "groupId": group_id,
            "curatorId": "cur-1",
            "date": "2026-02-25",
            "today": WEDNESDAY,
            "records": [{ "studentId": s1, "nbHours": 4, "comment": "" }],
        }),
    );
    assert_err_code(&resp, "out_of_window");
    assert_eq!(total_for(&mut stdin, &mut reader, &group_id, &s1), 0);

    // Sunday of the current calendar week is outside the window too.
    let resp = request(
        &mut stdin,
        &mut reader,
        "m2",
        "journal.markDay",
        json!({
            "groupId": group_id,
            "curatorId": "cur-1",
            "date": "2026-03-08",
            "today": WEDNESDAY,
            "records": [{ "studentId": s1, "nbHours": 4, "comment": "" }],
        }),
    );
    assert_err_code(&resp, "out_of_window");
    assert_eq!(total_for(&mut stdin, &mut reader, &group_id, &s1), 0);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn save_week_is_saturday_only() {
    let workspace = temp_dir("nbjournal-wrong-day");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (group_id, s1, _) = seed(&mut stdin, &mut reader, &workspace);

    let resp = request(
        &mut stdin,
        &mut reader,
        "w1",
        "journal.saveWeek",
        json!({
            "groupId": group_id,
            "curatorId": "cur-1",
            "weekStart": MONDAY,
            "today": TUESDAY,
            "days": {
                MONDAY: [{ "studentId": s1, "nbHours": 2, "comment": "" }],
            },
        }),
    );
    assert_err_code(&resp, "wrong_day");
    assert_eq!(total_for(&mut stdin, &mut reader, &group_id, &s1), 0);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn save_week_rejects_other_weeks_even_on_saturday() {
    let workspace = temp_dir("nbjournal-wrong-week");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (group_id, s1, _) = seed(&mut stdin, &mut reader, &workspace);

    let resp = request(
        &mut stdin,
        &mut reader,
        "w1",
        "journal.saveWeek",
        json!({
            "groupId": group_id,
            "curatorId": "cur-1",
            "weekStart": "2026-02-23",
            "today": SATURDAY,
            "days": {
                "2026-02-23": [{ "studentId": s1, "nbHours": 2, "comment": "" }],
            },
        }),
    );
    assert_err_code(&resp, "out_of_window");
    assert_eq!(total_for(&mut stdin, &mut reader, &group_id, &s1), 0);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn save_week_on_saturday_writes_all_days_and_unions_totals() {
    let workspace = temp_dir("nbjournal-save-week");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (group_id, s1, s2) = seed(&mut stdin, &mut reader, &workspace);

    let resp = request_ok(
        &mut stdin,
        &mut reader,
        "w1",
        "journal.saveWeek",
        json!({
            "groupId": group_id,
            "curatorId": "cur-1",
            // Mid-week date snaps to its Monday.
            "weekStart": WEDNESDAY,
            "today": SATURDAY,
            "days": {
                MONDAY: [
                    { "studentId": s1, "nbHours": 2, "comment": "" },
                    { "studentId": s2, "nbHours": 0, "comment": "" },
                ],
                TUESDAY: [
                    { "studentId": s1, "nbHours": 3, "comment": "" },
                ],
                // Outside the declared week: the whole day is skipped.
                "2026-03-09": [
                    { "studentId": s1, "nbHours": 8, "comment": "" },
                ],
                "not-a-date": [
                    { "studentId": s1, "nbHours": 1, "comment": "" },
                ],
            },
        }),
    );
    assert_eq!(resp["weekStart"].as_str(), Some(MONDAY));
    // The out-of-week day and the bad date key still count as submitted, so
    // their drops show up in the gap.
    assert_eq!(resp["accepted"].as_u64(), Some(3));
    assert_eq!(resp["submitted"].as_u64(), Some(5));

    // s1 accumulated across both days; the out-of-week 8 hours never landed.
    assert_eq!(total_for(&mut stdin, &mut reader, &group_id, &s1), 5);
    assert_eq!(total_for(&mut stdin, &mut reader, &group_id, &s2), 0);

    let week = request_ok(
        &mut stdin,
        &mut reader,
        "wk",
        "journal.week",
        json!({
            "groupId": group_id,
            "curatorId": "cur-1",
            "weekStart": MONDAY,
            "today": SATURDAY,
        }),
    );
    assert_eq!(week["dailyStatus"][MONDAY]["status"].as_str(), Some("COMPLETED"));
    assert_eq!(week["dailyStatus"][TUESDAY]["status"].as_str(), Some("IN_PROGRESS"));
    assert_eq!(week["dailyStatus"][SATURDAY]["status"].as_str(), Some("NOT_STARTED"));
    assert_eq!(week["isCurrentWeek"].as_bool(), Some(true));

    drop(stdin);
    let _ = child.wait();
}
