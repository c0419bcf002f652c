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

const TODAY: &str = "2026-03-04";

fn mark_params(group_id: &str, student_id: &str, hours: i64) -> serde_json::Value {
    json!({
        "groupId": group_id,
        "curatorId": "cur-1",
        "studentId": student_id,
        "date": TODAY,
        "today": TODAY,
        "nbHours": hours,
        "comment": "",
    })
}

#[test]
fn closed_group_rejects_all_journal_mutation_until_reopened() {
    let workspace = temp_dir("nbjournal-lock");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let group = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "groups.create",
        json!({ "number": "303", "shift": 1, "facultyId": "fac-1", "curatorId": "cur-1" }),
    );
    let group_id = group["id"].as_str().expect("group id").to_string();
    let s1 = request_ok(
        &mut stdin,
        &mut reader,
        "s1",
        "students.add",
        json!({ "groupId": group_id, "fullName": "Nazarov Jamshed" }),
    )["id"]
        .as_str()
        .expect("id")
        .to_string();

    let marked = request_ok(
        &mut stdin,
        &mut reader,
        "m1",
        "journal.markStudent",
        mark_params(&group_id, &s1, 2),
    );
    assert_eq!(marked["totalAbsentHours"].as_i64(), Some(2));

    let closed = request_ok(
        &mut stdin,
        &mut reader,
        "c1",
        "groups.close",
        json!({ "groupId": group_id, "actorId": "vd-1" }),
    );
    assert_eq!(closed["isClosed"].as_bool(), Some(true));

    // The closure is reported as such, even though closing also clears the
    // activation flag.
    let resp = request(
        &mut stdin,
        &mut reader,
        "m2",
        "journal.markStudent",
        mark_params(&group_id, &s1, 3),
    );
    assert_err_code(&resp, "group_closed");

    let resp = request(
        &mut stdin,
        &mut reader,
        "m2b",
        "journal.markDay",
        json!({
            "groupId": group_id,
            "curatorId": "cur-1",
            "date": TODAY,
            "today": TODAY,
            "records": [{ "studentId": s1, "nbHours": 3, "comment": "" }],
        }),
    );
    assert_err_code(&resp, "group_closed");

    // Closing twice is rejected.
    let resp = request(
        &mut stdin,
        &mut reader,
        "c2",
        "groups.close",
        json!({ "groupId": group_id, "actorId": "vd-1" }),
    );
    assert_err_code(&resp, "group_closed");

    // Curators cannot be assigned onto a closed group either.
    let resp = request(
        &mut stdin,
        &mut reader,
        "a1",
        "groups.assignCurator",
        json!({ "groupId": group_id, "curatorId": "cur-2", "actorId": "vd-1" }),
    );
    assert_err_code(&resp, "group_closed");

    // The total never moved while the group was closed.
    let roster = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "students.list",
        json!({ "groupId": group_id }),
    );
    assert_eq!(
        roster["students"][0]["totalAbsentHours"].as_i64(),
        Some(2)
    );

    // Reopen restores the gate and the activation flag.
    let reopened = request_ok(
        &mut stdin,
        &mut reader,
        "o1",
        "groups.reopen",
        json!({ "groupId": group_id, "actorId": "vd-1" }),
    );
    assert_eq!(reopened["isClosed"].as_bool(), Some(false));

    let marked = request_ok(
        &mut stdin,
        &mut reader,
        "m3",
        "journal.markStudent",
        mark_params(&group_id, &s1, 3),
    );
    assert_eq!(marked["totalAbsentHours"].as_i64(), Some(3));

    // Reopening an open group is rejected.
    let resp = request(
        &mut stdin,
        &mut reader,
        "o2",
        "groups.reopen",
        json!({ "groupId": group_id, "actorId": "vd-1" }),
    );
    assert_err_code(&resp, "not_closed");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn curator_without_active_group_is_rejected() {
    let workspace = temp_dir("nbjournal-no-active");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let group = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "groups.create",
        json!({ "number": "404", "shift": 1, "facultyId": "fac-1", "curatorId": "cur-1" }),
    );
    let group_id = group["id"].as_str().expect("group id").to_string();
    let s1 = request_ok(
        &mut stdin,
        &mut reader,
        "s1",
        "students.add",
        json!({ "groupId": group_id, "fullName": "Qodirova Nigina" }),
    )["id"]
        .as_str()
        .expect("id")
        .to_string();

    // A different curator does not own this group.
    let resp = request(
        &mut stdin,
        &mut reader,
        "m1",
        "journal.markStudent",
        json!({
            "groupId": group_id,
            "curatorId": "cur-other",
            "studentId": s1,
            "date": TODAY,
            "today": TODAY,
            "nbHours": 2,
        }),
    );
    assert_err_code(&resp, "no_active_group");

    // Unassigning the curator leaves the group without an owner.
    request_ok(
        &mut stdin,
        &mut reader,
        "a1",
        "groups.assignCurator",
        json!({ "groupId": group_id, "curatorId": null, "actorId": "vd-1" }),
    );
    let resp = request(
        &mut stdin,
        &mut reader,
        "m2",
        "journal.markStudent",
        mark_params(&group_id, &s1, 2),
    );
    assert_err_code(&resp, "no_active_group");

    // Re-assignment reactivates the group for its curator.
    let assigned = request_ok(
        &mut stdin,
        &mut reader,
        "a2",
        "groups.assignCurator",
        json!({ "groupId": group_id, "curatorId": "cur-1", "actorId": "vd-1" }),
    );
    assert_eq!(assigned["isActive"].as_bool(), Some(true));
    request_ok(
        &mut stdin,
        &mut reader,
        "m3",
        "journal.markStudent",
        mark_params(&group_id, &s1, 2),
    );

    // An unknown group is reported as missing, not as a gate failure.
    let resp = request(
        &mut stdin,
        &mut reader,
        "m4",
        "journal.markStudent",
        mark_params("no-such-group", &s1, 2),
    );
    assert_err_code(&resp, "not_found");

    drop(stdin);
    let _ = child.wait();
}
