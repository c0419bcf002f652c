use crate::audit;
use crate::db;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{get_opt_str, get_required_str};
use crate::ipc::types::{AppState, Request};
use crate::journal::JournalError;
use crate::ledger;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn students_add(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let group_id = get_required_str(params, "groupId")?;
    let full_name = get_required_str(params, "fullName")?;
    let student_code = get_opt_str(params, "studentCode");
    let actor = get_opt_str(params, "actorId");

    let group = ledger::load_group(conn, &group_id)?
        .ok_or(JournalError::NotFound("group"))?;
    if group.is_closed {
        return Err(JournalError::GroupClosed.into());
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, group_id, student_code, full_name, total_absent_hours)
         VALUES(?, ?, ?, ?, 0)",
        (&id, &group_id, &student_code, &full_name),
    )
    .map_err(JournalError::from)?;

    audit::log(conn, actor.as_deref(), "STUDENT_CREATED", "students", Some(&id), &full_name);
    Ok(json!({ "id": id, "fullName": full_name, "studentCode": student_code }))
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let group_id = get_required_str(params, "groupId")?;
    if ledger::load_group(conn, &group_id)?.is_none() {
        return Err(JournalError::NotFound("group").into());
    }
    let nb_limit = db::get_setting_i64(conn, "NB_LIMIT_HIGH", 35);
    let students = ledger::students_of_group(conn, &group_id)?;
    let rows: Vec<serde_json::Value> = students
        .iter()
        .map(|s| {
            json!({
                "id": s.id,
                "studentCode": s.student_code,
                "fullName": s.full_name,
                "totalAbsentHours": s.total_absent_hours,
                "isHighRisk": s.total_absent_hours >= nb_limit,
            })
        })
        .collect();
    Ok(json!({ "nbLimit": nb_limit, "students": rows }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.add" => Some(with_conn(state, req, students_add)),
        "students.list" => Some(with_conn(state, req, students_list)),
        _ => None,
    }
}
