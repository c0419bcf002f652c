use std::collections::HashMap;

use crate::db;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{get_opt_str, get_required_str, reference_date};
use crate::ipc::types::{AppState, Request};
use crate::journal::{self, Completion};
use crate::ledger;
use rusqlite::Connection;
use serde_json::json;

/// Per-group completion for one day across a faculty. Live counts, one query
/// per data kind.
fn control_daily(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let faculty_id = get_required_str(params, "facultyId")?;
    let date = match get_opt_str(params, "date") {
        Some(raw) => journal::parse_iso_date(&raw)?,
        None => reference_date(params)?,
    };

    let groups = ledger::active_groups_of_faculty(conn, &faculty_id)?;
    if groups.is_empty() {
        return Ok(json!({
            "date": date.to_string(),
            "summary": { "totalGroups": 0, "completed": 0, "inProgress": 0, "notStarted": 0 },
            "groups": [],
        }));
    }

    let group_ids: Vec<String> = groups.iter().map(|g| g.id.clone()).collect();
    let lesson_map = ledger::lessons_on_date(conn, &group_ids, date)?;
    let lesson_ids: Vec<String> = lesson_map.values().cloned().collect();
    let att_counts = ledger::attendance_counts(conn, &lesson_ids)?;
    let student_counts = ledger::student_counts(conn, &group_ids)?;

    let mut completed = 0i64;
    let mut in_progress = 0i64;
    let mut not_started = 0i64;
    let rows: Vec<serde_json::Value> = groups
        .iter()
        .map(|g| {
            let total = student_counts.get(&g.id).copied().unwrap_or(0);
            let lesson_id = lesson_map.get(&g.id);
            let marked = lesson_id
                .and_then(|lid| att_counts.get(lid))
                .copied()
                .unwrap_or(0);
            let status = journal::completion(marked, total);
            match status {
                Completion::Completed => completed += 1,
                Completion::InProgress => in_progress += 1,
                Completion::NotStarted => not_started += 1,
            }
            let pct = if total > 0 {
                ((marked as f64) / (total as f64) * 100.0).round() as i64
            } else {
                0
            };
            json!({
                "groupId": g.id,
                "groupNumber": g.number,
                "shift": g.shift,
                "courseYear": g.course_year,
                "curatorId": g.curator_id,
                "totalStudents": total,
                "marked": marked,
                "completionPercentage": pct,
                "status": status.as_str(),
                "lessonId": lesson_id,
            })
        })
        .collect();

    Ok(json!({
        "date": date.to_string(),
        "summary": {
            "totalGroups": rows.len(),
            "completed": completed,
            "inProgress": in_progress,
            "notStarted": not_started,
        },
        "groups": rows,
    }))
}

/// Per-group, per-day completion for a six-day week, with missing days and a
/// completed-days percentage.
fn control_weekly(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let faculty_id = get_required_str(params, "facultyId")?;
    let monday = match get_opt_str(params, "weekStart") {
        Some(raw) => journal::snap_to_monday(journal::parse_iso_date(&raw)?),
        None => journal::snap_to_monday(reference_date(params)?),
    };
    let (_, saturday) = journal::week_bounds(monday);
    let days = journal::week_days(monday);

    let groups = ledger::active_groups_of_faculty(conn, &faculty_id)?;
    if groups.is_empty() {
        return Ok(json!({
            "weekStart": monday.to_string(),
            "weekEnd": saturday.to_string(),
            "days": days.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
            "groups": [],
        }));
    }

    let group_ids: Vec<String> = groups.iter().map(|g| g.id.clone()).collect();
    let lesson_map = ledger::lessons_in_range(conn, &group_ids, monday, saturday)?;
    let lesson_ids: Vec<String> = lesson_map.values().cloned().collect();
    let att_counts = ledger::attendance_counts(conn, &lesson_ids)?;
    let student_counts = ledger::student_counts(conn, &group_ids)?;

    let rows: Vec<serde_json::Value> = groups
        .iter()
        .map(|g| {
            let total = student_counts.get(&g.id).copied().unwrap_or(0);
            let mut days_status = serde_json::Map::new();
            let mut missing_days: Vec<String> = Vec::new();
            let mut completed_days = 0i64;
            for d in &days {
                let key = d.to_string();
                let marked = lesson_map
                    .get(&(g.id.clone(), key.clone()))
                    .and_then(|lid| att_counts.get(lid))
                    .copied()
                    .unwrap_or(0);
                let status = journal::completion(marked, total);
                if status == Completion::Completed {
                    completed_days += 1;
                } else {
                    missing_days.push(key.clone());
                }
                days_status.insert(
                    key,
                    json!({ "status": status.as_str(), "marked": marked, "total": total }),
                );
            }
            json!({
                "groupId": g.id,
                "groupNumber": g.number,
                "shift": g.shift,
                "courseYear": g.course_year,
                "curatorId": g.curator_id,
                "totalStudents": total,
                "days": days_status,
                "missingDays": missing_days,
                "completionPct": journal::completion_pct(completed_days),
            })
        })
        .collect();

    Ok(json!({
        "weekStart": monday.to_string(),
        "weekEnd": saturday.to_string(),
        "days": days.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
        "groups": rows,
    }))
}

/// Students at or over the high-absence threshold, worst first.
fn control_at_risk(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let faculty_id = get_required_str(params, "facultyId")?;
    let group_filter = get_opt_str(params, "groupId");
    let nb_limit = db::get_setting_i64(conn, "NB_LIMIT_HIGH", 35);

    let groups = ledger::active_groups_of_faculty(conn, &faculty_id)?;
    let numbers: HashMap<String, String> = groups
        .iter()
        .map(|g| (g.id.clone(), g.number.clone()))
        .collect();

    let mut sql = String::from(
        "SELECT s.id, s.student_code, s.full_name, s.total_absent_hours, s.group_id
         FROM students s
         JOIN groups g ON g.id = s.group_id
         WHERE g.faculty_id = ? AND g.is_deleted = 0 AND s.is_deleted = 0
           AND s.total_absent_hours >= ?",
    );
    if group_filter.is_some() {
        sql.push_str(" AND s.group_id = ?");
    }
    sql.push_str(" ORDER BY s.total_absent_hours DESC");

    let mut stmt = conn
        .prepare(&sql)
        .map_err(crate::journal::JournalError::from)?;
    let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<(String, Option<String>, String, i64, String)> {
        Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
    };
    let raw = match &group_filter {
        Some(gid) => stmt
            .query_map(
                rusqlite::params![faculty_id, nb_limit, gid],
                map_row,
            )
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map(rusqlite::params![faculty_id, nb_limit], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    }
    .map_err(crate::journal::JournalError::from)?;

    let rows: Vec<serde_json::Value> = raw
        .into_iter()
        .map(|(id, code, name, total, gid)| {
            json!({
                "id": id,
                "studentCode": code,
                "fullName": name,
                "totalAbsentHours": total,
                "groupId": gid,
                "groupNumber": numbers.get(&gid),
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
        "control.daily" => Some(with_conn(state, req, control_daily)),
        "control.weekly" => Some(with_conn(state, req, control_weekly)),
        "control.atRisk" => Some(with_conn(state, req, control_at_risk)),
        _ => None,
    }
}
