use std::collections::BTreeSet;

use crate::audit;
use crate::db;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{get_opt_str, get_required_date, get_required_str, reference_date};
use crate::ipc::types::{AppState, Request};
use crate::journal::{self, JournalError};
use crate::ledger::{self, FactRow};
use rusqlite::Connection;
use serde::Deserialize;
use serde_json::json;

/// One submitted mark. Parsed per element so a malformed record skips that
/// record, not the batch.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkRecord {
    student_id: String,
    #[serde(default)]
    nb_hours: i64,
    #[serde(default)]
    comment: String,
}

fn fact_json(date: &str, fact: &FactRow) -> serde_json::Value {
    json!({
        "attendanceId": fact.id,
        "date": date,
        "status": fact.status,
        "nbHours": fact.nb_hours,
        "comment": fact.comment.clone().unwrap_or_default(),
        "isReasoned": fact.is_reasoned,
        "reasonText": fact.reason_text.clone().unwrap_or_default(),
    })
}

fn mark_day(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let group_id = get_required_str(params, "groupId")?;
    let curator_id = get_required_str(params, "curatorId")?;
    let date = get_required_date(params, "date")?;
    let today = reference_date(params)?;
    let records_raw = params
        .get("records")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    // Gate and window run before anything is written.
    let group = ledger::curator_group(conn, &curator_id, &group_id)?;
    ledger::assert_open(&group)?;
    journal::assert_single_day_editable(today, date)?;

    let submitted = records_raw.len();
    let tx = conn.unchecked_transaction().map_err(JournalError::from)?;
    let lesson_id = ledger::resolve_lesson(&tx, &group.id, date)?;
    let valid_ids = ledger::group_student_ids(&tx, &group.id)?;

    let mut accepted = 0usize;
    let mut touched: BTreeSet<String> = BTreeSet::new();
    for raw in &records_raw {
        let Ok(rec) = serde_json::from_value::<MarkRecord>(raw.clone()) else {
            continue;
        };
        if !valid_ids.contains(&rec.student_id) {
            continue;
        }
        if journal::validate_hours(rec.nb_hours).is_err() {
            continue;
        }
        ledger::upsert_attendance(
            &tx,
            &lesson_id,
            &rec.student_id,
            rec.nb_hours,
            &rec.comment,
            &curator_id,
        )?;
        accepted += 1;
        touched.insert(rec.student_id);
    }
    for sid in &touched {
        ledger::recompute_total(&tx, sid)?;
    }
    tx.commit().map_err(JournalError::from)?;

    audit::log(
        conn,
        Some(&curator_id),
        "DAY_MARKED",
        "attendance",
        Some(&group.id),
        &format!("{}: {} of {} records", date, accepted, submitted),
    );
    Ok(json!({
        "date": date.to_string(),
        "accepted": accepted,
        "submitted": submitted,
        "updatedStudentIds": touched,
    }))
}

fn mark_student(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let group_id = get_required_str(params, "groupId")?;
    let curator_id = get_required_str(params, "curatorId")?;
    let student_id = get_required_str(params, "studentId")?;
    let date = get_required_date(params, "date")?;
    let today = reference_date(params)?;
    // An omitted nbHours means present (0); a value of the wrong type is a
    // caller error, not a zero.
    let nb_hours = match params.get("nbHours") {
        None | Some(serde_json::Value::Null) => 0,
        Some(v) => v
            .as_i64()
            .ok_or_else(|| HandlerErr::new("invalid_hours", "nbHours must be an integer"))?,
    };
    let comment = get_opt_str(params, "comment").unwrap_or_default();

    let group = ledger::curator_group(conn, &curator_id, &group_id)?;
    ledger::assert_open(&group)?;
    journal::assert_single_day_editable(today, date)?;
    // The single record is the subject of the call: bad hours fail it outright.
    journal::validate_hours(nb_hours)?;
    if ledger::student_in_group(conn, &student_id, &group.id)?.is_none() {
        return Err(JournalError::NotFound("student").into());
    }

    let tx = conn.unchecked_transaction().map_err(JournalError::from)?;
    let lesson_id = ledger::resolve_lesson(&tx, &group.id, date)?;
    ledger::upsert_attendance(&tx, &lesson_id, &student_id, nb_hours, &comment, &curator_id)?;
    let total = ledger::recompute_total(&tx, &student_id)?;
    tx.commit().map_err(JournalError::from)?;

    audit::log(
        conn,
        Some(&curator_id),
        "STUDENT_MARKED",
        "attendance",
        Some(&student_id),
        &format!("{}: {} hours", date, nb_hours),
    );
    Ok(json!({
        "studentId": student_id,
        "date": date.to_string(),
        "nbHours": nb_hours,
        "totalAbsentHours": total,
    }))
}

fn save_week(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let group_id = get_required_str(params, "groupId")?;
    let curator_id = get_required_str(params, "curatorId")?;
    let week_start = get_required_date(params, "weekStart")?;
    let today = reference_date(params)?;
    let days = params
        .get("days")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();

    let group = ledger::curator_group(conn, &curator_id, &group_id)?;
    ledger::assert_open(&group)?;
    let monday = journal::assert_weekly_bulk_editable(today, week_start)?;
    let (_, saturday) = journal::week_bounds(monday);

    let tx = conn.unchecked_transaction().map_err(JournalError::from)?;
    let valid_ids = ledger::group_student_ids(&tx, &group.id)?;

    let mut submitted = 0usize;
    let mut accepted = 0usize;
    let mut touched: BTreeSet<String> = BTreeSet::new();
    for (date_str, records) in &days {
        let Some(records) = records.as_array() else {
            continue;
        };
        // Every record in the payload counts as submitted; drops below stay
        // visible in the accepted/submitted gap.
        submitted += records.len();
        let Ok(d) = journal::parse_iso_date(date_str) else {
            continue;
        };
        if d < monday || d > saturday {
            continue;
        }
        let lesson_id = ledger::resolve_lesson(&tx, &group.id, d)?;
        for raw in records {
            let Ok(rec) = serde_json::from_value::<MarkRecord>(raw.clone()) else {
                continue;
            };
            if !valid_ids.contains(&rec.student_id) {
                continue;
            }
            if journal::validate_hours(rec.nb_hours).is_err() {
                continue;
            }
            ledger::upsert_attendance(
                &tx,
                &lesson_id,
                &rec.student_id,
                rec.nb_hours,
                &rec.comment,
                &curator_id,
            )?;
            accepted += 1;
            touched.insert(rec.student_id);
        }
    }
    for sid in &touched {
        ledger::recompute_total(&tx, sid)?;
    }
    tx.commit().map_err(JournalError::from)?;

    audit::log(
        conn,
        Some(&curator_id),
        "WEEK_SAVED",
        "attendance",
        Some(&group.id),
        &format!("week {}: {} of {} records", monday, accepted, submitted),
    );
    Ok(json!({
        "weekStart": monday.to_string(),
        "accepted": accepted,
        "submitted": submitted,
        "updatedStudentIds": touched,
    }))
}

fn week_journal(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let group_id = get_required_str(params, "groupId")?;
    let curator_id = get_required_str(params, "curatorId")?;
    let today = reference_date(params)?;
    let monday = match get_opt_str(params, "weekStart") {
        Some(raw) => journal::snap_to_monday(journal::parse_iso_date(&raw)?),
        None => journal::snap_to_monday(today),
    };
    let (_, saturday) = journal::week_bounds(monday);
    let days = journal::week_days(monday);

    let group = ledger::curator_group(conn, &curator_id, &group_id)?;
    let students = ledger::students_of_group(conn, &group.id)?;
    let lesson_map = ledger::lessons_in_range(conn, &[group.id.clone()], monday, saturday)?;
    let lesson_ids: Vec<String> = lesson_map.values().cloned().collect();
    let facts = ledger::facts_for_lessons(conn, &lesson_ids)?;
    let marked_counts = ledger::attendance_counts(conn, &lesson_ids)?;
    let nb_limit = db::get_setting_i64(conn, "NB_LIMIT_HIGH", 35);

    let total = students.len() as i64;
    let student_rows: Vec<serde_json::Value> = students
        .iter()
        .map(|s| {
            let mut days_data = serde_json::Map::new();
            for d in &days {
                let key = d.to_string();
                let cell = lesson_map
                    .get(&(group.id.clone(), key.clone()))
                    .and_then(|lid| facts.get(&(s.id.clone(), lid.clone())))
                    .map(|f| fact_json(&key, f))
                    .unwrap_or(serde_json::Value::Null);
                days_data.insert(key, cell);
            }
            json!({
                "id": s.id,
                "fullName": s.full_name,
                "studentCode": s.student_code,
                "totalAbsentHours": s.total_absent_hours,
                "isHighRisk": s.total_absent_hours >= nb_limit,
                "days": days_data,
            })
        })
        .collect();

    let mut daily_status = serde_json::Map::new();
    for d in &days {
        let key = d.to_string();
        let marked = lesson_map
            .get(&(group.id.clone(), key.clone()))
            .and_then(|lid| marked_counts.get(lid))
            .copied()
            .unwrap_or(0);
        let status = journal::completion(marked, total);
        daily_status.insert(
            key,
            json!({ "status": status.as_str(), "marked": marked, "total": total }),
        );
    }

    Ok(json!({
        "group": { "id": group.id, "number": group.number, "shift": group.shift },
        "weekStart": monday.to_string(),
        "weekEnd": saturday.to_string(),
        "days": days.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
        "students": student_rows,
        "dailyStatus": daily_status,
        "nbLimit": nb_limit,
        "isCurrentWeek": monday == journal::snap_to_monday(today),
    }))
}

fn justify(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let fact_id = get_required_str(params, "attendanceId")?;
    let actor_id = get_required_str(params, "actorId")?;
    let is_reasoned = params
        .get("isReasoned")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let reason_text = get_opt_str(params, "reasonText").unwrap_or_default();

    let fact = ledger::justify_fact(conn, &fact_id, is_reasoned, &reason_text, &actor_id)?;
    audit::log(
        conn,
        Some(&actor_id),
        "ATTENDANCE_JUSTIFIED",
        "attendance",
        Some(&fact_id),
        &reason_text,
    );
    Ok(json!({
        "attendanceId": fact.id,
        "studentId": fact.student_id,
        "status": fact.status,
        "nbHours": fact.nb_hours,
        "isReasoned": fact.is_reasoned,
        "reasonText": fact.reason_text.clone().unwrap_or_default(),
    }))
}

fn student_history(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let student = ledger::load_student(conn, &student_id)?
        .ok_or(JournalError::NotFound("student"))?;
    let records = ledger::student_history(conn, &student_id)?;
    Ok(json!({
        "studentId": student.id,
        "fullName": student.full_name,
        "totalAbsentHours": student.total_absent_hours,
        "records": records
            .iter()
            .map(|(date, f)| fact_json(date, f))
            .collect::<Vec<_>>(),
    }))
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
        "journal.markDay" => Some(with_conn(state, req, mark_day)),
        "journal.markStudent" => Some(with_conn(state, req, mark_student)),
        "journal.saveWeek" => Some(with_conn(state, req, save_week)),
        "journal.week" => Some(with_conn(state, req, week_journal)),
        "journal.justify" => Some(with_conn(state, req, justify)),
        "journal.studentHistory" => Some(with_conn(state, req, student_history)),
        _ => None,
    }
}
