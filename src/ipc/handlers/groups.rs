use crate::audit;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{get_i64_or, get_opt_str, get_required_str};
use crate::ipc::types::{AppState, Request};
use crate::journal::JournalError;
use crate::ledger;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn group_json(g: &ledger::GroupRow) -> serde_json::Value {
    json!({
        "id": g.id,
        "number": g.number,
        "shift": g.shift,
        "courseYear": g.course_year,
        "facultyId": g.faculty_id,
        "curatorId": g.curator_id,
        "isActive": g.is_active,
        "isClosed": g.is_closed,
    })
}

fn groups_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let number = get_required_str(params, "number")?;
    let faculty_id = get_required_str(params, "facultyId")?;
    let shift = get_i64_or(params, "shift", 1);
    if !(shift == 1 || shift == 2) {
        return Err(HandlerErr::new("bad_params", "shift must be 1 or 2"));
    }
    let course_year = params.get("courseYear").and_then(|v| v.as_i64());
    let curator_id = get_opt_str(params, "curatorId");
    let actor = get_opt_str(params, "actorId");

    let id = Uuid::new_v4().to_string();
    // New groups get an explicit activation flag; only legacy rows leave it unset.
    conn.execute(
        "INSERT INTO groups(id, number, shift, course_year, faculty_id, curator_id, is_active, is_closed)
         VALUES(?, ?, ?, ?, ?, ?, 1, 0)",
        (&id, &number, shift, course_year, &faculty_id, &curator_id),
    )
    .map_err(JournalError::from)?;

    audit::log(conn, actor.as_deref(), "GROUP_CREATED", "groups", Some(&id), &number);
    Ok(json!({ "id": id, "number": number }))
}

fn groups_assign_curator(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let group_id = get_required_str(params, "groupId")?;
    let actor = get_opt_str(params, "actorId");
    let group = ledger::load_group(conn, &group_id)?
        .ok_or(JournalError::NotFound("group"))?;
    if group.is_closed {
        return Err(JournalError::GroupClosed.into());
    }

    let curator_id = params.get("curatorId").and_then(|v| v.as_str());
    match curator_id {
        Some(cid) => {
            // Assignment activates the group.
            conn.execute(
                "UPDATE groups SET curator_id = ?, is_active = 1 WHERE id = ?",
                (cid, &group_id),
            )
            .map_err(JournalError::from)?;
            audit::log(
                conn,
                actor.as_deref(),
                "CURATOR_ASSIGNED",
                "groups",
                Some(&group_id),
                &format!("{} -> {}", cid, group.number),
            );
        }
        None => {
            conn.execute(
                "UPDATE groups SET curator_id = NULL WHERE id = ?",
                [&group_id],
            )
            .map_err(JournalError::from)?;
            audit::log(
                conn,
                actor.as_deref(),
                "CURATOR_REMOVED",
                "groups",
                Some(&group_id),
                &group.number,
            );
        }
    }
    let updated = ledger::load_group(conn, &group_id)?
        .ok_or(JournalError::NotFound("group"))?;
    Ok(group_json(&updated))
}

fn groups_close(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let group_id = get_required_str(params, "groupId")?;
    let actor = get_opt_str(params, "actorId");
    let group = ledger::load_group(conn, &group_id)?
        .ok_or(JournalError::NotFound("group"))?;
    if group.is_closed {
        return Err(HandlerErr::new("group_closed", "group is already closed"));
    }
    // Closing freezes the journal and drops the group out of the active set.
    conn.execute(
        "UPDATE groups SET is_closed = 1, is_active = 0 WHERE id = ?",
        [&group_id],
    )
    .map_err(JournalError::from)?;
    audit::log(
        conn,
        actor.as_deref(),
        "GROUP_CLOSED",
        "groups",
        Some(&group_id),
        &group.number,
    );
    Ok(json!({ "groupId": group_id, "number": group.number, "isClosed": true }))
}

fn groups_reopen(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let group_id = get_required_str(params, "groupId")?;
    let actor = get_opt_str(params, "actorId");
    let group = ledger::load_group(conn, &group_id)?
        .ok_or(JournalError::NotFound("group"))?;
    if !group.is_closed {
        return Err(HandlerErr::new("not_closed", "group is not closed"));
    }
    conn.execute(
        "UPDATE groups SET is_closed = 0, is_active = 1 WHERE id = ?",
        [&group_id],
    )
    .map_err(JournalError::from)?;
    audit::log(
        conn,
        actor.as_deref(),
        "GROUP_REOPENED",
        "groups",
        Some(&group_id),
        &group.number,
    );
    Ok(json!({ "groupId": group_id, "number": group.number, "isClosed": false }))
}

fn groups_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let faculty_id = get_opt_str(params, "facultyId");
    let mut sql = String::from(
        "SELECT id, number, shift, course_year, faculty_id, curator_id, is_active, is_closed
         FROM groups WHERE is_deleted = 0",
    );
    if faculty_id.is_some() {
        sql.push_str(" AND faculty_id = ?");
    }
    sql.push_str(" ORDER BY number");

    let mut stmt = conn.prepare(&sql).map_err(JournalError::from)?;
    let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<serde_json::Value> {
        Ok(json!({
            "id": r.get::<_, String>(0)?,
            "number": r.get::<_, String>(1)?,
            "shift": r.get::<_, i64>(2)?,
            "courseYear": r.get::<_, Option<i64>>(3)?,
            "facultyId": r.get::<_, String>(4)?,
            "curatorId": r.get::<_, Option<String>>(5)?,
            "isActive": r.get::<_, Option<i64>>(6)?.map(|v| v != 0),
            "isClosed": r.get::<_, i64>(7)? != 0,
        }))
    };
    let rows = match &faculty_id {
        Some(fid) => stmt
            .query_map([fid], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    }
    .map_err(JournalError::from)?;
    Ok(json!({ "groups": rows }))
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
        "groups.create" => Some(with_conn(state, req, groups_create)),
        "groups.assignCurator" => Some(with_conn(state, req, groups_assign_curator)),
        "groups.close" => Some(with_conn(state, req, groups_close)),
        "groups.reopen" => Some(with_conn(state, req, groups_reopen)),
        "groups.list" => Some(with_conn(state, req, groups_list)),
        _ => None,
    }
}
