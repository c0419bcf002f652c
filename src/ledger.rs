//! All SQL that touches the shared ledger (groups, lessons, attendance
//! facts, cached totals). Handlers orchestrate; nothing else writes these
//! tables directly.

use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use uuid::Uuid;

use crate::journal::{self, JournalError};

#[derive(Debug, Clone)]
pub struct GroupRow {
    pub id: String,
    pub number: String,
    pub shift: i64,
    pub course_year: Option<i64>,
    pub faculty_id: String,
    pub curator_id: Option<String>,
    // None means the activation flag was never set; legacy rows count as active.
    pub is_active: Option<bool>,
    pub is_closed: bool,
}

#[derive(Debug, Clone)]
pub struct StudentRow {
    pub id: String,
    pub student_code: Option<String>,
    pub full_name: String,
    pub total_absent_hours: i64,
}

#[derive(Debug, Clone)]
pub struct FactRow {
    pub id: String,
    pub student_id: String,
    pub lesson_id: String,
    pub status: String,
    pub nb_hours: i64,
    pub comment: Option<String>,
    pub is_reasoned: bool,
    pub reason_text: Option<String>,
}

fn group_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<GroupRow> {
    Ok(GroupRow {
        id: r.get(0)?,
        number: r.get(1)?,
        shift: r.get(2)?,
        course_year: r.get(3)?,
        faculty_id: r.get(4)?,
        curator_id: r.get(5)?,
        is_active: r
            .get::<_, Option<i64>>(6)?
            .map(|v| v != 0),
        is_closed: r.get::<_, i64>(7)? != 0,
    })
}

const GROUP_COLS: &str =
    "id, number, shift, course_year, faculty_id, curator_id, is_active, is_closed";

pub fn load_group(conn: &Connection, group_id: &str) -> Result<Option<GroupRow>, JournalError> {
    let sql = format!(
        "SELECT {GROUP_COLS} FROM groups WHERE id = ? AND is_deleted = 0"
    );
    Ok(conn
        .query_row(&sql, [group_id], |r| group_from_row(r))
        .optional()?)
}

/// The lock gate for curator-facing calls: the acting curator must own the
/// named group and the group must be active. `is_active IS NULL` passes,
/// matching legacy rows created before the flag existed.
pub fn curator_group(
    conn: &Connection,
    curator_id: &str,
    group_id: &str,
) -> Result<GroupRow, JournalError> {
    let sql = format!(
        "SELECT {GROUP_COLS} FROM groups
         WHERE id = ? AND curator_id = ? AND is_deleted = 0
           AND (is_active IS NULL OR is_active != 0)"
    );
    let found = conn
        .query_row(&sql, [group_id, curator_id], |r| group_from_row(r))
        .optional()?;
    match found {
        Some(g) => Ok(g),
        // Closing clears the activation flag, so a closed group never passes
        // the filter above; report the closure itself, not the side effect.
        None => match load_group(conn, group_id)? {
            None => Err(JournalError::NotFound("group")),
            Some(g) if g.is_closed => Err(JournalError::GroupClosed),
            Some(_) => Err(JournalError::NoActiveGroup),
        },
    }
}

pub fn assert_open(group: &GroupRow) -> Result<(), JournalError> {
    if group.is_closed {
        return Err(JournalError::GroupClosed);
    }
    Ok(())
}

/// Maps (group, date) to its unique lesson, creating one on first write.
/// The UNIQUE(group_id, lesson_date) constraint makes the insert race-safe;
/// a conflicting insert is a no-op and the follow-up select wins either way.
pub fn resolve_lesson(
    conn: &Connection,
    group_id: &str,
    date: NaiveDate,
) -> Result<String, JournalError> {
    let date_str = date.to_string();
    conn.execute(
        "INSERT INTO lessons(id, group_id, lesson_date, subject, lesson_type)
         VALUES(?, ?, ?, 'Lesson', 'lecture')
         ON CONFLICT(group_id, lesson_date) DO NOTHING",
        (Uuid::new_v4().to_string(), group_id, &date_str),
    )?;
    let id = conn.query_row(
        "SELECT id FROM lessons WHERE group_id = ? AND lesson_date = ?",
        (group_id, &date_str),
        |r| r.get(0),
    )?;
    Ok(id)
}

/// Writes one attendance fact for (student, lesson). An existing fact is
/// overwritten in place; nothing is ever deleted. Does not touch the cached
/// total; callers recompute it once per touched student.
pub fn upsert_attendance(
    conn: &Connection,
    lesson_id: &str,
    student_id: &str,
    nb_hours: i64,
    comment: &str,
    marked_by: &str,
) -> Result<(), JournalError> {
    let nb_hours = journal::validate_hours(nb_hours)?;
    let status = journal::derive_status(nb_hours);
    conn.execute(
        "INSERT INTO attendance(id, student_id, lesson_id, status, nb_hours, comment, marked_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, lesson_id) DO UPDATE SET
           status = excluded.status,
           nb_hours = excluded.nb_hours,
           comment = excluded.comment,
           marked_by = excluded.marked_by,
           updated_at = excluded.updated_at",
        (
            Uuid::new_v4().to_string(),
            student_id,
            lesson_id,
            status,
            nb_hours,
            comment,
            marked_by,
            chrono::Utc::now().to_rfc3339(),
        ),
    )?;
    Ok(())
}

/// Full recomputation of the cached total from source facts. Never an
/// incremental delta, so it self-heals no matter how the preceding batch
/// went. Runs inside the caller's transaction; a failure here fails the
/// whole unit of work.
pub fn recompute_total(conn: &Connection, student_id: &str) -> Result<i64, JournalError> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(nb_hours), 0) FROM attendance
         WHERE student_id = ? AND status = 'absent'",
        [student_id],
        |r| r.get(0),
    )?;
    conn.execute(
        "UPDATE students SET total_absent_hours = ? WHERE id = ?",
        (total, student_id),
    )?;
    Ok(total)
}

pub fn group_student_ids(
    conn: &Connection,
    group_id: &str,
) -> Result<HashSet<String>, JournalError> {
    let mut stmt =
        conn.prepare("SELECT id FROM students WHERE group_id = ? AND is_deleted = 0")?;
    let ids = stmt
        .query_map([group_id], |r| r.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(ids)
}

pub fn students_of_group(
    conn: &Connection,
    group_id: &str,
) -> Result<Vec<StudentRow>, JournalError> {
    let mut stmt = conn.prepare(
        "SELECT id, student_code, full_name, total_absent_hours
         FROM students
         WHERE group_id = ? AND is_deleted = 0
         ORDER BY full_name",
    )?;
    let rows = stmt
        .query_map([group_id], |r| {
            Ok(StudentRow {
                id: r.get(0)?,
                student_code: r.get(1)?,
                full_name: r.get(2)?,
                total_absent_hours: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn student_in_group(
    conn: &Connection,
    student_id: &str,
    group_id: &str,
) -> Result<Option<StudentRow>, JournalError> {
    Ok(conn
        .query_row(
            "SELECT id, student_code, full_name, total_absent_hours
             FROM students
             WHERE id = ? AND group_id = ? AND is_deleted = 0",
            [student_id, group_id],
            |r| {
                Ok(StudentRow {
                    id: r.get(0)?,
                    student_code: r.get(1)?,
                    full_name: r.get(2)?,
                    total_absent_hours: r.get(3)?,
                })
            },
        )
        .optional()?)
}

pub fn load_student(
    conn: &Connection,
    student_id: &str,
) -> Result<Option<StudentRow>, JournalError> {
    Ok(conn
        .query_row(
            "SELECT id, student_code, full_name, total_absent_hours
             FROM students
             WHERE id = ? AND is_deleted = 0",
            [student_id],
            |r| {
                Ok(StudentRow {
                    id: r.get(0)?,
                    student_code: r.get(1)?,
                    full_name: r.get(2)?,
                    total_absent_hours: r.get(3)?,
                })
            },
        )
        .optional()?)
}

const FACT_COLS: &str =
    "id, student_id, lesson_id, status, nb_hours, comment, is_reasoned, reason_text";

fn fact_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<FactRow> {
    Ok(FactRow {
        id: r.get(0)?,
        student_id: r.get(1)?,
        lesson_id: r.get(2)?,
        status: r.get(3)?,
        nb_hours: r.get(4)?,
        comment: r.get(5)?,
        is_reasoned: r.get::<_, i64>(6)? != 0,
        reason_text: r.get(7)?,
    })
}

pub fn load_fact(conn: &Connection, fact_id: &str) -> Result<Option<FactRow>, JournalError> {
    let sql = format!("SELECT {FACT_COLS} FROM attendance WHERE id = ?");
    Ok(conn
        .query_row(&sql, [fact_id], |r| fact_from_row(r))
        .optional()?)
}

/// Supervisory justification sub-state. Independent of the hours value; the
/// fact itself is untouched beyond the reasoned fields.
pub fn justify_fact(
    conn: &Connection,
    fact_id: &str,
    is_reasoned: bool,
    reason_text: &str,
    reasoned_by: &str,
) -> Result<FactRow, JournalError> {
    let changed = conn.execute(
        "UPDATE attendance SET is_reasoned = ?, reason_text = ?, reasoned_by = ?, updated_at = ?
         WHERE id = ?",
        (
            is_reasoned as i64,
            reason_text,
            reasoned_by,
            chrono::Utc::now().to_rfc3339(),
            fact_id,
        ),
    )?;
    if changed == 0 {
        return Err(JournalError::NotFound("attendance fact"));
    }
    load_fact(conn, fact_id)?.ok_or(JournalError::NotFound("attendance fact"))
}

/// All facts for a student, newest lesson first, with the lesson date.
pub fn student_history(
    conn: &Connection,
    student_id: &str,
) -> Result<Vec<(String, FactRow)>, JournalError> {
    let mut stmt = conn.prepare(
        "SELECT l.lesson_date, a.id, a.student_id, a.lesson_id, a.status, a.nb_hours,
                a.comment, a.is_reasoned, a.reason_text
         FROM attendance a
         JOIN lessons l ON l.id = a.lesson_id
         WHERE a.student_id = ?
         ORDER BY l.lesson_date DESC",
    )?;
    let rows = stmt
        .query_map([student_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                FactRow {
                    id: r.get(1)?,
                    student_id: r.get(2)?,
                    lesson_id: r.get(3)?,
                    status: r.get(4)?,
                    nb_hours: r.get(5)?,
                    comment: r.get(6)?,
                    is_reasoned: r.get::<_, i64>(7)? != 0,
                    reason_text: r.get(8)?,
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// All active groups of a faculty, ordered by display number. Closed groups
/// fall out because closing also clears the activation flag.
pub fn active_groups_of_faculty(
    conn: &Connection,
    faculty_id: &str,
) -> Result<Vec<GroupRow>, JournalError> {
    let sql = format!(
        "SELECT {GROUP_COLS} FROM groups
         WHERE faculty_id = ? AND is_deleted = 0
           AND (is_active IS NULL OR is_active != 0)
         ORDER BY number"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([faculty_id], |r| group_from_row(r))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn placeholders(n: usize) -> String {
    std::iter::repeat("?").take(n).collect::<Vec<_>>().join(",")
}

/// Student headcount per group, one query for the whole set.
pub fn student_counts(
    conn: &Connection,
    group_ids: &[String],
) -> Result<HashMap<String, i64>, JournalError> {
    if group_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let sql = format!(
        "SELECT group_id, COUNT(*) FROM students
         WHERE group_id IN ({}) AND is_deleted = 0
         GROUP BY group_id",
        placeholders(group_ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(group_ids.iter()), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().collect())
}

/// group_id -> lesson_id for one date across many groups.
pub fn lessons_on_date(
    conn: &Connection,
    group_ids: &[String],
    date: NaiveDate,
) -> Result<HashMap<String, String>, JournalError> {
    if group_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let sql = format!(
        "SELECT group_id, id FROM lessons
         WHERE lesson_date = ? AND group_id IN ({})",
        placeholders(group_ids.len())
    );
    let mut params: Vec<Value> = vec![Value::Text(date.to_string())];
    params.extend(group_ids.iter().map(|g| Value::Text(g.clone())));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(params), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().collect())
}

/// (group_id, lesson_date) -> lesson_id for a date range across many groups.
pub fn lessons_in_range(
    conn: &Connection,
    group_ids: &[String],
    from: NaiveDate,
    to: NaiveDate,
) -> Result<HashMap<(String, String), String>, JournalError> {
    if group_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let sql = format!(
        "SELECT group_id, lesson_date, id FROM lessons
         WHERE lesson_date >= ? AND lesson_date <= ? AND group_id IN ({})",
        placeholders(group_ids.len())
    );
    let mut params: Vec<Value> = vec![Value::Text(from.to_string()), Value::Text(to.to_string())];
    params.extend(group_ids.iter().map(|g| Value::Text(g.clone())));
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(params), |r| {
            Ok((
                (r.get::<_, String>(0)?, r.get::<_, String>(1)?),
                r.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().collect())
}

/// Marked-fact count per lesson, one query for the whole set.
pub fn attendance_counts(
    conn: &Connection,
    lesson_ids: &[String],
) -> Result<HashMap<String, i64>, JournalError> {
    if lesson_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let sql = format!(
        "SELECT lesson_id, COUNT(*) FROM attendance
         WHERE lesson_id IN ({})
         GROUP BY lesson_id",
        placeholders(lesson_ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(lesson_ids.iter()), |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().collect())
}

/// (student_id, lesson_id) -> fact for a set of lessons, for the weekly
/// journal view.
pub fn facts_for_lessons(
    conn: &Connection,
    lesson_ids: &[String],
) -> Result<HashMap<(String, String), FactRow>, JournalError> {
    if lesson_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let sql = format!(
        "SELECT {FACT_COLS} FROM attendance WHERE lesson_id IN ({})",
        placeholders(lesson_ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(lesson_ids.iter()), |r| fact_from_row(r))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .map(|f| ((f.student_id.clone(), f.lesson_id.clone()), f))
        .collect())
}
