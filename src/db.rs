use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("journal.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS groups(
            id TEXT PRIMARY KEY,
            number TEXT NOT NULL,
            shift INTEGER NOT NULL CHECK(shift IN (1,2)),
            course_year INTEGER,
            faculty_id TEXT NOT NULL,
            curator_id TEXT,
            is_active INTEGER,
            is_closed INTEGER NOT NULL DEFAULT 0,
            is_deleted INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_groups_faculty ON groups(faculty_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_groups_curator ON groups(curator_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            student_code TEXT,
            full_name TEXT NOT NULL,
            total_absent_hours INTEGER NOT NULL DEFAULT 0,
            is_deleted INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(group_id) REFERENCES groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_group ON students(group_id)",
        [],
    )?;

    // One lesson per (group, date). The upsert path relies on this constraint
    // rather than on check-then-insert.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS lessons(
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            lesson_date TEXT NOT NULL,
            subject TEXT,
            lesson_type TEXT,
            UNIQUE(group_id, lesson_date),
            FOREIGN KEY(group_id) REFERENCES groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_lessons_date ON lessons(lesson_date)",
        [],
    )?;

    // One fact per (student, lesson). Corrections re-upsert; rows are never
    // deleted, so recomputing a student's total is always well-defined.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            lesson_id TEXT NOT NULL,
            status TEXT NOT NULL,
            nb_hours INTEGER NOT NULL DEFAULT 0,
            comment TEXT,
            is_reasoned INTEGER NOT NULL DEFAULT 0,
            reason_text TEXT,
            reasoned_by TEXT,
            marked_by TEXT,
            updated_at TEXT,
            UNIQUE(student_id, lesson_id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(lesson_id) REFERENCES lessons(id)
        )",
        [],
    )?;
    ensure_attendance_updated_at(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_student ON attendance(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_lesson ON attendance(lesson_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_logs(
            id TEXT PRIMARY KEY,
            actor_id TEXT,
            action TEXT NOT NULL,
            target_table TEXT NOT NULL,
            target_id TEXT,
            description TEXT,
            logged_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO settings(key, value) VALUES('NB_LIMIT_HIGH', '35')",
        [],
    )?;

    Ok(conn)
}

pub fn get_setting_i64(conn: &Connection, key: &str, default: i64) -> i64 {
    conn.query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
        r.get::<_, String>(0)
    })
    .optional()
    .ok()
    .flatten()
    .and_then(|v| v.trim().parse::<i64>().ok())
    .unwrap_or(default)
}

fn ensure_attendance_updated_at(conn: &Connection) -> anyhow::Result<()> {
    // Workspaces created before corrections carried a timestamp lack this column.
    if table_has_column(conn, "attendance", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE attendance ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
