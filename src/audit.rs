//! Best-effort audit trail. Called after a unit of work commits; a failed
//! audit write is logged and swallowed, never surfaced to the caller.

use rusqlite::Connection;
use uuid::Uuid;

pub fn log(
    conn: &Connection,
    actor_id: Option<&str>,
    action: &str,
    target_table: &str,
    target_id: Option<&str>,
    description: &str,
) {
    let result = conn.execute(
        "INSERT INTO audit_logs(id, actor_id, action, target_table, target_id, description, logged_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            actor_id,
            action,
            target_table,
            target_id,
            description,
            chrono::Utc::now().to_rfc3339(),
        ),
    );
    if let Err(e) = result {
        tracing::warn!(action, target_table, error = %e, "audit write failed");
    }
}
