use chrono::NaiveDate;
use serde_json::Value;

use crate::ipc::error::HandlerErr;
use crate::journal;

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

pub fn get_opt_str(params: &Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn get_i64_or(params: &Value, key: &str, default: i64) -> i64 {
    params.get(key).and_then(|v| v.as_i64()).unwrap_or(default)
}

pub fn get_required_date(params: &Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = get_required_str(params, key)?;
    Ok(journal::parse_iso_date(&raw)?)
}

/// The reference instant for week-window decisions. Callers may pin it with
/// an explicit `today` param; otherwise the wall clock applies.
pub fn reference_date(params: &Value) -> Result<NaiveDate, HandlerErr> {
    match get_opt_str(params, "today") {
        Some(raw) => Ok(journal::parse_iso_date(&raw)?),
        None => Ok(chrono::Local::now().date_naive()),
    }
}
