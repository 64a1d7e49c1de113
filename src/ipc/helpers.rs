use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value as JsonValue;

use crate::auth::{self, ManageScope};
use crate::files::FileStore;
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, JsonValue> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn file_store(state: &AppState, req: &Request) -> Result<FileStore, JsonValue> {
    state
        .workspace
        .as_deref()
        .map(FileStore::new)
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, JsonValue> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn opt_str(req: &Request, key: &str) -> Result<Option<String>, JsonValue> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let s = v
                .as_str()
                .ok_or_else(|| {
                    err(&req.id, "bad_params", format!("{} must be string or null", key), None)
                })?
                .trim()
                .to_string();
            if s.is_empty() {
                Ok(None)
            } else {
                Ok(Some(s))
            }
        }
    }
}

pub fn opt_i64(req: &Request, key: &str) -> Result<Option<i64>, JsonValue> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v.as_i64().map(Some).ok_or_else(|| {
            err(&req.id, "bad_params", format!("{} must be integer or null", key), None)
        }),
    }
}

pub fn opt_f64(req: &Request, key: &str) -> Result<Option<f64>, JsonValue> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v.as_f64().map(Some).ok_or_else(|| {
            err(&req.id, "bad_params", format!("{} must be a number or null", key), None)
        }),
    }
}

pub fn bool_param(req: &Request, key: &str, default: bool) -> Result<bool, JsonValue> {
    match req.params.get(key) {
        None => Ok(default),
        Some(v) if v.is_null() => Ok(default),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| err(&req.id, "bad_params", format!("{} must be boolean", key), None)),
    }
}

pub fn now_datetime() -> String {
    Utc::now().naive_utc().format("%Y-%m-%dT%H:%M:%S").to_string()
}

pub fn today() -> chrono::NaiveDate {
    Utc::now().date_naive()
}

pub fn row_exists(
    conn: &Connection,
    sql: &str,
    id: &str,
) -> Result<bool, rusqlite::Error> {
    let hit: Option<i64> = conn.query_row(sql, [id], |r| r.get(0)).optional()?;
    Ok(hit.is_some())
}

/// Authorization gate for sync / unlink / relink / grading entry points.
/// A denial carries no side effects; callers return before touching state.
pub fn require_manage(
    conn: &Connection,
    req: &Request,
    scope: ManageScope<'_>,
) -> Result<(), JsonValue> {
    let actor = required_str(req, "actorId")?;
    match auth::can_manage(conn, &actor, scope) {
        Ok(true) => Ok(()),
        Ok(false) => Err(err(
            &req.id,
            "permission_denied",
            "actor is not allowed to manage this target",
            None,
        )),
        Err(e) => Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}

/// Teacher-or-above gate for grading surfaces that span several targets.
pub fn require_grader(conn: &Connection, req: &Request) -> Result<String, JsonValue> {
    let actor = required_str(req, "actorId")?;
    match auth::role_of(conn, &actor) {
        Ok(Some(role)) if role != auth::Role::Student => Ok(actor),
        Ok(_) => Err(err(
            &req.id,
            "permission_denied",
            "actor is not allowed to grade",
            None,
        )),
        Err(e) => Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}

/// Batch reorder: a list of {id, position} pairs applied in one
/// transaction. Every id must belong to the given scope; positions are
/// free-form (ties read back in id order).
pub fn apply_reorder(
    conn: &Connection,
    req: &Request,
    table: &str,
    scope_col: &str,
    scope_id: &str,
) -> Result<i64, JsonValue> {
    let Some(items) = req.params.get("items").and_then(|v| v.as_array()) else {
        return Err(err(&req.id, "bad_params", "missing items", None));
    };

    let mut pairs: Vec<(String, i64)> = Vec::with_capacity(items.len());
    for item in items {
        let Some(id) = item.get("id").and_then(|v| v.as_str()) else {
            return Err(err(&req.id, "bad_params", "items[].id must be a string", None));
        };
        let Some(position) = item.get("position").and_then(|v| v.as_i64()) else {
            return Err(err(
                &req.id,
                "bad_params",
                "items[].position must be an integer",
                None,
            ));
        };
        pairs.push((id.to_string(), position));
    }

    let check_sql = format!("SELECT 1 FROM {} WHERE id = ? AND {} = ?", table, scope_col);
    for (id, _) in &pairs {
        let hit: Option<i64> = conn
            .query_row(&check_sql, [id.as_str(), scope_id], |r| r.get(0))
            .optional()
            .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
        if hit.is_none() {
            return Err(err(
                &req.id,
                "bad_params",
                format!("id not found in scope: {}", id),
                None,
            ));
        }
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| err(&req.id, "db_tx_failed", e.to_string(), None))?;
    let update_sql = format!("UPDATE {} SET position = ? WHERE id = ?", table);
    for (id, position) in &pairs {
        if let Err(e) = tx.execute(&update_sql, rusqlite::params![position, id]) {
            let _ = tx.rollback();
            return Err(err(&req.id, "db_update_failed", e.to_string(), None));
        }
    }
    tx.commit()
        .map_err(|e| err(&req.id, "db_commit_failed", e.to_string(), None))?;
    Ok(pairs.len() as i64)
}

/// Next free slot among siblings: max(position) + 1, or 0 for the first.
pub fn next_position(conn: &Connection, sql: &str, scope_id: &str) -> Result<i64, rusqlite::Error> {
    conn.query_row(sql, [scope_id], |r| r.get::<_, i64>(0))
}
