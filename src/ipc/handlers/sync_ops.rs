use rusqlite::{params, OptionalExtension};
use serde_json::{json, Value as JsonValue};
use tracing::error;

use crate::auth::ManageScope;
use crate::calendar;
use crate::enrollment;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, file_store, opt_str, required_str, require_manage, today};
use crate::ipc::types::{AppState, Request};
use crate::sync::{self, SyncReport};

fn academic_start_param(req: &Request) -> Result<chrono::NaiveDate, JsonValue> {
    match opt_str(req, "academicStartDate")? {
        Some(raw) => calendar::parse_date(&raw).ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                "academicStartDate must be YYYY-MM-DD",
                None,
            )
        }),
        None => Ok(calendar::academic_year_bounds(today()).0),
    }
}

/// Run every template section against one subject group inside a single
/// transaction. Returns the merged report; the caller owns failure
/// isolation across groups.
fn sync_group(
    conn: &rusqlite::Connection,
    templates: &[sync::TemplateSection],
    subject_group_id: &str,
    academic_start: chrono::NaiveDate,
    deleted_files: &mut Vec<String>,
) -> anyhow::Result<SyncReport> {
    let tx = conn.unchecked_transaction()?;
    let mut report = SyncReport::default();
    for template in templates {
        let outcome = sync::sync_section(&tx, template, subject_group_id, academic_start)?;
        report.merge(&outcome.report);
        deleted_files.extend(outcome.deleted_files);
    }
    tx.commit()?;
    Ok(report)
}

fn handle_sync_course(state: &mut AppState, req: &Request) -> serde_json::Value {
    let files = match file_store(state, req) {
        Ok(f) => f,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_manage(conn, req, ManageScope::Course(&course_id)) {
        return e;
    }
    let academic_start = match academic_start_param(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let templates = match sync::load_template_sections(conn, &course_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if templates.is_empty() {
        return err(
            &req.id,
            "no_template_sections",
            "course has no template sections",
            None,
        );
    }
    let groups = match enrollment::subject_groups_of(conn, &course_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if groups.is_empty() {
        return err(
            &req.id,
            "no_subject_groups",
            "course has no subject groups yet",
            None,
        );
    }

    // One transaction per group: a failed target rolls back alone and the
    // fan-out keeps going.
    let mut totals = SyncReport::default();
    let mut targets = Vec::with_capacity(groups.len());
    let mut deleted_files = Vec::new();
    for group_id in &groups {
        match sync_group(conn, &templates, group_id, academic_start, &mut deleted_files) {
            Ok(report) => {
                totals.merge(&report);
                let mut entry = report.to_json();
                entry["subjectGroupId"] = json!(group_id);
                entry["ok"] = json!(true);
                targets.push(entry);
            }
            Err(e) => {
                error!(subject_group = %group_id, error = %e, "sync failed for group");
                targets.push(json!({
                    "subjectGroupId": group_id,
                    "ok": false,
                    "error": e.to_string(),
                }));
            }
        }
    }
    for file_ref in &deleted_files {
        files.delete(file_ref);
    }

    ok(
        &req.id,
        json!({ "totals": totals.to_json(), "targets": targets }),
    )
}

fn handle_sync_subject_group(state: &mut AppState, req: &Request) -> serde_json::Value {
    let files = match file_store(state, req) {
        Ok(f) => f,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let group_id = match required_str(req, "subjectGroupId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let course_id: Option<Option<String>> = match conn
        .query_row(
            "SELECT course_id FROM subject_groups WHERE id = ?",
            [&group_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(course_id) = course_id else {
        return err(&req.id, "not_found", "subject group not found", None);
    };
    let Some(course_id) = course_id else {
        return err(
            &req.id,
            "no_associated_course",
            "subject group has no associated course",
            None,
        );
    };
    if let Err(e) = require_manage(conn, req, ManageScope::SubjectGroup(&group_id)) {
        return e;
    }
    let academic_start = match academic_start_param(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let templates = match sync::load_template_sections(conn, &course_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if templates.is_empty() {
        return err(
            &req.id,
            "no_template_sections",
            "course has no template sections",
            None,
        );
    }

    let mut deleted_files = Vec::new();
    match sync_group(conn, &templates, &group_id, academic_start, &mut deleted_files) {
        Ok(report) => {
            for file_ref in &deleted_files {
                files.delete(file_ref);
            }
            ok(
                &req.id,
                json!({ "subjectGroupId": group_id, "totals": report.to_json() }),
            )
        }
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_sync_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let group_id = match required_str(req, "subjectGroupId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let course_id: Option<Option<String>> = match conn
        .query_row(
            "SELECT course_id FROM subject_groups WHERE id = ?",
            [&group_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(course_id) = course_id else {
        return err(&req.id, "not_found", "subject group not found", None);
    };
    let Some(course_id) = course_id else {
        return err(
            &req.id,
            "no_associated_course",
            "subject group has no associated course",
            None,
        );
    };

    match sync::sync_status(conn, &group_id, &course_id) {
        Ok((is_synced, missing, outdated)) => ok(
            &req.id,
            json!({
                "isSynced": is_synced,
                "missingItems": missing,
                "outdatedItems": outdated,
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn unit_table(unit_type: &str) -> Option<&'static str> {
    match unit_type {
        "section" => Some("course_sections"),
        "resource" => Some("resources"),
        "assignment" => Some("assignments"),
        "test" => Some("tests"),
        _ => None,
    }
}

/// Resolve the owning subject group of a derived unit; templates (and
/// freestanding rows without a group) are not unlinkable.
fn subject_group_of_unit(
    conn: &rusqlite::Connection,
    table: &str,
    unit_id: &str,
) -> Result<Option<String>, rusqlite::Error> {
    let sql = match table {
        "course_sections" => "SELECT subject_group_id FROM course_sections WHERE id = ?".to_string(),
        _ => format!(
            "SELECT s.subject_group_id FROM {} u
             JOIN course_sections s ON s.id = u.course_section_id
             WHERE u.id = ?",
            table
        ),
    };
    conn.query_row(&sql, [unit_id], |r| r.get::<_, Option<String>>(0))
        .optional()
        .map(|v| v.flatten())
}

fn handle_unlink(state: &mut AppState, req: &Request, unlink: bool) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let unit_type = match required_str(req, "unitType") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let unit_id = match required_str(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(table) = unit_table(&unit_type) else {
        return err(
            &req.id,
            "bad_params",
            "unitType must be one of: section, resource, assignment, test",
            None,
        );
    };

    let exists_sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    let exists: Option<i64> = match conn
        .query_row(&exists_sql, [&unit_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "unit not found", None);
    }

    let group_id = match subject_group_of_unit(conn, table, &unit_id) {
        Ok(Some(g)) => g,
        Ok(None) => {
            return err(
                &req.id,
                "bad_params",
                "only derived units can be unlinked or relinked",
                None,
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(e) = require_manage(conn, req, ManageScope::SubjectGroup(&group_id)) {
        return e;
    }

    if !unlink {
        // Relink requires an ancestor to relink to.
        let template_ref_sql = format!("SELECT template_ref FROM {} WHERE id = ?", table);
        let template_ref: Option<String> =
            match conn.query_row(&template_ref_sql, [&unit_id], |r| r.get(0)) {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
        if template_ref.is_none() {
            return err(
                &req.id,
                "conflict",
                "unit was never linked to a template",
                Some(json!({ "reason": "invalid_state" })),
            );
        }
    }

    let update_sql = format!("UPDATE {} SET is_unlinked = ? WHERE id = ?", table);
    if let Err(e) = conn.execute(&update_sql, params![unlink as i64, unit_id]) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true, "isUnlinked": unlink }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sync.course" => Some(handle_sync_course(state, req)),
        "sync.subjectGroup" => Some(handle_sync_subject_group(state, req)),
        "sync.status" => Some(handle_sync_status(state, req)),
        "templates.unlink" => Some(handle_unlink(state, req, true)),
        "templates.relink" => Some(handle_unlink(state, req, false)),
        _ => None,
    }
}
