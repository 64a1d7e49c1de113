use rusqlite::{params, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    apply_reorder, db_conn, file_store, next_position, opt_i64, opt_str, required_str, row_exists,
};
use crate::ipc::types::{AppState, Request};
use crate::sync;

fn handle_sections_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let course_id = match opt_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_group_id = match opt_str(req, "subjectGroupId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    // A section belongs to exactly one scope: template (course) or
    // derived (subject group).
    match (&course_id, &subject_group_id) {
        (Some(_), Some(_)) | (None, None) => {
            return err(
                &req.id,
                "bad_params",
                "exactly one of courseId or subjectGroupId is required",
                None,
            )
        }
        _ => {}
    }
    if let Some(course_id) = &course_id {
        match row_exists(conn, "SELECT 1 FROM courses WHERE id = ?", course_id) {
            Ok(true) => {}
            Ok(false) => return err(&req.id, "not_found", "course not found", None),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    if let Some(group_id) = &subject_group_id {
        match row_exists(conn, "SELECT 1 FROM subject_groups WHERE id = ?", group_id) {
            Ok(true) => {}
            Ok(false) => return err(&req.id, "not_found", "subject group not found", None),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let description = match opt_str(req, "description") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let start_date = match opt_str(req, "startDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let end_date = match opt_str(req, "endDate") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let week_index = match opt_i64(req, "weekIndex") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let duration_days = match opt_i64(req, "durationDays") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let position = match opt_i64(req, "position") {
        Ok(Some(p)) => p,
        Ok(None) => {
            let (sql, scope) = match (&course_id, &subject_group_id) {
                (Some(course_id), _) => (
                    "SELECT COALESCE(MAX(position), -1) + 1 FROM course_sections WHERE course_id = ?",
                    course_id.as_str(),
                ),
                (None, Some(group_id)) => (
                    "SELECT COALESCE(MAX(position), -1) + 1 FROM course_sections WHERE subject_group_id = ?",
                    group_id.as_str(),
                ),
                (None, None) => unreachable!("scope validated above"),
            };
            match next_position(conn, sql, scope) {
                Ok(p) => p,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            }
        }
        Err(e) => return e,
    };

    let section_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO course_sections(
            id, course_id, subject_group_id, title, description, start_date,
            end_date, position, template_week_index, template_duration_days, is_unlinked
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
        params![
            section_id,
            course_id,
            subject_group_id,
            title,
            description,
            start_date,
            end_date,
            position,
            week_index,
            duration_days
        ],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "sectionId": section_id }))
}

fn handle_sections_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let section_id = match required_str(req, "sectionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let current: Option<(String, Option<String>, Option<String>, Option<String>, Option<i64>, Option<i64>)> =
        match conn
            .query_row(
                "SELECT title, description, start_date, end_date, template_week_index,
                        template_duration_days
                 FROM course_sections WHERE id = ?",
                [&section_id],
                |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                        r.get(5)?,
                    ))
                },
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
    let Some(current) = current else {
        return err(&req.id, "not_found", "section not found", None);
    };

    let title = match opt_str(req, "title") {
        Ok(v) => v.unwrap_or(current.0),
        Err(e) => return e,
    };
    let description = match opt_str(req, "description") {
        Ok(v) => v.or(current.1),
        Err(e) => return e,
    };
    let start_date = match opt_str(req, "startDate") {
        Ok(v) => v.or(current.2),
        Err(e) => return e,
    };
    let end_date = match opt_str(req, "endDate") {
        Ok(v) => v.or(current.3),
        Err(e) => return e,
    };
    let week_index = match opt_i64(req, "weekIndex") {
        Ok(v) => v.or(current.4),
        Err(e) => return e,
    };
    let duration_days = match opt_i64(req, "durationDays") {
        Ok(v) => v.or(current.5),
        Err(e) => return e,
    };

    if let Err(e) = conn.execute(
        "UPDATE course_sections SET title = ?, description = ?, start_date = ?, end_date = ?,
                template_week_index = ?, template_duration_days = ?
         WHERE id = ?",
        params![
            title,
            description,
            start_date,
            end_date,
            week_index,
            duration_days,
            section_id
        ],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_sections_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let course_id = match opt_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_group_id = match opt_str(req, "subjectGroupId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (sql, scope) = match (&course_id, &subject_group_id) {
        (Some(course_id), None) => (
            "SELECT id, title, description, start_date, end_date, position,
                    template_week_index, template_duration_days, template_ref, is_unlinked
             FROM course_sections WHERE course_id = ? ORDER BY position, id",
            course_id,
        ),
        (None, Some(group_id)) => (
            "SELECT id, title, description, start_date, end_date, position,
                    template_week_index, template_duration_days, template_ref, is_unlinked
             FROM course_sections WHERE subject_group_id = ? ORDER BY position, id",
            group_id,
        ),
        _ => {
            return err(
                &req.id,
                "bad_params",
                "exactly one of courseId or subjectGroupId is required",
                None,
            )
        }
    };
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([scope], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "description": r.get::<_, Option<String>>(2)?,
                "startDate": r.get::<_, Option<String>>(3)?,
                "endDate": r.get::<_, Option<String>>(4)?,
                "position": r.get::<_, i64>(5)?,
                "weekIndex": r.get::<_, Option<i64>>(6)?,
                "durationDays": r.get::<_, Option<i64>>(7)?,
                "templateRef": r.get::<_, Option<String>>(8)?,
                "isUnlinked": r.get::<_, i64>(9)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(sections) => ok(&req.id, json!({ "sections": sections })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_sections_reorder(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let course_id = match opt_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_group_id = match opt_str(req, "subjectGroupId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (scope_col, scope_id) = match (&course_id, &subject_group_id) {
        (Some(course_id), None) => ("course_id", course_id.as_str()),
        (None, Some(group_id)) => ("subject_group_id", group_id.as_str()),
        _ => {
            return err(
                &req.id,
                "bad_params",
                "exactly one of courseId or subjectGroupId is required",
                None,
            )
        }
    };
    match apply_reorder(conn, req, "course_sections", scope_col, scope_id) {
        Ok(n) => ok(&req.id, json!({ "reordered": n })),
        Err(e) => e,
    }
}

fn handle_sections_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let files = match file_store(state, req) {
        Ok(f) => f,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let section_id = match required_str(req, "sectionId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let scope: Option<(Option<String>, Option<String>)> = match conn
        .query_row(
            "SELECT course_id, subject_group_id FROM course_sections WHERE id = ?",
            [&section_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((course_id, _)) = scope else {
        return err(&req.id, "not_found", "section not found", None);
    };

    // Template sections cascade to their derived clones, except clones
    // the teacher unlinked: those survive as orphans, template_ref kept.
    let mut targets = vec![section_id.clone()];
    if course_id.is_some() {
        let mut stmt = match conn.prepare(
            "SELECT id FROM course_sections WHERE template_ref = ? AND is_unlinked = 0",
        ) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let clones: Result<Vec<String>, _> = stmt
            .query_map([&section_id], |r| r.get(0))
            .and_then(|it| it.collect());
        match clones {
            Ok(ids) => targets.extend(ids),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let mut deleted_files = Vec::new();
    for id in &targets {
        if let Err(e) = sync::delete_section_cascade(&tx, id, &mut deleted_files) {
            let _ = tx.rollback();
            return err(&req.id, "db_delete_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    for file_ref in &deleted_files {
        files.delete(file_ref);
    }

    ok(&req.id, json!({ "deletedSections": targets.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "sections.create" => Some(handle_sections_create(state, req)),
        "sections.update" => Some(handle_sections_update(state, req)),
        "sections.list" => Some(handle_sections_list(state, req)),
        "sections.reorder" => Some(handle_sections_reorder(state, req)),
        "sections.delete" => Some(handle_sections_delete(state, req)),
        _ => None,
    }
}
