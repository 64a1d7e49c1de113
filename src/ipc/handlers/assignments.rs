use rusqlite::{params, OptionalExtension, Transaction};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_i64, opt_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::propagation::{self, TemplateEvent};
use crate::sync;

const ATTACHMENT_TYPES: [&str; 3] = ["text", "file", "link"];

/// Parsed `attachments` payload entry; position defaults to list order.
struct AttachmentInput {
    atype: String,
    title: String,
    content: Option<String>,
    file_url: Option<String>,
    position: i64,
}

fn parse_attachments(req: &Request) -> Result<Vec<AttachmentInput>, JsonValue> {
    let Some(raw) = req.params.get("attachments") else {
        return Ok(Vec::new());
    };
    if raw.is_null() {
        return Ok(Vec::new());
    }
    let Some(items) = raw.as_array() else {
        return Err(err(&req.id, "bad_params", "attachments must be an array", None));
    };
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let Some(atype) = item.get("type").and_then(|v| v.as_str()) else {
            return Err(err(&req.id, "bad_params", "attachments[].type is required", None));
        };
        if !ATTACHMENT_TYPES.contains(&atype) {
            return Err(err(
                &req.id,
                "bad_params",
                "attachments[].type must be one of: text, file, link",
                None,
            ));
        }
        let Some(title) = item.get("title").and_then(|v| v.as_str()) else {
            return Err(err(&req.id, "bad_params", "attachments[].title is required", None));
        };
        let content = item
            .get("content")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let file_url = item
            .get("fileUrl")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let position = item
            .get("position")
            .and_then(|v| v.as_i64())
            .unwrap_or(i as i64);
        out.push(AttachmentInput {
            atype: atype.to_string(),
            title: title.to_string(),
            content,
            file_url,
            position,
        });
    }
    Ok(out)
}

fn insert_attachments(
    tx: &Transaction<'_>,
    assignment_id: &str,
    attachments: &[AttachmentInput],
) -> rusqlite::Result<()> {
    for a in attachments {
        tx.execute(
            "INSERT INTO assignment_attachments(
                id, assignment_id, type, title, content, file_url, position
             ) VALUES(?, ?, ?, ?, ?, ?, ?)",
            params![
                Uuid::new_v4().to_string(),
                assignment_id,
                a.atype,
                a.title,
                a.content,
                a.file_url,
                a.position
            ],
        )?;
    }
    Ok(())
}

fn handle_assignments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let section_id = match required_str(req, "courseSectionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let section_course_id: Option<Option<String>> = match conn
        .query_row(
            "SELECT course_id FROM course_sections WHERE id = ?",
            [&section_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(section_course_id) = section_course_id else {
        return err(&req.id, "not_found", "course section not found", None);
    };

    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let description = match opt_str(req, "description") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let due_at = match opt_str(req, "dueAt") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let max_grade = match opt_i64(req, "maxGrade") {
        Ok(v) => v.unwrap_or(100),
        Err(e) => return e,
    };
    let offset_days = match opt_i64(req, "startOffsetDays") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let due_time = match opt_str(req, "dueTime") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match opt_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let attachments = match parse_attachments(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let assignment_id = Uuid::new_v4().to_string();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO assignments(
            id, course_section_id, teacher_id, title, description, due_at,
            max_grade, template_start_offset_days, template_due_time, is_unlinked
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
        params![
            assignment_id,
            section_id,
            teacher_id,
            title,
            description,
            due_at,
            max_grade,
            offset_days,
            due_time
        ],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = insert_attachments(&tx, &assignment_id, &attachments) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    if section_course_id.is_some() {
        match propagation::on_template_committed(
            conn,
            TemplateEvent::AssignmentCreated {
                assignment_id: &assignment_id,
            },
        ) {
            Ok(summary) => {
                return ok(
                    &req.id,
                    json!({ "assignmentId": assignment_id, "fanOut": summary.to_json() }),
                )
            }
            Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
        }
    }

    ok(&req.id, json!({ "assignmentId": assignment_id }))
}

fn handle_assignments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let section_id = match required_str(req, "courseSectionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT id, title, description, due_at, max_grade, template_start_offset_days,
                template_due_time, template_ref, is_unlinked,
                (SELECT COUNT(*) FROM assignment_attachments aa WHERE aa.assignment_id = a.id)
         FROM assignments a
         WHERE course_section_id = ?
         ORDER BY COALESCE(due_at, ''), id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&section_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "description": r.get::<_, Option<String>>(2)?,
                "dueAt": r.get::<_, Option<String>>(3)?,
                "maxGrade": r.get::<_, i64>(4)?,
                "startOffsetDays": r.get::<_, Option<i64>>(5)?,
                "dueTime": r.get::<_, Option<String>>(6)?,
                "templateRef": r.get::<_, Option<String>>(7)?,
                "isUnlinked": r.get::<_, i64>(8)? != 0,
                "attachmentCount": r.get::<_, i64>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(assignments) => ok(&req.id, json!({ "assignments": assignments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_assignments_set_attachments(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let assignment_id = match required_str(req, "assignmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM assignments WHERE id = ?",
            [&assignment_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "assignment not found", None);
    }
    let attachments = match parse_attachments(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM assignment_attachments WHERE assignment_id = ?",
        [&assignment_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = insert_attachments(&tx, &assignment_id, &attachments) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "attachments": attachments.len() }))
}

fn handle_assignments_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let assignment_id = match required_str(req, "assignmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope: Option<Option<String>> = match conn
        .query_row(
            "SELECT s.course_id FROM assignments a
             JOIN course_sections s ON s.id = a.course_section_id
             WHERE a.id = ?",
            [&assignment_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(course_id) = scope else {
        return err(&req.id, "not_found", "assignment not found", None);
    };

    let mut targets = vec![assignment_id.clone()];
    if course_id.is_some() {
        let mut stmt = match conn
            .prepare("SELECT id FROM assignments WHERE template_ref = ? AND is_unlinked = 0")
        {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let clones: Result<Vec<String>, _> = stmt
            .query_map([&assignment_id], |r| r.get(0))
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
    for id in &targets {
        if let Err(e) = sync::delete_assignment_cascade(&tx, id) {
            let _ = tx.rollback();
            return err(&req.id, "db_delete_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "deletedAssignments": targets.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assignments.create" => Some(handle_assignments_create(state, req)),
        "assignments.list" => Some(handle_assignments_list(state, req)),
        "assignments.setAttachments" => Some(handle_assignments_set_attachments(state, req)),
        "assignments.delete" => Some(handle_assignments_delete(state, req)),
        _ => None,
    }
}
