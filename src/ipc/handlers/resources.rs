use std::collections::HashMap;

use rusqlite::{params, OptionalExtension};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    apply_reorder, db_conn, file_store, next_position, opt_i64, opt_str, required_str,
};
use crate::ipc::types::{AppState, Request};
use crate::propagation::{self, TemplateEvent};
use crate::sync;

const RESOURCE_TYPES: [&str; 4] = ["file", "link", "directory", "text"];

fn handle_resources_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let section_id = match required_str(req, "courseSectionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let rtype = match required_str(req, "type") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !RESOURCE_TYPES.contains(&rtype.as_str()) {
        return err(
            &req.id,
            "bad_params",
            "type must be one of: file, link, directory, text",
            None,
        );
    }
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let description = match opt_str(req, "description") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let url = match opt_str(req, "url") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let file_ref = match opt_str(req, "fileRef") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let parent_id = match opt_str(req, "parentResourceId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let is_template: Option<Option<String>> = match conn
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
    let Some(section_course_id) = is_template else {
        return err(&req.id, "not_found", "course section not found", None);
    };

    if let Some(parent_id) = &parent_id {
        let parent_section: Option<String> = match conn
            .query_row(
                "SELECT course_section_id FROM resources WHERE id = ?",
                [parent_id],
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        match parent_section {
            None => return err(&req.id, "not_found", "parent resource not found", None),
            Some(s) if s != section_id => {
                return err(
                    &req.id,
                    "bad_params",
                    "parent must be in the same course section",
                    None,
                )
            }
            Some(_) => {}
        }
    }

    let position = match opt_i64(req, "position") {
        Ok(Some(p)) => p,
        Ok(None) => {
            let sql = match &parent_id {
                Some(_) => {
                    "SELECT COALESCE(MAX(position), -1) + 1 FROM resources
                     WHERE parent_resource_id = ?"
                }
                None => {
                    "SELECT COALESCE(MAX(position), -1) + 1 FROM resources
                     WHERE course_section_id = ? AND parent_resource_id IS NULL"
                }
            };
            let scope = parent_id.as_deref().unwrap_or(section_id.as_str());
            match next_position(conn, sql, scope) {
                Ok(p) => p,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            }
        }
        Err(e) => return e,
    };

    let resource_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO resources(
            id, course_section_id, parent_resource_id, type, title,
            description, url, file_ref, position, is_unlinked
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
        params![
            resource_id,
            section_id,
            parent_id,
            rtype,
            title,
            description,
            url,
            file_ref,
            position
        ],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    // A freshly authored template resource propagates to every live group
    // of the course right away.
    if section_course_id.is_some() {
        match propagation::on_template_committed(
            conn,
            TemplateEvent::ResourceCreated {
                resource_id: &resource_id,
            },
        ) {
            Ok(summary) => {
                return ok(
                    &req.id,
                    json!({ "resourceId": resource_id, "fanOut": summary.to_json() }),
                )
            }
            Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
        }
    }

    ok(&req.id, json!({ "resourceId": resource_id }))
}

fn resource_row_to_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<JsonValue> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "parentResourceId": r.get::<_, Option<String>>(1)?,
        "type": r.get::<_, String>(2)?,
        "title": r.get::<_, String>(3)?,
        "description": r.get::<_, Option<String>>(4)?,
        "url": r.get::<_, Option<String>>(5)?,
        "fileRef": r.get::<_, Option<String>>(6)?,
        "position": r.get::<_, i64>(7)?,
        "templateRef": r.get::<_, Option<String>>(8)?,
        "isUnlinked": r.get::<_, i64>(9)? != 0,
    }))
}

fn handle_resources_tree(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let section_id = match required_str(req, "courseSectionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT id, parent_resource_id, type, title, description, url, file_ref,
                position, template_ref, is_unlinked
         FROM resources WHERE course_section_id = ?
         ORDER BY position, id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows: Result<Vec<JsonValue>, _> = stmt
        .query_map([&section_id], |r| resource_row_to_json(r))
        .and_then(|it| it.collect());
    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Assemble the nested tree from the flat listing.
    let mut children: HashMap<Option<String>, Vec<JsonValue>> = HashMap::new();
    for row in rows {
        let parent = row
            .get("parentResourceId")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        children.entry(parent).or_default().push(row);
    }
    fn attach(node: &mut JsonValue, children: &mut HashMap<Option<String>, Vec<JsonValue>>) {
        let id = node.get("id").and_then(|v| v.as_str()).map(|s| s.to_string());
        let mut kids = children.remove(&id).unwrap_or_default();
        for kid in &mut kids {
            attach(kid, children);
        }
        node["children"] = JsonValue::Array(kids);
    }
    let mut roots = children.remove(&None).unwrap_or_default();
    for root in &mut roots {
        attach(root, &mut children);
    }

    ok(&req.id, json!({ "resources": roots }))
}

fn handle_resources_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let resource_id = match required_str(req, "resourceId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let current: Option<(String, String, Option<String>, Option<String>, Option<String>)> =
        match conn
            .query_row(
                "SELECT type, title, description, url, file_ref FROM resources WHERE id = ?",
                [&resource_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
    let Some(current) = current else {
        return err(&req.id, "not_found", "resource not found", None);
    };

    let rtype = match opt_str(req, "type") {
        Ok(v) => v.unwrap_or(current.0),
        Err(e) => return e,
    };
    if !RESOURCE_TYPES.contains(&rtype.as_str()) {
        return err(
            &req.id,
            "bad_params",
            "type must be one of: file, link, directory, text",
            None,
        );
    }
    let title = match opt_str(req, "title") {
        Ok(v) => v.unwrap_or(current.1),
        Err(e) => return e,
    };
    let description = match opt_str(req, "description") {
        Ok(v) => v.or(current.2),
        Err(e) => return e,
    };
    let url = match opt_str(req, "url") {
        Ok(v) => v.or(current.3),
        Err(e) => return e,
    };
    let file_ref = match opt_str(req, "fileRef") {
        Ok(v) => v.or(current.4),
        Err(e) => return e,
    };

    if let Err(e) = conn.execute(
        "UPDATE resources SET type = ?, title = ?, description = ?, url = ?, file_ref = ?
         WHERE id = ?",
        params![rtype, title, description, url, file_ref, resource_id],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_resources_move(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let resource_id = match required_str(req, "resourceId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let row: Option<(String, i64)> = match conn
        .query_row(
            "SELECT course_section_id, position FROM resources WHERE id = ?",
            [&resource_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((section_id, old_position)) = row else {
        return err(&req.id, "not_found", "resource not found", None);
    };

    let new_parent = match opt_str(req, "parentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(parent_id) = &new_parent {
        let parent_section: Option<String> = match conn
            .query_row(
                "SELECT course_section_id FROM resources WHERE id = ?",
                [parent_id],
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        match parent_section {
            None => return err(&req.id, "not_found", "parent resource not found", None),
            Some(s) if s != section_id => {
                return err(
                    &req.id,
                    "bad_params",
                    "parent must be in the same course section",
                    None,
                )
            }
            Some(_) => {}
        }
    }
    let position = match opt_i64(req, "position") {
        Ok(v) => v.unwrap_or(old_position),
        Err(e) => return e,
    };

    if let Err(e) = conn.execute(
        "UPDATE resources SET parent_resource_id = ?, position = ? WHERE id = ?",
        params![new_parent, position, resource_id],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_resources_reorder(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let section_id = match required_str(req, "courseSectionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match apply_reorder(conn, req, "resources", "course_section_id", &section_id) {
        Ok(n) => ok(&req.id, json!({ "reordered": n })),
        Err(e) => e,
    }
}

fn handle_resources_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let files = match file_store(state, req) {
        Ok(f) => f,
        Err(e) => return e,
    };
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let resource_id = match required_str(req, "resourceId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope: Option<Option<String>> = match conn
        .query_row(
            "SELECT s.course_id FROM resources r
             JOIN course_sections s ON s.id = r.course_section_id
             WHERE r.id = ?",
            [&resource_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(course_id) = scope else {
        return err(&req.id, "not_found", "resource not found", None);
    };

    // Template deletion takes the still-linked derived clones with it.
    let mut targets = vec![resource_id.clone()];
    if course_id.is_some() {
        let mut stmt = match conn
            .prepare("SELECT id FROM resources WHERE template_ref = ? AND is_unlinked = 0")
        {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let clones: Result<Vec<String>, _> = stmt
            .query_map([&resource_id], |r| r.get(0))
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
    let mut deleted_rows = 0i64;
    for id in &targets {
        match sync::delete_resource_subtree(&tx, id, &mut deleted_files) {
            Ok(n) => deleted_rows += n,
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_delete_failed", e.to_string(), None);
            }
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    for file_ref in &deleted_files {
        files.delete(file_ref);
    }

    ok(&req.id, json!({ "deletedResources": deleted_rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "resources.create" => Some(handle_resources_create(state, req)),
        "resources.update" => Some(handle_resources_update(state, req)),
        "resources.tree" => Some(handle_resources_tree(state, req)),
        "resources.move" => Some(handle_resources_move(state, req)),
        "resources.reorder" => Some(handle_resources_reorder(state, req)),
        "resources.delete" => Some(handle_resources_delete(state, req)),
        _ => None,
    }
}
