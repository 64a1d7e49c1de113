use std::path::PathBuf;

use base64::Engine;
use serde_json::json;

use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{file_store, required_str};
use crate::ipc::types::{AppState, Request};

fn handle_ping(_state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(&req.id, json!({ "pong": true }))
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let path = match required_str(req, "path") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let workspace = PathBuf::from(&path);
    let conn = match db::open_db(&workspace) {
        Ok(c) => c,
        Err(e) => return err(&req.id, "workspace_open_failed", e.to_string(), None),
    };
    state.workspace = Some(workspace);
    state.db = Some(conn);
    ok(&req.id, json!({ "workspace": path }))
}

fn handle_files_store(state: &mut AppState, req: &Request) -> serde_json::Value {
    let files = match file_store(state, req) {
        Ok(f) => f,
        Err(e) => return e,
    };
    let content = match required_str(req, "contentBase64") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let path_hint = match required_str(req, "pathHint") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let bytes = match base64::engine::general_purpose::STANDARD.decode(content.as_bytes()) {
        Ok(b) => b,
        Err(e) => return err(&req.id, "bad_params", format!("contentBase64: {}", e), None),
    };
    match files.store(&bytes, &path_hint) {
        Ok(file_ref) => ok(&req.id, json!({ "fileRef": file_ref })),
        Err(e) => err(&req.id, "file_store_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "ping" => Some(handle_ping(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        "files.store" => Some(handle_files_store(state, req)),
        _ => None,
    }
}
