use rusqlite::params;
use serde_json::json;
use uuid::Uuid;

use crate::auth::Role;
use crate::calendar;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{bool_param, db_conn, opt_str, required_str, row_exists, today};
use crate::ipc::types::{AppState, Request};
use crate::propagation::{self, TemplateEvent};

fn handle_courses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let course_code = match required_str(req, "courseCode") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let description = match opt_str(req, "description") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade = match req.params.get("grade").and_then(|v| v.as_i64()) {
        Some(g) if (0..=12).contains(&g) => g,
        Some(_) => return err(&req.id, "bad_params", "grade must be within 0..=12", None),
        None => return err(&req.id, "bad_params", "missing grade", None),
    };
    let reference_date = match opt_str(req, "referenceDate") {
        Ok(Some(raw)) => match calendar::parse_date(&raw) {
            Some(d) => d,
            None => return err(&req.id, "bad_params", "referenceDate must be YYYY-MM-DD", None),
        },
        Ok(None) => today(),
        Err(e) => return e,
    };
    let bootstrap = match bool_param(req, "bootstrapSections", true) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let course_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO courses(id, course_code, name, description, grade) VALUES(?, ?, ?, ?, ?)",
        params![course_id, course_code, name, description, grade],
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "courses" })),
        );
    }

    // Committed; now seed the template skeleton via the trigger.
    let mut bootstrapped = 0;
    if bootstrap {
        match propagation::on_template_committed(
            conn,
            TemplateEvent::CourseCreated {
                course_id: &course_id,
                reference_date,
            },
        ) {
            Ok(s) => bootstrapped = s.bootstrapped_sections,
            Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
        }
    }

    ok(
        &req.id,
        json!({
            "courseId": course_id,
            "templateSections": bootstrapped,
        }),
    )
}

fn handle_courses_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT c.id, c.course_code, c.name, c.grade,
                (SELECT COUNT(*) FROM subject_groups sg WHERE sg.course_id = c.id),
                (SELECT COUNT(*) FROM course_sections s WHERE s.course_id = c.id)
         FROM courses c
         ORDER BY c.course_code",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "courseCode": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "grade": r.get::<_, i64>(3)?,
                "subjectGroupCount": r.get::<_, i64>(4)?,
                "templateSectionCount": r.get::<_, i64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(courses) => ok(&req.id, json!({ "courses": courses })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classrooms_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let grade = match req.params.get("grade").and_then(|v| v.as_i64()) {
        Some(g) => g,
        None => return err(&req.id, "bad_params", "missing grade", None),
    };
    let letter = match required_str(req, "letter") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let classroom_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classrooms(id, grade, letter) VALUES(?, ?, ?)",
        params![classroom_id, grade, letter],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "classroomId": classroom_id }))
}

fn handle_classrooms_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT c.id, c.grade, c.letter,
                (SELECT COUNT(*) FROM classroom_students cs WHERE cs.classroom_id = c.id)
         FROM classrooms c
         ORDER BY c.grade, c.letter",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "grade": r.get::<_, i64>(1)?,
                "letter": r.get::<_, String>(2)?,
                "studentCount": r.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(classrooms) => ok(&req.id, json!({ "classrooms": classrooms })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let username = match required_str(req, "username") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let display_name = match opt_str(req, "displayName") {
        Ok(v) => v.unwrap_or_else(|| username.clone()),
        Err(e) => return e,
    };
    let role = match required_str(req, "role") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if Role::parse(&role).is_none() {
        return err(
            &req.id,
            "bad_params",
            "role must be one of: student, teacher, schooladmin, superadmin",
            None,
        );
    }
    let user_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO users(id, username, display_name, role) VALUES(?, ?, ?, ?)",
        params![user_id, username, display_name, role],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "userId": user_id }))
}

fn handle_users_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let role_filter = match opt_str(req, "role") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(role) = &role_filter {
        if Role::parse(role).is_none() {
            return err(
                &req.id,
                "bad_params",
                "role must be one of: student, teacher, schooladmin, superadmin",
                None,
            );
        }
    }
    let (sql, params) = match &role_filter {
        Some(role) => (
            "SELECT id, username, display_name, role FROM users WHERE role = ? ORDER BY username",
            vec![role.as_str()],
        ),
        None => (
            "SELECT id, username, display_name, role FROM users ORDER BY username",
            Vec::new(),
        ),
    };
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "username": r.get::<_, String>(1)?,
                "displayName": r.get::<_, String>(2)?,
                "role": r.get::<_, String>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(users) => ok(&req.id, json!({ "users": users })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classrooms_enroll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let classroom_id = match required_str(req, "classroomId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match row_exists(conn, "SELECT 1 FROM classrooms WHERE id = ?", &classroom_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "classroom not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    match row_exists(conn, "SELECT 1 FROM users WHERE id = ?", &student_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    if let Err(e) = conn.execute(
        "INSERT OR IGNORE INTO classroom_students(classroom_id, student_id) VALUES(?, ?)",
        params![classroom_id, student_id],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_subject_groups_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let classroom_id = match required_str(req, "classroomId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match opt_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match row_exists(conn, "SELECT 1 FROM courses WHERE id = ?", &course_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "course not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    match row_exists(conn, "SELECT 1 FROM classrooms WHERE id = ?", &classroom_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "classroom not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    let group_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subject_groups(id, course_id, classroom_id, teacher_id) VALUES(?, ?, ?, ?)",
        params![group_id, course_id, classroom_id, teacher_id],
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subject_groups" })),
        );
    }
    ok(&req.id, json!({ "subjectGroupId": group_id }))
}

fn handle_subject_groups_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let course_id = match required_str(req, "courseId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT sg.id, sg.classroom_id, sg.teacher_id,
                (SELECT COUNT(*) FROM course_sections s WHERE s.subject_group_id = sg.id)
         FROM subject_groups sg
         WHERE sg.course_id = ?
         ORDER BY sg.id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&course_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "classroomId": r.get::<_, String>(1)?,
                "teacherId": r.get::<_, Option<String>>(2)?,
                "sectionCount": r.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(groups) => ok(&req.id, json!({ "subjectGroups": groups })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.create" => Some(handle_courses_create(state, req)),
        "courses.list" => Some(handle_courses_list(state, req)),
        "classrooms.create" => Some(handle_classrooms_create(state, req)),
        "classrooms.list" => Some(handle_classrooms_list(state, req)),
        "classrooms.enroll" => Some(handle_classrooms_enroll(state, req)),
        "users.create" => Some(handle_users_create(state, req)),
        "users.list" => Some(handle_users_list(state, req)),
        "subjectGroups.create" => Some(handle_subject_groups_create(state, req)),
        "subjectGroups.list" => Some(handle_subject_groups_list(state, req)),
        _ => None,
    }
}
