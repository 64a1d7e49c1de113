
use serde_json::json;
use test_support::{
    create_student, create_template_section, open_state, request_err, request_ok, setup_world,
    str_field,
};

/// The sync entry points validate their preconditions before touching
/// anything: no template sections, no subject groups, unknown targets.
#[test]
fn sync_refuses_incomplete_courses() {
    let mut state = open_state("coursebook-errors");
    let world = setup_world(&mut state);

    // Course exists but has no template sections yet.
    let _ = request_err(
        &mut state,
        "1",
        "sync.course",
        json!({ "courseId": world.course_id, "actorId": world.admin_id }),
        "no_template_sections",
    );

    let _ = create_template_section(&mut state, &world.course_id, 0);

    // A course without groups has nowhere to propagate.
    let lonely = request_ok(
        &mut state,
        "2",
        "courses.create",
        json!({
            "courseCode": "LONELY-1",
            "name": "Lonely",
            "grade": 9,
            "bootstrapSections": false
        }),
    );
    let lonely_id = str_field(&lonely, "courseId");
    let _ = request_ok(
        &mut state,
        "3",
        "sections.create",
        json!({ "courseId": lonely_id, "title": "Only section" }),
    );
    let _ = request_err(
        &mut state,
        "4",
        "sync.course",
        json!({ "courseId": lonely_id, "actorId": world.admin_id }),
        "no_subject_groups",
    );

    let _ = request_err(
        &mut state,
        "5",
        "sync.subjectGroup",
        json!({ "subjectGroupId": "missing", "actorId": world.admin_id }),
        "not_found",
    );
    let _ = request_err(
        &mut state,
        "6",
        "sync.status",
        json!({ "subjectGroupId": "missing" }),
        "not_found",
    );
}

/// Authorization is checked before any work: students are refused, a
/// teacher passes only for groups they actually teach.
#[test]
fn sync_entry_points_are_authorization_gated() {
    let mut state = open_state("coursebook-auth");
    let world = setup_world(&mut state);
    let template_section = create_template_section(&mut state, &world.course_id, 0);
    let student_id = create_student(&mut state, "1");

    let _ = request_err(
        &mut state,
        "2",
        "sync.subjectGroup",
        json!({
            "subjectGroupId": world.subject_group_id,
            "actorId": student_id
        }),
        "permission_denied",
    );
    // Denied call performed no work.
    assert!(
        test_support::derived_section(&mut state, &world.subject_group_id, &template_section)
            .is_none()
    );

    // A teacher not assigned to the group is denied; assigning them
    // flips the answer.
    let teacher = request_ok(
        &mut state,
        "3",
        "users.create",
        json!({ "username": "t-outsider", "role": "teacher" }),
    );
    let teacher_id = str_field(&teacher, "userId");
    let _ = request_err(
        &mut state,
        "4",
        "sync.subjectGroup",
        json!({
            "subjectGroupId": world.subject_group_id,
            "actorId": teacher_id
        }),
        "permission_denied",
    );

    let own_room = request_ok(
        &mut state,
        "5",
        "classrooms.create",
        json!({ "grade": 10, "letter": "T" }),
    );
    let own_group = request_ok(
        &mut state,
        "6",
        "subjectGroups.create",
        json!({
            "courseId": world.course_id,
            "classroomId": str_field(&own_room, "classroomId"),
            "teacherId": teacher_id
        }),
    );
    let summary = request_ok(
        &mut state,
        "7",
        "sync.subjectGroup",
        json!({
            "subjectGroupId": str_field(&own_group, "subjectGroupId"),
            "academicStartDate": "2025-09-01",
            "actorId": teacher_id
        }),
    );
    assert_eq!(summary["totals"]["created"], json!(1));

    // Unlink/relink sit behind the same gate.
    let derived = test_support::derived_section(
        &mut state,
        &str_field(&own_group, "subjectGroupId"),
        &template_section,
    )
    .expect("derived section");
    let _ = request_err(
        &mut state,
        "8",
        "templates.unlink",
        json!({
            "unitType": "section",
            "id": str_field(&derived, "id"),
            "actorId": student_id
        }),
        "permission_denied",
    );
}

/// Unlinking template-scoped units is rejected: the flag only exists on
/// derived rows.
#[test]
fn unlink_rejects_template_units() {
    let mut state = open_state("coursebook-unlink-template");
    let world = setup_world(&mut state);
    let template_section = create_template_section(&mut state, &world.course_id, 0);
    let _ = request_err(
        &mut state,
        "1",
        "templates.unlink",
        json!({
            "unitType": "section",
            "id": template_section,
            "actorId": world.admin_id
        }),
        "bad_params",
    );
    let _ = request_err(
        &mut state,
        "2",
        "templates.unlink",
        json!({ "unitType": "widget", "id": "x", "actorId": world.admin_id }),
        "bad_params",
    );
}

/// The enrollment resolver feeds fan-out: students of a subject group
/// come from its classroom.
#[test]
fn enrollment_resolves_students_via_classroom() {
    let mut state = open_state("coursebook-enrollment");
    let world = setup_world(&mut state);
    let s1 = create_student(&mut state, "1");
    let s2 = create_student(&mut state, "2");
    for (i, sid) in [&s1, &s2].iter().enumerate() {
        let _ = request_ok(
            &mut state,
            &format!("3-{}", i),
            "classrooms.enroll",
            json!({ "classroomId": world.classroom_id, "studentId": sid }),
        );
    }

    let conn = state.db.as_ref().expect("db");
    let mut students =
        coursebookd::enrollment::students_of(conn, &world.subject_group_id).expect("students");
    students.sort();
    let mut expected = vec![s1, s2];
    expected.sort();
    assert_eq!(students, expected);

    let groups =
        coursebookd::enrollment::subject_groups_of(conn, &world.course_id).expect("groups");
    assert_eq!(groups, vec![world.subject_group_id.clone()]);

    // Catalog listings see the same membership.
    let listed = request_ok(&mut state, "4", "users.list", json!({ "role": "student" }));
    assert_eq!(listed["users"].as_array().unwrap().len(), 2);
    let rooms = request_ok(&mut state, "5", "classrooms.list", json!({}));
    let room = rooms["classrooms"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["id"] == json!(world.classroom_id))
        .expect("classroom listed");
    assert_eq!(room["studentCount"], json!(2));
}
