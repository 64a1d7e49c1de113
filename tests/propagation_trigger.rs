
use serde_json::json;
use test_support::{
    create_template_section, derived_section, open_state, request_ok, setup_world, str_field,
};

use coursebookd::propagation::{self, TemplateEvent};

/// Creating a course seeds the template skeleton: a dateless general
/// section plus one offset-based section per week of the academic year.
/// The bootstrap runs once; re-publishing the event is a no-op.
#[test]
fn course_creation_bootstraps_weekly_template_sections() {
    let mut state = open_state("coursebook-bootstrap");
    let course = request_ok(
        &mut state,
        "1",
        "courses.create",
        json!({
            "courseCode": "BIO-10",
            "name": "Biology",
            "grade": 10,
            "referenceDate": "2025-10-01"
        }),
    );
    let course_id = str_field(&course, "courseId");
    // Sep 1 2025 .. May 25 2026 is 267 days: 38 full weeks and a 1-day tail.
    assert_eq!(course["templateSections"], json!(40));

    let listed = request_ok(
        &mut state,
        "2",
        "sections.list",
        json!({ "courseId": course_id }),
    );
    let sections = listed["sections"].as_array().expect("sections");
    assert_eq!(sections.len(), 40);
    assert_eq!(sections[0]["title"], json!("General information"));
    assert_eq!(sections[0]["startDate"], json!(null));
    assert_eq!(sections[0]["weekIndex"], json!(null));
    assert_eq!(sections[1]["title"], json!("Week 1"));
    assert_eq!(sections[1]["weekIndex"], json!(0));
    assert_eq!(sections[1]["durationDays"], json!(6));
    // The short tail week keeps its true duration.
    assert_eq!(sections[39]["weekIndex"], json!(38));
    assert_eq!(sections[39]["durationDays"], json!(0));

    let conn = state.db.as_ref().expect("db");
    let reference = chrono::NaiveDate::from_ymd_opt(2025, 10, 1).unwrap();
    let rerun = propagation::on_template_committed(
        conn,
        TemplateEvent::CourseCreated {
            course_id: &course_id,
            reference_date: reference,
        },
    )
    .expect("rerun bootstrap");
    assert_eq!(rerun.bootstrapped_sections, 0);
}

/// A freshly authored template resource reaches every group that already
/// holds a derived copy of its section; groups without one are skipped
/// until their next full sync.
#[test]
fn template_resource_creation_fans_out_to_synced_groups() {
    let mut state = open_state("coursebook-fanout");
    let world = setup_world(&mut state);
    let template_section = create_template_section(&mut state, &world.course_id, 0);

    let second_room = request_ok(
        &mut state,
        "1",
        "classrooms.create",
        json!({ "grade": 10, "letter": "B" }),
    );
    let second_group = request_ok(
        &mut state,
        "2",
        "subjectGroups.create",
        json!({
            "courseId": world.course_id,
            "classroomId": str_field(&second_room, "classroomId")
        }),
    );
    let second_group_id = str_field(&second_group, "subjectGroupId");

    // Only the first group has synced so far.
    let _ = request_ok(
        &mut state,
        "3",
        "sync.subjectGroup",
        json!({
            "subjectGroupId": world.subject_group_id,
            "academicStartDate": "2025-09-01",
            "actorId": world.admin_id
        }),
    );

    let created = request_ok(
        &mut state,
        "4",
        "resources.create",
        json!({
            "courseSectionId": template_section,
            "type": "link",
            "title": "New article",
            "url": "https://example.org/article"
        }),
    );
    assert_eq!(created["fanOut"]["syncedGroups"], json!(1));
    assert_eq!(created["fanOut"]["skippedGroups"], json!(1));
    assert_eq!(created["fanOut"]["report"]["created"], json!(1));

    let derived = derived_section(&mut state, &world.subject_group_id, &template_section)
        .expect("derived section");
    let tree = request_ok(
        &mut state,
        "5",
        "resources.tree",
        json!({ "courseSectionId": str_field(&derived, "id") }),
    );
    let titles: Vec<_> = tree["resources"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["title"].clone())
        .collect();
    assert!(titles.contains(&json!("New article")));

    assert!(derived_section(&mut state, &second_group_id, &template_section).is_none());
}

/// Assignment creation propagates the same way, with the due date
/// recomputed per group from the derived section's start.
#[test]
fn template_assignment_creation_fans_out() {
    let mut state = open_state("coursebook-fanout-assignment");
    let world = setup_world(&mut state);
    let template_section = create_template_section(&mut state, &world.course_id, 2);
    let _ = request_ok(
        &mut state,
        "1",
        "sync.subjectGroup",
        json!({
            "subjectGroupId": world.subject_group_id,
            "academicStartDate": "2025-09-01",
            "actorId": world.admin_id
        }),
    );

    let created = request_ok(
        &mut state,
        "2",
        "assignments.create",
        json!({
            "courseSectionId": template_section,
            "title": "Essay",
            "startOffsetDays": 3,
            "dueTime": "18:00:00"
        }),
    );
    assert_eq!(created["fanOut"]["syncedGroups"], json!(1));

    let derived = derived_section(&mut state, &world.subject_group_id, &template_section)
        .expect("derived section");
    let assignments = request_ok(
        &mut state,
        "3",
        "assignments.list",
        json!({ "courseSectionId": str_field(&derived, "id") }),
    );
    // Week 3 starts Sep 15; 3 days in at the template time.
    assert_eq!(assignments["assignments"][0]["dueAt"], json!("2025-09-18T18:00:00"));
}

/// A resource authored inside a subject group does not propagate
/// anywhere; there is no template to fan out from.
#[test]
fn derived_resource_creation_does_not_fan_out() {
    let mut state = open_state("coursebook-no-fanout");
    let world = setup_world(&mut state);
    let live_section = request_ok(
        &mut state,
        "1",
        "sections.create",
        json!({ "subjectGroupId": world.subject_group_id, "title": "Live only" }),
    );
    let created = request_ok(
        &mut state,
        "2",
        "resources.create",
        json!({
            "courseSectionId": str_field(&live_section, "sectionId"),
            "type": "text",
            "title": "Class notes"
        }),
    );
    assert!(created.get("fanOut").is_none());
}
