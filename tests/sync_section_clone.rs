
use serde_json::json;
use test_support::{
    create_template_section, derived_section, open_state, request_ok, setup_world, str_field,
};

/// Full first-pass clone of a template section: dates from offsets,
/// resource tree with parent mapping, assignment due recomputation,
/// attachments, and a test with questions and options.
#[test]
fn sync_clones_section_tree_with_offset_dates() {
    let mut state = open_state("coursebook-sync-clone");
    let world = setup_world(&mut state);
    let template_section = create_template_section(&mut state, &world.course_id, 0);

    let dir = request_ok(
        &mut state,
        "1",
        "resources.create",
        json!({
            "courseSectionId": template_section,
            "type": "directory",
            "title": "Materials"
        }),
    );
    let dir_id = str_field(&dir, "resourceId");
    let _child = request_ok(
        &mut state,
        "2",
        "resources.create",
        json!({
            "courseSectionId": template_section,
            "parentResourceId": dir_id,
            "type": "text",
            "title": "Syllabus",
            "description": "Read before week one"
        }),
    );

    let _assignment = request_ok(
        &mut state,
        "3",
        "assignments.create",
        json!({
            "courseSectionId": template_section,
            "title": "Lab report",
            "maxGrade": 50,
            "startOffsetDays": 2,
            "dueTime": "23:59:00",
            "attachments": [
                { "type": "text", "title": "Rubric", "content": "Be thorough" },
                { "type": "link", "title": "Reference", "fileUrl": "https://example.org" }
            ]
        }),
    );

    let _test = request_ok(
        &mut state,
        "4",
        "tests.createFull",
        json!({
            "courseSectionId": template_section,
            "title": "Week 1 quiz",
            "isPublished": true,
            "questions": [
                {
                    "type": "multiple_choice",
                    "text": "Pick one",
                    "points": 5,
                    "options": [
                        { "text": "right", "isCorrect": true },
                        { "text": "wrong" }
                    ]
                },
                {
                    "type": "open_question",
                    "text": "Explain",
                    "points": 3,
                    "correctAnswerText": "Because"
                }
            ]
        }),
    );

    let summary = request_ok(
        &mut state,
        "5",
        "sync.subjectGroup",
        json!({
            "subjectGroupId": world.subject_group_id,
            "academicStartDate": "2025-09-01",
            "actorId": world.admin_id
        }),
    );
    // section + 2 resources + assignment + test + 2 questions
    assert_eq!(summary["totals"]["created"], json!(7));
    assert_eq!(summary["totals"]["deleted"], json!(0));

    let derived = derived_section(&mut state, &world.subject_group_id, &template_section)
        .expect("derived section");
    assert_eq!(derived.get("startDate"), Some(&json!("2025-09-01")));
    assert_eq!(derived.get("endDate"), Some(&json!("2025-09-07")));
    let derived_id = str_field(&derived, "id");

    let tree = request_ok(
        &mut state,
        "6",
        "resources.tree",
        json!({ "courseSectionId": derived_id }),
    );
    let roots = tree["resources"].as_array().expect("resource roots");
    assert_eq!(roots.len(), 1);
    assert_eq!(roots[0]["title"], json!("Materials"));
    assert_eq!(roots[0]["templateRef"], json!(dir_id));
    let kids = roots[0]["children"].as_array().expect("children");
    assert_eq!(kids.len(), 1);
    assert_eq!(kids[0]["title"], json!("Syllabus"));

    let assignments = request_ok(
        &mut state,
        "7",
        "assignments.list",
        json!({ "courseSectionId": derived_id }),
    );
    let rows = assignments["assignments"].as_array().expect("assignments");
    assert_eq!(rows.len(), 1);
    // section start 2025-09-01 + 2 days, at the template due time
    assert_eq!(rows[0]["dueAt"], json!("2025-09-03T23:59:00"));
    assert_eq!(rows[0]["maxGrade"], json!(50));
    assert_eq!(rows[0]["attachmentCount"], json!(2));

    let tests = request_ok(
        &mut state,
        "8",
        "tests.list",
        json!({ "courseSectionId": derived_id }),
    );
    let tests = tests["tests"].as_array().expect("tests");
    assert_eq!(tests.len(), 1);
    assert_eq!(tests[0]["title"], json!("Week 1 quiz"));
    assert_eq!(tests[0]["questionCount"], json!(2));
    assert_eq!(tests[0]["isPublished"], json!(true));

    let derived_test = request_ok(
        &mut state,
        "9",
        "tests.get",
        json!({ "testId": tests[0]["id"] }),
    );
    let questions = derived_test["test"]["questions"].as_array().expect("questions");
    assert_eq!(questions.len(), 2);
    assert_eq!(questions[0]["type"], json!("multiple_choice"));
    let options = questions[0]["options"].as_array().expect("options");
    assert_eq!(options.len(), 2);
    assert_eq!(options[0]["isCorrect"], json!(true));
    assert_eq!(questions[1]["correctAnswerText"], json!("Because"));
}

/// Running the same sync twice produces no data drift and no deletions.
#[test]
fn sync_is_idempotent() {
    let mut state = open_state("coursebook-sync-idem");
    let world = setup_world(&mut state);
    let template_section = create_template_section(&mut state, &world.course_id, 1);
    let _ = request_ok(
        &mut state,
        "1",
        "resources.create",
        json!({
            "courseSectionId": template_section,
            "type": "link",
            "title": "Video",
            "url": "https://example.org/v"
        }),
    );
    let _ = request_ok(
        &mut state,
        "2",
        "tests.createFull",
        json!({
            "courseSectionId": template_section,
            "title": "Quiz",
            "questions": [
                { "type": "multiple_choice", "text": "Q", "points": 1,
                  "options": [{ "text": "a", "isCorrect": true }] }
            ]
        }),
    );

    let sync_params = json!({
        "subjectGroupId": world.subject_group_id,
        "academicStartDate": "2025-09-01",
        "actorId": world.admin_id
    });
    let first = request_ok(&mut state, "3", "sync.subjectGroup", sync_params.clone());
    assert_eq!(first["totals"]["created"], json!(4));

    let snapshot_sections = request_ok(
        &mut state,
        "4",
        "sections.list",
        json!({ "subjectGroupId": world.subject_group_id }),
    );
    let derived = derived_section(&mut state, &world.subject_group_id, &template_section)
        .expect("derived section");
    let derived_id = str_field(&derived, "id");
    let snapshot_tree = request_ok(
        &mut state,
        "5",
        "resources.tree",
        json!({ "courseSectionId": derived_id }),
    );
    let snapshot_tests = request_ok(
        &mut state,
        "6",
        "tests.list",
        json!({ "courseSectionId": derived_id }),
    );

    let second = request_ok(&mut state, "7", "sync.subjectGroup", sync_params);
    assert_eq!(second["totals"]["created"], json!(0));
    assert_eq!(second["totals"]["deleted"], json!(0));

    let sections_after = request_ok(
        &mut state,
        "8",
        "sections.list",
        json!({ "subjectGroupId": world.subject_group_id }),
    );
    let tree_after = request_ok(
        &mut state,
        "9",
        "resources.tree",
        json!({ "courseSectionId": derived_id }),
    );
    let tests_after = request_ok(
        &mut state,
        "10",
        "tests.list",
        json!({ "courseSectionId": derived_id }),
    );
    assert_eq!(snapshot_sections, sections_after);
    assert_eq!(snapshot_tree, tree_after);
    assert_eq!(snapshot_tests, tests_after);
}

/// sync.course fans out to every subject group and reports per-target
/// counts; a course without groups or template sections refuses to run.
#[test]
fn sync_course_targets_all_groups() {
    let mut state = open_state("coursebook-sync-course");
    let world = setup_world(&mut state);
    let _template_section = create_template_section(&mut state, &world.course_id, 0);

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

    let summary = request_ok(
        &mut state,
        "3",
        "sync.course",
        json!({
            "courseId": world.course_id,
            "academicStartDate": "2025-09-01",
            "actorId": world.admin_id
        }),
    );
    let targets = summary["targets"].as_array().expect("targets");
    assert_eq!(targets.len(), 2);
    assert!(targets.iter().all(|t| t["ok"] == json!(true)));
    assert_eq!(summary["totals"]["created"], json!(2));

    assert!(derived_section(&mut state, &world.subject_group_id, &_template_section).is_some());
    assert!(derived_section(&mut state, &second_group_id, &_template_section).is_some());
}
