
use serde_json::json;
use test_support::{
    create_template_section, open_state, request_ok, setup_world, str_field,
};

fn status(state: &mut coursebookd::ipc::AppState, group_id: &str) -> serde_json::Value {
    request_ok(
        state,
        "status",
        "sync.status",
        json!({ "subjectGroupId": group_id }),
    )
}

/// sync.status reports what a sync would touch, without mutating
/// anything: missing derived items first, then drifted ones.
#[test]
fn status_tracks_missing_and_outdated_items() {
    let mut state = open_state("coursebook-status");
    let world = setup_world(&mut state);
    let template_section = create_template_section(&mut state, &world.course_id, 0);

    // Nothing synced yet: the whole section is missing.
    let before = status(&mut state, &world.subject_group_id);
    assert_eq!(before["isSynced"], json!(false));
    assert_eq!(before["missingItems"][0]["kind"], json!("section"));

    let sync_params = json!({
        "subjectGroupId": world.subject_group_id,
        "academicStartDate": "2025-09-01",
        "actorId": world.admin_id
    });
    let _ = request_ok(&mut state, "1", "sync.subjectGroup", sync_params.clone());
    let synced = status(&mut state, &world.subject_group_id);
    assert_eq!(synced["isSynced"], json!(true));
    assert_eq!(synced["missingItems"], json!([]));
    assert_eq!(synced["outdatedItems"], json!([]));

    // A new template test shows up as missing until the next sync.
    let template_test = request_ok(
        &mut state,
        "2",
        "tests.createFull",
        json!({
            "courseSectionId": template_section,
            "title": "Midterm",
            "questions": [
                { "type": "multiple_choice", "text": "Q", "points": 1,
                  "options": [{ "text": "a", "isCorrect": true }] }
            ]
        }),
    );
    let missing = status(&mut state, &world.subject_group_id);
    assert_eq!(missing["isSynced"], json!(false));
    assert_eq!(missing["missingItems"][0]["kind"], json!("test"));
    assert_eq!(missing["missingItems"][0]["title"], json!("Midterm"));

    let _ = request_ok(&mut state, "3", "sync.subjectGroup", sync_params.clone());
    assert_eq!(status(&mut state, &world.subject_group_id)["isSynced"], json!(true));

    // Retitling the template marks the derived test outdated.
    let _ = request_ok(
        &mut state,
        "4",
        "tests.update",
        json!({ "testId": str_field(&template_test, "testId"), "title": "Midterm v2" }),
    );
    let outdated = status(&mut state, &world.subject_group_id);
    assert_eq!(outdated["isSynced"], json!(false));
    assert_eq!(outdated["outdatedItems"][0]["kind"], json!("test"));

    // The read-only report must not have fixed anything itself.
    let still_outdated = status(&mut state, &world.subject_group_id);
    assert_eq!(still_outdated["isSynced"], json!(false));

    let _ = request_ok(&mut state, "5", "sync.subjectGroup", sync_params);
    assert_eq!(status(&mut state, &world.subject_group_id)["isSynced"], json!(true));
}

/// Question-set drift (same test, different slots) is reported as
/// outdated via the (position, type) matching rule, and a sync pass
/// reconciles it.
#[test]
fn status_flags_question_slot_drift() {
    let mut state = open_state("coursebook-status-questions");
    let world = setup_world(&mut state);
    let template_section = create_template_section(&mut state, &world.course_id, 0);
    let template_test = request_ok(
        &mut state,
        "1",
        "tests.createFull",
        json!({
            "courseSectionId": template_section,
            "title": "Quiz",
            "questions": [
                { "type": "multiple_choice", "text": "Q1", "points": 1,
                  "options": [{ "text": "a", "isCorrect": true }] }
            ]
        }),
    );
    let sync_params = json!({
        "subjectGroupId": world.subject_group_id,
        "academicStartDate": "2025-09-01",
        "actorId": world.admin_id
    });
    let _ = request_ok(&mut state, "2", "sync.subjectGroup", sync_params.clone());
    assert_eq!(status(&mut state, &world.subject_group_id)["isSynced"], json!(true));

    // Shift the template question to a new slot: the derived copy now
    // occupies a position the template no longer has.
    let question_id = template_test["questionIds"][0]
        .as_str()
        .expect("question id")
        .to_string();
    let _ = request_ok(
        &mut state,
        "3",
        "questions.reorder",
        json!({
            "testId": str_field(&template_test, "testId"),
            "items": [{ "id": question_id, "position": 5 }]
        }),
    );

    let outdated = status(&mut state, &world.subject_group_id);
    assert_eq!(outdated["isSynced"], json!(false));
    assert_eq!(outdated["outdatedItems"][0]["kind"], json!("test"));

    // The pass drops the stale slot and creates the new one.
    let resync = request_ok(&mut state, "4", "sync.subjectGroup", sync_params);
    assert_eq!(resync["totals"]["deleted"], json!(1));
    assert_eq!(resync["totals"]["created"], json!(1));
    assert_eq!(status(&mut state, &world.subject_group_id)["isSynced"], json!(true));
}
