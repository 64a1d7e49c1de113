
use serde_json::{json, Value};
use test_support::{
    create_student, create_template_section, derived_section, open_state, request_ok, setup_world,
    str_field,
};

fn question_at(test: &Value, position: i64) -> Value {
    test["test"]["questions"]
        .as_array()
        .expect("questions")
        .iter()
        .find(|q| q["position"] == json!(position))
        .cloned()
        .unwrap_or_else(|| panic!("no question at position {}", position))
}

/// Once a derived question has graded answers from a submitted attempt,
/// sync keeps refreshing its text but never touches the answer key: the
/// reference answer, the answered option's is_correct flag, and the
/// question row itself (even when dropped from the template) all survive.
#[test]
fn graded_answers_freeze_keys_and_block_deletion() {
    let mut state = open_state("coursebook-freeze");
    let world = setup_world(&mut state);
    let template_section = create_template_section(&mut state, &world.course_id, 0);

    let created = request_ok(
        &mut state,
        "1",
        "tests.createFull",
        json!({
            "courseSectionId": template_section,
            "title": "Checkpoint",
            "isPublished": true,
            "questions": [
                {
                    "type": "open_question",
                    "text": "Define osmosis",
                    "points": 5,
                    "correctAnswerText": "Diffusion of water across a membrane"
                },
                {
                    "type": "multiple_choice",
                    "text": "Pick the cell part",
                    "points": 3,
                    "options": [
                        { "text": "Nucleus", "isCorrect": true },
                        { "text": "Brick" }
                    ]
                },
                {
                    "type": "multiple_choice",
                    "text": "Doomed question",
                    "points": 2,
                    "options": [
                        { "text": "Keep me", "isCorrect": true },
                        { "text": "Other" }
                    ]
                }
            ]
        }),
    );
    let template_question_ids = created["questionIds"].as_array().expect("ids").clone();

    let _ = request_ok(
        &mut state,
        "2",
        "sync.subjectGroup",
        json!({
            "subjectGroupId": world.subject_group_id,
            "academicStartDate": "2025-09-01",
            "actorId": world.admin_id
        }),
    );

    let derived = derived_section(&mut state, &world.subject_group_id, &template_section)
        .expect("derived section");
    let derived_section_id = str_field(&derived, "id");
    let derived_tests = request_ok(
        &mut state,
        "3",
        "tests.list",
        json!({ "courseSectionId": derived_section_id }),
    );
    let derived_test_id = derived_tests["tests"][0]["id"]
        .as_str()
        .expect("derived test id")
        .to_string();

    let derived_test = request_ok(
        &mut state,
        "4",
        "tests.get",
        json!({ "testId": derived_test_id }),
    );
    let open_q = question_at(&derived_test, 0);
    let choice_q = question_at(&derived_test, 1);
    let doomed_q = question_at(&derived_test, 2);
    let nucleus_option = choice_q["options"]
        .as_array()
        .unwrap()
        .iter()
        .find(|o| o["text"] == json!("Nucleus"))
        .cloned()
        .expect("nucleus option");
    let keep_option = doomed_q["options"]
        .as_array()
        .unwrap()
        .iter()
        .find(|o| o["text"] == json!("Keep me"))
        .cloned()
        .expect("keep option");

    // A student submits: every derived question now has graded work.
    let student_id = create_student(&mut state, "5");
    let attempt = request_ok(
        &mut state,
        "6",
        "attempts.start",
        json!({ "testId": derived_test_id, "studentId": student_id }),
    );
    let attempt_id = str_field(&attempt, "attemptId");
    let _ = request_ok(
        &mut state,
        "7",
        "attempts.submitAnswer",
        json!({
            "attemptId": attempt_id,
            "questionId": open_q["id"],
            "textAnswer": "diffusion of water across a membrane"
        }),
    );
    let _ = request_ok(
        &mut state,
        "8",
        "attempts.submitAnswer",
        json!({
            "attemptId": attempt_id,
            "questionId": choice_q["id"],
            "selectedOptionIds": [nucleus_option["id"]]
        }),
    );
    let _ = request_ok(
        &mut state,
        "9",
        "attempts.submitAnswer",
        json!({
            "attemptId": attempt_id,
            "questionId": doomed_q["id"],
            "selectedOptionIds": [keep_option["id"]]
        }),
    );
    let _ = request_ok(
        &mut state,
        "10",
        "attempts.submit",
        json!({ "attemptId": attempt_id }),
    );

    // Author keeps editing the template: new wording, a new answer key,
    // flipped option correctness, and the third question removed.
    let _ = request_ok(
        &mut state,
        "11",
        "questions.update",
        json!({
            "questionId": template_question_ids[0],
            "text": "Define osmosis precisely",
            "correctAnswerText": "Water moves from low to high solute concentration"
        }),
    );
    let template_choice = request_ok(
        &mut state,
        "12",
        "tests.get",
        json!({ "testId": created["testId"] }),
    );
    let template_choice_q = question_at(&template_choice, 1);
    for option in template_choice_q["options"].as_array().unwrap() {
        let flipped = option["text"] == json!("Brick");
        let _ = request_ok(
            &mut state,
            "13",
            "options.update",
            json!({ "optionId": option["id"], "isCorrect": flipped }),
        );
    }
    let _ = request_ok(
        &mut state,
        "14",
        "questions.delete",
        json!({ "questionId": template_question_ids[2] }),
    );

    let resync = request_ok(
        &mut state,
        "15",
        "sync.subjectGroup",
        json!({
            "subjectGroupId": world.subject_group_id,
            "academicStartDate": "2025-09-01",
            "actorId": world.admin_id
        }),
    );
    // The orphaned-but-answered question is preserved, not deleted.
    assert_eq!(resync["totals"]["deleted"], json!(0));

    let after = request_ok(
        &mut state,
        "16",
        "tests.get",
        json!({ "testId": derived_test_id }),
    );
    let open_after = question_at(&after, 0);
    assert_eq!(open_after["text"], json!("Define osmosis precisely"));
    assert_eq!(
        open_after["correctAnswerText"],
        json!("Diffusion of water across a membrane"),
        "graded reference answer must not change"
    );

    let choice_after = question_at(&after, 1);
    let options_after = choice_after["options"].as_array().unwrap();
    let nucleus_after = options_after
        .iter()
        .find(|o| o["text"] == json!("Nucleus"))
        .expect("nucleus survives");
    let brick_after = options_after
        .iter()
        .find(|o| o["text"] == json!("Brick"))
        .expect("brick survives");
    // The answered option keeps its flag; the untouched one follows the
    // template.
    assert_eq!(nucleus_after["isCorrect"], json!(true));
    assert_eq!(brick_after["isCorrect"], json!(true));

    let doomed_after = question_at(&after, 2);
    assert_eq!(doomed_after["text"], json!("Doomed question"));
}

/// Without submitted attempts nothing is frozen: removed template
/// questions take their derived counterparts with them.
#[test]
fn unanswered_questions_are_removed_on_resync() {
    let mut state = open_state("coursebook-freeze-clean");
    let world = setup_world(&mut state);
    let template_section = create_template_section(&mut state, &world.course_id, 0);
    let created = request_ok(
        &mut state,
        "1",
        "tests.createFull",
        json!({
            "courseSectionId": template_section,
            "title": "Quiz",
            "questions": [
                { "type": "multiple_choice", "text": "Q1", "points": 1,
                  "options": [{ "text": "a", "isCorrect": true }] },
                { "type": "multiple_choice", "text": "Q2", "points": 1,
                  "options": [{ "text": "b", "isCorrect": true }] }
            ]
        }),
    );

    let sync_params = json!({
        "subjectGroupId": world.subject_group_id,
        "academicStartDate": "2025-09-01",
        "actorId": world.admin_id
    });
    let _ = request_ok(&mut state, "2", "sync.subjectGroup", sync_params.clone());

    let _ = request_ok(
        &mut state,
        "3",
        "questions.delete",
        json!({ "questionId": created["questionIds"][1] }),
    );
    let resync = request_ok(&mut state, "4", "sync.subjectGroup", sync_params);
    assert_eq!(resync["totals"]["deleted"], json!(1));

    let derived = derived_section(&mut state, &world.subject_group_id, &template_section)
        .expect("derived section");
    let tests = request_ok(
        &mut state,
        "5",
        "tests.list",
        json!({ "courseSectionId": str_field(&derived, "id") }),
    );
    assert_eq!(tests["tests"][0]["questionCount"], json!(1));
}
