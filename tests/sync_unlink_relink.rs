
use serde_json::json;
use test_support::{
    create_template_section, derived_section, open_state, request_err, request_ok, setup_world,
    str_field,
};

/// Unlinked derived units sit out every sync pass until relinked; relink
/// re-enables propagation without itself syncing anything.
#[test]
fn unlink_freezes_unit_until_relink() {
    let mut state = open_state("coursebook-unlink");
    let world = setup_world(&mut state);
    let template_section = create_template_section(&mut state, &world.course_id, 0);
    let template_resource = request_ok(
        &mut state,
        "1",
        "resources.create",
        json!({
            "courseSectionId": template_section,
            "type": "text",
            "title": "Reading"
        }),
    );
    let template_resource_id = str_field(&template_resource, "resourceId");

    let sync_params = json!({
        "subjectGroupId": world.subject_group_id,
        "academicStartDate": "2025-09-01",
        "actorId": world.admin_id
    });
    let _ = request_ok(&mut state, "2", "sync.subjectGroup", sync_params.clone());

    let derived = derived_section(&mut state, &world.subject_group_id, &template_section)
        .expect("derived section");
    let derived_section_id = str_field(&derived, "id");
    let tree = request_ok(
        &mut state,
        "3",
        "resources.tree",
        json!({ "courseSectionId": derived_section_id }),
    );
    let derived_resource_id = tree["resources"][0]["id"]
        .as_str()
        .expect("derived resource")
        .to_string();

    let _ = request_ok(
        &mut state,
        "4",
        "templates.unlink",
        json!({
            "unitType": "resource",
            "id": derived_resource_id,
            "actorId": world.admin_id
        }),
    );

    let _ = request_ok(
        &mut state,
        "5",
        "resources.update",
        json!({ "resourceId": template_resource_id, "title": "Reading v2" }),
    );
    let _ = request_ok(&mut state, "6", "sync.subjectGroup", sync_params.clone());
    let tree = request_ok(
        &mut state,
        "7",
        "resources.tree",
        json!({ "courseSectionId": derived_section_id }),
    );
    assert_eq!(tree["resources"][0]["title"], json!("Reading"));
    assert_eq!(tree["resources"][0]["isUnlinked"], json!(true));

    // Relink alone changes nothing; the next pass pulls template state.
    let _ = request_ok(
        &mut state,
        "8",
        "templates.relink",
        json!({
            "unitType": "resource",
            "id": derived_resource_id,
            "actorId": world.admin_id
        }),
    );
    let tree = request_ok(
        &mut state,
        "9",
        "resources.tree",
        json!({ "courseSectionId": derived_section_id }),
    );
    assert_eq!(tree["resources"][0]["title"], json!("Reading"));

    let _ = request_ok(&mut state, "10", "sync.subjectGroup", sync_params);
    let tree = request_ok(
        &mut state,
        "11",
        "resources.tree",
        json!({ "courseSectionId": derived_section_id }),
    );
    assert_eq!(tree["resources"][0]["title"], json!("Reading v2"));
    assert_eq!(tree["resources"][0]["isUnlinked"], json!(false));
}

/// Relinking a unit that was authored directly in the group (never
/// synced from a template) is an invalid state.
#[test]
fn relink_requires_template_ancestor() {
    let mut state = open_state("coursebook-relink-invalid");
    let world = setup_world(&mut state);
    let live_section = request_ok(
        &mut state,
        "1",
        "sections.create",
        json!({
            "subjectGroupId": world.subject_group_id,
            "title": "Teacher's own"
        }),
    );
    let own_resource = request_ok(
        &mut state,
        "2",
        "resources.create",
        json!({
            "courseSectionId": str_field(&live_section, "sectionId"),
            "type": "text",
            "title": "Handout"
        }),
    );
    let error = request_err(
        &mut state,
        "3",
        "templates.relink",
        json!({
            "unitType": "resource",
            "id": str_field(&own_resource, "resourceId"),
            "actorId": world.admin_id
        }),
        "conflict",
    );
    assert_eq!(error["details"]["reason"], json!("invalid_state"));

    // Unlink itself is idempotent and fine on the same unit.
    let _ = request_ok(
        &mut state,
        "4",
        "templates.unlink",
        json!({
            "unitType": "resource",
            "id": str_field(&own_resource, "resourceId"),
            "actorId": world.admin_id
        }),
    );
}

/// An unlinked derived section keeps its own fields frozen, but its
/// children still follow the template.
#[test]
fn unlinked_section_freezes_own_fields_only() {
    let mut state = open_state("coursebook-unlink-section");
    let world = setup_world(&mut state);
    let template_section = create_template_section(&mut state, &world.course_id, 0);
    let template_resource = request_ok(
        &mut state,
        "1",
        "resources.create",
        json!({
            "courseSectionId": template_section,
            "type": "text",
            "title": "Notes"
        }),
    );

    let sync_params = json!({
        "subjectGroupId": world.subject_group_id,
        "academicStartDate": "2025-09-01",
        "actorId": world.admin_id
    });
    let _ = request_ok(&mut state, "2", "sync.subjectGroup", sync_params.clone());
    let derived = derived_section(&mut state, &world.subject_group_id, &template_section)
        .expect("derived section");
    let derived_section_id = str_field(&derived, "id");

    let _ = request_ok(
        &mut state,
        "3",
        "templates.unlink",
        json!({
            "unitType": "section",
            "id": derived_section_id,
            "actorId": world.admin_id
        }),
    );

    let _ = request_ok(
        &mut state,
        "4",
        "sections.update",
        json!({ "sectionId": template_section, "title": "Renamed week" }),
    );
    let _ = request_ok(
        &mut state,
        "5",
        "resources.update",
        json!({
            "resourceId": str_field(&template_resource, "resourceId"),
            "title": "Notes v2"
        }),
    );
    let _ = request_ok(&mut state, "6", "sync.subjectGroup", sync_params);

    let derived = derived_section(&mut state, &world.subject_group_id, &template_section)
        .expect("derived section");
    assert_eq!(derived["title"], json!("Week 1"), "section fields stay frozen");
    let tree = request_ok(
        &mut state,
        "7",
        "resources.tree",
        json!({ "courseSectionId": derived_section_id }),
    );
    assert_eq!(tree["resources"][0]["title"], json!("Notes v2"));
}

/// An unlinked derived test is skipped wholesale, metadata included.
#[test]
fn unlinked_test_is_skipped() {
    let mut state = open_state("coursebook-unlink-test");
    let world = setup_world(&mut state);
    let template_section = create_template_section(&mut state, &world.course_id, 0);
    let template_test = request_ok(
        &mut state,
        "1",
        "tests.createFull",
        json!({
            "courseSectionId": template_section,
            "title": "Original title",
            "questions": []
        }),
    );

    let sync_params = json!({
        "subjectGroupId": world.subject_group_id,
        "academicStartDate": "2025-09-01",
        "actorId": world.admin_id
    });
    let _ = request_ok(&mut state, "2", "sync.subjectGroup", sync_params.clone());
    let derived = derived_section(&mut state, &world.subject_group_id, &template_section)
        .expect("derived section");
    let tests = request_ok(
        &mut state,
        "3",
        "tests.list",
        json!({ "courseSectionId": str_field(&derived, "id") }),
    );
    let derived_test_id = tests["tests"][0]["id"].as_str().unwrap().to_string();

    let _ = request_ok(
        &mut state,
        "4",
        "templates.unlink",
        json!({ "unitType": "test", "id": derived_test_id, "actorId": world.admin_id }),
    );
    let _ = request_ok(
        &mut state,
        "5",
        "tests.update",
        json!({ "testId": str_field(&template_test, "testId"), "title": "Changed title" }),
    );
    let _ = request_ok(&mut state, "6", "sync.subjectGroup", sync_params);

    let after = request_ok(
        &mut state,
        "7",
        "tests.get",
        json!({ "testId": derived_test_id }),
    );
    assert_eq!(after["test"]["title"], json!("Original title"));
}
