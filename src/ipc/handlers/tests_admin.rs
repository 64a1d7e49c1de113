use rusqlite::{params, OptionalExtension, Transaction};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::grading::QuestionType;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    apply_reorder, bool_param, db_conn, opt_i64, opt_str, required_str,
};
use crate::ipc::types::{AppState, Request};
use crate::sync;

fn handle_tests_create_full(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let section_id = match required_str(req, "courseSectionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let section_exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM course_sections WHERE id = ?",
            [&section_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if section_exists.is_none() {
        return err(&req.id, "not_found", "course section not found", None);
    }

    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let description = match opt_str(req, "description") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let is_published = match bool_param(req, "isPublished", false) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scheduled_at = match opt_str(req, "scheduledAt") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let reveal_results_at = match opt_str(req, "revealResultsAt") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let allow_multiple = match bool_param(req, "allowMultipleAttempts", false) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let max_attempts = match opt_i64(req, "maxAttempts") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let time_limit = match opt_i64(req, "timeLimitMinutes") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let show_correct = match bool_param(req, "showCorrectAnswers", false) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match opt_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let questions = match req.params.get("questions") {
        None => Vec::new(),
        Some(v) if v.is_null() => Vec::new(),
        Some(v) => match v.as_array() {
            Some(items) => items.clone(),
            None => return err(&req.id, "bad_params", "questions must be an array", None),
        },
    };

    let test_id = Uuid::new_v4().to_string();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO tests(
            id, course_section_id, teacher_id, title, description, is_published,
            scheduled_at, reveal_results_at, allow_multiple_attempts, max_attempts,
            time_limit_minutes, show_correct_answers, is_unlinked
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
        params![
            test_id,
            section_id,
            teacher_id,
            title,
            description,
            is_published as i64,
            scheduled_at,
            reveal_results_at,
            allow_multiple as i64,
            max_attempts,
            time_limit,
            show_correct as i64
        ],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    let mut question_ids = Vec::with_capacity(questions.len());
    for (i, q) in questions.iter().enumerate() {
        match insert_question(&tx, &test_id, q, i as i64) {
            Ok(id) => question_ids.push(id),
            Err(msg) => {
                let _ = tx.rollback();
                return err(&req.id, "bad_params", msg, None);
            }
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "testId": test_id, "questionIds": question_ids }),
    )
}

/// Insert one question (plus options) from a create-full payload.
/// Position defaults to the list index.
fn insert_question(
    tx: &Transaction<'_>,
    test_id: &str,
    q: &JsonValue,
    default_position: i64,
) -> Result<String, String> {
    let qtype = q
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or("questions[].type is required")?;
    if QuestionType::parse(qtype).is_none() {
        return Err(format!("unknown question type: {}", qtype));
    }
    let text = q
        .get("text")
        .and_then(|v| v.as_str())
        .ok_or("questions[].text is required")?;
    let points = q.get("points").and_then(|v| v.as_f64()).unwrap_or(1.0);
    let position = q
        .get("position")
        .and_then(|v| v.as_i64())
        .unwrap_or(default_position);
    let sample_answer = q.get("sampleAnswer").and_then(|v| v.as_str());
    let key_words = q.get("keyWords").and_then(|v| v.as_str());
    let correct_answer_text = q.get("correctAnswerText").and_then(|v| v.as_str());
    let matching_pairs_json = match q.get("matchingPairs") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            if !v.is_array() {
                return Err("questions[].matchingPairs must be an array".to_string());
            }
            Some(v.to_string())
        }
    };

    let question_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO questions(
            id, test_id, type, text, points, position, sample_answer,
            key_words, correct_answer_text, matching_pairs_json
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            question_id,
            test_id,
            qtype,
            text,
            points,
            position,
            sample_answer,
            key_words,
            correct_answer_text,
            matching_pairs_json
        ],
    )
    .map_err(|e| e.to_string())?;

    if let Some(options) = q.get("options").and_then(|v| v.as_array()) {
        for (i, o) in options.iter().enumerate() {
            let text = o.get("text").and_then(|v| v.as_str());
            let image_url = o.get("imageUrl").and_then(|v| v.as_str());
            let is_correct = o.get("isCorrect").and_then(|v| v.as_bool()).unwrap_or(false);
            let position = o.get("position").and_then(|v| v.as_i64()).unwrap_or(i as i64);
            tx.execute(
                "INSERT INTO options(id, question_id, text, image_url, is_correct, position)
                 VALUES(?, ?, ?, ?, ?, ?)",
                params![
                    Uuid::new_v4().to_string(),
                    question_id,
                    text,
                    image_url,
                    is_correct as i64,
                    position
                ],
            )
            .map_err(|e| e.to_string())?;
        }
    }
    Ok(question_id)
}

fn handle_tests_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let test_id = match required_str(req, "testId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let test = match conn
        .query_row(
            "SELECT id, course_section_id, title, description, is_published, scheduled_at,
                    reveal_results_at, allow_multiple_attempts, max_attempts,
                    time_limit_minutes, show_correct_answers, template_ref, is_unlinked
             FROM tests WHERE id = ?",
            [&test_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "courseSectionId": r.get::<_, String>(1)?,
                    "title": r.get::<_, String>(2)?,
                    "description": r.get::<_, Option<String>>(3)?,
                    "isPublished": r.get::<_, i64>(4)? != 0,
                    "scheduledAt": r.get::<_, Option<String>>(5)?,
                    "revealResultsAt": r.get::<_, Option<String>>(6)?,
                    "allowMultipleAttempts": r.get::<_, i64>(7)? != 0,
                    "maxAttempts": r.get::<_, Option<i64>>(8)?,
                    "timeLimitMinutes": r.get::<_, Option<i64>>(9)?,
                    "showCorrectAnswers": r.get::<_, i64>(10)? != 0,
                    "templateRef": r.get::<_, Option<String>>(11)?,
                    "isUnlinked": r.get::<_, i64>(12)? != 0,
                }))
            },
        )
        .optional()
    {
        Ok(Some(t)) => t,
        Ok(None) => return err(&req.id, "not_found", "test not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, type, text, points, position, sample_answer, key_words,
                correct_answer_text, matching_pairs_json
         FROM questions WHERE test_id = ? ORDER BY position, id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let questions: Result<Vec<JsonValue>, _> = stmt
        .query_map([&test_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "type": r.get::<_, String>(1)?,
                "text": r.get::<_, String>(2)?,
                "points": r.get::<_, f64>(3)?,
                "position": r.get::<_, i64>(4)?,
                "sampleAnswer": r.get::<_, Option<String>>(5)?,
                "keyWords": r.get::<_, Option<String>>(6)?,
                "correctAnswerText": r.get::<_, Option<String>>(7)?,
                "matchingPairs": r
                    .get::<_, Option<String>>(8)?
                    .and_then(|raw| serde_json::from_str::<JsonValue>(&raw).ok())
                    .unwrap_or(JsonValue::Null),
            }))
        })
        .and_then(|it| it.collect());
    let mut questions = match questions {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    drop(stmt);

    for question in &mut questions {
        let qid = question
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let mut stmt = match conn.prepare(
            "SELECT id, text, image_url, is_correct, position FROM options
             WHERE question_id = ? ORDER BY position, id",
        ) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let options: Result<Vec<JsonValue>, _> = stmt
            .query_map([&qid], |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "text": r.get::<_, Option<String>>(1)?,
                    "imageUrl": r.get::<_, Option<String>>(2)?,
                    "isCorrect": r.get::<_, i64>(3)? != 0,
                    "position": r.get::<_, i64>(4)?,
                }))
            })
            .and_then(|it| it.collect());
        match options {
            Ok(v) => question["options"] = JsonValue::Array(v),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let mut test = test;
    test["questions"] = JsonValue::Array(questions);
    ok(&req.id, json!({ "test": test }))
}

fn handle_tests_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let section_id = match required_str(req, "courseSectionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT id, title, is_published, scheduled_at, template_ref, is_unlinked,
                (SELECT COUNT(*) FROM questions q WHERE q.test_id = t.id)
         FROM tests t
         WHERE course_section_id = ?
         ORDER BY COALESCE(scheduled_at, ''), id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&section_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "isPublished": r.get::<_, i64>(2)? != 0,
                "scheduledAt": r.get::<_, Option<String>>(3)?,
                "templateRef": r.get::<_, Option<String>>(4)?,
                "isUnlinked": r.get::<_, i64>(5)? != 0,
                "questionCount": r.get::<_, i64>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(tests) => ok(&req.id, json!({ "tests": tests })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn set_published(state: &mut AppState, req: &Request, published: bool) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let test_id = match required_str(req, "testId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match conn.execute(
        "UPDATE tests SET is_published = ? WHERE id = ?",
        params![published as i64, test_id],
    ) {
        Ok(0) => err(&req.id, "not_found", "test not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true, "isPublished": published })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_tests_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let test_id = match required_str(req, "testId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let current: Option<(String, Option<String>, i64, Option<String>, Option<String>, i64, Option<i64>, Option<i64>, i64)> =
        match conn
            .query_row(
                "SELECT title, description, is_published, scheduled_at, reveal_results_at,
                        allow_multiple_attempts, max_attempts, time_limit_minutes,
                        show_correct_answers
                 FROM tests WHERE id = ?",
                [&test_id],
                |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                        r.get(5)?,
                        r.get(6)?,
                        r.get(7)?,
                        r.get(8)?,
                    ))
                },
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
    let Some(current) = current else {
        return err(&req.id, "not_found", "test not found", None);
    };

    let title = match opt_str(req, "title") {
        Ok(v) => v.unwrap_or(current.0),
        Err(e) => return e,
    };
    let description = match opt_str(req, "description") {
        Ok(v) => v.or(current.1),
        Err(e) => return e,
    };
    let is_published = match bool_param(req, "isPublished", current.2 != 0) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scheduled_at = match opt_str(req, "scheduledAt") {
        Ok(v) => v.or(current.3),
        Err(e) => return e,
    };
    let reveal_results_at = match opt_str(req, "revealResultsAt") {
        Ok(v) => v.or(current.4),
        Err(e) => return e,
    };
    let allow_multiple = match bool_param(req, "allowMultipleAttempts", current.5 != 0) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let max_attempts = match opt_i64(req, "maxAttempts") {
        Ok(v) => v.or(current.6),
        Err(e) => return e,
    };
    let time_limit = match opt_i64(req, "timeLimitMinutes") {
        Ok(v) => v.or(current.7),
        Err(e) => return e,
    };
    let show_correct = match bool_param(req, "showCorrectAnswers", current.8 != 0) {
        Ok(v) => v,
        Err(e) => return e,
    };

    if let Err(e) = conn.execute(
        "UPDATE tests SET title = ?, description = ?, is_published = ?, scheduled_at = ?,
                reveal_results_at = ?, allow_multiple_attempts = ?, max_attempts = ?,
                time_limit_minutes = ?, show_correct_answers = ?
         WHERE id = ?",
        params![
            title,
            description,
            is_published as i64,
            scheduled_at,
            reveal_results_at,
            allow_multiple as i64,
            max_attempts,
            time_limit,
            show_correct as i64,
            test_id
        ],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_questions_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let question_id = match required_str(req, "questionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let current: Option<(String, f64, Option<String>, Option<String>, Option<String>, Option<String>)> =
        match conn
            .query_row(
                "SELECT text, points, sample_answer, key_words, correct_answer_text,
                        matching_pairs_json
                 FROM questions WHERE id = ?",
                [&question_id],
                |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                        r.get(5)?,
                    ))
                },
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
    let Some(current) = current else {
        return err(&req.id, "not_found", "question not found", None);
    };

    let text = match opt_str(req, "text") {
        Ok(v) => v.unwrap_or(current.0),
        Err(e) => return e,
    };
    let points = req
        .params
        .get("points")
        .and_then(|v| v.as_f64())
        .unwrap_or(current.1);
    let sample_answer = match opt_str(req, "sampleAnswer") {
        Ok(v) => v.or(current.2),
        Err(e) => return e,
    };
    let key_words = match opt_str(req, "keyWords") {
        Ok(v) => v.or(current.3),
        Err(e) => return e,
    };
    let correct_answer_text = match opt_str(req, "correctAnswerText") {
        Ok(v) => v.or(current.4),
        Err(e) => return e,
    };
    let matching_pairs_json = match req.params.get("matchingPairs") {
        None => current.5,
        Some(v) if v.is_null() => current.5,
        Some(v) => {
            if !v.is_array() {
                return err(&req.id, "bad_params", "matchingPairs must be an array", None);
            }
            Some(v.to_string())
        }
    };

    if let Err(e) = conn.execute(
        "UPDATE questions SET text = ?, points = ?, sample_answer = ?, key_words = ?,
                correct_answer_text = ?, matching_pairs_json = ?
         WHERE id = ?",
        params![
            text,
            points,
            sample_answer,
            key_words,
            correct_answer_text,
            matching_pairs_json,
            question_id
        ],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_options_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let option_id = match required_str(req, "optionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let current: Option<(Option<String>, Option<String>, i64)> = match conn
        .query_row(
            "SELECT text, image_url, is_correct FROM options WHERE id = ?",
            [&option_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(current) = current else {
        return err(&req.id, "not_found", "option not found", None);
    };

    let text = match opt_str(req, "text") {
        Ok(v) => v.or(current.0),
        Err(e) => return e,
    };
    let image_url = match opt_str(req, "imageUrl") {
        Ok(v) => v.or(current.1),
        Err(e) => return e,
    };
    let is_correct = match bool_param(req, "isCorrect", current.2 != 0) {
        Ok(v) => v,
        Err(e) => return e,
    };

    if let Err(e) = conn.execute(
        "UPDATE options SET text = ?, image_url = ?, is_correct = ? WHERE id = ?",
        params![text, image_url, is_correct as i64, option_id],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_tests_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let test_id = match required_str(req, "testId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let scope: Option<Option<String>> = match conn
        .query_row(
            "SELECT s.course_id FROM tests t
             JOIN course_sections s ON s.id = t.course_section_id
             WHERE t.id = ?",
            [&test_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(course_id) = scope else {
        return err(&req.id, "not_found", "test not found", None);
    };

    let mut targets = vec![test_id.clone()];
    if course_id.is_some() {
        let mut stmt = match conn
            .prepare("SELECT id FROM tests WHERE template_ref = ? AND is_unlinked = 0")
        {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let clones: Result<Vec<String>, _> = stmt
            .query_map([&test_id], |r| r.get(0))
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
        if let Err(e) = sync::delete_test_cascade(&tx, id) {
            let _ = tx.rollback();
            return err(&req.id, "db_delete_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "deletedTests": targets.len() }))
}

fn handle_questions_reorder(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let test_id = match required_str(req, "testId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match apply_reorder(conn, req, "questions", "test_id", &test_id) {
        Ok(n) => ok(&req.id, json!({ "reordered": n })),
        Err(e) => e,
    }
}

fn handle_questions_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let question_id = match required_str(req, "questionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM questions WHERE id = ?", [&question_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "question not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = sync::delete_question_cascade(&tx, &question_id) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_options_reorder(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let question_id = match required_str(req, "questionId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match apply_reorder(conn, req, "options", "question_id", &question_id) {
        Ok(n) => ok(&req.id, json!({ "reordered": n })),
        Err(e) => e,
    }
}

/// Teacher-facing results: one row per submitted attempt with its
/// answers, plus a per-question aggregate across those attempts.
fn handle_tests_teacher_results(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let test_id = match required_str(req, "testId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let test: Option<(String, f64)> = match conn
        .query_row(
            "SELECT title, (SELECT COALESCE(SUM(points), 0) FROM questions WHERE test_id = tests.id)
             FROM tests WHERE id = ?",
            [&test_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((title, total_points)) = test else {
        return err(&req.id, "not_found", "test not found", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT at.id, at.student_id, u.display_name, at.attempt_number, at.score,
                at.max_score, at.percentage, at.submitted_at, at.is_graded
         FROM attempts at
         JOIN users u ON u.id = at.student_id
         WHERE at.test_id = ? AND at.submitted_at IS NOT NULL
         ORDER BY u.display_name, at.attempt_number",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let attempts: Result<Vec<JsonValue>, _> = stmt
        .query_map([&test_id], |r| {
            Ok(json!({
                "attemptId": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "studentName": r.get::<_, String>(2)?,
                "attemptNumber": r.get::<_, i64>(3)?,
                "score": r.get::<_, Option<f64>>(4)?,
                "maxScore": r.get::<_, Option<f64>>(5)?,
                "percentage": r.get::<_, Option<f64>>(6)?,
                "submittedAt": r.get::<_, Option<String>>(7)?,
                "isGraded": r.get::<_, i64>(8)? != 0,
            }))
        })
        .and_then(|it| it.collect());
    let mut attempts = match attempts {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    drop(stmt);

    for attempt in &mut attempts {
        let attempt_id = attempt
            .get("attemptId")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let mut stmt = match conn.prepare(
            "SELECT a.id, a.question_id, q.text, q.type, a.score, a.max_score,
                    a.is_correct, a.teacher_feedback
             FROM answers a
             JOIN questions q ON q.id = a.question_id
             WHERE a.attempt_id = ?
             ORDER BY q.position, q.id",
        ) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let answers: Result<Vec<JsonValue>, _> = stmt
            .query_map([&attempt_id], |r| {
                Ok(json!({
                    "answerId": r.get::<_, String>(0)?,
                    "questionId": r.get::<_, String>(1)?,
                    "questionText": r.get::<_, String>(2)?,
                    "questionType": r.get::<_, String>(3)?,
                    "score": r.get::<_, Option<f64>>(4)?,
                    "maxScore": r.get::<_, Option<f64>>(5)?,
                    "isCorrect": r.get::<_, Option<i64>>(6)?.map(|v| v != 0),
                    "teacherFeedback": r.get::<_, Option<String>>(7)?,
                }))
            })
            .and_then(|it| it.collect());
        match answers {
            Ok(v) => attempt["answers"] = JsonValue::Array(v),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let mut stmt = match conn.prepare(
        "SELECT q.id, q.text, q.type, q.points,
                COUNT(a.id),
                COALESCE(AVG(a.score), 0),
                SUM(CASE WHEN a.is_correct = 1 THEN 1 ELSE 0 END)
         FROM questions q
         LEFT JOIN answers a ON a.question_id = q.id
         LEFT JOIN attempts at ON at.id = a.attempt_id AND at.submitted_at IS NOT NULL
         WHERE q.test_id = ? AND (a.id IS NULL OR at.id IS NOT NULL)
         GROUP BY q.id
         ORDER BY q.position, q.id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let per_question: Result<Vec<JsonValue>, _> = stmt
        .query_map([&test_id], |r| {
            Ok(json!({
                "questionId": r.get::<_, String>(0)?,
                "text": r.get::<_, String>(1)?,
                "type": r.get::<_, String>(2)?,
                "points": r.get::<_, f64>(3)?,
                "answerCount": r.get::<_, i64>(4)?,
                "averageScore": r.get::<_, f64>(5)?,
                "correctCount": r.get::<_, Option<i64>>(6)?.unwrap_or(0),
            }))
        })
        .and_then(|it| it.collect());
    let per_question = match per_question {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "test": { "id": test_id, "title": title, "totalPoints": total_points },
            "perStudent": attempts,
            "perQuestion": per_question,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "tests.createFull" => Some(handle_tests_create_full(state, req)),
        "tests.get" => Some(handle_tests_get(state, req)),
        "tests.list" => Some(handle_tests_list(state, req)),
        "tests.update" => Some(handle_tests_update(state, req)),
        "tests.publish" => Some(set_published(state, req, true)),
        "tests.unpublish" => Some(set_published(state, req, false)),
        "tests.delete" => Some(handle_tests_delete(state, req)),
        "tests.teacherResults" => Some(handle_tests_teacher_results(state, req)),
        "questions.update" => Some(handle_questions_update(state, req)),
        "questions.reorder" => Some(handle_questions_reorder(state, req)),
        "questions.delete" => Some(handle_questions_delete(state, req)),
        "options.update" => Some(handle_options_update(state, req)),
        "options.reorder" => Some(handle_options_reorder(state, req)),
        _ => None,
    }
}
