use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::grading::{self, AnswerView, QuestionType, QuestionView};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, now_datetime, opt_f64, opt_str, required_str, require_grader,
};
use crate::ipc::types::{AppState, Request};

fn handle_attempts_start(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let test_id = match required_str(req, "testId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let test: Option<(i64, i64, Option<i64>)> = match conn
        .query_row(
            "SELECT is_published, allow_multiple_attempts, max_attempts FROM tests WHERE id = ?",
            [&test_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((is_published, allow_multiple, max_attempts)) = test else {
        return err(&req.id, "not_found", "test not found", None);
    };
    if is_published == 0 {
        return err(&req.id, "conflict", "test is not published", Some(json!({ "reason": "not_published" })));
    }

    // Resume an open attempt instead of stacking a second one.
    let open: Option<(String, i64)> = match conn
        .query_row(
            "SELECT id, attempt_number FROM attempts
             WHERE test_id = ? AND student_id = ? AND submitted_at IS NULL
             ORDER BY attempt_number DESC LIMIT 1",
            params![test_id, student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some((attempt_id, attempt_number)) = open {
        return ok(
            &req.id,
            json!({ "attemptId": attempt_id, "attemptNumber": attempt_number, "resumed": true }),
        );
    }

    let used: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM attempts WHERE test_id = ? AND student_id = ?",
        params![test_id, student_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if used > 0 && allow_multiple == 0 {
        return err(
            &req.id,
            "conflict",
            "test does not allow multiple attempts",
            Some(json!({ "reason": "attempt_limit_reached" })),
        );
    }
    if let Some(max) = max_attempts {
        if allow_multiple != 0 && used >= max {
            return err(
                &req.id,
                "conflict",
                "attempt limit reached",
                Some(json!({ "reason": "attempt_limit_reached" })),
            );
        }
    }

    let attempt_id = Uuid::new_v4().to_string();
    let attempt_number = used + 1;
    if let Err(e) = conn.execute(
        "INSERT INTO attempts(id, test_id, student_id, attempt_number, started_at)
         VALUES(?, ?, ?, ?, ?)",
        params![attempt_id, test_id, student_id, attempt_number, now_datetime()],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({ "attemptId": attempt_id, "attemptNumber": attempt_number, "resumed": false }),
    )
}

fn handle_attempts_submit_answer(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let attempt_id = match required_str(req, "attemptId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let question_id = match required_str(req, "questionId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let attempt: Option<(String, Option<String>)> = match conn
        .query_row(
            "SELECT test_id, submitted_at FROM attempts WHERE id = ?",
            [&attempt_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((test_id, submitted_at)) = attempt else {
        return err(&req.id, "not_found", "attempt not found", None);
    };
    if submitted_at.is_some() {
        return err(
            &req.id,
            "conflict",
            "attempt already submitted",
            Some(json!({ "reason": "already_submitted" })),
        );
    }

    let question_ok: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM questions WHERE id = ? AND test_id = ?",
            params![question_id, test_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if question_ok.is_none() {
        return err(&req.id, "bad_params", "question not found in this test", None);
    }

    let text_answer = match opt_str(req, "textAnswer") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let matching_answers_json = match req.params.get("matchingAnswers") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => {
            if !v.is_array() {
                return err(&req.id, "bad_params", "matchingAnswers must be an array", None);
            }
            Some(v.to_string())
        }
    };
    let selected_option_ids: Option<Vec<String>> = match req.params.get("selectedOptionIds") {
        None => None,
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_array() {
            Some(items) => {
                let mut ids = Vec::with_capacity(items.len());
                for item in items {
                    match item.as_str() {
                        Some(s) => ids.push(s.to_string()),
                        None => {
                            return err(
                                &req.id,
                                "bad_params",
                                "selectedOptionIds must be strings",
                                None,
                            )
                        }
                    }
                }
                Some(ids)
            }
            None => {
                return err(&req.id, "bad_params", "selectedOptionIds must be an array", None)
            }
        },
    };

    if let Some(ids) = &selected_option_ids {
        for oid in ids {
            let belongs: Option<i64> = match conn
                .query_row(
                    "SELECT 1 FROM options WHERE id = ? AND question_id = ?",
                    params![oid, question_id],
                    |r| r.get(0),
                )
                .optional()
            {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            if belongs.is_none() {
                return err(
                    &req.id,
                    "bad_params",
                    format!("option does not belong to question: {}", oid),
                    None,
                );
            }
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let existing: Option<String> = match tx
        .query_row(
            "SELECT id FROM answers WHERE attempt_id = ? AND question_id = ?",
            params![attempt_id, question_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return err(&req.id, "db_query_failed", e.to_string(), None);
        }
    };

    let answer_id = match existing {
        Some(id) => {
            if let Err(e) = tx.execute(
                "UPDATE answers SET text_answer = ?, matching_answers_json = ? WHERE id = ?",
                params![text_answer, matching_answers_json, id],
            ) {
                let _ = tx.rollback();
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
            id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            if let Err(e) = tx.execute(
                "INSERT INTO answers(id, attempt_id, question_id, text_answer, matching_answers_json)
                 VALUES(?, ?, ?, ?, ?)",
                params![id, attempt_id, question_id, text_answer, matching_answers_json],
            ) {
                let _ = tx.rollback();
                return err(&req.id, "db_insert_failed", e.to_string(), None);
            }
            id
        }
    };

    if let Some(ids) = &selected_option_ids {
        if let Err(e) = tx.execute(
            "DELETE FROM answer_selected_options WHERE answer_id = ?",
            [&answer_id],
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_delete_failed", e.to_string(), None);
        }
        for oid in ids {
            if let Err(e) = tx.execute(
                "INSERT OR IGNORE INTO answer_selected_options(answer_id, option_id) VALUES(?, ?)",
                params![answer_id, oid],
            ) {
                let _ = tx.rollback();
                return err(&req.id, "db_insert_failed", e.to_string(), None);
            }
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "answerId": answer_id }))
}

struct QuestionScoring {
    id: String,
    points: f64,
    view: QuestionView,
}

fn load_question_scoring(
    conn: &Connection,
    test_id: &str,
) -> anyhow::Result<Vec<QuestionScoring>> {
    let mut stmt = conn.prepare(
        "SELECT id, type, points, key_words, correct_answer_text, matching_pairs_json
         FROM questions WHERE test_id = ? ORDER BY position, id",
    )?;
    let raw: Vec<(String, String, f64, Option<String>, Option<String>, Option<String>)> = stmt
        .query_map([test_id], |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    let mut out = Vec::with_capacity(raw.len());
    for (id, qtype, points, key_words, correct_answer_text, matching_pairs_json) in raw {
        let question_type = QuestionType::parse(&qtype)
            .ok_or_else(|| anyhow::anyhow!("unknown question type: {}", qtype))?;
        let mut stmt =
            conn.prepare("SELECT id FROM options WHERE question_id = ? AND is_correct = 1")?;
        let correct_option_ids = stmt
            .query_map([&id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        let matching_pairs = matching_pairs_json
            .as_deref()
            .map(grading::parse_matching_pairs)
            .unwrap_or_default();
        out.push(QuestionScoring {
            id,
            points,
            view: QuestionView {
                question_type,
                points,
                correct_option_ids,
                key_words,
                correct_answer_text,
                matching_pairs,
            },
        });
    }
    Ok(out)
}

fn load_answer_view(conn: &Connection, answer_id: &str) -> anyhow::Result<AnswerView> {
    let (text_answer, matching_answers_json): (Option<String>, Option<String>) = conn.query_row(
        "SELECT text_answer, matching_answers_json FROM answers WHERE id = ?",
        [answer_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    let mut stmt =
        conn.prepare("SELECT option_id FROM answer_selected_options WHERE answer_id = ?")?;
    let selected_option_ids = stmt
        .query_map([answer_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(AnswerView {
        selected_option_ids,
        text_answer,
        matching_answers: matching_answers_json
            .as_deref()
            .map(grading::parse_matching_pairs)
            .unwrap_or_default(),
    })
}

fn handle_attempts_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let attempt_id = match required_str(req, "attemptId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let attempt: Option<String> = match conn
        .query_row(
            "SELECT test_id FROM attempts WHERE id = ?",
            [&attempt_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(test_id) = attempt else {
        return err(&req.id, "not_found", "attempt not found", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Check-then-act guard: the row is claimed inside the transaction, so
    // a racing second submit sees zero affected rows and bails.
    let claimed = match tx.execute(
        "UPDATE attempts SET submitted_at = ?, is_completed = 1
         WHERE id = ? AND submitted_at IS NULL",
        params![now_datetime(), attempt_id],
    ) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    };
    if claimed == 0 {
        let _ = tx.rollback();
        return err(
            &req.id,
            "conflict",
            "attempt already submitted",
            Some(json!({ "reason": "already_submitted" })),
        );
    }

    let result = (|| -> anyhow::Result<JsonValue> {
        let questions = load_question_scoring(&tx, &test_id)?;

        // Unanswered questions get an explicit zero row before grading.
        for q in &questions {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM answers WHERE attempt_id = ? AND question_id = ?",
                    params![attempt_id, q.id],
                    |r| r.get(0),
                )
                .optional()?;
            if existing.is_none() {
                tx.execute(
                    "INSERT INTO answers(id, attempt_id, question_id, score, max_score, is_correct)
                     VALUES(?, ?, ?, 0, ?, 0)",
                    params![Uuid::new_v4().to_string(), attempt_id, q.id, q.points],
                )?;
            }
        }

        let mut total_score = 0.0f64;
        let mut max_score = 0.0f64;
        for q in &questions {
            max_score += q.points;
            let answer_id: String = tx.query_row(
                "SELECT id FROM answers WHERE attempt_id = ? AND question_id = ?",
                params![attempt_id, q.id],
                |r| r.get(0),
            )?;
            let view = load_answer_view(&tx, &answer_id)?;
            let result = grading::score(&q.view, &view);
            match result.points {
                Some(points) => {
                    tx.execute(
                        "UPDATE answers SET score = ?, max_score = ?, is_correct = ? WHERE id = ?",
                        params![points, q.points, (points == q.points) as i64, answer_id],
                    )?;
                    total_score += points;
                }
                None => {
                    // Needs a teacher: leave any pre-set score in place and
                    // clear the verdict.
                    tx.execute(
                        "UPDATE answers SET max_score = ?, is_correct = NULL WHERE id = ?",
                        params![q.points, answer_id],
                    )?;
                }
            }
        }

        let ungraded: i64 = tx.query_row(
            "SELECT COUNT(*) FROM answers WHERE attempt_id = ? AND score IS NULL",
            [&attempt_id],
            |r| r.get(0),
        )?;
        let is_graded = ungraded == 0;
        let percentage = if max_score > 0.0 {
            Some(total_score / max_score * 100.0)
        } else {
            None
        };
        tx.execute(
            "UPDATE attempts SET score = ?, max_score = ?, percentage = ?, is_graded = ?
             WHERE id = ?",
            params![total_score, max_score, percentage, is_graded as i64, attempt_id],
        )?;

        Ok(json!({
            "attemptId": attempt_id,
            "score": total_score,
            "maxScore": max_score,
            "percentage": percentage,
            "isGraded": is_graded,
        }))
    })();

    match result {
        Ok(body) => {
            if let Err(e) = tx.commit() {
                return err(&req.id, "db_commit_failed", e.to_string(), None);
            }
            ok(&req.id, body)
        }
        Err(e) => {
            let _ = tx.rollback();
            err(&req.id, "db_update_failed", e.to_string(), None)
        }
    }
}

fn handle_attempts_view_results(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let attempt_id = match required_str(req, "attemptId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let actor_id = match required_str(req, "actorId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let row: Option<(String, Option<String>, Option<String>, Option<f64>, Option<f64>, Option<f64>, i64, i64)> =
        match conn
            .query_row(
                "SELECT at.student_id, at.submitted_at, t.reveal_results_at,
                        at.score, at.max_score, at.percentage, at.is_graded,
                        t.show_correct_answers
                 FROM attempts at
                 JOIN tests t ON t.id = at.test_id
                 WHERE at.id = ?",
                [&attempt_id],
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
                    ))
                },
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
    let Some((
        student_id,
        submitted_at,
        reveal_results_at,
        score,
        max_score,
        percentage,
        is_graded,
        show_correct,
    )) = row
    else {
        return err(&req.id, "not_found", "attempt not found", None);
    };
    if student_id != actor_id {
        return err(
            &req.id,
            "permission_denied",
            "attempt belongs to another student",
            None,
        );
    }
    if submitted_at.is_none() {
        return err(
            &req.id,
            "conflict",
            "attempt is not submitted yet",
            Some(json!({ "reason": "not_submitted" })),
        );
    }
    if let Some(reveal) = &reveal_results_at {
        if reveal.as_str() > now_datetime().as_str() {
            return err(
                &req.id,
                "conflict",
                "results are not yet available",
                Some(json!({ "reason": "results_not_available" })),
            );
        }
    }

    if let Err(e) = conn.execute(
        "UPDATE attempts SET results_viewed_at = ?
         WHERE id = ? AND results_viewed_at IS NULL",
        params![now_datetime(), attempt_id],
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    // Per-answer breakdown; the answer key itself only when the test
    // opts in via show_correct_answers.
    let mut stmt = match conn.prepare(
        "SELECT a.question_id, q.text, q.type, a.score, a.max_score, a.is_correct,
                a.teacher_feedback, q.correct_answer_text
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
            let mut row = json!({
                "questionId": r.get::<_, String>(0)?,
                "questionText": r.get::<_, String>(1)?,
                "questionType": r.get::<_, String>(2)?,
                "score": r.get::<_, Option<f64>>(3)?,
                "maxScore": r.get::<_, Option<f64>>(4)?,
                "isCorrect": r.get::<_, Option<i64>>(5)?.map(|v| v != 0),
                "teacherFeedback": r.get::<_, Option<String>>(6)?,
            });
            if show_correct != 0 {
                row["correctAnswerText"] = json!(r.get::<_, Option<String>>(7)?);
            }
            Ok(row)
        })
        .and_then(|it| it.collect());
    let mut answers = match answers {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    drop(stmt);

    if show_correct != 0 {
        for answer in &mut answers {
            let qid = answer
                .get("questionId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let mut stmt = match conn.prepare(
                "SELECT id FROM options WHERE question_id = ? AND is_correct = 1
                 ORDER BY position, id",
            ) {
                Ok(s) => s,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            let correct_ids: Result<Vec<String>, _> = stmt
                .query_map([&qid], |r| r.get(0))
                .and_then(|it| it.collect());
            match correct_ids {
                Ok(ids) => answer["correctOptionIds"] = json!(ids),
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            }
        }
    }

    ok(
        &req.id,
        json!({
            "attemptId": attempt_id,
            "score": score,
            "maxScore": max_score,
            "percentage": percentage,
            "isGraded": is_graded != 0,
            "submittedAt": submitted_at,
            "answers": answers,
        }),
    )
}

fn handle_answers_bulk_grade(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if let Err(e) = require_grader(conn, req) {
        return e;
    }
    let Some(items) = req.params.get("items").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing items", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let mut graded = Vec::with_capacity(items.len());
    for item in items {
        let Some(answer_id) = item.get("answerId").and_then(|v| v.as_str()) else {
            let _ = tx.rollback();
            return err(&req.id, "bad_params", "items[].answerId is required", None);
        };
        let score = item.get("score").and_then(|v| v.as_f64());
        let feedback = item
            .get("teacherFeedback")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        let max_score: Option<Option<f64>> = match tx
            .query_row(
                "SELECT max_score FROM answers WHERE id = ?",
                [answer_id],
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
        };
        let Some(max_score) = max_score else {
            let _ = tx.rollback();
            return err(
                &req.id,
                "not_found",
                format!("answer not found: {}", answer_id),
                None,
            );
        };

        // Known quirk kept from the original behavior: is_correct compares
        // for exact equality with max_score, so intentional partial credit
        // still reads as "incorrect".
        let is_correct = score.map(|s| Some(s) == max_score);
        if let Err(e) = tx.execute(
            "UPDATE answers SET score = ?, teacher_feedback = ?, is_correct = ? WHERE id = ?",
            params![score, feedback, is_correct.map(|b| b as i64), answer_id],
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        graded.push(json!({
            "answerId": answer_id,
            "score": score,
            "maxScore": max_score,
            "isCorrect": is_correct,
            "teacherFeedback": feedback,
        }));
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "answers": graded }))
}

fn handle_answers_update_score(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    if let Err(e) = require_grader(conn, req) {
        return e;
    }
    let answer_id = match required_str(req, "answerId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let score = match opt_f64(req, "score") {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "bad_params", "missing score", None),
        Err(e) => return e,
    };
    let feedback = match opt_str(req, "teacherFeedback") {
        Ok(v) => v.unwrap_or_default(),
        Err(e) => return e,
    };

    let row: Option<(String, Option<f64>)> = match conn
        .query_row(
            "SELECT attempt_id, max_score FROM answers WHERE id = ?",
            [&answer_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((attempt_id, max_score)) = row else {
        return err(&req.id, "not_found", "answer not found", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let result = (|| -> anyhow::Result<JsonValue> {
        let is_correct = Some(score) == max_score;
        tx.execute(
            "UPDATE answers SET score = ?, teacher_feedback = ?, is_correct = ? WHERE id = ?",
            params![score, feedback, is_correct as i64, answer_id],
        )?;

        // Manual re-score keeps attempt totals in step.
        let total: f64 = tx.query_row(
            "SELECT COALESCE(SUM(score), 0) FROM answers WHERE attempt_id = ?",
            [&attempt_id],
            |r| r.get(0),
        )?;
        let attempt_max: Option<f64> = tx.query_row(
            "SELECT max_score FROM attempts WHERE id = ?",
            [&attempt_id],
            |r| r.get(0),
        )?;
        let percentage = attempt_max
            .filter(|m| *m > 0.0)
            .map(|m| total / m * 100.0);
        tx.execute(
            "UPDATE attempts SET score = ?, percentage = ?, is_graded = 1, graded_at = ?
             WHERE id = ?",
            params![total, percentage, now_datetime(), attempt_id],
        )?;

        Ok(json!({
            "answerId": answer_id,
            "score": score,
            "maxScore": max_score,
            "isCorrect": is_correct,
            "attemptScore": total,
            "attemptPercentage": percentage,
        }))
    })();

    match result {
        Ok(body) => {
            if let Err(e) = tx.commit() {
                return err(&req.id, "db_commit_failed", e.to_string(), None);
            }
            ok(&req.id, body)
        }
        Err(e) => {
            let _ = tx.rollback();
            err(&req.id, "db_update_failed", e.to_string(), None)
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attempts.start" => Some(handle_attempts_start(state, req)),
        "attempts.submitAnswer" => Some(handle_attempts_submit_answer(state, req)),
        "attempts.submit" => Some(handle_attempts_submit(state, req)),
        "attempts.viewResults" => Some(handle_attempts_view_results(state, req)),
        "answers.bulkGrade" => Some(handle_answers_bulk_grade(state, req)),
        "answers.updateScore" => Some(handle_answers_update_score(state, req)),
        _ => None,
    }
}
