//! The sync planner: walks a template section tree and a subject group's
//! derived copy in lockstep and emits create/update/preserve/delete
//! decisions per node. Derived units are keyed by `(scope, template_ref)`;
//! grading freezes and unlink flags are re-checked on every pass.

use std::collections::{HashMap, HashSet};

use chrono::{Duration, NaiveDate};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use crate::calendar;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: i64,
    pub updated: i64,
    pub preserved: i64,
    pub deleted: i64,
}

impl SyncReport {
    pub fn merge(&mut self, other: &SyncReport) {
        self.created += other.created;
        self.updated += other.updated;
        self.preserved += other.preserved;
        self.deleted += other.deleted;
    }

    pub fn to_json(&self) -> JsonValue {
        json!({
            "created": self.created,
            "updated": self.updated,
            "preserved": self.preserved,
            "deleted": self.deleted,
        })
    }
}

/// Backing files of rows removed during a sync pass. The caller deletes
/// them (best-effort) after its transaction commits so a rollback never
/// loses file content.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub report: SyncReport,
    pub deleted_files: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TemplateSection {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub position: i64,
    pub week_index: Option<i64>,
    pub duration_days: Option<i64>,
}

pub fn load_template_sections(
    conn: &Connection,
    course_id: &str,
) -> anyhow::Result<Vec<TemplateSection>> {
    let mut stmt = conn.prepare(
        "SELECT id, title, description, start_date, end_date, position,
                template_week_index, template_duration_days
         FROM course_sections
         WHERE course_id = ?
         ORDER BY position, id",
    )?;
    let rows = stmt
        .query_map([course_id], |r| {
            Ok(TemplateSection {
                id: r.get(0)?,
                title: r.get(1)?,
                description: r.get(2)?,
                start_date: r.get(3)?,
                end_date: r.get(4)?,
                position: r.get(5)?,
                week_index: r.get(6)?,
                duration_days: r.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Absolute dates for a derived section: offsets win over any legacy
/// absolute dates the template might still carry.
fn section_dates(
    template: &TemplateSection,
    academic_start: NaiveDate,
) -> (Option<String>, Option<String>) {
    match template.week_index {
        Some(week) => {
            let start = academic_start + Duration::days(7 * week);
            let end = start + Duration::days(template.duration_days.unwrap_or(6));
            (
                Some(calendar::format_date(start)),
                Some(calendar::format_date(end)),
            )
        }
        None => (template.start_date.clone(), template.end_date.clone()),
    }
}

/// Sync one template section (and everything under it) into a subject
/// group. Runs entirely within the caller's transaction.
pub fn sync_section(
    conn: &Connection,
    template: &TemplateSection,
    subject_group_id: &str,
    academic_start: NaiveDate,
) -> anyhow::Result<SyncOutcome> {
    let mut outcome = SyncOutcome::default();

    let existing: Option<(String, Option<String>, i64)> = conn
        .query_row(
            "SELECT id, start_date, is_unlinked
             FROM course_sections
             WHERE subject_group_id = ? AND template_ref = ?",
            params![subject_group_id, template.id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;

    let derived_section_id = match existing {
        None => {
            let (start, end) = section_dates(template, academic_start);
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO course_sections(
                    id, subject_group_id, template_ref, title, description,
                    start_date, end_date, position, is_unlinked
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, 0)",
                params![
                    id,
                    subject_group_id,
                    template.id,
                    template.title,
                    template.description,
                    start,
                    end,
                    template.position
                ],
            )?;
            outcome.report.created += 1;
            id
        }
        Some((id, _, unlinked)) if unlinked != 0 => {
            // The unlink flag freezes the section's own fields only; its
            // children still take part in the pass below.
            outcome.report.preserved += 1;
            id
        }
        Some((id, start_date, _)) => {
            conn.execute(
                "UPDATE course_sections SET title = ?, description = ?, position = ?
                 WHERE id = ?",
                params![template.title, template.description, template.position, id],
            )?;
            if start_date.is_none() {
                let (start, end) = section_dates(template, academic_start);
                conn.execute(
                    "UPDATE course_sections SET start_date = ?, end_date = ? WHERE id = ?",
                    params![start, end, id],
                )?;
            }
            outcome.report.updated += 1;
            id
        }
    };

    sync_resources(conn, &template.id, &derived_section_id, &mut outcome)?;
    sync_assignments(conn, &template.id, &derived_section_id, &mut outcome)?;
    sync_tests(conn, &template.id, &derived_section_id, &mut outcome)?;

    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Resources

#[derive(Debug, Clone)]
struct TemplateResource {
    id: String,
    parent: Option<String>,
    rtype: String,
    title: String,
    description: Option<String>,
    url: Option<String>,
    file_ref: Option<String>,
    position: i64,
}

fn load_template_resources(
    conn: &Connection,
    template_section_id: &str,
) -> anyhow::Result<Vec<TemplateResource>> {
    let mut stmt = conn.prepare(
        "SELECT id, parent_resource_id, type, title, description, url, file_ref, position
         FROM resources
         WHERE course_section_id = ?
         ORDER BY position, id",
    )?;
    let rows = stmt
        .query_map([template_section_id], |r| {
            Ok(TemplateResource {
                id: r.get(0)?,
                parent: r.get(1)?,
                rtype: r.get(2)?,
                title: r.get(3)?,
                description: r.get(4)?,
                url: r.get(5)?,
                file_ref: r.get(6)?,
                position: r.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn sync_resources(
    conn: &Connection,
    template_section_id: &str,
    derived_section_id: &str,
    outcome: &mut SyncOutcome,
) -> anyhow::Result<()> {
    let all = load_template_resources(conn, template_section_id)?;
    let roots: Vec<&TemplateResource> = all.iter().filter(|r| r.parent.is_none()).collect();
    sync_resource_tree(conn, &all, roots, None, derived_section_id, outcome)?;

    // Self-heal: derived rows whose template is gone from this section.
    let template_ids: HashSet<&str> = all.iter().map(|r| r.id.as_str()).collect();
    let mut stmt = conn.prepare(
        "SELECT id, template_ref FROM resources
         WHERE course_section_id = ? AND template_ref IS NOT NULL AND is_unlinked = 0",
    )?;
    let derived: Vec<(String, String)> = stmt
        .query_map([derived_section_id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    for (id, template_ref) in derived {
        if !template_ids.contains(template_ref.as_str()) {
            // The row may already be gone as part of an ancestor's subtree.
            if resource_exists(conn, &id)? {
                outcome.report.deleted +=
                    delete_resource_subtree(conn, &id, &mut outcome.deleted_files)?;
            }
        }
    }
    Ok(())
}

fn resource_exists(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let hit: Option<i64> = conn
        .query_row("SELECT 1 FROM resources WHERE id = ?", [id], |r| r.get(0))
        .optional()?;
    Ok(hit.is_some())
}

/// Depth-first walk, parent before children, driven by an explicit stack
/// with a visited set so cyclic parent links cannot loop the pass.
fn sync_resource_tree(
    conn: &Connection,
    all: &[TemplateResource],
    roots: Vec<&TemplateResource>,
    root_parent: Option<String>,
    derived_section_id: &str,
    outcome: &mut SyncOutcome,
) -> anyhow::Result<()> {
    let mut children: HashMap<&str, Vec<&TemplateResource>> = HashMap::new();
    for r in all {
        if let Some(parent) = r.parent.as_deref() {
            children.entry(parent).or_default().push(r);
        }
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: Vec<(&TemplateResource, Option<String>)> = Vec::new();
    for r in roots.into_iter().rev() {
        stack.push((r, root_parent.clone()));
    }

    while let Some((t, derived_parent)) = stack.pop() {
        if !visited.insert(t.id.as_str()) {
            continue;
        }

        let existing: Option<(String, i64)> = conn
            .query_row(
                "SELECT id, is_unlinked FROM resources
                 WHERE course_section_id = ? AND template_ref = ?",
                params![derived_section_id, t.id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        let derived_id = match existing {
            None => {
                let id = Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO resources(
                        id, course_section_id, parent_resource_id, template_ref,
                        type, title, description, url, file_ref, position, is_unlinked
                     ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
                    params![
                        id,
                        derived_section_id,
                        derived_parent,
                        t.id,
                        t.rtype,
                        t.title,
                        t.description,
                        t.url,
                        t.file_ref,
                        t.position
                    ],
                )?;
                outcome.report.created += 1;
                id
            }
            Some((_, unlinked)) if unlinked != 0 => {
                // Unlinked: the whole subtree is left alone.
                outcome.report.preserved += 1;
                continue;
            }
            Some((id, _)) => {
                conn.execute(
                    "UPDATE resources SET parent_resource_id = ?, type = ?, title = ?,
                            description = ?, url = ?, position = ?
                     WHERE id = ?",
                    params![
                        derived_parent,
                        t.rtype,
                        t.title,
                        t.description,
                        t.url,
                        t.position,
                        id
                    ],
                )?;
                if t.file_ref.is_some() {
                    conn.execute(
                        "UPDATE resources SET file_ref = ? WHERE id = ?",
                        params![t.file_ref, id],
                    )?;
                }
                outcome.report.updated += 1;
                id
            }
        };

        if let Some(kids) = children.get(t.id.as_str()) {
            for child in kids.iter().rev() {
                stack.push((*child, Some(derived_id.clone())));
            }
        }
    }
    Ok(())
}

/// Sync just one template resource's subtree into a subject group, used
/// by create-time propagation. Returns None when the group has no derived
/// counterpart for the section (or for the resource's parent) yet.
pub fn sync_resource_scoped(
    conn: &Connection,
    template_resource_id: &str,
    subject_group_id: &str,
) -> anyhow::Result<Option<SyncOutcome>> {
    let (template_section_id, parent): (String, Option<String>) = conn.query_row(
        "SELECT course_section_id, parent_resource_id FROM resources WHERE id = ?",
        [template_resource_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;

    let Some(derived_section_id) = derived_section_of(conn, &template_section_id, subject_group_id)?
    else {
        return Ok(None);
    };

    let derived_parent = match parent.as_deref() {
        None => None,
        Some(parent_id) => {
            let mapped: Option<String> = conn
                .query_row(
                    "SELECT id FROM resources WHERE course_section_id = ? AND template_ref = ?",
                    params![derived_section_id, parent_id],
                    |r| r.get(0),
                )
                .optional()?;
            match mapped {
                Some(id) => Some(id),
                None => return Ok(None),
            }
        }
    };

    let all = load_template_resources(conn, &template_section_id)?;
    let Some(root) = all.iter().find(|r| r.id == template_resource_id) else {
        return Ok(None);
    };

    let mut outcome = SyncOutcome::default();
    sync_resource_tree(
        conn,
        &all,
        vec![root],
        derived_parent,
        &derived_section_id,
        &mut outcome,
    )?;
    Ok(Some(outcome))
}

fn derived_section_of(
    conn: &Connection,
    template_section_id: &str,
    subject_group_id: &str,
) -> anyhow::Result<Option<String>> {
    let id: Option<String> = conn
        .query_row(
            "SELECT id FROM course_sections WHERE subject_group_id = ? AND template_ref = ?",
            params![subject_group_id, template_section_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Delete a resource and all descendants. Returns the number of rows
/// removed; backing file refs are pushed for best-effort cleanup after
/// the caller commits.
pub fn delete_resource_subtree(
    conn: &Connection,
    resource_id: &str,
    deleted_files: &mut Vec<String>,
) -> anyhow::Result<i64> {
    let mut ordered: Vec<(String, Option<String>)> = Vec::new();
    let mut stack = vec![resource_id.to_string()];
    let mut seen: HashSet<String> = HashSet::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id.clone()) {
            continue;
        }
        let row: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT id, file_ref FROM resources WHERE id = ?",
                [&id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some(row) = row else { continue };
        ordered.push(row);
        let mut stmt =
            conn.prepare("SELECT id FROM resources WHERE parent_resource_id = ?")?;
        let kids = stmt
            .query_map([&id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        stack.extend(kids);
    }

    // Children first so the parent FK never dangles mid-delete.
    for (id, file_ref) in ordered.iter().rev() {
        conn.execute("DELETE FROM resources WHERE id = ?", [id])?;
        if let Some(f) = file_ref {
            deleted_files.push(f.clone());
        }
    }
    Ok(ordered.len() as i64)
}

// ---------------------------------------------------------------------------
// Assignments

#[derive(Debug, Clone)]
struct TemplateAssignment {
    id: String,
    teacher_id: Option<String>,
    title: String,
    description: Option<String>,
    due_at: Option<String>,
    max_grade: i64,
    offset_days: Option<i64>,
    due_time: Option<String>,
}

fn load_template_assignments(
    conn: &Connection,
    template_section_id: &str,
) -> anyhow::Result<Vec<TemplateAssignment>> {
    let mut stmt = conn.prepare(
        "SELECT id, teacher_id, title, description, due_at, max_grade,
                template_start_offset_days, template_due_time
         FROM assignments
         WHERE course_section_id = ?
         ORDER BY id",
    )?;
    let rows = stmt
        .query_map([template_section_id], |r| {
            Ok(TemplateAssignment {
                id: r.get(0)?,
                teacher_id: r.get(1)?,
                title: r.get(2)?,
                description: r.get(3)?,
                due_at: r.get(4)?,
                max_grade: r.get(5)?,
                offset_days: r.get(6)?,
                due_time: r.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn derived_section_start(conn: &Connection, section_id: &str) -> anyhow::Result<Option<NaiveDate>> {
    let raw: Option<String> = conn.query_row(
        "SELECT start_date FROM course_sections WHERE id = ?",
        [section_id],
        |r| r.get(0),
    )?;
    Ok(raw.as_deref().and_then(calendar::parse_date))
}

/// Due date relative to the derived section's start when the template
/// carries offsets; the template's absolute due_at otherwise.
fn assignment_due_at(
    t: &TemplateAssignment,
    section_start: Option<NaiveDate>,
) -> Option<String> {
    match (t.offset_days, t.due_time.as_deref(), section_start) {
        (Some(days), Some(time), Some(start)) => {
            let date = start + Duration::days(days);
            Some(format!("{}T{}", calendar::format_date(date), time))
        }
        _ => t.due_at.clone(),
    }
}

fn sync_assignments(
    conn: &Connection,
    template_section_id: &str,
    derived_section_id: &str,
    outcome: &mut SyncOutcome,
) -> anyhow::Result<()> {
    let templates = load_template_assignments(conn, template_section_id)?;
    let section_start = derived_section_start(conn, derived_section_id)?;

    for t in &templates {
        sync_one_assignment(conn, t, derived_section_id, section_start, outcome)?;
    }

    let template_ids: HashSet<&str> = templates.iter().map(|t| t.id.as_str()).collect();
    let mut stmt = conn.prepare(
        "SELECT id, template_ref FROM assignments
         WHERE course_section_id = ? AND template_ref IS NOT NULL AND is_unlinked = 0",
    )?;
    let derived: Vec<(String, String)> = stmt
        .query_map([derived_section_id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    for (id, template_ref) in derived {
        if !template_ids.contains(template_ref.as_str()) {
            delete_assignment_cascade(conn, &id)?;
            outcome.report.deleted += 1;
        }
    }
    Ok(())
}

fn sync_one_assignment(
    conn: &Connection,
    t: &TemplateAssignment,
    derived_section_id: &str,
    section_start: Option<NaiveDate>,
    outcome: &mut SyncOutcome,
) -> anyhow::Result<()> {
    let due_at = assignment_due_at(t, section_start);

    let existing: Option<(String, i64)> = conn
        .query_row(
            "SELECT id, is_unlinked FROM assignments
             WHERE course_section_id = ? AND template_ref = ?",
            params![derived_section_id, t.id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;

    let derived_id = match existing {
        None => {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO assignments(
                    id, course_section_id, teacher_id, template_ref, title,
                    description, due_at, max_grade, is_unlinked
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, 0)",
                params![
                    id,
                    derived_section_id,
                    t.teacher_id,
                    t.id,
                    t.title,
                    t.description,
                    due_at,
                    t.max_grade
                ],
            )?;
            outcome.report.created += 1;
            id
        }
        Some((_, unlinked)) if unlinked != 0 => {
            outcome.report.preserved += 1;
            return Ok(());
        }
        Some((id, _)) => {
            conn.execute(
                "UPDATE assignments SET title = ?, description = ?, due_at = ?, max_grade = ?
                 WHERE id = ?",
                params![t.title, t.description, due_at, t.max_grade, id],
            )?;
            outcome.report.updated += 1;
            id
        }
    };

    sync_attachments(conn, &t.id, &derived_id)?;
    Ok(())
}

/// Attachments are a positional sub-list: matched by (position, type),
/// removed when the pair disappears from the template.
fn sync_attachments(
    conn: &Connection,
    template_assignment_id: &str,
    derived_assignment_id: &str,
) -> anyhow::Result<()> {
    let mut stmt = conn.prepare(
        "SELECT position, type, title, content, file_url
         FROM assignment_attachments WHERE assignment_id = ?
         ORDER BY position, id",
    )?;
    let template_atts: Vec<(i64, String, String, Option<String>, Option<String>)> = stmt
        .query_map([template_assignment_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    let mut stmt = conn.prepare(
        "SELECT id, position, type FROM assignment_attachments WHERE assignment_id = ?
         ORDER BY position, id",
    )?;
    let derived_atts: Vec<(String, i64, String)> = stmt
        .query_map([derived_assignment_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    let template_keys: HashSet<(i64, &str)> = template_atts
        .iter()
        .map(|(pos, ty, ..)| (*pos, ty.as_str()))
        .collect();
    let mut derived_by_key: HashMap<(i64, String), String> = HashMap::new();
    for (id, pos, ty) in &derived_atts {
        if !template_keys.contains(&(*pos, ty.as_str())) {
            conn.execute("DELETE FROM assignment_attachments WHERE id = ?", [id])?;
        } else {
            derived_by_key
                .entry((*pos, ty.clone()))
                .or_insert_with(|| id.clone());
        }
    }

    for (pos, ty, title, content, file_url) in &template_atts {
        match derived_by_key.get(&(*pos, ty.clone())) {
            Some(id) => {
                conn.execute(
                    "UPDATE assignment_attachments SET title = ?, content = ?, file_url = ?
                     WHERE id = ?",
                    params![title, content, file_url, id],
                )?;
            }
            None => {
                conn.execute(
                    "INSERT INTO assignment_attachments(
                        id, assignment_id, type, title, content, file_url, position
                     ) VALUES(?, ?, ?, ?, ?, ?, ?)",
                    params![
                        Uuid::new_v4().to_string(),
                        derived_assignment_id,
                        ty,
                        title,
                        content,
                        file_url,
                        pos
                    ],
                )?;
            }
        }
    }
    Ok(())
}

/// Scoped assignment sync for create-time propagation. None when the
/// group has no derived section counterpart yet.
pub fn sync_assignment_scoped(
    conn: &Connection,
    template_assignment_id: &str,
    subject_group_id: &str,
) -> anyhow::Result<Option<SyncOutcome>> {
    let template_section_id: String = conn.query_row(
        "SELECT course_section_id FROM assignments WHERE id = ?",
        [template_assignment_id],
        |r| r.get(0),
    )?;
    let Some(derived_section_id) = derived_section_of(conn, &template_section_id, subject_group_id)?
    else {
        return Ok(None);
    };

    let templates = load_template_assignments(conn, &template_section_id)?;
    let Some(t) = templates.iter().find(|t| t.id == template_assignment_id) else {
        return Ok(None);
    };
    let section_start = derived_section_start(conn, &derived_section_id)?;

    let mut outcome = SyncOutcome::default();
    sync_one_assignment(conn, t, &derived_section_id, section_start, &mut outcome)?;
    Ok(Some(outcome))
}

pub fn delete_assignment_cascade(conn: &Connection, assignment_id: &str) -> anyhow::Result<()> {
    conn.execute(
        "DELETE FROM assignment_attachments WHERE assignment_id = ?",
        [assignment_id],
    )?;
    conn.execute("DELETE FROM assignments WHERE id = ?", [assignment_id])?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests

#[derive(Debug, Clone)]
struct TemplateTest {
    id: String,
    teacher_id: Option<String>,
    title: String,
    description: Option<String>,
    is_published: i64,
    scheduled_at: Option<String>,
    reveal_results_at: Option<String>,
    allow_multiple_attempts: i64,
    max_attempts: Option<i64>,
    time_limit_minutes: Option<i64>,
    show_correct_answers: i64,
}

#[derive(Debug, Clone)]
struct QuestionRow {
    id: String,
    qtype: String,
    text: String,
    points: f64,
    position: i64,
    sample_answer: Option<String>,
    key_words: Option<String>,
    correct_answer_text: Option<String>,
    matching_pairs_json: Option<String>,
}

fn load_template_tests(
    conn: &Connection,
    template_section_id: &str,
) -> anyhow::Result<Vec<TemplateTest>> {
    let mut stmt = conn.prepare(
        "SELECT id, teacher_id, title, description, is_published, scheduled_at,
                reveal_results_at, allow_multiple_attempts, max_attempts,
                time_limit_minutes, show_correct_answers
         FROM tests
         WHERE course_section_id = ?
         ORDER BY id",
    )?;
    let rows = stmt
        .query_map([template_section_id], |r| {
            Ok(TemplateTest {
                id: r.get(0)?,
                teacher_id: r.get(1)?,
                title: r.get(2)?,
                description: r.get(3)?,
                is_published: r.get(4)?,
                scheduled_at: r.get(5)?,
                reveal_results_at: r.get(6)?,
                allow_multiple_attempts: r.get(7)?,
                max_attempts: r.get(8)?,
                time_limit_minutes: r.get(9)?,
                show_correct_answers: r.get(10)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_questions(conn: &Connection, test_id: &str) -> anyhow::Result<Vec<QuestionRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, type, text, points, position, sample_answer, key_words,
                correct_answer_text, matching_pairs_json
         FROM questions
         WHERE test_id = ?
         ORDER BY position, id",
    )?;
    let rows = stmt
        .query_map([test_id], |r| {
            Ok(QuestionRow {
                id: r.get(0)?,
                qtype: r.get(1)?,
                text: r.get(2)?,
                points: r.get(3)?,
                position: r.get(4)?,
                sample_answer: r.get(5)?,
                key_words: r.get(6)?,
                correct_answer_text: r.get(7)?,
                matching_pairs_json: r.get(8)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// True when any submitted attempt holds an answer referencing this
/// question. Always computed fresh; never cached on the row.
pub fn has_graded_work(conn: &Connection, question_id: &str) -> anyhow::Result<bool> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM answers a
             JOIN attempts at ON at.id = a.attempt_id
             WHERE a.question_id = ? AND at.submitted_at IS NOT NULL
             LIMIT 1",
            [question_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

fn options_with_answers(conn: &Connection, question_id: &str) -> anyhow::Result<HashSet<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT aso.option_id
         FROM answer_selected_options aso
         JOIN answers a ON a.id = aso.answer_id
         JOIN attempts at ON at.id = a.attempt_id
         WHERE a.question_id = ? AND at.submitted_at IS NOT NULL",
    )?;
    let ids = stmt
        .query_map([question_id], |r| r.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(ids)
}

fn test_has_submitted_attempts(conn: &Connection, test_id: &str) -> anyhow::Result<bool> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM attempts WHERE test_id = ? AND submitted_at IS NOT NULL LIMIT 1",
            [test_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

fn sync_tests(
    conn: &Connection,
    template_section_id: &str,
    derived_section_id: &str,
    outcome: &mut SyncOutcome,
) -> anyhow::Result<()> {
    let templates = load_template_tests(conn, template_section_id)?;
    for t in &templates {
        sync_one_test(conn, t, derived_section_id, outcome)?;
    }

    let template_ids: HashSet<&str> = templates.iter().map(|t| t.id.as_str()).collect();
    let mut stmt = conn.prepare(
        "SELECT id, template_ref FROM tests
         WHERE course_section_id = ? AND template_ref IS NOT NULL AND is_unlinked = 0",
    )?;
    let derived: Vec<(String, String)> = stmt
        .query_map([derived_section_id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    for (id, template_ref) in derived {
        if !template_ids.contains(template_ref.as_str()) {
            if test_has_submitted_attempts(conn, &id)? {
                outcome.report.preserved += 1;
            } else {
                delete_test_cascade(conn, &id)?;
                outcome.report.deleted += 1;
            }
        }
    }
    Ok(())
}

fn sync_one_test(
    conn: &Connection,
    t: &TemplateTest,
    derived_section_id: &str,
    outcome: &mut SyncOutcome,
) -> anyhow::Result<()> {
    let existing: Option<(String, i64)> = conn
        .query_row(
            "SELECT id, is_unlinked FROM tests
             WHERE course_section_id = ? AND template_ref = ?",
            params![derived_section_id, t.id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;

    match existing {
        None => {
            let derived_id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO tests(
                    id, course_section_id, teacher_id, template_ref, title, description,
                    is_published, scheduled_at, reveal_results_at, allow_multiple_attempts,
                    max_attempts, time_limit_minutes, show_correct_answers, is_unlinked
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)",
                params![
                    derived_id,
                    derived_section_id,
                    t.teacher_id,
                    t.id,
                    t.title,
                    t.description,
                    t.is_published,
                    t.scheduled_at,
                    t.reveal_results_at,
                    t.allow_multiple_attempts,
                    t.max_attempts,
                    t.time_limit_minutes,
                    t.show_correct_answers
                ],
            )?;
            outcome.report.created += 1;
            for q in load_questions(conn, &t.id)? {
                clone_question(conn, &q, &derived_id)?;
                outcome.report.created += 1;
            }
        }
        Some((_, unlinked)) if unlinked != 0 => {
            outcome.report.preserved += 1;
        }
        Some((derived_id, _)) => {
            // Scalar metadata is always safe to refresh, live attempts or not.
            conn.execute(
                "UPDATE tests SET title = ?, description = ?, is_published = ?,
                        scheduled_at = ?, reveal_results_at = ?, allow_multiple_attempts = ?,
                        max_attempts = ?, time_limit_minutes = ?, show_correct_answers = ?
                 WHERE id = ?",
                params![
                    t.title,
                    t.description,
                    t.is_published,
                    t.scheduled_at,
                    t.reveal_results_at,
                    t.allow_multiple_attempts,
                    t.max_attempts,
                    t.time_limit_minutes,
                    t.show_correct_answers,
                    derived_id
                ],
            )?;
            outcome.report.updated += 1;
            let has_completed = test_has_submitted_attempts(conn, &derived_id)?;
            reconcile_questions(conn, &t.id, &derived_id, has_completed, outcome)?;
        }
    }
    Ok(())
}

/// Questions are matched by (position, type), not by id: a template
/// question and its derived counterpart are "the same" when they occupy
/// the same slot with the same kind.
fn reconcile_questions(
    conn: &Connection,
    template_test_id: &str,
    derived_test_id: &str,
    has_completed_attempts: bool,
    outcome: &mut SyncOutcome,
) -> anyhow::Result<()> {
    let template_questions = load_questions(conn, template_test_id)?;
    let derived_questions = load_questions(conn, derived_test_id)?;

    let template_keys: HashSet<(i64, &str)> = template_questions
        .iter()
        .map(|q| (q.position, q.qtype.as_str()))
        .collect();

    let mut derived_by_key: HashMap<(i64, String), &QuestionRow> = HashMap::new();
    for q in &derived_questions {
        if template_keys.contains(&(q.position, q.qtype.as_str())) {
            derived_by_key
                .entry((q.position, q.qtype.clone()))
                .or_insert(q);
        } else if has_completed_attempts && has_graded_work(conn, &q.id)? {
            // Orphaned but answered: grading integrity outranks template
            // fidelity.
            outcome.report.preserved += 1;
        } else {
            delete_question_cascade(conn, &q.id)?;
            outcome.report.deleted += 1;
        }
    }

    for tq in &template_questions {
        match derived_by_key.get(&(tq.position, tq.qtype.clone())) {
            Some(dq) => {
                let frozen = has_graded_work(conn, &dq.id)?;
                conn.execute(
                    "UPDATE questions SET text = ?, points = ?, sample_answer = ?,
                            key_words = ?, matching_pairs_json = ?
                     WHERE id = ?",
                    params![
                        tq.text,
                        tq.points,
                        tq.sample_answer,
                        tq.key_words,
                        tq.matching_pairs_json,
                        dq.id
                    ],
                )?;
                if !frozen {
                    conn.execute(
                        "UPDATE questions SET correct_answer_text = ? WHERE id = ?",
                        params![tq.correct_answer_text, dq.id],
                    )?;
                }
                reconcile_options(conn, &tq.id, &dq.id)?;
                outcome.report.updated += 1;
            }
            None => {
                clone_question(conn, tq, derived_test_id)?;
                outcome.report.created += 1;
            }
        }
    }
    Ok(())
}

/// Options are matched by position alone. An option referenced by a
/// submitted answer is never removed and keeps its is_correct flag.
fn reconcile_options(
    conn: &Connection,
    template_question_id: &str,
    derived_question_id: &str,
) -> anyhow::Result<()> {
    let answered = options_with_answers(conn, derived_question_id)?;

    let mut stmt = conn.prepare(
        "SELECT id, text, image_url, is_correct, position FROM options
         WHERE question_id = ? ORDER BY position, id",
    )?;
    let template_options: Vec<(String, Option<String>, Option<String>, i64, i64)> = stmt
        .query_map([template_question_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let derived_options: Vec<(String, Option<String>, Option<String>, i64, i64)> = stmt
        .query_map([derived_question_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    let template_positions: HashSet<i64> =
        template_options.iter().map(|(.., pos)| *pos).collect();
    let mut derived_by_pos: HashMap<i64, &str> = HashMap::new();
    for (id, _, _, _, pos) in &derived_options {
        if template_positions.contains(pos) {
            derived_by_pos.entry(*pos).or_insert(id.as_str());
        } else if !answered.contains(id) {
            // Selections from unsubmitted attempts die with the option.
            conn.execute(
                "DELETE FROM answer_selected_options WHERE option_id = ?",
                [id],
            )?;
            conn.execute("DELETE FROM options WHERE id = ?", [id])?;
        }
    }

    for (_, text, image_url, is_correct, pos) in &template_options {
        match derived_by_pos.get(pos) {
            Some(id) => {
                conn.execute(
                    "UPDATE options SET text = ?, image_url = ? WHERE id = ?",
                    params![text, image_url, id],
                )?;
                if !answered.contains(*id) {
                    conn.execute(
                        "UPDATE options SET is_correct = ? WHERE id = ?",
                        params![is_correct, id],
                    )?;
                }
            }
            None => {
                conn.execute(
                    "INSERT INTO options(id, question_id, text, image_url, is_correct, position)
                     VALUES(?, ?, ?, ?, ?, ?)",
                    params![
                        Uuid::new_v4().to_string(),
                        derived_question_id,
                        text,
                        image_url,
                        is_correct,
                        pos
                    ],
                )?;
            }
        }
    }
    Ok(())
}

fn clone_question(
    conn: &Connection,
    q: &QuestionRow,
    derived_test_id: &str,
) -> anyhow::Result<()> {
    let derived_q_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO questions(
            id, test_id, type, text, points, position, sample_answer,
            key_words, correct_answer_text, matching_pairs_json
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            derived_q_id,
            derived_test_id,
            q.qtype,
            q.text,
            q.points,
            q.position,
            q.sample_answer,
            q.key_words,
            q.correct_answer_text,
            q.matching_pairs_json
        ],
    )?;
    let mut stmt = conn.prepare(
        "SELECT text, image_url, is_correct, position FROM options
         WHERE question_id = ? ORDER BY position, id",
    )?;
    let options: Vec<(Option<String>, Option<String>, i64, i64)> = stmt
        .query_map([&q.id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    for (text, image_url, is_correct, position) in options {
        conn.execute(
            "INSERT INTO options(id, question_id, text, image_url, is_correct, position)
             VALUES(?, ?, ?, ?, ?, ?)",
            params![
                Uuid::new_v4().to_string(),
                derived_q_id,
                text,
                image_url,
                is_correct,
                position
            ],
        )?;
    }
    Ok(())
}

pub fn delete_question_cascade(conn: &Connection, question_id: &str) -> anyhow::Result<()> {
    conn.execute(
        "DELETE FROM answer_selected_options
         WHERE answer_id IN (SELECT id FROM answers WHERE question_id = ?)",
        [question_id],
    )?;
    conn.execute(
        "DELETE FROM answer_selected_options
         WHERE option_id IN (SELECT id FROM options WHERE question_id = ?)",
        [question_id],
    )?;
    conn.execute("DELETE FROM answers WHERE question_id = ?", [question_id])?;
    conn.execute("DELETE FROM options WHERE question_id = ?", [question_id])?;
    conn.execute("DELETE FROM questions WHERE id = ?", [question_id])?;
    Ok(())
}

pub fn delete_test_cascade(conn: &Connection, test_id: &str) -> anyhow::Result<()> {
    conn.execute(
        "DELETE FROM answer_selected_options
         WHERE answer_id IN (
           SELECT a.id FROM answers a
           JOIN attempts at ON at.id = a.attempt_id
           WHERE at.test_id = ?
         )",
        [test_id],
    )?;
    conn.execute(
        "DELETE FROM answers WHERE attempt_id IN (SELECT id FROM attempts WHERE test_id = ?)",
        [test_id],
    )?;
    conn.execute("DELETE FROM attempts WHERE test_id = ?", [test_id])?;
    conn.execute(
        "DELETE FROM answer_selected_options
         WHERE option_id IN (
           SELECT o.id FROM options o
           JOIN questions q ON q.id = o.question_id
           WHERE q.test_id = ?
         )",
        [test_id],
    )?;
    conn.execute(
        "DELETE FROM options WHERE question_id IN (SELECT id FROM questions WHERE test_id = ?)",
        [test_id],
    )?;
    conn.execute("DELETE FROM questions WHERE test_id = ?", [test_id])?;
    conn.execute("DELETE FROM tests WHERE id = ?", [test_id])?;
    Ok(())
}

/// Delete a derived or template section with everything under it.
pub fn delete_section_cascade(
    conn: &Connection,
    section_id: &str,
    deleted_files: &mut Vec<String>,
) -> anyhow::Result<()> {
    let mut stmt = conn.prepare("SELECT id FROM tests WHERE course_section_id = ?")?;
    let tests: Vec<String> = stmt
        .query_map([section_id], |r| r.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    for id in tests {
        delete_test_cascade(conn, &id)?;
    }

    let mut stmt = conn.prepare("SELECT id FROM assignments WHERE course_section_id = ?")?;
    let assignments: Vec<String> = stmt
        .query_map([section_id], |r| r.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    for id in assignments {
        delete_assignment_cascade(conn, &id)?;
    }

    let mut stmt = conn.prepare(
        "SELECT id FROM resources WHERE course_section_id = ? AND parent_resource_id IS NULL",
    )?;
    let roots: Vec<String> = stmt
        .query_map([section_id], |r| r.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);
    for id in roots {
        delete_resource_subtree(conn, &id, deleted_files)?;
    }

    conn.execute("DELETE FROM course_sections WHERE id = ?", [section_id])?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Read-only status report

/// Compare a subject group against its course templates without mutating
/// anything, using the same matching rules as the sync pass.
pub fn sync_status(
    conn: &Connection,
    subject_group_id: &str,
    course_id: &str,
) -> anyhow::Result<(bool, Vec<JsonValue>, Vec<JsonValue>)> {
    let mut missing: Vec<JsonValue> = Vec::new();
    let mut outdated: Vec<JsonValue> = Vec::new();

    for template in load_template_sections(conn, course_id)? {
        let derived: Option<(String, String, i64)> = conn
            .query_row(
                "SELECT id, title, is_unlinked FROM course_sections
                 WHERE subject_group_id = ? AND template_ref = ?",
                params![subject_group_id, template.id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;

        let Some((derived_id, derived_title, unlinked)) = derived else {
            missing.push(json!({
                "kind": "section",
                "templateId": template.id,
                "title": template.title,
            }));
            continue;
        };
        if unlinked != 0 {
            // Intentionally diverged; not reported.
            continue;
        }
        if derived_title != template.title {
            outdated.push(json!({
                "kind": "section",
                "templateId": template.id,
                "derivedId": derived_id,
                "title": template.title,
            }));
        }

        status_for_resources(conn, &template.id, &derived_id, &mut missing, &mut outdated)?;
        status_for_assignments(conn, &template.id, &derived_id, &mut missing, &mut outdated)?;
        status_for_tests(conn, &template.id, &derived_id, &mut missing, &mut outdated)?;
    }

    let is_synced = missing.is_empty() && outdated.is_empty();
    Ok((is_synced, missing, outdated))
}

fn status_for_resources(
    conn: &Connection,
    template_section_id: &str,
    derived_section_id: &str,
    missing: &mut Vec<JsonValue>,
    outdated: &mut Vec<JsonValue>,
) -> anyhow::Result<()> {
    for t in load_template_resources(conn, template_section_id)? {
        let derived: Option<(String, String, i64)> = conn
            .query_row(
                "SELECT id, title, is_unlinked FROM resources
                 WHERE course_section_id = ? AND template_ref = ?",
                params![derived_section_id, t.id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        match derived {
            None => missing.push(json!({
                "kind": "resource",
                "templateId": t.id,
                "title": t.title,
            })),
            Some((_, _, unlinked)) if unlinked != 0 => {}
            Some((derived_id, title, _)) => {
                if title != t.title {
                    outdated.push(json!({
                        "kind": "resource",
                        "templateId": t.id,
                        "derivedId": derived_id,
                        "title": t.title,
                    }));
                }
            }
        }
    }
    Ok(())
}

fn status_for_assignments(
    conn: &Connection,
    template_section_id: &str,
    derived_section_id: &str,
    missing: &mut Vec<JsonValue>,
    outdated: &mut Vec<JsonValue>,
) -> anyhow::Result<()> {
    for t in load_template_assignments(conn, template_section_id)? {
        let derived: Option<(String, String, i64, i64)> = conn
            .query_row(
                "SELECT id, title, max_grade, is_unlinked FROM assignments
                 WHERE course_section_id = ? AND template_ref = ?",
                params![derived_section_id, t.id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?;
        match derived {
            None => missing.push(json!({
                "kind": "assignment",
                "templateId": t.id,
                "title": t.title,
            })),
            Some((_, _, _, unlinked)) if unlinked != 0 => {}
            Some((derived_id, title, max_grade, _)) => {
                if title != t.title || max_grade != t.max_grade {
                    outdated.push(json!({
                        "kind": "assignment",
                        "templateId": t.id,
                        "derivedId": derived_id,
                        "title": t.title,
                    }));
                }
            }
        }
    }
    Ok(())
}

fn status_for_tests(
    conn: &Connection,
    template_section_id: &str,
    derived_section_id: &str,
    missing: &mut Vec<JsonValue>,
    outdated: &mut Vec<JsonValue>,
) -> anyhow::Result<()> {
    for t in load_template_tests(conn, template_section_id)? {
        let derived: Option<(String, String, i64)> = conn
            .query_row(
                "SELECT id, title, is_unlinked FROM tests
                 WHERE course_section_id = ? AND template_ref = ?",
                params![derived_section_id, t.id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()?;
        match derived {
            None => missing.push(json!({
                "kind": "test",
                "templateId": t.id,
                "title": t.title,
            })),
            Some((_, _, unlinked)) if unlinked != 0 => {}
            Some((derived_id, title, _)) => {
                let template_keys: HashSet<(i64, String)> = load_questions(conn, &t.id)?
                    .into_iter()
                    .map(|q| (q.position, q.qtype))
                    .collect();
                let derived_keys: HashSet<(i64, String)> = load_questions(conn, &derived_id)?
                    .into_iter()
                    .map(|q| (q.position, q.qtype))
                    .collect();
                if title != t.title || template_keys != derived_keys {
                    outdated.push(json!({
                        "kind": "test",
                        "templateId": t.id,
                        "derivedId": derived_id,
                        "title": t.title,
                    }));
                }
            }
        }
    }
    Ok(())
}
