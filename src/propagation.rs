//! Propagation trigger: explicit events published by the write paths
//! after their transaction commits, consumed here to decide when and
//! where the sync planner runs. One failed target never aborts the
//! fan-out for the rest.

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value as JsonValue};
use tracing::error;
use uuid::Uuid;

use crate::calendar;
use crate::enrollment;
use crate::sync::{self, SyncOutcome, SyncReport};

#[derive(Debug, Clone)]
pub enum TemplateEvent<'a> {
    CourseCreated {
        course_id: &'a str,
        reference_date: NaiveDate,
    },
    ResourceCreated {
        resource_id: &'a str,
    },
    AssignmentCreated {
        assignment_id: &'a str,
    },
}

#[derive(Debug, Default)]
pub struct FanOutSummary {
    pub report: SyncReport,
    pub synced_groups: i64,
    pub skipped_groups: i64,
    pub failed_groups: Vec<String>,
    pub deleted_files: Vec<String>,
    pub bootstrapped_sections: i64,
}

impl FanOutSummary {
    pub fn to_json(&self) -> JsonValue {
        json!({
            "report": self.report.to_json(),
            "syncedGroups": self.synced_groups,
            "skippedGroups": self.skipped_groups,
            "failedGroups": self.failed_groups,
            "bootstrappedSections": self.bootstrapped_sections,
        })
    }
}

pub fn on_template_committed(
    conn: &Connection,
    event: TemplateEvent<'_>,
) -> anyhow::Result<FanOutSummary> {
    match event {
        TemplateEvent::CourseCreated {
            course_id,
            reference_date,
        } => bootstrap_template_sections(conn, course_id, reference_date),
        TemplateEvent::ResourceCreated { resource_id } => {
            fan_out(conn, resource_id, FanOutKind::Resource)
        }
        TemplateEvent::AssignmentCreated { assignment_id } => {
            fan_out(conn, assignment_id, FanOutKind::Assignment)
        }
    }
}

/// Seed a course's template skeleton: a dateless "General information"
/// section plus one offset-based section per week of the academic year
/// containing the reference date. Runs once; a course that already has
/// template sections is left untouched.
fn bootstrap_template_sections(
    conn: &Connection,
    course_id: &str,
    reference_date: NaiveDate,
) -> anyhow::Result<FanOutSummary> {
    let mut summary = FanOutSummary::default();

    let existing: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM course_sections WHERE course_id = ? LIMIT 1",
            [course_id],
            |r| r.get(0),
        )
        .optional()?;
    if existing.is_some() {
        return Ok(summary);
    }

    conn.execute(
        "INSERT INTO course_sections(id, course_id, title, position, is_unlinked)
         VALUES(?, ?, ?, 0, 0)",
        params![Uuid::new_v4().to_string(), course_id, "General information"],
    )?;
    summary.bootstrapped_sections += 1;

    let (start, end) = calendar::academic_year_bounds(reference_date);
    for (i, (week_start, week_end)) in calendar::week_ranges(start, end).iter().enumerate() {
        let duration = (*week_end - *week_start).num_days();
        conn.execute(
            "INSERT INTO course_sections(
                id, course_id, title, position, template_week_index,
                template_duration_days, is_unlinked
             ) VALUES(?, ?, ?, ?, ?, ?, 0)",
            params![
                Uuid::new_v4().to_string(),
                course_id,
                format!("Week {}", i + 1),
                2 + i as i64,
                i as i64,
                duration
            ],
        )?;
        summary.bootstrapped_sections += 1;
    }

    Ok(summary)
}

enum FanOutKind {
    Resource,
    Assignment,
}

/// Push a freshly created root-template resource/assignment to every
/// subject group of its course. Groups without a derived counterpart of
/// the template section are skipped; per-group failures are logged and
/// recorded, the remaining targets still run.
fn fan_out(
    conn: &Connection,
    unit_id: &str,
    kind: FanOutKind,
) -> anyhow::Result<FanOutSummary> {
    let mut summary = FanOutSummary::default();

    let table = match kind {
        FanOutKind::Resource => "resources",
        FanOutKind::Assignment => "assignments",
    };
    let sql = format!(
        "SELECT s.course_id, u.template_ref
         FROM {} u JOIN course_sections s ON s.id = u.course_section_id
         WHERE u.id = ?",
        table
    );
    let row: Option<(Option<String>, Option<String>)> = conn
        .query_row(&sql, [unit_id], |r| Ok((r.get(0)?, r.get(1)?)))
        .optional()?;

    // Only root templates propagate: course-scoped and not itself a clone.
    let course_id = match row {
        Some((Some(course_id), None)) => course_id,
        _ => return Ok(summary),
    };

    for group_id in enrollment::subject_groups_of(conn, &course_id)? {
        let run = || -> anyhow::Result<Option<SyncOutcome>> {
            let tx = conn.unchecked_transaction()?;
            let outcome = match kind {
                FanOutKind::Resource => sync::sync_resource_scoped(&tx, unit_id, &group_id)?,
                FanOutKind::Assignment => sync::sync_assignment_scoped(&tx, unit_id, &group_id)?,
            };
            tx.commit()?;
            Ok(outcome)
        };
        match run() {
            Ok(Some(outcome)) => {
                summary.report.merge(&outcome.report);
                summary.deleted_files.extend(outcome.deleted_files);
                summary.synced_groups += 1;
            }
            Ok(None) => summary.skipped_groups += 1,
            Err(e) => {
                error!(subject_group = %group_id, error = %e, "propagation failed for group");
                summary.failed_groups.push(group_id);
            }
        }
    }

    Ok(summary)
}
