use rusqlite::Connection;

/// Enrollment lookups used to compute propagation fan-out. The membership
/// tables themselves are managed elsewhere; the sync core only reads them.
pub fn subject_groups_of(conn: &Connection, course_id: &str) -> anyhow::Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT id FROM subject_groups WHERE course_id = ? ORDER BY id")?;
    let ids = stmt
        .query_map([course_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

pub fn students_of(conn: &Connection, subject_group_id: &str) -> anyhow::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT cs.student_id
         FROM classroom_students cs
         JOIN subject_groups sg ON sg.classroom_id = cs.classroom_id
         WHERE sg.id = ?
         ORDER BY cs.student_id",
    )?;
    let ids = stmt
        .query_map([subject_group_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}
