use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("coursebook.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            course_code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            description TEXT,
            grade INTEGER NOT NULL,
            CHECK(grade >= 0 AND grade <= 12)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classrooms(
            id TEXT PRIMARY KEY,
            grade INTEGER NOT NULL,
            letter TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            role TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classroom_students(
            classroom_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(classroom_id, student_id),
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id),
            FOREIGN KEY(student_id) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_groups(
            id TEXT PRIMARY KEY,
            course_id TEXT,
            classroom_id TEXT NOT NULL,
            teacher_id TEXT,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id),
            FOREIGN KEY(teacher_id) REFERENCES users(id),
            UNIQUE(course_id, classroom_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_groups_course ON subject_groups(course_id)",
        [],
    )?;

    // A section is either a template (course-scoped) or derived
    // (subject-group-scoped), never both. template_ref is a weak
    // back-reference, kept even after the template row is gone.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_sections(
            id TEXT PRIMARY KEY,
            course_id TEXT,
            subject_group_id TEXT,
            template_ref TEXT,
            title TEXT NOT NULL,
            description TEXT,
            start_date TEXT,
            end_date TEXT,
            position INTEGER NOT NULL DEFAULT 0,
            template_week_index INTEGER,
            template_duration_days INTEGER,
            is_unlinked INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(subject_group_id) REFERENCES subject_groups(id),
            CHECK((course_id IS NULL) != (subject_group_id IS NULL))
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sections_course ON course_sections(course_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sections_subject_group ON course_sections(subject_group_id)",
        [],
    )?;
    // Safety net against racing sync calls: at most one derived row per
    // (subject group, template) pair.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS uq_sections_sg_template
         ON course_sections(subject_group_id, template_ref)
         WHERE subject_group_id IS NOT NULL AND template_ref IS NOT NULL",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS resources(
            id TEXT PRIMARY KEY,
            course_section_id TEXT NOT NULL,
            parent_resource_id TEXT,
            template_ref TEXT,
            type TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            url TEXT,
            file_ref TEXT,
            position INTEGER NOT NULL DEFAULT 0,
            is_unlinked INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(course_section_id) REFERENCES course_sections(id),
            FOREIGN KEY(parent_resource_id) REFERENCES resources(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_resources_section ON resources(course_section_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_resources_parent ON resources(parent_resource_id)",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS uq_resources_section_template
         ON resources(course_section_id, template_ref)
         WHERE template_ref IS NOT NULL",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignments(
            id TEXT PRIMARY KEY,
            course_section_id TEXT NOT NULL,
            teacher_id TEXT,
            template_ref TEXT,
            title TEXT NOT NULL,
            description TEXT,
            due_at TEXT,
            max_grade INTEGER NOT NULL DEFAULT 100,
            template_start_offset_days INTEGER,
            template_due_time TEXT,
            is_unlinked INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(course_section_id) REFERENCES course_sections(id),
            FOREIGN KEY(teacher_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_section ON assignments(course_section_id)",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS uq_assignments_section_template
         ON assignments(course_section_id, template_ref)
         WHERE template_ref IS NOT NULL",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignment_attachments(
            id TEXT PRIMARY KEY,
            assignment_id TEXT NOT NULL,
            type TEXT NOT NULL,
            title TEXT NOT NULL,
            content TEXT,
            file_url TEXT,
            position INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(assignment_id) REFERENCES assignments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignment_attachments_assignment
         ON assignment_attachments(assignment_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS tests(
            id TEXT PRIMARY KEY,
            course_section_id TEXT NOT NULL,
            teacher_id TEXT,
            template_ref TEXT,
            title TEXT NOT NULL,
            description TEXT,
            is_published INTEGER NOT NULL DEFAULT 0,
            scheduled_at TEXT,
            reveal_results_at TEXT,
            allow_multiple_attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER,
            time_limit_minutes INTEGER,
            show_correct_answers INTEGER NOT NULL DEFAULT 0,
            is_unlinked INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(course_section_id) REFERENCES course_sections(id),
            FOREIGN KEY(teacher_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_tests_section ON tests(course_section_id)",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS uq_tests_section_template
         ON tests(course_section_id, template_ref)
         WHERE template_ref IS NOT NULL",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS questions(
            id TEXT PRIMARY KEY,
            test_id TEXT NOT NULL,
            type TEXT NOT NULL,
            text TEXT NOT NULL,
            points REAL NOT NULL DEFAULT 1,
            position INTEGER NOT NULL DEFAULT 0,
            sample_answer TEXT,
            key_words TEXT,
            correct_answer_text TEXT,
            matching_pairs_json TEXT,
            FOREIGN KEY(test_id) REFERENCES tests(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_questions_test ON questions(test_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS options(
            id TEXT PRIMARY KEY,
            question_id TEXT NOT NULL,
            text TEXT,
            image_url TEXT,
            is_correct INTEGER NOT NULL DEFAULT 0,
            position INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(question_id) REFERENCES questions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_options_question ON options(question_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attempts(
            id TEXT PRIMARY KEY,
            test_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            attempt_number INTEGER NOT NULL,
            started_at TEXT NOT NULL,
            submitted_at TEXT,
            graded_at TEXT,
            score REAL,
            max_score REAL,
            percentage REAL,
            is_completed INTEGER NOT NULL DEFAULT 0,
            is_graded INTEGER NOT NULL DEFAULT 0,
            results_viewed_at TEXT,
            FOREIGN KEY(test_id) REFERENCES tests(id),
            FOREIGN KEY(student_id) REFERENCES users(id),
            UNIQUE(test_id, student_id, attempt_number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attempts_test ON attempts(test_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attempts_student ON attempts(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS answers(
            id TEXT PRIMARY KEY,
            attempt_id TEXT NOT NULL,
            question_id TEXT NOT NULL,
            text_answer TEXT,
            matching_answers_json TEXT,
            score REAL,
            max_score REAL,
            is_correct INTEGER,
            teacher_feedback TEXT,
            FOREIGN KEY(attempt_id) REFERENCES attempts(id),
            FOREIGN KEY(question_id) REFERENCES questions(id),
            UNIQUE(attempt_id, question_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_answers_attempt ON answers(attempt_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_answers_question ON answers(question_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS answer_selected_options(
            answer_id TEXT NOT NULL,
            option_id TEXT NOT NULL,
            PRIMARY KEY(answer_id, option_id),
            FOREIGN KEY(answer_id) REFERENCES answers(id),
            FOREIGN KEY(option_id) REFERENCES options(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_answer_selected_options_option
         ON answer_selected_options(option_id)",
        [],
    )?;

    ensure_tests_time_limit(&conn)?;

    Ok(conn)
}

fn ensure_tests_time_limit(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "tests", "time_limit_minutes")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE tests ADD COLUMN time_limit_minutes INTEGER", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
