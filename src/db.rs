use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use uuid::Uuid;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("school.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS academic_years(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            start_date TEXT,
            end_date TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS terms(
            id TEXT PRIMARY KEY,
            year_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            FOREIGN KEY(year_id) REFERENCES academic_years(id),
            UNIQUE(year_id, idx)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_terms_year ON terms(year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS levels(
            code TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS streams(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            is_active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classrooms(
            id TEXT PRIMARY KEY,
            year_id TEXT NOT NULL,
            level_code TEXT NOT NULL,
            stream_id TEXT,
            name TEXT NOT NULL,
            FOREIGN KEY(year_id) REFERENCES academic_years(id),
            FOREIGN KEY(level_code) REFERENCES levels(code),
            FOREIGN KEY(stream_id) REFERENCES streams(id),
            UNIQUE(year_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classrooms_year ON classrooms(year_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            short_name TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_subjects(
            id TEXT PRIMARY KEY,
            classroom_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            coefficient REAL NOT NULL DEFAULT 1,
            is_core INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(classroom_id, subject_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_subjects_classroom ON class_subjects(classroom_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            matricule TEXT NOT NULL UNIQUE,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            sex TEXT NOT NULL,
            dob TEXT,
            house TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            classroom_id TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            date_enrolled TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(classroom_id) REFERENCES classrooms(id),
            UNIQUE(student_id, classroom_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_classroom ON enrollments(classroom_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollment_subjects(
            id TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL,
            class_subject_id TEXT NOT NULL,
            coef_override REAL,
            selected INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id),
            FOREIGN KEY(class_subject_id) REFERENCES class_subjects(id),
            UNIQUE(enrollment_id, class_subject_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollment_subjects_enrollment
         ON enrollment_subjects(enrollment_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollment_subjects_class_subject
         ON enrollment_subjects(class_subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_types(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT,
            weight REAL NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessments(
            id TEXT PRIMARY KEY,
            term_id TEXT NOT NULL,
            class_subject_id TEXT NOT NULL,
            atype_id TEXT NOT NULL,
            FOREIGN KEY(term_id) REFERENCES terms(id),
            FOREIGN KEY(class_subject_id) REFERENCES class_subjects(id),
            FOREIGN KEY(atype_id) REFERENCES assessment_types(id),
            UNIQUE(term_id, class_subject_id, atype_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessments_term ON assessments(term_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessments_class_subject
         ON assessments(class_subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS scores(
            id TEXT PRIMARY KEY,
            enrollment_subject_id TEXT NOT NULL,
            assessment_id TEXT NOT NULL,
            value REAL NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(enrollment_subject_id) REFERENCES enrollment_subjects(id),
            FOREIGN KEY(assessment_id) REFERENCES assessments(id),
            UNIQUE(enrollment_subject_id, assessment_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scores_assessment ON scores(assessment_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scores_enrollment_subject
         ON scores(enrollment_subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_scales(
            id TEXT PRIMARY KEY,
            year_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(year_id) REFERENCES academic_years(id),
            UNIQUE(year_id, name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_bands(
            id TEXT PRIMARY KEY,
            scale_id TEXT NOT NULL,
            letter TEXT NOT NULL,
            min_mark INTEGER NOT NULL,
            max_mark INTEGER NOT NULL,
            gpa REAL NOT NULL DEFAULT 0,
            FOREIGN KEY(scale_id) REFERENCES grade_scales(id),
            UNIQUE(scale_id, letter)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_bands_scale ON grade_bands(scale_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS report_tokens(
            uid TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL,
            term_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            valid INTEGER NOT NULL DEFAULT 1,
            payload TEXT NOT NULL,
            payload_sha256 TEXT NOT NULL,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id),
            FOREIGN KEY(term_id) REFERENCES terms(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_report_tokens_enrollment
         ON report_tokens(enrollment_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS annual_report_tokens(
            uid TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL,
            year_label TEXT NOT NULL,
            created_at TEXT NOT NULL,
            valid INTEGER NOT NULL DEFAULT 1,
            payload TEXT NOT NULL,
            payload_sha256 TEXT NOT NULL,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_annual_report_tokens_enrollment
         ON annual_report_tokens(enrollment_id)",
        [],
    )?;

    seed_levels_streams(&conn)?;
    seed_assessment_types(&conn)?;

    Ok(conn)
}

fn seed_levels_streams(conn: &Connection) -> anyhow::Result<()> {
    let levels = [
        ("F1", "Form 1"),
        ("F2", "Form 2"),
        ("F3", "Form 3"),
        ("F4", "Form 4"),
        ("F5", "Form 5"),
        ("L6", "Lower Sixth"),
        ("U6", "Upper Sixth"),
    ];
    for (code, name) in levels {
        conn.execute(
            "INSERT OR IGNORE INTO levels(code, name) VALUES (?, ?)",
            (code, name),
        )?;
    }
    for name in ["Science", "Arts"] {
        conn.execute(
            "INSERT OR IGNORE INTO streams(id, name, is_active) VALUES (?, ?, 1)",
            (Uuid::new_v4().to_string(), name),
        )?;
    }
    Ok(())
}

fn seed_assessment_types(conn: &Connection) -> anyhow::Result<()> {
    let types = [
        ("CA1", "Continuous Assessment 1", 50.0),
        ("CA2", "Continuous Assessment 2", 50.0),
    ];
    for (code, name, weight) in types {
        conn.execute(
            "INSERT OR IGNORE INTO assessment_types(id, code, name, weight, is_active)
             VALUES (?, ?, ?, ?, 1)",
            (Uuid::new_v4().to_string(), code, name, weight),
        )?;
    }
    Ok(())
}

/// Default A-F scale created alongside each academic year.
pub fn seed_default_grade_scale(conn: &Connection, year_id: &str) -> anyhow::Result<String> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM grade_scales WHERE year_id = ? AND name = 'Default A-F'",
            [year_id],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }

    let scale_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grade_scales(id, year_id, name) VALUES (?, ?, 'Default A-F')",
        (&scale_id, year_id),
    )?;
    let bands = [
        ("A", 80, 100, 4.0),
        ("B", 70, 79, 3.0),
        ("C", 60, 69, 2.0),
        ("D", 50, 59, 1.0),
        ("E", 40, 49, 0.5),
        ("F", 0, 39, 0.0),
    ];
    for (letter, lo, hi, gpa) in bands {
        conn.execute(
            "INSERT INTO grade_bands(id, scale_id, letter, min_mark, max_mark, gpa)
             VALUES (?, ?, ?, ?, ?, ?)",
            (Uuid::new_v4().to_string(), &scale_id, letter, lo, hi, gpa),
        )?;
    }
    Ok(scale_id)
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}
