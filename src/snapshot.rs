//! Read-side loaders. Each function assembles a complete in-memory row set
//! from the workspace database; the calculators in `calc` never touch SQL.

use crate::calc::{
    AssessmentSlot, CalcError, ClassTermSnapshot, EnrollmentSubjectRow, GradeBand, GradingPolicy,
    StudentRow, SubjectRow,
};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ClassroomCtx {
    pub classroom_id: String,
    pub name: String,
    pub level_code: String,
    pub year_id: String,
    pub year_name: String,
    pub policy: GradingPolicy,
}

#[derive(Debug, Clone)]
pub struct TermCtx {
    pub term_id: String,
    pub index: i64,
}

#[derive(Debug, Clone)]
pub struct EnrollmentCtx {
    pub student_id: String,
    pub matricule: String,
    pub display_name: String,
    pub sex: String,
    pub classroom: ClassroomCtx,
}

fn query_failed(e: rusqlite::Error) -> CalcError {
    CalcError::new("db_query_failed", e.to_string())
}

pub fn load_classroom_ctx(conn: &Connection, classroom_id: &str) -> Result<ClassroomCtx, CalcError> {
    let row: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT c.name, c.level_code, c.year_id, y.name
             FROM classrooms c
             JOIN academic_years y ON y.id = c.year_id
             WHERE c.id = ?",
            [classroom_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(query_failed)?;
    let Some((name, level_code, year_id, year_name)) = row else {
        return Err(CalcError::new("not_found", "classroom not found"));
    };
    let policy = GradingPolicy::for_level_code(&level_code);
    Ok(ClassroomCtx {
        classroom_id: classroom_id.to_string(),
        name,
        level_code,
        year_id,
        year_name,
        policy,
    })
}

pub fn load_term_ctx(conn: &Connection, term_id: &str) -> Result<TermCtx, CalcError> {
    let index: Option<i64> = conn
        .query_row("SELECT idx FROM terms WHERE id = ?", [term_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(query_failed)?;
    let Some(index) = index else {
        return Err(CalcError::new("not_found", "term not found"));
    };
    Ok(TermCtx {
        term_id: term_id.to_string(),
        index,
    })
}

pub fn load_year_terms(conn: &Connection, year_id: &str) -> Result<Vec<TermCtx>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, idx
             FROM terms
             WHERE year_id = ?
             ORDER BY idx",
        )
        .map_err(query_failed)?;
    stmt.query_map([year_id], |r| {
        Ok(TermCtx {
            term_id: r.get(0)?,
            index: r.get(1)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(query_failed)
}

pub fn load_enrollment_ctx(conn: &Connection, enrollment_id: &str) -> Result<EnrollmentCtx, CalcError> {
    let row: Option<(String, String, String, String, String, String)> = conn
        .query_row(
            "SELECT e.classroom_id, st.id, st.matricule, st.last_name, st.first_name, st.sex
             FROM enrollments e
             JOIN students st ON st.id = e.student_id
             WHERE e.id = ?",
            [enrollment_id],
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
        .map_err(query_failed)?;
    let Some((classroom_id, student_id, matricule, last_name, first_name, sex)) = row else {
        return Err(CalcError::new("not_found", "enrollment not found"));
    };
    let classroom = load_classroom_ctx(conn, &classroom_id)?;
    Ok(EnrollmentCtx {
        student_id,
        matricule,
        display_name: format!("{} {}", last_name, first_name),
        sex,
        classroom,
    })
}

/// Class subjects (ordered by subject name) with the term's configured
/// assessment slots attached.
pub fn load_subject_rows(
    conn: &Connection,
    classroom_id: &str,
    term_id: &str,
) -> Result<Vec<SubjectRow>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT cs.id, s.code, s.name, cs.coefficient
             FROM class_subjects cs
             JOIN subjects s ON s.id = cs.subject_id
             WHERE cs.classroom_id = ?
             ORDER BY s.name",
        )
        .map_err(query_failed)?;
    let mut subjects: Vec<SubjectRow> = stmt
        .query_map([classroom_id], |r| {
            Ok(SubjectRow {
                class_subject_id: r.get(0)?,
                subject_code: r.get(1)?,
                subject_name: r.get(2)?,
                coefficient: r.get(3)?,
                slots: Vec::new(),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    if subjects.is_empty() {
        return Ok(subjects);
    }

    let mut slot_stmt = conn
        .prepare(
            "SELECT a.class_subject_id, a.id, at.code, at.weight
             FROM assessments a
             JOIN assessment_types at ON at.id = a.atype_id
             JOIN class_subjects cs ON cs.id = a.class_subject_id
             WHERE a.term_id = ? AND cs.classroom_id = ?
             ORDER BY at.code",
        )
        .map_err(query_failed)?;
    let slot_rows: Vec<(String, String, String, f64)> = slot_stmt
        .query_map((term_id, classroom_id), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_failed)?;

    let mut slots_by_cs: HashMap<String, Vec<AssessmentSlot>> = HashMap::new();
    for (cs_id, assessment_id, type_code, weight) in slot_rows {
        slots_by_cs.entry(cs_id).or_default().push(AssessmentSlot {
            assessment_id,
            type_code,
            weight,
        });
    }
    for subject in &mut subjects {
        if let Some(slots) = slots_by_cs.remove(&subject.class_subject_id) {
            subject.slots = slots;
        }
    }
    Ok(subjects)
}

fn load_students(
    conn: &Connection,
    classroom_id: &str,
) -> Result<Vec<StudentRow>, CalcError> {
    let mut stmt = conn
        .prepare(
            "SELECT e.id, st.id, st.matricule, st.last_name, st.first_name
             FROM enrollments e
             JOIN students st ON st.id = e.student_id
             WHERE e.classroom_id = ? AND e.active = 1
             ORDER BY st.last_name, st.first_name",
        )
        .map_err(query_failed)?;
    stmt.query_map([classroom_id], |r| {
        let last: String = r.get(3)?;
        let first: String = r.get(4)?;
        Ok(StudentRow {
            enrollment_id: r.get(0)?,
            student_id: r.get(1)?,
            matricule: r.get(2)?,
            display_name: format!("{} {}", last, first),
            subjects: Vec::new(),
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(query_failed)
}

/// Complete snapshot for one classroom/term: active enrollments, selected
/// subjects with coefficient overrides, and every score recorded against the
/// term's assessments.
pub fn load_class_term_snapshot(
    conn: &Connection,
    classroom_id: &str,
    term_id: &str,
) -> Result<(ClassroomCtx, TermCtx, ClassTermSnapshot), CalcError> {
    let ctx = load_classroom_ctx(conn, classroom_id)?;
    let term = load_term_ctx(conn, term_id)?;
    let subjects = load_subject_rows(conn, classroom_id, term_id)?;
    let mut students = load_students(conn, classroom_id)?;

    if !students.is_empty() {
        let enrollment_ids: Vec<String> = students.iter().map(|s| s.enrollment_id.clone()).collect();
        let placeholders = std::iter::repeat("?")
            .take(enrollment_ids.len())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT es.id, es.enrollment_id, es.class_subject_id, es.coef_override
             FROM enrollment_subjects es
             WHERE es.selected = 1 AND es.enrollment_id IN ({})",
            placeholders
        );
        let bind: Vec<Value> = enrollment_ids
            .iter()
            .map(|id| Value::Text(id.clone()))
            .collect();
        let mut stmt = conn.prepare(&sql).map_err(query_failed)?;
        let es_rows: Vec<(String, String, String, Option<f64>)> = stmt
            .query_map(params_from_iter(bind), |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(query_failed)?;

        let assessment_ids: Vec<String> = subjects
            .iter()
            .flat_map(|s| s.slots.iter().map(|slot| slot.assessment_id.clone()))
            .collect();
        let mut scores_by_es: HashMap<String, HashMap<String, f64>> = HashMap::new();
        if !assessment_ids.is_empty() && !es_rows.is_empty() {
            let es_ids: Vec<String> = es_rows.iter().map(|(id, _, _, _)| id.clone()).collect();
            let assess_placeholders = std::iter::repeat("?")
                .take(assessment_ids.len())
                .collect::<Vec<_>>()
                .join(",");
            let es_placeholders = std::iter::repeat("?")
                .take(es_ids.len())
                .collect::<Vec<_>>()
                .join(",");
            let sql = format!(
                "SELECT enrollment_subject_id, assessment_id, value
                 FROM scores
                 WHERE assessment_id IN ({}) AND enrollment_subject_id IN ({})",
                assess_placeholders, es_placeholders
            );
            let mut bind: Vec<Value> = Vec::with_capacity(assessment_ids.len() + es_ids.len());
            for id in &assessment_ids {
                bind.push(Value::Text(id.clone()));
            }
            for id in &es_ids {
                bind.push(Value::Text(id.clone()));
            }
            let mut stmt = conn.prepare(&sql).map_err(query_failed)?;
            let rows = stmt
                .query_map(params_from_iter(bind), |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, f64>(2)?,
                    ))
                })
                .map_err(query_failed)?;
            for row in rows {
                let (es_id, assessment_id, value) = row.map_err(query_failed)?;
                scores_by_es
                    .entry(es_id)
                    .or_default()
                    .insert(assessment_id, value);
            }
        }

        let mut es_by_enrollment: HashMap<String, Vec<EnrollmentSubjectRow>> = HashMap::new();
        for (es_id, enrollment_id, class_subject_id, coef_override) in es_rows {
            let scores = scores_by_es.remove(&es_id).unwrap_or_default();
            es_by_enrollment
                .entry(enrollment_id)
                .or_default()
                .push(EnrollmentSubjectRow {
                    class_subject_id,
                    coef_override,
                    scores,
                });
        }
        for student in &mut students {
            if let Some(subjects) = es_by_enrollment.remove(&student.enrollment_id) {
                student.subjects = subjects;
            }
        }
    }

    Ok((
        ctx.clone(),
        term,
        ClassTermSnapshot {
            policy: ctx.policy,
            subjects,
            students,
        },
    ))
}

/// One snapshot per term of the classroom's year, in term order. Input for
/// annual aggregation.
pub fn load_year_class_snapshots(
    conn: &Connection,
    classroom_id: &str,
) -> Result<(ClassroomCtx, Vec<(TermCtx, ClassTermSnapshot)>), CalcError> {
    let ctx = load_classroom_ctx(conn, classroom_id)?;
    let terms = load_year_terms(conn, &ctx.year_id)?;
    let mut snapshots = Vec::with_capacity(terms.len());
    for term in terms {
        let (_, term_ctx, snapshot) = load_class_term_snapshot(conn, classroom_id, &term.term_id)?;
        snapshots.push((term_ctx, snapshot));
    }
    Ok((ctx, snapshots))
}

/// Bands of the year's first grade scale, ascending by min_mark. An empty
/// result means no letter gets resolved, never an error.
pub fn load_grade_bands(conn: &Connection, year_id: &str) -> Result<Vec<GradeBand>, CalcError> {
    let scale_id: Option<String> = conn
        .query_row(
            "SELECT id FROM grade_scales WHERE year_id = ? ORDER BY name LIMIT 1",
            [year_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(query_failed)?;
    let Some(scale_id) = scale_id else {
        return Ok(Vec::new());
    };

    let mut stmt = conn
        .prepare(
            "SELECT letter, min_mark, max_mark, gpa
             FROM grade_bands
             WHERE scale_id = ?
             ORDER BY min_mark",
        )
        .map_err(query_failed)?;
    stmt.query_map([scale_id], |r| {
        Ok(GradeBand {
            letter: r.get(0)?,
            min_mark: r.get(1)?,
            max_mark: r.get(2)?,
            gpa: r.get(3)?,
        })
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(query_failed)
}
