use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn assessment_class_subject(
    conn: &Connection,
    assessment_id: &str,
) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT class_subject_id FROM assessments WHERE id = ?",
        [assessment_id],
        |r| r.get(0),
    )
    .optional()
}

fn enrollment_subject_class_subject(
    conn: &Connection,
    enrollment_subject_id: &str,
) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT class_subject_id FROM enrollment_subjects WHERE id = ?",
        [enrollment_subject_id],
        |r| r.get(0),
    )
    .optional()
}

enum UpsertOutcome {
    Created(String),
    Updated(String),
}

fn upsert_score(
    conn: &Connection,
    enrollment_subject_id: &str,
    assessment_id: &str,
    value: f64,
) -> Result<UpsertOutcome, rusqlite::Error> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM scores WHERE enrollment_subject_id = ? AND assessment_id = ?",
            (enrollment_subject_id, assessment_id),
            |r| r.get(0),
        )
        .optional()?;
    let now = chrono::Utc::now().to_rfc3339();
    match existing {
        Some(score_id) => {
            conn.execute(
                "UPDATE scores SET value = ?, updated_at = ? WHERE id = ?",
                (value, &now, &score_id),
            )?;
            Ok(UpsertOutcome::Updated(score_id))
        }
        None => {
            let score_id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO scores(id, enrollment_subject_id, assessment_id, value, updated_at)
                 VALUES (?, ?, ?, ?, ?)",
                (&score_id, enrollment_subject_id, assessment_id, value, &now),
            )?;
            Ok(UpsertOutcome::Created(score_id))
        }
    }
}

fn handle_score_enter(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let enrollment_subject_id = match required_str(req, "enrollmentSubjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(value) = req.params.get("value").and_then(|v| v.as_f64()) else {
        return err(&req.id, "bad_params", "missing value", None);
    };
    if !(0.0..=100.0).contains(&value) {
        return err(&req.id, "bad_params", "value must be in range 0..=100", None);
    }

    let assessment_cs = match assessment_class_subject(conn, &assessment_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "assessment not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let es_cs = match enrollment_subject_class_subject(conn, &enrollment_subject_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "enrollment subject not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if assessment_cs != es_cs {
        return err(
            &req.id,
            "bad_params",
            "enrollment subject does not belong to the assessment's class subject",
            None,
        );
    }

    match upsert_score(conn, &enrollment_subject_id, &assessment_id, value) {
        Ok(UpsertOutcome::Created(id)) => {
            ok(&req.id, json!({ "scoreId": id, "created": true }))
        }
        Ok(UpsertOutcome::Updated(id)) => {
            ok(&req.id, json!({ "scoreId": id, "created": false }))
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Upsert a batch of scores against one assessment. Mismatched or unknown
/// enrollment subjects are skipped with a reason rather than failing the
/// whole batch.
fn handle_scores_bulk_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(entries) = req.params.get("entries").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing entries", None);
    };
    if entries.is_empty() {
        return err(&req.id, "bad_params", "entries must not be empty", None);
    }

    let assessment_cs = match assessment_class_subject(conn, &assessment_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "assessment not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Validate the whole batch before writing anything.
    let mut parsed: Vec<(String, f64)> = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(es_id) = entry.get("enrollmentSubjectId").and_then(|v| v.as_str()) else {
            return err(
                &req.id,
                "bad_params",
                "each entry must have enrollmentSubjectId and value",
                None,
            );
        };
        let Some(value) = entry.get("value").and_then(|v| v.as_f64()) else {
            return err(
                &req.id,
                "bad_params",
                "each entry must have enrollmentSubjectId and value",
                None,
            );
        };
        if !(0.0..=100.0).contains(&value) {
            return err(&req.id, "bad_params", "value must be in range 0..=100", None);
        }
        parsed.push((es_id.to_string(), value));
    }

    let mut created: Vec<String> = Vec::new();
    let mut updated: Vec<String> = Vec::new();
    let mut skipped: Vec<serde_json::Value> = Vec::new();
    for (es_id, value) in parsed {
        let es_cs = match enrollment_subject_class_subject(conn, &es_id) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        match es_cs {
            None => skipped.push(json!({
                "enrollmentSubjectId": es_id,
                "reason": "enrollment subject not found",
            })),
            Some(cs) if cs != assessment_cs => skipped.push(json!({
                "enrollmentSubjectId": es_id,
                "reason": "subject mismatch",
            })),
            Some(_) => match upsert_score(conn, &es_id, &assessment_id, value) {
                Ok(UpsertOutcome::Created(id)) => created.push(id),
                Ok(UpsertOutcome::Updated(id)) => updated.push(id),
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            },
        }
    }

    ok(
        &req.id,
        json!({ "created": created, "updated": updated, "skipped": skipped }),
    )
}

fn handle_scores_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT sc.id, sc.enrollment_subject_id, sc.value,
                st.id, st.matricule, st.last_name, st.first_name
         FROM scores sc
         JOIN enrollment_subjects es ON es.id = sc.enrollment_subject_id
         JOIN enrollments e ON e.id = es.enrollment_id
         JOIN students st ON st.id = e.student_id
         WHERE sc.assessment_id = ?
         ORDER BY st.last_name, st.first_name",
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows: Result<Vec<serde_json::Value>, _> = stmt
        .query_map([&assessment_id], |r| {
            let last: String = r.get(5)?;
            let first: String = r.get(6)?;
            Ok(json!({
                "scoreId": r.get::<_, String>(0)?,
                "enrollmentSubjectId": r.get::<_, String>(1)?,
                "value": r.get::<_, f64>(2)?,
                "student": {
                    "id": r.get::<_, String>(3)?,
                    "matricule": r.get::<_, String>(4)?,
                    "name": format!("{} {}", last, first),
                },
            }))
        })
        .and_then(|it| it.collect());
    match rows {
        Ok(scores) => ok(&req.id, json!({ "scores": scores })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scores.enter" => Some(handle_score_enter(state, req)),
        "scores.bulkUpsert" => Some(handle_scores_bulk_upsert(state, req)),
        "scores.list" => Some(handle_scores_list(state, req)),
        _ => None,
    }
}
