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

fn handle_student_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let matricule = match required_str(req, "matricule") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let sex = match required_str(req, "sex") {
        Ok(v) => v.trim().to_ascii_uppercase(),
        Err(e) => return e,
    };
    if sex != "M" && sex != "F" {
        return err(&req.id, "bad_params", "sex must be 'M' or 'F'", None);
    }

    let student_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO students(id, matricule, last_name, first_name, sex, dob, house)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &matricule,
            &last_name,
            &first_name,
            &sex,
            req.params.get("dob").and_then(|v| v.as_str()),
            req.params.get("house").and_then(|v| v.as_str()),
        ),
    ) {
        Ok(_) => ok(&req.id, json!({ "studentId": student_id })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Enroll a student into a classroom. By default every class subject is
/// selected into the student's basket; upper-form students then deselect
/// through enrollments.subject.update.
fn handle_enrollment_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let classroom_id = match required_str(req, "classroomId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let select_all = req
        .params
        .get("selectAll")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let enrollment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO enrollments(id, student_id, classroom_id, active, date_enrolled)
         VALUES (?, ?, ?, 1, ?)",
        (
            &enrollment_id,
            &student_id,
            &classroom_id,
            chrono::Utc::now().format("%Y-%m-%d").to_string(),
        ),
    ) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }

    let mut subjects: Vec<serde_json::Value> = Vec::new();
    if select_all {
        let cs_ids: Result<Vec<String>, _> = (|| {
            let mut stmt =
                conn.prepare("SELECT id FROM class_subjects WHERE classroom_id = ?")?;
            let rows = stmt
                .query_map([&classroom_id], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok::<_, rusqlite::Error>(rows)
        })();
        let cs_ids = match cs_ids {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        for cs_id in cs_ids {
            let es_id = Uuid::new_v4().to_string();
            if let Err(e) = conn.execute(
                "INSERT INTO enrollment_subjects(id, enrollment_id, class_subject_id, selected)
                 VALUES (?, ?, ?, 1)",
                (&es_id, &enrollment_id, &cs_id),
            ) {
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
            subjects.push(json!({
                "enrollmentSubjectId": es_id,
                "classSubjectId": cs_id,
            }));
        }
    }

    ok(
        &req.id,
        json!({ "enrollmentId": enrollment_id, "subjects": subjects }),
    )
}

fn handle_enrollments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let classroom_id = match required_str(req, "classroomId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT e.id, st.id, st.matricule, st.last_name, st.first_name, e.active
         FROM enrollments e
         JOIN students st ON st.id = e.student_id
         WHERE e.classroom_id = ?
         ORDER BY st.last_name, st.first_name",
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows: Result<Vec<serde_json::Value>, _> = stmt
        .query_map([&classroom_id], |r| {
            let last: String = r.get(3)?;
            let first: String = r.get(4)?;
            Ok(json!({
                "enrollmentId": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "matricule": r.get::<_, String>(2)?,
                "studentName": format!("{} {}", last, first),
                "active": r.get::<_, i64>(5)? != 0,
            }))
        })
        .and_then(|it| it.collect());
    match rows {
        Ok(enrollments) => ok(&req.id, json!({ "enrollments": enrollments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Adjust one line of a student's subject basket: selection flag and/or
/// per-student coefficient override. Creates the line if absent.
fn handle_enrollment_subject_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let enrollment_id = match required_str(req, "enrollmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_subject_id = match required_str(req, "classSubjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let coef_override = req.params.get("coefOverride").and_then(|v| v.as_f64());
    if let Some(coef) = coef_override {
        if coef <= 0.0 {
            return err(&req.id, "bad_params", "coefOverride must be > 0", None);
        }
    }
    let clear_override = req
        .params
        .get("coefOverride")
        .map(|v| v.is_null())
        .unwrap_or(false);

    let existing: Result<Option<(String, i64, Option<f64>)>, _> = conn
        .query_row(
            "SELECT id, selected, coef_override FROM enrollment_subjects
             WHERE enrollment_id = ? AND class_subject_id = ?",
            (&enrollment_id, &class_subject_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional();
    let existing = match existing {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let (es_id, prev_selected, prev_override) = match existing {
        Some(v) => v,
        None => {
            let es_id = Uuid::new_v4().to_string();
            if let Err(e) = conn.execute(
                "INSERT INTO enrollment_subjects(id, enrollment_id, class_subject_id, selected)
                 VALUES (?, ?, ?, 1)",
                (&es_id, &enrollment_id, &class_subject_id),
            ) {
                return err(&req.id, "db_query_failed", e.to_string(), None);
            }
            (es_id, 1, None)
        }
    };

    let selected = req
        .params
        .get("selected")
        .and_then(|v| v.as_bool())
        .unwrap_or(prev_selected != 0);
    let next_override = if clear_override {
        None
    } else {
        coef_override.or(prev_override)
    };

    match conn.execute(
        "UPDATE enrollment_subjects SET selected = ?, coef_override = ? WHERE id = ?",
        (selected as i64, next_override, &es_id),
    ) {
        Ok(_) => ok(
            &req.id,
            json!({
                "enrollmentSubjectId": es_id,
                "selected": selected,
                "coefOverride": next_override,
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_enrollment_set_active(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let enrollment_id = match required_str(req, "enrollmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(active) = req.params.get("active").and_then(|v| v.as_bool()) else {
        return err(&req.id, "bad_params", "missing active", None);
    };
    match conn.execute(
        "UPDATE enrollments SET active = ? WHERE id = ?",
        (active as i64, &enrollment_id),
    ) {
        Ok(0) => err(&req.id, "not_found", "enrollment not found", None),
        Ok(_) => ok(&req.id, json!({ "enrollmentId": enrollment_id, "active": active })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(handle_student_create(state, req)),
        "enrollments.create" => Some(handle_enrollment_create(state, req)),
        "enrollments.list" => Some(handle_enrollments_list(state, req)),
        "enrollments.subject.update" => Some(handle_enrollment_subject_update(state, req)),
        "enrollments.setActive" => Some(handle_enrollment_set_active(state, req)),
        _ => None,
    }
}
