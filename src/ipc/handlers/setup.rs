use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn handle_school_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let identity = json!({
        "name": name,
        "address": optional_str(req, "address").unwrap_or_default(),
        "phone": optional_str(req, "phone").unwrap_or_default(),
    });
    match db::settings_set_json(conn, "school.identity", &identity) {
        Ok(()) => ok(&req.id, json!({ "school": identity })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_year_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let year_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO academic_years(id, name, start_date, end_date) VALUES (?, ?, ?, ?)",
        (
            &year_id,
            &name,
            optional_str(req, "startDate"),
            optional_str(req, "endDate"),
        ),
    ) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }

    // One academic year always carries three grading terms.
    let mut terms = Vec::with_capacity(3);
    for idx in 1..=3_i64 {
        let term_id = Uuid::new_v4().to_string();
        if let Err(e) = conn.execute(
            "INSERT INTO terms(id, year_id, idx) VALUES (?, ?, ?)",
            (&term_id, &year_id, idx),
        ) {
            return err(&req.id, "db_query_failed", e.to_string(), None);
        }
        terms.push(json!({ "id": term_id, "index": idx }));
    }

    let scale_id = match db::seed_default_grade_scale(conn, &year_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({ "yearId": year_id, "terms": terms, "gradeScaleId": scale_id }),
    )
}

fn handle_levels_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare("SELECT code, name FROM levels ORDER BY code") {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows: Result<Vec<serde_json::Value>, _> = stmt
        .query_map([], |r| {
            Ok(json!({
                "code": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
            }))
        })
        .and_then(|it| it.collect());
    match rows {
        Ok(levels) => ok(&req.id, json!({ "levels": levels })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classroom_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let year_id = match required_str(req, "yearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let level_code = match required_str(req, "levelCode") {
        Ok(v) => v.trim().to_ascii_uppercase(),
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let known_level: Option<String> = match conn
        .query_row("SELECT code FROM levels WHERE code = ?", [&level_code], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if known_level.is_none() {
        return err(
            &req.id,
            "not_found",
            format!("unknown level code: {}", level_code),
            None,
        );
    }

    let stream_id: Option<String> = match optional_str(req, "streamName") {
        None => None,
        Some(stream_name) => {
            match conn
                .query_row(
                    "SELECT id FROM streams WHERE name = ? AND is_active = 1",
                    [&stream_name],
                    |r| r.get(0),
                )
                .optional()
            {
                Ok(Some(id)) => Some(id),
                Ok(None) => {
                    return err(
                        &req.id,
                        "not_found",
                        format!("unknown stream: {}", stream_name),
                        None,
                    )
                }
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            }
        }
    };

    let classroom_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO classrooms(id, year_id, level_code, stream_id, name) VALUES (?, ?, ?, ?, ?)",
        (&classroom_id, &year_id, &level_code, &stream_id, &name),
    ) {
        Ok(_) => ok(&req.id, json!({ "classroomId": classroom_id })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subject_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let code = match required_str(req, "code") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO subjects(id, code, name, short_name) VALUES (?, ?, ?, ?)",
        (&subject_id, &code, &name, optional_str(req, "shortName")),
    ) {
        Ok(_) => ok(&req.id, json!({ "subjectId": subject_id })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_class_subject_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let classroom_id = match required_str(req, "classroomId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let coefficient = req
        .params
        .get("coefficient")
        .and_then(|v| v.as_f64())
        .unwrap_or(1.0);
    if coefficient <= 0.0 {
        return err(&req.id, "bad_params", "coefficient must be > 0", None);
    }
    let is_core = req
        .params
        .get("isCore")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let class_subject_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO class_subjects(id, classroom_id, subject_id, coefficient, is_core)
         VALUES (?, ?, ?, ?, ?)",
        (
            &class_subject_id,
            &classroom_id,
            &subject_id,
            coefficient,
            is_core as i64,
        ),
    ) {
        Ok(_) => ok(&req.id, json!({ "classSubjectId": class_subject_id })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_assessment_type_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let code = match required_str(req, "code") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(weight) = req.params.get("weight").and_then(|v| v.as_f64()) else {
        return err(&req.id, "bad_params", "missing weight", None);
    };
    if !(0.0..=100.0).contains(&weight) {
        return err(&req.id, "bad_params", "weight must be in range 0..=100", None);
    }
    let is_active = req
        .params
        .get("isActive")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let result = conn.execute(
        "INSERT INTO assessment_types(id, code, name, weight, is_active)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(code) DO UPDATE SET
            name = COALESCE(excluded.name, name),
            weight = excluded.weight,
            is_active = excluded.is_active",
        (
            Uuid::new_v4().to_string(),
            &code,
            optional_str(req, "name"),
            weight,
            is_active as i64,
        ),
    );
    match result {
        Ok(_) => {
            let id: Result<String, _> = conn.query_row(
                "SELECT id FROM assessment_types WHERE code = ?",
                [&code],
                |r| r.get(0),
            );
            match id {
                Ok(id) => ok(&req.id, json!({ "assessmentTypeId": id })),
                Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
            }
        }
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_assessment_type_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT id, code, name, weight, is_active FROM assessment_types ORDER BY code",
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows: Result<Vec<serde_json::Value>, _> = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "code": r.get::<_, String>(1)?,
                "name": r.get::<_, Option<String>>(2)?,
                "weight": r.get::<_, f64>(3)?,
                "isActive": r.get::<_, i64>(4)? != 0,
            }))
        })
        .and_then(|it| it.collect());
    match rows {
        Ok(types) => ok(&req.id, json!({ "assessmentTypes": types })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Create assessments in bulk for one term: either every class subject of a
/// classroom or an explicit class-subject list, over the given (or all
/// active) assessment type codes. Existing triples are left untouched.
fn handle_assessments_bulk_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_id = match required_str(req, "termId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let cs_ids: Vec<String> = if let Some(classroom_id) = optional_str(req, "classroomId") {
        let mut stmt = match conn.prepare("SELECT id FROM class_subjects WHERE classroom_id = ?") {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        match stmt
            .query_map([&classroom_id], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    } else if let Some(raw) = req.params.get("classSubjectIds").and_then(|v| v.as_array()) {
        let mut out = Vec::new();
        for v in raw {
            let Some(id) = v.as_str() else {
                return err(
                    &req.id,
                    "bad_params",
                    "classSubjectIds must contain only strings",
                    None,
                );
            };
            out.push(id.to_string());
        }
        out
    } else {
        return err(
            &req.id,
            "bad_params",
            "provide either classroomId or classSubjectIds",
            None,
        );
    };

    let atype_rows: Vec<(String, String)> = {
        let (sql, bind): (String, Vec<Value>) =
            if let Some(raw) = req.params.get("atypeCodes").and_then(|v| v.as_array()) {
                let mut codes = Vec::new();
                for v in raw {
                    let Some(code) = v.as_str() else {
                        return err(
                            &req.id,
                            "bad_params",
                            "atypeCodes must contain only strings",
                            None,
                        );
                    };
                    codes.push(code.to_string());
                }
                let placeholders = std::iter::repeat("?")
                    .take(codes.len())
                    .collect::<Vec<_>>()
                    .join(",");
                (
                    format!(
                        "SELECT id, code FROM assessment_types
                         WHERE is_active = 1 AND code IN ({})
                         ORDER BY code",
                        placeholders
                    ),
                    codes.into_iter().map(Value::Text).collect(),
                )
            } else {
                (
                    "SELECT id, code FROM assessment_types WHERE is_active = 1 ORDER BY code"
                        .to_string(),
                    Vec::new(),
                )
            };
        let mut stmt = match conn.prepare(&sql) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        match stmt
            .query_map(params_from_iter(bind), |r| Ok((r.get(0)?, r.get(1)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    };
    if atype_rows.is_empty() {
        return err(
            &req.id,
            "not_found",
            "no matching active assessment types",
            None,
        );
    }

    let mut created: Vec<String> = Vec::new();
    let mut existing: Vec<String> = Vec::new();
    for cs_id in &cs_ids {
        for (atype_id, _) in &atype_rows {
            let found: Result<Option<String>, _> = conn
                .query_row(
                    "SELECT id FROM assessments
                     WHERE term_id = ? AND class_subject_id = ? AND atype_id = ?",
                    (&term_id, cs_id, atype_id),
                    |r| r.get(0),
                )
                .optional();
            match found {
                Ok(Some(id)) => existing.push(id),
                Ok(None) => {
                    let assessment_id = Uuid::new_v4().to_string();
                    if let Err(e) = conn.execute(
                        "INSERT INTO assessments(id, term_id, class_subject_id, atype_id)
                         VALUES (?, ?, ?, ?)",
                        (&assessment_id, &term_id, cs_id, atype_id),
                    ) {
                        return err(&req.id, "db_query_failed", e.to_string(), None);
                    }
                    created.push(assessment_id);
                }
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            }
        }
    }

    ok(&req.id, json!({ "created": created, "existing": existing }))
}

fn handle_assessments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_id = match required_str(req, "termId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let classroom_id = match required_str(req, "classroomId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT a.id, a.class_subject_id, s.code, at.code, at.weight
         FROM assessments a
         JOIN class_subjects cs ON cs.id = a.class_subject_id
         JOIN subjects s ON s.id = cs.subject_id
         JOIN assessment_types at ON at.id = a.atype_id
         WHERE a.term_id = ? AND cs.classroom_id = ?
         ORDER BY s.name, at.code",
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows: Result<Vec<serde_json::Value>, _> = stmt
        .query_map((&term_id, &classroom_id), |r| {
            Ok(json!({
                "assessmentId": r.get::<_, String>(0)?,
                "classSubjectId": r.get::<_, String>(1)?,
                "subjectCode": r.get::<_, String>(2)?,
                "atypeCode": r.get::<_, String>(3)?,
                "weight": r.get::<_, f64>(4)?,
            }))
        })
        .and_then(|it| it.collect());
    match rows {
        Ok(assessments) => ok(&req.id, json!({ "assessments": assessments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.school.update" => Some(handle_school_update(state, req)),
        "setup.year.create" => Some(handle_year_create(state, req)),
        "setup.levels.list" => Some(handle_levels_list(state, req)),
        "setup.classroom.create" => Some(handle_classroom_create(state, req)),
        "setup.subject.create" => Some(handle_subject_create(state, req)),
        "setup.classSubject.create" => Some(handle_class_subject_create(state, req)),
        "setup.assessmentType.upsert" => Some(handle_assessment_type_upsert(state, req)),
        "setup.assessmentType.list" => Some(handle_assessment_type_list(state, req)),
        "setup.assessments.bulkCreate" => Some(handle_assessments_bulk_create(state, req)),
        "setup.assessments.list" => Some(handle_assessments_list(state, req)),
        _ => None,
    }
}
