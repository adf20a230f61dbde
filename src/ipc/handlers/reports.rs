use crate::calc;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::snapshot;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
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

fn calc_err(req: &Request, e: calc::CalcError) -> serde_json::Value {
    err(
        &req.id,
        &e.code,
        e.message,
        e.details.map(|d| json!(d)).or(None),
    )
}

fn school_identity(conn: &Connection) -> serde_json::Value {
    db::settings_get_json(conn, "school.identity")
        .ok()
        .flatten()
        .unwrap_or_else(|| json!({ "name": "Your School", "address": "", "phone": "" }))
}

fn payload_sha256(payload: &serde_json::Value) -> String {
    let canonical = serde_json::to_string(payload).unwrap_or_default();
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

/// Report-card payload for one student/term: subject lines with CA detail,
/// weighted totals, general average, grade letters, and the class rank.
fn build_student_term_payload(
    conn: &Connection,
    enrollment_id: &str,
    term_id: &str,
) -> Result<serde_json::Value, calc::CalcError> {
    let enrollment = snapshot::load_enrollment_ctx(conn, enrollment_id)?;
    let (ctx, term, class_snapshot) =
        snapshot::load_class_term_snapshot(conn, &enrollment.classroom.classroom_id, term_id)?;
    let bands = snapshot::load_grade_bands(conn, &ctx.year_id)?;

    let Some(student) = class_snapshot
        .students
        .iter()
        .find(|s| s.enrollment_id == enrollment_id)
    else {
        return Err(calc::CalcError::new(
            "not_found",
            "enrollment is not active in its classroom",
        ));
    };

    let computed = calc::student_term_lines(
        &class_snapshot.subjects,
        &student.subjects,
        class_snapshot.policy,
        &bands,
    );

    let stats = calc::class_stats(&class_snapshot, calc::DEFAULT_PASS_MARK);
    let averages: Vec<(String, f64)> = stats
        .students
        .iter()
        .map(|s| (s.enrollment_id.clone(), s.average))
        .collect();
    let ranks = calc::competition_ranks(&averages);
    let rank = ranks.rank_by_id.get(enrollment_id).copied();

    Ok(json!({
        "school": school_identity(conn),
        "student": {
            "id": enrollment.student_id,
            "matricule": enrollment.matricule,
            "name": enrollment.display_name,
            "sex": enrollment.sex,
        },
        "classroom": {
            "id": ctx.classroom_id,
            "name": ctx.name,
            "level": ctx.level_code,
            "year": ctx.year_name,
            "policy": ctx.policy.as_str(),
        },
        "term": { "id": term.term_id, "index": term.index },
        "lines": computed.lines,
        "totals": {
            "coefSum": computed.coefficient_sum,
            "weightedSum": computed.weighted_total,
            "average": computed.average,
            "grade": computed.grade,
        },
        "classStats": {
            "rank": rank,
            "count": ranks.count,
            "classAvg": ranks.class_average,
        },
        "attendance": { "absences": "", "lates": "" },
        "remarks": { "teacher": "", "principal": "" },
    }))
}

fn handle_student_term(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let enrollment_id = match required_str(req, "enrollmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_id = match required_str(req, "termId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match build_student_term_payload(conn, &enrollment_id, &term_id) {
        Ok(payload) => ok(&req.id, payload),
        Err(e) => calc_err(req, e),
    }
}

/// Ranked class listing for one term. Rows come back sorted by average
/// descending; ties share a competition rank.
fn handle_class_term(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let classroom_id = match required_str(req, "classroomId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_id = match required_str(req, "termId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let with_details = req
        .params
        .get("details")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let (ctx, term, class_snapshot) =
        match snapshot::load_class_term_snapshot(conn, &classroom_id, &term_id) {
            Ok(v) => v,
            Err(e) => return calc_err(req, e),
        };
    let bands = match snapshot::load_grade_bands(conn, &ctx.year_id) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };

    let stats = calc::class_stats(&class_snapshot, calc::DEFAULT_PASS_MARK);
    let averages: Vec<(String, f64)> = stats
        .students
        .iter()
        .map(|s| (s.enrollment_id.clone(), s.average))
        .collect();
    let ranks = calc::competition_ranks(&averages);

    let details_by_enrollment: HashMap<String, calc::StudentTermComputation> = if with_details {
        class_snapshot
            .students
            .iter()
            .map(|student| {
                (
                    student.enrollment_id.clone(),
                    calc::student_term_lines(
                        &class_snapshot.subjects,
                        &student.subjects,
                        class_snapshot.policy,
                        &bands,
                    ),
                )
            })
            .collect()
    } else {
        HashMap::new()
    };

    let mut rows: Vec<serde_json::Value> = stats
        .students
        .iter()
        .map(|s| {
            let mut row = json!({
                "enrollmentId": s.enrollment_id,
                "student": {
                    "id": s.student_id,
                    "matricule": s.matricule,
                    "name": s.student_name,
                },
                "generalAverage": s.average,
                "generalGrade": calc::grade_letter(s.average, &bands).unwrap_or(""),
                "rank": ranks.rank_by_id.get(&s.enrollment_id),
            });
            if let Some(detail) = details_by_enrollment.get(&s.enrollment_id) {
                row["subjects"] = json!(detail.lines);
            }
            row
        })
        .collect();
    rows.sort_by(|a, b| {
        let av = a.get("generalAverage").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let bv = b.get("generalAverage").and_then(|v| v.as_f64()).unwrap_or(0.0);
        bv.partial_cmp(&av).unwrap_or(std::cmp::Ordering::Equal)
    });

    ok(
        &req.id,
        json!({
            "classroom": {
                "id": ctx.classroom_id,
                "name": ctx.name,
                "level": ctx.level_code,
                "year": ctx.year_name,
                "policy": ctx.policy.as_str(),
            },
            "term": { "id": term.term_id, "index": term.index },
            "count": ranks.count,
            "classAvg": ranks.class_average,
            "results": rows,
        }),
    )
}

#[derive(Debug, Clone)]
struct StudentIdent {
    enrollment_id: String,
    student_id: String,
    matricule: String,
    display_name: String,
}

#[derive(Debug, Clone, Default)]
struct AnnualOverrides {
    pass_mark: Option<f64>,
    term_weights: Option<Vec<(i64, f64)>>,
}

fn parse_annual_overrides(req: &Request) -> Result<AnnualOverrides, serde_json::Value> {
    let mut overrides = AnnualOverrides {
        pass_mark: req.params.get("passMark").and_then(|v| v.as_f64()),
        term_weights: None,
    };
    if let Some(raw) = req.params.get("termWeights").and_then(|v| v.as_array()) {
        let mut weights = Vec::with_capacity(raw.len());
        for entry in raw {
            let (Some(term), Some(weight)) = (
                entry.get("term").and_then(|v| v.as_i64()),
                entry.get("weight").and_then(|v| v.as_f64()),
            ) else {
                return Err(err(
                    &req.id,
                    "bad_params",
                    "termWeights entries must have term and weight",
                    None,
                ));
            };
            if weight < 0.0 {
                return Err(err(&req.id, "bad_params", "term weight must be >= 0", None));
            }
            weights.push((term, weight));
        }
        overrides.term_weights = Some(weights);
    }
    Ok(overrides)
}

/// Annual summaries for every active student of a classroom, plus the annual
/// competition ranking. Subject marks are computed per term with the
/// classroom's policy, then combined with the configured term weights.
fn build_class_annual(
    conn: &Connection,
    classroom_id: &str,
    overrides: &AnnualOverrides,
) -> Result<
    (
        snapshot::ClassroomCtx,
        calc::AnnualConfig,
        Vec<(StudentIdent, calc::AnnualSummary)>,
        calc::RankSummary,
    ),
    calc::CalcError,
> {
    let (ctx, term_snapshots) = snapshot::load_year_class_snapshots(conn, classroom_id)?;
    if term_snapshots.is_empty() {
        return Err(calc::CalcError::new(
            "not_found",
            "academic year has no terms",
        ));
    }

    let term_indexes: Vec<i64> = term_snapshots.iter().map(|(t, _)| t.index).collect();
    let mut config = calc::AnnualConfig::equal_weights(&term_indexes);
    if let Some(pass_mark) = overrides.pass_mark {
        config.pass_mark = pass_mark;
    }
    if let Some(weights) = &overrides.term_weights {
        for (term, weight) in weights {
            let Some(slot) = config.term_weights.iter_mut().find(|(idx, _)| idx == term) else {
                return Err(calc::CalcError::new(
                    "bad_params",
                    format!("unknown term index: {}", term),
                ));
            };
            slot.1 = *weight;
        }
    }
    let bands = snapshot::load_grade_bands(conn, &ctx.year_id)?;

    // Marks per (enrollment, class subject) per term; selection and
    // coefficients are term-independent, so the first snapshot's rows
    // describe each student's basket.
    let mut marks: HashMap<(String, String), Vec<(i64, Option<f64>)>> = HashMap::new();
    for (term, class_snapshot) in &term_snapshots {
        let subject_by_id: HashMap<&str, &calc::SubjectRow> = class_snapshot
            .subjects
            .iter()
            .map(|s| (s.class_subject_id.as_str(), s))
            .collect();
        for student in &class_snapshot.students {
            for es in &student.subjects {
                let Some(subject) = subject_by_id.get(es.class_subject_id.as_str()) else {
                    continue;
                };
                let mark =
                    calc::subject_term_mark(&subject.slots, &es.scores, class_snapshot.policy);
                marks
                    .entry((student.enrollment_id.clone(), es.class_subject_id.clone()))
                    .or_default()
                    .push((term.index, mark));
            }
        }
    }

    let (_, first_snapshot) = &term_snapshots[0];
    let mut summaries: Vec<(StudentIdent, calc::AnnualSummary)> = Vec::new();
    for student in &first_snapshot.students {
        let mut inputs: Vec<calc::AnnualSubjectInput> = Vec::new();
        for subject in &first_snapshot.subjects {
            let Some(es) = student
                .subjects
                .iter()
                .find(|es| es.class_subject_id == subject.class_subject_id)
            else {
                continue;
            };
            let term_marks = marks
                .get(&(student.enrollment_id.clone(), subject.class_subject_id.clone()))
                .cloned()
                .unwrap_or_default();
            inputs.push(calc::AnnualSubjectInput {
                class_subject_id: subject.class_subject_id.clone(),
                subject_code: subject.subject_code.clone(),
                subject_name: subject.subject_name.clone(),
                coefficient: calc::effective_coefficient(subject.coefficient, es.coef_override),
                term_marks,
            });
        }
        let summary =
            calc::annual_for_student(&inputs, &config, first_snapshot.policy, &bands);
        summaries.push((
            StudentIdent {
                enrollment_id: student.enrollment_id.clone(),
                student_id: student.student_id.clone(),
                matricule: student.matricule.clone(),
                display_name: student.display_name.clone(),
            },
            summary,
        ));
    }

    let averages: Vec<(String, f64)> = summaries
        .iter()
        .map(|(ident, summary)| (ident.enrollment_id.clone(), summary.annual_average))
        .collect();
    let ranks = calc::competition_ranks(&averages);

    Ok((ctx, config, summaries, ranks))
}

fn build_annual_student_payload(
    conn: &Connection,
    req: &Request,
    enrollment_id: &str,
) -> Result<serde_json::Value, serde_json::Value> {
    let overrides = parse_annual_overrides(req)?;
    let enrollment =
        snapshot::load_enrollment_ctx(conn, enrollment_id).map_err(|e| calc_err(req, e))?;
    let (ctx, config, summaries, ranks) =
        build_class_annual(conn, &enrollment.classroom.classroom_id, &overrides)
            .map_err(|e| calc_err(req, e))?;

    let Some((ident, summary)) = summaries
        .iter()
        .find(|(ident, _)| ident.enrollment_id == enrollment_id)
    else {
        return Err(calc_err(
            req,
            calc::CalcError::new("not_found", "enrollment is not active in its classroom"),
        ));
    };

    Ok(json!({
        "school": school_identity(conn),
        "student": {
            "id": ident.student_id,
            "matricule": ident.matricule,
            "name": ident.display_name,
            "sex": enrollment.sex,
        },
        "classroom": {
            "id": ctx.classroom_id,
            "name": ctx.name,
            "level": ctx.level_code,
            "year": ctx.year_name,
            "policy": ctx.policy.as_str(),
        },
        "yearLabel": ctx.year_name,
        "termWeights": config
            .term_weights
            .iter()
            .map(|(term, weight)| json!({ "term": term, "weight": weight }))
            .collect::<Vec<_>>(),
        "passMark": config.pass_mark,
        "subjects": summary.subjects,
        "totals": {
            "coefSum": summary.coefficient_sum,
            "weightedSum": summary.weighted_total,
            "average": summary.annual_average,
            "grade": summary.grade,
        },
        "decision": summary.decision,
        "classStats": {
            "rank": ranks.rank_by_id.get(enrollment_id),
            "count": ranks.count,
            "classAvg": ranks.class_average,
        },
    }))
}

fn handle_annual_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let enrollment_id = match required_str(req, "enrollmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match build_annual_student_payload(conn, req, &enrollment_id) {
        Ok(payload) => ok(&req.id, payload),
        Err(resp) => resp,
    }
}

fn handle_annual_class(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let classroom_id = match required_str(req, "classroomId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let overrides = match parse_annual_overrides(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let (ctx, config, summaries, ranks) = match build_class_annual(conn, &classroom_id, &overrides)
    {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };

    let mut rows: Vec<serde_json::Value> = summaries
        .iter()
        .map(|(ident, summary)| {
            json!({
                "enrollmentId": ident.enrollment_id,
                "student": {
                    "id": ident.student_id,
                    "matricule": ident.matricule,
                    "name": ident.display_name,
                },
                "annualAverage": summary.annual_average,
                "grade": summary.grade,
                "decision": summary.decision,
                "rank": ranks.rank_by_id.get(&ident.enrollment_id),
            })
        })
        .collect();
    rows.sort_by(|a, b| {
        let av = a.get("annualAverage").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let bv = b.get("annualAverage").and_then(|v| v.as_f64()).unwrap_or(0.0);
        bv.partial_cmp(&av).unwrap_or(std::cmp::Ordering::Equal)
    });

    ok(
        &req.id,
        json!({
            "classroom": {
                "id": ctx.classroom_id,
                "name": ctx.name,
                "level": ctx.level_code,
                "year": ctx.year_name,
                "policy": ctx.policy.as_str(),
            },
            "yearLabel": ctx.year_name,
            "passMark": config.pass_mark,
            "count": ranks.count,
            "classAvg": ranks.class_average,
            "results": rows,
        }),
    )
}

fn handle_issue_token(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let enrollment_id = match required_str(req, "enrollmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_id = match required_str(req, "termId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let payload = match build_student_term_payload(conn, &enrollment_id, &term_id) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };
    let uid = Uuid::new_v4().to_string();
    let sha256 = payload_sha256(&payload);
    let created_at = chrono::Utc::now().to_rfc3339();
    let raw = match serde_json::to_string(&payload) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
    };

    match conn.execute(
        "INSERT INTO report_tokens(uid, enrollment_id, term_id, created_at, valid, payload, payload_sha256)
         VALUES (?, ?, ?, ?, 1, ?, ?)",
        (&uid, &enrollment_id, &term_id, &created_at, &raw, &sha256),
    ) {
        Ok(_) => ok(
            &req.id,
            json!({ "uid": uid, "sha256": sha256, "createdAt": created_at }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_verify_token(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let uid = match required_str(req, "uid") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let row: Result<Option<(String, String, String, i64, String, String)>, _> = conn
        .query_row(
            "SELECT enrollment_id, term_id, created_at, valid, payload, payload_sha256
             FROM report_tokens WHERE uid = ?",
            [&uid],
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
        .optional();
    match row {
        Ok(Some((enrollment_id, term_id, created_at, valid, payload, sha256))) => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null);
            ok(
                &req.id,
                json!({
                    "uid": uid,
                    "enrollmentId": enrollment_id,
                    "termId": term_id,
                    "createdAt": created_at,
                    "valid": valid != 0,
                    "sha256": sha256,
                    "payload": payload,
                }),
            )
        }
        Ok(None) => err(&req.id, "not_found", "report token not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_issue_annual_token(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let enrollment_id = match required_str(req, "enrollmentId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let payload = match build_annual_student_payload(conn, req, &enrollment_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let year_label = payload
        .get("yearLabel")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let uid = Uuid::new_v4().to_string();
    let sha256 = payload_sha256(&payload);
    let created_at = chrono::Utc::now().to_rfc3339();
    let raw = match serde_json::to_string(&payload) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "bad_params", e.to_string(), None),
    };

    match conn.execute(
        "INSERT INTO annual_report_tokens(uid, enrollment_id, year_label, created_at, valid, payload, payload_sha256)
         VALUES (?, ?, ?, ?, 1, ?, ?)",
        (&uid, &enrollment_id, &year_label, &created_at, &raw, &sha256),
    ) {
        Ok(_) => ok(
            &req.id,
            json!({ "uid": uid, "sha256": sha256, "createdAt": created_at, "yearLabel": year_label }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_verify_annual_token(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let uid = match required_str(req, "uid") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let row: Result<Option<(String, String, String, i64, String, String)>, _> = conn
        .query_row(
            "SELECT enrollment_id, year_label, created_at, valid, payload, payload_sha256
             FROM annual_report_tokens WHERE uid = ?",
            [&uid],
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
        .optional();
    match row {
        Ok(Some((enrollment_id, year_label, created_at, valid, payload, sha256))) => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null);
            ok(
                &req.id,
                json!({
                    "uid": uid,
                    "enrollmentId": enrollment_id,
                    "yearLabel": year_label,
                    "createdAt": created_at,
                    "valid": valid != 0,
                    "sha256": sha256,
                    "payload": payload,
                }),
            )
        }
        Ok(None) => err(&req.id, "not_found", "annual report token not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.studentTerm" => Some(handle_student_term(state, req)),
        "reports.classTerm" => Some(handle_class_term(state, req)),
        "reports.annualStudent" => Some(handle_annual_student(state, req)),
        "reports.annualClass" => Some(handle_annual_class(state, req)),
        "reports.issueToken" => Some(handle_issue_token(state, req)),
        "reports.verifyToken" => Some(handle_verify_token(state, req)),
        "reports.issueAnnualToken" => Some(handle_issue_annual_token(state, req)),
        "reports.verifyAnnualToken" => Some(handle_verify_annual_token(state, req)),
        _ => None,
    }
}
