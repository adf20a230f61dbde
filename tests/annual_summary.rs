use serde_json::json;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

struct AnnualFixture {
    classroom_id: String,
    /// assessment id by (term index, subject code, assessment type code)
    assessment_by_key: HashMap<(i64, String, String), String>,
    /// enrollment subject id by (matricule, subject code)
    es_by_key: HashMap<(String, String), String>,
    enrollment_by_matricule: HashMap<String, String>,
}

/// Classroom with MATH (coef 4) and ENG (coef 2), assessments configured
/// for all three terms of the year, and the given students enrolled.
fn seed_annual_classroom(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    tag: &str,
    year_id: &str,
    terms: &[(i64, String)],
    level_code: &str,
    class_name: &str,
    stream_name: Option<&str>,
    students: &[(&str, &str, &str, &str)],
) -> AnnualFixture {
    let mut class_params = json!({
        "yearId": year_id,
        "levelCode": level_code,
        "name": class_name,
    });
    if let Some(stream) = stream_name {
        class_params["streamName"] = json!(stream);
    }
    let classroom = request_ok(
        stdin,
        reader,
        &format!("{tag}-class"),
        "setup.classroom.create",
        class_params,
    );
    let classroom_id = classroom["classroomId"].as_str().expect("classroomId").to_string();

    let mut cs_to_subject: HashMap<String, String> = HashMap::new();
    for (code, name, coef) in [("MATH", "Mathematics", 4.0), ("ENG", "English", 2.0)] {
        let subject = request_ok(
            stdin,
            reader,
            &format!("{tag}-subj-{code}"),
            "setup.subject.create",
            json!({ "code": format!("{code}-{tag}"), "name": name }),
        );
        let cs = request_ok(
            stdin,
            reader,
            &format!("{tag}-cs-{code}"),
            "setup.classSubject.create",
            json!({
                "classroomId": classroom_id,
                "subjectId": subject["subjectId"].as_str().expect("subjectId"),
                "coefficient": coef,
            }),
        );
        cs_to_subject.insert(
            cs["classSubjectId"].as_str().expect("classSubjectId").to_string(),
            code.to_string(),
        );
    }

    let mut assessment_by_key = HashMap::new();
    for (idx, term_id) in terms {
        let _ = request_ok(
            stdin,
            reader,
            &format!("{tag}-bulk-{idx}"),
            "setup.assessments.bulkCreate",
            json!({ "termId": term_id, "classroomId": classroom_id }),
        );
        let listed = request_ok(
            stdin,
            reader,
            &format!("{tag}-alist-{idx}"),
            "setup.assessments.list",
            json!({ "termId": term_id, "classroomId": classroom_id }),
        );
        for a in listed["assessments"].as_array().expect("assessments") {
            let cs_id = a["classSubjectId"].as_str().expect("classSubjectId");
            let code = cs_to_subject.get(cs_id).expect("known class subject");
            assessment_by_key.insert(
                (
                    *idx,
                    code.clone(),
                    a["atypeCode"].as_str().expect("atypeCode").to_string(),
                ),
                a["assessmentId"].as_str().expect("assessmentId").to_string(),
            );
        }
    }

    let mut es_by_key = HashMap::new();
    let mut enrollment_by_matricule = HashMap::new();
    for (matricule, last, first, sex) in students {
        let student = request_ok(
            stdin,
            reader,
            &format!("{tag}-stud-{matricule}"),
            "students.create",
            json!({
                "matricule": format!("{matricule}-{tag}"),
                "lastName": last,
                "firstName": first,
                "sex": sex,
            }),
        );
        let enrollment = request_ok(
            stdin,
            reader,
            &format!("{tag}-enr-{matricule}"),
            "enrollments.create",
            json!({
                "studentId": student["studentId"].as_str().expect("studentId"),
                "classroomId": classroom_id,
            }),
        );
        enrollment_by_matricule.insert(
            matricule.to_string(),
            enrollment["enrollmentId"].as_str().expect("enrollmentId").to_string(),
        );
        for es in enrollment["subjects"].as_array().expect("subjects") {
            let cs_id = es["classSubjectId"].as_str().expect("classSubjectId");
            let code = cs_to_subject.get(cs_id).expect("known class subject");
            es_by_key.insert(
                (matricule.to_string(), code.clone()),
                es["enrollmentSubjectId"]
                    .as_str()
                    .expect("enrollmentSubjectId")
                    .to_string(),
            );
        }
    }

    AnnualFixture {
        classroom_id,
        assessment_by_key,
        es_by_key,
        enrollment_by_matricule,
    }
}

fn enter_score(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    fixture: &AnnualFixture,
    term: i64,
    matricule: &str,
    subject: &str,
    atype: &str,
    value: f64,
) {
    let es_id = fixture
        .es_by_key
        .get(&(matricule.to_string(), subject.to_string()))
        .expect("enrollment subject");
    let assessment_id = fixture
        .assessment_by_key
        .get(&(term, subject.to_string(), atype.to_string()))
        .expect("assessment");
    let _ = request_ok(
        stdin,
        reader,
        id,
        "scores.enter",
        json!({
            "enrollmentSubjectId": es_id,
            "assessmentId": assessment_id,
            "value": value,
        }),
    );
}

fn create_year(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    name: &str,
) -> (String, Vec<(i64, String)>) {
    let year = request_ok(stdin, reader, "year", "setup.year.create", json!({ "name": name }));
    let year_id = year["yearId"].as_str().expect("yearId").to_string();
    let terms = year["terms"]
        .as_array()
        .expect("terms")
        .iter()
        .map(|t| {
            (
                t["index"].as_i64().expect("index"),
                t["id"].as_str().expect("term id").to_string(),
            )
        })
        .collect();
    (year_id, terms)
}

#[test]
fn upper_form_annual_skips_scoreless_terms() {
    let workspace = temp_dir("gradebook-annual-renorm");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let (year_id, terms) = create_year(&mut stdin, &mut reader, "2025/2026");
    let fixture = seed_annual_classroom(
        &mut stdin,
        &mut reader,
        "f5",
        &year_id,
        &terms,
        "F5",
        "Form 5 Sci",
        Some("Science"),
        &[("S001", "Abanda", "Marie", "F"), ("S002", "Biya", "Paul", "M")],
    );

    // Abanda: full term 1, math-only term 2, nothing in term 3.
    enter_score(&mut stdin, &mut reader, "a1", &fixture, 1, "S001", "MATH", "CA1", 80.0);
    enter_score(&mut stdin, &mut reader, "a2", &fixture, 1, "S001", "MATH", "CA2", 80.0);
    enter_score(&mut stdin, &mut reader, "a3", &fixture, 1, "S001", "ENG", "CA1", 60.0);
    enter_score(&mut stdin, &mut reader, "a4", &fixture, 1, "S001", "ENG", "CA2", 60.0);
    enter_score(&mut stdin, &mut reader, "a5", &fixture, 2, "S001", "MATH", "CA1", 90.0);
    enter_score(&mut stdin, &mut reader, "a6", &fixture, 2, "S001", "MATH", "CA2", 90.0);

    let abanda = fixture.enrollment_by_matricule.get("S001").expect("enrollment");
    let annual = request_ok(
        &mut stdin,
        &mut reader,
        "annual",
        "reports.annualStudent",
        json!({ "enrollmentId": abanda }),
    );

    assert_eq!(annual["classroom"]["policy"], "renormalized");
    assert_eq!(annual["yearLabel"], "2025/2026");

    let subjects = annual["subjects"].as_array().expect("subjects");
    let math = subjects
        .iter()
        .find(|s| s["subjectName"] == "Mathematics")
        .expect("math row");
    // Term 3 has no mark and is skipped, not zeroed: (80 + 90) / 2 = 85.
    assert!((math["annualMark"].as_f64().unwrap() - 85.0).abs() < 1e-9);
    let term_marks = math["termMarks"].as_array().expect("termMarks");
    assert_eq!(term_marks.len(), 3);
    assert!(term_marks[2]["mark"].is_null());

    let english = subjects
        .iter()
        .find(|s| s["subjectName"] == "English")
        .expect("english row");
    assert!((english["annualMark"].as_f64().unwrap() - 60.0).abs() < 1e-9);

    // (85*4 + 60*2) / 6 = 76.67, above the default pass mark.
    let totals = &annual["totals"];
    assert!((totals["average"].as_f64().unwrap() - 76.67).abs() < 1e-9);
    assert_eq!(annual["decision"], "Promoted");
    assert_eq!(annual["classStats"]["rank"], 1);
    assert_eq!(annual["classStats"]["count"], 2);

    // A student with no marks anywhere gets the defined zero average.
    let class_annual = request_ok(
        &mut stdin,
        &mut reader,
        "annual-class",
        "reports.annualClass",
        json!({ "classroomId": fixture.classroom_id }),
    );
    let results = class_annual["results"].as_array().expect("results");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["student"]["name"], "Abanda Marie");
    assert_eq!(results[0]["rank"], 1);
    assert_eq!(results[0]["decision"], "Promoted");
    assert!((results[1]["annualAverage"].as_f64().unwrap() - 0.0).abs() < 1e-9);
    assert_eq!(results[1]["rank"], 2);
    assert_eq!(results[1]["decision"], "Repeat");

    // Annual token round-trip.
    let issued = request_ok(
        &mut stdin,
        &mut reader,
        "annual-issue",
        "reports.issueAnnualToken",
        json!({ "enrollmentId": abanda }),
    );
    let uid = issued["uid"].as_str().expect("uid").to_string();
    assert_eq!(issued["yearLabel"], "2025/2026");
    let verified = request_ok(
        &mut stdin,
        &mut reader,
        "annual-verify",
        "reports.verifyAnnualToken",
        json!({ "uid": uid }),
    );
    assert_eq!(verified["valid"], true);
    assert!(
        (verified["payload"]["totals"]["average"].as_f64().unwrap() - 76.67).abs() < 1e-9
    );

    let _ = child.kill();
}

#[test]
fn lower_form_annual_zero_fills_scoreless_terms() {
    let workspace = temp_dir("gradebook-annual-standard");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let (year_id, terms) = create_year(&mut stdin, &mut reader, "2025/2026");
    let fixture = seed_annual_classroom(
        &mut stdin,
        &mut reader,
        "f2",
        &year_id,
        &terms,
        "F2",
        "Form 2B",
        None,
        &[("S003", "Chi", "John", "M")],
    );

    // One good term, then silence.
    enter_score(&mut stdin, &mut reader, "c1", &fixture, 1, "S003", "MATH", "CA1", 60.0);
    enter_score(&mut stdin, &mut reader, "c2", &fixture, 1, "S003", "MATH", "CA2", 60.0);

    let chi = fixture.enrollment_by_matricule.get("S003").expect("enrollment");
    let annual = request_ok(
        &mut stdin,
        &mut reader,
        "annual",
        "reports.annualStudent",
        json!({ "enrollmentId": chi }),
    );

    assert_eq!(annual["classroom"]["policy"], "standard");
    let subjects = annual["subjects"].as_array().expect("subjects");
    let math = subjects
        .iter()
        .find(|s| s["subjectName"] == "Mathematics")
        .expect("math row");
    // Terms 2 and 3 count as zero with full weight: (60 + 0 + 0) / 3 = 20.
    assert!((math["annualMark"].as_f64().unwrap() - 20.0).abs() < 1e-9);

    // English was configured every term but never scored: zero, still counted.
    let english = subjects
        .iter()
        .find(|s| s["subjectName"] == "English")
        .expect("english row");
    assert!((english["annualMark"].as_f64().unwrap() - 0.0).abs() < 1e-9);
    assert_eq!(english["includedInAverage"], true);

    // (20*4 + 0*2) / 6 = 13.33.
    assert!((annual["totals"]["average"].as_f64().unwrap() - 13.33).abs() < 1e-9);
    assert_eq!(annual["decision"], "Repeat");

    // Weighting terms 2 and 3 out and lowering the pass mark flips the
    // decision without touching any stored state.
    let reweighted = request_ok(
        &mut stdin,
        &mut reader,
        "annual-reweighted",
        "reports.annualStudent",
        json!({
            "enrollmentId": chi,
            "passMark": 30.0,
            "termWeights": [
                { "term": 2, "weight": 0.0 },
                { "term": 3, "weight": 0.0 },
            ],
        }),
    );
    let subjects = reweighted["subjects"].as_array().expect("subjects");
    let math = subjects
        .iter()
        .find(|s| s["subjectName"] == "Mathematics")
        .expect("math row");
    assert!((math["annualMark"].as_f64().unwrap() - 60.0).abs() < 1e-9);
    // (60*4 + 0*2) / 6 = 40, above the lowered pass mark.
    assert!((reweighted["totals"]["average"].as_f64().unwrap() - 40.0).abs() < 1e-9);
    assert_eq!(reweighted["decision"], "Promoted");

    let _ = child.kill();
}
