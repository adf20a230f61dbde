use serde::Serialize;
use std::collections::HashMap;

pub const DEFAULT_PASS_MARK: f64 = 50.0;

/// Half-up rounding to 2 decimals. Applied at presentation boundaries only;
/// accumulation stays full precision.
pub fn round2(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

/// Half-up rounding to a whole number, used for grade-band lookup.
pub fn round_whole(x: f64) -> i64 {
    (x + 0.5).floor() as i64
}

/// Grading policy for a classroom, derived once from its level code and
/// threaded explicitly through every calculator call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradingPolicy {
    /// Lower forms (F1-F4): a configured assessment with no score counts as
    /// zero; the full configured weight is the denominator.
    Standard,
    /// Upper forms (F5/L6/U6): only scored assessments carry weight; a
    /// subject with no score at all drops out of the average entirely.
    Renormalized,
}

impl GradingPolicy {
    /// The one level-code predicate. Nothing else in the crate is allowed to
    /// decide STANDARD vs RENORMALIZED.
    pub fn for_level_code(code: &str) -> GradingPolicy {
        match code.trim().to_ascii_uppercase().as_str() {
            "F5" | "L6" | "U6" => GradingPolicy::Renormalized,
            _ => GradingPolicy::Standard,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GradingPolicy::Standard => "standard",
            GradingPolicy::Renormalized => "renormalized",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

/// One configured assessment for a subject/term, with the weight carried by
/// its type (CA1, CA2, ...).
#[derive(Debug, Clone)]
pub struct AssessmentSlot {
    pub assessment_id: String,
    pub type_code: String,
    pub weight: f64,
}

/// A subject as taught in one classroom: class-level coefficient plus the
/// term's configured assessment slots.
#[derive(Debug, Clone)]
pub struct SubjectRow {
    pub class_subject_id: String,
    pub subject_code: String,
    pub subject_name: String,
    pub coefficient: f64,
    pub slots: Vec<AssessmentSlot>,
}

/// One student's selection of a class subject, with the raw scores recorded
/// for this term keyed by assessment id.
#[derive(Debug, Clone)]
pub struct EnrollmentSubjectRow {
    pub class_subject_id: String,
    pub coef_override: Option<f64>,
    pub scores: HashMap<String, f64>,
}

#[derive(Debug, Clone)]
pub struct StudentRow {
    pub enrollment_id: String,
    pub student_id: String,
    pub matricule: String,
    pub display_name: String,
    pub subjects: Vec<EnrollmentSubjectRow>,
}

/// Complete read-only input for one classroom/term. Students are ordered by
/// (last name, first name); subjects by subject name. Only active
/// enrollments and selected subjects are present.
#[derive(Debug, Clone)]
pub struct ClassTermSnapshot {
    pub policy: GradingPolicy,
    pub subjects: Vec<SubjectRow>,
    pub students: Vec<StudentRow>,
}

pub fn effective_coefficient(default_coef: f64, coef_override: Option<f64>) -> f64 {
    coef_override.unwrap_or(default_coef)
}

/// Normalized 0-100 mark for one (student, subject, term), or None when the
/// subject does not participate in averaging at all.
///
/// STANDARD: denominator is the full configured weight, so missing scores
/// drag the mark down; an unconfigured subject (no slots) is excluded.
/// RENORMALIZED: denominator is the weight of scored slots only; a subject
/// with no score is excluded rather than zeroed.
///
/// A zero denominator is a defined zero result, never an error.
pub fn subject_term_mark(
    slots: &[AssessmentSlot],
    scores: &HashMap<String, f64>,
    policy: GradingPolicy,
) -> Option<f64> {
    if slots.is_empty() {
        return None;
    }

    let mut numerator = 0.0_f64;
    let mut present_weight = 0.0_f64;
    let mut full_weight = 0.0_f64;
    for slot in slots {
        full_weight += slot.weight;
        if let Some(value) = scores.get(&slot.assessment_id) {
            numerator += value * slot.weight;
            present_weight += slot.weight;
        }
    }

    match policy {
        GradingPolicy::Renormalized => {
            if present_weight > 0.0 {
                Some(numerator / present_weight)
            } else {
                None
            }
        }
        GradingPolicy::Standard => {
            if full_weight > 0.0 {
                Some(numerator / full_weight)
            } else {
                Some(0.0)
            }
        }
    }
}

/// One subject's contribution to a student average.
#[derive(Debug, Clone, Copy)]
pub struct AverageLine {
    pub coefficient: f64,
    pub mark: Option<f64>,
}

/// Coefficient-weighted average over the lines that produced a mark.
/// Subjects whose mark is None are excluded from both sides of the division;
/// the STANDARD missing-counts-as-zero rule arrives here as Some(0.0) from
/// `subject_term_mark`. Unrounded; callers round at the boundary.
pub fn student_average(lines: &[AverageLine]) -> f64 {
    let mut weighted = 0.0_f64;
    let mut coef_sum = 0.0_f64;
    for line in lines {
        if let Some(mark) = line.mark {
            weighted += mark * line.coefficient;
            coef_sum += line.coefficient;
        }
    }
    if coef_sum > 0.0 {
        weighted / coef_sum
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAverageRow {
    pub enrollment_id: String,
    pub student_id: String,
    pub matricule: String,
    pub student_name: String,
    pub average: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAverageRow {
    pub class_subject_id: String,
    pub subject_code: String,
    pub subject_name: String,
    pub average: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionBucket {
    pub range: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStats {
    pub count_students: usize,
    pub class_average: f64,
    pub pass_rate: f64,
    pub completion_rate: f64,
    pub top_students: Vec<StudentAverageRow>,
    pub per_subject: Vec<SubjectAverageRow>,
    pub distribution: Vec<DistributionBucket>,
    pub students: Vec<StudentAverageRow>,
}

fn distribution_bucket(average: f64) -> usize {
    let clamped = average.clamp(0.0, 100.0);
    // 100 lands in the 90-100 bucket, not an 11th one.
    ((clamped / 10.0).floor() as usize).min(9)
}

/// KPI bundle for one classroom/term.
pub fn class_stats(snapshot: &ClassTermSnapshot, pass_mark: f64) -> ClassStats {
    let subject_by_id: HashMap<&str, &SubjectRow> = snapshot
        .subjects
        .iter()
        .map(|s| (s.class_subject_id.as_str(), s))
        .collect();

    let mut students: Vec<StudentAverageRow> = Vec::with_capacity(snapshot.students.len());
    let mut marks_by_subject: HashMap<&str, Vec<Option<f64>>> = HashMap::new();
    let mut expected_slots = 0_usize;
    let mut recorded_scores = 0_usize;

    for student in &snapshot.students {
        let mut lines: Vec<AverageLine> = Vec::with_capacity(student.subjects.len());
        for es in &student.subjects {
            let Some(subject) = subject_by_id.get(es.class_subject_id.as_str()) else {
                continue;
            };
            let mark = subject_term_mark(&subject.slots, &es.scores, snapshot.policy);
            lines.push(AverageLine {
                coefficient: effective_coefficient(subject.coefficient, es.coef_override),
                mark,
            });
            marks_by_subject
                .entry(subject.class_subject_id.as_str())
                .or_default()
                .push(mark);
            expected_slots += subject.slots.len();
            recorded_scores += es.scores.len();
        }
        students.push(StudentAverageRow {
            enrollment_id: student.enrollment_id.clone(),
            student_id: student.student_id.clone(),
            matricule: student.matricule.clone(),
            student_name: student.display_name.clone(),
            average: round2(student_average(&lines)),
        });
    }

    let count_students = students.len();
    let class_average = if count_students > 0 {
        round2(students.iter().map(|s| s.average).sum::<f64>() / count_students as f64)
    } else {
        0.0
    };
    let pass_rate = if count_students > 0 {
        let passed = students.iter().filter(|s| s.average >= pass_mark).count();
        round2(passed as f64 / count_students as f64 * 100.0)
    } else {
        0.0
    };
    let completion_rate = if expected_slots > 0 {
        round2(recorded_scores as f64 / expected_slots as f64 * 100.0)
    } else {
        0.0
    };

    let mut per_subject: Vec<SubjectAverageRow> = Vec::new();
    for subject in &snapshot.subjects {
        let Some(marks) = marks_by_subject.get(subject.class_subject_id.as_str()) else {
            continue;
        };
        let values: Vec<f64> = match snapshot.policy {
            // Only students who actually have a mark enter the mean.
            GradingPolicy::Renormalized => marks.iter().filter_map(|m| *m).collect(),
            // Every selected student counts, scoreless ones as zero.
            GradingPolicy::Standard => marks.iter().map(|m| m.unwrap_or(0.0)).collect(),
        };
        let average = if values.is_empty() {
            0.0
        } else {
            round2(values.iter().sum::<f64>() / values.len() as f64)
        };
        per_subject.push(SubjectAverageRow {
            class_subject_id: subject.class_subject_id.clone(),
            subject_code: subject.subject_code.clone(),
            subject_name: subject.subject_name.clone(),
            average,
        });
    }
    per_subject.sort_by(|a, b| a.subject_name.cmp(&b.subject_name));

    let mut distribution: Vec<DistributionBucket> = (0..10)
        .map(|i| DistributionBucket {
            range: format!("{}-{}", i * 10, (i + 1) * 10),
            count: 0,
        })
        .collect();
    for s in &students {
        distribution[distribution_bucket(s.average)].count += 1;
    }

    let mut top_students = students.clone();
    top_students
        .sort_by(|a, b| b.average.partial_cmp(&a.average).unwrap_or(std::cmp::Ordering::Equal));
    top_students.truncate(3);

    ClassStats {
        count_students,
        class_average,
        pass_rate,
        completion_rate,
        top_students,
        per_subject,
        distribution,
        students,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankSummary {
    pub count: usize,
    pub class_average: f64,
    #[serde(skip_serializing)]
    pub rank_by_id: HashMap<String, usize>,
}

/// Standard competition ranking: tied averages share a rank and the next
/// distinct value skips by the tie-group size ([90,90,80] -> [1,1,3]).
///
/// Grouping happens on the 2-decimal rounded value (as centi-mark integers),
/// so two students with the same displayed average always share a rank and
/// the result does not depend on input order.
pub fn competition_ranks(averages: &[(String, f64)]) -> RankSummary {
    let mut pairs: Vec<(&str, i64)> = averages
        .iter()
        .map(|(id, avg)| (id.as_str(), (round2(*avg) * 100.0).round() as i64))
        .collect();
    pairs.sort_by(|a, b| b.1.cmp(&a.1));

    let mut rank_by_id: HashMap<String, usize> = HashMap::with_capacity(pairs.len());
    let mut current_rank = 0_usize;
    let mut prev_centi: Option<i64> = None;
    for (position, (id, centi)) in pairs.iter().enumerate() {
        if prev_centi != Some(*centi) {
            current_rank = position + 1;
            prev_centi = Some(*centi);
        }
        rank_by_id.insert((*id).to_string(), current_rank);
    }

    let count = averages.len();
    let class_average = if count > 0 {
        round2(averages.iter().map(|(_, avg)| round2(*avg)).sum::<f64>() / count as f64)
    } else {
        0.0
    };

    RankSummary {
        count,
        class_average,
        rank_by_id,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    pub letter: String,
    pub min_mark: i64,
    pub max_mark: i64,
    pub gpa: f64,
}

/// Letter for a mark, from the first band (ascending min_mark) whose
/// inclusive range contains the half-up rounded whole mark. Missing or
/// gapped scales resolve to None; grading never blocks on display metadata.
pub fn grade_letter<'a>(mark: f64, bands: &'a [GradeBand]) -> Option<&'a str> {
    let whole = round_whole(mark);
    let mut ordered: Vec<&GradeBand> = bands.iter().collect();
    ordered.sort_by_key(|b| b.min_mark);
    ordered
        .into_iter()
        .find(|b| b.min_mark <= whole && whole <= b.max_mark)
        .map(|b| b.letter.as_str())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaEntry {
    pub code: String,
    pub weight: f64,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectLine {
    pub class_subject_id: String,
    pub subject_code: String,
    pub subject_name: String,
    pub coefficient: f64,
    pub ca: Vec<CaEntry>,
    pub mark: Option<f64>,
    pub weighted: Option<f64>,
    pub grade: String,
    pub included_in_average: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentTermComputation {
    pub lines: Vec<SubjectLine>,
    pub coefficient_sum: f64,
    pub weighted_total: f64,
    pub average: f64,
    pub grade: String,
}

/// Full per-subject breakdown for one student's term report card.
pub fn student_term_lines(
    subjects: &[SubjectRow],
    enrollment_subjects: &[EnrollmentSubjectRow],
    policy: GradingPolicy,
    bands: &[GradeBand],
) -> StudentTermComputation {
    let es_by_cs: HashMap<&str, &EnrollmentSubjectRow> = enrollment_subjects
        .iter()
        .map(|es| (es.class_subject_id.as_str(), es))
        .collect();

    let mut lines: Vec<SubjectLine> = Vec::new();
    let mut weighted_total = 0.0_f64;
    let mut coefficient_sum = 0.0_f64;

    for subject in subjects {
        let Some(es) = es_by_cs.get(subject.class_subject_id.as_str()) else {
            continue;
        };
        if subject.slots.is_empty() {
            // No assessment configured for this subject/term; nothing to report.
            continue;
        }

        let mark = subject_term_mark(&subject.slots, &es.scores, policy);
        let coefficient = effective_coefficient(subject.coefficient, es.coef_override);

        let mut ca: Vec<CaEntry> = subject
            .slots
            .iter()
            .map(|slot| CaEntry {
                code: slot.type_code.clone(),
                weight: slot.weight,
                value: es.scores.get(&slot.assessment_id).copied(),
            })
            .collect();
        ca.sort_by(|a, b| a.code.cmp(&b.code));

        let included_in_average = mark.is_some();
        if let Some(m) = mark {
            weighted_total += m * coefficient;
            coefficient_sum += coefficient;
        }

        lines.push(SubjectLine {
            class_subject_id: subject.class_subject_id.clone(),
            subject_code: subject.subject_code.clone(),
            subject_name: subject.subject_name.clone(),
            coefficient,
            ca,
            mark: mark.map(round2),
            weighted: mark.map(|m| round2(m * coefficient)),
            grade: mark
                .and_then(|m| grade_letter(m, bands))
                .unwrap_or("")
                .to_string(),
            included_in_average,
        });
    }

    let average = round2(if coefficient_sum > 0.0 {
        weighted_total / coefficient_sum
    } else {
        0.0
    });

    StudentTermComputation {
        lines,
        coefficient_sum,
        weighted_total: round2(weighted_total),
        average,
        grade: grade_letter(average, bands).unwrap_or("").to_string(),
    }
}

/// Term weights and the promotion threshold for annual aggregation. Passed
/// in explicitly so callers and tests can vary them without shared state.
#[derive(Debug, Clone)]
pub struct AnnualConfig {
    /// (term index, weight), one entry per configured term of the year.
    pub term_weights: Vec<(i64, f64)>,
    pub pass_mark: f64,
}

impl AnnualConfig {
    /// Equal weight 1 per term, pass mark 50.
    pub fn equal_weights(term_indexes: &[i64]) -> Self {
        Self {
            term_weights: term_indexes.iter().map(|i| (*i, 1.0)).collect(),
            pass_mark: DEFAULT_PASS_MARK,
        }
    }
}

/// Per-term subject marks for one student/subject, as produced by
/// `subject_term_mark` once per term.
#[derive(Debug, Clone)]
pub struct AnnualSubjectInput {
    pub class_subject_id: String,
    pub subject_code: String,
    pub subject_name: String,
    pub coefficient: f64,
    pub term_marks: Vec<(i64, Option<f64>)>,
}

/// Annual mark for one subject across the year's terms, or None when the
/// subject never participates.
///
/// RENORMALIZED skips markless terms (neither numerator nor weight);
/// STANDARD zero-fills them with full weight. A subject with no mark in any
/// term is excluded under both policies.
pub fn annual_subject_mark(
    term_marks: &[(i64, Option<f64>)],
    config: &AnnualConfig,
    policy: GradingPolicy,
) -> Option<f64> {
    if term_marks.iter().all(|(_, mark)| mark.is_none()) {
        return None;
    }

    let mut numerator = 0.0_f64;
    let mut weight_sum = 0.0_f64;
    for (term_index, weight) in &config.term_weights {
        let mark = term_marks
            .iter()
            .find(|(idx, _)| idx == term_index)
            .and_then(|(_, mark)| *mark);
        match policy {
            GradingPolicy::Renormalized => {
                if let Some(m) = mark {
                    numerator += m * weight;
                    weight_sum += weight;
                }
            }
            GradingPolicy::Standard => {
                numerator += mark.unwrap_or(0.0) * weight;
                weight_sum += weight;
            }
        }
    }

    if weight_sum > 0.0 {
        Some(numerator / weight_sum)
    } else {
        match policy {
            GradingPolicy::Standard => Some(0.0),
            GradingPolicy::Renormalized => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Decision {
    Promoted,
    Repeat,
}

impl Decision {
    pub fn from_average(average: f64, pass_mark: f64) -> Decision {
        if average >= pass_mark {
            Decision::Promoted
        } else {
            Decision::Repeat
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnualTermMark {
    pub term: i64,
    pub mark: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnualSubjectRow {
    pub class_subject_id: String,
    pub subject_code: String,
    pub subject_name: String,
    pub coefficient: f64,
    pub term_marks: Vec<AnnualTermMark>,
    pub annual_mark: Option<f64>,
    pub grade: String,
    pub included_in_average: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnualSummary {
    pub subjects: Vec<AnnualSubjectRow>,
    pub coefficient_sum: f64,
    pub weighted_total: f64,
    pub annual_average: f64,
    pub grade: String,
    pub decision: Decision,
}

/// Annual payload for one student: per-subject annual marks, overall annual
/// average, and the promotion decision.
pub fn annual_for_student(
    subjects: &[AnnualSubjectInput],
    config: &AnnualConfig,
    policy: GradingPolicy,
    bands: &[GradeBand],
) -> AnnualSummary {
    let mut rows: Vec<AnnualSubjectRow> = Vec::with_capacity(subjects.len());
    let mut weighted_total = 0.0_f64;
    let mut coefficient_sum = 0.0_f64;

    for subject in subjects {
        let annual_mark = annual_subject_mark(&subject.term_marks, config, policy);
        if let Some(m) = annual_mark {
            weighted_total += m * subject.coefficient;
            coefficient_sum += subject.coefficient;
        }
        rows.push(AnnualSubjectRow {
            class_subject_id: subject.class_subject_id.clone(),
            subject_code: subject.subject_code.clone(),
            subject_name: subject.subject_name.clone(),
            coefficient: subject.coefficient,
            term_marks: subject
                .term_marks
                .iter()
                .map(|(term, mark)| AnnualTermMark {
                    term: *term,
                    mark: mark.map(round2),
                })
                .collect(),
            annual_mark: annual_mark.map(round2),
            grade: annual_mark
                .and_then(|m| grade_letter(m, bands))
                .unwrap_or("")
                .to_string(),
            included_in_average: annual_mark.is_some(),
        });
    }

    let annual_average = round2(if coefficient_sum > 0.0 {
        weighted_total / coefficient_sum
    } else {
        0.0
    });

    AnnualSummary {
        subjects: rows,
        coefficient_sum,
        weighted_total: round2(weighted_total),
        annual_average,
        grade: grade_letter(annual_average, bands).unwrap_or("").to_string(),
        decision: Decision::from_average(annual_average, config.pass_mark),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(id: &str, code: &str, weight: f64) -> AssessmentSlot {
        AssessmentSlot {
            assessment_id: id.to_string(),
            type_code: code.to_string(),
            weight,
        }
    }

    fn scores(pairs: &[(&str, f64)]) -> HashMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn default_bands() -> Vec<GradeBand> {
        [
            ("A", 80, 100, 4.0),
            ("B", 70, 79, 3.0),
            ("C", 60, 69, 2.0),
            ("D", 50, 59, 1.0),
            ("E", 40, 49, 0.5),
            ("F", 0, 39, 0.0),
        ]
        .iter()
        .map(|(letter, lo, hi, gpa)| GradeBand {
            letter: letter.to_string(),
            min_mark: *lo,
            max_mark: *hi,
            gpa: *gpa,
        })
        .collect()
    }

    #[test]
    fn round2_is_half_up() {
        assert_eq!(round2(73.333333), 73.33);
        assert_eq!(round2(73.336), 73.34);
        assert_eq!(round2(0.125), 0.13);
        assert_eq!(round2(0.0), 0.0);
    }

    #[test]
    fn policy_predicate_covers_all_levels() {
        for code in ["F1", "F2", "F3", "F4"] {
            assert_eq!(GradingPolicy::for_level_code(code), GradingPolicy::Standard);
        }
        for code in ["F5", "L6", "U6", "f5", " l6 "] {
            assert_eq!(
                GradingPolicy::for_level_code(code),
                GradingPolicy::Renormalized
            );
        }
    }

    #[test]
    fn subject_mark_standard_counts_missing_as_zero() {
        let slots = vec![slot("a1", "CA1", 50.0), slot("a2", "CA2", 50.0)];
        let sc = scores(&[("a1", 80.0)]);
        // 80*50 / 100 = 40: the missing CA2 inflates the denominator.
        let mark = subject_term_mark(&slots, &sc, GradingPolicy::Standard).unwrap();
        assert!((mark - 40.0).abs() < 1e-9);
    }

    #[test]
    fn subject_mark_renormalized_uses_present_weights() {
        let slots = vec![slot("a1", "CA1", 50.0), slot("a2", "CA2", 50.0)];
        let sc = scores(&[("a1", 80.0)]);
        let mark = subject_term_mark(&slots, &sc, GradingPolicy::Renormalized).unwrap();
        assert!((mark - 80.0).abs() < 1e-9);
    }

    #[test]
    fn subject_mark_absent_cases() {
        let slots = vec![slot("a1", "CA1", 50.0)];
        let empty = scores(&[]);
        // Renormalized with no score: subject drops out.
        assert_eq!(
            subject_term_mark(&slots, &empty, GradingPolicy::Renormalized),
            None
        );
        // Standard with no score: zero, still counted.
        assert_eq!(
            subject_term_mark(&slots, &empty, GradingPolicy::Standard),
            Some(0.0)
        );
        // No slot configured at all: excluded under both policies.
        assert_eq!(subject_term_mark(&[], &empty, GradingPolicy::Standard), None);
        assert_eq!(
            subject_term_mark(&[], &empty, GradingPolicy::Renormalized),
            None
        );
    }

    #[test]
    fn subject_mark_stays_in_range() {
        let slots = vec![
            slot("a1", "CA1", 30.0),
            slot("a2", "CA2", 50.0),
            slot("a3", "EXAM", 20.0),
        ];
        let sc = scores(&[("a1", 100.0), ("a2", 100.0), ("a3", 100.0)]);
        for policy in [GradingPolicy::Standard, GradingPolicy::Renormalized] {
            let mark = subject_term_mark(&slots, &sc, policy).unwrap();
            assert!((0.0..=100.0).contains(&mark));
        }
        let partial = scores(&[("a2", 100.0)]);
        for policy in [GradingPolicy::Standard, GradingPolicy::Renormalized] {
            let mark = subject_term_mark(&slots, &partial, policy).unwrap();
            assert!((0.0..=100.0).contains(&mark), "{policy:?}: {mark}");
        }
    }

    #[test]
    fn student_average_weighted_by_coefficient() {
        // Math coef 4 mark 80, English coef 2 mark 60 -> (320+120)/6 = 73.33.
        let lines = [
            AverageLine {
                coefficient: 4.0,
                mark: Some(80.0),
            },
            AverageLine {
                coefficient: 2.0,
                mark: Some(60.0),
            },
        ];
        assert_eq!(round2(student_average(&lines)), 73.33);
    }

    #[test]
    fn student_average_skips_absent_subjects() {
        // Renormalized: English has no score, so only Math's coefficient counts.
        let lines = [
            AverageLine {
                coefficient: 4.0,
                mark: Some(80.0),
            },
            AverageLine {
                coefficient: 2.0,
                mark: None,
            },
        ];
        assert_eq!(round2(student_average(&lines)), 80.0);
    }

    #[test]
    fn student_average_zero_when_no_contributing_subject() {
        assert_eq!(student_average(&[]), 0.0);
        let lines = [AverageLine {
            coefficient: 3.0,
            mark: None,
        }];
        assert_eq!(student_average(&lines), 0.0);
    }

    #[test]
    fn competition_ranks_share_and_skip() {
        let input = vec![
            ("a".to_string(), 90.0),
            ("b".to_string(), 90.0),
            ("c".to_string(), 80.0),
        ];
        let ranks = competition_ranks(&input);
        assert_eq!(ranks.rank_by_id["a"], 1);
        assert_eq!(ranks.rank_by_id["b"], 1);
        assert_eq!(ranks.rank_by_id["c"], 3);

        let input = vec![
            ("a".to_string(), 70.0),
            ("b".to_string(), 70.0),
            ("c".to_string(), 70.0),
            ("d".to_string(), 60.0),
        ];
        let ranks = competition_ranks(&input);
        assert_eq!(ranks.rank_by_id["a"], 1);
        assert_eq!(ranks.rank_by_id["b"], 1);
        assert_eq!(ranks.rank_by_id["c"], 1);
        assert_eq!(ranks.rank_by_id["d"], 4);
        assert_eq!(ranks.count, 4);
    }

    #[test]
    fn competition_ranks_are_order_independent() {
        let forward = vec![
            ("a".to_string(), 55.25),
            ("b".to_string(), 71.5),
            ("c".to_string(), 55.25),
            ("d".to_string(), 90.0),
        ];
        let mut reversed = forward.clone();
        reversed.reverse();
        let r1 = competition_ranks(&forward);
        let r2 = competition_ranks(&reversed);
        assert_eq!(r1.rank_by_id, r2.rank_by_id);
        assert_eq!(r1.class_average, r2.class_average);
    }

    #[test]
    fn competition_ranks_group_on_rounded_value() {
        // 70.004 and 69.996 both display as 70.00 and must share a rank.
        let input = vec![
            ("a".to_string(), 70.004),
            ("b".to_string(), 69.996),
            ("c".to_string(), 50.0),
        ];
        let ranks = competition_ranks(&input);
        assert_eq!(ranks.rank_by_id["a"], ranks.rank_by_id["b"]);
        assert_eq!(ranks.rank_by_id["c"], 3);
    }

    #[test]
    fn competition_ranks_empty_input() {
        let ranks = competition_ranks(&[]);
        assert_eq!(ranks.count, 0);
        assert_eq!(ranks.class_average, 0.0);
        assert!(ranks.rank_by_id.is_empty());
    }

    #[test]
    fn grade_letter_band_lookup() {
        let bands = default_bands();
        assert_eq!(grade_letter(85.0, &bands), Some("A"));
        assert_eq!(grade_letter(79.5, &bands), Some("A")); // rounds half-up to 80
        assert_eq!(grade_letter(79.49, &bands), Some("B"));
        assert_eq!(grade_letter(0.0, &bands), Some("F"));
        assert_eq!(grade_letter(100.0, &bands), Some("A"));
        assert_eq!(grade_letter(50.0, &[]), None);
    }

    fn snapshot_for(policy: GradingPolicy) -> ClassTermSnapshot {
        let subjects = vec![
            SubjectRow {
                class_subject_id: "cs-math".to_string(),
                subject_code: "MATH".to_string(),
                subject_name: "Mathematics".to_string(),
                coefficient: 4.0,
                slots: vec![slot("m1", "CA1", 50.0), slot("m2", "CA2", 50.0)],
            },
            SubjectRow {
                class_subject_id: "cs-eng".to_string(),
                subject_code: "ENG".to_string(),
                subject_name: "English".to_string(),
                coefficient: 2.0,
                slots: vec![slot("e1", "CA1", 50.0), slot("e2", "CA2", 50.0)],
            },
        ];
        let students = vec![
            StudentRow {
                enrollment_id: "en-1".to_string(),
                student_id: "st-1".to_string(),
                matricule: "S001".to_string(),
                display_name: "Abanda Marie".to_string(),
                subjects: vec![
                    EnrollmentSubjectRow {
                        class_subject_id: "cs-math".to_string(),
                        coef_override: None,
                        scores: scores(&[("m1", 80.0), ("m2", 80.0)]),
                    },
                    EnrollmentSubjectRow {
                        class_subject_id: "cs-eng".to_string(),
                        coef_override: None,
                        scores: scores(&[("e1", 60.0), ("e2", 60.0)]),
                    },
                ],
            },
            StudentRow {
                enrollment_id: "en-2".to_string(),
                student_id: "st-2".to_string(),
                matricule: "S002".to_string(),
                display_name: "Biya Paul".to_string(),
                subjects: vec![
                    EnrollmentSubjectRow {
                        class_subject_id: "cs-math".to_string(),
                        coef_override: None,
                        scores: scores(&[("m1", 40.0), ("m2", 50.0)]),
                    },
                    EnrollmentSubjectRow {
                        class_subject_id: "cs-eng".to_string(),
                        coef_override: None,
                        scores: scores(&[]),
                    },
                ],
            },
        ];
        ClassTermSnapshot {
            policy,
            subjects,
            students,
        }
    }

    #[test]
    fn class_stats_standard_counts_scoreless_subject() {
        let stats = class_stats(&snapshot_for(GradingPolicy::Standard), DEFAULT_PASS_MARK);
        assert_eq!(stats.count_students, 2);
        // Student 1: (80*4 + 60*2)/6 = 73.33.
        assert_eq!(stats.students[0].average, 73.33);
        // Student 2: math 45, english counted as 0 -> 45*4/6 = 30.
        assert_eq!(stats.students[1].average, 30.0);
        assert_eq!(stats.pass_rate, 50.0);
        // 6 of 8 expected slots carry a score.
        assert_eq!(stats.completion_rate, 75.0);
    }

    #[test]
    fn class_stats_renormalized_excludes_scoreless_subject() {
        let stats = class_stats(&snapshot_for(GradingPolicy::Renormalized), DEFAULT_PASS_MARK);
        // Student 2: english excluded, average is the math mark alone.
        assert_eq!(stats.students[1].average, 45.0);
        // English subject mean over marked students only.
        let english = stats
            .per_subject
            .iter()
            .find(|s| s.subject_code == "ENG")
            .unwrap();
        assert_eq!(english.average, 60.0);
    }

    #[test]
    fn class_stats_class_average_matches_reported_rows() {
        let stats = class_stats(&snapshot_for(GradingPolicy::Standard), DEFAULT_PASS_MARK);
        let mean =
            stats.students.iter().map(|s| s.average).sum::<f64>() / stats.students.len() as f64;
        assert_eq!(stats.class_average, round2(mean));
    }

    #[test]
    fn class_stats_empty_class_is_all_zeros() {
        let snapshot = ClassTermSnapshot {
            policy: GradingPolicy::Standard,
            subjects: Vec::new(),
            students: Vec::new(),
        };
        let stats = class_stats(&snapshot, DEFAULT_PASS_MARK);
        assert_eq!(stats.count_students, 0);
        assert_eq!(stats.class_average, 0.0);
        assert_eq!(stats.pass_rate, 0.0);
        assert_eq!(stats.completion_rate, 0.0);
        assert!(stats.top_students.is_empty());
    }

    #[test]
    fn distribution_puts_100_in_last_bucket() {
        let mut snapshot = snapshot_for(GradingPolicy::Standard);
        snapshot.students.truncate(1);
        snapshot.students[0].subjects = vec![
            EnrollmentSubjectRow {
                class_subject_id: "cs-math".to_string(),
                coef_override: None,
                scores: scores(&[("m1", 100.0), ("m2", 100.0)]),
            },
            EnrollmentSubjectRow {
                class_subject_id: "cs-eng".to_string(),
                coef_override: None,
                scores: scores(&[("e1", 100.0), ("e2", 100.0)]),
            },
        ];
        let stats = class_stats(&snapshot, DEFAULT_PASS_MARK);
        assert_eq!(stats.students[0].average, 100.0);
        assert_eq!(stats.distribution.len(), 10);
        assert_eq!(stats.distribution[9].count, 1);
        assert_eq!(stats.distribution.iter().map(|b| b.count).sum::<usize>(), 1);
    }

    #[test]
    fn coef_override_replaces_class_default() {
        assert_eq!(effective_coefficient(4.0, None), 4.0);
        assert_eq!(effective_coefficient(4.0, Some(2.0)), 2.0);
    }

    #[test]
    fn student_term_lines_report_detail() {
        let snapshot = snapshot_for(GradingPolicy::Standard);
        let computed = student_term_lines(
            &snapshot.subjects,
            &snapshot.students[0].subjects,
            snapshot.policy,
            &default_bands(),
        );
        assert_eq!(computed.average, 73.33);
        assert_eq!(computed.grade, "B");
        assert_eq!(computed.coefficient_sum, 6.0);
        let math = computed
            .lines
            .iter()
            .find(|l| l.subject_code == "MATH")
            .unwrap();
        assert_eq!(math.mark, Some(80.0));
        assert_eq!(math.weighted, Some(320.0));
        assert_eq!(math.grade, "A");
        assert_eq!(math.ca.len(), 2);
        assert_eq!(math.ca[0].code, "CA1");
    }

    fn annual_input(term_marks: Vec<(i64, Option<f64>)>) -> AnnualSubjectInput {
        AnnualSubjectInput {
            class_subject_id: "cs-math".to_string(),
            subject_code: "MATH".to_string(),
            subject_name: "Mathematics".to_string(),
            coefficient: 4.0,
            term_marks,
        }
    }

    #[test]
    fn annual_subject_mark_standard_zero_fills_missing_terms() {
        let config = AnnualConfig::equal_weights(&[1, 2, 3]);
        let marks = vec![(1, Some(60.0)), (2, None), (3, Some(90.0))];
        let mark = annual_subject_mark(&marks, &config, GradingPolicy::Standard).unwrap();
        assert!((mark - 50.0).abs() < 1e-9);
    }

    #[test]
    fn annual_subject_mark_renormalized_skips_missing_terms() {
        let config = AnnualConfig::equal_weights(&[1, 2, 3]);
        let marks = vec![(1, Some(60.0)), (2, None), (3, Some(90.0))];
        let mark = annual_subject_mark(&marks, &config, GradingPolicy::Renormalized).unwrap();
        assert!((mark - 75.0).abs() < 1e-9);
    }

    #[test]
    fn annual_subject_mark_absent_when_no_term_contributes() {
        let config = AnnualConfig::equal_weights(&[1, 2, 3]);
        let marks = vec![(1, None), (2, None), (3, None)];
        assert_eq!(
            annual_subject_mark(&marks, &config, GradingPolicy::Renormalized),
            None
        );
        assert_eq!(
            annual_subject_mark(&marks, &config, GradingPolicy::Standard),
            None
        );
    }

    #[test]
    fn annual_subject_mark_honors_term_weights() {
        let config = AnnualConfig {
            term_weights: vec![(1, 1.0), (2, 1.0), (3, 2.0)],
            pass_mark: DEFAULT_PASS_MARK,
        };
        let marks = vec![(1, Some(40.0)), (2, Some(60.0)), (3, Some(80.0))];
        let mark = annual_subject_mark(&marks, &config, GradingPolicy::Standard).unwrap();
        // (40 + 60 + 160) / 4 = 65.
        assert!((mark - 65.0).abs() < 1e-9);
    }

    #[test]
    fn annual_summary_decision_threshold() {
        let config = AnnualConfig::equal_weights(&[1, 2, 3]);
        let bands = default_bands();

        let passing = vec![annual_input(vec![
            (1, Some(50.0)),
            (2, Some(50.0)),
            (3, Some(50.0)),
        ])];
        let summary = annual_for_student(&passing, &config, GradingPolicy::Standard, &bands);
        assert_eq!(summary.annual_average, 50.0);
        assert_eq!(summary.decision, Decision::Promoted);

        let failing = vec![annual_input(vec![
            (1, Some(49.0)),
            (2, Some(50.0)),
            (3, Some(50.0)),
        ])];
        let summary = annual_for_student(&failing, &config, GradingPolicy::Standard, &bands);
        assert_eq!(summary.decision, Decision::Repeat);
    }

    #[test]
    fn annual_summary_renormalized_excludes_empty_subject() {
        let config = AnnualConfig::equal_weights(&[1, 2, 3]);
        let bands = default_bands();
        let subjects = vec![
            annual_input(vec![(1, Some(80.0)), (2, Some(80.0)), (3, Some(80.0))]),
            AnnualSubjectInput {
                class_subject_id: "cs-eng".to_string(),
                subject_code: "ENG".to_string(),
                subject_name: "English".to_string(),
                coefficient: 2.0,
                term_marks: vec![(1, None), (2, None), (3, None)],
            },
        ];
        let summary = annual_for_student(&subjects, &config, GradingPolicy::Renormalized, &bands);
        assert_eq!(summary.coefficient_sum, 4.0);
        assert_eq!(summary.annual_average, 80.0);
        assert!(!summary.subjects[1].included_in_average);
    }
}
