use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::{CourseRow, GradeRow, StudentFeatures, StudentRecord};

/// How to treat a student whose rows disagree on `fullTime`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FullTimePolicy {
    /// Keep the value from the first row seen for the student and log a warning.
    #[default]
    FirstSeen,
    /// Abort the run.
    Reject,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed student document {key}: {source}")]
    MalformedRecord {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("student {student_id} has a non-finite grade in course {course:?}")]
    NonFiniteGrade { student_id: i64, course: String },
    #[error("student {student_id} has conflicting fullTime values")]
    InconsistentFullTime { student_id: i64 },
}

/// Running aggregate for one student partition.
#[derive(Debug, Clone)]
pub struct StudentGroup {
    pub grade_sum: f64,
    pub grade_count: usize,
    pub max_grade: f64,
    pub courses: BTreeSet<String>,
    pub full_time: bool,
    diverged: bool,
}

impl StudentGroup {
    fn start(row: &GradeRow) -> Self {
        Self {
            grade_sum: row.grade,
            grade_count: 1,
            max_grade: row.grade,
            courses: BTreeSet::from([row.course.clone()]),
            full_time: row.full_time,
            diverged: false,
        }
    }

    fn absorb(&mut self, row: &GradeRow) {
        self.grade_sum += row.grade;
        self.grade_count += 1;
        if row.grade > self.max_grade {
            self.max_grade = row.grade;
        }
        if !self.courses.contains(&row.course) {
            self.courses.insert(row.course.clone());
        }
    }
}

pub fn decode_record(key: &str, document: Value) -> Result<StudentRecord, PipelineError> {
    serde_json::from_value(document).map_err(|source| PipelineError::MalformedRecord {
        key: key.to_string(),
        source,
    })
}

/// Stage 1: one row per course, carrying the parent student context.
pub fn expand_courses(records: &[StudentRecord]) -> Vec<CourseRow<'_>> {
    records
        .iter()
        .flat_map(|record| {
            record.courses.iter().map(move |course| CourseRow {
                student_id: record.student_id,
                full_time: record.full_time,
                course,
            })
        })
        .collect()
}

/// Stage 2: one row per grade. Courses without grades drop out here.
pub fn expand_grades(rows: &[CourseRow<'_>]) -> Result<Vec<GradeRow>, PipelineError> {
    let mut expanded = Vec::with_capacity(rows.len());

    for row in rows {
        for &grade in &row.course.grades {
            if !grade.is_finite() {
                return Err(PipelineError::NonFiniteGrade {
                    student_id: row.student_id,
                    course: row.course.course.clone(),
                });
            }
            expanded.push(GradeRow {
                student_id: row.student_id,
                full_time: row.full_time,
                course: row.course.course.clone(),
                grade,
            });
        }
    }

    Ok(expanded)
}

/// Stage 3: partition by student and fold each partition into a `StudentGroup`.
pub fn group_by_student(
    rows: &[GradeRow],
    policy: FullTimePolicy,
) -> Result<BTreeMap<i64, StudentGroup>, PipelineError> {
    let mut groups: BTreeMap<i64, StudentGroup> = BTreeMap::new();

    for row in rows {
        let Some(group) = groups.get_mut(&row.student_id) else {
            groups.insert(row.student_id, StudentGroup::start(row));
            continue;
        };

        if group.full_time != row.full_time {
            match policy {
                FullTimePolicy::Reject => {
                    return Err(PipelineError::InconsistentFullTime {
                        student_id: row.student_id,
                    });
                }
                FullTimePolicy::FirstSeen if !group.diverged => {
                    warn!(
                        student_id = row.student_id,
                        kept = group.full_time,
                        "conflicting fullTime values, keeping first seen"
                    );
                    group.diverged = true;
                }
                FullTimePolicy::FirstSeen => {}
            }
        }

        group.absorb(row);
    }

    Ok(groups)
}

/// Stage 4: project each group into its output record, ordered by student id.
pub fn reshape(groups: BTreeMap<i64, StudentGroup>) -> Vec<StudentFeatures> {
    groups
        .into_iter()
        .map(|(student_id, group)| StudentFeatures {
            student_id,
            avg_grade: group.grade_sum / group.grade_count as f64,
            max_grade: group.max_grade,
            num_courses: group.courses.len(),
            full_time: group.full_time,
        })
        .collect()
}

/// Distinct student ids present in the source, sorted.
pub fn source_student_ids(records: &[StudentRecord]) -> Vec<i64> {
    records
        .iter()
        .map(|record| record.student_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Stages 1 through 4. Nothing is written; the caller hands the result to a store.
pub fn compute_features(
    records: &[StudentRecord],
    policy: FullTimePolicy,
) -> Result<Vec<StudentFeatures>, PipelineError> {
    let course_rows = expand_courses(records);
    let grade_rows = expand_grades(&course_rows)?;
    debug!(
        records = records.len(),
        course_rows = course_rows.len(),
        grade_rows = grade_rows.len(),
        "flattened raw documents"
    );

    let groups = group_by_student(&grade_rows, policy)?;
    let features = reshape(groups);

    let dropped = source_student_ids(records)
        .len()
        .saturating_sub(features.len());
    if dropped > 0 {
        debug!(dropped, "students without any grades produce no features");
    }

    Ok(features)
}
