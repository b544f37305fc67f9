use serde::{Deserialize, Serialize};

/// Raw per-student document as stored in the source table.
#[derive(Debug, Clone, Deserialize)]
pub struct StudentRecord {
    pub student_id: i64,
    #[serde(rename = "fullTime")]
    pub full_time: bool,
    #[serde(default)]
    pub courses: Vec<Course>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Course {
    pub course: String,
    #[serde(default)]
    pub grades: Vec<f64>,
}

/// One (student, course) pair after the courses array is flattened.
#[derive(Debug, Clone)]
pub struct CourseRow<'a> {
    pub student_id: i64,
    pub full_time: bool,
    pub course: &'a Course,
}

/// One (student, course, grade) tuple after both arrays are flattened.
#[derive(Debug, Clone, PartialEq)]
pub struct GradeRow {
    pub student_id: i64,
    pub full_time: bool,
    pub course: String,
    pub grade: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentFeatures {
    pub student_id: i64,
    pub avg_grade: f64,
    pub max_grade: f64,
    pub num_courses: usize,
    #[serde(rename = "fullTime")]
    pub full_time: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub inserted: usize,
    pub replaced: usize,
    pub pruned: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub inserted: usize,
    pub modified: usize,
    pub unchanged: usize,
}
