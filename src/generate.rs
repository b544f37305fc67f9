//! Deterministic synthetic raw dataset.
//!
//! Each student gets a major, two distinct courses from that major's catalog,
//! and three grades per course. Full-time students are drawn around a higher
//! mean than part-time ones so the derived features carry some signal.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::Serialize;

struct Major {
    name: &'static str,
    baseline: f64,
    courses: &'static [&'static str],
}

static MAJORS: [Major; 4] = [
    Major {
        name: "CS",
        baseline: 78.0,
        courses: &["Algorithms", "Databases", "ML"],
    },
    Major {
        name: "Math",
        baseline: 75.0,
        courses: &["Calculus", "Linear Algebra", "Statistics"],
    },
    Major {
        name: "Physics",
        baseline: 73.0,
        courses: &["Mechanics", "Electromagnetism"],
    },
    Major {
        name: "Economics",
        baseline: 76.0,
        courses: &["Micro", "Macro"],
    },
];

const FULL_TIME_RATE: f64 = 0.7;
const COURSES_PER_STUDENT: usize = 2;
const GRADES_PER_COURSE: usize = 3;
const GRADE_SPREAD: f64 = 8.0;

#[derive(Debug, Clone, Copy)]
pub struct GeneratorConfig {
    pub students: usize,
    pub seed: u64,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            students: 10_000,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyntheticStudent {
    pub student_id: i64,
    pub age: u32,
    pub major: &'static str,
    pub enrollment_year: i32,
    #[serde(rename = "fullTime")]
    pub full_time: bool,
    pub courses: Vec<SyntheticCourse>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyntheticCourse {
    pub course: &'static str,
    pub credits: u8,
    pub grades: Vec<i64>,
}

pub fn generate_students(
    config: &GeneratorConfig,
    generated_at: DateTime<Utc>,
) -> anyhow::Result<Vec<SyntheticStudent>> {
    let mut rng = StdRng::seed_from_u64(config.seed);

    (1..=config.students as i64)
        .map(|student_id| generate_student(&mut rng, student_id, generated_at))
        .collect()
}

fn generate_student(
    rng: &mut StdRng,
    student_id: i64,
    generated_at: DateTime<Utc>,
) -> anyhow::Result<SyntheticStudent> {
    let major = &MAJORS[rng.random_range(0..MAJORS.len())];
    let full_time = rng.random_bool(FULL_TIME_RATE);
    let shift = if full_time { 5.0 } else { -2.0 };
    let distribution = Normal::new(major.baseline + shift, GRADE_SPREAD)
        .context("invalid grade distribution")?;

    let picked: Vec<&'static str> = major
        .courses
        .choose_multiple(rng, COURSES_PER_STUDENT)
        .copied()
        .collect();

    let courses = picked
        .into_iter()
        .map(|course| SyntheticCourse {
            course,
            credits: *[3, 4].choose(rng).unwrap_or(&3),
            grades: (0..GRADES_PER_COURSE)
                .map(|_| clip_grade(distribution.sample(rng)))
                .collect(),
        })
        .collect();

    Ok(SyntheticStudent {
        student_id,
        age: rng.random_range(18..=30),
        major: major.name,
        enrollment_year: rng.random_range(2019..=2022),
        full_time,
        courses,
        generated_at,
    })
}

/// Clip to [50, 100] and truncate.
fn clip_grade(draw: f64) -> i64 {
    draw.clamp(50.0, 100.0) as i64
}

pub fn write_dataset(path: &Path, students: &[SyntheticStudent]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), students)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
