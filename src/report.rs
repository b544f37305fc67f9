use std::collections::BTreeMap;
use std::fmt::Write;

use crate::models::StudentFeatures;

#[derive(Debug, Clone, PartialEq)]
pub struct GroupSummary {
    pub count: usize,
    pub mean_avg_grade: f64,
    pub mean_max_grade: f64,
}

pub fn summarize(features: &[&StudentFeatures]) -> GroupSummary {
    let count = features.len();
    if count == 0 {
        return GroupSummary {
            count,
            mean_avg_grade: 0.0,
            mean_max_grade: 0.0,
        };
    }

    let (avg_total, max_total) = features.iter().fold((0.0, 0.0), |(avg, max), f| {
        (avg + f.avg_grade, max + f.max_grade)
    });

    GroupSummary {
        count,
        mean_avg_grade: avg_total / count as f64,
        mean_max_grade: max_total / count as f64,
    }
}

pub fn median_avg_grade(features: &[StudentFeatures]) -> Option<f64> {
    let mut values: Vec<f64> = features.iter().map(|f| f.avg_grade).collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);

    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

pub fn course_load_distribution(features: &[StudentFeatures]) -> BTreeMap<usize, usize> {
    let mut distribution = BTreeMap::new();
    for record in features {
        *distribution.entry(record.num_courses).or_insert(0) += 1;
    }
    distribution
}

pub fn build_report(features: &[StudentFeatures]) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Student Features Report");
    let _ = writeln!(output, "Students with features: {}", features.len());
    let _ = writeln!(output);

    let Some(median) = median_avg_grade(features) else {
        let _ = writeln!(output, "No feature records yet. Run `etl` first.");
        return output;
    };

    let everyone: Vec<&StudentFeatures> = features.iter().collect();
    let overall = summarize(&everyone);
    let high_performers = features.iter().filter(|f| f.avg_grade > median).count();

    let _ = writeln!(output, "## Grades");
    let _ = writeln!(output, "- Mean avg_grade: {:.2}", overall.mean_avg_grade);
    let _ = writeln!(output, "- Median avg_grade: {:.2}", median);
    let _ = writeln!(output, "- Mean max_grade: {:.2}", overall.mean_max_grade);
    let _ = writeln!(
        output,
        "- High performers (avg_grade above median): {}",
        high_performers
    );

    let (full_time, part_time): (Vec<&StudentFeatures>, Vec<&StudentFeatures>) =
        features.iter().partition(|f| f.full_time);

    let _ = writeln!(output);
    let _ = writeln!(output, "## Enrollment Status");
    for (label, group) in [("Full-time", &full_time), ("Part-time", &part_time)] {
        let summary = summarize(group);
        if summary.count == 0 {
            let _ = writeln!(output, "- {}: no students", label);
            continue;
        }
        let _ = writeln!(
            output,
            "- {}: {} students (mean avg_grade {:.2}, mean max_grade {:.2})",
            label, summary.count, summary.mean_avg_grade, summary.mean_max_grade
        );
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Course Load");
    for (num_courses, count) in course_load_distribution(features) {
        let _ = writeln!(output, "- {} course(s): {} students", num_courses, count);
    }

    let mut ranked = everyone;
    ranked.sort_by(|a, b| {
        b.avg_grade
            .total_cmp(&a.avg_grade)
            .then(a.student_id.cmp(&b.student_id))
    });

    let _ = writeln!(output);
    let _ = writeln!(output, "## Top Students");
    for record in ranked.iter().take(10) {
        let _ = writeln!(
            output,
            "- Student {} avg {:.2}, max {:.0}, {} course(s), {}",
            record.student_id,
            record.avg_grade,
            record.max_grade,
            record.num_courses,
            if record.full_time { "full-time" } else { "part-time" }
        );
    }

    output
}
