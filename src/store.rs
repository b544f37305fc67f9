use tracing::{debug, info};

use crate::models::{RunSummary, StudentFeatures, UpsertOutcome};

/// Destination for derived feature records, keyed by `student_id`.
pub trait FeatureStore {
    /// Replace the record with the same `student_id` wholesale, or insert it.
    async fn upsert(&mut self, features: &StudentFeatures) -> anyhow::Result<UpsertOutcome>;

    /// Delete every record whose `student_id` is not in `keep`.
    async fn delete_missing(&mut self, keep: &[i64]) -> anyhow::Result<u64>;
}

/// Stage 5 plus the optional reconciliation step.
///
/// Records are written one at a time with no surrounding transaction; a failed
/// write aborts the run and leaves earlier writes committed. When `source_ids`
/// is given, records for students absent from the source are deleted afterwards.
pub async fn persist<S: FeatureStore>(
    store: &mut S,
    features: &[StudentFeatures],
    source_ids: Option<&[i64]>,
) -> anyhow::Result<RunSummary> {
    let mut summary = RunSummary::default();

    for record in features {
        match store.upsert(record).await? {
            UpsertOutcome::Inserted => summary.inserted += 1,
            UpsertOutcome::Replaced => summary.replaced += 1,
        }
    }
    debug!(
        inserted = summary.inserted,
        replaced = summary.replaced,
        "upserted feature records"
    );

    if let Some(keep) = source_ids {
        let pruned = store.delete_missing(keep).await?;
        info!(pruned, "removed feature records with no source student");
        summary.pruned = Some(pruned);
    }

    Ok(summary)
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryFeatureStore;
    use super::*;
    use crate::models::{Course, StudentRecord};
    use crate::pipeline::{compute_features, source_student_ids, FullTimePolicy};

    fn course(name: &str, grades: &[f64]) -> Course {
        Course {
            course: name.to_string(),
            grades: grades.to_vec(),
        }
    }

    fn student(student_id: i64, full_time: bool, courses: Vec<Course>) -> StudentRecord {
        StudentRecord {
            student_id,
            full_time,
            courses,
        }
    }

    async fn run(
        store: &mut MemoryFeatureStore,
        records: &[StudentRecord],
        prune: bool,
    ) -> RunSummary {
        let features = compute_features(records, FullTimePolicy::FirstSeen).unwrap();
        let source_ids = prune.then(|| source_student_ids(records));
        persist(store, &features, source_ids.as_deref()).await.unwrap()
    }

    #[tokio::test]
    async fn rerun_on_unchanged_input_is_idempotent() {
        let records = vec![
            student(1, true, vec![course("Calculus", &[80.0, 91.0])]),
            student(2, false, vec![course("Micro", &[66.0]), course("Macro", &[72.0])]),
        ];
        let mut store = MemoryFeatureStore::default();

        let first = run(&mut store, &records, false).await;
        let snapshot = store.records.clone();
        let second = run(&mut store, &records, false).await;

        assert_eq!(first.inserted, 2);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.replaced, 2);
        assert_eq!(store.records, snapshot);
    }

    #[tokio::test]
    async fn new_student_inserts_one_record_and_leaves_others() {
        let mut records = vec![student(1, true, vec![course("ML", &[75.0])])];
        let mut store = MemoryFeatureStore::default();
        run(&mut store, &records, false).await;
        let existing = store.records[&1].clone();

        records.push(student(2, false, vec![course("Databases", &[60.0])]));
        let summary = run(&mut store, &records, false).await;

        assert_eq!(summary.inserted, 1);
        assert_eq!(store.records.len(), 2);
        assert_eq!(store.records[&1], existing);
    }

    #[tokio::test]
    async fn grade_change_replaces_without_duplicating() {
        let mut store = MemoryFeatureStore::default();
        let original = [student(1, true, vec![course("ML", &[60.0, 70.0])])];
        run(&mut store, &original, false).await;

        let changed = [student(1, true, vec![course("ML", &[60.0, 98.0])])];
        let summary = run(&mut store, &changed, false).await;

        assert_eq!(summary.replaced, 1);
        assert_eq!(store.records.len(), 1);
        assert_eq!(store.records[&1].max_grade, 98.0);
        assert!((store.records[&1].avg_grade - 79.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn removed_students_stay_unless_pruned() {
        let mut store = MemoryFeatureStore::default();
        run(
            &mut store,
            &[
                student(1, true, vec![course("ML", &[80.0])]),
                student(2, true, vec![course("ML", &[81.0])]),
            ],
            false,
        )
        .await;

        let remaining = [student(1, true, vec![course("ML", &[80.0])])];
        let kept = run(&mut store, &remaining, false).await;
        assert_eq!(kept.pruned, None);
        assert!(store.records.contains_key(&2));

        let pruned = run(&mut store, &remaining, true).await;
        assert_eq!(pruned.pruned, Some(1));
        assert_eq!(store.records.keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn prune_keeps_students_still_in_source_without_grades() {
        let mut store = MemoryFeatureStore::default();
        let graded = [student(1, true, vec![course("ML", &[80.0])])];
        run(&mut store, &graded, false).await;

        let ungraded = [student(1, true, vec![course("ML", &[])])];
        let summary = run(&mut store, &ungraded, true).await;

        assert_eq!(summary.pruned, Some(0));
        assert_eq!(summary.inserted + summary.replaced, 0);
        assert_eq!(store.records[&1].max_grade, 80.0);
    }
}
