use std::path::Path;

use anyhow::{bail, Context};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::models::{IngestSummary, StudentFeatures, StudentRecord, UpsertOutcome};
use crate::pipeline;
use crate::store::FeatureStore;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Identity of one raw document in the source table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawKey {
    pub doc_key: String,
    pub student_id: i64,
}

/// Derive the row key for a raw document.
///
/// An explicit `_id` keys the document on its own, so one student can own
/// several documents. Without `_id` the document is keyed by its student.
pub fn raw_document_key(index: usize, document: &Value) -> anyhow::Result<RawKey> {
    if !document.is_object() {
        bail!("document #{index} is not a JSON object");
    }
    let student_id = document
        .get("student_id")
        .and_then(Value::as_i64)
        .with_context(|| format!("document #{index} has no integer student_id"))?;

    let doc_key = match document.get("_id") {
        None | Some(Value::Null) => format!("student:{student_id}"),
        Some(Value::String(id)) => format!("id:{id}"),
        Some(Value::Number(id)) => format!("id:{id}"),
        Some(_) => bail!("document #{index} has an _id that is neither a string nor a number"),
    };

    Ok(RawKey {
        doc_key,
        student_id,
    })
}

/// Load a JSON array of raw student documents into the source table.
///
/// Top-level fields are merged into any stored document with the same key;
/// documents that would not change are left alone.
pub async fn ingest_json(pool: &PgPool, json_path: &Path) -> anyhow::Result<IngestSummary> {
    if !json_path.exists() {
        bail!(
            "{} does not exist. Run `generate` first.",
            json_path.display()
        );
    }

    let content = std::fs::read_to_string(json_path)
        .with_context(|| format!("failed to read {}", json_path.display()))?;
    let documents: Vec<Value> = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a JSON array of documents", json_path.display()))?;

    let mut summary = IngestSummary::default();

    for (index, document) in documents.iter().enumerate() {
        let key = raw_document_key(index, document)?;

        let row = sqlx::query(
            r#"
            INSERT INTO student_features.students_raw AS raw (doc_key, student_id, document)
            VALUES ($1, $2, $3)
            ON CONFLICT (doc_key) DO UPDATE
            SET document = raw.document || EXCLUDED.document,
                student_id = EXCLUDED.student_id,
                ingested_at = now()
            WHERE raw.document IS DISTINCT FROM raw.document || EXCLUDED.document
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&key.doc_key)
        .bind(key.student_id)
        .bind(Json(document))
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to ingest document {}", key.doc_key))?;

        match row {
            Some(row) if row.get::<bool, _>("inserted") => summary.inserted += 1,
            Some(_) => summary.modified += 1,
            None => summary.unchanged += 1,
        }
    }

    Ok(summary)
}

/// All raw documents in ingestion order, so the first document seen for a
/// student is the one ingested first.
pub async fn fetch_raw_students(pool: &PgPool) -> anyhow::Result<Vec<StudentRecord>> {
    let rows = sqlx::query(
        "SELECT doc_key, document FROM student_features.students_raw ORDER BY seq",
    )
    .fetch_all(pool)
    .await
    .context("failed to read source students")?;

    let mut records = Vec::with_capacity(rows.len());

    for row in rows {
        let doc_key: String = row.get("doc_key");
        let Json(document): Json<Value> = row.try_get("document")?;
        records.push(pipeline::decode_record(&doc_key, document)?);
    }

    debug!(count = records.len(), "loaded raw student documents");
    Ok(records)
}

pub async fn fetch_features(pool: &PgPool) -> anyhow::Result<Vec<StudentFeatures>> {
    let rows = sqlx::query(
        "SELECT student_id, avg_grade, max_grade, num_courses, full_time \
         FROM student_features.students_features \
         ORDER BY student_id",
    )
    .fetch_all(pool)
    .await
    .context("failed to read student features")?;

    let mut features = Vec::with_capacity(rows.len());

    for row in rows {
        let num_courses: i64 = row.get("num_courses");
        features.push(StudentFeatures {
            student_id: row.get("student_id"),
            avg_grade: row.get("avg_grade"),
            max_grade: row.get("max_grade"),
            num_courses: usize::try_from(num_courses).context("negative num_courses")?,
            full_time: row.get("full_time"),
        });
    }

    Ok(features)
}

/// Postgres-backed target table.
pub struct PgFeatureStore<'a> {
    pool: &'a PgPool,
}

impl<'a> PgFeatureStore<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }
}

impl FeatureStore for PgFeatureStore<'_> {
    async fn upsert(&mut self, features: &StudentFeatures) -> anyhow::Result<UpsertOutcome> {
        let num_courses = i64::try_from(features.num_courses)?;

        let inserted: bool = sqlx::query(
            r#"
            INSERT INTO student_features.students_features
            (student_id, avg_grade, max_grade, num_courses, full_time)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (student_id) DO UPDATE
            SET avg_grade = EXCLUDED.avg_grade,
                max_grade = EXCLUDED.max_grade,
                num_courses = EXCLUDED.num_courses,
                full_time = EXCLUDED.full_time
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(features.student_id)
        .bind(features.avg_grade)
        .bind(features.max_grade)
        .bind(num_courses)
        .bind(features.full_time)
        .fetch_one(self.pool)
        .await
        .with_context(|| format!("failed to upsert features for student {}", features.student_id))?
        .get("inserted");

        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Replaced
        })
    }

    async fn delete_missing(&mut self, keep: &[i64]) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "DELETE FROM student_features.students_features WHERE NOT (student_id = ANY($1))",
        )
        .bind(keep)
        .execute(self.pool)
        .await
        .context("failed to prune orphaned feature records")?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{compute_features, FullTimePolicy, PipelineError};
    use serde_json::json;
    use sqlx::postgres::PgPoolOptions;

    #[test]
    fn documents_without_id_are_keyed_by_student() {
        let key = raw_document_key(0, &json!({ "student_id": 42, "fullTime": true })).unwrap();
        assert_eq!(
            key,
            RawKey {
                doc_key: "student:42".to_string(),
                student_id: 42,
            }
        );
    }

    #[test]
    fn explicit_ids_let_one_student_own_several_documents() {
        let first = raw_document_key(0, &json!({ "_id": "a1", "student_id": 7 })).unwrap();
        let second = raw_document_key(1, &json!({ "_id": 2, "student_id": 7 })).unwrap();

        assert_eq!(first.doc_key, "id:a1");
        assert_eq!(second.doc_key, "id:2");
        assert_eq!(first.student_id, second.student_id);
    }

    #[test]
    fn malformed_documents_are_rejected_before_writing() {
        assert!(raw_document_key(0, &json!([1, 2])).is_err());
        assert!(raw_document_key(1, &json!({ "student_id": "seven" })).is_err());
        assert!(raw_document_key(2, &json!({ "_id": [1], "student_id": 7 })).is_err());
    }

    async fn clear(pool: &PgPool, first: i64, last: i64) {
        for table in ["students_raw", "students_features"] {
            sqlx::query(&format!(
                "DELETE FROM student_features.{table} WHERE student_id BETWEEN $1 AND $2"
            ))
            .bind(first)
            .bind(last)
            .execute(pool)
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL pointing at a scratch Postgres"]
    async fn ingest_and_upsert_round_trip() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .unwrap();
        init_db(&pool).await.unwrap();

        let base = 7_000_000_000 + i64::from(std::process::id()) * 10;
        clear(&pool, base, base + 9).await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("students_raw.json");
        let documents = json!([
            { "_id": format!("{base}-a"), "student_id": base, "fullTime": true,
              "courses": [{ "course": "ML", "grades": [80, 90] }] },
            { "_id": format!("{base}-b"), "student_id": base, "fullTime": false,
              "courses": [{ "course": "Databases", "grades": [70] }] },
            { "student_id": base + 1, "fullTime": false,
              "courses": [{ "course": "Micro", "grades": [65] }] }
        ]);
        std::fs::write(&path, documents.to_string()).unwrap();

        let first = ingest_json(&pool, &path).await.unwrap();
        assert_eq!(first.inserted, 3);
        let second = ingest_json(&pool, &path).await.unwrap();
        assert_eq!(second.unchanged, 3);

        let records: Vec<StudentRecord> = fetch_raw_students(&pool)
            .await
            .unwrap()
            .into_iter()
            .filter(|record| (base..=base + 9).contains(&record.student_id))
            .collect();
        assert_eq!(records.len(), 3);

        let rejected = compute_features(&records, FullTimePolicy::Reject).unwrap_err();
        assert!(matches!(
            rejected,
            PipelineError::InconsistentFullTime { student_id } if student_id == base
        ));

        let features = compute_features(&records, FullTimePolicy::FirstSeen).unwrap();
        assert_eq!(features.len(), 2);
        assert!(features[0].full_time);
        assert_eq!(features[0].num_courses, 2);

        let mut store = PgFeatureStore::new(&pool);
        for record in &features {
            assert_eq!(store.upsert(record).await.unwrap(), UpsertOutcome::Inserted);
        }
        for record in &features {
            assert_eq!(store.upsert(record).await.unwrap(), UpsertOutcome::Replaced);
        }

        let stored: Vec<StudentFeatures> = fetch_features(&pool)
            .await
            .unwrap()
            .into_iter()
            .filter(|record| (base..=base + 9).contains(&record.student_id))
            .collect();
        assert_eq!(stored, features);

        clear(&pool, base, base + 9).await;
    }
}
