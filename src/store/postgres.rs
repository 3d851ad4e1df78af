//! PostgreSQL implementation of the record store.
//!
//! The claim is a single statement: a `FOR UPDATE SKIP LOCKED` selection
//! feeding an `UPDATE ... RETURNING`, so concurrent claimers never receive
//! overlapping records, even when they live in different processes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

use super::{Record, RecordOutcome, RecordStatus, RecordStore};
use crate::error::{CaravanError, Result};

/// PostgreSQL-backed [`RecordStore`].
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn record_from_row(row: &PgRow) -> Result<Record> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<RecordStatus>()
        .map_err(|e| CaravanError::Other(anyhow::anyhow!(e)))?;
    Ok(Record {
        id: row.try_get("id")?,
        resource_type: row.try_get("resource_type")?,
        source_id: row.try_get("source_id")?,
        payload: row.try_get::<Value, _>("payload")?,
        status,
        destination_id: row.try_get("destination_id")?,
        destination_error: row.try_get("destination_error")?,
    })
}

const RECORD_COLUMNS: &str =
    "id, resource_type, source_id, payload, status, destination_id, destination_error";

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn insert_new(
        &self,
        resource_type: &str,
        source_id: i64,
        payload: &Value,
    ) -> Result<bool> {
        let rows_affected = sqlx::query(
            r#"
            INSERT INTO records (resource_type, source_id, payload)
            VALUES ($1, $2, $3)
            ON CONFLICT (resource_type, source_id) DO NOTHING
            "#,
        )
        .bind(resource_type)
        .bind(source_id)
        .bind(payload)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows_affected == 1)
    }

    async fn claim_batch(&self, resource_type: &str, limit: usize) -> Result<Vec<Record>> {
        let rows = sqlx::query(&format!(
            r#"
            WITH candidates AS (
                SELECT id FROM records
                WHERE resource_type = $1 AND status = 'new'
                ORDER BY id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE records r
            SET status = 'queued', queued_at = NOW(), updated_at = NOW()
            FROM candidates c
            WHERE r.id = c.id
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(resource_type)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>>>()?;
        // RETURNING does not preserve the CTE's ordering.
        records.sort_by_key(|r| r.id);

        tracing::debug!(
            resource_type,
            claimed = records.len(),
            ids = ?records.iter().map(|r| r.source_id).collect::<Vec<_>>(),
            "claimed batch"
        );
        Ok(records)
    }

    async fn record_outcomes(&self, outcomes: &[RecordOutcome]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for outcome in outcomes {
            let rows_affected = sqlx::query(
                r#"
                UPDATE records
                SET status = $2,
                    destination_id = $3,
                    destination_error = $4,
                    queued_at = NULL,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(outcome.id)
            .bind(outcome.status.as_str())
            .bind(outcome.destination_id)
            .bind(&outcome.destination_error)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if rows_affected == 0 {
                tx.rollback().await.ok();
                return Err(CaravanError::RecordNotFound(outcome.id));
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn mark_job_failed(&self, ids: &[i64]) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE records
            SET status = 'job-failed', queued_at = NULL, updated_at = NOW()
            WHERE id = ANY($1)
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release_stale_claims(&self, resource_type: &str, lease: Duration) -> Result<u64> {
        let lease_ms = lease.as_millis().to_string();
        let released = sqlx::query(
            r#"
            UPDATE records
            SET status = 'new', queued_at = NULL, updated_at = NOW()
            WHERE resource_type = $1
              AND status = 'queued'
              AND queued_at <= NOW() - ($2 || ' milliseconds')::INTERVAL
            "#,
        )
        .bind(resource_type)
        .bind(lease_ms)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if released > 0 {
            tracing::warn!(
                resource_type,
                released,
                lease_ms = lease.as_millis() as u64,
                "released stale claims (likely a crashed worker)"
            );
        }
        Ok(released)
    }

    async fn records_by_status(
        &self,
        resource_type: &str,
        status: RecordStatus,
    ) -> Result<Vec<Record>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM records
            WHERE resource_type = $1 AND status = $2
            ORDER BY id
            "#
        ))
        .bind(resource_type)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn records_not_synced(&self, resource_type: &str) -> Result<Vec<Record>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS} FROM records
            WHERE resource_type = $1 AND status <> 'synced'
            ORDER BY id
            "#
        ))
        .bind(resource_type)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn status_counts(&self, resource_type: &str) -> Result<HashMap<RecordStatus, u64>> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count FROM records
            WHERE resource_type = $1
            GROUP BY status
            "#,
        )
        .bind(resource_type)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.try_get("status")?;
            let status = status
                .parse::<RecordStatus>()
                .map_err(|e| CaravanError::Other(anyhow::anyhow!(e)))?;
            let count: i64 = row.try_get("count")?;
            counts.insert(status, count as u64);
        }
        Ok(counts)
    }

    async fn destination_id_map(&self, resource_type: &str) -> Result<HashMap<i64, i64>> {
        let rows = sqlx::query(
            r#"
            SELECT source_id, destination_id FROM records
            WHERE resource_type = $1 AND destination_id IS NOT NULL
            "#,
        )
        .bind(resource_type)
        .fetch_all(&self.pool)
        .await?;

        let mut map = HashMap::new();
        for row in rows {
            let source_id: i64 = row.try_get("source_id")?;
            let destination_id: i64 = row.try_get("destination_id")?;
            map.insert(source_id, destination_id);
        }
        Ok(map)
    }

    async fn reset_for_redrive(
        &self,
        resource_type: &str,
        statuses: &[RecordStatus],
    ) -> Result<u64> {
        let status_strings: Vec<&str> = statuses.iter().map(RecordStatus::as_str).collect();
        let reset = sqlx::query(
            r#"
            UPDATE records
            SET status = 'new', destination_error = NULL, queued_at = NULL, updated_at = NOW()
            WHERE resource_type = $1 AND status = ANY($2)
            "#,
        )
        .bind(resource_type)
        .bind(&status_strings)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;

    async fn seeded(pool: &PgPool, resource_type: &str, count: i64) -> PgRecordStore {
        let store = PgRecordStore::new(pool.clone());
        for source_id in 1..=count {
            store
                .insert_new(resource_type, source_id, &json!({ "id": source_id }))
                .await
                .unwrap();
        }
        store
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn insert_enforces_source_uniqueness(pool: PgPool) {
        let store = PgRecordStore::new(pool);
        assert!(store.insert_new("ticket", 7, &json!({})).await.unwrap());
        assert!(!store.insert_new("ticket", 7, &json!({})).await.unwrap());
        assert!(store.insert_new("user", 7, &json!({})).await.unwrap());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn claim_marks_queued_and_drains(pool: PgPool) {
        let store = seeded(&pool, "ticket", 3).await;

        let batch = store.claim_batch("ticket", 2).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|r| r.status == RecordStatus::Queued));
        assert!(batch.windows(2).all(|w| w[0].id < w[1].id));

        let rest = store.claim_batch("ticket", 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert!(store.claim_batch("ticket", 2).await.unwrap().is_empty());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn concurrent_claims_are_disjoint(pool: PgPool) {
        let store = Arc::new(seeded(&pool, "ticket", 30).await);

        let mut handles = Vec::new();
        for _ in 0..6 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                loop {
                    let batch = store.claim_batch("ticket", 4).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    claimed.extend(batch.into_iter().map(|r| r.id));
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "record {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 30);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn outcome_recording_is_idempotent(pool: PgPool) {
        let store = seeded(&pool, "ticket", 2).await;
        let batch = store.claim_batch("ticket", 2).await.unwrap();

        let outcomes = vec![
            RecordOutcome::synced(batch[0].id, 900),
            RecordOutcome::failed(batch[1].id, "RecordInvalid: bad payload"),
        ];
        store.record_outcomes(&outcomes).await.unwrap();
        store.record_outcomes(&outcomes).await.unwrap();

        let synced = store
            .records_by_status("ticket", RecordStatus::Synced)
            .await
            .unwrap();
        assert_eq!(synced.len(), 1);
        assert_eq!(synced[0].destination_id, Some(900));

        let failed = store
            .records_by_status("ticket", RecordStatus::Failed)
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(
            failed[0].destination_error.as_deref(),
            Some("RecordInvalid: bad payload")
        );
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn stale_claims_are_released_and_reclaimable(pool: PgPool) {
        let store = seeded(&pool, "ticket", 2).await;
        store.claim_batch("ticket", 2).await.unwrap();

        let released = store
            .release_stale_claims("ticket", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(released, 2);

        let reclaimed = store.claim_batch("ticket", 5).await.unwrap();
        assert_eq!(reclaimed.len(), 2);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn redrive_resets_terminal_statuses(pool: PgPool) {
        let store = seeded(&pool, "ticket", 2).await;
        let batch = store.claim_batch("ticket", 2).await.unwrap();
        store
            .record_outcomes(&[RecordOutcome::failed(batch[0].id, "bad")])
            .await
            .unwrap();
        store.mark_job_failed(&[batch[1].id]).await.unwrap();

        let reset = store
            .reset_for_redrive("ticket", &[RecordStatus::Failed, RecordStatus::JobFailed])
            .await
            .unwrap();
        assert_eq!(reset, 2);

        let counts = store.status_counts("ticket").await.unwrap();
        assert_eq!(counts.get(&RecordStatus::New), Some(&2));
    }
}
