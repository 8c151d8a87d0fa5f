//! PostgreSQL-backed [`HarvestStore`]. Current-flag flips run inside one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{
    ErrorStage, HarvestErrorRecord, HarvestJob, HarvestObject, JobStatus, ObjectState, ObjectStatus,
};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::store::{HarvestStore, StoreError};

const OBJECT_COLUMNS: &str = "id, guid, source_id, job_id, package_id, content, status, state, current, metadata_modified, created_at";
const JOB_COLUMNS: &str = "id, source_id, status, gather_started, gather_finished, finished, has_errors";

#[derive(Debug, Clone)]
pub struct PgHarvestStore {
    pool: PgPool,
}

impl PgHarvestStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn job_from_row(row: &PgRow) -> Result<HarvestJob, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(HarvestJob {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        status: status.parse()?,
        gather_started: row.try_get("gather_started")?,
        gather_finished: row.try_get("gather_finished")?,
        finished: row.try_get("finished")?,
        has_errors: row.try_get("has_errors")?,
    })
}

fn object_from_row(row: &PgRow) -> Result<HarvestObject, StoreError> {
    let status: String = row.try_get("status")?;
    let state: String = row.try_get("state")?;
    Ok(HarvestObject {
        id: row.try_get("id")?,
        guid: row.try_get("guid")?,
        source_id: row.try_get("source_id")?,
        job_id: row.try_get("job_id")?,
        package_id: row.try_get("package_id")?,
        content: row.try_get("content")?,
        status: status.parse::<ObjectStatus>()?,
        state: state.parse::<ObjectState>()?,
        current: row.try_get("current")?,
        metadata_modified: row.try_get("metadata_modified")?,
        created_at: row.try_get("created_at")?,
    })
}

fn error_from_row(row: &PgRow) -> Result<HarvestErrorRecord, StoreError> {
    let stage: String = row.try_get("stage")?;
    let stage = match stage.as_str() {
        "gather" => ErrorStage::Gather,
        "import" => ErrorStage::Import,
        other => return Err(StoreError::Corrupt(format!("unknown error stage {other:?}"))),
    };
    Ok(HarvestErrorRecord {
        job_id: row.try_get("job_id")?,
        object_id: row.try_get("object_id")?,
        stage,
        message: row.try_get("message")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl HarvestStore for PgHarvestStore {
    async fn create_job(&self, source_id: &str) -> Result<HarvestJob, StoreError> {
        let job = HarvestJob::start(source_id);
        let inserted = sqlx::query(
            r#"
            INSERT INTO harvest_jobs (id, source_id, status, gather_started, has_errors)
            VALUES ($1, $2, $3, $4, FALSE)
            "#,
        )
        .bind(job.id)
        .bind(&job.source_id)
        .bind(job.status.as_str())
        .bind(job.gather_started)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(job),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::JobAlreadyRunning(source_id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn job(&self, job_id: Uuid) -> Result<Option<HarvestJob>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM harvest_jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn mark_gather_finished(&self, job_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE harvest_jobs SET gather_finished = $2 WHERE id = $1")
            .bind(job_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job_id));
        }
        Ok(())
    }

    async fn finish_job(&self, job_id: Uuid, status: JobStatus) -> Result<HarvestJob, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE harvest_jobs SET status = $2, finished = $3 WHERE id = $1 RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id)
        .bind(status.as_str())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => job_from_row(&row),
            None => Err(StoreError::JobNotFound(job_id)),
        }
    }

    async fn last_error_free_job(&self, source_id: &str) -> Result<Option<HarvestJob>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM harvest_jobs
            WHERE source_id = $1 AND status = 'finished' AND NOT has_errors
            ORDER BY gather_started DESC
            LIMIT 1
            "#
        ))
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn current_objects(&self, source_id: &str) -> Result<Vec<HarvestObject>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {OBJECT_COLUMNS} FROM harvest_objects WHERE source_id = $1 AND current"
        ))
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(object_from_row).collect()
    }

    async fn current_object(&self, source_id: &str, guid: &str) -> Result<Option<HarvestObject>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {OBJECT_COLUMNS} FROM harvest_objects WHERE source_id = $1 AND guid = $2 AND current"
        ))
        .bind(source_id)
        .bind(guid)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(object_from_row).transpose()
    }

    async fn persist_gathered(&self, objects: &[HarvestObject]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for obj in objects {
            if obj.status == ObjectStatus::Delete {
                sqlx::query(
                    "UPDATE harvest_objects SET current = FALSE WHERE source_id = $1 AND guid = $2 AND current",
                )
                .bind(&obj.source_id)
                .bind(&obj.guid)
                .execute(&mut *tx)
                .await?;
            }
            sqlx::query(
                r#"
                INSERT INTO harvest_objects
                    (id, guid, source_id, job_id, package_id, content, status, state, current, metadata_modified, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, FALSE, $9, $10)
                "#,
            )
            .bind(obj.id)
            .bind(&obj.guid)
            .bind(&obj.source_id)
            .bind(obj.job_id)
            .bind(&obj.package_id)
            .bind(&obj.content)
            .bind(obj.status.as_str())
            .bind(obj.state.as_str())
            .bind(obj.metadata_modified)
            .bind(obj.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn pending_objects(&self, job_id: Uuid) -> Result<Vec<HarvestObject>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {OBJECT_COLUMNS} FROM harvest_objects WHERE job_id = $1 AND state = 'pending' ORDER BY created_at"
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(object_from_row).collect()
    }

    async fn promote_current(
        &self,
        object_id: Uuid,
        package_id: &str,
        metadata_modified: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT source_id, guid FROM harvest_objects WHERE id = $1 FOR UPDATE")
            .bind(object_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::ObjectNotFound(object_id))?;
        let source_id: String = row.try_get("source_id")?;
        let guid: String = row.try_get("guid")?;

        sqlx::query(
            r#"
            UPDATE harvest_objects SET current = FALSE
            WHERE source_id = $1 AND guid = $2 AND current AND id <> $3
            "#,
        )
        .bind(&source_id)
        .bind(&guid)
        .bind(object_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE harvest_objects
            SET current = TRUE, package_id = $2, metadata_modified = $3, state = 'complete'
            WHERE id = $1
            "#,
        )
        .bind(object_id)
        .bind(package_id)
        .bind(metadata_modified)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn finish_object(&self, object_id: Uuid, state: ObjectState) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE harvest_objects SET state = $2 WHERE id = $1")
            .bind(object_id)
            .bind(state.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ObjectNotFound(object_id));
        }
        Ok(())
    }

    async fn record_error(&self, error: &HarvestErrorRecord) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO harvest_errors (job_id, object_id, stage, message, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(error.job_id)
        .bind(error.object_id)
        .bind(error.stage.as_str())
        .bind(&error.message)
        .bind(error.created_at)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE harvest_jobs SET has_errors = TRUE WHERE id = $1")
            .bind(error.job_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn job_errors(&self, job_id: Uuid) -> Result<Vec<HarvestErrorRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT job_id, object_id, stage, message, created_at
            FROM harvest_errors
            WHERE job_id = $1
            ORDER BY id
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(error_from_row).collect()
    }
}
