//! Durable job/object state keyed by `(source_id, guid)` with at most one current object per key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{
    HarvestError, HarvestErrorRecord, HarvestJob, HarvestObject, JobStatus, ObjectState, ObjectStatus,
};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("source {0} already has a running job")]
    JobAlreadyRunning(String),
    #[error("job {0} not found")]
    JobNotFound(Uuid),
    #[error("harvest object {0} not found")]
    ObjectNotFound(Uuid),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl From<HarvestError> for StoreError {
    fn from(err: HarvestError) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

#[async_trait]
pub trait HarvestStore: Send + Sync {
    /// Open a running job; refused while another job of the same source is running.
    async fn create_job(&self, source_id: &str) -> Result<HarvestJob, StoreError>;
    async fn job(&self, job_id: Uuid) -> Result<Option<HarvestJob>, StoreError>;
    async fn mark_gather_finished(&self, job_id: Uuid) -> Result<(), StoreError>;
    async fn finish_job(&self, job_id: Uuid, status: JobStatus) -> Result<HarvestJob, StoreError>;
    async fn last_error_free_job(&self, source_id: &str) -> Result<Option<HarvestJob>, StoreError>;
    async fn current_objects(&self, source_id: &str) -> Result<Vec<HarvestObject>, StoreError>;
    async fn current_object(&self, source_id: &str, guid: &str) -> Result<Option<HarvestObject>, StoreError>;
    /// Insert a gather's objects. Delete objects flip the prior current for their guid in the same step.
    async fn persist_gathered(&self, objects: &[HarvestObject]) -> Result<(), StoreError>;
    async fn pending_objects(&self, job_id: Uuid) -> Result<Vec<HarvestObject>, StoreError>;
    /// Make `object_id` the current object for its guid, demoting any prior current one atomically.
    async fn promote_current(
        &self,
        object_id: Uuid,
        package_id: &str,
        metadata_modified: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
    async fn finish_object(&self, object_id: Uuid, state: ObjectState) -> Result<(), StoreError>;
    /// Persist an error and mark its job as having errors.
    async fn record_error(&self, error: &HarvestErrorRecord) -> Result<(), StoreError>;
    async fn job_errors(&self, job_id: Uuid) -> Result<Vec<HarvestErrorRecord>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: Vec<HarvestJob>,
    objects: Vec<HarvestObject>,
    errors: Vec<HarvestErrorRecord>,
}

impl MemoryState {
    fn job_mut(&mut self, job_id: Uuid) -> Result<&mut HarvestJob, StoreError> {
        self.jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or(StoreError::JobNotFound(job_id))
    }

    fn object_index(&self, object_id: Uuid) -> Result<usize, StoreError> {
        self.objects
            .iter()
            .position(|o| o.id == object_id)
            .ok_or(StoreError::ObjectNotFound(object_id))
    }

    fn demote(&mut self, source_id: &str, guid: &str, except: Option<Uuid>) {
        for obj in self
            .objects
            .iter_mut()
            .filter(|o| o.current && o.source_id == source_id && o.guid == guid && Some(o.id) != except)
        {
            obj.current = false;
        }
    }
}

/// Process-local store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryHarvestStore {
    state: Mutex<MemoryState>,
}

impl MemoryHarvestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_objects(&self) -> Vec<HarvestObject> {
        self.state.lock().await.objects.clone()
    }
}

#[async_trait]
impl HarvestStore for MemoryHarvestStore {
    async fn create_job(&self, source_id: &str) -> Result<HarvestJob, StoreError> {
        let mut state = self.state.lock().await;
        if state
            .jobs
            .iter()
            .any(|j| j.source_id == source_id && j.status == JobStatus::Running)
        {
            return Err(StoreError::JobAlreadyRunning(source_id.to_string()));
        }
        let job = HarvestJob::start(source_id);
        state.jobs.push(job.clone());
        Ok(job)
    }

    async fn job(&self, job_id: Uuid) -> Result<Option<HarvestJob>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.iter().find(|j| j.id == job_id).cloned())
    }

    async fn mark_gather_finished(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.job_mut(job_id)?.gather_finished = Some(Utc::now());
        Ok(())
    }

    async fn finish_job(&self, job_id: Uuid, status: JobStatus) -> Result<HarvestJob, StoreError> {
        let mut state = self.state.lock().await;
        let job = state.job_mut(job_id)?;
        job.status = status;
        job.finished = Some(Utc::now());
        Ok(job.clone())
    }

    async fn last_error_free_job(&self, source_id: &str) -> Result<Option<HarvestJob>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .iter()
            .filter(|j| j.source_id == source_id && j.is_error_free())
            .max_by_key(|j| j.gather_started)
            .cloned())
    }

    async fn current_objects(&self, source_id: &str) -> Result<Vec<HarvestObject>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .objects
            .iter()
            .filter(|o| o.current && o.source_id == source_id)
            .cloned()
            .collect())
    }

    async fn current_object(&self, source_id: &str, guid: &str) -> Result<Option<HarvestObject>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .objects
            .iter()
            .find(|o| o.current && o.source_id == source_id && o.guid == guid)
            .cloned())
    }

    async fn persist_gathered(&self, objects: &[HarvestObject]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for obj in objects {
            if obj.status == ObjectStatus::Delete {
                state.demote(&obj.source_id, &obj.guid, None);
            }
            let mut obj = obj.clone();
            obj.current = false;
            state.objects.push(obj);
        }
        Ok(())
    }

    async fn pending_objects(&self, job_id: Uuid) -> Result<Vec<HarvestObject>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .objects
            .iter()
            .filter(|o| o.job_id == job_id && o.state == ObjectState::Pending)
            .cloned()
            .collect())
    }

    async fn promote_current(
        &self,
        object_id: Uuid,
        package_id: &str,
        metadata_modified: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let idx = state.object_index(object_id)?;
        let (source_id, guid) = (state.objects[idx].source_id.clone(), state.objects[idx].guid.clone());
        state.demote(&source_id, &guid, Some(object_id));
        let obj = &mut state.objects[idx];
        obj.current = true;
        obj.package_id = Some(package_id.to_string());
        obj.metadata_modified = metadata_modified;
        obj.state = ObjectState::Complete;
        Ok(())
    }

    async fn finish_object(&self, object_id: Uuid, object_state: ObjectState) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let idx = state.object_index(object_id)?;
        state.objects[idx].state = object_state;
        Ok(())
    }

    async fn record_error(&self, error: &HarvestErrorRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.job_mut(error.job_id)?.has_errors = true;
        state.errors.push(error.clone());
        Ok(())
    }

    async fn job_errors(&self, job_id: Uuid) -> Result<Vec<HarvestErrorRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.errors.iter().filter(|e| e.job_id == job_id).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn current_count(store: &MemoryHarvestStore, guid: &str) -> usize {
        store
            .all_objects()
            .await
            .iter()
            .filter(|o| o.guid == guid && o.current)
            .count()
    }

    #[tokio::test]
    async fn a_second_running_job_is_refused() {
        let store = MemoryHarvestStore::new();
        let job = store.create_job("src").await.expect("first job");
        let err = store.create_job("src").await.expect_err("second job");
        assert!(matches!(err, StoreError::JobAlreadyRunning(_)));

        store.finish_job(job.id, JobStatus::Finished).await.expect("finish");
        store.create_job("src").await.expect("after finish");
        store.create_job("other").await.expect("other source");
    }

    #[tokio::test]
    async fn promotion_keeps_a_single_current_object() {
        let store = MemoryHarvestStore::new();
        let job = store.create_job("src").await.expect("job");
        let first = HarvestObject::new(&job, "g1", ObjectStatus::New);
        let second = HarvestObject::new(&job, "g1", ObjectStatus::Change);
        store
            .persist_gathered(&[first.clone(), second.clone()])
            .await
            .expect("persist");

        store.promote_current(first.id, "pkg", None).await.expect("promote first");
        assert_eq!(current_count(&store, "g1").await, 1);
        store.promote_current(second.id, "pkg", None).await.expect("promote second");
        assert_eq!(current_count(&store, "g1").await, 1);

        let current = store.current_object("src", "g1").await.expect("lookup").expect("current");
        assert_eq!(current.id, second.id);
        assert_eq!(current.state, ObjectState::Complete);
    }

    #[tokio::test]
    async fn delete_objects_demote_the_prior_current_on_persist() {
        let store = MemoryHarvestStore::new();
        let job = store.create_job("src").await.expect("job");
        let live = HarvestObject::new(&job, "z", ObjectStatus::New);
        store.persist_gathered(&[live.clone()]).await.expect("persist");
        store.promote_current(live.id, "pkg-z", None).await.expect("promote");

        let delete = HarvestObject::new(&job, "z", ObjectStatus::Delete);
        store.persist_gathered(&[delete]).await.expect("persist delete");
        assert_eq!(current_count(&store, "z").await, 0);
        assert!(store.current_objects("src").await.expect("current").is_empty());
    }

    #[tokio::test]
    async fn errors_disqualify_a_job_from_the_watermark() {
        let store = MemoryHarvestStore::new();
        let clean = store.create_job("src").await.expect("job");
        store.finish_job(clean.id, JobStatus::Finished).await.expect("finish");

        let dirty = store.create_job("src").await.expect("job");
        store
            .record_error(&HarvestErrorRecord::gather(dirty.id, "boom"))
            .await
            .expect("error");
        store.finish_job(dirty.id, JobStatus::Finished).await.expect("finish");

        let last = store.last_error_free_job("src").await.expect("lookup").expect("job");
        assert_eq!(last.id, clean.id);
        assert_eq!(store.job_errors(dirty.id).await.expect("errors").len(), 1);
    }
}
