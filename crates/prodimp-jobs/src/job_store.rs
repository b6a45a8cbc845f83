use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prodimp_core::{JobSnapshot, JobState, TransitionError};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job {0} already exists")]
    AlreadyExists(Uuid),
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job {job_id}: {source}")]
    Transition {
        job_id: Uuid,
        #[source]
        source: TransitionError,
    },
}

/// Job id to state mapping shared by the submitter, the workers and pollers.
///
/// Every update is checked against [`JobState::check_transition`], so terminal
/// states are final and `rows_processed` never decreases.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job_id: Uuid) -> Result<JobSnapshot, JobStoreError>;

    async fn update(&self, job_id: Uuid, state: JobState) -> Result<JobSnapshot, JobStoreError>;

    async fn get(&self, job_id: Uuid) -> Option<JobSnapshot>;

    /// Drops terminal jobs last updated before `cutoff` and returns how many.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> usize;
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, JobSnapshot>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job_id: Uuid) -> Result<JobSnapshot, JobStoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job_id) {
            return Err(JobStoreError::AlreadyExists(job_id));
        }
        let snapshot = JobSnapshot::new(job_id, Utc::now());
        jobs.insert(job_id, snapshot.clone());
        Ok(snapshot)
    }

    async fn update(&self, job_id: Uuid, state: JobState) -> Result<JobSnapshot, JobStoreError> {
        let mut jobs = self.jobs.write().await;
        let snapshot = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        snapshot
            .state
            .check_transition(&state)
            .map_err(|source| JobStoreError::Transition { job_id, source })?;
        snapshot.state = state;
        snapshot.updated_at = Utc::now();
        Ok(snapshot.clone())
    }

    async fn get(&self, job_id: Uuid) -> Option<JobSnapshot> {
        self.jobs.read().await.get(&job_id).cloned()
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, snap| !(snap.state.is_terminal() && snap.updated_at < cutoff));
        before - jobs.len()
    }
}

/// Removes terminal jobs older than `retention` as of `now`.
pub async fn purge_expired(store: &dyn JobStore, retention: Duration, now: DateTime<Utc>) -> usize {
    let Ok(retention) = chrono::Duration::from_std(retention) else {
        return 0;
    };
    let Some(cutoff) = now.checked_sub_signed(retention) else {
        return 0;
    };
    store.purge_terminal_before(cutoff).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use prodimp_core::{Progress, RowTotal};

    fn running(rows_processed: u64) -> JobState {
        JobState::Running(Progress {
            rows_processed,
            rows_seen_valid: rows_processed,
            total_rows: RowTotal::Unknown,
            status: format!("Processed {rows_processed} products..."),
        })
    }

    #[tokio::test]
    async fn job_ids_are_unique() {
        let store = MemoryJobStore::new();
        let id = Uuid::new_v4();
        store.create(id).await.expect("create");
        assert!(matches!(
            store.create(id).await,
            Err(JobStoreError::AlreadyExists(dup)) if dup == id
        ));
    }

    #[tokio::test]
    async fn updates_follow_the_lifecycle() {
        let store = MemoryJobStore::new();
        let id = Uuid::new_v4();
        store.create(id).await.expect("create");
        store.update(id, running(0)).await.expect("start");
        store.update(id, running(3000)).await.expect("progress");

        let err = store.update(id, running(10)).await.expect_err("regression");
        assert!(matches!(
            err,
            JobStoreError::Transition {
                source: TransitionError::Regression { previous: 3000, next: 10 },
                ..
            }
        ));

        store
            .update(id, JobState::Failed { error: "boom".into() })
            .await
            .expect("fail");
        assert!(store.update(id, running(4000)).await.is_err());
        assert_eq!(store.get(id).await.expect("job").state.label(), "failed");
    }

    #[tokio::test]
    async fn unknown_jobs_are_reported() {
        let store = MemoryJobStore::new();
        let id = Uuid::new_v4();
        assert!(store.get(id).await.is_none());
        assert!(matches!(
            store.update(id, running(1)).await,
            Err(JobStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn purge_only_touches_old_terminal_jobs() {
        let store = MemoryJobStore::new();
        let done = Uuid::new_v4();
        let active = Uuid::new_v4();
        store.create(done).await.expect("create");
        store.create(active).await.expect("create");
        store.update(done, running(0)).await.expect("start");
        store
            .update(done, JobState::Failed { error: "x".into() })
            .await
            .expect("fail");
        store.update(active, running(0)).await.expect("start");

        let now = Utc::now();
        assert_eq!(purge_expired(&store, Duration::from_secs(3600), now).await, 0);

        let later = now + chrono::Duration::hours(2);
        assert_eq!(purge_expired(&store, Duration::from_secs(3600), later).await, 1);
        assert!(store.get(done).await.is_none());
        assert!(store.get(active).await.is_some());
        assert_eq!(store.len().await, 1);
    }
}
