//! Embedding worker subsystem.
//!
//! Consumes embedding jobs from the queue and keeps entity vectors consistent
//! with entity content. Jobs are delivered at least once, so `process_job` is
//! idempotent: an entity that already has a vector is skipped unless the job
//! forces a re-embed, and racing jobs on the same entity are safe because the
//! only write is a deterministic function of the text observed at read time.
//!
//! Outcomes are explicit values rather than exceptions: the loop redelivers
//! `Retryable` failures and dead-letters `Poison` jobs by logging them, so a
//! malformed job can never loop forever.

use pgvector::Vector;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;
use wayfind_core::embeddings::EmbeddingBackend;
use wayfind_core::models::entity::EntityKind;
use wayfind_core::store::EntityStore;

/// Delay before a retryable job is put back on the queue.
const REDELIVERY_DELAY: Duration = Duration::from_secs(2);

/// Ephemeral queue message requesting (re-)embedding of one entity.
///
/// `kind` stays a raw string up to `process_job` because unknown kinds arrive
/// from the submission surface and must be rejected as poison, not silently
/// coerced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingJob {
    #[serde(rename = "entityKind")]
    pub kind: String,
    #[serde(rename = "entityId")]
    pub entity_id: Uuid,
    #[serde(default)]
    pub force: bool,
}

/// Successful job resolutions. Everything here drops the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// One provider call made, vector written.
    Embedded,
    /// Entity already has a vector and the job did not force.
    AlreadyEmbedded,
    /// Target row no longer exists; successful no-op.
    EntityMissing,
    /// Canonical text came out empty; nothing to embed.
    EmptyText,
}

#[derive(Error, Debug)]
pub enum JobError {
    /// Unrecognized entity kind. Redelivery cannot fix this, so the loop
    /// dead-letters it instead of retrying.
    #[error("unknown entity kind: {0}")]
    Poison(String),

    /// Transient failure (provider or store). The queue redelivers the job;
    /// there is no local retry loop.
    #[error("retryable embedding failure: {0}")]
    Retryable(#[source] anyhow::Error),
}

/// Process one embedding job against the store and provider.
pub async fn process_job(
    job: &EmbeddingJob,
    store: &dyn EntityStore,
    backend: &dyn EmbeddingBackend,
) -> Result<JobOutcome, JobError> {
    let kind =
        EntityKind::parse(&job.kind).ok_or_else(|| JobError::Poison(job.kind.clone()))?;

    let entity = store
        .load(kind, job.entity_id)
        .await
        .map_err(|e| JobError::Retryable(e.into()))?;

    let entity = match entity {
        Some(entity) => entity,
        None => {
            tracing::info!(kind = %kind, id = %job.entity_id, "Entity not found, dropping job");
            return Ok(JobOutcome::EntityMissing);
        }
    };

    if !job.force && entity.has_embedding() {
        tracing::debug!(kind = %kind, id = %job.entity_id, "Vector already populated, skipping");
        return Ok(JobOutcome::AlreadyEmbedded);
    }

    let text = entity.canonical_text();
    if text.is_empty() {
        tracing::info!(kind = %kind, id = %job.entity_id, "Empty canonical text, nothing to embed");
        return Ok(JobOutcome::EmptyText);
    }

    let values = backend
        .embed(&text)
        .await
        .map_err(|e| JobError::Retryable(e.into()))?;

    store
        .save_embedding(kind, job.entity_id, Vector::from(values))
        .await
        .map_err(|e| JobError::Retryable(e.into()))?;

    tracing::info!(
        kind = %kind,
        id = %job.entity_id,
        backend = backend.name(),
        force = job.force,
        "Embedded entity"
    );
    Ok(JobOutcome::Embedded)
}

/// Build the in-process job queue. The sender is the submission surface.
pub fn job_channel(capacity: usize) -> (mpsc::Sender<EmbeddingJob>, mpsc::Receiver<EmbeddingJob>) {
    mpsc::channel(capacity)
}

/// Run the worker loop until the queue closes or shutdown fires.
///
/// Retryable failures are redelivered through `redeliver` after a delay,
/// modeling the broker's at-least-once behavior; poison jobs are logged and
/// dropped.
pub async fn run_embedding_worker(
    mut jobs: mpsc::Receiver<EmbeddingJob>,
    redeliver: mpsc::Sender<EmbeddingJob>,
    store: Arc<dyn EntityStore>,
    backend: Arc<dyn EmbeddingBackend>,
    mut shutdown: broadcast::Receiver<()>,
) {
    tracing::info!(backend = backend.name(), "Embedding worker started");

    loop {
        let job = tokio::select! {
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
            _ = shutdown.recv() => {
                tracing::info!("Embedding worker shutting down");
                break;
            }
        };

        match process_job(&job, store.as_ref(), backend.as_ref()).await {
            Ok(outcome) => {
                tracing::debug!(id = %job.entity_id, ?outcome, "Job resolved");
            }
            Err(JobError::Poison(kind)) => {
                tracing::error!(
                    kind = %kind,
                    id = %job.entity_id,
                    "Dead-lettering job with unknown entity kind"
                );
            }
            Err(JobError::Retryable(e)) => {
                tracing::warn!(id = %job.entity_id, error = %e, "Job failed, scheduling redelivery");
                let redeliver = redeliver.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(REDELIVERY_DELAY).await;
                    if redeliver.send(job).await.is_err() {
                        tracing::warn!("Queue closed before redelivery");
                    }
                });
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use wayfind_core::embeddings::EmbeddingError;
    use wayfind_core::models::entity::{Destination, EmbeddableEntity};
    use wayfind_core::store::StoreError;

    /// In-memory entity store with save bookkeeping.
    struct MemoryEntityStore {
        entities: Mutex<HashMap<Uuid, EmbeddableEntity>>,
        saved: Mutex<Vec<(EntityKind, Uuid, Vec<f32>)>>,
    }

    impl MemoryEntityStore {
        fn new() -> Self {
            Self {
                entities: Mutex::new(HashMap::new()),
                saved: Mutex::new(Vec::new()),
            }
        }

        fn insert(&self, entity: EmbeddableEntity) {
            self.entities.lock().unwrap().insert(entity.id(), entity);
        }

        fn saves(&self) -> usize {
            self.saved.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl EntityStore for MemoryEntityStore {
        async fn load(
            &self,
            _kind: EntityKind,
            id: Uuid,
        ) -> Result<Option<EmbeddableEntity>, StoreError> {
            Ok(self.entities.lock().unwrap().get(&id).cloned())
        }

        async fn save_embedding(
            &self,
            kind: EntityKind,
            id: Uuid,
            embedding: Vector,
        ) -> Result<(), StoreError> {
            let values = embedding.as_slice().to_vec();
            self.saved.lock().unwrap().push((kind, id, values.clone()));

            let mut entities = self.entities.lock().unwrap();
            if let Some(EmbeddableEntity::Destination(d)) = entities.get_mut(&id) {
                d.embedding = Some(Vector::from(values));
            }
            Ok(())
        }
    }

    /// Backend that returns a fixed vector and counts calls.
    struct MockBackend {
        calls: AtomicUsize,
        fail: bool,
    }

    impl MockBackend {
        fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmbeddingBackend for MockBackend {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(EmbeddingError::Api {
                    code: 500,
                    message: "provider down".to_string(),
                })
            } else {
                Ok(vec![0.25; 1024])
            }
        }

        fn dimensions(&self) -> usize {
            1024
        }

        fn name(&self) -> &str {
            "mock"
        }
    }

    fn kyoto(id: Uuid) -> EmbeddableEntity {
        EmbeddableEntity::Destination(Destination {
            id,
            name: "Kyoto".to_string(),
            country: "Japan".to_string(),
            region: None,
            description: Some("Historic temples".to_string()),
            activities: vec!["hiking".to_string(), "cultural".to_string()],
            embedding: None,
        })
    }

    fn job(id: Uuid, force: bool) -> EmbeddingJob {
        EmbeddingJob {
            kind: "destination".to_string(),
            entity_id: id,
            force,
        }
    }

    #[tokio::test]
    async fn embeds_unembedded_entity_with_one_provider_call() {
        let store = MemoryEntityStore::new();
        let id = Uuid::new_v4();
        store.insert(kyoto(id));
        let backend = MockBackend::ok();

        let outcome = process_job(&job(id, false), &store, &backend).await.unwrap();

        assert_eq!(outcome, JobOutcome::Embedded);
        assert_eq!(backend.calls(), 1);
        assert_eq!(store.saves(), 1);
        let saved = store.saved.lock().unwrap();
        assert_eq!(saved[0].2.len(), 1024);
    }

    #[tokio::test]
    async fn repeat_job_without_force_is_a_no_op() {
        let store = MemoryEntityStore::new();
        let id = Uuid::new_v4();
        store.insert(kyoto(id));
        let backend = MockBackend::ok();

        process_job(&job(id, false), &store, &backend).await.unwrap();
        let second = process_job(&job(id, false), &store, &backend).await.unwrap();

        assert_eq!(second, JobOutcome::AlreadyEmbedded);
        assert_eq!(backend.calls(), 1, "second run must not call the provider");
        assert_eq!(store.saves(), 1, "second run must not write");
    }

    #[tokio::test]
    async fn force_overrides_existing_vector() {
        let store = MemoryEntityStore::new();
        let id = Uuid::new_v4();
        store.insert(kyoto(id));
        let backend = MockBackend::ok();

        process_job(&job(id, false), &store, &backend).await.unwrap();
        let forced = process_job(&job(id, true), &store, &backend).await.unwrap();

        assert_eq!(forced, JobOutcome::Embedded);
        assert_eq!(backend.calls(), 2);
        assert_eq!(store.saves(), 2);
    }

    #[tokio::test]
    async fn unknown_kind_is_poison_not_retryable() {
        let store = MemoryEntityStore::new();
        let backend = MockBackend::ok();
        let bad_job = EmbeddingJob {
            kind: "spaceport".to_string(),
            entity_id: Uuid::new_v4(),
            force: false,
        };

        match process_job(&bad_job, &store, &backend).await {
            Err(JobError::Poison(kind)) => assert_eq!(kind, "spaceport"),
            other => panic!("Expected Poison, got {:?}", other),
        }
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn missing_entity_is_dropped_silently() {
        let store = MemoryEntityStore::new();
        let backend = MockBackend::ok();

        let outcome = process_job(&job(Uuid::new_v4(), false), &store, &backend)
            .await
            .unwrap();

        assert_eq!(outcome, JobOutcome::EntityMissing);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn empty_canonical_text_skips_provider() {
        let store = MemoryEntityStore::new();
        let id = Uuid::new_v4();
        store.insert(EmbeddableEntity::Destination(Destination {
            id,
            name: "  ".to_string(),
            country: "".to_string(),
            region: None,
            description: None,
            activities: vec![],
            embedding: None,
        }));
        let backend = MockBackend::ok();

        let outcome = process_job(&job(id, false), &store, &backend).await.unwrap();

        assert_eq!(outcome, JobOutcome::EmptyText);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn provider_failure_propagates_as_retryable() {
        let store = MemoryEntityStore::new();
        let id = Uuid::new_v4();
        store.insert(kyoto(id));
        let backend = MockBackend::failing();

        match process_job(&job(id, false), &store, &backend).await {
            Err(JobError::Retryable(_)) => {}
            other => panic!("Expected Retryable, got {:?}", other),
        }
        assert_eq!(store.saves(), 0, "failed job must not write");
    }

    #[tokio::test]
    async fn worker_loop_drains_queue_and_stops_on_close() {
        let store = Arc::new(MemoryEntityStore::new());
        let id = Uuid::new_v4();
        store.insert(kyoto(id));
        let backend = Arc::new(MockBackend::ok());

        let (tx, rx) = job_channel(8);
        let (shutdown_tx, _) = broadcast::channel(1);

        tx.send(job(id, false)).await.unwrap();
        tx.send(job(id, false)).await.unwrap();

        let redeliver = tx.clone();
        drop(tx);
        let worker = tokio::spawn(run_embedding_worker(
            rx,
            redeliver,
            store.clone(),
            backend.clone(),
            shutdown_tx.subscribe(),
        ));

        // Queue closes once the last sender (redeliver clone) drops with the
        // worker; give it a moment to drain, then shut down.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = shutdown_tx.send(());
        worker.await.unwrap();

        assert_eq!(backend.calls(), 1, "duplicate job must be skipped");
        assert_eq!(store.saves(), 1);
    }
}
