//! Bounded shard upload workers.
//!
//! Jobs are enqueued in ascending base order and picked up in that order.
//! A shard becomes durable only when the remote put succeeds; only then is
//! its local building file renamed to the final artifact name. Re-uploads
//! are no-ops: an object that already exists remotely is never rewritten.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chainsift_core::{SearchError, SearchResult};
use chainsift_store::Store;
use tokio::sync::{mpsc, watch, Mutex, Notify};

const MAX_UPLOAD_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct UploadJob {
    pub base: u64,
    /// Sealed artifact waiting on disk.
    pub building_path: PathBuf,
    /// Local read-only name the file takes once durable.
    pub final_path: PathBuf,
    /// Object name in the shard store.
    pub remote_name: String,
}

pub struct Uploader {
    queue: mpsc::Sender<UploadJob>,
    pending: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    /// Set once on the first terminal failure; the pipeline watches it.
    failure: watch::Receiver<Option<String>>,
}

impl Uploader {
    pub fn new(store: Arc<dyn Store>, workers: usize, delete_after_upload: bool) -> Self {
        let (tx, rx) = mpsc::channel::<UploadJob>(64);
        let rx = Arc::new(Mutex::new(rx));
        let pending = Arc::new(AtomicUsize::new(0));
        let drained = Arc::new(Notify::new());
        let (failure_tx, failure_rx) = watch::channel(None);
        let failure_tx = Arc::new(failure_tx);

        for worker in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let store = Arc::clone(&store);
            let pending = Arc::clone(&pending);
            let drained = Arc::clone(&drained);
            let failure_tx = Arc::clone(&failure_tx);
            tokio::spawn(async move {
                loop {
                    let maybe_job = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(job) = maybe_job else { break };

                    let base = job.base;
                    let result = upload_one(store.as_ref(), &job, delete_after_upload).await;
                    if let Err(err) = result {
                        tracing::error!(worker, base, %err, "shard upload failed terminally");
                        failure_tx.send_replace(Some(err.to_string()));
                    }
                    if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                        drained.notify_waiters();
                    }
                }
            });
        }

        Self {
            queue: tx,
            pending,
            drained,
            failure: failure_rx,
        }
    }

    pub async fn enqueue(&self, job: UploadJob) -> SearchResult<()> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.queue.send(job).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            SearchError::internal("upload queue closed")
        })
    }

    /// First terminal upload failure, if any. Escalates to pipeline
    /// shutdown.
    pub fn failure(&self) -> Option<String> {
        self.failure.borrow().clone()
    }

    /// Shutdown barrier: resolves when every enqueued upload finished.
    pub async fn wait_on_uploads(&self) {
        while self.pending.load(Ordering::SeqCst) > 0 {
            let notified = self.drained.notified();
            if self.pending.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
    }
}

async fn upload_one(
    store: &dyn Store,
    job: &UploadJob,
    delete_after_upload: bool,
) -> SearchResult<()> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match try_upload(store, job).await {
            Ok(()) => break,
            Err(err) if attempt < MAX_UPLOAD_ATTEMPTS => {
                let backoff = BACKOFF_BASE * 2u32.pow(attempt - 1);
                tracing::warn!(
                    base = job.base,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    %err,
                    "shard upload failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }

    if delete_after_upload {
        tokio::fs::remove_file(&job.building_path).await?;
    } else {
        tokio::fs::rename(&job.building_path, &job.final_path).await?;
    }
    tracing::info!(base = job.base, remote = %job.remote_name, "shard durable");
    Ok(())
}

async fn try_upload(store: &dyn Store, job: &UploadJob) -> SearchResult<()> {
    let exists = store
        .exists(&job.remote_name)
        .await
        .map_err(|err| SearchError::internal(format!("checking {}: {err}", job.remote_name)))?;
    if exists {
        tracing::info!(base = job.base, "shard already durable, skipping upload");
        return Ok(());
    }

    let body = tokio::fs::read(&job.building_path).await?;
    store
        .put_object(&job.remote_name, Bytes::from(body))
        .await
        .map_err(|err| SearchError::internal(format!("uploading {}: {err}", job.remote_name)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsift_store::MemStore;
    use tempfile::TempDir;

    fn job(dir: &TempDir, base: u64, body: &[u8]) -> UploadJob {
        let building = dir.path().join(format!("{base:010}.avro.building"));
        std::fs::write(&building, body).unwrap();
        UploadJob {
            base,
            building_path: building,
            final_path: dir.path().join(format!("{base:010}.avro")),
            remote_name: format!("bigquery-shards-100/{base:010}.avro"),
        }
    }

    #[tokio::test]
    async fn uploads_then_renames_local_file() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemStore::new());
        let uploader = Uploader::new(Arc::clone(&store) as Arc<dyn Store>, 2, false);

        uploader.enqueue(job(&dir, 0, b"artifact")).await.unwrap();
        uploader.wait_on_uploads().await;

        assert!(store
            .get_object("bigquery-shards-100/0000000000.avro")
            .await
            .is_ok());
        assert!(dir.path().join("0000000000.avro").exists());
        assert!(!dir.path().join("0000000000.avro.building").exists());
        assert!(uploader.failure().is_none());
    }

    #[tokio::test]
    async fn existing_remote_object_is_not_rewritten() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemStore::new());
        store
            .put_object(
                "bigquery-shards-100/0000000000.avro",
                Bytes::from_static(b"original"),
            )
            .await
            .unwrap();

        let uploader = Uploader::new(Arc::clone(&store) as Arc<dyn Store>, 1, false);
        uploader.enqueue(job(&dir, 0, b"replacement")).await.unwrap();
        uploader.wait_on_uploads().await;

        // At-most-once durable write: the first object wins.
        assert_eq!(
            store
                .get_object("bigquery-shards-100/0000000000.avro")
                .await
                .unwrap(),
            Bytes::from_static(b"original")
        );
    }

    #[tokio::test]
    async fn delete_after_upload_removes_the_local_file() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemStore::new());
        let uploader = Uploader::new(Arc::clone(&store) as Arc<dyn Store>, 1, true);

        uploader.enqueue(job(&dir, 100, b"artifact")).await.unwrap();
        uploader.wait_on_uploads().await;

        assert!(!dir.path().join("0000000100.avro.building").exists());
        assert!(!dir.path().join("0000000100.avro").exists());
    }

    #[tokio::test]
    async fn missing_building_file_is_a_terminal_failure() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemStore::new());
        let uploader = Uploader::new(Arc::clone(&store) as Arc<dyn Store>, 1, false);

        tokio::time::pause();
        uploader
            .enqueue(UploadJob {
                base: 0,
                building_path: dir.path().join("absent.avro.building"),
                final_path: dir.path().join("absent.avro"),
                remote_name: "bigquery-shards-100/0000000000.avro".into(),
            })
            .await
            .unwrap();
        uploader.wait_on_uploads().await;
        assert!(uploader.failure().is_some());
    }
}
