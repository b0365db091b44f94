//! Single-writer task for the recording store.
//!
//! This module provides the `WriterRequest` enum and the `WriterHandle` that the
//! ingestion coordinator and the normalizer use to submit work to the writer task
//! via a bounded `tokio::mpsc` channel. The writer task owns the
//! [`RecordingStore`] outright, so motion appends, heart-rate writes, and
//! normalization rewrites are applied strictly one at a time.

use tokio::sync::{mpsc, oneshot};

use crate::error::Error;
use crate::normalizer::normalize_log;
use crate::store::RecordingStore;
use crate::types::MotionRow;

/// A unit of work for the writer task, sent via the mpsc channel.
///
/// Each variant carries a oneshot sender for the result of the operation.
pub enum WriterRequest {
    /// Append rows to a motion log, creating it on first use.
    AppendMotion {
        /// Recording name (storage key).
        name: String,
        /// Rows reconstructed from one batch.
        rows: Vec<MotionRow>,
        /// Bytes appended, or the failure.
        response_tx: oneshot::Sender<Result<usize, Error>>,
    },
    /// Write (or replace) a heart-rate log.
    WriteHeartRate {
        /// Recording name (storage key).
        name: String,
        /// Raw sample bytes.
        samples: Vec<u8>,
        /// Bytes written, or the failure.
        response_tx: oneshot::Sender<Result<usize, Error>>,
    },
    /// Read, deduplicate, sort, and atomically rewrite a motion log.
    Normalize {
        /// Recording name (storage key).
        name: String,
        /// Number of rows in the rewritten log, or the failure.
        response_tx: oneshot::Sender<Result<usize, Error>>,
    },
}

impl WriterRequest {
    fn name(&self) -> &str {
        match self {
            WriterRequest::AppendMotion { name, .. }
            | WriterRequest::WriteHeartRate { name, .. }
            | WriterRequest::Normalize { name, .. } => name,
        }
    }
}

/// Cloneable handle for submitting requests to the writer task.
///
/// Cloning a `WriterHandle` produces a second sender into the same channel, so
/// request handlers and the normalizer can submit work concurrently while the
/// writer applies it sequentially.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<WriterRequest>,
}

impl WriterHandle {
    /// Create a new `WriterHandle` from the sender half of an mpsc channel.
    ///
    /// # Arguments
    ///
    /// * `tx` - Sender half of the bounded mpsc channel to the writer task.
    pub fn new(tx: mpsc::Sender<WriterRequest>) -> Self {
        Self { tx }
    }

    /// Append `rows` to the motion log of `name` and wait until they are durable.
    ///
    /// # Returns
    ///
    /// The number of bytes appended.
    ///
    /// # Errors
    ///
    /// - Returns the store's error (e.g. `Storage`) if the append fails.
    /// - Returns `Error::WriterClosed` if the writer task has shut down.
    pub async fn append_motion(&self, name: &str, rows: Vec<MotionRow>) -> Result<usize, Error> {
        let (response_tx, response_rx) = oneshot::channel();
        self.submit(
            WriterRequest::AppendMotion {
                name: name.to_string(),
                rows,
                response_tx,
            },
            response_rx,
        )
        .await
    }

    /// Write the heart-rate log of `name` and wait until it is durable.
    ///
    /// # Errors
    ///
    /// Same as [`append_motion`](Self::append_motion).
    pub async fn write_heart_rate(&self, name: &str, samples: Vec<u8>) -> Result<usize, Error> {
        let (response_tx, response_rx) = oneshot::channel();
        self.submit(
            WriterRequest::WriteHeartRate {
                name: name.to_string(),
                samples,
                response_tx,
            },
            response_rx,
        )
        .await
    }

    /// Normalize the motion log of `name` in place.
    ///
    /// # Returns
    ///
    /// The number of rows left after deduplication.
    ///
    /// # Errors
    ///
    /// - Returns `Error::CorruptLog` if a row cannot be parsed; the log is untouched.
    /// - Returns `Error::Storage` if the log cannot be read or rewritten.
    /// - Returns `Error::WriterClosed` if the writer task has shut down.
    pub async fn normalize(&self, name: &str) -> Result<usize, Error> {
        let (response_tx, response_rx) = oneshot::channel();
        self.submit(
            WriterRequest::Normalize {
                name: name.to_string(),
                response_tx,
            },
            response_rx,
        )
        .await
    }

    async fn submit(
        &self,
        request: WriterRequest,
        response_rx: oneshot::Receiver<Result<usize, Error>>,
    ) -> Result<usize, Error> {
        self.tx
            .send(request)
            .await
            .map_err(|_| Error::WriterClosed)?;

        // A dropped oneshot means the writer task panicked or was cancelled.
        response_rx.await.map_err(|_| Error::WriterClosed)?
    }
}

/// Read, normalize, and rewrite one motion log. Returns the number of rows kept.
fn normalize_in_place(store: &mut RecordingStore, name: &str) -> Result<usize, Error> {
    let contents = store.read_log(name)?;
    let normalized = normalize_log(&contents)?;
    store.rewrite(name, &normalized)?;
    Ok(normalized.lines().count().saturating_sub(1))
}

fn apply(store: &mut RecordingStore, request: WriterRequest) {
    let name = request.name().to_string();
    let delivered = match request {
        WriterRequest::AppendMotion {
            name,
            rows,
            response_tx,
        } => response_tx.send(store.append_motion(&name, &rows)).is_ok(),
        WriterRequest::WriteHeartRate {
            name,
            samples,
            response_tx,
        } => response_tx
            .send(store.write_heart_rate(&name, &samples))
            .is_ok(),
        WriterRequest::Normalize { name, response_tx } => response_tx
            .send(normalize_in_place(store, &name))
            .is_ok(),
    };
    if !delivered {
        tracing::warn!(recording = %name, "writer: response receiver dropped");
    }
}

/// Run the writer task loop.
///
/// Receives requests from the bounded mpsc channel and applies each to the store
/// in arrival order. The first request is received via `recv()`, then any other
/// pending requests are drained with `try_recv()`. The loop exits once all
/// senders are dropped and the queue is empty.
///
/// # Arguments
///
/// * `store` - The recording store, owned by this task for its lifetime.
/// * `rx` - Receiver half of the bounded mpsc channel.
pub(crate) async fn run_writer(mut store: RecordingStore, mut rx: mpsc::Receiver<WriterRequest>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(req) = rx.try_recv() {
            batch.push(req);
        }
        for req in batch {
            apply(&mut store, req);
        }
    }
    tracing::debug!("writer: channel closed, exiting");
}

/// Spawn the writer task on the tokio runtime.
///
/// # Arguments
///
/// * `store` - The recording store to move into the writer task.
/// * `channel_capacity` - Bound on the mpsc channel. Controls backpressure.
///
/// # Returns
///
/// A tuple of:
/// - `WriterHandle` -- cloneable sender for submitting requests.
/// - `JoinHandle<()>` -- handle to await graceful shutdown of the writer task.
pub fn spawn_writer(
    store: RecordingStore,
    channel_capacity: usize,
) -> (WriterHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(channel_capacity);
    let join_handle = tokio::spawn(run_writer(store, rx));
    (WriterHandle::new(tx), join_handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(timestamp: u64, v: f32) -> MotionRow {
        MotionRow {
            timestamp,
            x: v,
            y: v,
            z: v,
        }
    }

    fn temp_store() -> (RecordingStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let store = RecordingStore::open(dir.path()).expect("open should succeed");
        (store, dir)
    }

    #[tokio::test]
    async fn append_motion_loopback() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = WriterHandle::new(tx);

        tokio::spawn(async move {
            let req = rx.recv().await.expect("should receive a request");
            match req {
                WriterRequest::AppendMotion {
                    name,
                    rows,
                    response_tx,
                } => {
                    assert_eq!(name, "trial_acc_a");
                    assert_eq!(rows.len(), 2);
                    let _ = response_tx.send(Ok(42));
                }
                _ => panic!("expected AppendMotion"),
            }
        });

        let n = handle
            .append_motion("trial_acc_a", vec![row(0, 1.0), row(10, 2.0)])
            .await
            .expect("append should succeed");
        assert_eq!(n, 42);
    }

    #[tokio::test]
    async fn closed_channel_is_writer_closed() {
        let (tx, rx) = mpsc::channel(8);
        let handle = WriterHandle::new(tx);
        drop(rx);

        let err = handle.write_heart_rate("trial_hr_1", vec![1]).await.unwrap_err();
        assert!(matches!(err, Error::WriterClosed), "got: {err:?}");
    }

    #[tokio::test]
    async fn dropped_response_is_writer_closed() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = WriterHandle::new(tx);

        tokio::spawn(async move {
            // Receive and drop the request without replying.
            let _ = rx.recv().await;
        });

        let err = handle.normalize("trial_acc_a").await.unwrap_err();
        assert!(matches!(err, Error::WriterClosed), "got: {err:?}");
    }

    #[tokio::test]
    async fn spawned_writer_appends_and_normalizes() {
        let (store, dir) = temp_store();
        let (handle, join_handle) = spawn_writer(store, 8);

        handle
            .append_motion("trial_acc_n", vec![row(1010, 2.0), row(1020, 3.0)])
            .await
            .expect("append batch 1");
        handle
            .append_motion("trial_acc_n", vec![row(1000, 1.0), row(1010, 9.0)])
            .await
            .expect("append batch 0");

        let rows = handle.normalize("trial_acc_n").await.expect("normalize");
        assert_eq!(rows, 3);

        drop(handle);
        join_handle.await.expect("writer task should exit cleanly");

        let contents = std::fs::read_to_string(dir.path().join("trial_acc_n")).expect("read");
        assert_eq!(
            contents,
            "timestamp,x,y,z\n1000,1.0,1.0,1.0\n1010,2.0,2.0,2.0\n1020,3.0,3.0,3.0\n"
        );
    }

    #[tokio::test]
    async fn concurrent_appends_are_not_interleaved() {
        let (store, dir) = temp_store();
        let (handle, join_handle) = spawn_writer(store, 4);

        let mut tasks = Vec::new();
        for batch in 0..8u64 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                let rows: Vec<_> = (0..50).map(|i| row(batch * 1000 + i, batch as f32)).collect();
                handle.append_motion("trial_gyro_c", rows).await
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("append should succeed");
        }
        drop(handle);
        join_handle.await.expect("writer task should exit cleanly");

        let contents = std::fs::read_to_string(dir.path().join("trial_gyro_c")).expect("read");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "timestamp,x,y,z");
        assert_eq!(lines.len(), 1 + 8 * 50);
        // Each batch's rows are contiguous.
        for chunk in lines[1..].chunks(50) {
            let first_batch = chunk[0].split(',').nth(1).expect("x column");
            assert!(chunk.iter().all(|l| l.split(',').nth(1) == Some(first_batch)));
        }
    }

    #[tokio::test]
    async fn corrupt_log_is_left_untouched() {
        let (store, dir) = temp_store();
        let path = dir.path().join("trial_acc_bad");
        std::fs::write(&path, "timestamp,x,y,z\n10,1.0,1.0\n").expect("seed log");
        let (handle, join_handle) = spawn_writer(store, 8);

        let err = handle.normalize("trial_acc_bad").await.unwrap_err();
        assert!(matches!(err, Error::CorruptLog { line: 2, .. }), "got: {err:?}");

        drop(handle);
        join_handle.await.expect("writer task should exit cleanly");
        assert_eq!(
            std::fs::read_to_string(&path).expect("read"),
            "timestamp,x,y,z\n10,1.0,1.0\n"
        );
    }

    #[tokio::test]
    async fn retry_after_torn_append_still_normalizes() {
        let (store, dir) = temp_store();
        let path = dir.path().join("trial_acc_torn");
        std::fs::write(&path, "timestamp,x,y,z\n1000,1.0,1.0,1.0\n1010,2.").expect("seed log");
        let (handle, join_handle) = spawn_writer(store, 8);

        handle
            .append_motion("trial_acc_torn", vec![row(1010, 2.0), row(1020, 3.0)])
            .await
            .expect("retried append should succeed");
        let rows = handle
            .normalize("trial_acc_torn")
            .await
            .expect("normalize should succeed");
        assert_eq!(rows, 3);

        drop(handle);
        join_handle.await.expect("writer task should exit cleanly");
        assert_eq!(
            std::fs::read_to_string(&path).expect("read"),
            "timestamp,x,y,z\n1000,1.0,1.0,1.0\n1010,2.0,2.0,2.0\n1020,3.0,3.0,3.0\n"
        );
    }

    #[tokio::test]
    async fn queued_requests_finish_before_exit() {
        let (store, dir) = temp_store();
        let (handle, join_handle) = spawn_writer(store, 16);

        let pending: Vec<_> = (0..5u8)
            .map(|i| {
                let handle = handle.clone();
                tokio::spawn(async move {
                    handle
                        .write_heart_rate(&format!("trial_hr_{i}"), vec![i, i])
                        .await
                })
            })
            .collect();
        drop(handle);
        for p in pending {
            p.await.expect("join").expect("write should succeed");
        }
        join_handle.await.expect("writer task should exit cleanly");

        for i in 0..5u8 {
            let contents =
                std::fs::read_to_string(dir.path().join(format!("trial_hr_{i}"))).expect("read");
            assert_eq!(contents, format!("{i},{i}\n"));
        }
    }
}
