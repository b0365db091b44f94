//! Concurrency tests for the ingestion coordinator.
//!
//! These drive [`Ingestor`] directly from many tasks at once, with redeliveries
//! mixed in, to check exactly-once completion and order independence without the
//! HTTP layer in the way.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use fitbit_ingest::codec::encode_motion_frame;
use fitbit_ingest::samples::encode_axis;
use fitbit_ingest::{
    IngestConfig, IngestOutcome, Ingestor, NormalizerHandle, ReceiptTracker, RecordingStore,
    SampleEncoding, Upload, spawn_normalizer, spawn_writer,
};

const BATCH_SIZE: usize = 4;

fn motion_upload(name: &str, index: u16, count: u16) -> Upload {
    let t0 = 1000 + u64::from(index) * (BATCH_SIZE as u64) * 10;
    let x: Vec<f32> = (0..BATCH_SIZE)
        .map(|i| f32::from(index) + i as f32 / 10.0)
        .collect();
    let axis = encode_axis(&x, SampleEncoding::ScaledInt16);
    let frame = encode_motion_frame(index, count, [&axis, &axis, &axis], t0, name);
    Upload {
        recording_name: Some(name.to_string()),
        content_length: Some(frame.len().to_string()),
        batch_size: Some(BATCH_SIZE.to_string()),
        encoding: None,
        body: Bytes::from(frame),
    }
}

fn tracker() -> Arc<ReceiptTracker> {
    Arc::new(ReceiptTracker::new(NonZeroUsize::new(64).expect("nonzero")))
}

/// Deterministic shuffle so failures reproduce.
fn permute(indices: &mut [u16], seed: u64) {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
    for i in (1..indices.len()).rev() {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let j = (state >> 33) as usize % (i + 1);
        indices.swap(i, j);
    }
}

/// Deliver every batch of `name`, each index `copies` times, all concurrently.
async fn deliver_concurrently(
    ingestor: &Arc<Ingestor>,
    name: &str,
    count: u16,
    copies: usize,
    seed: u64,
) -> Vec<IngestOutcome> {
    let mut order: Vec<u16> = (0..count)
        .flat_map(|i| std::iter::repeat_n(i, copies))
        .collect();
    permute(&mut order, seed);

    let tasks: Vec<_> = order
        .into_iter()
        .map(|index| {
            let ingestor = Arc::clone(ingestor);
            let upload = motion_upload(name, index, count);
            tokio::spawn(async move { ingestor.ingest(upload).await })
        })
        .collect();

    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await.expect("join").expect("ingest should succeed"));
    }
    outcomes
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_delivery_completes_exactly_once() {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let store = RecordingStore::open(dir.path()).expect("open should succeed");
    let (writer, _writer_join) = spawn_writer(store, 8);
    let (tx, mut scheduled) = tokio::sync::mpsc::unbounded_channel();
    let ingestor = Arc::new(Ingestor::new(
        writer,
        NormalizerHandle::new(tx),
        tracker(),
        IngestConfig::default(),
    ));

    let outcomes = deliver_concurrently(&ingestor, "trial_acc_race", 24, 3, 7).await;

    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, IngestOutcome::Completed { .. }))
        .count();
    let accepted = outcomes
        .iter()
        .filter(|o| **o == IngestOutcome::Accepted)
        .count();
    let duplicate = outcomes
        .iter()
        .filter(|o| **o == IngestOutcome::Duplicate)
        .count();
    assert_eq!(completed, 1);
    assert_eq!(accepted, 23);
    assert_eq!(duplicate, 48);

    assert_eq!(scheduled.recv().await.as_deref(), Some("trial_acc_race"));
    assert!(scheduled.try_recv().is_err(), "normalization scheduled twice");

    // Every batch's rows are on disk exactly once.
    let log = std::fs::read_to_string(dir.path().join("trial_acc_race")).expect("read log");
    assert_eq!(log.lines().count(), 1 + 24 * BATCH_SIZE);
}

async fn run_and_normalize(data_dir: &Path, name: &str, count: u16, seed: u64) -> String {
    let store = RecordingStore::open(data_dir).expect("open should succeed");
    let (writer, writer_join) = spawn_writer(store, 8);
    let (normalizer, normalizer_join) = spawn_normalizer(writer.clone());
    let ingestor = Arc::new(Ingestor::new(
        writer,
        normalizer,
        tracker(),
        IngestConfig::default(),
    ));

    deliver_concurrently(&ingestor, name, count, 2, seed).await;

    drop(ingestor);
    normalizer_join.await.expect("normalizer should exit cleanly");
    writer_join.await.expect("writer should exit cleanly");
    std::fs::read_to_string(data_dir.join(name)).expect("read log")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delivery_order_does_not_change_normalized_log() {
    let dir_a = tempfile::tempdir().expect("failed to create tempdir");
    let dir_b = tempfile::tempdir().expect("failed to create tempdir");

    let a = run_and_normalize(dir_a.path(), "trial_gyro_o", 10, 1).await;
    let b = run_and_normalize(dir_b.path(), "trial_gyro_o", 10, 99).await;

    assert_eq!(a, b);
    let timestamps: Vec<u64> = a
        .lines()
        .skip(1)
        .map(|l| l.split(',').next().and_then(|t| t.parse().ok()).expect("timestamp"))
        .collect();
    assert_eq!(timestamps.len(), 10 * BATCH_SIZE);
    assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_recordings_do_not_interfere() {
    let dir = tempfile::tempdir().expect("failed to create tempdir");
    let store = RecordingStore::open(dir.path()).expect("open should succeed");
    let (writer, _writer_join) = spawn_writer(store, 8);
    let (tx, mut scheduled) = tokio::sync::mpsc::unbounded_channel();
    let ingestor = Arc::new(Ingestor::new(
        writer,
        NormalizerHandle::new(tx),
        tracker(),
        IngestConfig::default(),
    ));

    let names = ["trial_acc_one", "trial_gyro_two", "trial_acc_three"];
    let runs: Vec<_> = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let ingestor = Arc::clone(&ingestor);
            let name = name.to_string();
            tokio::spawn(async move {
                deliver_concurrently(&ingestor, &name, 6, 2, i as u64).await
            })
        })
        .collect();
    for run in runs {
        run.await.expect("join");
    }

    let mut completed = Vec::new();
    while let Ok(name) = scheduled.try_recv() {
        completed.push(name);
    }
    completed.sort();
    let mut expected: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    expected.sort();
    assert_eq!(completed, expected);
    assert_eq!(ingestor.tracker().active_len(), 0);
}
