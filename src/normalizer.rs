//! Post-completion normalization of motion logs.
//!
//! Once every batch of a motion recording is stored, its log may contain rows out of
//! order (batches arrive in any order) and rows with repeated timestamps (a recording
//! evicted while idle and later resumed). Normalization rewrites the log with one row
//! per timestamp, ascending.
//!
//! Scheduling is fire-and-forget: [`NormalizerHandle::schedule`] never blocks the
//! request that observed completion. A worker task drains the queue and hands each
//! job to the writer task, which performs the read-rewrite cycle exclusively.

use std::collections::HashSet;

use metrics::counter;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::types::{MOTION_LOG_HEADER, MotionRow};
use crate::writer::WriterHandle;

fn parse_row(line: &str, line_no: usize) -> Result<MotionRow, Error> {
    let corrupt = |detail: String| Error::CorruptLog {
        line: line_no,
        detail,
    };
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let [ts, x, y, z] = fields.as_slice() else {
        return Err(corrupt(format!("expected 4 fields, found {}", fields.len())));
    };
    let timestamp = ts
        .parse::<u64>()
        .map_err(|e| corrupt(format!("timestamp {ts:?}: {e}")))?;
    let axis = |v: &str| {
        v.parse::<f32>()
            .map_err(|e| corrupt(format!("value {v:?}: {e}")))
    };
    Ok(MotionRow {
        timestamp,
        x: axis(*x)?,
        y: axis(*y)?,
        z: axis(*z)?,
    })
}

/// Deduplicate and sort the text of a motion log.
///
/// Skips the `timestamp,x,y,z` header line and blank lines, keeps the first row
/// seen for each timestamp, stable-sorts the rest ascending by timestamp, and
/// renders the result with a fresh header. The output is a fixed point: normalizing
/// it again yields the same text.
///
/// # Errors
///
/// Returns [`Error::CorruptLog`] with the one-based line number of the first row
/// that does not parse.
pub fn normalize_log(contents: &str) -> Result<String, Error> {
    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    for (i, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || (i == 0 && line == MOTION_LOG_HEADER) {
            continue;
        }
        let row = parse_row(line, i + 1)?;
        if seen.insert(row.timestamp) {
            rows.push(row);
        }
    }
    rows.sort_by_key(|r| r.timestamp);

    let mut out = String::with_capacity(contents.len());
    out.push_str(MOTION_LOG_HEADER);
    out.push('\n');
    for row in &rows {
        out.push_str(&row.to_line());
        out.push('\n');
    }
    Ok(out)
}

/// Cloneable handle for scheduling normalization jobs.
///
/// Backed by an unbounded channel so that scheduling from a request handler never
/// waits on the worker.
#[derive(Clone)]
pub struct NormalizerHandle {
    tx: mpsc::UnboundedSender<String>,
}

impl NormalizerHandle {
    /// Create a new `NormalizerHandle` from the sender half of an unbounded channel.
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }

    /// Queue `name` for normalization. Returns `false` if the worker has exited.
    pub fn schedule(&self, name: &str) -> bool {
        match self.tx.send(name.to_string()) {
            Ok(()) => true,
            Err(_) => {
                tracing::error!(recording = %name, "Normalizer closed, job dropped");
                counter!("fitbit_normalizations_total", "result" => "dropped").increment(1);
                false
            }
        }
    }
}

/// Run the normalizer worker loop until every [`NormalizerHandle`] is dropped.
///
/// Jobs are processed one at a time in scheduling order. Failures are logged and
/// counted but never retried; the stored log stays as it was.
pub(crate) async fn run_normalizer(writer: WriterHandle, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(name) = rx.recv().await {
        match writer.normalize(&name).await {
            Ok(rows) => {
                tracing::info!(recording = %name, rows, "Recording normalized");
                counter!("fitbit_normalizations_total", "result" => "ok").increment(1);
            }
            Err(e) => {
                tracing::error!(recording = %name, error = %e, "Normalization failed");
                counter!("fitbit_normalizations_total", "result" => "error").increment(1);
            }
        }
    }
    tracing::debug!("normalizer: channel closed, exiting");
}

/// Spawn the normalizer worker on the tokio runtime.
///
/// The worker holds a clone of `writer`, so the writer task outlives it; drop every
/// `NormalizerHandle` and await the returned `JoinHandle` before awaiting the writer.
///
/// # Returns
///
/// A tuple of:
/// - `NormalizerHandle` -- cloneable scheduler.
/// - `JoinHandle<()>` -- resolves once the queue is drained and closed.
pub fn spawn_normalizer(writer: WriterHandle) -> (NormalizerHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let join_handle = tokio::spawn(run_normalizer(writer, rx));
    (NormalizerHandle::new(tx), join_handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RecordingStore;
    use crate::writer::spawn_writer;

    #[test]
    fn dedups_and_sorts() {
        let log = "timestamp,x,y,z\n\
                   1010,2.0,4.0,6.0\n\
                   1000,1.0,3.0,5.0\n\
                   1010,9.0,9.0,9.0\n\
                   990,0.5,0.5,0.5\n";
        let out = normalize_log(log).expect("normalize");
        assert_eq!(
            out,
            "timestamp,x,y,z\n990,0.5,0.5,0.5\n1000,1.0,3.0,5.0\n1010,2.0,4.0,6.0\n"
        );
    }

    #[test]
    fn first_occurrence_wins() {
        let out = normalize_log("timestamp,x,y,z\n5,1.0,1.0,1.0\n5,2.0,2.0,2.0\n")
            .expect("normalize");
        assert_eq!(out, "timestamp,x,y,z\n5,1.0,1.0,1.0\n");
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_log("timestamp,x,y,z\n30,3.0,3.0,3.0\n10,1.0,1.0,1.0\n")
            .expect("first pass");
        let twice = normalize_log(&once).expect("second pass");
        assert_eq!(once, twice);
    }

    #[test]
    fn empty_log_yields_header_only() {
        assert_eq!(normalize_log("").expect("empty"), "timestamp,x,y,z\n");
        assert_eq!(
            normalize_log("timestamp,x,y,z\n").expect("header only"),
            "timestamp,x,y,z\n"
        );
    }

    #[test]
    fn headerless_rows_are_accepted() {
        let out = normalize_log("20,2.0,2.0,2.0\n10,1.0,1.0,1.0\n").expect("normalize");
        assert_eq!(out, "timestamp,x,y,z\n10,1.0,1.0,1.0\n20,2.0,2.0,2.0\n");
    }

    #[test]
    fn corrupt_rows_report_line_numbers() {
        let err = normalize_log("timestamp,x,y,z\n10,1.0,1.0,1.0\n11,abc,1.0,1.0\n").unwrap_err();
        assert!(matches!(err, Error::CorruptLog { line: 3, .. }), "got: {err:?}");

        let err = normalize_log("timestamp,x,y,z\n-4,1.0,1.0,1.0\n").unwrap_err();
        assert!(matches!(err, Error::CorruptLog { line: 2, .. }), "got: {err:?}");

        let err = normalize_log("x,y,z\n1.0,2.0,3.0\n").unwrap_err();
        assert!(matches!(err, Error::CorruptLog { line: 1, .. }), "got: {err:?}");
    }

    #[tokio::test]
    async fn schedule_loopback() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = NormalizerHandle::new(tx);
        assert!(handle.schedule("trial_acc_a"));
        assert!(handle.schedule("trial_gyro_b"));
        assert_eq!(rx.recv().await.as_deref(), Some("trial_acc_a"));
        assert_eq!(rx.recv().await.as_deref(), Some("trial_gyro_b"));
    }

    #[tokio::test]
    async fn schedule_after_worker_exit_returns_false() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        assert!(!NormalizerHandle::new(tx).schedule("trial_acc_a"));
    }

    #[tokio::test]
    async fn worker_drains_queue_before_exit() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let store = RecordingStore::open(dir.path()).expect("open should succeed");
        for name in ["trial_acc_1", "trial_acc_2"] {
            std::fs::write(
                dir.path().join(name),
                "timestamp,x,y,z\n20,2.0,2.0,2.0\n10,1.0,1.0,1.0\n20,2.0,2.0,2.0\n",
            )
            .expect("seed log");
        }
        let (writer, writer_join) = spawn_writer(store, 8);
        let (normalizer, normalizer_join) = spawn_normalizer(writer.clone());
        drop(writer);

        normalizer.schedule("trial_acc_1");
        normalizer.schedule("trial_acc_missing");
        normalizer.schedule("trial_acc_2");
        drop(normalizer);

        normalizer_join.await.expect("normalizer should exit cleanly");
        writer_join.await.expect("writer should exit cleanly");

        for name in ["trial_acc_1", "trial_acc_2"] {
            let contents = std::fs::read_to_string(dir.path().join(name)).expect("read");
            assert_eq!(contents, "timestamp,x,y,z\n10,1.0,1.0,1.0\n20,2.0,2.0,2.0\n");
        }
    }
}
