//! Ingestion coordinator.
//!
//! Drives one upload through validation, decoding, receipt tracking, storage, and
//! (on completion) normalization scheduling. The coordinator is transport-agnostic:
//! the HTTP layer extracts an [`Upload`] from a request and maps the returned
//! [`IngestOutcome`] or [`Error`] to a response.
//!
//! For motion uploads the batch index is reserved in the [`ReceiptTracker`] before
//! the rows are appended and committed only after the append is durable. A
//! redelivered or concurrently delivered index is therefore detected before anything
//! is written, and a failed append never leaves a false receipt behind.

use std::sync::Arc;

use bytes::Bytes;
use metrics::{counter, gauge};

use crate::codec;
use crate::error::Error;
use crate::normalizer::NormalizerHandle;
use crate::receipt::{Receipt, ReceiptTracker, Reservation};
use crate::samples::reconstruct_rows;
use crate::types::{
    Batch, DEFAULT_SAMPLE_INTERVAL, MotionBatch, SampleEncoding, SensorKind,
    validate_recording_name,
};
use crate::writer::WriterHandle;

/// Tunables that shape how uploads are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestConfig {
    /// Nominal spacing between consecutive samples, in timestamp units.
    pub sample_interval: u64,
    /// Axis encoding assumed when an upload does not name one.
    pub default_encoding: SampleEncoding,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            default_encoding: SampleEncoding::default(),
        }
    }
}

/// One upload as received from the boundary, before any validation.
///
/// Attributes are kept as raw strings so that absence and unparsability can be
/// reported separately.
#[derive(Debug, Clone, Default)]
pub struct Upload {
    /// Recording name (`X_FITBIT_FILENAME`).
    pub recording_name: Option<String>,
    /// Declared payload length (`Content-Length`).
    pub content_length: Option<String>,
    /// Samples per axis (`X_FITBIT_BATCH_SIZE`), motion only.
    pub batch_size: Option<String>,
    /// Axis encoding (`X_FITBIT_ENCODING`).
    pub encoding: Option<String>,
    /// Payload bytes as received.
    pub body: Bytes,
}

/// Successful result of one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A heart-rate recording was written in full.
    Stored,
    /// A new motion batch was stored; the recording still has missing batches.
    Accepted,
    /// The motion batch was already stored; nothing was written.
    Duplicate,
    /// The last missing motion batch was stored and normalization was scheduled.
    Completed {
        /// Name of the completed recording.
        recording_name: String,
    },
}

impl IngestOutcome {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestOutcome::Stored => "stored",
            IngestOutcome::Accepted => "accepted",
            IngestOutcome::Duplicate => "duplicate",
            IngestOutcome::Completed { .. } => "completed",
        }
    }

    /// Text body reported to the device.
    pub fn body(&self) -> String {
        match self {
            IngestOutcome::Completed { recording_name } => {
                format!("COMPLETED_FILE-{recording_name}")
            }
            _ => "OK".to_string(),
        }
    }
}

fn required<'a>(value: &'a Option<String>, name: &'static str) -> Result<&'a str, Error> {
    value.as_deref().ok_or(Error::MissingAttribute(name))
}

fn parse_content_length(raw: &str) -> Result<usize, Error> {
    raw.trim()
        .parse::<usize>()
        .map_err(|e| Error::InvalidAttribute {
            name: "Content-Length",
            detail: e.to_string(),
        })
}

fn parse_batch_size(raw: &str) -> Result<usize, Error> {
    match raw.trim().parse::<usize>() {
        Ok(0) => Err(Error::InvalidAttribute {
            name: "X_FITBIT_BATCH_SIZE",
            detail: "must be at least 1".into(),
        }),
        Ok(n) => Ok(n),
        Err(e) => Err(Error::InvalidAttribute {
            name: "X_FITBIT_BATCH_SIZE",
            detail: e.to_string(),
        }),
    }
}

/// Shared ingestion coordinator. Cheap to share via `Arc`; every method takes `&self`.
pub struct Ingestor {
    writer: WriterHandle,
    normalizer: NormalizerHandle,
    tracker: Arc<ReceiptTracker>,
    config: IngestConfig,
}

impl Ingestor {
    /// Create a coordinator over the given writer, normalizer, and receipt tracker.
    pub fn new(
        writer: WriterHandle,
        normalizer: NormalizerHandle,
        tracker: Arc<ReceiptTracker>,
        config: IngestConfig,
    ) -> Self {
        Self {
            writer,
            normalizer,
            tracker,
            config,
        }
    }

    /// The receipt tracker shared with the idle sweeper.
    pub fn tracker(&self) -> &Arc<ReceiptTracker> {
        &self.tracker
    }

    /// Ingest one upload.
    ///
    /// Validation and decoding happen before any mutation, so a rejected upload
    /// never creates or touches a log.
    ///
    /// # Returns
    ///
    /// What happened to the upload; see [`IngestOutcome`].
    ///
    /// # Errors
    ///
    /// - Client errors ([`Error::is_client_error`]) for missing or unparsable
    ///   attributes, unknown or unusable names, and malformed or mis-sized frames.
    /// - [`Error::Storage`] or [`Error::WriterClosed`] if the data could not be
    ///   made durable. The batch is not marked as received and may be retried.
    pub async fn ingest(&self, upload: Upload) -> Result<IngestOutcome, Error> {
        let result = self.ingest_inner(&upload).await;
        match &result {
            Ok(outcome) => {
                let kind = upload
                    .recording_name
                    .as_deref()
                    .and_then(|n| SensorKind::from_recording_name(n).ok())
                    .map_or("unknown", |k| k.as_str());
                counter!("fitbit_uploads_total", "kind" => kind, "outcome" => outcome.as_str())
                    .increment(1);
            }
            Err(e) => {
                counter!("fitbit_upload_rejections_total", "reason" => e.reason()).increment(1);
                let name = upload.recording_name.as_deref().unwrap_or("");
                if e.is_client_error() {
                    tracing::warn!(recording = %name, error = %e, "Upload rejected");
                } else {
                    tracing::error!(recording = %name, error = %e, "Upload failed");
                }
            }
        }
        gauge!("fitbit_recordings_tracked").set(self.tracker.active_len() as f64);
        result
    }

    async fn ingest_inner(&self, upload: &Upload) -> Result<IngestOutcome, Error> {
        let name = required(&upload.recording_name, "X_FITBIT_FILENAME")?;
        let content_length = parse_content_length(required(&upload.content_length, "Content-Length")?)?;
        let kind = SensorKind::from_recording_name(name)?;
        validate_recording_name(name)?;

        if content_length != upload.body.len() {
            return Err(Error::SizeMismatch {
                expected: content_length,
                actual: upload.body.len(),
            });
        }

        let encoding = match upload.encoding.as_deref() {
            Some(raw) => raw.parse::<SampleEncoding>().map_err(|detail| Error::InvalidAttribute {
                name: "X_FITBIT_ENCODING",
                detail,
            })?,
            None => self.config.default_encoding,
        };
        let batch_size = match kind {
            SensorKind::Motion => Some(parse_batch_size(required(
                &upload.batch_size,
                "X_FITBIT_BATCH_SIZE",
            )?)?),
            SensorKind::HeartRate => None,
        };

        match codec::decode(kind, upload.body.clone(), batch_size, encoding)? {
            Batch::HeartRate(batch) => {
                let bytes = self
                    .writer
                    .write_heart_rate(name, batch.samples.to_vec())
                    .await?;
                tracing::info!(recording = %name, samples = batch.samples.len(), bytes, "Heart-rate recording stored");
                Ok(IngestOutcome::Stored)
            }
            Batch::Motion(batch) => self.ingest_motion(name, batch).await,
        }
    }

    async fn ingest_motion(&self, name: &str, batch: MotionBatch) -> Result<IngestOutcome, Error> {
        if batch.recording_name != name {
            return Err(Error::MalformedFrame(format!(
                "embedded name {:?} does not match upload name {name:?}",
                batch.recording_name
            )));
        }
        let rows = reconstruct_rows(&batch, self.config.sample_interval)?;

        let guard = match self
            .tracker
            .reserve(name, batch.batch_index, batch.batch_count)?
        {
            Reservation::Fresh(guard) => guard,
            Reservation::Duplicate => {
                tracing::debug!(
                    recording = %name,
                    batch_index = batch.batch_index,
                    "Duplicate batch ignored"
                );
                return Ok(IngestOutcome::Duplicate);
            }
        };

        // Append, commit and scheduling run detached: a client that disconnects
        // mid-request must not release an index the writer is still appending, nor
        // lose the completion signal. A failed append drops the guard and releases
        // the index.
        let writer = self.writer.clone();
        let normalizer = self.normalizer.clone();
        let owned_name = name.to_string();
        let batch_count = batch.batch_count;
        let append = tokio::spawn(async move {
            let bytes = writer.append_motion(&owned_name, rows).await?;
            let receipt = guard.commit();
            if receipt == Receipt::Completed {
                tracing::info!(
                    recording = %owned_name,
                    batch_count,
                    "Recording complete, scheduling normalization"
                );
                normalizer.schedule(&owned_name);
            }
            Ok::<_, Error>((receipt, bytes))
        });
        let (receipt, bytes) = append.await.map_err(|e| {
            tracing::error!(recording = %name, error = %e, "Append task failed");
            Error::WriterClosed
        })??;

        match receipt {
            Receipt::Completed => Ok(IngestOutcome::Completed {
                recording_name: name.to_string(),
            }),
            Receipt::Accepted => {
                tracing::debug!(
                    recording = %name,
                    batch_index = batch.batch_index,
                    batch_count = batch.batch_count,
                    bytes,
                    "Batch stored"
                );
                Ok(IngestOutcome::Accepted)
            }
            Receipt::Duplicate => Ok(IngestOutcome::Duplicate),
        }
    }
}
