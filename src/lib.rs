//! fitbit-ingest: an ingestion server for wearable sensor recordings.
//!
//! A companion app uploads recordings in pieces: heart-rate recordings in a single
//! request, accelerometer and gyroscope recordings as numbered binary batches that
//! may arrive out of order, more than once, and concurrently. The server decodes
//! each batch, appends it to the recording's log exactly once, and normalizes the
//! log (deduplicated, sorted by timestamp) once every batch has arrived.

pub mod codec;
pub mod error;
pub mod http;
pub mod ingest;
pub mod metrics;
pub mod normalizer;
pub mod receipt;
pub mod samples;
pub mod store;
pub mod types;
pub mod writer;

pub use error::Error;
pub use ingest::{IngestConfig, IngestOutcome, Ingestor, Upload};
pub use normalizer::{NormalizerHandle, normalize_log, spawn_normalizer};
pub use receipt::{Receipt, ReceiptTracker, RecordingState};
pub use store::RecordingStore;
pub use types::{MotionRow, SampleEncoding, SensorKind};
pub use writer::{WriterHandle, spawn_writer};
