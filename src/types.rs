//! Core domain types for the ingestion server.
//!
//! This module defines the data types every other module depends on: sensor kinds
//! and their naming convention, axis sample encodings, decoded batches, motion rows,
//! and the constants that fix the frame geometry and log format.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::error::Error;

/// Name prefix of heart-rate recordings.
pub const HEART_RATE_PREFIX: &str = "trial_hr";

/// Name prefixes of motion recordings (accelerometer and gyroscope).
pub const MOTION_PREFIXES: [&str; 2] = ["trial_acc", "trial_gyro"];

/// Number of spatial axes carried by a motion batch (x, y, z).
pub const AXIS_COUNT: usize = 3;

/// Fixed-point scale applied by the device to int16 samples.
pub const INT16_SCALE: f32 = 100.0;

/// Default nominal spacing between consecutive samples, in timestamp units.
///
/// The device samples at 100 Hz and stamps batches in milliseconds, so
/// consecutive samples are nominally 10 ms apart.
pub const DEFAULT_SAMPLE_INTERVAL: u64 = 10;

/// Maximum length of a recording name in bytes.
pub const MAX_RECORDING_NAME_LEN: usize = 240;

/// Column header of a motion log.
pub const MOTION_LOG_HEADER: &str = "timestamp,x,y,z";

/// Kind of sensor a recording carries, derived from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    /// One raw byte per heart-rate sample; single-request recordings.
    HeartRate,
    /// Tri-axial accelerometer or gyroscope; multi-batch recordings.
    Motion,
}

impl SensorKind {
    /// Classify a recording by its name prefix.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownRecordingKind`] if the name matches neither convention.
    pub fn from_recording_name(name: &str) -> Result<SensorKind, Error> {
        if name.starts_with(HEART_RATE_PREFIX) {
            Ok(SensorKind::HeartRate)
        } else if MOTION_PREFIXES.iter().any(|p| name.starts_with(p)) {
            Ok(SensorKind::Motion)
        } else {
            Err(Error::UnknownRecordingKind(name.to_string()))
        }
    }

    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::HeartRate => "heart_rate",
            SensorKind::Motion => "motion",
        }
    }
}

/// Check that a recording name can be used as a single file name in the data directory.
///
/// # Errors
///
/// Returns [`Error::InvalidRecordingName`] if the name is empty, too long, a
/// relative path component, or contains a path separator or NUL byte.
pub fn validate_recording_name(name: &str) -> Result<(), Error> {
    let bad = name.is_empty()
        || name.len() > MAX_RECORDING_NAME_LEN
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(Error::InvalidRecordingName(name.to_string()));
    }
    Ok(())
}

/// How one axis block encodes its samples.
///
/// The encoding is not self-describing in the frame; the boundary selects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleEncoding {
    /// Signed 16-bit fixed point, divided by [`INT16_SCALE`].
    #[default]
    ScaledInt16,
    /// IEEE 754 single precision, decoded as-is.
    Float32,
}

impl SampleEncoding {
    /// Width of one encoded sample in bytes.
    pub fn width(&self) -> usize {
        match self {
            SampleEncoding::ScaledInt16 => 2,
            SampleEncoding::Float32 => 4,
        }
    }

    /// Wire name of the encoding, as accepted by [`FromStr`].
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleEncoding::ScaledInt16 => "int16",
            SampleEncoding::Float32 => "float32",
        }
    }
}

impl FromStr for SampleEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "int16" => Ok(SampleEncoding::ScaledInt16),
            "float32" => Ok(SampleEncoding::Float32),
            other => Err(format!("unknown sample encoding {other:?}")),
        }
    }
}

impl fmt::Display for SampleEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A heart-rate upload: the whole payload, one raw byte per sample.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartRateBatch {
    /// Raw sample values (0-255).
    pub samples: Bytes,
}

/// One decoded motion frame, before axis decoding.
///
/// # Fields
///
/// * `batch_index` - Zero-based index of this batch within the recording.
/// * `batch_count` - Total number of batches the recording is made of.
/// * `axes` - Raw x, y, z axis blocks, each `batch_size * encoding.width()` bytes.
/// * `initial_timestamp` - Timestamp of the first sample of this batch.
/// * `recording_name` - Name embedded in the frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionBatch {
    /// Zero-based index of this batch within the recording.
    pub batch_index: u16,
    /// Total number of batches the recording is made of.
    pub batch_count: u16,
    /// Raw x, y, z axis blocks.
    pub axes: [Bytes; AXIS_COUNT],
    /// Encoding of every axis block.
    pub encoding: SampleEncoding,
    /// Samples per axis.
    pub batch_size: usize,
    /// Timestamp of the first sample of this batch.
    pub initial_timestamp: u64,
    /// Name embedded in the frame.
    pub recording_name: String,
}

/// A decoded upload, by sensor kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Batch {
    /// Complete heart-rate recording.
    HeartRate(HeartRateBatch),
    /// One batch of a motion recording.
    Motion(MotionBatch),
}

/// One reconstructed motion sample in physical units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionRow {
    /// Synthesized timestamp (see [`crate::samples::reconstruct_rows`]).
    pub timestamp: u64,
    /// X-axis reading.
    pub x: f32,
    /// Y-axis reading.
    pub y: f32,
    /// Z-axis reading.
    pub z: f32,
}

impl MotionRow {
    /// Render the row as a `timestamp,x,y,z` log line, without a line terminator.
    ///
    /// Values use the shortest representation that round-trips and always carry a
    /// decimal point, e.g. `1000,1.0,-0.25,9.81`.
    pub fn to_line(&self) -> String {
        format!("{},{:?},{:?},{:?}", self.timestamp, self.x, self.y, self.z)
    }
}

/// Render heart-rate samples as one comma-joined line, without a line terminator.
pub fn heart_rate_line(samples: &[u8]) -> String {
    samples
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_kind_from_prefix() {
        assert_eq!(
            SensorKind::from_recording_name("trial_hr_001").expect("heart rate"),
            SensorKind::HeartRate
        );
        assert_eq!(
            SensorKind::from_recording_name("trial_acc_2024-1-2_3-4-5-1700000000000")
                .expect("accelerometer"),
            SensorKind::Motion
        );
        assert_eq!(
            SensorKind::from_recording_name("trial_gyro_x").expect("gyroscope"),
            SensorKind::Motion
        );
    }

    #[test]
    fn unknown_prefix_is_rejected() {
        let err = SensorKind::from_recording_name("notes.txt").unwrap_err();
        assert!(matches!(err, Error::UnknownRecordingKind(ref n) if n == "notes.txt"));
    }

    #[test]
    fn recording_name_validation() {
        assert!(validate_recording_name("trial_acc_1").is_ok());
        for bad in ["", ".", "..", "trial_acc/../x", "a\\b", "nul\0byte"] {
            assert!(
                matches!(validate_recording_name(bad), Err(Error::InvalidRecordingName(_))),
                "{bad:?} should be rejected"
            );
        }
        let long = "t".repeat(MAX_RECORDING_NAME_LEN + 1);
        assert!(validate_recording_name(&long).is_err());
    }

    #[test]
    fn encoding_parse_and_width() {
        assert_eq!("int16".parse(), Ok(SampleEncoding::ScaledInt16));
        assert_eq!(" Float32 ".parse(), Ok(SampleEncoding::Float32));
        assert!("f64".parse::<SampleEncoding>().is_err());
        assert_eq!(SampleEncoding::ScaledInt16.width(), 2);
        assert_eq!(SampleEncoding::Float32.width(), 4);
        assert_eq!(SampleEncoding::default(), SampleEncoding::ScaledInt16);
    }

    #[test]
    fn motion_row_line_keeps_decimal_point() {
        let row = MotionRow {
            timestamp: 1000,
            x: 1.0,
            y: 3.0,
            z: -0.25,
        };
        assert_eq!(row.to_line(), "1000,1.0,3.0,-0.25");
    }

    #[test]
    fn heart_rate_line_joins_with_commas() {
        assert_eq!(heart_rate_line(&[10, 20, 30, 40, 50]), "10,20,30,40,50");
        assert_eq!(heart_rate_line(&[255]), "255");
    }
}
