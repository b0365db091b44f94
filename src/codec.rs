//! Wire decoder for upload payloads.
//!
//! This module parses the raw body of one upload into a typed [`Batch`]. It is pure
//! data transformation -- no file I/O, no async, no receipt tracking.
//!
//! A heart-rate payload is the sample sequence itself, one byte per sample. A motion
//! payload is a single little-endian frame:
//!
//! ```text
//! u16 batch_index | u16 batch_count | axis x | axis y | axis z
//!     | u16 ts_len | ts_len bytes (ASCII decimal) | u16 name_len | name_len bytes (UTF-8)
//! ```
//!
//! where each axis block is `batch_size * encoding.width()` bytes. The text fields are
//! length-prefixed, so the frame is self-delimiting and any trailing byte is an error.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Error;
use crate::types::{
    AXIS_COUNT, Batch, HeartRateBatch, MotionBatch, SampleEncoding, SensorKind,
};

/// Size of the fixed frame header: batch_index(2) + batch_count(2).
pub const MOTION_HEADER_SIZE: usize = 4;

/// Size of each text field's length prefix.
const TEXT_LEN_PREFIX_SIZE: usize = 2;

/// Forward-only cursor over a payload that never reads past its end.
struct Cursor {
    buf: Bytes,
}

impl Cursor {
    fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Split off the next `n` bytes, or `None` if fewer remain.
    fn take(&mut self, n: usize) -> Option<Bytes> {
        (self.buf.len() >= n).then(|| self.buf.split_to(n))
    }

    fn u16_le(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read a `u16`-length-prefixed text field.
    fn text(&mut self, field: &str) -> Result<Bytes, Error> {
        let len = self
            .u16_le()
            .ok_or_else(|| Error::MalformedFrame(format!("{field} length prefix truncated")))?;
        self.take(len as usize).ok_or_else(|| {
            Error::MalformedFrame(format!(
                "{field} declares {len} bytes but only {} remain",
                self.remaining()
            ))
        })
    }
}

/// Number of bytes the fixed part of a motion frame (header plus axis blocks) occupies.
///
/// # Errors
///
/// Returns [`Error::MalformedFrame`] if `batch_size` is zero or the geometry overflows.
pub fn motion_fixed_len(batch_size: usize, encoding: SampleEncoding) -> Result<usize, Error> {
    if batch_size == 0 {
        return Err(Error::MalformedFrame("batch size must be positive".into()));
    }
    batch_size
        .checked_mul(encoding.width())
        .and_then(|axis| axis.checked_mul(AXIS_COUNT))
        .and_then(|axes| axes.checked_add(MOTION_HEADER_SIZE))
        .ok_or_else(|| Error::MalformedFrame(format!("batch size {batch_size} is too large")))
}

/// Decode a heart-rate payload.
///
/// # Errors
///
/// Returns [`Error::MalformedFrame`] if the payload is empty.
pub fn decode_heart_rate(payload: Bytes) -> Result<HeartRateBatch, Error> {
    if payload.is_empty() {
        return Err(Error::MalformedFrame("empty heart-rate payload".into()));
    }
    Ok(HeartRateBatch { samples: payload })
}

/// Decode a motion frame.
///
/// Geometry is validated before any field is interpreted: a payload too short for
/// the header and three axis blocks, or with bytes left after the name field, is a
/// [`Error::SizeMismatch`].
///
/// # Arguments
///
/// * `payload` - The complete upload body.
/// * `batch_size` - Samples per axis, supplied out-of-band by the boundary.
/// * `encoding` - Axis encoding, supplied out-of-band by the boundary.
///
/// # Errors
///
/// - [`Error::SizeMismatch`] if the payload length does not fit the geometry.
/// - [`Error::MalformedFrame`] for a zero `batch_count`, an out-of-range
///   `batch_index`, a truncated text field, a non-decimal timestamp, or a
///   non-UTF-8 name.
pub fn decode_motion(
    payload: Bytes,
    batch_size: usize,
    encoding: SampleEncoding,
) -> Result<MotionBatch, Error> {
    let fixed_len = motion_fixed_len(batch_size, encoding)?;
    let total = payload.len();
    // Both text fields need at least their length prefixes.
    let min_len = fixed_len + 2 * TEXT_LEN_PREFIX_SIZE;
    if total < min_len {
        return Err(Error::SizeMismatch {
            expected: min_len,
            actual: total,
        });
    }

    let mut cursor = Cursor { buf: payload };
    // Lengths were checked above; these reads cannot fail.
    let batch_index = cursor.u16_le().unwrap_or_default();
    let batch_count = cursor.u16_le().unwrap_or_default();

    if batch_count == 0 {
        return Err(Error::MalformedFrame("batch count must be at least 1".into()));
    }
    if batch_index >= batch_count {
        return Err(Error::MalformedFrame(format!(
            "batch index {batch_index} out of range for batch count {batch_count}"
        )));
    }

    let axis_len = batch_size * encoding.width();
    let mut axis = || cursor.take(axis_len).unwrap_or_default();
    let axes = [axis(), axis(), axis()];

    let ts_raw = cursor.text("timestamp")?;
    let name_raw = cursor.text("filename")?;

    if cursor.remaining() != 0 {
        return Err(Error::SizeMismatch {
            expected: total - cursor.remaining(),
            actual: total,
        });
    }

    let initial_timestamp = std::str::from_utf8(&ts_raw)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .ok_or_else(|| {
            Error::MalformedFrame(format!(
                "initial timestamp is not a decimal integer: {:?}",
                String::from_utf8_lossy(&ts_raw)
            ))
        })?;

    let recording_name = String::from_utf8(name_raw.to_vec())
        .map_err(|_| Error::MalformedFrame("filename is not valid UTF-8".into()))?;

    Ok(MotionBatch {
        batch_index,
        batch_count,
        axes,
        encoding,
        batch_size,
        initial_timestamp,
        recording_name,
    })
}

/// Decode an upload by sensor kind.
///
/// `batch_size` is ignored for heart-rate payloads.
///
/// # Errors
///
/// Returns [`Error::MissingAttribute`] if a motion payload arrives without a batch
/// size, otherwise whatever [`decode_heart_rate`] or [`decode_motion`] return.
pub fn decode(
    kind: SensorKind,
    payload: Bytes,
    batch_size: Option<usize>,
    encoding: SampleEncoding,
) -> Result<Batch, Error> {
    match kind {
        SensorKind::HeartRate => decode_heart_rate(payload).map(Batch::HeartRate),
        SensorKind::Motion => {
            let batch_size = batch_size.ok_or(Error::MissingAttribute("X_FITBIT_BATCH_SIZE"))?;
            decode_motion(payload, batch_size, encoding).map(Batch::Motion)
        }
    }
}

/// Encode a motion frame in the layout [`decode_motion`] accepts.
///
/// Axis blocks are copied verbatim; the caller is responsible for encoding them
/// with the intended [`SampleEncoding`].
///
/// # Panics
///
/// Panics if the timestamp text or the name exceeds `u16::MAX` bytes.
pub fn encode_motion_frame(
    batch_index: u16,
    batch_count: u16,
    axes: [&[u8]; AXIS_COUNT],
    initial_timestamp: u64,
    recording_name: &str,
) -> Vec<u8> {
    let ts = initial_timestamp.to_string();
    let axes_len: usize = axes.iter().map(|a| a.len()).sum();
    let mut buf = BytesMut::with_capacity(
        MOTION_HEADER_SIZE + axes_len + 2 * TEXT_LEN_PREFIX_SIZE + ts.len() + recording_name.len(),
    );
    buf.put_u16_le(batch_index);
    buf.put_u16_le(batch_count);
    for axis in axes {
        buf.put_slice(axis);
    }
    for field in [ts.as_bytes(), recording_name.as_bytes()] {
        let len = u16::try_from(field.len()).expect("text field exceeds u16::MAX bytes");
        buf.put_u16_le(len);
        buf.put_slice(field);
    }
    buf.to_vec()
}
