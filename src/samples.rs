//! Sample codec: axis blocks to physical readings, and readings to rows.

use crate::error::Error;
use crate::types::{INT16_SCALE, MotionBatch, MotionRow, SampleEncoding};

/// Decode one axis block into `batch_size` physical values.
///
/// # Errors
///
/// Returns [`Error::MalformedFrame`] if the block is not exactly
/// `batch_size * encoding.width()` bytes.
pub fn decode_axis(
    block: &[u8],
    batch_size: usize,
    encoding: SampleEncoding,
) -> Result<Vec<f32>, Error> {
    let width = encoding.width();
    if block.len() != batch_size * width {
        return Err(Error::MalformedFrame(format!(
            "axis block of {} bytes does not hold {batch_size} {encoding} samples",
            block.len()
        )));
    }
    let values = block
        .chunks_exact(width)
        .map(|chunk| match encoding {
            SampleEncoding::ScaledInt16 => {
                f32::from(i16::from_le_bytes([chunk[0], chunk[1]])) / INT16_SCALE
            }
            SampleEncoding::Float32 => {
                f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])
            }
        })
        .collect();
    Ok(values)
}

/// Encode physical values into an axis block. Inverse of [`decode_axis`].
///
/// Scaled int16 values are rounded to the nearest hundredth and saturate at the
/// `i16` range.
pub fn encode_axis(values: &[f32], encoding: SampleEncoding) -> Vec<u8> {
    match encoding {
        SampleEncoding::ScaledInt16 => values
            .iter()
            .flat_map(|v| ((v * INT16_SCALE).round() as i16).to_le_bytes())
            .collect(),
        SampleEncoding::Float32 => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
    }
}

/// Transpose a batch's three axes into timestamped rows.
///
/// Row `i` is stamped `initial_timestamp + i * sample_interval`. The device does not
/// transmit per-sample timestamps, so this assumes perfectly regular sampling at the
/// nominal rate; jitter on the device is not represented.
///
/// # Errors
///
/// Returns [`Error::MalformedFrame`] if any axis block does not match the batch
/// geometry, or if the last row's timestamp does not fit in a `u64`.
pub fn reconstruct_rows(batch: &MotionBatch, sample_interval: u64) -> Result<Vec<MotionRow>, Error> {
    let [x, y, z] = &batch.axes;
    let x = decode_axis(x, batch.batch_size, batch.encoding)?;
    let y = decode_axis(y, batch.batch_size, batch.encoding)?;
    let z = decode_axis(z, batch.batch_size, batch.encoding)?;

    // Every row timestamp is bounded by the last one, so checking it covers the batch.
    let span = (x.len().saturating_sub(1) as u64).checked_mul(sample_interval);
    if span
        .and_then(|span| batch.initial_timestamp.checked_add(span))
        .is_none()
    {
        return Err(Error::MalformedFrame(
            "initial timestamp overflows batch span".into(),
        ));
    }

    let rows = x
        .into_iter()
        .zip(y)
        .zip(z)
        .enumerate()
        .map(|(i, ((x, y), z))| MotionRow {
            timestamp: batch.initial_timestamp + i as u64 * sample_interval,
            x,
            y,
            z,
        })
        .collect();
    Ok(rows)
}
