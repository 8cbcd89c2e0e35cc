use half::f16;

use super::{VisionError, VisionResult};

/// Check a rank-4 shape and return it as `[n, c, h, w]`-ordered extents
fn extents(shape: &[i64], len: usize) -> VisionResult<[usize; 4]> {
    let invalid = |message: &str| VisionError::InvalidDimensions {
        dims: shape.to_vec(),
        message: message.to_string(),
    };
    if shape.len() != 4 {
        return Err(invalid("expected four dimensions"));
    }
    let mut dims = [0usize; 4];
    for (slot, &dim) in dims.iter_mut().zip(shape) {
        if dim <= 0 {
            return Err(invalid("dimensions must be positive"));
        }
        *slot = usize::try_from(dim).map_err(|_| invalid("dimension out of range"))?;
    }
    let expected = dims
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| invalid("element count overflows"))?;
    if expected != len {
        return Err(VisionError::LengthMismatch {
            expected,
            actual: len,
        });
    }
    Ok(dims)
}

/// Reorder `[N, C, H, W]` data into `[N, H, W, C]`.
///
/// `shape` is the NCHW shape of `data`.
pub fn nchw_to_nhwc<T: Copy>(data: &[T], shape: &[i64]) -> VisionResult<Vec<T>> {
    let [n, c, h, w] = extents(shape, data.len())?;
    let mut out = Vec::with_capacity(data.len());
    for batch in 0..n {
        let base = batch * c * h * w;
        for y in 0..h {
            for x in 0..w {
                for channel in 0..c {
                    out.push(data[base + channel * h * w + y * w + x]);
                }
            }
        }
    }
    Ok(out)
}

/// Reorder `[N, H, W, C]` data into `[N, C, H, W]`.
///
/// `shape` is the NCHW shape of the result, the same convention as
/// [`nchw_to_nhwc`].
pub fn nhwc_to_nchw<T: Copy>(data: &[T], shape: &[i64]) -> VisionResult<Vec<T>> {
    let [n, c, h, w] = extents(shape, data.len())?;
    let mut out = Vec::with_capacity(data.len());
    for batch in 0..n {
        let base = batch * h * w * c;
        for channel in 0..c {
            for y in 0..h {
                for x in 0..w {
                    out.push(data[base + (y * w + x) * c + channel]);
                }
            }
        }
    }
    Ok(out)
}

/// Little-endian float16 values from raw tensor bytes
pub fn bytes_to_f16(bytes: &[u8]) -> VisionResult<Vec<f16>> {
    if bytes.len() % 2 != 0 {
        return Err(VisionError::OddByteLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| f16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

pub fn f16_to_bytes(values: &[f16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}
