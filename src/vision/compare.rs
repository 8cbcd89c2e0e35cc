//! Numeric agreement between an output tensor and its golden reference

use half::f16;
use serde::{Deserialize, Serialize};

use super::{VisionError, VisionResult};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Similarity {
    pub mse: f64,
    pub cosine_similarity: f64,
    pub max_abs_error: f64,
    /// Largest error relative to a non-zero reference value
    pub max_relative_error: f64,
}

/// Compare `actual` against `reference` element by element
pub fn compare(reference: &[f64], actual: &[f64]) -> VisionResult<Similarity> {
    if reference.len() != actual.len() {
        return Err(VisionError::LengthMismatch {
            expected: reference.len(),
            actual: actual.len(),
        });
    }
    if reference.is_empty() {
        return Err(VisionError::Empty);
    }

    let mut squared = 0.0;
    let mut dot = 0.0;
    let mut norm_ref = 0.0;
    let mut norm_act = 0.0;
    let mut max_abs: f64 = 0.0;
    let mut max_rel: Option<f64> = None;
    for (&r, &a) in reference.iter().zip(actual) {
        let error = (r - a).abs();
        squared += error * error;
        dot += r * a;
        norm_ref += r * r;
        norm_act += a * a;
        max_abs = max_abs.max(error);
        if r.abs() > f64::EPSILON {
            let rel = error / r.abs();
            max_rel = Some(max_rel.map_or(rel, |m| m.max(rel)));
        }
    }

    let (norm_ref, norm_act) = (norm_ref.sqrt(), norm_act.sqrt());
    if norm_ref < f64::EPSILON || norm_act < f64::EPSILON {
        return Err(VisionError::ZeroNorm);
    }
    let max_relative_error = max_rel.ok_or(VisionError::ZeroReference)?;

    Ok(Similarity {
        mse: squared / reference.len() as f64,
        cosine_similarity: dot / (norm_ref * norm_act + f64::EPSILON),
        max_abs_error: max_abs,
        max_relative_error,
    })
}

pub fn compare_f16(reference: &[f16], actual: &[f16]) -> VisionResult<Similarity> {
    let widen = |values: &[f16]| values.iter().map(|v| v.to_f64()).collect::<Vec<f64>>();
    compare(&widen(reference), &widen(actual))
}
