//! Pre- and post-processing for the convolutional models.
//!
//! Everything here is pure computation on host buffers. The session only
//! moves `BatchInferenceRequest`s; these helpers prepare their tensors and
//! interpret the results.

mod compare;
mod detect;
mod layout;
mod letterbox;

pub use compare::{compare, compare_f16, Similarity};
pub use detect::{
    box_iou, decode_yolov8, non_max_suppression, xywh_to_xyxy, BBox, Detection, NmsOptions,
    MAX_WH,
};
pub use layout::{bytes_to_f16, f16_to_bytes, nchw_to_nhwc, nhwc_to_nchw};
pub use letterbox::{to_chw_f32, Letterbox, LetterboxOptions, PAD_VALUE};

/// Result type of the vision helpers
pub type VisionResult<T> = std::result::Result<T, VisionError>;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum VisionError {
    #[error("invalid dimensions {dims:?}: {message}")]
    InvalidDimensions { dims: Vec<i64>, message: String },

    #[error("buffer holds {actual} elements but {expected} were expected")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("byte length {0} is not a whole number of float16 values")]
    OddByteLength(usize),

    #[error("cannot compare empty tensors")]
    Empty,

    #[error("vector norm is zero, cosine similarity is undefined")]
    ZeroNorm,

    #[error("every reference value is zero, relative error is undefined")]
    ZeroReference,
}
