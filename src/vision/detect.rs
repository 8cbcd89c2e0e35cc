//! YOLOv8 output decoding and non-maximum suppression

use serde::{Deserialize, Serialize};

use super::{VisionError, VisionResult};

/// Per-class coordinate offset that keeps boxes of different classes apart
/// during class-aware suppression
pub const MAX_WH: f32 = 7680.0;

const IOU_EPS: f32 = 1e-7;

/// Corner-form box in pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    fn shifted(&self, offset: f32) -> BBox {
        BBox {
            x1: self.x1 + offset,
            y1: self.y1 + offset,
            x2: self.x2 + offset,
            y2: self.y2 + offset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: usize,
    pub confidence: f32,
    pub bbox: BBox,
}

pub fn xywh_to_xyxy(cx: f32, cy: f32, w: f32, h: f32) -> BBox {
    BBox {
        x1: cx - w / 2.0,
        y1: cy - h / 2.0,
        x2: cx + w / 2.0,
        y2: cy + h / 2.0,
    }
}

/// Intersection over union of two boxes
pub fn box_iou(a: &BBox, b: &BBox) -> f32 {
    let inter_w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let inter_h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = inter_w * inter_h;
    inter / (a.area() + b.area() - inter + IOU_EPS)
}

/// Candidates from a single-image YOLOv8 head laid out `[4 + nc, anchors]`.
///
/// Each anchor keeps its best-scoring class. Anchors at or below
/// `conf_threshold` are dropped, as are classes outside `class_filter`
/// unless the filter is empty.
pub fn decode_yolov8(
    output: &[f32],
    num_classes: usize,
    num_anchors: usize,
    conf_threshold: f32,
    class_filter: &[usize],
) -> VisionResult<Vec<Detection>> {
    let rows = 4 + num_classes;
    if num_classes == 0 || num_anchors == 0 {
        return Err(VisionError::InvalidDimensions {
            dims: vec![rows as i64, num_anchors as i64],
            message: "need at least one class and one anchor".to_string(),
        });
    }
    if output.len() != rows * num_anchors {
        return Err(VisionError::LengthMismatch {
            expected: rows * num_anchors,
            actual: output.len(),
        });
    }

    let at = |row: usize, anchor: usize| output[row * num_anchors + anchor];
    let mut detections = Vec::new();
    for anchor in 0..num_anchors {
        let (class_id, confidence) = (0..num_classes)
            .map(|class| (class, at(4 + class, anchor)))
            .fold((0, f32::NEG_INFINITY), |best, candidate| {
                if candidate.1 > best.1 {
                    candidate
                } else {
                    best
                }
            });
        if confidence <= conf_threshold {
            continue;
        }
        if !class_filter.is_empty() && !class_filter.contains(&class_id) {
            continue;
        }
        detections.push(Detection {
            class_id,
            confidence,
            bbox: xywh_to_xyxy(at(0, anchor), at(1, anchor), at(2, anchor), at(3, anchor)),
        });
    }
    Ok(detections)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NmsOptions {
    pub iou_threshold: f32,
    pub max_det: usize,
    /// Suppress across classes instead of within each class
    pub agnostic: bool,
}

impl Default for NmsOptions {
    fn default() -> Self {
        Self {
            iou_threshold: 0.45,
            max_det: 300,
            agnostic: false,
        }
    }
}

/// Greedy suppression, highest confidence first
pub fn non_max_suppression(mut detections: Vec<Detection>, options: NmsOptions) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let offset = |d: &Detection| {
        if options.agnostic {
            d.bbox
        } else {
            d.bbox.shifted(d.class_id as f32 * MAX_WH)
        }
    };

    let mut kept: Vec<Detection> = Vec::new();
    for candidate in detections {
        if kept.len() >= options.max_det {
            break;
        }
        let shifted = offset(&candidate);
        let overlaps = kept
            .iter()
            .any(|k| box_iou(&offset(k), &shifted) > options.iou_threshold);
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}
