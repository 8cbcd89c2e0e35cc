//! Aspect-preserving resize with padding to the detector input size

use super::detect::BBox;
use super::{VisionError, VisionResult};

/// Grey used for the padded border
pub const PAD_VALUE: u8 = 114;

const CHANNELS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxOptions {
    /// Target `(width, height)`
    pub new_shape: (u32, u32),
    /// Pad only up to the next stride multiple instead of the full target
    pub auto: bool,
    /// Stretch to the target without keeping the aspect ratio
    pub scale_fill: bool,
    /// Allow enlarging images smaller than the target
    pub scale_up: bool,
    pub stride: u32,
}

impl Default for LetterboxOptions {
    fn default() -> Self {
        Self {
            new_shape: (640, 640),
            auto: true,
            scale_fill: false,
            scale_up: true,
            stride: 32,
        }
    }
}

/// Geometry of one letterbox transform
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub source: (u32, u32),
    /// Scale factors along x and y
    pub ratio: (f32, f32),
    /// Half of the total padding along x and y
    pub pad: (f32, f32),
    /// Image size after resizing, before padding
    pub resized: (u32, u32),
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
}

impl Letterbox {
    pub fn compute(src_w: u32, src_h: u32, options: LetterboxOptions) -> VisionResult<Self> {
        let (new_w, new_h) = options.new_shape;
        if src_w == 0 || src_h == 0 || new_w == 0 || new_h == 0 {
            return Err(VisionError::InvalidDimensions {
                dims: vec![src_w.into(), src_h.into(), new_w.into(), new_h.into()],
                message: "image and target sizes must be positive".to_string(),
            });
        }

        let mut r = (new_h as f32 / src_h as f32).min(new_w as f32 / src_w as f32);
        if !options.scale_up {
            r = r.min(1.0);
        }
        let mut ratio = (r, r);
        let mut resized = (
            (src_w as f32 * r).round() as u32,
            (src_h as f32 * r).round() as u32,
        );
        let mut dw = new_w.saturating_sub(resized.0) as f32;
        let mut dh = new_h.saturating_sub(resized.1) as f32;

        if options.auto && options.stride > 0 {
            dw %= options.stride as f32;
            dh %= options.stride as f32;
        } else if options.scale_fill {
            dw = 0.0;
            dh = 0.0;
            resized = (new_w, new_h);
            ratio = (new_w as f32 / src_w as f32, new_h as f32 / src_h as f32);
        }

        let pad = (dw / 2.0, dh / 2.0);
        Ok(Self {
            source: (src_w, src_h),
            ratio,
            pad,
            resized,
            top: (pad.1 - 0.1).round().max(0.0) as u32,
            bottom: (pad.1 + 0.1).round().max(0.0) as u32,
            left: (pad.0 - 0.1).round().max(0.0) as u32,
            right: (pad.0 + 0.1).round().max(0.0) as u32,
        })
    }

    /// Size of the padded output image
    pub fn output_size(&self) -> (u32, u32) {
        (
            self.resized.0 + self.left + self.right,
            self.resized.1 + self.top + self.bottom,
        )
    }

    /// Resize a packed 3-channel HWC image bilinearly and pad it.
    ///
    /// Channel order is preserved.
    pub fn apply(&self, image_hwc: &[u8], w: u32, h: u32) -> VisionResult<Vec<u8>> {
        if (w, h) != self.source {
            return Err(VisionError::InvalidDimensions {
                dims: vec![w.into(), h.into()],
                message: format!("letterbox was computed for {:?}", self.source),
            });
        }
        let expected = w as usize * h as usize * CHANNELS;
        if image_hwc.len() != expected {
            return Err(VisionError::LengthMismatch {
                expected,
                actual: image_hwc.len(),
            });
        }

        let resized = resize_bilinear(image_hwc, self.source, self.resized);
        let (out_w, out_h) = self.output_size();
        let (out_w, out_h) = (out_w as usize, out_h as usize);
        let mut out = vec![PAD_VALUE; out_w * out_h * CHANNELS];
        let row = self.resized.0 as usize * CHANNELS;
        for y in 0..self.resized.1 as usize {
            let dst = ((y + self.top as usize) * out_w + self.left as usize) * CHANNELS;
            out[dst..dst + row].copy_from_slice(&resized[y * row..(y + 1) * row]);
        }
        Ok(out)
    }

    /// Map a box from letterboxed input coordinates back onto the source
    /// image, clipped to its bounds
    pub fn scale_box(&self, bbox: BBox) -> BBox {
        let (src_w, src_h) = (self.source.0 as f32, self.source.1 as f32);
        let x = |v: f32| ((v - self.pad.0) / self.ratio.0).clamp(0.0, src_w);
        let y = |v: f32| ((v - self.pad.1) / self.ratio.1).clamp(0.0, src_h);
        BBox {
            x1: x(bbox.x1),
            y1: y(bbox.y1),
            x2: x(bbox.x2),
            y2: y(bbox.y2),
        }
    }
}

/// Half-pixel-centred bilinear resize of a 3-channel HWC image
fn resize_bilinear(src: &[u8], from: (u32, u32), to: (u32, u32)) -> Vec<u8> {
    if from == to {
        return src.to_vec();
    }
    let (src_w, src_h) = (from.0 as usize, from.1 as usize);
    let (dst_w, dst_h) = (to.0 as usize, to.1 as usize);
    let scale_x = src_w as f32 / dst_w as f32;
    let scale_y = src_h as f32 / dst_h as f32;

    // Source index pairs and the weight of the second one
    let sample = |dst: usize, scale: f32, limit: usize| -> (usize, usize, f32) {
        let pos = ((dst as f32 + 0.5) * scale - 0.5).max(0.0);
        let lo = (pos.floor() as usize).min(limit - 1);
        let hi = (lo + 1).min(limit - 1);
        (lo, hi, pos - lo as f32)
    };

    let mut out = Vec::with_capacity(dst_w * dst_h * CHANNELS);
    for y in 0..dst_h {
        let (y0, y1, fy) = sample(y, scale_y, src_h);
        for x in 0..dst_w {
            let (x0, x1, fx) = sample(x, scale_x, src_w);
            for c in 0..CHANNELS {
                let px = |xx: usize, yy: usize| src[(yy * src_w + xx) * CHANNELS + c] as f32;
                let top = px(x0, y0) * (1.0 - fx) + px(x1, y0) * fx;
                let bottom = px(x0, y1) * (1.0 - fx) + px(x1, y1) * fx;
                let value = top * (1.0 - fy) + bottom * fy;
                out.push(value.round().clamp(0.0, 255.0) as u8);
            }
        }
    }
    out
}

/// Packed HWC BGR bytes to planar RGB floats in `[0, 1]`
pub fn to_chw_f32(bgr_hwc: &[u8], w: u32, h: u32) -> VisionResult<Vec<f32>> {
    let plane = w as usize * h as usize;
    if bgr_hwc.len() != plane * CHANNELS {
        return Err(VisionError::LengthMismatch {
            expected: plane * CHANNELS,
            actual: bgr_hwc.len(),
        });
    }
    let mut out = vec![0.0f32; plane * CHANNELS];
    for (i, pixel) in bgr_hwc.chunks_exact(CHANNELS).enumerate() {
        for c in 0..CHANNELS {
            out[c * plane + i] = pixel[CHANNELS - 1 - c] as f32 / 255.0;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_auto_pads_to_stride() {
        let lb = Letterbox::compute(1280, 720, LetterboxOptions::default()).unwrap();
        assert_eq!(lb.ratio, (0.5, 0.5));
        assert_eq!(lb.resized, (640, 360));
        // 280 rows of padding reduce to 280 % 32 = 24
        assert_eq!(lb.pad, (0.0, 12.0));
        assert_eq!((lb.top, lb.bottom), (12, 12));
        assert_eq!(lb.output_size(), (640, 384));
    }

    #[test]
    fn test_compute_full_padding() {
        let options = LetterboxOptions {
            auto: false,
            ..Default::default()
        };
        let lb = Letterbox::compute(1280, 720, options).unwrap();
        assert_eq!(lb.output_size(), (640, 640));
        assert_eq!((lb.top, lb.bottom, lb.left, lb.right), (140, 140, 0, 0));
    }

    #[test]
    fn test_compute_scale_options() {
        let small = LetterboxOptions {
            auto: false,
            scale_up: false,
            ..Default::default()
        };
        let lb = Letterbox::compute(320, 320, small).unwrap();
        assert_eq!(lb.ratio, (1.0, 1.0));
        assert_eq!(lb.resized, (320, 320));
        assert_eq!(lb.output_size(), (640, 640));

        let fill = LetterboxOptions {
            auto: false,
            scale_fill: true,
            ..Default::default()
        };
        let lb = Letterbox::compute(1280, 320, fill).unwrap();
        assert_eq!(lb.ratio, (0.5, 2.0));
        assert_eq!(lb.pad, (0.0, 0.0));
        assert_eq!(lb.output_size(), (640, 640));

        assert!(Letterbox::compute(0, 10, LetterboxOptions::default()).is_err());
    }

    #[test]
    fn test_apply_pads_with_grey() {
        let options = LetterboxOptions {
            new_shape: (4, 4),
            auto: false,
            ..Default::default()
        };
        let lb = Letterbox::compute(4, 2, options).unwrap();
        let image = vec![200u8; 4 * 2 * 3];
        let out = lb.apply(&image, 4, 2).unwrap();

        assert_eq!(out.len(), 4 * 4 * 3);
        assert!(out[..12].iter().all(|&v| v == PAD_VALUE));
        assert!(out[12..36].iter().all(|&v| v == 200));
        assert!(out[36..].iter().all(|&v| v == PAD_VALUE));
        assert!(lb.apply(&image, 2, 4).is_err());
    }

    #[test]
    fn test_resize_halves_constant_image() {
        let image = vec![50u8; 8 * 8 * 3];
        let out = resize_bilinear(&image, (8, 8), (4, 4));
        assert_eq!(out.len(), 4 * 4 * 3);
        assert!(out.iter().all(|&v| v == 50));
    }

    #[test]
    fn test_scale_box_round_trip() {
        let lb = Letterbox::compute(1280, 720, LetterboxOptions::default()).unwrap();
        let bbox = BBox {
            x1: 100.0,
            y1: 112.0,
            x2: 200.0,
            y2: 400.0,
        };
        let scaled = lb.scale_box(bbox);
        assert_eq!(scaled.x1, 200.0);
        assert_eq!(scaled.y1, 200.0);
        assert_eq!(scaled.x2, 400.0);
        // Clipped to the source height
        assert_eq!(scaled.y2, 720.0);
    }

    #[test]
    fn test_to_chw_f32_swaps_channels() {
        let bgr = [255u8, 0, 51, 0, 0, 0];
        let chw = to_chw_f32(&bgr, 2, 1).unwrap();
        assert_eq!(chw, vec![0.2, 0.0, 0.0, 0.0, 1.0, 0.0]);
        assert!(to_chw_f32(&bgr, 3, 1).is_err());
    }
}
