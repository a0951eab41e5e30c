//! Shared preprocessing and postprocessing helpers for the ONNX models.

use image::{imageops, RgbImage};
use ndarray::Array4;
use vigil_core::BoundingBox;

/// Letterbox mapping from model input space back to source coordinates.
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    pub fn unmap_x(&self, x: f32) -> f32 {
        (x - self.pad_x) / self.scale
    }

    pub fn unmap_y(&self, y: f32) -> f32 {
        (y - self.pad_y) / self.scale
    }
}

/// Resize `image` preserving aspect ratio into a `width` x `height` canvas,
/// padding with `pad_value`, and emit a NCHW float tensor normalized as
/// `(pixel - mean) / std`.
pub fn letterbox_tensor(
    image: &RgbImage,
    width: u32,
    height: u32,
    pad_value: u8,
    mean: f32,
    std: f32,
) -> (Array4<f32>, Letterbox) {
    let (src_w, src_h) = image.dimensions();
    let scale = (width as f32 / src_w as f32).min(height as f32 / src_h as f32);
    let new_w = ((src_w as f32 * scale).round() as u32).max(1);
    let new_h = ((src_h as f32 * scale).round() as u32).max(1);
    let pad_x = (width - new_w) as f32 / 2.0;
    let pad_y = (height - new_h) as f32 / 2.0;

    let resized = imageops::resize(image, new_w, new_h, imageops::FilterType::Triangle);

    let x0 = pad_x.floor() as u32;
    let y0 = pad_y.floor() as u32;
    let pad_norm = (pad_value as f32 - mean) / std;

    let mut tensor = Array4::<f32>::from_elem((1, 3, height as usize, width as usize), pad_norm);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = (x0 + x) as usize;
        let ty = (y0 + y) as usize;
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel.0[c] as f32 - mean) / std;
        }
    }

    (tensor, Letterbox { scale, pad_x, pad_y })
}

/// Plain resize (no aspect preservation) into a NCHW tensor, for models with
/// fixed-shape inputs that expect the full crop (face embedder, UltraFace).
pub fn resize_tensor(image: &RgbImage, width: u32, height: u32, mean: f32, std: f32) -> Array4<f32> {
    let resized = if image.dimensions() == (width, height) {
        image.clone()
    } else {
        imageops::resize(image, width, height, imageops::FilterType::Triangle)
    };

    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel.0[c] as f32 - mean) / std;
        }
    }
    tensor
}

/// A scored box prior to non-maximum suppression.
#[derive(Debug, Clone)]
pub struct ScoredBox {
    pub bbox: BoundingBox,
    pub score: f32,
    pub class_id: u32,
}

/// Greedy per-class non-maximum suppression.
pub fn nms(mut boxes: Vec<ScoredBox>, iou_threshold: f32) -> Vec<ScoredBox> {
    boxes.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<ScoredBox> = Vec::new();
    for candidate in boxes {
        let suppressed = keep.iter().any(|kept| {
            kept.class_id == candidate.class_id
                && kept.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            keep.push(candidate);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(x: f32, y: f32, w: f32, h: f32, score: f32, class_id: u32) -> ScoredBox {
        ScoredBox {
            bbox: BoundingBox::new(x, y, w, h),
            score,
            class_id,
        }
    }

    #[test]
    fn test_nms_suppresses_overlap() {
        let boxes = vec![
            scored(0.0, 0.0, 100.0, 100.0, 0.9, 0),
            scored(5.0, 5.0, 100.0, 100.0, 0.8, 0),
            scored(300.0, 300.0, 50.0, 50.0, 0.7, 0),
        ];
        let kept = nms(boxes, 0.45);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_across_classes() {
        let boxes = vec![
            scored(0.0, 0.0, 100.0, 100.0, 0.9, 0),
            scored(0.0, 0.0, 100.0, 100.0, 0.8, 1),
        ];
        assert_eq!(nms(boxes, 0.45).len(), 2);
    }

    #[test]
    fn test_letterbox_roundtrip() {
        let image = RgbImage::new(320, 240);
        let (_, lb) = letterbox_tensor(&image, 640, 640, 114, 0.0, 255.0);

        // 320x240 scaled by 2 -> 640x480, padded vertically by 80.
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert!((lb.pad_y - 80.0).abs() < 1e-6);
        assert!((lb.unmap_x(200.0) - 100.0).abs() < 1e-3);
        assert!((lb.unmap_y(280.0) - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_letterbox_pad_value_normalized() {
        let image = RgbImage::from_pixel(10, 10, image::Rgb([255, 255, 255]));
        let (tensor, _) = letterbox_tensor(&image, 20, 40, 114, 0.0, 255.0);
        // Corner of the canvas is padding.
        assert!((tensor[[0, 0, 0, 0]] - 114.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_resize_tensor_shape_and_normalization() {
        let image = RgbImage::from_pixel(50, 60, image::Rgb([127, 127, 127]));
        let tensor = resize_tensor(&image, 112, 112, 127.5, 127.5);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        let expected = (127.0 - 127.5) / 127.5;
        assert!((tensor[[0, 1, 56, 56]] - expected).abs() < 1e-4);
    }
}
