//! SCRFD face detector via ONNX Runtime.
//!
//! Runs the SCRFD detector on a letterboxed 640×640 RGB input, decodes the
//! three anchor-free stride heads and suppresses overlaps with NMS.

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding applied by the letterbox, used to map detections back.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    input_size: usize,
    confidence_threshold: f32,
    /// Per-stride output indices [(score, bbox, kps)] for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            input_size: SCRFD_INPUT_SIZE,
            confidence_threshold: SCRFD_CONFIDENCE_THRESHOLD,
            stride_indices,
        })
    }

    /// Override the minimum detection score (default 0.5).
    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    /// Detect faces in an RGB image, returning bounding boxes sorted by confidence.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = letterbox_tensor(image, self.input_size);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all_detections = Vec::new();

        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[stride_pos];

            let extract = |idx: usize, what: &'static str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(score_idx, "scores")?;
            let bboxes = extract(bbox_idx, "bboxes")?;
            let kps = extract(kps_idx, "kps")?;

            all_detections.extend(decode_stride(
                scores,
                bboxes,
                kps,
                stride,
                self.input_size,
                &letterbox,
                self.confidence_threshold,
            ));
        }

        // nms returns survivors in descending confidence order
        Ok(nms(all_detections, SCRFD_NMS_THRESHOLD))
    }
}

/// Letterbox an RGB image into a square NCHW tensor normalized for SCRFD.
///
/// The image is resized with a triangle (bilinear) filter to fit inside the
/// square and centered; padding pixels normalize to 0.0.
fn letterbox_tensor(image: &RgbImage, input_size: usize) -> (Array4<f32>, LetterboxInfo) {
    let (width, height) = (image.width() as f32, image.height() as f32);
    let scale = (input_size as f32 / width).min(input_size as f32 / height);

    let new_w = ((width * scale).round() as usize).clamp(1, input_size);
    let new_h = ((height * scale).round() as usize).clamp(1, input_size);
    let pad_x = (input_size - new_w) as f32 / 2.0;
    let pad_y = (input_size - new_h) as f32 / 2.0;

    let resized = imageops::resize(image, new_w as u32, new_h as u32, FilterType::Triangle);

    let x_off = pad_x.floor() as usize;
    let y_off = pad_y.floor() as usize;

    let mut tensor = Array4::<f32>::zeros((1, 3, input_size, input_size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (x as usize + x_off, y as usize + y_off);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, LetterboxInfo { scale, pad_x, pad_y })
}

/// Discover output tensor ordering by name.
///
/// Exports that name their heads `score_8`, `bbox_16`, `kps_32`, ... are
/// mapped by name. Anything else uses the standard positional layout:
/// `[0-2]` scores, `[3-5]` bboxes, `[6-8]` keypoints for strides 8/16/32.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match named {
        Some(found) => {
            tracing::debug!("SCRFD: using name-based output tensor mapping");
            [found[0], found[1], found[2]]
        }
        None => {
            tracing::debug!(?names, "SCRFD: output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Decode detections for a single stride level, mapped back into source
/// image coordinates.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid = input_size / stride;
    let step = stride as f32;
    let unletterbox = |x: f32, y: f32| {
        (
            (x - letterbox.pad_x) / letterbox.scale,
            (y - letterbox.pad_y) / letterbox.scale,
        )
    };

    (0..grid * grid * SCRFD_ANCHORS_PER_CELL)
        .filter_map(|idx| {
            let score = scores.get(idx).copied().unwrap_or(0.0);
            if score <= threshold {
                return None;
            }

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let anchor_x = (cell % grid) as f32 * step;
            let anchor_y = (cell / grid) as f32 * step;

            // Distances from the anchor to the left, top, right and bottom edges.
            let dist = bboxes.get(idx * 4..idx * 4 + 4)?;
            let (x1, y1) = unletterbox(anchor_x - dist[0] * step, anchor_y - dist[1] * step);
            let (x2, y2) = unletterbox(anchor_x + dist[2] * step, anchor_y + dist[3] * step);

            let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|offsets| {
                std::array::from_fn(|i| {
                    unletterbox(
                        anchor_x + offsets[i * 2] * step,
                        anchor_y + offsets[i * 2 + 1] * step,
                    )
                })
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression. Survivors come back in descending
/// confidence order.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<BoundingBox> = Vec::with_capacity(detections.len());
    for candidate in detections {
        if keep.iter().all(|kept| iou(kept, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Intersection over union of two boxes; 0.0 for degenerate boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let overlap = |a0: f32, a1: f32, b0: f32, b1: f32| (a1.min(b1) - a0.max(b0)).max(0.0);
    let inter = overlap(a.x, a.x + a.width, b.x, b.x + b.width)
        * overlap(a.y, a.y + a.height, b.y, b.y + b.height);
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x: f32, y: f32, side: f32, confidence: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: side,
            height: side,
            confidence,
            landmarks: None,
        }
    }

    #[test]
    fn test_iou() {
        let a = square(0.0, 0.0, 10.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &square(30.0, 30.0, 10.0, 1.0)), 0.0);
        // 5x10 overlap out of a 150 px² union
        assert!((iou(&a, &square(5.0, 0.0, 10.0, 1.0)) - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(iou(&square(0.0, 0.0, 0.0, 1.0), &square(0.0, 0.0, 0.0, 1.0)), 0.0);
    }

    #[test]
    fn test_nms_keeps_best_of_each_cluster() {
        let faces = vec![
            square(300.0, 300.0, 40.0, 0.6),
            square(2.0, 2.0, 80.0, 0.85),
            square(0.0, 0.0, 80.0, 0.95),
            square(302.0, 301.0, 40.0, 0.7),
        ];
        let kept: Vec<f32> = nms(faces, 0.4).iter().map(|f| f.confidence).collect();
        assert_eq!(kept, vec![0.95, 0.7]);
        assert!(nms(Vec::new(), 0.4).is_empty());
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_output_indices_by_name() {
        let grouped = names(&[
            "score_8", "score_16", "score_32", "bbox_8", "bbox_16", "bbox_32", "kps_8", "kps_16", "kps_32",
        ]);
        assert_eq!(discover_output_indices(&grouped), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);

        let interleaved = names(&[
            "kps_8", "bbox_8", "score_8", "kps_16", "bbox_16", "score_16", "kps_32", "bbox_32", "score_32",
        ]);
        assert_eq!(discover_output_indices(&interleaved), [(2, 1, 0), (5, 4, 3), (8, 7, 6)]);
    }

    #[test]
    fn test_output_indices_positional() {
        let numeric: Vec<String> = (440..449).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&numeric), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);

        // one head missing its name falls back entirely
        let partial = names(&["score_8", "score_16", "score_32", "bbox_8", "bbox_16", "bbox_32", "kps_8", "kps_16", "x"]);
        assert_eq!(discover_output_indices(&partial), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_letterbox_tensor_landscape() {
        let image = RgbImage::from_pixel(320, 240, image::Rgb([255, 0, 128]));
        let (tensor, info) = letterbox_tensor(&image, 640);

        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((info.scale - 2.0).abs() < 1e-6);
        assert_eq!(info.pad_x, 0.0);
        assert_eq!(info.pad_y, 80.0);

        // Padding rows normalize to zero, content rows keep per-channel values.
        assert_eq!(tensor[[0, 0, 10, 320]], 0.0);
        let r = tensor[[0, 0, 320, 320]];
        let g = tensor[[0, 1, 320, 320]];
        assert!((r - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-2);
        assert!((g - (0.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-2);
    }

    #[test]
    fn test_decode_stride_maps_back_to_source() {
        // One confident anchor at cell (1, 1) of the stride-32 grid.
        let stride = 32;
        let grid = 640 / stride;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let idx = (grid + 1) * SCRFD_ANCHORS_PER_CELL;

        let mut scores = vec![0.0f32; anchors];
        scores[idx] = 0.9;
        let mut bboxes = vec![0.0f32; anchors * 4];
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[0.5, 0.5, 0.5, 0.5]);
        let kps = vec![0.0f32; anchors * 10];

        let letterbox = LetterboxInfo { scale: 2.0, pad_x: 0.0, pad_y: 80.0 };
        let dets = decode_stride(&scores, &bboxes, &kps, stride, 640, &letterbox, 0.5);

        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        // Anchor at (32, 32) in letterbox space, box spans ±16 px.
        assert!((d.x - 8.0).abs() < 1e-4, "x = {}", d.x);
        assert!((d.y - (16.0 - 80.0) / 2.0).abs() < 1e-4, "y = {}", d.y);
        assert!((d.width - 16.0).abs() < 1e-4);
        let landmarks = d.landmarks.expect("landmarks decoded");
        assert!((landmarks[0].0 - 16.0).abs() < 1e-4);
    }

    #[test]
    fn test_decode_stride_skips_low_scores() {
        let anchors = 20 * 20 * SCRFD_ANCHORS_PER_CELL;
        let scores = vec![0.3f32; anchors];
        let bboxes = vec![1.0f32; anchors * 4];
        let kps = vec![0.0f32; anchors * 10];
        let letterbox = LetterboxInfo { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        assert!(decode_stride(&scores, &bboxes, &kps, 32, 640, &letterbox, 0.5).is_empty());
    }
}
