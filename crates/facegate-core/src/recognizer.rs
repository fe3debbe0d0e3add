//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts 512-dimensional, L2-normalized face embeddings from 112×112 RGB
//! crops. Any ArcFace export with that input/output contract works
//! (`w600k_r50`, `w600k_mbf`, ...).

use crate::alignment::{self, ALIGNED_SIZE};
use crate::types::{BoundingBox, Embedding};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD's 128.0
const ARCFACE_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
    model_version: String,
}

impl FaceRecognizer {
    /// Load an ArcFace ONNX model, tagging its embeddings with `model_version`.
    pub fn load(model_path: &Path, model_version: &str) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            model = model_version,
            "loaded ArcFace model"
        );

        Ok(Self {
            session,
            model_version: model_version.to_string(),
        })
    }

    /// Extract an embedding for one face of `image`.
    ///
    /// With `align` and a landmarked detection the face is warped onto the
    /// canonical layout; a detection without alignment is cropped to its box.
    /// Without any detection the whole image is used.
    pub fn extract(
        &mut self,
        image: &RgbImage,
        face: Option<&BoundingBox>,
        align: bool,
    ) -> Result<Embedding, RecognizerError> {
        let crop = face_crop(image, face, align);
        let input = Self::preprocess(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw.to_vec()
        };

        Ok(Embedding {
            values,
            model_version: Some(self.model_version.clone()),
        })
    }

    /// Turn a 112×112 RGB crop into a normalized NCHW float tensor.
    fn preprocess(crop: &RgbImage) -> Array4<f32> {
        let mut tensor = Array4::<f32>::zeros((1, 3, ALIGNED_SIZE, ALIGNED_SIZE));
        for (x, y, pixel) in crop.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            if x >= ALIGNED_SIZE || y >= ALIGNED_SIZE {
                continue;
            }
            for c in 0..3 {
                tensor[[0, c, y, x]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
            }
        }
        tensor
    }
}

/// Produce the 112×112 crop fed to the recognizer.
fn face_crop(image: &RgbImage, face: Option<&BoundingBox>, align: bool) -> RgbImage {
    let side = ALIGNED_SIZE as u32;
    match face {
        Some(BoundingBox { landmarks: Some(landmarks), .. }) if align => {
            alignment::align_face(image, landmarks)
        }
        Some(face) => {
            let x = face.x.max(0.0).floor() as u32;
            let y = face.y.max(0.0).floor() as u32;
            let x = x.min(image.width().saturating_sub(1));
            let y = y.min(image.height().saturating_sub(1));
            let w = (face.width.max(1.0).ceil() as u32).min(image.width() - x);
            let h = (face.height.max(1.0).ceil() as u32).min(image.height() - y);
            let cropped = imageops::crop_imm(image, x, y, w, h).to_image();
            imageops::resize(&cropped, side, side, FilterType::Triangle)
        }
        None => imageops::resize(image, side, side, FilterType::Triangle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_output_shape() {
        let crop = RgbImage::from_pixel(112, 112, Rgb([128, 128, 128]));
        let tensor = FaceRecognizer::preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 3, ALIGNED_SIZE, ALIGNED_SIZE]);
    }

    #[test]
    fn test_preprocess_normalization_per_channel() {
        let crop = RgbImage::from_pixel(112, 112, Rgb([255, 0, 128]));
        let tensor = FaceRecognizer::preprocess(&crop);
        assert!((tensor[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] + 1.0).abs() < 1e-6);
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((tensor[[0, 2, 5, 5]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_face_crop_without_detection_uses_whole_image() {
        let image = RgbImage::from_pixel(300, 200, Rgb([40, 50, 60]));
        let crop = face_crop(&image, None, true);
        assert_eq!(crop.dimensions(), (112, 112));
        assert_eq!(crop.get_pixel(56, 56), &Rgb([40, 50, 60]));
    }

    #[test]
    fn test_face_crop_box_without_landmarks() {
        let mut image = RgbImage::from_pixel(200, 200, Rgb([0, 0, 0]));
        for y in 50..150 {
            for x in 50..150 {
                image.put_pixel(x, y, Rgb([200, 10, 10]));
            }
        }
        let face = BoundingBox {
            x: 50.0, y: 50.0, width: 100.0, height: 100.0,
            confidence: 0.9, landmarks: None,
        };
        let crop = face_crop(&image, Some(&face), true);
        assert_eq!(crop.dimensions(), (112, 112));
        assert_eq!(crop.get_pixel(56, 56), &Rgb([200, 10, 10]));
    }

    #[test]
    fn test_face_crop_box_clamped_to_image() {
        let image = RgbImage::from_pixel(64, 64, Rgb([9, 9, 9]));
        let face = BoundingBox {
            x: -20.0, y: 40.0, width: 500.0, height: 500.0,
            confidence: 0.6, landmarks: None,
        };
        let crop = face_crop(&image, Some(&face), false);
        assert_eq!(crop.dimensions(), (112, 112));
    }
}
