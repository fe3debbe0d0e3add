//! Pairwise face verification: "do these two image files show the same person?"

use crate::detector::{DetectorError, FaceDetector};
use crate::image_io::{self, ImageLoadError};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, DistanceMetric, Verification};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// SCRFD detector weights shared by every profile.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error(transparent)]
    Image(#[from] ImageLoadError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("no face detected in {0}")]
    NoFaceDetected(String),
}

/// Recognition model plus the knobs that decide its verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub name: String,
    /// ONNX file name inside the model directory.
    pub model_file: String,
    pub metric: DistanceMetric,
    /// Maximum distance still considered the same person.
    pub threshold: f32,
    /// Warp detected faces onto the canonical landmark layout.
    pub align: bool,
    /// Fail when no face is found instead of embedding the whole image.
    pub enforce_detection: bool,
}

impl ModelProfile {
    /// ResNet-50 ArcFace trained on WebFace600K.
    pub fn arcface_r50() -> Self {
        Self {
            name: "arcface-r50".into(),
            model_file: "w600k_r50.onnx".into(),
            metric: DistanceMetric::Cosine,
            threshold: 0.68,
            align: true,
            enforce_detection: false,
        }
    }

    /// MobileFaceNet ArcFace trained on WebFace600K.
    pub fn arcface_mbf() -> Self {
        Self {
            name: "arcface-mbf".into(),
            model_file: "w600k_mbf.onnx".into(),
            metric: DistanceMetric::Cosine,
            threshold: 0.65,
            align: true,
            enforce_detection: false,
        }
    }
}

/// One way of verifying an image pair.
///
/// Implementations must be `Send` so they can live on the engine thread.
pub trait FaceVerifier: Send {
    fn name(&self) -> &str;
    fn verify(&mut self, reference: &Path, capture: &Path) -> Result<Verification, VerifyError>;
}

/// [`FaceVerifier`] backed by SCRFD + ArcFace ONNX sessions.
pub struct OnnxVerifier {
    profile: ModelProfile,
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxVerifier {
    /// Load the detector and the profile's recognizer from `model_dir`.
    pub fn load(model_dir: &Path, profile: ModelProfile) -> Result<Self, VerifyError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(&profile.model_file), &profile.name)?;
        Ok(Self {
            profile,
            detector,
            recognizer,
        })
    }

    pub fn profile(&self) -> &ModelProfile {
        &self.profile
    }

    /// Most confident face in `image`, or `None` when detection is not enforced.
    fn primary_face(&mut self, image: &RgbImage, path: &Path) -> Result<Option<BoundingBox>, VerifyError> {
        let face = self.detector.detect(image)?.into_iter().next();
        match face {
            Some(face) => {
                tracing::debug!(path = %path.display(), confidence = face.confidence, "face detected");
                Ok(Some(face))
            }
            None if self.profile.enforce_detection => {
                Err(VerifyError::NoFaceDetected(path.display().to_string()))
            }
            None => {
                tracing::debug!(path = %path.display(), "no face detected; embedding whole image");
                Ok(None)
            }
        }
    }
}

impl FaceVerifier for OnnxVerifier {
    fn name(&self) -> &str {
        &self.profile.name
    }

    fn verify(&mut self, reference: &Path, capture: &Path) -> Result<Verification, VerifyError> {
        let mut embeddings = Vec::with_capacity(2);
        for path in [reference, capture] {
            let image = image_io::load_rgb(path)?;
            let face = self.primary_face(&image, path)?;
            embeddings.push(self.recognizer.extract(&image, face.as_ref(), self.profile.align)?);
        }

        let distance = embeddings[0].distance(&embeddings[1], self.profile.metric);
        Ok(Verification {
            verified: distance <= self.profile.threshold,
            distance,
            threshold: self.profile.threshold,
            model: self.profile.name.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_profiles_differ_only_in_model() {
        let primary = ModelProfile::arcface_r50();
        let fallback = ModelProfile::arcface_mbf();
        assert_ne!(primary.model_file, fallback.model_file);
        assert_eq!(primary.metric, fallback.metric);
        assert!(!primary.enforce_detection && !fallback.enforce_detection);
        assert!(primary.align && fallback.align);
    }

    #[test]
    fn test_load_missing_models() {
        let dir = tempfile::tempdir().unwrap();
        let err = OnnxVerifier::load(dir.path(), ModelProfile::arcface_r50())
            .err()
            .expect("empty model dir must fail");
        assert!(matches!(err, VerifyError::Detector(DetectorError::ModelNotFound(_))));
    }

    #[test]
    fn test_profile_serde() {
        let json = serde_json::to_string(&ModelProfile::arcface_r50()).unwrap();
        assert!(json.contains("\"metric\":\"cosine\""));
        let back: ModelProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ModelProfile::arcface_r50());
    }
}
