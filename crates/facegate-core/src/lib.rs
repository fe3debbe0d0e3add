//! facegate-core: face detection, recognition and pairwise verification.
//!
//! Uses SCRFD for face detection and ArcFace for face recognition,
//! both running via ONNX Runtime for CPU inference. The [`comparator`]
//! module chains verification profiles into a fail-closed comparison.

pub mod alignment;
pub mod comparator;
pub mod detector;
pub mod image_io;
pub mod recognizer;
pub mod types;
pub mod verifier;

pub use comparator::{ComparatorError, ComparisonOutcome, FaceComparator};
pub use detector::FaceDetector;
pub use recognizer::FaceRecognizer;
pub use types::{similarity_from_distance, BoundingBox, DistanceMetric, Embedding, Verification};
pub use verifier::{FaceVerifier, ModelProfile, OnnxVerifier, VerifyError};

use std::path::PathBuf;

/// Default directory holding the ONNX model files.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/facegate/models")
}
