//! Fail-closed face comparison over an ordered list of verifiers.
//!
//! Verifiers are tried in order; the first one that returns a result
//! decides. If every verifier errors the outcome is a non-match with
//! similarity 0.0. Errors never leave this module.

use crate::types::Verification;
use crate::verifier::{FaceVerifier, ModelProfile, OnnxVerifier};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ComparatorError {
    #[error("no verifier could be loaded from {dir}: {reason}")]
    NoVerifiers { dir: String, reason: String },
}

/// Result of comparing a registered image with a captured one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonOutcome {
    pub matched: bool,
    /// Normalized similarity in [0, 1].
    pub similarity: f32,
    /// Profile that produced the verdict; `None` when every verifier failed.
    pub model: Option<String>,
}

impl ComparisonOutcome {
    /// The fail-closed result.
    pub fn rejected() -> Self {
        Self {
            matched: false,
            similarity: 0.0,
            model: None,
        }
    }

    fn from_verification(v: &Verification) -> Self {
        Self {
            matched: v.verified,
            similarity: v.similarity(),
            model: Some(v.model.clone()),
        }
    }
}

pub struct FaceComparator {
    verifiers: Vec<Box<dyn FaceVerifier>>,
}

impl FaceComparator {
    pub fn new(verifiers: Vec<Box<dyn FaceVerifier>>) -> Self {
        Self { verifiers }
    }

    /// Load the primary (`arcface-r50`) and fallback (`arcface-mbf`) profiles.
    ///
    /// A profile whose model files are missing is skipped with a warning;
    /// at least one must load.
    pub fn load_default(model_dir: &Path) -> Result<Self, ComparatorError> {
        Self::load_profiles(model_dir, vec![ModelProfile::arcface_r50(), ModelProfile::arcface_mbf()])
    }

    pub fn load_profiles(model_dir: &Path, profiles: Vec<ModelProfile>) -> Result<Self, ComparatorError> {
        let mut verifiers: Vec<Box<dyn FaceVerifier>> = Vec::new();
        let mut last_error = String::from("no profiles configured");

        for profile in profiles {
            let name = profile.name.clone();
            match OnnxVerifier::load(model_dir, profile) {
                Ok(v) => {
                    tracing::info!(model = %name, position = verifiers.len(), "verifier ready");
                    verifiers.push(Box::new(v));
                }
                Err(e) => {
                    tracing::warn!(model = %name, error = %e, "verifier unavailable; skipping");
                    last_error = e.to_string();
                }
            }
        }

        if verifiers.is_empty() {
            return Err(ComparatorError::NoVerifiers {
                dir: model_dir.display().to_string(),
                reason: last_error,
            });
        }
        Ok(Self { verifiers })
    }

    /// Names of the loaded verifiers, in the order they are tried.
    pub fn verifier_names(&self) -> Vec<String> {
        self.verifiers.iter().map(|v| v.name().to_string()).collect()
    }

    /// Compare two image files.
    ///
    /// `threshold` is a similarity floor kept for reporting: the verdict
    /// always comes from the verifier's own distance threshold. A verdict
    /// that disagrees with the floor is logged.
    pub fn compare(&mut self, reference: &Path, capture: &Path, threshold: f32) -> ComparisonOutcome {
        tracing::info!(
            reference = %reference.display(),
            capture = %capture.display(),
            threshold,
            "starting face comparison"
        );

        for verifier in self.verifiers.iter_mut() {
            match verifier.verify(reference, capture) {
                Ok(v) => {
                    let outcome = ComparisonOutcome::from_verification(&v);
                    tracing::info!(
                        model = %v.model,
                        distance = v.distance,
                        similarity = outcome.similarity,
                        matched = outcome.matched,
                        "comparison complete"
                    );
                    if outcome.matched != (outcome.similarity >= threshold) {
                        tracing::warn!(
                            model = %v.model,
                            similarity = outcome.similarity,
                            threshold,
                            matched = outcome.matched,
                            "model verdict disagrees with the configured similarity threshold"
                        );
                    }
                    return outcome;
                }
                Err(e) => {
                    tracing::error!(model = verifier.name(), error = %e, "face verification failed");
                }
            }
        }

        tracing::error!("all verifiers failed; rejecting");
        ComparisonOutcome::rejected()
    }
}
