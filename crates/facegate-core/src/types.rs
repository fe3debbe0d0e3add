use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for the bundled ArcFace models).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "arcface-r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]; 0.0 when either vector is all zeros.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let (dot, aa, bb) = self
            .values
            .iter()
            .zip(&other.values)
            .fold((0.0f32, 0.0f32, 0.0f32), |(d, x, y), (a, b)| (d + a * b, x + a * a, y + b * b));
        let norms = (aa * bb).sqrt();
        if norms > 0.0 {
            dot / norms
        } else {
            0.0
        }
    }

    /// Cosine distance in [0, 2]. 0 = same direction.
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        1.0 - self.similarity(other)
    }

    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        let squared: f32 = self.values.iter().zip(&other.values).map(|(a, b)| (a - b) * (a - b)).sum();
        squared.sqrt()
    }

    /// Euclidean distance between the L2-normalized embeddings, in [0, 2].
    pub fn euclidean_l2_distance(&self, other: &Embedding) -> f32 {
        self.l2_normalized()
            .euclidean_distance(&other.l2_normalized())
    }

    /// Distance under the given metric.
    pub fn distance(&self, other: &Embedding, metric: DistanceMetric) -> f32 {
        match metric {
            DistanceMetric::Cosine => self.cosine_distance(other),
            DistanceMetric::Euclidean => self.euclidean_distance(other),
            DistanceMetric::EuclideanL2 => self.euclidean_l2_distance(other),
        }
    }

    fn l2_normalized(&self) -> Embedding {
        let length = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        let scale = if length > 0.0 { length.recip() } else { 1.0 };
        Embedding {
            values: self.values.iter().map(|x| x * scale).collect(),
            model_version: self.model_version.clone(),
        }
    }
}

/// How two embeddings are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    Cosine,
    Euclidean,
    EuclideanL2,
}

impl std::fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::EuclideanL2 => "euclidean_l2",
        };
        f.write_str(name)
    }
}

/// Outcome of verifying one image pair with a single model profile.
#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    /// Verdict under the profile's own threshold (`distance <= threshold`).
    pub verified: bool,
    pub distance: f32,
    /// Distance threshold the verdict was taken against.
    pub threshold: f32,
    /// Profile name that produced this result.
    pub model: String,
}

impl Verification {
    /// Normalized similarity in [0, 1] derived from the distance.
    pub fn similarity(&self) -> f32 {
        similarity_from_distance(self.distance)
    }
}

/// Map a model distance to a similarity score: `max(0, 1 - distance / 2)`.
pub fn similarity_from_distance(distance: f32) -> f32 {
    (1.0 - distance / 2.0).max(0.0)
}
