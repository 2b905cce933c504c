use thiserror::Error;

/// A request that cannot be processed as submitted. Reported to the caller
/// immediately and never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PreconditionFailure {
    #[error("empty image")]
    EmptyImage,
    #[error("image too large: {size} bytes (limit {limit})")]
    ImageTooLarge { size: usize, limit: usize },
    #[error("malformed image: {0}")]
    MalformedImage(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("multiple faces detected ({count})")]
    MultipleFacesDetected { count: usize },
    #[error("invalid template: expected {expected}-dim embedding, got {actual}")]
    InvalidTemplate { expected: usize, actual: usize },
    #[error("embedding contains non-finite values")]
    NonFiniteEmbedding,
    #[error("invalid unit code: {0:?}")]
    InvalidUnitCode(String),
    #[error("liveness check failed (score {score:.2}, need {required:.2})")]
    LivenessFailed { score: f32, required: f32 },
}

impl PreconditionFailure {
    /// Stable status code recorded in the audit trail.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyImage => "empty_image",
            Self::ImageTooLarge { .. } => "image_too_large",
            Self::MalformedImage(_) => "malformed_image",
            Self::NoFaceDetected => "no_face_detected",
            Self::MultipleFacesDetected { .. } => "multiple_faces_detected",
            Self::InvalidTemplate { .. } => "invalid_template",
            Self::NonFiniteEmbedding => "non_finite_embedding",
            Self::InvalidUnitCode(_) => "invalid_unit_code",
            Self::LivenessFailed { .. } => "liveness_failed",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchPolicyError {
    #[error("distance_max must be positive, got {0}")]
    DistanceMax(f32),
    #[error("threshold must be in (0, {distance_max}], got {threshold}")]
    Threshold { threshold: f32, distance_max: f32 },
    #[error("margin must be non-negative, got {0}")]
    Margin(f32),
}
