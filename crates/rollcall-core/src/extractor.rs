use crate::error::PreconditionFailure;
use crate::photo::Photo;
use crate::types::Embedding;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("multiple faces detected ({count})")]
    MultipleFacesDetected { count: usize },
    #[error("extractor could not read image: {0}")]
    MalformedImage(String),
    #[error("extractor timed out after {0:?}")]
    Timeout(Duration),
    #[error("extractor unavailable: {0}")]
    Unavailable(String),
}

impl ExtractError {
    /// The precondition this failure represents, if it is a property of
    /// the photo rather than of the extractor.
    pub fn precondition(&self) -> Option<PreconditionFailure> {
        match self {
            ExtractError::NoFaceDetected => Some(PreconditionFailure::NoFaceDetected),
            ExtractError::MultipleFacesDetected { count } => {
                Some(PreconditionFailure::MultipleFacesDetected { count: *count })
            }
            ExtractError::MalformedImage(msg) => {
                Some(PreconditionFailure::MalformedImage(msg.clone()))
            }
            ExtractError::Timeout(_) | ExtractError::Unavailable(_) => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ExtractError::NoFaceDetected => "no_face_detected",
            ExtractError::MultipleFacesDetected { .. } => "multiple_faces_detected",
            ExtractError::MalformedImage(_) => "malformed_image",
            ExtractError::Timeout(_) => "extractor_timeout",
            ExtractError::Unavailable(_) => "extractor_unavailable",
        }
    }
}

/// Photo → embedding. Implemented outside this workspace's matching core
/// (the daemon talks to an external embedding service).
///
/// Must fail with `NoFaceDetected` or `MultipleFacesDetected` unless
/// exactly one face is present.
pub trait EmbeddingExtractor: Send {
    fn extract(&mut self, photo: &Photo) -> Result<Embedding, ExtractError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_face_failures_are_preconditions() {
        assert_eq!(
            ExtractError::NoFaceDetected.precondition(),
            Some(PreconditionFailure::NoFaceDetected)
        );
        assert_eq!(
            ExtractError::MultipleFacesDetected { count: 2 }.precondition(),
            Some(PreconditionFailure::MultipleFacesDetected { count: 2 })
        );
    }

    #[test]
    fn test_timeout_is_not_a_precondition() {
        assert!(ExtractError::Timeout(Duration::from_secs(1))
            .precondition()
            .is_none());
        assert_eq!(ExtractError::Timeout(Duration::ZERO).code(), "extractor_timeout");
    }
}
