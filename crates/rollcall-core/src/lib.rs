//! rollcall-core: face attendance domain.
//!
//! Identity and consent types, the consent lifecycle state machine, the
//! consent guard, the 1:N face matcher, photo preconditions and passive
//! liveness checks. The embedding model itself lives behind
//! [`EmbeddingExtractor`].

pub mod consent;
pub mod error;
pub mod extractor;
pub mod lifecycle;
pub mod liveness;
pub mod matcher;
pub mod photo;
pub mod types;

pub use consent::{
    authorize, authorize_subject_request, role_permits, Decision, DenyReason, Operation,
};
pub use error::{MatchPolicyError, PreconditionFailure};
pub use extractor::{EmbeddingExtractor, ExtractError};
pub use lifecycle::{LifecycleEvent, LifecycleState, TransitionError};
pub use liveness::{check_liveness, LivenessPolicy, LivenessResult};
pub use matcher::{EuclideanMatcher, MatchDecision, MatchPolicy, Matcher, NoMatchReason};
pub use photo::{Photo, PhotoLimits, DEFAULT_MAX_IMAGE_BYTES};
pub use types::{
    AttendanceContext, AttendanceRecord, AuditAction, AuditEntry, AuditOutcome, ConsentFlags,
    Embedding, FaceTemplate, Identity, IdentityId, Page, RecordStatus, Role, UnitCode,
};
