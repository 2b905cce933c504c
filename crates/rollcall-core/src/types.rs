use crate::error::PreconditionFailure;
use crate::lifecycle::LifecycleState;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Stable identifier of a person (registration number or staff number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Instructor,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Instructor => "instructor",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(Role::Student),
            "instructor" => Ok(Role::Instructor),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Consent flags recorded for an identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentFlags {
    pub biometric_processing: bool,
    pub data_storage: bool,
    pub purpose_limitation: bool,
}

impl ConsentFlags {
    pub const fn all() -> Self {
        Self {
            biometric_processing: true,
            data_storage: true,
            purpose_limitation: true,
        }
    }

    /// Biometric operations need both processing and storage consent.
    pub const fn permits_biometrics(&self) -> bool {
        self.biometric_processing && self.data_storage
    }
}

/// A person known to the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub role: Role,
    pub display_name: String,
    pub consent: ConsentFlags,
    /// Consent policy version the current flags were given under.
    pub consent_version: Option<String>,
    pub consent_updated_at: Option<DateTime<Utc>>,
    pub lifecycle: LifecycleState,
    /// Reporting-only grouping attributes.
    pub year_of_study: Option<String>,
    pub course_program: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    pub fn new(id: impl Into<IdentityId>, role: Role, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            display_name: display_name.into(),
            consent: ConsentFlags::default(),
            consent_version: None,
            consent_updated_at: None,
            lifecycle: LifecycleState::Active,
            year_of_study: None,
            course_program: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_consent(mut self, consent: ConsentFlags) -> Self {
        self.consent = consent;
        self.consent_updated_at = Some(Utc::now());
        self
    }

    pub fn with_grouping(
        mut self,
        year_of_study: Option<String>,
        course_program: Option<String>,
    ) -> Self {
        self.year_of_study = year_of_study;
        self.course_program = course_program;
        self
    }
}

/// Face embedding vector produced by the external extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding.
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// False if any component is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean distance between two embeddings of the same dimension.
    /// Always walks every dimension.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// The canonical enrolled embedding for one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceTemplate {
    pub identity: IdentityId,
    pub embedding: Embedding,
    pub updated_at: DateTime<Utc>,
}

/// Normalised unit/session code: trimmed, upper-cased, 1..=20 characters
/// of `[A-Z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitCode(String);

const UNIT_CODE_MAX_LEN: usize = 20;

impl UnitCode {
    pub fn parse(raw: &str) -> Result<Self, PreconditionFailure> {
        let code = raw.trim().to_ascii_uppercase();
        let valid = !code.is_empty()
            && code.len() <= UNIT_CODE_MAX_LEN
            && code
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(code))
        } else {
            Err(PreconditionFailure::InvalidUnitCode(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Grouping attributes supplied with a recognition request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceContext {
    pub year_of_study: Option<String>,
    pub course_program: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Present,
    AlreadyMarked,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Present => "present",
            RecordStatus::AlreadyMarked => "already_marked",
        }
    }
}

/// One verified presence, unique per (identity, unit code, reporting day).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: Uuid,
    pub identity: IdentityId,
    pub unit_code: UnitCode,
    pub day: NaiveDate,
    pub recorded_at: DateTime<Utc>,
    /// Match confidence in [0, 1].
    pub confidence: f32,
    pub status: RecordStatus,
    pub year_of_study: Option<String>,
    pub course_program: Option<String>,
    pub origin: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Register,
    Enroll,
    Recognize,
    ConsentGrant,
    ConsentWithdraw,
    AccessRequest,
    RestrictionRequest,
    ErasureRequest,
    ReportAccess,
    AuditReview,
    AuditPurge,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Register => "register",
            AuditAction::Enroll => "enroll",
            AuditAction::Recognize => "recognize",
            AuditAction::ConsentGrant => "consent_grant",
            AuditAction::ConsentWithdraw => "consent_withdraw",
            AuditAction::AccessRequest => "access_request",
            AuditAction::RestrictionRequest => "restriction_request",
            AuditAction::ErasureRequest => "erasure_request",
            AuditAction::ReportAccess => "report_access",
            AuditAction::AuditReview => "audit_review",
            AuditAction::AuditPurge => "audit_purge",
        }
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "register" => AuditAction::Register,
            "enroll" => AuditAction::Enroll,
            "recognize" => AuditAction::Recognize,
            "consent_grant" => AuditAction::ConsentGrant,
            "consent_withdraw" => AuditAction::ConsentWithdraw,
            "access_request" => AuditAction::AccessRequest,
            "restriction_request" => AuditAction::RestrictionRequest,
            "erasure_request" => AuditAction::ErasureRequest,
            "report_access" => AuditAction::ReportAccess,
            "audit_review" => AuditAction::AuditReview,
            "audit_purge" => AuditAction::AuditPurge,
            other => return Err(format!("unknown audit action: {other}")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Denied,
}

impl AuditOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
            AuditOutcome::Denied => "denied",
        }
    }
}

impl FromStr for AuditOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(AuditOutcome::Success),
            "failure" => Ok(AuditOutcome::Failure),
            "denied" => Ok(AuditOutcome::Denied),
            other => Err(format!("unknown audit outcome: {other}")),
        }
    }
}

/// Immutable record of one operation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the trail, assigned on append.
    pub seq: Option<i64>,
    pub id: Uuid,
    pub at: DateTime<Utc>,
    /// `None` for anonymous callers (kiosk recognition).
    pub actor: Option<IdentityId>,
    pub action: AuditAction,
    pub subject: Option<IdentityId>,
    pub outcome: AuditOutcome,
    /// Machine-readable status code, e.g. `present` or `no_face_detected`.
    pub status: String,
    pub origin: Option<String>,
    pub confidence: Option<f32>,
    /// Fraction of liveness checks the photo passed, when they ran.
    pub liveness: Option<f32>,
    pub detail: Option<String>,
}

impl AuditEntry {
    pub fn new(action: AuditAction, outcome: AuditOutcome, status: impl Into<String>) -> Self {
        Self {
            seq: None,
            id: Uuid::new_v4(),
            at: Utc::now(),
            actor: None,
            action,
            subject: None,
            outcome,
            status: status.into(),
            origin: None,
            confidence: None,
            liveness: None,
            detail: None,
        }
    }

    pub fn actor(mut self, actor: Option<IdentityId>) -> Self {
        self.actor = actor;
        self
    }

    pub fn subject(mut self, subject: Option<IdentityId>) -> Self {
        self.subject = subject;
        self
    }

    pub fn origin(mut self, origin: Option<String>) -> Self {
        self.origin = origin;
        self
    }

    pub fn confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn liveness(mut self, score: Option<f32>) -> Self {
        self.liveness = score;
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// One page of a paginated read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn pages(&self) -> u64 {
        if self.per_page == 0 {
            return 0;
        }
        self.total.div_ceil(u64::from(self.per_page))
    }
}
