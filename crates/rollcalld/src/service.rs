//! Attendance service: the consent guard, extractor, stores and audit
//! trail wired into the operations exposed over D-Bus.
//!
//! Every operation emits exactly one audit entry. On success the entry is
//! written in the same transaction as the data it describes; on failure it
//! is appended on its own. If the audit write fails the operation fails
//! with `StorageUnavailable`. Photo decoding and liveness run on the
//! blocking pool and extraction on the extractor thread; both finish
//! before any write, so a dropped request leaves nothing behind.

use crate::config::{Config, ConfigError};
use crate::worker::ExtractorHandle;
use chrono::{DateTime, FixedOffset, Utc};
use rollcall_core::{
    authorize, authorize_subject_request, AttendanceContext, AttendanceRecord, AuditAction,
    AuditEntry, AuditOutcome, ConsentFlags, Decision, DenyReason, EuclideanMatcher, ExtractError,
    FaceTemplate, Identity, IdentityId, LifecycleEvent, LifecycleState, LivenessPolicy,
    LivenessResult, MatchDecision, MatchPolicy, Matcher, NoMatchReason, Operation, Page, Photo,
    PhotoLimits, PreconditionFailure, RecordStatus, UnitCode,
};
use rollcall_store::{
    AttendanceLedger, AttendanceQuery, AttendanceReport, AuditQuery, AuditTrail, ConsentEvent,
    ConsentEventKind, Database, IdentityRegistry, LedgerOutcome, NewAttendance, StoreError,
    TemplateCipher, TemplateStore,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Error classes reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Precondition,
    ConsentDenied,
    ExtractorUnavailable,
    InvalidRequest,
    StorageUnavailable,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Precondition => "precondition",
            ErrorKind::ConsentDenied => "consent_denied",
            ErrorKind::ExtractorUnavailable => "extractor_unavailable",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::StorageUnavailable => "storage_unavailable",
        }
    }
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Precondition(#[from] PreconditionFailure),
    #[error("consent denied: {}", .0.code())]
    ConsentDenied(DenyReason),
    #[error(transparent)]
    Extractor(ExtractError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("storage unavailable: {0}")]
    Storage(StoreError),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Precondition(_) => ErrorKind::Precondition,
            ServiceError::ConsentDenied(_) => ErrorKind::ConsentDenied,
            ServiceError::Extractor(_) => ErrorKind::ExtractorUnavailable,
            ServiceError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ServiceError::Storage(_) => ErrorKind::StorageUnavailable,
        }
    }

    /// Status code recorded in the audit trail.
    pub fn status(&self) -> &'static str {
        match self {
            ServiceError::Precondition(p) => p.code(),
            ServiceError::ConsentDenied(r) => r.code(),
            ServiceError::Extractor(e) => e.code(),
            ServiceError::InvalidRequest(_) => "invalid_request",
            ServiceError::Storage(_) => "storage_unavailable",
        }
    }

    /// Liveness score carried by a rejected photo.
    fn liveness_score(&self) -> Option<f32> {
        match self {
            ServiceError::Precondition(PreconditionFailure::LivenessFailed { score, .. }) => {
                Some(*score)
            }
            _ => None,
        }
    }

    fn audit_outcome(&self) -> AuditOutcome {
        match self {
            ServiceError::ConsentDenied(_) => AuditOutcome::Denied,
            _ => AuditOutcome::Failure,
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidTemplate { expected, actual } => {
                PreconditionFailure::InvalidTemplate { expected, actual }.into()
            }
            StoreError::NonFiniteTemplate => PreconditionFailure::NonFiniteEmbedding.into(),
            StoreError::Denied(reason) => ServiceError::ConsentDenied(reason),
            e @ (StoreError::UnknownIdentity(_)
            | StoreError::DuplicateIdentity(_)
            | StoreError::InvalidState { .. }
            | StoreError::Transition(_)) => ServiceError::InvalidRequest(e.to_string()),
            e => ServiceError::Storage(e),
        }
    }
}

impl From<ExtractError> for ServiceError {
    fn from(e: ExtractError) -> Self {
        match e.precondition() {
            Some(p) => ServiceError::Precondition(p),
            None => ServiceError::Extractor(e),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollOutcome {
    pub identity: IdentityId,
    pub updated_at: DateTime<Utc>,
    /// A previous template was overwritten.
    pub replaced: bool,
    pub model_version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecognizeOutcome {
    Present {
        identity: IdentityId,
        confidence: f32,
        record: AttendanceRecord,
    },
    /// Idempotent repeat; `record` is the original, unchanged.
    AlreadyMarked {
        identity: IdentityId,
        confidence: f32,
        record: AttendanceRecord,
    },
    NoMatch {
        #[serde(flatten)]
        reason: NoMatchReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataRequestKind {
    Access,
    Restriction,
    Erasure,
}

impl DataRequestKind {
    fn action(self) -> AuditAction {
        match self {
            DataRequestKind::Access => AuditAction::AccessRequest,
            DataRequestKind::Restriction => AuditAction::RestrictionRequest,
            DataRequestKind::Erasure => AuditAction::ErasureRequest,
        }
    }
}

impl std::str::FromStr for DataRequestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "access" => Ok(DataRequestKind::Access),
            "restriction" => Ok(DataRequestKind::Restriction),
            "erasure" => Ok(DataRequestKind::Erasure),
            other => Err(format!("unknown data request kind: {other}")),
        }
    }
}

/// Template metadata only. The vector itself is never exported.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateSummary {
    pub enrolled: bool,
    pub updated_at: Option<DateTime<Utc>>,
    pub model_version: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubjectExport {
    pub identity: Identity,
    pub consent_history: Vec<ConsentEvent>,
    pub template: TemplateSummary,
    pub attendance: Vec<AttendanceRecord>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum DataRequestOutcome {
    Access { export: Box<SubjectExport> },
    Restriction { lifecycle: LifecycleState },
    Erasure { template_deleted: bool },
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainReport {
    pub intact: bool,
    pub entries_checked: u64,
    pub broken_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub version: &'static str,
    pub identities: usize,
    pub templates: usize,
    pub embedding_dim: usize,
    pub policy: MatchPolicy,
    pub audit_entries: u64,
}

/// Runtime parameters taken from [`Config`].
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub embedding_dim: usize,
    pub policy: MatchPolicy,
    pub report_offset: FixedOffset,
    pub photo_limits: PhotoLimits,
    pub liveness: LivenessPolicy,
    pub consent_version: String,
}

impl ServiceSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            embedding_dim: config.embedding_dim,
            policy: config.match_policy()?,
            report_offset: config.report_offset()?,
            photo_limits: config.photo_limits(),
            liveness: config.liveness_policy()?,
            consent_version: config.consent_version.clone(),
        })
    }
}

pub struct AttendanceService {
    db: Database,
    registry: IdentityRegistry,
    templates: TemplateStore,
    ledger: AttendanceLedger,
    audit: AuditTrail,
    matcher: EuclideanMatcher,
    extractor: ExtractorHandle,
    limits: PhotoLimits,
    liveness: LivenessPolicy,
    consent_version: String,
}

impl AttendanceService {
    /// Loads identities and templates from `db`.
    pub fn new(
        db: Database,
        cipher: TemplateCipher,
        extractor: ExtractorHandle,
        settings: ServiceSettings,
    ) -> Result<Self, StoreError> {
        let registry = IdentityRegistry::load(db.clone())?;
        let templates = TemplateStore::load(db.clone(), cipher, settings.embedding_dim)?;
        Ok(Self {
            ledger: AttendanceLedger::new(db.clone(), settings.report_offset),
            audit: AuditTrail::new(db.clone()),
            db,
            registry,
            templates,
            matcher: EuclideanMatcher::new(settings.policy),
            extractor,
            limits: settings.photo_limits,
            liveness: settings.liveness,
            consent_version: settings.consent_version,
        })
    }

    /// Creates an identity. If it arrives with consent flags set, the grant
    /// is recorded as a consent event.
    pub fn register(
        &self,
        identity: Identity,
        origin: Option<&str>,
    ) -> Result<Identity, ServiceError> {
        let origin = origin.map(str::to_string);
        let subject = identity.id.clone();
        self.try_register(identity, &origin)
            .map_err(|err| self.fail(AuditAction::Register, None, Some(&subject), &origin, err))
    }

    fn try_register(
        &self,
        mut identity: Identity,
        origin: &Option<String>,
    ) -> Result<Identity, ServiceError> {
        let now = Utc::now();
        let granted = identity.consent != ConsentFlags::default();
        if granted {
            identity.consent_version = Some(self.consent_version.clone());
            identity.consent_updated_at = Some(now);
        }

        let created = identity.clone();
        self.registry.register(identity, |tx| {
            if granted {
                IdentityRegistry::record_consent_event(
                    tx,
                    &ConsentEvent {
                        identity: created.id.clone(),
                        kind: ConsentEventKind::Grant,
                        flags: created.consent,
                        policy_version: created.consent_version.clone(),
                        origin: origin.clone(),
                        at: now,
                    },
                )?;
            }
            let entry = AuditEntry::new(AuditAction::Register, AuditOutcome::Success, "registered")
                .subject(Some(created.id.clone()))
                .origin(origin.clone())
                .detail(format!("role {}", created.role.as_str()));
            AuditTrail::append_in(tx, &entry)?;
            Ok(())
        })?;
        Ok(created)
    }

    /// Stores or replaces the subject's template from one photo.
    pub async fn enroll(
        &self,
        subject: &IdentityId,
        photo: Vec<u8>,
        origin: Option<&str>,
    ) -> Result<EnrollOutcome, ServiceError> {
        let origin = origin.map(str::to_string);
        match self.try_enroll(subject, photo, &origin).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let action = AuditAction::Enroll;
                Err(self.fail(action, Some(subject), Some(subject), &origin, err))
            }
        }
    }

    async fn try_enroll(
        &self,
        subject: &IdentityId,
        photo: Vec<u8>,
        origin: &Option<String>,
    ) -> Result<EnrollOutcome, ServiceError> {
        let identity = self.registry.get(subject)?;
        if let Decision::Deny(reason) = authorize(identity.as_ref(), Operation::Enroll) {
            return Err(ServiceError::ConsentDenied(reason));
        }

        let (photo, liveness) = self.inspect(photo).await?;
        let embedding = self.extractor.extract(photo).await?;
        self.templates.validate(&embedding)?;
        let replaced = self.templates.get(subject)?.is_some();

        let template = self.templates.replace(subject, embedding, |tx, _| {
            // Consent may have changed while the extractor ran.
            let current = IdentityRegistry::load_in(tx, subject)?;
            if let Decision::Deny(reason) = authorize(current.as_ref(), Operation::Enroll) {
                return Err(StoreError::Denied(reason));
            }
            let entry = AuditEntry::new(AuditAction::Enroll, AuditOutcome::Success, "enrolled")
                .actor(Some(subject.clone()))
                .subject(Some(subject.clone()))
                .origin(origin.clone())
                .liveness(Some(liveness.score))
                .detail(if replaced { "template replaced" } else { "template created" });
            AuditTrail::append_in(tx, &entry)?;
            Ok(())
        })?;

        tracing::info!(identity = %subject, replaced, "template enrolled");
        Ok(EnrollOutcome {
            identity: subject.clone(),
            updated_at: template.updated_at,
            replaced,
            model_version: template.embedding.model_version,
        })
    }

    /// 1:N identification followed by an idempotent attendance write.
    pub async fn recognize(
        &self,
        photo: Vec<u8>,
        unit_code: &str,
        context: AttendanceContext,
        origin: Option<&str>,
    ) -> Result<RecognizeOutcome, ServiceError> {
        let origin = origin.map(str::to_string);
        let mut matched = None;
        match self
            .try_recognize(photo, unit_code, context, &origin, &mut matched)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let action = AuditAction::Recognize;
                Err(self.fail(action, None, matched.as_ref(), &origin, err))
            }
        }
    }

    async fn try_recognize(
        &self,
        photo: Vec<u8>,
        unit_code: &str,
        context: AttendanceContext,
        origin: &Option<String>,
        matched: &mut Option<IdentityId>,
    ) -> Result<RecognizeOutcome, ServiceError> {
        let unit_code = UnitCode::parse(unit_code)?;
        let (photo, liveness) = self.inspect(photo).await?;
        let query = self.extractor.extract(photo).await?;
        self.templates.validate(&query)?;
        let liveness = liveness.score;

        // Only identities the guard allows may be compared against.
        let snapshot = self.templates.get_all()?;
        let mut gallery: Vec<Arc<FaceTemplate>> = Vec::with_capacity(snapshot.len());
        for template in snapshot.values() {
            let identity = self.registry.get(&template.identity)?;
            if authorize(identity.as_ref(), Operation::Recognize).is_allow() {
                gallery.push(Arc::clone(template));
            }
        }
        if gallery.is_empty() {
            return self.no_match(NoMatchReason::EmptyGallery, &unit_code, liveness, origin);
        }

        let candidates: Vec<&FaceTemplate> = gallery.iter().map(Arc::as_ref).collect();
        match self.matcher.identify(&query, &candidates) {
            MatchDecision::NoMatch(reason) => self.no_match(reason, &unit_code, liveness, origin),
            MatchDecision::Match {
                identity,
                distance,
                confidence,
            } => {
                tracing::debug!(identity = %identity, distance, confidence, "query identified");
                *matched = Some(identity.clone());
                self.mark(identity, confidence, liveness, unit_code, context, origin)
            }
        }
    }

    /// Decodes the photo and scores liveness on the blocking pool.
    async fn inspect(&self, photo: Vec<u8>) -> Result<(Photo, LivenessResult), ServiceError> {
        let limits = self.limits;
        let policy = self.liveness;
        let checked =
            tokio::task::spawn_blocking(move || Photo::decode_live(photo, &limits, &policy))
                .await
                .map_err(|e| {
                    ServiceError::Extractor(ExtractError::Unavailable(format!(
                        "photo decode task failed: {e}"
                    )))
                })?;
        checked.map_err(ServiceError::from)
    }

    fn no_match(
        &self,
        reason: NoMatchReason,
        unit_code: &UnitCode,
        liveness: f32,
        origin: &Option<String>,
    ) -> Result<RecognizeOutcome, ServiceError> {
        let detail = serde_json::json!({ "unit_code": unit_code, "reason": reason }).to_string();
        let entry = AuditEntry::new(AuditAction::Recognize, AuditOutcome::Failure, "no_match")
            .origin(origin.clone())
            .liveness(Some(liveness))
            .detail(detail);
        self.audit.append(&entry)?;
        tracing::info!(unit = %unit_code, ?reason, "no match");
        Ok(RecognizeOutcome::NoMatch { reason })
    }

    fn mark(
        &self,
        identity: IdentityId,
        confidence: f32,
        liveness: f32,
        unit_code: UnitCode,
        context: AttendanceContext,
        origin: &Option<String>,
    ) -> Result<RecognizeOutcome, ServiceError> {
        let now = Utc::now();
        let outcome = self.db.transaction(|tx| {
            let current = IdentityRegistry::load_in(tx, &identity)?;
            if let Decision::Deny(reason) = authorize(current.as_ref(), Operation::MarkAttendance) {
                return Err(StoreError::Denied(reason));
            }
            // Request grouping wins; the identity's profile fills the gaps.
            let profile = current.as_ref();
            let context = AttendanceContext {
                year_of_study: context
                    .year_of_study
                    .clone()
                    .or_else(|| profile.and_then(|p| p.year_of_study.clone())),
                course_program: context
                    .course_program
                    .clone()
                    .or_else(|| profile.and_then(|p| p.course_program.clone())),
            };

            let outcome = self.ledger.record_in(
                tx,
                &NewAttendance {
                    identity: identity.clone(),
                    unit_code: unit_code.clone(),
                    at: now,
                    confidence,
                    context,
                    origin: origin.clone(),
                },
            )?;
            let status = match &outcome {
                LedgerOutcome::Recorded(_) => RecordStatus::Present,
                LedgerOutcome::AlreadyMarked(_) => RecordStatus::AlreadyMarked,
            };
            let success = AuditOutcome::Success;
            let entry = AuditEntry::new(AuditAction::Recognize, success, status.as_str())
                .subject(Some(identity.clone()))
                .origin(origin.clone())
                .confidence(confidence)
                .liveness(Some(liveness))
                .detail(format!("unit {unit_code}"));
            AuditTrail::append_in(tx, &entry)?;
            Ok(outcome)
        })?;

        Ok(match outcome {
            LedgerOutcome::Recorded(record) => {
                tracing::info!(
                    identity = %identity,
                    unit = %unit_code,
                    confidence,
                    "attendance recorded"
                );
                RecognizeOutcome::Present {
                    identity,
                    confidence,
                    record,
                }
            }
            LedgerOutcome::AlreadyMarked(record) => {
                tracing::info!(
                    identity = %identity,
                    unit = %unit_code,
                    "attendance already marked"
                );
                RecognizeOutcome::AlreadyMarked {
                    identity,
                    confidence,
                    record,
                }
            }
        })
    }

    /// Replaces the subject's consent flags. From `Suspended` this is the
    /// explicit event that reactivates biometric processing, and requires
    /// both processing and storage consent.
    pub fn grant_consent(
        &self,
        actor: &IdentityId,
        subject: &IdentityId,
        flags: ConsentFlags,
        origin: Option<&str>,
    ) -> Result<Identity, ServiceError> {
        let origin = origin.map(str::to_string);
        self.try_grant_consent(actor, subject, flags, &origin).map_err(|err| {
            self.fail(AuditAction::ConsentGrant, Some(actor), Some(subject), &origin, err)
        })
    }

    fn try_grant_consent(
        &self,
        actor: &IdentityId,
        subject: &IdentityId,
        flags: ConsentFlags,
        origin: &Option<String>,
    ) -> Result<Identity, ServiceError> {
        self.check_subject_request(actor, subject)?;
        let now = Utc::now();
        let version = self.consent_version.clone();

        let (identity, ()) = self.registry.update(subject, |tx, identity| {
            match identity.lifecycle {
                LifecycleState::Active => {}
                LifecycleState::Suspended if flags.permits_biometrics() => {
                    identity.lifecycle = identity.lifecycle.apply(LifecycleEvent::RenewConsent)?;
                }
                state => {
                    return Err(StoreError::InvalidState {
                        identity: identity.id.clone(),
                        state,
                    })
                }
            }
            identity.consent = flags;
            identity.consent_version = Some(version.clone());
            identity.consent_updated_at = Some(now);

            IdentityRegistry::record_consent_event(
                tx,
                &ConsentEvent {
                    identity: subject.clone(),
                    kind: ConsentEventKind::Grant,
                    flags,
                    policy_version: Some(version.clone()),
                    origin: origin.clone(),
                    at: now,
                },
            )?;
            let entry = AuditEntry::new(AuditAction::ConsentGrant, AuditOutcome::Success, "granted")
                .actor(Some(actor.clone()))
                .subject(Some(subject.clone()))
                .origin(origin.clone());
            AuditTrail::append_in(tx, &entry)?;
            Ok(())
        })?;

        tracing::info!(
            identity = %subject,
            lifecycle = identity.lifecycle.as_str(),
            "consent granted"
        );
        Ok(identity)
    }

    /// Withdraws biometric consent: `Active → WithdrawalRequested →
    /// Suspended`. The template is kept but no longer matchable.
    pub fn withdraw_consent(
        &self,
        actor: &IdentityId,
        subject: &IdentityId,
        origin: Option<&str>,
    ) -> Result<Identity, ServiceError> {
        let origin = origin.map(str::to_string);
        self.try_withdraw_consent(actor, subject, &origin).map_err(|err| {
            self.fail(AuditAction::ConsentWithdraw, Some(actor), Some(subject), &origin, err)
        })
    }

    fn try_withdraw_consent(
        &self,
        actor: &IdentityId,
        subject: &IdentityId,
        origin: &Option<String>,
    ) -> Result<Identity, ServiceError> {
        self.check_subject_request(actor, subject)?;
        let now = Utc::now();
        let version = self.consent_version.clone();

        let (identity, ()) = self.registry.update(subject, |tx, identity| {
            suspend(identity)?;
            identity.consent.biometric_processing = false;
            identity.consent_updated_at = Some(now);

            IdentityRegistry::record_consent_event(
                tx,
                &ConsentEvent {
                    identity: subject.clone(),
                    kind: ConsentEventKind::Withdraw,
                    flags: identity.consent,
                    policy_version: Some(version.clone()),
                    origin: origin.clone(),
                    at: now,
                },
            )?;
            let entry =
                AuditEntry::new(AuditAction::ConsentWithdraw, AuditOutcome::Success, "suspended")
                    .actor(Some(actor.clone()))
                    .subject(Some(subject.clone()))
                    .origin(origin.clone());
            AuditTrail::append_in(tx, &entry)?;
            Ok(())
        })?;

        tracing::info!(identity = %subject, "consent withdrawn; identity suspended");
        Ok(identity)
    }

    /// Access, restriction or erasure request filed by the subject or an
    /// admin.
    pub fn data_request(
        &self,
        actor: &IdentityId,
        subject: &IdentityId,
        kind: DataRequestKind,
        origin: Option<&str>,
    ) -> Result<DataRequestOutcome, ServiceError> {
        let origin = origin.map(str::to_string);
        self.try_data_request(actor, subject, kind, &origin)
            .map_err(|err| self.fail(kind.action(), Some(actor), Some(subject), &origin, err))
    }

    fn try_data_request(
        &self,
        actor: &IdentityId,
        subject: &IdentityId,
        kind: DataRequestKind,
        origin: &Option<String>,
    ) -> Result<DataRequestOutcome, ServiceError> {
        self.check_subject_request(actor, subject)?;
        let entry = |status: &str| {
            AuditEntry::new(kind.action(), AuditOutcome::Success, status)
                .actor(Some(actor.clone()))
                .subject(Some(subject.clone()))
                .origin(origin.clone())
        };

        match kind {
            DataRequestKind::Access => {
                let identity = self
                    .registry
                    .get(subject)?
                    .ok_or_else(|| StoreError::UnknownIdentity(subject.clone()))?;
                let template = self.templates.get(subject)?;
                let export = SubjectExport {
                    identity,
                    consent_history: self.registry.consent_history(subject)?,
                    template: TemplateSummary {
                        enrolled: template.is_some(),
                        updated_at: template.as_ref().map(|t| t.updated_at),
                        model_version: template.and_then(|t| t.embedding.model_version.clone()),
                    },
                    attendance: self.ledger.history(subject)?,
                };
                self.audit.append(&entry("exported"))?;
                Ok(DataRequestOutcome::Access {
                    export: Box::new(export),
                })
            }
            DataRequestKind::Restriction => {
                let (identity, ()) = self.registry.update(subject, |tx, identity| {
                    suspend(identity)?;
                    AuditTrail::append_in(tx, &entry("restricted"))?;
                    Ok(())
                })?;
                tracing::info!(identity = %subject, "processing restricted");
                Ok(DataRequestOutcome::Restriction {
                    lifecycle: identity.lifecycle,
                })
            }
            DataRequestKind::Erasure => {
                let (_, template_deleted) = self.registry.update(subject, |tx, identity| {
                    for event in identity.lifecycle.path_to_erased() {
                        identity.lifecycle = identity.lifecycle.apply(*event)?;
                    }
                    identity.consent = ConsentFlags::default();
                    let deleted = TemplateStore::delete_in(tx, subject)?;
                    AuditTrail::append_in(
                        tx,
                        &entry("erased").detail(if deleted {
                            "template deleted"
                        } else {
                            "no template"
                        }),
                    )?;
                    Ok(deleted)
                })?;
                self.templates.evict(subject)?;
                tracing::info!(identity = %subject, template_deleted, "identity erased");
                Ok(DataRequestOutcome::Erasure { template_deleted })
            }
        }
    }

    /// Instructor/admin attendance report.
    pub fn attendance_report(
        &self,
        actor: &IdentityId,
        query: &AttendanceQuery,
        origin: Option<&str>,
    ) -> Result<AttendanceReport, ServiceError> {
        let origin = origin.map(str::to_string);
        let result = (|| -> Result<_, ServiceError> {
            self.check_operation(actor, Operation::ViewReports)?;
            let report = self.ledger.report(query)?;
            let filter = serde_json::to_string(query)
                .map_err(|e| ServiceError::InvalidRequest(e.to_string()))?;
            self.audit.append(
                &AuditEntry::new(AuditAction::ReportAccess, AuditOutcome::Success, "report")
                    .actor(Some(actor.clone()))
                    .origin(origin.clone())
                    .detail(filter),
            )?;
            Ok(report)
        })();
        result.map_err(|err| self.fail(AuditAction::ReportAccess, Some(actor), None, &origin, err))
    }

    /// One identity's own attendance, newest first.
    pub fn attendance_history(
        &self,
        actor: &IdentityId,
        subject: &IdentityId,
        origin: Option<&str>,
    ) -> Result<Vec<AttendanceRecord>, ServiceError> {
        let origin = origin.map(str::to_string);
        let result = (|| -> Result<_, ServiceError> {
            self.check_subject_request(actor, subject)?;
            let records = self.ledger.history(subject)?;
            self.audit.append(
                &AuditEntry::new(AuditAction::ReportAccess, AuditOutcome::Success, "history")
                    .actor(Some(actor.clone()))
                    .subject(Some(subject.clone()))
                    .origin(origin.clone()),
            )?;
            Ok(records)
        })();
        result.map_err(|err| {
            self.fail(AuditAction::ReportAccess, Some(actor), Some(subject), &origin, err)
        })
    }

    /// Admin review of the audit trail.
    pub fn audit_log(
        &self,
        actor: &IdentityId,
        query: &AuditQuery,
        origin: Option<&str>,
    ) -> Result<Page<AuditEntry>, ServiceError> {
        let origin = origin.map(str::to_string);
        let result = (|| -> Result<_, ServiceError> {
            self.check_operation(actor, Operation::ReviewAudit)?;
            let page = self.audit.query(query)?;
            self.audit.append(
                &AuditEntry::new(AuditAction::AuditReview, AuditOutcome::Success, "reviewed")
                    .actor(Some(actor.clone()))
                    .origin(origin.clone()),
            )?;
            Ok(page)
        })();
        result.map_err(|err| self.fail(AuditAction::AuditReview, Some(actor), None, &origin, err))
    }

    /// Admin check of the audit hash chain.
    pub fn verify_audit(
        &self,
        actor: &IdentityId,
        origin: Option<&str>,
    ) -> Result<ChainReport, ServiceError> {
        let origin = origin.map(str::to_string);
        let result = (|| -> Result<_, ServiceError> {
            self.check_operation(actor, Operation::ReviewAudit)?;
            let report = match self.audit.verify_chain() {
                Ok(n) => ChainReport {
                    intact: true,
                    entries_checked: n,
                    broken_at: None,
                },
                Err(StoreError::ChainBroken { seq }) => {
                    tracing::error!(seq, "audit chain broken");
                    ChainReport {
                        intact: false,
                        entries_checked: 0,
                        broken_at: Some(seq),
                    }
                }
                Err(e) => return Err(e.into()),
            };
            let status = if report.intact { "chain_intact" } else { "chain_broken" };
            self.audit.append(
                &AuditEntry::new(AuditAction::AuditReview, AuditOutcome::Success, status)
                    .actor(Some(actor.clone()))
                    .origin(origin.clone()),
            )?;
            Ok(report)
        })();
        result.map_err(|err| self.fail(AuditAction::AuditReview, Some(actor), None, &origin, err))
    }

    /// Deletes audit entries older than `before`. The purge is itself
    /// audited in the same transaction.
    pub fn purge_audit(
        &self,
        actor: &IdentityId,
        before: DateTime<Utc>,
        origin: Option<&str>,
    ) -> Result<usize, ServiceError> {
        let origin = origin.map(str::to_string);
        let result = (|| -> Result<_, ServiceError> {
            self.check_operation(actor, Operation::PurgeAudit)?;
            if before > Utc::now() {
                return Err(ServiceError::InvalidRequest(format!(
                    "purge cutoff {before} is in the future"
                )));
            }
            let purged = self.db.transaction(|tx| {
                let purged = AuditTrail::purge_before_in(tx, before)?;
                AuditTrail::append_in(
                    tx,
                    &AuditEntry::new(AuditAction::AuditPurge, AuditOutcome::Success, "purged")
                        .actor(Some(actor.clone()))
                        .origin(origin.clone())
                        .detail(format!("{purged} entries before {}", before.to_rfc3339())),
                )?;
                Ok(purged)
            })?;
            tracing::warn!(actor = %actor, purged, cutoff = %before, "audit entries purged");
            Ok(purged)
        })();
        result.map_err(|err| self.fail(AuditAction::AuditPurge, Some(actor), None, &origin, err))
    }

    pub fn status(&self) -> Result<ServiceStatus, ServiceError> {
        Ok(ServiceStatus {
            version: env!("CARGO_PKG_VERSION"),
            identities: self.registry.len()?,
            templates: self.templates.len()?,
            embedding_dim: self.templates.dim(),
            policy: *self.matcher.policy(),
            audit_entries: self.audit.count()?,
        })
    }

    fn check_operation(&self, actor: &IdentityId, op: Operation) -> Result<(), ServiceError> {
        let identity = self.registry.get(actor)?;
        match authorize(identity.as_ref(), op) {
            Decision::Allow => Ok(()),
            Decision::Deny(reason) => Err(ServiceError::ConsentDenied(reason)),
        }
    }

    fn check_subject_request(
        &self,
        actor: &IdentityId,
        subject: &IdentityId,
    ) -> Result<(), ServiceError> {
        let identity = self.registry.get(actor)?;
        match authorize_subject_request(identity.as_ref(), subject) {
            Decision::Allow => Ok(()),
            Decision::Deny(reason) => Err(ServiceError::ConsentDenied(reason)),
        }
    }

    /// Audits a failed attempt and hands the error back. If the failure
    /// cannot be audited the caller sees `StorageUnavailable` instead.
    fn fail(
        &self,
        action: AuditAction,
        actor: Option<&IdentityId>,
        subject: Option<&IdentityId>,
        origin: &Option<String>,
        err: ServiceError,
    ) -> ServiceError {
        let entry = AuditEntry::new(action, err.audit_outcome(), err.status())
            .actor(actor.cloned())
            .subject(subject.cloned())
            .origin(origin.clone())
            .liveness(err.liveness_score())
            .detail(err.to_string());

        match self.audit.append(&entry) {
            Ok(_) => {
                tracing::warn!(
                    action = action.as_str(),
                    status = err.status(),
                    subject = ?subject.map(IdentityId::as_str),
                    "operation rejected"
                );
                err
            }
            Err(audit_err) => {
                tracing::error!(
                    action = action.as_str(),
                    error = %audit_err,
                    original = %err,
                    "audit append failed; failing closed"
                );
                ServiceError::Storage(audit_err)
            }
        }
    }
}

/// Moves an identity to `Suspended` along the withdrawal path.
fn suspend(identity: &mut Identity) -> Result<(), StoreError> {
    if identity.lifecycle == LifecycleState::Erased {
        return Err(StoreError::InvalidState {
            identity: identity.id.clone(),
            state: identity.lifecycle,
        });
    }
    for event in identity.lifecycle.path_to_suspended() {
        identity.lifecycle = identity.lifecycle.apply(*event)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::spawn_worker;
    use crate::worker::testing::{png, ScriptedExtractor};
    use rollcall_core::{Embedding, Role};
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    const DIM: usize = 4;

    struct Harness {
        service: Arc<AttendanceService>,
        script: Arc<Mutex<VecDeque<Result<Embedding, ExtractError>>>>,
        calls: Arc<Mutex<usize>>,
        db_path: PathBuf,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        /// Queues the next extractor result.
        fn next(&self, result: Result<Embedding, ExtractError>) {
            self.script.lock().unwrap().push_back(result);
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }

        fn person(&self, id: &str, role: Role) {
            self.service
                .register(
                    Identity::new(id, role, id).with_consent(ConsentFlags::all()),
                    Some("10.0.0.1"),
                )
                .unwrap();
        }

        async fn enrolled(&self, id: &str, values: [f32; DIM]) {
            self.next(Ok(Embedding::new(values.to_vec())));
            self.service
                .enroll(&IdentityId::from(id), png(), None)
                .await
                .unwrap();
        }

        async fn recognize(&self, query: [f32; DIM]) -> Result<RecognizeOutcome, ServiceError> {
            self.next(Ok(Embedding::new(query.to_vec())));
            self.service
                .recognize(png(), "cs304", AttendanceContext::default(), Some("kiosk-1"))
                .await
        }

        fn audit(&self, action: AuditAction) -> Vec<AuditEntry> {
            self.service
                .audit
                .query(&AuditQuery {
                    action: Some(action),
                    ..Default::default()
                })
                .unwrap()
                .items
        }
    }

    /// Liveness scored but never enforced; the stock test photo is a flat
    /// 4x4 image.
    fn scoring_only() -> LivenessPolicy {
        LivenessPolicy {
            min_score: 0.0,
            ..LivenessPolicy::default()
        }
    }

    fn harness_with(extractor: ScriptedExtractor, timeout: Duration) -> Harness {
        harness_with_liveness(extractor, timeout, scoring_only())
    }

    fn harness_with_liveness(
        extractor: ScriptedExtractor,
        timeout: Duration,
        liveness: LivenessPolicy,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("rollcall.db");
        let script = Arc::clone(&extractor.script);
        let calls = Arc::clone(&extractor.calls);
        let handle = spawn_worker(Box::new(extractor), timeout).unwrap();
        let service = AttendanceService::new(
            Database::open(&db_path).unwrap(),
            TemplateCipher::from_key(&[4u8; 32]),
            handle,
            ServiceSettings {
                embedding_dim: DIM,
                policy: MatchPolicy::default(),
                report_offset: FixedOffset::east_opt(3 * 3600).unwrap(),
                photo_limits: PhotoLimits::default(),
                liveness,
                consent_version: "1.0".into(),
            },
        )
        .unwrap();
        Harness {
            service: Arc::new(service),
            script,
            calls,
            db_path,
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        harness_with(
            ScriptedExtractor::always(Err(ExtractError::Unavailable("unscripted".into()))),
            Duration::from_secs(5),
        )
    }

    fn id(s: &str) -> IdentityId {
        IdentityId::from(s)
    }

    #[tokio::test]
    async fn test_reenrollment_overwrites_template() {
        let h = harness();
        h.person("S1", Role::Student);

        h.next(Ok(Embedding::new(vec![0.1; DIM])));
        let first = h.service.enroll(&id("S1"), png(), None).await.unwrap();
        assert!(!first.replaced);

        h.next(Ok(Embedding::new(vec![0.2; DIM])));
        let second = h.service.enroll(&id("S1"), png(), None).await.unwrap();
        assert!(second.replaced);

        let stored = h.service.templates.get(&id("S1")).unwrap().unwrap();
        assert_eq!(stored.embedding.values, vec![0.2; DIM]);
        assert_eq!(h.service.templates.len().unwrap(), 1);
        assert_eq!(h.audit(AuditAction::Enroll).len(), 2);
    }

    #[tokio::test]
    async fn test_no_face_is_audited_and_writes_nothing() {
        let h = harness();
        h.person("S1", Role::Student);
        h.next(Err(ExtractError::NoFaceDetected));

        let err = h.service.enroll(&id("S1"), png(), Some("10.0.0.9")).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Precondition(PreconditionFailure::NoFaceDetected)
        ));
        assert!(h.service.templates.get(&id("S1")).unwrap().is_none());

        let entries = h.audit(AuditAction::Enroll);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, AuditOutcome::Failure);
        assert_eq!(entries[0].status, "no_face_detected");
        assert_eq!(entries[0].origin.as_deref(), Some("10.0.0.9"));
    }

    #[tokio::test]
    async fn test_malformed_photo_rejected_before_extraction() {
        let h = harness();
        h.person("S1", Role::Student);
        let err = h
            .service
            .enroll(&id("S1"), b"not an image".to_vec(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert_eq!(err.status(), "malformed_image");
        assert_eq!(h.calls(), 0);
    }

    #[tokio::test]
    async fn test_consent_checked_before_extraction() {
        let h = harness();
        h.service
            .register(Identity::new("S1", Role::Student, "S1"), None)
            .unwrap();

        let err = h.service.enroll(&id("S1"), png(), None).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::ConsentDenied(DenyReason::BiometricConsentMissing)
        ));
        assert_eq!(h.calls(), 0);

        let entries = h.audit(AuditAction::Enroll);
        assert_eq!(entries[0].outcome, AuditOutcome::Denied);
        assert_eq!(entries[0].status, "biometric_consent_missing");
    }

    #[tokio::test]
    async fn test_recognize_present_then_already_marked() {
        let h = harness();
        h.person("S1", Role::Student);
        h.person("S2", Role::Student);
        h.enrolled("S1", [0.0; DIM]).await;
        h.enrolled("S2", [1.0; DIM]).await;

        let first = h.recognize([0.1, 0.0, 0.0, 0.0]).await.unwrap();
        let (identity, confidence, record) = match first {
            RecognizeOutcome::Present {
                identity,
                confidence,
                record,
            } => (identity, confidence, record),
            other => panic!("expected present, got {other:?}"),
        };
        assert_eq!(identity, id("S1"));
        assert!((confidence - 0.9).abs() < 1e-5);
        assert_eq!(record.unit_code.as_str(), "CS304");

        let original = match h.recognize([0.05, 0.0, 0.0, 0.0]).await.unwrap() {
            RecognizeOutcome::AlreadyMarked { record, .. } => record,
            other => panic!("expected already_marked, got {other:?}"),
        };
        assert_eq!(original, record);
        assert_eq!(h.service.ledger.history(&id("S1")).unwrap().len(), 1);

        let statuses: Vec<_> = h
            .audit(AuditAction::Recognize)
            .into_iter()
            .map(|e| e.status)
            .collect();
        assert_eq!(statuses, vec!["already_marked", "present"]);
    }

    #[tokio::test]
    async fn test_ambiguous_query_is_no_match() {
        let h = harness();
        h.person("S1", Role::Student);
        h.person("S2", Role::Student);
        h.enrolled("S1", [0.0; DIM]).await;
        h.enrolled("S2", [0.55, 0.0, 0.0, 0.0]).await;

        // 0.25 from S1, 0.30 from S2: gap 0.05 < margin 0.1.
        let outcome = h.recognize([0.25, 0.0, 0.0, 0.0]).await.unwrap();
        assert!(matches!(
            outcome,
            RecognizeOutcome::NoMatch {
                reason: NoMatchReason::Ambiguous { .. }
            }
        ));
        assert!(h.service.ledger.history(&id("S1")).unwrap().is_empty());
        assert_eq!(h.audit(AuditAction::Recognize)[0].status, "no_match");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_recognitions_record_once() {
        let h = harness_with(
            ScriptedExtractor::always(Ok(Embedding::new(vec![0.1, 0.0, 0.0, 0.0]))),
            Duration::from_secs(5),
        );
        h.person("S1", Role::Student);
        h.enrolled("S1", [0.0; DIM]).await;

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let service = Arc::clone(&h.service);
                tokio::spawn(async move {
                    service
                        .recognize(png(), "CS304", AttendanceContext::default(), None)
                        .await
                })
            })
            .collect();

        let mut present = 0;
        let mut already = 0;
        for task in tasks {
            match task.await.unwrap().unwrap() {
                RecognizeOutcome::Present { .. } => present += 1,
                RecognizeOutcome::AlreadyMarked { .. } => already += 1,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(present, 1);
        assert_eq!(already, 7);
        assert_eq!(h.service.ledger.history(&id("S1")).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_withdrawal_blocks_biometrics_and_keeps_records() {
        let h = harness();
        h.person("S1", Role::Student);
        h.enrolled("S1", [0.0; DIM]).await;
        h.recognize([0.0; DIM]).await.unwrap();

        let suspended = h.service.withdraw_consent(&id("S1"), &id("S1"), None).unwrap();
        assert_eq!(suspended.lifecycle, LifecycleState::Suspended);
        assert!(!suspended.consent.biometric_processing);

        let calls_before = h.calls();
        let err = h.service.enroll(&id("S1"), png(), None).await.unwrap_err();
        assert!(matches!(err, ServiceError::ConsentDenied(DenyReason::Suspended)));
        assert_eq!(h.calls(), calls_before);

        // The only template belongs to a suspended identity.
        let outcome = h.recognize([0.0; DIM]).await.unwrap();
        assert!(matches!(
            outcome,
            RecognizeOutcome::NoMatch {
                reason: NoMatchReason::EmptyGallery
            }
        ));
        assert_eq!(h.service.ledger.history(&id("S1")).unwrap().len(), 1);

        // Template retained pending erasure; attendance preserved.
        assert!(h.service.templates.get(&id("S1")).unwrap().is_some());
        assert_eq!(h.service.ledger.history(&id("S1")).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fresh_consent_reactivates_suspended_identity() {
        let h = harness();
        h.person("S1", Role::Student);
        h.service.withdraw_consent(&id("S1"), &id("S1"), None).unwrap();

        let partial = ConsentFlags {
            biometric_processing: true,
            data_storage: false,
            purpose_limitation: true,
        };
        let err = h
            .service
            .grant_consent(&id("S1"), &id("S1"), partial, None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);

        let renewed = h
            .service
            .grant_consent(&id("S1"), &id("S1"), ConsentFlags::all(), None)
            .unwrap();
        assert_eq!(renewed.lifecycle, LifecycleState::Active);
        h.enrolled("S1", [0.0; DIM]).await;

        let history = h.service.registry.consent_history(&id("S1")).unwrap();
        let kinds: Vec<_> = history.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ConsentEventKind::Grant,
                ConsentEventKind::Withdraw,
                ConsentEventKind::Grant
            ]
        );
    }

    #[tokio::test]
    async fn test_matched_instructor_is_not_marked() {
        let h = harness();
        h.person("L1", Role::Instructor);
        h.enrolled("L1", [0.0; DIM]).await;

        let err = h.recognize([0.0; DIM]).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::ConsentDenied(DenyReason::RoleNotPermitted)
        ));
        assert!(h.service.ledger.history(&id("L1")).unwrap().is_empty());
        let entry = &h.audit(AuditAction::Recognize)[0];
        assert_eq!(entry.outcome, AuditOutcome::Denied);
        assert_eq!(entry.subject, Some(id("L1")));
    }

    #[tokio::test]
    async fn test_audit_outage_fails_closed() {
        let h = harness();
        h.person("S1", Role::Student);

        let conn = rusqlite::Connection::open(&h.db_path).unwrap();
        conn.execute_batch("DROP TABLE audit_log").unwrap();

        h.next(Ok(Embedding::new(vec![0.3; DIM])));
        let err = h.service.enroll(&id("S1"), png(), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageUnavailable);
        assert!(h.service.templates.get(&id("S1")).unwrap().is_none());

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM face_templates", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn test_extractor_timeout_is_not_a_precondition() {
        let mut slow = ScriptedExtractor::always(Ok(Embedding::new(vec![0.0; DIM])));
        slow.delay = Duration::from_millis(300);
        let h = harness_with(slow, Duration::from_millis(30));
        h.person("S1", Role::Student);

        let err = h.service.enroll(&id("S1"), png(), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExtractorUnavailable);
        assert_eq!(h.audit(AuditAction::Enroll)[0].status, "extractor_timeout");
        assert!(h.service.templates.get(&id("S1")).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_face_reported_even_with_empty_gallery() {
        let h = harness();
        h.next(Err(ExtractError::NoFaceDetected));

        let err = h
            .service
            .recognize(png(), "CS304", AttendanceContext::default(), Some("kiosk-1"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Precondition(PreconditionFailure::NoFaceDetected)
        ));
        assert_eq!(h.calls(), 1);
        assert_eq!(h.audit(AuditAction::Recognize)[0].status, "no_face_detected");
    }

    #[tokio::test]
    async fn test_empty_gallery_reported_after_extraction() {
        let h = harness();
        let outcome = h.recognize([0.0; DIM]).await.unwrap();
        assert!(matches!(
            outcome,
            RecognizeOutcome::NoMatch {
                reason: NoMatchReason::EmptyGallery
            }
        ));
        assert_eq!(h.calls(), 1);
    }

    #[tokio::test]
    async fn test_non_finite_query_rejected() {
        let h = harness();
        h.person("S1", Role::Student);
        h.enrolled("S1", [0.0; DIM]).await;

        let err = h
            .recognize([f32::INFINITY, 0.0, 0.0, 0.0])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert_eq!(err.status(), "non_finite_embedding");
        assert!(h.service.ledger.history(&id("S1")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_finite_enrollment_rejected() {
        let h = harness();
        h.person("S1", Role::Student);
        h.next(Ok(Embedding::new(vec![0.0, f32::NAN, 0.0, 0.0])));

        let err = h.service.enroll(&id("S1"), png(), None).await.unwrap_err();
        assert_eq!(err.status(), "non_finite_embedding");
        assert!(h.service.templates.get(&id("S1")).unwrap().is_none());
    }

    /// A sharp 32x32 photo with half its pixels in the skin band.
    fn live_png() -> Vec<u8> {
        use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
        let img = RgbImage::from_fn(32, 32, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([200, 140, 110])
            } else {
                Rgb([0, 0, 0])
            }
        });
        let mut out = std::io::Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[tokio::test]
    async fn test_spoofed_photo_rejected_before_extraction() {
        let h = harness_with_liveness(
            ScriptedExtractor::always(Ok(Embedding::new(vec![0.0; DIM]))),
            Duration::from_secs(5),
            LivenessPolicy::default(),
        );
        h.person("S1", Role::Student);

        let err = h.service.enroll(&id("S1"), png(), None).await.unwrap_err();
        assert_eq!(err.status(), "liveness_failed");
        assert_eq!(h.calls(), 0);
        let rejected = &h.audit(AuditAction::Enroll)[0];
        assert_eq!(rejected.outcome, AuditOutcome::Failure);
        assert_eq!(rejected.liveness, Some(0.0));

        h.service.enroll(&id("S1"), live_png(), None).await.unwrap();
        assert_eq!(h.audit(AuditAction::Enroll)[0].liveness, Some(1.0));

        let err = h
            .service
            .recognize(png(), "CS304", AttendanceContext::default(), None)
            .await
            .unwrap_err();
        assert_eq!(err.status(), "liveness_failed");
        assert_eq!(h.calls(), 1);

        let outcome = h
            .service
            .recognize(live_png(), "CS304", AttendanceContext::default(), None)
            .await
            .unwrap();
        assert!(matches!(outcome, RecognizeOutcome::Present { .. }));
        assert_eq!(h.audit(AuditAction::Recognize)[0].liveness, Some(1.0));
    }

    #[tokio::test]
    async fn test_wrong_dimension_from_extractor_rejected() {
        let h = harness();
        h.person("S1", Role::Student);
        h.next(Ok(Embedding::new(vec![0.0; DIM + 2])));
        let err = h.service.enroll(&id("S1"), png(), None).await.unwrap_err();
        assert_eq!(err.status(), "invalid_template");
    }

    #[tokio::test]
    async fn test_erasure_removes_template_and_flags_reports() {
        let h = harness();
        h.person("S1", Role::Student);
        h.person("S2", Role::Student);
        h.person("L1", Role::Instructor);
        h.enrolled("S1", [0.0; DIM]).await;
        h.recognize([0.0; DIM]).await.unwrap();

        let err = h
            .service
            .data_request(&id("S2"), &id("S1"), DataRequestKind::Erasure, None)
            .unwrap_err();
        assert!(matches!(err, ServiceError::ConsentDenied(DenyReason::NotSubject)));

        let outcome = h
            .service
            .data_request(&id("S1"), &id("S1"), DataRequestKind::Erasure, None)
            .unwrap();
        assert!(matches!(
            outcome,
            DataRequestOutcome::Erasure {
                template_deleted: true
            }
        ));
        assert!(h.service.templates.get(&id("S1")).unwrap().is_none());
        assert_eq!(
            h.service.registry.get(&id("S1")).unwrap().unwrap().lifecycle,
            LifecycleState::Erased
        );

        let report = h
            .service
            .attendance_report(&id("L1"), &AttendanceQuery::default(), None)
            .unwrap();
        assert_eq!(report.records.items.len(), 1);
        assert!(report.records.items[0].subject_erased);

        let statuses: Vec<_> = h
            .audit(AuditAction::ErasureRequest)
            .into_iter()
            .map(|e| (e.outcome, e.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                (AuditOutcome::Success, "erased".to_string()),
                (AuditOutcome::Denied, "not_subject".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_access_export_omits_vector() {
        let h = harness();
        h.person("S1", Role::Student);
        h.person("A1", Role::Admin);
        h.enrolled("S1", [0.0; DIM]).await;
        h.recognize([0.0; DIM]).await.unwrap();

        let outcome = h
            .service
            .data_request(&id("A1"), &id("S1"), DataRequestKind::Access, None)
            .unwrap();
        let DataRequestOutcome::Access { export } = &outcome else {
            panic!("expected access export");
        };
        assert!(export.template.enrolled);
        assert_eq!(export.attendance.len(), 1);
        assert_eq!(export.consent_history.len(), 1);

        let json = serde_json::to_value(&outcome).unwrap();
        assert!(json["export"]["template"].get("values").is_none());
        assert!(json["export"]["template"].get("embedding").is_none());
    }

    #[tokio::test]
    async fn test_restriction_suspends() {
        let h = harness();
        h.person("S1", Role::Student);
        h.person("A1", Role::Admin);
        let outcome = h
            .service
            .data_request(&id("A1"), &id("S1"), DataRequestKind::Restriction, None)
            .unwrap();
        assert!(matches!(
            outcome,
            DataRequestOutcome::Restriction {
                lifecycle: LifecycleState::Suspended
            }
        ));
    }

    #[tokio::test]
    async fn test_reports_need_instructor_or_admin() {
        let h = harness();
        h.person("S1", Role::Student);
        h.person("L1", Role::Instructor);

        let err = h
            .service
            .attendance_report(&id("S1"), &AttendanceQuery::default(), None)
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::ConsentDenied(DenyReason::RoleNotPermitted)
        ));
        h.service
            .attendance_report(&id("L1"), &AttendanceQuery::default(), None)
            .unwrap();

        let outcomes: Vec<_> = h
            .audit(AuditAction::ReportAccess)
            .into_iter()
            .map(|e| e.outcome)
            .collect();
        assert_eq!(outcomes, vec![AuditOutcome::Success, AuditOutcome::Denied]);
    }

    #[tokio::test]
    async fn test_purge_is_admin_only_and_audited() {
        let h = harness();
        h.person("A1", Role::Admin);
        h.person("L1", Role::Instructor);

        let err = h
            .service
            .purge_audit(&id("L1"), Utc::now(), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConsentDenied);

        let err = h
            .service
            .purge_audit(&id("A1"), Utc::now() + chrono::Duration::days(1), None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);

        let cutoff = Utc::now() - chrono::Duration::days(365);
        assert_eq!(h.service.purge_audit(&id("A1"), cutoff, None).unwrap(), 0);
        assert_eq!(h.audit(AuditAction::AuditPurge)[0].outcome, AuditOutcome::Success);

        let chain = h.service.verify_audit(&id("A1"), None).unwrap();
        assert!(chain.intact);
    }

    #[tokio::test]
    async fn test_status_counts() {
        let h = harness();
        h.person("S1", Role::Student);
        h.enrolled("S1", [0.0; DIM]).await;
        let status = h.service.status().unwrap();
        assert_eq!(status.identities, 1);
        assert_eq!(status.templates, 1);
        assert_eq!(status.embedding_dim, DIM);
        assert_eq!(status.policy, MatchPolicy::default());
    }
}
