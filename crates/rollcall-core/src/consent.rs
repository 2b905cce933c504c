//! Consent guard: decides whether an identity may perform an operation.
//!
//! Pure functions of the identity's role, consent flags and lifecycle
//! state. Callers must consult the guard before any biometric data is
//! processed and audit every denial.

use crate::lifecycle::LifecycleState;
use crate::types::{Identity, IdentityId, Role};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Store or replace one's own face template.
    Enroll,
    /// Be considered as a candidate during 1:N identification.
    Recognize,
    /// Have attendance recorded after a successful identification.
    MarkAttendance,
    ViewReports,
    ReviewAudit,
    PurgeAudit,
}

impl Operation {
    /// Operations that process biometric data and need a lawful basis.
    pub const fn is_biometric(self) -> bool {
        matches!(
            self,
            Operation::Enroll | Operation::Recognize | Operation::MarkAttendance
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    UnknownIdentity,
    BiometricConsentMissing,
    StorageConsentMissing,
    Suspended,
    Erased,
    RoleNotPermitted,
    NotSubject,
}

impl DenyReason {
    /// Stable status code recorded in the audit trail.
    pub fn code(self) -> &'static str {
        match self {
            DenyReason::UnknownIdentity => "unknown_identity",
            DenyReason::BiometricConsentMissing => "biometric_consent_missing",
            DenyReason::StorageConsentMissing => "storage_consent_missing",
            DenyReason::Suspended => "suspended",
            DenyReason::Erased => "erased",
            DenyReason::RoleNotPermitted => "role_not_permitted",
            DenyReason::NotSubject => "not_subject",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allow(self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Role capability table.
pub const fn role_permits(role: Role, op: Operation) -> bool {
    match op {
        Operation::Enroll | Operation::Recognize => true,
        Operation::MarkAttendance => matches!(role, Role::Student),
        Operation::ViewReports => matches!(role, Role::Instructor | Role::Admin),
        Operation::ReviewAudit | Operation::PurgeAudit => matches!(role, Role::Admin),
    }
}

/// Authorize `identity` for `op`. A missing identity is always denied.
pub fn authorize(identity: Option<&Identity>, op: Operation) -> Decision {
    let Some(identity) = identity else {
        return Decision::Deny(DenyReason::UnknownIdentity);
    };

    match identity.lifecycle {
        LifecycleState::Erased => return Decision::Deny(DenyReason::Erased),
        LifecycleState::WithdrawalRequested | LifecycleState::Suspended if op.is_biometric() => {
            return Decision::Deny(DenyReason::Suspended);
        }
        _ => {}
    }

    if op.is_biometric() {
        if !identity.consent.biometric_processing {
            return Decision::Deny(DenyReason::BiometricConsentMissing);
        }
        if !identity.consent.data_storage {
            return Decision::Deny(DenyReason::StorageConsentMissing);
        }
    }

    if !role_permits(identity.role, op) {
        return Decision::Deny(DenyReason::RoleNotPermitted);
    }

    Decision::Allow
}

/// Data-subject requests may be filed by the subject or by an admin.
pub fn authorize_subject_request(actor: Option<&Identity>, subject: &IdentityId) -> Decision {
    match actor {
        None => Decision::Deny(DenyReason::UnknownIdentity),
        Some(a) if a.role == Role::Admin || &a.id == subject => Decision::Allow,
        Some(_) => Decision::Deny(DenyReason::NotSubject),
    }
}
