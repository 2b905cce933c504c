use crate::service::{AttendanceService, DataRequestKind, ErrorKind, ServiceError};
use chrono::{DateTime, Utc};
use rollcall_core::{AttendanceContext, ConsentFlags, Identity, IdentityId, Role};
use rollcall_store::{AttendanceQuery, AuditQuery};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use zbus::interface;
use zbus::message::Header;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// Structured arguments and all results are JSON strings. The caller's
/// unique bus name is recorded as the audit origin. Calls that only touch
/// the database run on the blocking pool.
pub struct AttendanceInterface {
    service: Arc<AttendanceService>,
}

impl AttendanceInterface {
    pub fn new(service: Arc<AttendanceService>) -> Self {
        Self { service }
    }
}

/// Registration payload accepted by `Register`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegisterRequest {
    id: IdentityId,
    role: Role,
    display_name: String,
    #[serde(default)]
    consent: ConsentFlags,
    year_of_study: Option<String>,
    course_program: Option<String>,
}

#[derive(Serialize)]
struct Purged {
    purged: usize,
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceInterface {
    /// Register a new identity from a JSON `RegisterRequest`.
    async fn register(
        &self,
        request: &str,
        #[zbus(header)] header: Header<'_>,
    ) -> zbus::fdo::Result<String> {
        let req: RegisterRequest = parse(request)?;
        tracing::info!(identity = %req.id, role = req.role.as_str(), "register requested");
        let identity = Identity::new(req.id, req.role, req.display_name)
            .with_consent(req.consent)
            .with_grouping(req.year_of_study, req.course_program);
        let (service, origin) = (Arc::clone(&self.service), origin(&header));
        blocking(move || service.register(identity, origin.as_deref())).await
    }

    /// Enroll (or replace) the subject's face template from one photo.
    async fn enroll(
        &self,
        subject: &str,
        photo: Vec<u8>,
        #[zbus(header)] header: Header<'_>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(subject, bytes = photo.len(), "enroll requested");
        let subject = IdentityId::new(subject);
        respond(
            self.service
                .enroll(&subject, photo, origin(&header).as_deref())
                .await,
        )
    }

    /// Identify the face in `photo` and mark attendance for `unit_code`.
    /// `context` is an optional JSON grouping object (empty string for none).
    async fn recognize(
        &self,
        photo: Vec<u8>,
        unit_code: &str,
        context: &str,
        #[zbus(header)] header: Header<'_>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(unit_code, bytes = photo.len(), "recognize requested");
        let context: AttendanceContext = parse_or_default(context)?;
        respond(
            self.service
                .recognize(photo, unit_code, context, origin(&header).as_deref())
                .await,
        )
    }

    async fn grant_consent(
        &self,
        actor: &str,
        subject: &str,
        flags: &str,
        #[zbus(header)] header: Header<'_>,
    ) -> zbus::fdo::Result<String> {
        let flags: ConsentFlags = parse(flags)?;
        let (actor, subject) = (IdentityId::new(actor), IdentityId::new(subject));
        let (service, origin) = (Arc::clone(&self.service), origin(&header));
        blocking(move || service.grant_consent(&actor, &subject, flags, origin.as_deref())).await
    }

    async fn withdraw_consent(
        &self,
        actor: &str,
        subject: &str,
        #[zbus(header)] header: Header<'_>,
    ) -> zbus::fdo::Result<String> {
        let (actor, subject) = (IdentityId::new(actor), IdentityId::new(subject));
        let (service, origin) = (Arc::clone(&self.service), origin(&header));
        blocking(move || service.withdraw_consent(&actor, &subject, origin.as_deref())).await
    }

    /// `kind` is one of `access`, `restriction`, `erasure`.
    async fn data_request(
        &self,
        actor: &str,
        subject: &str,
        kind: &str,
        #[zbus(header)] header: Header<'_>,
    ) -> zbus::fdo::Result<String> {
        let kind: DataRequestKind = kind.parse().map_err(zbus::fdo::Error::InvalidArgs)?;
        tracing::info!(actor, subject, ?kind, "data request");
        let (actor, subject) = (IdentityId::new(actor), IdentityId::new(subject));
        let (service, origin) = (Arc::clone(&self.service), origin(&header));
        blocking(move || service.data_request(&actor, &subject, kind, origin.as_deref())).await
    }

    async fn attendance_report(
        &self,
        actor: &str,
        query: &str,
        #[zbus(header)] header: Header<'_>,
    ) -> zbus::fdo::Result<String> {
        let query: AttendanceQuery = parse_or_default(query)?;
        let actor = IdentityId::new(actor);
        let (service, origin) = (Arc::clone(&self.service), origin(&header));
        blocking(move || service.attendance_report(&actor, &query, origin.as_deref())).await
    }

    async fn attendance_history(
        &self,
        actor: &str,
        subject: &str,
        #[zbus(header)] header: Header<'_>,
    ) -> zbus::fdo::Result<String> {
        let (actor, subject) = (IdentityId::new(actor), IdentityId::new(subject));
        let (service, origin) = (Arc::clone(&self.service), origin(&header));
        blocking(move || service.attendance_history(&actor, &subject, origin.as_deref())).await
    }

    async fn audit_log(
        &self,
        actor: &str,
        query: &str,
        #[zbus(header)] header: Header<'_>,
    ) -> zbus::fdo::Result<String> {
        let query: AuditQuery = parse_or_default(query)?;
        let actor = IdentityId::new(actor);
        let (service, origin) = (Arc::clone(&self.service), origin(&header));
        blocking(move || service.audit_log(&actor, &query, origin.as_deref())).await
    }

    async fn verify_audit(
        &self,
        actor: &str,
        #[zbus(header)] header: Header<'_>,
    ) -> zbus::fdo::Result<String> {
        let actor = IdentityId::new(actor);
        let (service, origin) = (Arc::clone(&self.service), origin(&header));
        blocking(move || service.verify_audit(&actor, origin.as_deref())).await
    }

    /// Delete audit entries older than `before` (RFC 3339).
    async fn purge_audit(
        &self,
        actor: &str,
        before: &str,
        #[zbus(header)] header: Header<'_>,
    ) -> zbus::fdo::Result<String> {
        let before = DateTime::parse_from_rfc3339(before)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid cutoff: {e}")))?
            .with_timezone(&Utc);
        let actor = IdentityId::new(actor);
        let (service, origin) = (Arc::clone(&self.service), origin(&header));
        blocking(move || {
            service
                .purge_audit(&actor, before, origin.as_deref())
                .map(|purged| Purged { purged })
        })
        .await
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let service = Arc::clone(&self.service);
        blocking(move || service.status()).await
    }
}

fn origin(header: &Header<'_>) -> Option<String> {
    header.sender().map(|s| s.to_string())
}

fn parse<T: DeserializeOwned>(json: &str) -> zbus::fdo::Result<T> {
    serde_json::from_str(json).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

fn parse_or_default<T: DeserializeOwned + Default>(json: &str) -> zbus::fdo::Result<T> {
    if json.trim().is_empty() {
        Ok(T::default())
    } else {
        parse(json)
    }
}

/// Runs a synchronous service call on the blocking pool, off the executor
/// serving the bus.
async fn blocking<T, F>(call: F) -> zbus::fdo::Result<String>
where
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
    T: Serialize + Send + 'static,
{
    let result = tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(format!("request task failed: {e}")))?;
    respond(result)
}

fn respond<T: Serialize>(result: Result<T, ServiceError>) -> zbus::fdo::Result<String> {
    let value = result.map_err(to_fdo)?;
    serde_json::to_string(&value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

/// Maps service errors onto standard D-Bus errors. The message starts with
/// the error kind so clients can branch without parsing prose.
fn to_fdo(err: ServiceError) -> zbus::fdo::Error {
    let message = format!("{}: {err}", err.kind().as_str());
    match err.kind() {
        ErrorKind::Precondition | ErrorKind::InvalidRequest => {
            zbus::fdo::Error::InvalidArgs(message)
        }
        ErrorKind::ConsentDenied => zbus::fdo::Error::AccessDenied(message),
        ErrorKind::ExtractorUnavailable | ErrorKind::StorageUnavailable => {
            zbus::fdo::Error::Failed(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{DenyReason, PreconditionFailure};

    #[test]
    fn test_error_mapping() {
        let err = to_fdo(ServiceError::Precondition(PreconditionFailure::NoFaceDetected));
        assert!(matches!(
            err,
            zbus::fdo::Error::InvalidArgs(m) if m.starts_with("precondition:")
        ));

        let err = to_fdo(ServiceError::ConsentDenied(DenyReason::Suspended));
        assert!(matches!(
            err,
            zbus::fdo::Error::AccessDenied(m) if m == "consent_denied: consent denied: suspended"
        ));

        let err = to_fdo(ServiceError::Storage(rollcall_store::StoreError::Poisoned));
        assert!(matches!(
            err,
            zbus::fdo::Error::Failed(m) if m.starts_with("storage_unavailable:")
        ));
    }

    #[test]
    fn test_register_request_parsing() {
        let req: RegisterRequest = parse(
            r#"{"id":"S1","role":"student","display_name":"Amina",
                "consent":{"biometric_processing":true,"data_storage":true,
                           "purpose_limitation":true},
                "year_of_study":"3"}"#,
        )
        .unwrap();
        assert_eq!(req.id, IdentityId::new("S1"));
        assert!(req.consent.permits_biometrics());
        assert_eq!(req.course_program, None);

        let unknown_role = r#"{"id":"S1","role":"dean","display_name":"x"}"#;
        assert!(parse::<RegisterRequest>(unknown_role).is_err());
    }

    #[test]
    fn test_empty_query_is_default() {
        let q: AttendanceQuery = parse_or_default("  ").unwrap();
        assert!(q.unit_code.is_none());
        let q: AuditQuery = parse_or_default(r#"{"action":"enroll","page":2}"#).unwrap();
        assert_eq!(q.page, 2);
        assert!(parse_or_default::<AuditQuery>("{not json").is_err());
    }

    #[tokio::test]
    async fn test_blocking_call_maps_errors() {
        let reply = blocking(|| Ok::<_, ServiceError>(Purged { purged: 3 }))
            .await
            .unwrap();
        assert_eq!(reply, r#"{"purged":3}"#);

        let err = blocking(|| {
            Err::<Purged, _>(ServiceError::InvalidRequest("cutoff in the future".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            zbus::fdo::Error::InvalidArgs(m) if m.starts_with("invalid_request:")
        ));
    }
}
