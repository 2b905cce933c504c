//! Rollcall storage layer.
//!
//! One `SQLite` database backs four stores that share a [`Database`]
//! handle: identities, face templates, the attendance ledger and the audit
//! trail. Writes that must be atomic with their audit entry take a
//! `Transaction` closure.

pub mod audit;
pub mod cipher;
pub mod db;
pub mod error;
pub mod identities;
pub mod ledger;
pub mod templates;

pub use audit::{AuditQuery, AuditTrail};
pub use cipher::TemplateCipher;
pub use db::Database;
pub use error::StoreError;
pub use identities::{ConsentEvent, ConsentEventKind, IdentityRegistry};
pub use ledger::{
    AttendanceLedger, AttendanceQuery, AttendanceReport, LedgerOutcome, NewAttendance,
    ReportRow, ReportSummary,
};
pub use rusqlite::Transaction;
pub use templates::TemplateStore;
