//! Attendance ledger: at most one record per (identity, unit code, day).
//!
//! The day is the calendar date of the recognition in the fixed reporting
//! offset. Uniqueness is enforced by the `UNIQUE` constraint at insert
//! time (`ON CONFLICT DO NOTHING`), never by a separate read.

use crate::db::{from_millis, parse_day, to_millis, Database, DAY_FORMAT};
use crate::error::StoreError;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rollcall_core::{
    AttendanceContext, AttendanceRecord, IdentityId, LifecycleState, Page, RecordStatus, UnitCode,
};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_PER_PAGE: u32 = 50;
pub const MAX_PER_PAGE: u32 = 100;

/// A recognition outcome to be recorded.
#[derive(Debug, Clone)]
pub struct NewAttendance {
    pub identity: IdentityId,
    pub unit_code: UnitCode,
    pub at: DateTime<Utc>,
    pub confidence: f32,
    pub context: AttendanceContext,
    pub origin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "record", rename_all = "snake_case")]
pub enum LedgerOutcome {
    Recorded(AttendanceRecord),
    /// The key already existed; carries the original record unchanged.
    AlreadyMarked(AttendanceRecord),
}

impl LedgerOutcome {
    pub fn record(&self) -> &AttendanceRecord {
        match self {
            LedgerOutcome::Recorded(r) | LedgerOutcome::AlreadyMarked(r) => r,
        }
    }
}

/// Read-side filter. `None` fields match everything; day bounds are inclusive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttendanceQuery {
    pub unit_code: Option<String>,
    pub identity: Option<IdentityId>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub year_of_study: Option<String>,
    pub course_program: Option<String>,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub per_page: u32,
}

impl AttendanceQuery {
    /// Page number clamped to ≥ 1 and page size to 1..=100 (default 50).
    fn paging(&self) -> (u32, u32) {
        let page = self.page.max(1);
        let per_page = match self.per_page {
            0 => DEFAULT_PER_PAGE,
            n => n.min(MAX_PER_PAGE),
        };
        (page, per_page)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRow {
    #[serde(flatten)]
    pub record: AttendanceRecord,
    /// The identity has since been erased; the record is kept for retention.
    pub subject_erased: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total_records: u64,
    pub unique_identities: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceReport {
    pub summary: ReportSummary,
    pub records: Page<ReportRow>,
}

const FILTER_SQL: &str = "(?1 IS NULL OR a.unit_code = ?1)
    AND (?2 IS NULL OR a.identity_id = ?2)
    AND (?3 IS NULL OR a.day >= ?3)
    AND (?4 IS NULL OR a.day <= ?4)
    AND (?5 IS NULL OR a.year_of_study = ?5)
    AND (?6 IS NULL OR a.course_program = ?6)";

const RECORD_COLUMNS: &str = "a.id, a.identity_id, a.unit_code, a.day, a.recorded_at, \
     a.confidence, a.year_of_study, a.course_program, a.origin";

pub struct AttendanceLedger {
    db: Database,
    offset: FixedOffset,
}

impl AttendanceLedger {
    /// `offset` is the fixed reporting time zone used to derive the day.
    pub fn new(db: Database, offset: FixedOffset) -> Self {
        Self { db, offset }
    }

    pub fn day_of(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    pub fn record(&self, new: &NewAttendance) -> Result<LedgerOutcome, StoreError> {
        self.db.transaction(|tx| self.record_in(tx, new))
    }

    /// Inserts unless the dedup key exists. Safe under concurrent callers:
    /// exactly one insert for a key wins; every other call gets the winner.
    pub fn record_in(
        &self,
        tx: &Transaction<'_>,
        new: &NewAttendance,
    ) -> Result<LedgerOutcome, StoreError> {
        let day = self.day_of(new.at);
        let day_text = day.format(DAY_FORMAT).to_string();
        let year_of_study = new.context.year_of_study.clone();
        let course_program = new.context.course_program.clone();
        let id = Uuid::new_v4();

        let inserted = tx.execute(
            "INSERT INTO attendance
                (id, identity_id, unit_code, day, recorded_at, confidence,
                 year_of_study, course_program, origin)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(identity_id, unit_code, day) DO NOTHING",
            params![
                id.to_string(),
                new.identity.as_str(),
                new.unit_code.as_str(),
                day_text,
                to_millis(new.at),
                f64::from(new.confidence),
                year_of_study,
                course_program,
                new.origin,
            ],
        )?;

        if inserted == 1 {
            return Ok(LedgerOutcome::Recorded(AttendanceRecord {
                id,
                identity: new.identity.clone(),
                unit_code: new.unit_code.clone(),
                day,
                recorded_at: DateTime::<Utc>::from_timestamp_millis(to_millis(new.at))
                    .unwrap_or(new.at),
                confidence: new.confidence,
                status: RecordStatus::Present,
                year_of_study,
                course_program,
                origin: new.origin.clone(),
            }));
        }

        let existing = tx
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM attendance a
                     WHERE a.identity_id = ?1 AND a.unit_code = ?2 AND a.day = ?3"
                ),
                params![new.identity.as_str(), new.unit_code.as_str(), day_text],
                record_from_row,
            )
            .optional()?
            .ok_or_else(|| StoreError::Corrupt("dedup conflict without existing row".into()))?;

        Ok(LedgerOutcome::AlreadyMarked(existing))
    }

    /// Filtered, paginated read with summary counts, newest first.
    pub fn report(&self, query: &AttendanceQuery) -> Result<AttendanceReport, StoreError> {
        let (page, per_page) = query.paging();
        let unit_code = query.unit_code.as_deref().map(|u| u.trim().to_ascii_uppercase());
        let identity = query.identity.as_ref().map(|i| i.as_str().to_string());
        let from = query.from.map(|d| d.format(DAY_FORMAT).to_string());
        let to = query.to.map(|d| d.format(DAY_FORMAT).to_string());
        let filter = params![
            unit_code,
            identity,
            from,
            to,
            query.year_of_study,
            query.course_program,
        ];

        let conn = self.db.lock()?;
        let (total, unique): (i64, i64) = conn.query_row(
            &format!(
                "SELECT COUNT(*), COUNT(DISTINCT a.identity_id)
                 FROM attendance a WHERE {FILTER_SQL}"
            ),
            filter,
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS}, i.lifecycle
             FROM attendance a LEFT JOIN identities i ON i.id = a.identity_id
             WHERE {FILTER_SQL}
             ORDER BY a.recorded_at DESC, a.id ASC
             LIMIT ?7 OFFSET ?8"
        ))?;
        let offset = i64::from(page - 1) * i64::from(per_page);
        let items = stmt
            .query_map(
                params![
                    unit_code,
                    identity,
                    from,
                    to,
                    query.year_of_study,
                    query.course_program,
                    i64::from(per_page),
                    offset,
                ],
                |row| {
                    let lifecycle: Option<String> = row.get(9)?;
                    let erased = LifecycleState::Erased.as_str();
                    Ok(ReportRow {
                        record: record_from_row(row)?,
                        subject_erased: lifecycle.as_deref() == Some(erased),
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AttendanceReport {
            summary: ReportSummary {
                total_records: total.max(0) as u64,
                unique_identities: unique.max(0) as u64,
            },
            records: Page {
                items,
                page,
                per_page,
                total: total.max(0) as u64,
            },
        })
    }

    /// Every record for one identity, newest first.
    pub fn history(&self, identity: &IdentityId) -> Result<Vec<AttendanceRecord>, StoreError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM attendance a
             WHERE a.identity_id = ?1
             ORDER BY a.recorded_at DESC"
        ))?;
        let records = stmt
            .query_map(params![identity.as_str()], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let id: String = row.get(0)?;
    let unit_code: String = row.get(2)?;
    let day: String = row.get(3)?;
    Ok(AttendanceRecord {
        id: Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        identity: IdentityId::new(row.get::<_, String>(1)?),
        unit_code: UnitCode::parse(&unit_code).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?,
        day: parse_day(3, &day)?,
        recorded_at: from_millis(4, row.get(4)?)?,
        confidence: row.get::<_, f64>(5)? as f32,
        status: RecordStatus::Present,
        year_of_study: row.get(6)?,
        course_program: row.get(7)?,
        origin: row.get(8)?,
    })
}
