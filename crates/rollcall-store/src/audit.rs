//! Append-only audit trail with a SHA-256 hash chain.
//!
//! Each row stores `entry_hash = SHA-256(prev_hash || canonical(entry))`.
//! Rows are never updated (a trigger rejects it). Purging deletes a prefix
//! of the chain; verification starts from the oldest surviving row.

use crate::db::{from_millis, parse_text, to_millis, Database};
use crate::error::StoreError;
use crate::ledger::{DEFAULT_PER_PAGE, MAX_PER_PAGE};
use chrono::{DateTime, Utc};
use rollcall_core::{AuditAction, AuditEntry, IdentityId, Page};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditQuery {
    pub actor: Option<IdentityId>,
    pub subject: Option<IdentityId>,
    pub action: Option<AuditAction>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub page: u32,
    #[serde(default)]
    pub per_page: u32,
}

/// Fields covered by the chain hash, in a fixed order.
#[derive(Serialize)]
struct Canonical<'a> {
    id: &'a str,
    at: i64,
    actor: Option<&'a str>,
    action: &'a str,
    subject: Option<&'a str>,
    outcome: &'a str,
    status: &'a str,
    origin: Option<&'a str>,
    confidence: Option<f64>,
    liveness: Option<f64>,
    detail: Option<&'a str>,
}

impl<'a> Canonical<'a> {
    fn of(entry: &'a AuditEntry, id: &'a str) -> Self {
        Self {
            id,
            at: to_millis(entry.at),
            actor: entry.actor.as_ref().map(IdentityId::as_str),
            action: entry.action.as_str(),
            subject: entry.subject.as_ref().map(IdentityId::as_str),
            outcome: entry.outcome.as_str(),
            status: &entry.status,
            origin: entry.origin.as_deref(),
            confidence: entry.confidence.map(f64::from),
            liveness: entry.liveness.map(f64::from),
            detail: entry.detail.as_deref(),
        }
    }
}

fn chain_hash(prev: Option<&[u8]>, entry: &AuditEntry) -> Result<Vec<u8>, StoreError> {
    let id = entry.id.to_string();
    let body = serde_json::to_vec(&Canonical::of(entry, &id))
        .map_err(|e| StoreError::Corrupt(format!("audit entry encoding: {e}")))?;
    let mut hasher = Sha256::new();
    if let Some(prev) = prev {
        hasher.update(prev);
    }
    hasher.update(&body);
    Ok(hasher.finalize().to_vec())
}

const ENTRY_COLUMNS: &str =
    "seq, id, at, actor, action, subject, outcome, status, origin, confidence, liveness, detail";

pub struct AuditTrail {
    db: Database,
}

impl AuditTrail {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn append(&self, entry: &AuditEntry) -> Result<i64, StoreError> {
        self.db.transaction(|tx| Self::append_in(tx, entry))
    }

    /// Appends inside the caller's transaction and returns the assigned
    /// sequence number. If the caller rolls back, the entry goes with it.
    ///
    /// The entry is stamped here, under the connection lock, so `at` never
    /// decreases along `seq`. Whatever `entry.at` the caller set is ignored.
    pub fn append_in(tx: &Transaction<'_>, entry: &AuditEntry) -> Result<i64, StoreError> {
        Self::append_stamped_in(tx, entry, Utc::now())
    }

    fn append_stamped_in(
        tx: &Transaction<'_>,
        entry: &AuditEntry,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let last: Option<(Vec<u8>, i64)> = tx
            .query_row(
                "SELECT entry_hash, at FROM audit_log ORDER BY seq DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (prev, last_at) = last.unzip();

        let mut entry = entry.clone();
        let at = to_millis(now).max(last_at.unwrap_or(i64::MIN));
        entry.at = from_millis(2, at)?;
        let hash = chain_hash(prev.as_deref(), &entry)?;

        tx.execute(
            "INSERT INTO audit_log
                (id, at, actor, action, subject, outcome, status, origin, confidence, liveness,
                 detail, prev_hash, entry_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                entry.id.to_string(),
                to_millis(entry.at),
                entry.actor.as_ref().map(IdentityId::as_str),
                entry.action.as_str(),
                entry.subject.as_ref().map(IdentityId::as_str),
                entry.outcome.as_str(),
                entry.status,
                entry.origin,
                entry.confidence.map(f64::from),
                entry.liveness.map(f64::from),
                entry.detail,
                prev,
                hash,
            ],
        )?;
        let seq = tx.last_insert_rowid();

        tracing::debug!(
            seq,
            action = entry.action.as_str(),
            outcome = entry.outcome.as_str(),
            status = %entry.status,
            "audit entry appended"
        );
        Ok(seq)
    }

    /// Filtered, paginated read, newest first.
    pub fn query(&self, query: &AuditQuery) -> Result<Page<AuditEntry>, StoreError> {
        let page = query.page.max(1);
        let per_page = match query.per_page {
            0 => DEFAULT_PER_PAGE,
            n => n.min(MAX_PER_PAGE),
        };
        let actor = query.actor.as_ref().map(|a| a.as_str().to_string());
        let subject = query.subject.as_ref().map(|s| s.as_str().to_string());
        let action = query.action.map(AuditAction::as_str);
        let since = query.since.map(to_millis);
        let until = query.until.map(to_millis);

        let filter = "(?1 IS NULL OR actor = ?1)
            AND (?2 IS NULL OR subject = ?2)
            AND (?3 IS NULL OR action = ?3)
            AND (?4 IS NULL OR at >= ?4)
            AND (?5 IS NULL OR at <= ?5)";

        let conn = self.db.lock()?;
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM audit_log WHERE {filter}"),
            params![actor, subject, action, since, until],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM audit_log WHERE {filter}
             ORDER BY seq DESC LIMIT ?6 OFFSET ?7"
        ))?;
        let offset = i64::from(page - 1) * i64::from(per_page);
        let items = stmt
            .query_map(
                params![actor, subject, action, since, until, i64::from(per_page), offset],
                entry_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            items,
            page,
            per_page,
            total: total.max(0) as u64,
        })
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let n: i64 = self
            .db
            .lock()?
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }

    /// Walks the chain in sequence order. Returns the number of entries
    /// checked, or `ChainBroken` at the first row that fails.
    pub fn verify_chain(&self) -> Result<u64, StoreError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS}, prev_hash, entry_hash FROM audit_log ORDER BY seq ASC"
        ))?;
        let mut rows = stmt.query([])?;

        let mut expected_prev: Option<Vec<u8>> = None;
        let mut first = true;
        let mut checked = 0u64;
        while let Some(row) = rows.next()? {
            let entry = entry_from_row(row)?;
            let seq = entry.seq.unwrap_or_default();
            let prev: Option<Vec<u8>> = row.get(12)?;
            let stored: Vec<u8> = row.get(13)?;

            // The oldest surviving row may point at a purged predecessor.
            if !first && prev != expected_prev {
                return Err(StoreError::ChainBroken { seq });
            }
            if chain_hash(prev.as_deref(), &entry)? != stored {
                return Err(StoreError::ChainBroken { seq });
            }

            expected_prev = Some(stored);
            first = false;
            checked += 1;
        }
        Ok(checked)
    }

    /// Deletes entries recorded strictly before `cutoff`.
    ///
    /// Always removes a prefix of the chain: everything up to the newest
    /// row older than the cutoff, so a surviving row never loses its
    /// predecessor to a purge.
    pub fn purge_before_in(
        tx: &Transaction<'_>,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let n = tx.execute(
            "DELETE FROM audit_log
             WHERE seq <= (SELECT MAX(seq) FROM audit_log WHERE at < ?1)",
            params![to_millis(cutoff)],
        )?;
        Ok(n)
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    let id: String = row.get(1)?;
    let action: String = row.get(4)?;
    let outcome: String = row.get(6)?;
    Ok(AuditEntry {
        seq: Some(row.get(0)?),
        id: Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?,
        at: from_millis(2, row.get(2)?)?,
        actor: row.get::<_, Option<String>>(3)?.map(IdentityId::new),
        action: parse_text(4, &action)?,
        subject: row.get::<_, Option<String>>(5)?.map(IdentityId::new),
        outcome: parse_text(6, &outcome)?,
        status: row.get(7)?,
        origin: row.get(8)?,
        confidence: row.get::<_, Option<f64>>(9)?.map(|c| c as f32),
        liveness: row.get::<_, Option<f64>>(10)?.map(|l| l as f32),
        detail: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rollcall_core::AuditOutcome;

    fn entry(action: AuditAction, subject: &str) -> AuditEntry {
        AuditEntry::new(action, AuditOutcome::Success, "ok")
            .subject(Some(IdentityId::from(subject)))
            .origin(Some("127.0.0.1".into()))
    }

    #[test]
    fn test_append_and_verify() {
        let db = Database::in_memory().unwrap();
        let trail = AuditTrail::new(db);
        let a = trail.append(&entry(AuditAction::Enroll, "S1")).unwrap();
        let b = trail
            .append(
                &entry(AuditAction::Recognize, "S1")
                    .confidence(0.82)
                    .liveness(Some(1.0)),
            )
            .unwrap();
        assert!(b > a);
        assert_eq!(trail.verify_chain().unwrap(), 2);
        assert_eq!(trail.count().unwrap(), 2);

        let newest = &trail.query(&AuditQuery::default()).unwrap().items[0];
        assert_eq!(newest.liveness, Some(1.0));
        assert_eq!(newest.confidence, Some(0.82));
    }

    #[test]
    fn test_rows_cannot_be_updated() {
        let db = Database::in_memory().unwrap();
        let trail = AuditTrail::new(db.clone());
        trail.append(&entry(AuditAction::Enroll, "S1")).unwrap();
        assert!(db.execute_raw("UPDATE audit_log SET status = 'forged'").is_err());
    }

    #[test]
    fn test_deleted_middle_row_breaks_chain() {
        let db = Database::in_memory().unwrap();
        let trail = AuditTrail::new(db.clone());
        for _ in 0..3 {
            trail.append(&entry(AuditAction::Enroll, "S1")).unwrap();
        }
        db.execute_raw("DELETE FROM audit_log WHERE seq = 2").unwrap();
        assert!(matches!(
            trail.verify_chain(),
            Err(StoreError::ChainBroken { seq: 3 })
        ));
    }

    fn append_at(db: &Database, e: &AuditEntry, at: DateTime<Utc>) -> i64 {
        db.transaction(|tx| AuditTrail::append_stamped_in(tx, e, at))
            .unwrap()
    }

    #[test]
    fn test_purge_keeps_chain_verifiable() {
        let db = Database::in_memory().unwrap();
        let trail = AuditTrail::new(db.clone());
        append_at(&db, &entry(AuditAction::Enroll, "S1"), Utc::now() - Duration::days(400));
        trail.append(&entry(AuditAction::Recognize, "S1")).unwrap();

        let purged = db
            .transaction(|tx| AuditTrail::purge_before_in(tx, Utc::now() - Duration::days(365)))
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(trail.verify_chain().unwrap(), 1);
    }

    #[test]
    fn test_caller_timestamp_is_ignored() {
        let db = Database::in_memory().unwrap();
        let trail = AuditTrail::new(db);
        let before = Utc::now() - Duration::milliseconds(1);
        let mut e = entry(AuditAction::Enroll, "S1");
        e.at = Utc::now() - Duration::days(30);
        trail.append(&e).unwrap();

        let page = trail.query(&AuditQuery::default()).unwrap();
        assert!(page.items[0].at >= before);
    }

    #[test]
    fn test_timestamps_never_decrease_along_the_chain() {
        let db = Database::in_memory().unwrap();
        let trail = AuditTrail::new(db.clone());
        let now = Utc::now();
        for offset in [0, 10, 20, 0] {
            append_at(&db, &entry(AuditAction::Enroll, "S1"), now - Duration::seconds(offset));
        }

        let mut page = trail.query(&AuditQuery::default()).unwrap();
        page.items.reverse();
        assert!(page.items.windows(2).all(|w| w[0].at <= w[1].at));

        // Entries that arrived late are stamped with the newest time seen,
        // so a cutoff between the raw times purges nothing mid-chain.
        let purged = db
            .transaction(|tx| AuditTrail::purge_before_in(tx, now - Duration::seconds(15)))
            .unwrap();
        assert_eq!(purged, 0);
        assert_eq!(trail.verify_chain().unwrap(), 4);
    }

    #[test]
    fn test_purge_removes_a_prefix_only() {
        let db = Database::in_memory().unwrap();
        // Rows from an older build whose times went backwards along seq.
        for (seq, at) in [(1, 500), (2, 3_000), (3, 1_000), (4, 4_000)] {
            db.execute_raw(&format!(
                "INSERT INTO audit_log (seq, id, at, action, outcome, status, entry_hash)
                 VALUES ({seq}, 'e{seq}', {at}, 'enroll', 'success', 'ok', x'00')"
            ))
            .unwrap();
        }

        let cutoff = DateTime::<Utc>::from_timestamp_millis(2_000).unwrap();
        let purged = db
            .transaction(|tx| AuditTrail::purge_before_in(tx, cutoff))
            .unwrap();
        assert_eq!(purged, 3);
        let left: i64 = db
            .lock()
            .unwrap()
            .query_row("SELECT MIN(seq) FROM audit_log", [], |row| row.get(0))
            .unwrap();
        assert_eq!(left, 4);
    }

    #[test]
    fn test_rolled_back_entry_not_persisted() {
        let db = Database::in_memory().unwrap();
        let trail = AuditTrail::new(db.clone());
        let result: Result<(), StoreError> = db.transaction(|tx| {
            AuditTrail::append_in(tx, &entry(AuditAction::Enroll, "S1"))?;
            Err(StoreError::Corrupt("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(trail.count().unwrap(), 0);
    }

    #[test]
    fn test_query_filters_newest_first() {
        let db = Database::in_memory().unwrap();
        let trail = AuditTrail::new(db);
        trail.append(&entry(AuditAction::Enroll, "S1")).unwrap();
        trail.append(&entry(AuditAction::Recognize, "S2")).unwrap();
        trail.append(&entry(AuditAction::Recognize, "S1")).unwrap();

        let page = trail
            .query(&AuditQuery {
                subject: Some(IdentityId::from("S1")),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items[0].action, AuditAction::Recognize);
        assert_eq!(page.items[1].action, AuditAction::Enroll);

        let recognitions = trail
            .query(&AuditQuery {
                action: Some(AuditAction::Recognize),
                per_page: 1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(recognitions.total, 2);
        assert_eq!(recognitions.items.len(), 1);
        assert_eq!(recognitions.items[0].subject, Some(IdentityId::from("S1")));
    }
}
