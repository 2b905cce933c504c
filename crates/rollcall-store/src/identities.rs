//! Identity registry: an in-memory arena keyed by [`IdentityId`], written
//! through to `SQLite`.
//!
//! Templates, attendance rows and audit entries refer to identities by id
//! only. The arena write lock is held across each write transaction so the
//! arena never diverges from the committed rows.

use crate::db::{from_millis, parse_text, to_millis, Database};
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use rollcall_core::{ConsentFlags, Identity, IdentityId};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentEventKind {
    Grant,
    Withdraw,
}

impl ConsentEventKind {
    fn as_str(self) -> &'static str {
        match self {
            ConsentEventKind::Grant => "grant",
            ConsentEventKind::Withdraw => "withdraw",
        }
    }
}

impl std::str::FromStr for ConsentEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grant" => Ok(ConsentEventKind::Grant),
            "withdraw" => Ok(ConsentEventKind::Withdraw),
            other => Err(format!("unknown consent event: {other}")),
        }
    }
}

/// One explicit consent change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentEvent {
    pub identity: IdentityId,
    pub kind: ConsentEventKind,
    pub flags: ConsentFlags,
    pub policy_version: Option<String>,
    pub origin: Option<String>,
    pub at: DateTime<Utc>,
}

pub struct IdentityRegistry {
    db: Database,
    arena: RwLock<HashMap<IdentityId, Identity>>,
}

const IDENTITY_COLUMNS: &str = "id, role, display_name, biometric_processing, data_storage, \
     purpose_limitation, consent_version, consent_updated_at, lifecycle, year_of_study, \
     course_program, created_at";

impl IdentityRegistry {
    /// Loads every identity into the arena.
    pub fn load(db: Database) -> Result<Self, StoreError> {
        let arena = {
            let conn = db.lock()?;
            let mut stmt = conn.prepare(&format!("SELECT {IDENTITY_COLUMNS} FROM identities"))?;
            let rows = stmt
                .query_map([], identity_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|i| (i.id.clone(), i))
                .collect::<HashMap<_, _>>()
        };

        tracing::info!(count = arena.len(), "identity registry loaded");
        Ok(Self {
            db,
            arena: RwLock::new(arena),
        })
    }

    pub fn get(&self, id: &IdentityId) -> Result<Option<Identity>, StoreError> {
        Ok(self.arena.read()?.get(id).cloned())
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.arena.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Inserts a new identity. `also` runs inside the same transaction.
    pub fn register(
        &self,
        identity: Identity,
        also: impl FnOnce(&Transaction<'_>) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let mut arena = self.arena.write()?;
        if arena.contains_key(&identity.id) {
            return Err(StoreError::DuplicateIdentity(identity.id));
        }

        self.db.transaction(|tx| {
            tx.execute(
                &format!(
                    "INSERT INTO identities ({IDENTITY_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    identity.id.as_str(),
                    identity.role.as_str(),
                    identity.display_name,
                    identity.consent.biometric_processing,
                    identity.consent.data_storage,
                    identity.consent.purpose_limitation,
                    identity.consent_version,
                    identity.consent_updated_at.map(to_millis),
                    identity.lifecycle.as_str(),
                    identity.year_of_study,
                    identity.course_program,
                    to_millis(identity.created_at),
                ],
            )?;
            also(tx)
        })?;

        tracing::info!(
            identity = %identity.id,
            role = identity.role.as_str(),
            "identity registered"
        );
        arena.insert(identity.id.clone(), identity);
        Ok(())
    }

    /// Applies `f` to a copy of the identity inside a transaction, persists
    /// the result, then publishes it to the arena. Nothing changes if `f`
    /// fails.
    pub fn update<T>(
        &self,
        id: &IdentityId,
        f: impl FnOnce(&Transaction<'_>, &mut Identity) -> Result<T, StoreError>,
    ) -> Result<(Identity, T), StoreError> {
        let mut arena = self.arena.write()?;
        let mut identity = arena
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownIdentity(id.clone()))?;

        let value = self.db.transaction(|tx| {
            let value = f(tx, &mut identity)?;
            tx.execute(
                "UPDATE identities SET
                    biometric_processing = ?2, data_storage = ?3, purpose_limitation = ?4,
                    consent_version = ?5, consent_updated_at = ?6, lifecycle = ?7,
                    year_of_study = ?8, course_program = ?9
                 WHERE id = ?1",
                params![
                    identity.id.as_str(),
                    identity.consent.biometric_processing,
                    identity.consent.data_storage,
                    identity.consent.purpose_limitation,
                    identity.consent_version,
                    identity.consent_updated_at.map(to_millis),
                    identity.lifecycle.as_str(),
                    identity.year_of_study,
                    identity.course_program,
                ],
            )?;
            Ok(value)
        })?;

        arena.insert(id.clone(), identity.clone());
        Ok((identity, value))
    }

    /// Reads the committed row inside `tx`, bypassing the arena. Used to
    /// re-check consent in the same transaction as a biometric write.
    pub fn load_in(tx: &Transaction<'_>, id: &IdentityId) -> Result<Option<Identity>, StoreError> {
        let identity = tx
            .query_row(
                &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = ?1"),
                params![id.as_str()],
                identity_from_row,
            )
            .optional()?;
        Ok(identity)
    }

    pub fn record_consent_event(
        tx: &Transaction<'_>,
        event: &ConsentEvent,
    ) -> Result<(), StoreError> {
        tx.execute(
            "INSERT INTO consent_events
                (identity_id, event, biometric_processing, data_storage, purpose_limitation,
                 policy_version, origin, at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.identity.as_str(),
                event.kind.as_str(),
                event.flags.biometric_processing,
                event.flags.data_storage,
                event.flags.purpose_limitation,
                event.policy_version,
                event.origin,
                to_millis(event.at),
            ],
        )?;
        Ok(())
    }

    pub fn consent_history(&self, id: &IdentityId) -> Result<Vec<ConsentEvent>, StoreError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT identity_id, event, biometric_processing, data_storage, purpose_limitation,
                    policy_version, origin, at
             FROM consent_events
             WHERE identity_id = ?1
             ORDER BY seq ASC",
        )?;
        let events = stmt
            .query_map(params![id.as_str()], |row| {
                Ok(ConsentEvent {
                    identity: IdentityId::new(row.get::<_, String>(0)?),
                    kind: parse_text(1, &row.get::<_, String>(1)?)?,
                    flags: ConsentFlags {
                        biometric_processing: row.get(2)?,
                        data_storage: row.get(3)?,
                        purpose_limitation: row.get(4)?,
                    },
                    policy_version: row.get(5)?,
                    origin: row.get(6)?,
                    at: from_millis(7, row.get(7)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }
}

fn identity_from_row(row: &Row<'_>) -> rusqlite::Result<Identity> {
    Ok(Identity {
        id: IdentityId::new(row.get::<_, String>(0)?),
        role: parse_text(1, &row.get::<_, String>(1)?)?,
        display_name: row.get(2)?,
        consent: ConsentFlags {
            biometric_processing: row.get(3)?,
            data_storage: row.get(4)?,
            purpose_limitation: row.get(5)?,
        },
        consent_version: row.get(6)?,
        consent_updated_at: row
            .get::<_, Option<i64>>(7)?
            .map(|ms| from_millis(7, ms))
            .transpose()?,
        lifecycle: parse_text(8, &row.get::<_, String>(8)?)?,
        year_of_study: row.get(9)?,
        course_program: row.get(10)?,
        created_at: from_millis(11, row.get(11)?)?,
    })
}
