//! Template store: one canonical embedding per identity.
//!
//! Matching reads an immutable snapshot (`Arc<HashMap<..>>`). Writers
//! commit the sealed row first, then swap in a new snapshot, so a reader
//! sees either the old or the new vector, never a partial one. Writes are
//! serialised by `writer` so snapshot order always matches commit order.

use crate::cipher::TemplateCipher;
use crate::db::{from_millis, to_millis, Database};
use crate::error::StoreError;
use chrono::{DateTime, SubsecRound, Utc};
use rollcall_core::{Embedding, FaceTemplate, IdentityId};
use rusqlite::{params, Transaction};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

type Snapshot = Arc<HashMap<IdentityId, Arc<FaceTemplate>>>;

pub struct TemplateStore {
    db: Database,
    cipher: TemplateCipher,
    dim: usize,
    live: RwLock<Snapshot>,
    writer: Mutex<()>,
}

impl TemplateStore {
    /// Loads and decrypts every stored template. Fails if any row has the
    /// wrong dimension or does not authenticate under `cipher`.
    pub fn load(db: Database, cipher: TemplateCipher, dim: usize) -> Result<Self, StoreError> {
        let templates = {
            let conn = db.lock()?;
            let mut stmt = conn.prepare(
                "SELECT identity_id, dim, sealed, model_version, updated_at FROM face_templates",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        from_millis(4, row.get(4)?)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut templates = HashMap::with_capacity(rows.len());
            for (id, stored_dim, sealed, model_version, updated_at) in rows {
                let values = cipher.open(&sealed)?;
                if values.len() != dim || stored_dim != dim as i64 {
                    return Err(StoreError::Corrupt(format!(
                        "template for {id} has {} dims, expected {dim}",
                        values.len()
                    )));
                }
                let identity = IdentityId::new(id);
                templates.insert(
                    identity.clone(),
                    Arc::new(FaceTemplate {
                        identity,
                        embedding: Embedding {
                            values,
                            model_version,
                        },
                        updated_at,
                    }),
                );
            }
            templates
        };

        tracing::info!(count = templates.len(), dim, "template store loaded");
        Ok(Self {
            db,
            cipher,
            dim,
            live: RwLock::new(Arc::new(templates)),
            writer: Mutex::new(()),
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Rejects embeddings of the wrong dimension or with NaN or infinite
    /// components.
    pub fn validate(&self, embedding: &Embedding) -> Result<(), StoreError> {
        if embedding.dim() != self.dim {
            return Err(StoreError::InvalidTemplate {
                expected: self.dim,
                actual: embedding.dim(),
            });
        }
        if !embedding.is_finite() {
            return Err(StoreError::NonFiniteTemplate);
        }
        Ok(())
    }

    /// Overwrites the identity's template.
    pub fn put(
        &self,
        identity: &IdentityId,
        embedding: Embedding,
    ) -> Result<FaceTemplate, StoreError> {
        self.replace(identity, embedding, |_, _| Ok(()))
    }

    /// Overwrites the identity's template; `also` runs in the same
    /// transaction and can veto the write.
    pub fn replace(
        &self,
        identity: &IdentityId,
        embedding: Embedding,
        also: impl FnOnce(&Transaction<'_>, &FaceTemplate) -> Result<(), StoreError>,
    ) -> Result<FaceTemplate, StoreError> {
        self.validate(&embedding)?;
        let sealed = self.cipher.seal(&embedding.values)?;

        let _writer = self.writer.lock()?;
        let template = FaceTemplate {
            identity: identity.clone(),
            embedding,
            updated_at: now(),
        };

        self.db.transaction(|tx| {
            tx.execute(
                "INSERT INTO face_templates (identity_id, dim, sealed, model_version, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(identity_id) DO UPDATE SET
                    dim = excluded.dim,
                    sealed = excluded.sealed,
                    model_version = excluded.model_version,
                    updated_at = excluded.updated_at",
                params![
                    identity.as_str(),
                    self.dim as i64,
                    sealed,
                    template.embedding.model_version,
                    to_millis(template.updated_at),
                ],
            )?;
            also(tx, &template)
        })?;

        let mut live = self.live.write()?;
        Arc::make_mut(&mut live).insert(identity.clone(), Arc::new(template.clone()));
        Ok(template)
    }

    /// Deletes the identity's template row inside the caller's transaction.
    /// The in-memory snapshot is untouched until [`TemplateStore::evict`]
    /// runs after commit. Returns whether a row existed.
    pub fn delete_in(tx: &Transaction<'_>, identity: &IdentityId) -> Result<bool, StoreError> {
        let n = tx.execute(
            "DELETE FROM face_templates WHERE identity_id = ?1",
            params![identity.as_str()],
        )?;
        Ok(n > 0)
    }

    /// Drops the identity from the snapshot. Serialised with writers so a
    /// replace that committed earlier cannot republish afterwards.
    pub fn evict(&self, identity: &IdentityId) -> Result<(), StoreError> {
        let _writer = self.writer.lock()?;
        let mut live = self.live.write()?;
        if live.contains_key(identity) {
            Arc::make_mut(&mut live).remove(identity);
        }
        Ok(())
    }

    pub fn get(&self, identity: &IdentityId) -> Result<Option<Arc<FaceTemplate>>, StoreError> {
        Ok(self.live.read()?.get(identity).cloned())
    }

    /// The current snapshot. Later writes never mutate it.
    pub fn get_all(&self) -> Result<Snapshot, StoreError> {
        Ok(Arc::clone(&*self.live.read()?))
    }

    pub fn updated_at(&self, identity: &IdentityId) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.get(identity)?.map(|t| t.updated_at))
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.live.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

/// Millisecond precision, matching what is persisted.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}
