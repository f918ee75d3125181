use crate::{codec, from_micros, to_micros, to_sql_int, Store, StoreError};
use chrono::Utc;
use presence_core::types::EMBEDDING_DTYPE_F32LE;
use presence_core::{Embedding, Identity, IdentityPatch, NewIdentity};
use rusqlite::{params, Connection, OptionalExtension, Row};

const IDENTITY_COLUMNS: &str = "id, display_name, email, role, department, \
     embedding, embedding_dim, embedding_dtype, model_version, enrolled_at_us";

/// Raw column values, decoded into an [`Identity`] outside the row callback.
struct IdentityRow {
    id: String,
    display_name: String,
    email: String,
    role: String,
    department: String,
    embedding: Vec<u8>,
    embedding_dim: i64,
    embedding_dtype: String,
    model_version: Option<String>,
    enrolled_at_us: i64,
}

impl IdentityRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            display_name: row.get(1)?,
            email: row.get(2)?,
            role: row.get(3)?,
            department: row.get(4)?,
            embedding: row.get(5)?,
            embedding_dim: row.get(6)?,
            embedding_dtype: row.get(7)?,
            model_version: row.get(8)?,
            enrolled_at_us: row.get(9)?,
        })
    }

    fn decode(self) -> Result<Identity, StoreError> {
        let dim = usize::try_from(self.embedding_dim).map_err(|_| {
            StoreError::InvalidDbValue(format!(
                "identity {}: negative embedding_dim {}",
                self.id, self.embedding_dim
            ))
        })?;
        let values = codec::decode_f32le(&self.embedding, dim, &self.embedding_dtype)?;
        Ok(Identity {
            enrolled_at: from_micros(self.enrolled_at_us)?,
            embedding: Embedding {
                values,
                model_version: self.model_version,
            },
            id: self.id,
            display_name: self.display_name,
            email: self.email,
            role: self.role,
            department: self.department,
        })
    }
}

fn query_identities(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Identity>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, IdentityRow::read)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(IdentityRow::decode).collect()
}

fn find_identity(conn: &Connection, id: &str) -> Result<Option<Identity>, StoreError> {
    conn.query_row(
        &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = ?1"),
        [id],
        IdentityRow::read,
    )
    .optional()?
    .map(IdentityRow::decode)
    .transpose()
}

fn email_taken(conn: &Connection, email: &str) -> Result<bool, StoreError> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM identities WHERE email = ?1)",
        [email],
        |row| row.get(0),
    )?)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

impl Store {
    /// Enroll a new identity with its embedding.
    ///
    /// Fails with [`StoreError::DuplicateIdentity`] if the email is taken.
    pub async fn insert_identity(
        &self,
        new: NewIdentity,
        embedding: Embedding,
    ) -> Result<Identity, StoreError> {
        codec::validate(&embedding.values)?;

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            if email_taken(&tx, &new.email)? {
                return Err(StoreError::DuplicateIdentity(new.email));
            }

            let identity = Identity {
                id: uuid::Uuid::new_v4().to_string(),
                display_name: new.display_name,
                email: new.email,
                role: new.role,
                department: new.department,
                embedding,
                enrolled_at: Utc::now(),
            };
            let inserted = tx.execute(
                &format!("INSERT INTO identities ({IDENTITY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
                params![
                    identity.id,
                    identity.display_name,
                    identity.email,
                    identity.role,
                    identity.department,
                    codec::encode_f32le(&identity.embedding.values),
                    identity.embedding.dim() as i64,
                    EMBEDDING_DTYPE_F32LE,
                    identity.embedding.model_version,
                    to_micros(identity.enrolled_at),
                ],
            );
            match inserted {
                Err(e) if is_unique_violation(&e) => {
                    return Err(StoreError::DuplicateIdentity(identity.email))
                }
                other => other?,
            };
            tx.commit()?;

            // Hand back exactly what a later read would produce.
            let stored = find_identity(conn, &identity.id)?
                .ok_or_else(|| StoreError::NotFound(identity.id.clone()))?;
            tracing::info!(id = %stored.id, email = %stored.email, dim = stored.embedding.dim(), "identity enrolled");
            Ok(stored)
        })
        .await
    }

    pub async fn contains_email(&self, email: &str) -> Result<bool, StoreError> {
        let email = email.to_string();
        self.with_conn(move |conn| email_taken(conn, &email)).await
    }

    pub async fn get_identity(&self, id: &str) -> Result<Identity, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| find_identity(conn, &id)?.ok_or(StoreError::NotFound(id)))
            .await
    }

    /// Point-in-time snapshot of the whole gallery, oldest enrollment first
    /// (ties broken by id).
    pub async fn scan_all(&self) -> Result<Vec<Identity>, StoreError> {
        self.with_conn(|conn| {
            query_identities(
                conn,
                &format!("SELECT {IDENTITY_COLUMNS} FROM identities ORDER BY enrolled_at_us, id"),
                [],
            )
        })
        .await
    }

    pub async fn list_identities(
        &self,
        offset: u32,
        limit: u32,
    ) -> Result<Vec<Identity>, StoreError> {
        self.with_conn(move |conn| {
            query_identities(
                conn,
                &format!(
                    "SELECT {IDENTITY_COLUMNS} FROM identities
                     ORDER BY enrolled_at_us, id LIMIT ?1 OFFSET ?2"
                ),
                params![to_sql_int(limit), to_sql_int(offset)],
            )
        })
        .await
    }

    /// Change descriptive metadata. The embedding and email are immutable.
    pub async fn update_identity(
        &self,
        id: &str,
        patch: IdentityPatch,
    ) -> Result<Identity, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE identities SET
                    display_name = COALESCE(?2, display_name),
                    role = COALESCE(?3, role),
                    department = COALESCE(?4, department)
                 WHERE id = ?1",
                params![id, patch.display_name, patch.role, patch.department],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(id));
            }
            find_identity(conn, &id)?.ok_or(StoreError::NotFound(id))
        })
        .await
    }

    /// Delete an identity together with all of its attendance events.
    ///
    /// Returns how many events were removed.
    pub async fn remove_identity(&self, id: &str) -> Result<usize, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let events = tx.execute("DELETE FROM attendance WHERE identity_id = ?1", [&id])?;
            let removed = tx.execute("DELETE FROM identities WHERE id = ?1", [&id])?;
            if removed == 0 {
                // Dropping the transaction rolls back.
                return Err(StoreError::NotFound(id));
            }
            tx.commit()?;
            tracing::info!(%id, events, "identity removed");
            Ok(events)
        })
        .await
    }
}
