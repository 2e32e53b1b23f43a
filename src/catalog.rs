//! Persistent catalog of users, access keys and buckets.
//!
//! A small SQLite database with `bucket.name` and
//! `access_keys.access_key_id` as unique indexes. The catalog is the
//! durable source of truth; the in-memory credential caches are strictly
//! derived from it and refreshed on every mutation.
//!
//! The connection runs in WAL mode with `synchronous=FULL` so inserts are
//! on disk before the handler returns a 2xx.

use crate::types::VersioningState;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("bucket already exists: {0}")]
    BucketExists(String),

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("catalog error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A user row. Provisioned externally; the engine only reads `id`.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone)]
pub struct AccessKeyRow {
    pub id: String,
    pub owner_user_id: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessKeyRow {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| e < now).unwrap_or(false)
    }
}

#[derive(Debug, Clone)]
pub struct BucketRow {
    pub name: String,
    pub owner_user_id: String,
    pub created_at: DateTime<Utc>,
    pub versioning: VersioningState,
}

/// SQLite-backed catalog. All methods are synchronous; callers sit on a
/// blocking-tolerant worker the same as the filesystem engine does.
pub struct Catalog {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id            TEXT PRIMARY KEY,
    username      TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL DEFAULT '',
    is_admin      INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS access_keys (
    id                TEXT PRIMARY KEY,
    owner_user_id     TEXT NOT NULL REFERENCES users(id),
    access_key_id     TEXT NOT NULL UNIQUE,
    secret_access_key TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    expires_at        TEXT
);
CREATE TABLE IF NOT EXISTS buckets (
    name          TEXT PRIMARY KEY,
    owner_user_id TEXT NOT NULL REFERENCES users(id),
    created_at    TEXT NOT NULL,
    versioning    TEXT NOT NULL DEFAULT 'Disabled'
);
";

impl Catalog {
    /// Open (or create) the catalog database at `path`.
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory catalog for tests.
    pub fn open_in_memory() -> Result<Self, CatalogError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CatalogError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert the bootstrap admin user and its access key unless either
    /// already exists. Returns the admin user id.
    pub fn bootstrap_root(
        &self,
        access_key_id: &str,
        secret_access_key: &str,
    ) -> Result<String, CatalogError> {
        let conn = self.conn.lock();
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM users WHERE username = 'root'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let user_id = match existing {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO users (id, username, is_admin) VALUES (?1, 'root', 1)",
                    params![id],
                )?;
                info!("Bootstrapped root user");
                id
            }
        };
        let have_key: Option<String> = conn
            .query_row(
                "SELECT id FROM access_keys WHERE access_key_id = ?1",
                params![access_key_id],
                |row| row.get(0),
            )
            .optional()?;
        if have_key.is_none() {
            conn.execute(
                "INSERT INTO access_keys
                   (id, owner_user_id, access_key_id, secret_access_key, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    user_id,
                    access_key_id,
                    secret_access_key,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            info!("Bootstrapped root access key {}", access_key_id);
        }
        Ok(user_id)
    }

    // === Bucket operations ===

    /// Transactionally insert a bucket row. Fails with `BucketExists` when
    /// the name is taken by any owner (bucket names are global).
    pub fn create_bucket(
        &self,
        name: &str,
        owner_user_id: &str,
    ) -> Result<BucketRow, CatalogError> {
        let conn = self.conn.lock();
        let created_at = Utc::now();
        let result = conn.execute(
            "INSERT INTO buckets (name, owner_user_id, created_at, versioning)
             VALUES (?1, ?2, ?3, 'Disabled')",
            params![name, owner_user_id, created_at.to_rfc3339()],
        );
        match result {
            Ok(_) => Ok(BucketRow {
                name: name.to_string(),
                owner_user_id: owner_user_id.to_string(),
                created_at,
                versioning: VersioningState::Disabled,
            }),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(CatalogError::BucketExists(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete_bucket(&self, name: &str) -> Result<(), CatalogError> {
        let n = self
            .conn
            .lock()
            .execute("DELETE FROM buckets WHERE name = ?1", params![name])?;
        if n == 0 {
            return Err(CatalogError::BucketNotFound(name.to_string()));
        }
        Ok(())
    }

    pub fn bucket(&self, name: &str) -> Result<Option<BucketRow>, CatalogError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT name, owner_user_id, created_at, versioning
                 FROM buckets WHERE name = ?1",
                params![name],
                bucket_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn buckets_for_owner(&self, owner_user_id: &str) -> Result<Vec<BucketRow>, CatalogError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name, owner_user_id, created_at, versioning
             FROM buckets WHERE owner_user_id = ?1 ORDER BY name",
        )?;
        let rows = stmt
            .query_map(params![owner_user_id], bucket_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn all_buckets(&self) -> Result<Vec<BucketRow>, CatalogError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name, owner_user_id, created_at, versioning FROM buckets ORDER BY name",
        )?;
        let rows = stmt
            .query_map([], bucket_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_versioning(
        &self,
        name: &str,
        state: VersioningState,
    ) -> Result<(), CatalogError> {
        let n = self.conn.lock().execute(
            "UPDATE buckets SET versioning = ?1 WHERE name = ?2",
            params![state.as_str(), name],
        )?;
        if n == 0 {
            return Err(CatalogError::BucketNotFound(name.to_string()));
        }
        Ok(())
    }

    // === Access key operations ===

    pub fn add_access_key(
        &self,
        owner_user_id: &str,
        access_key_id: &str,
        secret_access_key: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<AccessKeyRow, CatalogError> {
        let conn = self.conn.lock();
        let owner: Option<String> = conn
            .query_row(
                "SELECT id FROM users WHERE id = ?1",
                params![owner_user_id],
                |row| row.get(0),
            )
            .optional()?;
        if owner.is_none() {
            return Err(CatalogError::UserNotFound(owner_user_id.to_string()));
        }
        let row = AccessKeyRow {
            id: uuid::Uuid::new_v4().to_string(),
            owner_user_id: owner_user_id.to_string(),
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
            created_at: Utc::now(),
            expires_at,
        };
        conn.execute(
            "INSERT INTO access_keys
               (id, owner_user_id, access_key_id, secret_access_key, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.id,
                row.owner_user_id,
                row.access_key_id,
                row.secret_access_key,
                row.created_at.to_rfc3339(),
                row.expires_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(row)
    }

    pub fn remove_access_key(&self, access_key_id: &str) -> Result<(), CatalogError> {
        self.conn.lock().execute(
            "DELETE FROM access_keys WHERE access_key_id = ?1",
            params![access_key_id],
        )?;
        Ok(())
    }

    /// All keys that may authenticate right now; used to warm the
    /// credential caches on cold start.
    pub fn active_access_keys(&self) -> Result<Vec<AccessKeyRow>, CatalogError> {
        let now = Utc::now();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, owner_user_id, access_key_id, secret_access_key, created_at, expires_at
             FROM access_keys",
        )?;
        let rows = stmt
            .query_map([], access_key_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().filter(|k| !k.is_expired(now)).collect())
    }

    // === User operations (provisioning is external; tests need these) ===

    pub fn insert_user(&self, username: &str, is_admin: bool) -> Result<UserRow, CatalogError> {
        let row = UserRow {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.to_string(),
            is_admin,
        };
        self.conn.lock().execute(
            "INSERT INTO users (id, username, is_admin) VALUES (?1, ?2, ?3)",
            params![row.id, row.username, row.is_admin as i64],
        )?;
        Ok(row)
    }
}

fn bucket_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BucketRow> {
    let created_at: String = row.get(2)?;
    let versioning: String = row.get(3)?;
    Ok(BucketRow {
        name: row.get(0)?,
        owner_user_id: row.get(1)?,
        created_at: parse_ts(&created_at),
        versioning: VersioningState::parse(&versioning).unwrap_or(VersioningState::Disabled),
    })
}

fn access_key_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccessKeyRow> {
    let created_at: String = row.get(4)?;
    let expires_at: Option<String> = row.get(5)?;
    Ok(AccessKeyRow {
        id: row.get(0)?,
        owner_user_id: row.get(1)?,
        access_key_id: row.get(2)?,
        secret_access_key: row.get(3)?,
        created_at: parse_ts(&created_at),
        expires_at: expires_at.as_deref().map(parse_ts),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
