// Credential persistence
// Local key/value storage plus a mirrored cookie jar, written together

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::expiry::unix_now;
use super::types::{Claims, Credential, GuestCartToken};
use crate::error::{AuthError, Result};

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
pub const GUEST_CART_KEY: &str = "guestCartToken";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS auth_kv (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS cookies (
        name       TEXT PRIMARY KEY,
        value      TEXT NOT NULL,
        expires_at INTEGER
    );
";

/// A pending write applied atomically to both storage locations
pub(crate) enum StoreChange<'a> {
    Put(&'a Credential),
    Clear,
}

/// Durable credential store
///
/// Backed by a SQLite database holding the local key/value table and the
/// mirrored cookie jar. Every write touches both inside one transaction.
pub struct CredentialStore {
    conn: Mutex<Connection>,
}

impl CredentialStore {
    /// Open (or create) the store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AuthError::Storage(format!(
                        "Failed to create store directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        tracing::debug!("Opening credential store: {}", path.display());
        Self::init(Connection::open(path)?)
    }

    /// Volatile store, used by tests and one-shot CLI runs
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AuthError::Storage("credential store lock poisoned".to_string()))
    }

    /// Read the stored credential; absent keys yield `None`, never an error
    pub fn get(&self) -> Option<Credential> {
        let conn = match self.lock() {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("Credential store unavailable: {}", e);
                return None;
            }
        };

        let now = unix_now();
        let credential = Credential {
            access_token: read_value(&conn, ACCESS_TOKEN_KEY, now),
            refresh_token: read_value(&conn, REFRESH_TOKEN_KEY, now),
        };

        (!credential.is_empty()).then_some(credential)
    }

    /// Refresh token as carried by the cookie jar
    pub fn refresh_cookie(&self) -> Option<String> {
        let conn = self.lock().ok()?;
        read_cookie(&conn, REFRESH_TOKEN_KEY, unix_now())
    }

    /// Persist both tokens to both locations
    pub fn put(&self, credential: &Credential) -> Result<()> {
        self.commit(StoreChange::Put(credential), || {})
    }

    /// Remove both tokens from both locations
    pub fn clear(&self) -> Result<()> {
        self.commit(StoreChange::Clear, || {})
    }

    /// Apply `change` to both locations in one transaction, then run
    /// `publish` while the store is still locked.
    ///
    /// Readers block on the same lock, so nobody can observe the store
    /// updated while whatever `publish` mirrors is still stale.
    pub(crate) fn commit<F: FnOnce()>(&self, change: StoreChange<'_>, publish: F) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        match change {
            StoreChange::Put(credential) => {
                write_pair(&tx, ACCESS_TOKEN_KEY, credential.access_token.as_deref())?;
                write_pair(&tx, REFRESH_TOKEN_KEY, credential.refresh_token.as_deref())?;
            }
            StoreChange::Clear => {
                write_pair(&tx, ACCESS_TOKEN_KEY, None)?;
                write_pair(&tx, REFRESH_TOKEN_KEY, None)?;
            }
        }

        tx.commit()?;
        publish();
        Ok(())
    }

    /// Current guest-cart token; an expired one is dropped and `None` returned
    pub fn guest_cart_token(&self) -> Option<GuestCartToken> {
        let conn = self.lock().ok()?;
        let now = unix_now();

        let token = conn
            .query_row(
                "SELECT value, expires_at FROM cookies WHERE name = ?",
                [GUEST_CART_KEY],
                |row| {
                    Ok(GuestCartToken {
                        token: row.get(0)?,
                        expires_at: row.get(1)?,
                    })
                },
            )
            .optional()
            .ok()
            .flatten()
            .or_else(|| {
                read_kv(&conn, GUEST_CART_KEY).map(|token| GuestCartToken {
                    token,
                    expires_at: None,
                })
            })?;

        if token.is_expired(now) {
            tracing::debug!("Guest cart token expired, discarding");
            drop(conn);
            if let Err(e) = self.clear_guest_cart_token() {
                tracing::warn!("Failed to discard expired guest cart token: {}", e);
            }
            return None;
        }

        Some(token)
    }

    pub fn put_guest_cart_token(&self, token: &GuestCartToken) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO auth_kv (key, value) VALUES (?1, ?2)",
            params![GUEST_CART_KEY, token.token],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO cookies (name, value, expires_at) VALUES (?1, ?2, ?3)",
            params![GUEST_CART_KEY, token.token, token.expires_at],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn clear_guest_cart_token(&self) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM auth_kv WHERE key = ?", [GUEST_CART_KEY])?;
        tx.execute("DELETE FROM cookies WHERE name = ?", [GUEST_CART_KEY])?;
        tx.commit()?;
        Ok(())
    }

    /// Raw view of each location, for consistency checks
    #[cfg(any(test, feature = "test-utils"))]
    pub fn locations(&self, key: &str) -> (Option<String>, Option<String>) {
        let conn = self.lock().expect("store lock");
        (read_kv(&conn, key), read_cookie(&conn, key, i64::MIN))
    }
}

/// Upsert or delete `key` in both tables
fn write_pair(tx: &Transaction<'_>, key: &str, value: Option<&str>) -> Result<()> {
    match value {
        Some(value) => {
            // Cookie lifetime follows the token's own expiry when it has one
            let expires_at = Claims::decode(value).ok().and_then(|c| c.exp);
            tx.execute(
                "INSERT OR REPLACE INTO auth_kv (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO cookies (name, value, expires_at) VALUES (?1, ?2, ?3)",
                params![key, value, expires_at],
            )?;
        }
        None => {
            tx.execute("DELETE FROM auth_kv WHERE key = ?", [key])?;
            tx.execute("DELETE FROM cookies WHERE name = ?", [key])?;
        }
    }
    Ok(())
}

/// Local storage first, cookie as fallback
fn read_value(conn: &Connection, key: &str, now: i64) -> Option<String> {
    read_kv(conn, key).or_else(|| read_cookie(conn, key, now))
}

fn read_kv(conn: &Connection, key: &str) -> Option<String> {
    conn.query_row("SELECT value FROM auth_kv WHERE key = ?", [key], |row| {
        row.get(0)
    })
    .optional()
    .unwrap_or_else(|e| {
        tracing::warn!("Failed to read {} from local storage: {}", key, e);
        None
    })
}

/// Cookie value unless the jar would already have evicted it
fn read_cookie(conn: &Connection, key: &str, now: i64) -> Option<String> {
    conn.query_row(
        "SELECT value FROM cookies WHERE name = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
        params![key, now],
        |row| row.get(0),
    )
    .optional()
    .unwrap_or_else(|e| {
        tracing::warn!("Failed to read {} cookie: {}", key, e);
        None
    })
}
