//! SQLite persistence layer.
//!
//! Stores dashboard users and their OIDC tokens, one token per
//! (user, browser session, provider). Uses WAL mode.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Result as SqlResult, params};

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

/// A dashboard user, keyed by the provider's `sub` claim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserRow {
    pub id: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub profile_image_url: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl UserRow {
    /// Name for display: first/last name, else email, else the id.
    pub fn display_name(&self) -> String {
        let name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if !name.is_empty() {
            name
        } else if let Some(email) = self.email.as_deref().filter(|e| !e.is_empty()) {
            email.to_string()
        } else {
            self.id.clone()
        }
    }
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id                TEXT PRIMARY KEY,
                email             TEXT UNIQUE,
                first_name        TEXT,
                last_name         TEXT,
                profile_image_url TEXT,
                created_at        INTEGER NOT NULL,
                updated_at        INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS oauth (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id             TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                browser_session_key TEXT NOT NULL,
                provider            TEXT NOT NULL,
                token_json          TEXT NOT NULL,
                created_at          INTEGER NOT NULL,
                UNIQUE(user_id, browser_session_key, provider)
            );
            ",
        )?;
        Ok(())
    }

    // ── Users ──────────────────────────────────────────────────────────

    /// Insert or merge a user. Every profile column takes the new value;
    /// `created_at` is kept from the first insert.
    pub fn upsert_user(&self, user: &UserRow) -> SqlResult<UserRow> {
        let now = chrono::Utc::now().timestamp();
        self.conn.execute(
            "INSERT INTO users (id, email, first_name, last_name, profile_image_url, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(id) DO UPDATE SET
                email=excluded.email,
                first_name=excluded.first_name,
                last_name=excluded.last_name,
                profile_image_url=excluded.profile_image_url,
                updated_at=excluded.updated_at",
            params![
                user.id,
                user.email,
                user.first_name,
                user.last_name,
                user.profile_image_url,
                now,
            ],
        )?;
        self.get_user(&user.id)?
            .ok_or(rusqlite::Error::QueryReturnedNoRows)
    }

    pub fn get_user(&self, id: &str) -> SqlResult<Option<UserRow>> {
        self.conn
            .query_row(
                "SELECT id, email, first_name, last_name, profile_image_url, created_at, updated_at
                 FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        first_name: row.get(2)?,
                        last_name: row.get(3)?,
                        profile_image_url: row.get(4)?,
                        created_at: row.get(5)?,
                        updated_at: row.get(6)?,
                    })
                },
            )
            .optional()
    }

    // ── OAuth tokens ───────────────────────────────────────────────────

    pub fn get_token(
        &self,
        user_id: &str,
        browser_session_key: &str,
        provider: &str,
    ) -> SqlResult<Option<serde_json::Value>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT token_json FROM oauth
                 WHERE user_id = ?1 AND browser_session_key = ?2 AND provider = ?3",
                params![user_id, browser_session_key, provider],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json.and_then(|j| match serde_json::from_str(&j) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(user = %user_id, error = %e, "stored token is not valid JSON");
                None
            }
        }))
    }

    /// Replace the token for (user, browser session, provider).
    pub fn set_token(
        &self,
        user_id: &str,
        browser_session_key: &str,
        provider: &str,
        token: &serde_json::Value,
    ) -> SqlResult<()> {
        let json = serde_json::to_string(token).unwrap_or_else(|_| "{}".to_string());
        self.conn.execute(
            "INSERT INTO oauth (user_id, browser_session_key, provider, token_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, browser_session_key, provider) DO UPDATE SET
                token_json=excluded.token_json,
                created_at=excluded.created_at",
            params![
                user_id,
                browser_session_key,
                provider,
                json,
                chrono::Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Returns whether a token was deleted.
    pub fn delete_token(
        &self,
        user_id: &str,
        browser_session_key: &str,
        provider: &str,
    ) -> SqlResult<bool> {
        let n = self.conn.execute(
            "DELETE FROM oauth WHERE user_id = ?1 AND browser_session_key = ?2 AND provider = ?3",
            params![user_id, browser_session_key, provider],
        )?;
        Ok(n > 0)
    }
}
