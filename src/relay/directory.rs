// User directory: credential checks and presence flags

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// What the relay needs to know about users.
///
/// Implementations may fail; sessions treat an `Err` from `authenticate` as
/// a rejected login and an `Err` from `set_presence` as a logged warning.
pub trait UserDirectory: Send + Sync {
    /// Check a user's secret
    fn authenticate(&self, identity: &str, secret: &str) -> Result<bool>;

    /// Record whether a user currently has a live session
    fn set_presence(&self, identity: &str, online: bool) -> Result<()>;
}

/// A stored user, without credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub email: String,
    pub online: bool,
    pub created_at: SystemTime,
    pub last_seen: Option<SystemTime>,
}

/// Salted SHA-256 of a password, hex encoded
pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// Random 16-byte salt, hex encoded
fn generate_salt() -> String {
    use rand::RngCore;

    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn to_unix_secs(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs() as i64
}

fn from_unix_secs(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

/// User directory persisted in SQLite
pub struct SqliteDirectory {
    db_path: PathBuf,
}

impl SqliteDirectory {
    /// Open (or create) the directory database at `db_path`
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .context("Failed to create user directory folder")?;
        }

        let directory = Self {
            db_path: db_path.to_path_buf(),
        };

        directory.initialize_db()?;

        Ok(directory)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn get_connection(&self) -> Result<Connection> {
        Connection::open(&self.db_path).context("Failed to open user database")
    }

    fn initialize_db(&self) -> Result<()> {
        let conn = self.get_connection()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS users (
                email TEXT PRIMARY KEY,
                password_hash TEXT NOT NULL,
                salt TEXT NOT NULL,
                online INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                last_seen INTEGER
            )",
            [],
        )?;

        Ok(())
    }

    /// Add a user. Fails if the email is already taken.
    pub fn add_user(&self, email: &str, password: &str) -> Result<()> {
        let conn = self.get_connection()?;

        let exists: Option<String> = conn
            .query_row(
                "SELECT email FROM users WHERE email = ?1",
                params![email],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            anyhow::bail!("User '{}' already exists", email);
        }

        let salt = generate_salt();
        conn.execute(
            "INSERT INTO users (email, password_hash, salt, online, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![
                email,
                hash_password(&salt, password),
                salt,
                to_unix_secs(SystemTime::now()),
            ],
        )?;

        tracing::info!("Added user {}", email);
        Ok(())
    }

    /// Remove a user. Returns false if no such user existed.
    pub fn remove_user(&self, email: &str) -> Result<bool> {
        let conn = self.get_connection()?;
        let removed = conn.execute("DELETE FROM users WHERE email = ?1", params![email])?;
        Ok(removed > 0)
    }

    pub fn get_user(&self, email: &str) -> Result<Option<UserRecord>> {
        let conn = self.get_connection()?;

        let user = conn
            .query_row(
                "SELECT email, online, created_at, last_seen FROM users WHERE email = ?1",
                params![email],
                |row| {
                    Ok(UserRecord {
                        email: row.get(0)?,
                        online: row.get::<_, i64>(1)? != 0,
                        created_at: from_unix_secs(row.get(2)?),
                        last_seen: row.get::<_, Option<i64>>(3)?.map(from_unix_secs),
                    })
                },
            )
            .optional()?;

        Ok(user)
    }

    pub fn is_online(&self, email: &str) -> Result<bool> {
        Ok(self.get_user(email)?.map(|user| user.online).unwrap_or(false))
    }

    /// All users, ordered by email
    pub fn list_users(&self) -> Result<Vec<UserRecord>> {
        let conn = self.get_connection()?;

        let mut stmt = conn.prepare(
            "SELECT email, online, created_at, last_seen FROM users ORDER BY email",
        )?;

        let users = stmt
            .query_map([], |row| {
                Ok(UserRecord {
                    email: row.get(0)?,
                    online: row.get::<_, i64>(1)? != 0,
                    created_at: from_unix_secs(row.get(2)?),
                    last_seen: row.get::<_, Option<i64>>(3)?.map(from_unix_secs),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(users)
    }

    /// Mark every user offline. Presence does not survive a restart.
    pub fn reset_presence(&self) -> Result<usize> {
        let conn = self.get_connection()?;
        let updated = conn.execute("UPDATE users SET online = 0 WHERE online != 0", [])?;
        Ok(updated)
    }
}

impl UserDirectory for SqliteDirectory {
    fn authenticate(&self, identity: &str, secret: &str) -> Result<bool> {
        let conn = self.get_connection()?;

        let stored: Option<(String, String)> = conn
            .query_row(
                "SELECT password_hash, salt FROM users WHERE email = ?1",
                params![identity],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(match stored {
            Some((password_hash, salt)) => hash_password(&salt, secret) == password_hash,
            None => false,
        })
    }

    fn set_presence(&self, identity: &str, online: bool) -> Result<()> {
        let conn = self.get_connection()?;

        conn.execute(
            "UPDATE users SET online = ?1, last_seen = ?2 WHERE email = ?3",
            params![online as i64, to_unix_secs(SystemTime::now()), identity],
        )?;

        Ok(())
    }
}

#[derive(Debug)]
struct MemoryUser {
    password: String,
    online: bool,
}

/// Directory held in memory, for tests and throwaway servers
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    users: RwLock<HashMap<String, MemoryUser>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style helper
    pub fn with_user(self, email: &str, password: &str) -> Self {
        // A fresh directory has no other handles, so the lock cannot be poisoned.
        let _ = self.add_user(email, password);
        self
    }

    /// Add or replace a user
    pub fn add_user(&self, email: &str, password: &str) -> Result<()> {
        let mut users = self
            .users
            .write()
            .map_err(|_| anyhow!("user directory lock poisoned"))?;
        users.insert(
            email.to_string(),
            MemoryUser {
                password: password.to_string(),
                online: false,
            },
        );
        Ok(())
    }

    pub fn is_online(&self, email: &str) -> bool {
        self.users
            .read()
            .map(|users| users.get(email).map(|u| u.online).unwrap_or(false))
            .unwrap_or(false)
    }
}

impl UserDirectory for MemoryDirectory {
    fn authenticate(&self, identity: &str, secret: &str) -> Result<bool> {
        let users = self
            .users
            .read()
            .map_err(|_| anyhow!("user directory lock poisoned"))?;
        Ok(users
            .get(identity)
            .map(|user| user.password == secret)
            .unwrap_or(false))
    }

    fn set_presence(&self, identity: &str, online: bool) -> Result<()> {
        let mut users = self
            .users
            .write()
            .map_err(|_| anyhow!("user directory lock poisoned"))?;
        if let Some(user) = users.get_mut(identity) {
            user.online = online;
        }
        Ok(())
    }
}
