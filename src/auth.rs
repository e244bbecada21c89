//! Optional identity layer for GET/DELETE
//!
//! Users and session tokens live in an explicit `SessionStore` that the daemon
//! owns and hands to the server; nothing here is process-global. Tokens never
//! expire and comparisons are plain string equality.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::Context;
use parking_lot::Mutex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::TOKEN_SEPARATOR;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("username must not be empty")]
    EmptyUsername,
    #[error("user already exists: {0}")]
    UserExists(String),
    #[error("invalid username or password")]
    InvalidCredentials,
}

pub trait IdentityService: Send + Sync {
    /// Create a user and return a fresh session token
    fn register(&self, username: &str, password: &str) -> Result<String, AuthError>;
    /// Check credentials and return a fresh session token
    fn authenticate(&self, username: &str, password: &str) -> Result<String, AuthError>;
    fn is_valid_token(&self, token: &str) -> bool;
}

struct Credential {
    salt: String,
    hash: String,
}

#[derive(Default)]
struct Tables {
    users: HashMap<String, Credential>,
    // token -> username
    sessions: HashMap<String, String>,
}

#[derive(Default)]
pub struct SessionStore {
    tables: Mutex<Tables>,
}

fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every user in a users file. Returns `(username, token)` pairs.
    pub fn register_all(&self, users: &UsersFile) -> Result<Vec<(String, String)>, AuthError> {
        users
            .users
            .iter()
            .map(|(name, password)| Ok((name.clone(), self.register(name, password)?)))
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.tables.lock().sessions.len()
    }

    fn issue(tables: &mut Tables, username: &str) -> String {
        let token = Uuid::new_v4().to_string();
        tables.sessions.insert(token.clone(), username.to_string());
        token
    }
}

impl IdentityService for SessionStore {
    fn register(&self, username: &str, password: &str) -> Result<String, AuthError> {
        if username.is_empty() {
            return Err(AuthError::EmptyUsername);
        }
        let mut tables = self.tables.lock();
        if tables.users.contains_key(username) {
            return Err(AuthError::UserExists(username.to_string()));
        }
        let salt = Uuid::new_v4().simple().to_string();
        let hash = hash_password(&salt, password);
        tables
            .users
            .insert(username.to_string(), Credential { salt, hash });
        Ok(Self::issue(&mut tables, username))
    }

    fn authenticate(&self, username: &str, password: &str) -> Result<String, AuthError> {
        let mut tables = self.tables.lock();
        let matches = tables
            .users
            .get(username)
            .map(|c| hash_password(&c.salt, password) == c.hash)
            .unwrap_or(false);
        if !matches {
            return Err(AuthError::InvalidCredentials);
        }
        Ok(Self::issue(&mut tables, username))
    }

    fn is_valid_token(&self, token: &str) -> bool {
        self.tables.lock().sessions.contains_key(token)
    }
}

/// `users.toml`:
///
/// ```toml
/// [users]
/// alice = "correct horse"
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct UsersFile {
    #[serde(default)]
    pub users: BTreeMap<String, String>,
}

pub fn load_users(path: &Path) -> anyhow::Result<UsersFile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read users file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Failed to parse users file {}", path.display()))
}

/// Split `<token>\0<filename>`; `None` when no token is present
pub fn split_token(target: &str) -> Option<(&str, &str)> {
    target.split_once(TOKEN_SEPARATOR)
}

pub fn join_token(token: &str, name: &str) -> String {
    format!("{token}{TOKEN_SEPARATOR}{name}")
}
