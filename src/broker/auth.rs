//! Authentication for the connection engine.
//!
//! The engine decides *when* credentials are required (username flag,
//! anonymous policy); an [`Authenticator`] only decides whether a given
//! triple is valid.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{MqttError, Result};

/// Credential backend consulted during the CONNECT handshake.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Validates a (client id, username, password) triple.
    ///
    /// The password slice is empty when the client set the username flag
    /// without a password and the broker permits that.
    async fn check_valid(&self, client_id: &str, username: &str, password: &[u8]) -> bool;
}

/// Accepts every connection (for testing/development).
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllAuthenticator;

#[async_trait]
impl Authenticator for AllowAllAuthenticator {
    async fn check_valid(&self, _client_id: &str, _username: &str, _password: &[u8]) -> bool {
        true
    }
}

/// Username/password authenticator backed by a credentials file.
///
/// File format: `username:password`, one per line. Blank lines and lines
/// starting with `#` are skipped.
#[derive(Debug, Default)]
pub struct PasswordFileAuthenticator {
    users: RwLock<HashMap<String, String>>,
}

impl PasswordFileAuthenticator {
    /// Creates an authenticator with no users; every login fails until
    /// users are added.
    #[must_use]
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Loads credentials from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a line is malformed.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).await?;

        let mut users = HashMap::new();
        for (line_no, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((username, password)) = line.split_once(':') else {
                return Err(MqttError::InvalidState(format!(
                    "malformed credentials line {} in {}",
                    line_no + 1,
                    path.display()
                )));
            };
            users.insert(username.to_string(), password.to_string());
        }

        debug!("Loaded {} users from {}", users.len(), path.display());
        Ok(Self {
            users: RwLock::new(users),
        })
    }

    /// Adds or replaces a user.
    pub async fn add_user(&self, username: impl Into<String>, password: impl Into<String>) {
        self.users
            .write()
            .await
            .insert(username.into(), password.into());
    }

    /// Removes a user; returns true if it existed.
    pub async fn remove_user(&self, username: &str) -> bool {
        self.users.write().await.remove(username).is_some()
    }
}

#[async_trait]
impl Authenticator for PasswordFileAuthenticator {
    async fn check_valid(&self, client_id: &str, username: &str, password: &[u8]) -> bool {
        let users = self.users.read().await;
        match users.get(username) {
            Some(expected) if expected.as_bytes() == password => true,
            Some(_) => {
                warn!("Wrong password for username {username} (client {client_id})");
                false
            }
            None => {
                warn!("Unknown username {username} (client {client_id})");
                false
            }
        }
    }
}
