//! Authentication Module
//!
//! Provides username/password authentication against a static user list.
//! Passwords are either plaintext or argon2 PHC hashes.

use std::collections::HashMap;

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::AuthConfig;

#[cfg(test)]
mod tests;

/// Authentication failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Unknown user or wrong password
    BadCredentials,
    /// Anonymous connection refused
    NotAuthorized,
    /// Backend could not decide (e.g. unparsable stored hash)
    Backend(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::BadCredentials => write!(f, "bad username or password"),
            AuthError::NotAuthorized => write!(f, "not authorized"),
            AuthError::Backend(msg) => write!(f, "authentication backend error: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}

/// Identity established at CONNECT
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Authentication {
    /// Authenticated username (None for anonymous)
    pub username: Option<String>,
    /// ACL role of the user
    pub role: Option<String>,
}

impl Authentication {
    pub fn anonymous() -> Self {
        Self::default()
    }
}

/// Credential check performed on CONNECT
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        username: Option<&str>,
        secret: Option<&[u8]>,
    ) -> Result<Authentication, AuthError>;
}

/// Stored credential
enum Credential {
    Plaintext(String),
    /// argon2 PHC string
    Hash(String),
}

/// Internal user entry
struct UserEntry {
    credential: Credential,
    /// ACL role (if any)
    role: Option<String>,
}

/// Authentication provider backed by the `[auth]` config section
pub struct AuthProvider {
    /// Whether auth is enabled
    enabled: bool,
    /// Allow anonymous connections
    allow_anonymous: bool,
    /// User credentials map (username -> UserEntry)
    users: HashMap<String, UserEntry>,
}

impl AuthProvider {
    /// Create a new auth provider from configuration
    pub fn new(config: &AuthConfig) -> Self {
        let mut users = HashMap::new();

        for user in &config.users {
            let credential = match (&user.password_hash, &user.password) {
                (Some(hash), _) => Credential::Hash(hash.clone()),
                (None, Some(password)) => Credential::Plaintext(password.clone()),
                (None, None) => {
                    warn!("User '{}' has no credential, skipping", user.username);
                    continue;
                }
            };
            users.insert(
                user.username.clone(),
                UserEntry {
                    credential,
                    role: user.role.clone(),
                },
            );
        }

        Self {
            enabled: config.enabled,
            allow_anonymous: config.allow_anonymous,
            users,
        }
    }

    /// Check if auth is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Get the ACL role for a username
    pub fn get_user_role(&self, username: &str) -> Option<&str> {
        self.users.get(username).and_then(|u| u.role.as_deref())
    }

    /// Verify a password against a stored credential
    fn verify_password(password: &[u8], credential: &Credential) -> Result<bool, AuthError> {
        match credential {
            Credential::Plaintext(stored) => Ok(password == stored.as_bytes()),
            Credential::Hash(phc) => {
                let parsed =
                    PasswordHash::new(phc).map_err(|e| AuthError::Backend(e.to_string()))?;
                Ok(Argon2::default()
                    .verify_password(password, &parsed)
                    .is_ok())
            }
        }
    }
}

#[async_trait]
impl Authenticator for AuthProvider {
    async fn authenticate(
        &self,
        username: Option<&str>,
        secret: Option<&[u8]>,
    ) -> Result<Authentication, AuthError> {
        // Role lookups still apply when auth is off
        if !self.enabled {
            return Ok(Authentication {
                username: username.map(str::to_string),
                role: username.and_then(|u| self.get_user_role(u).map(str::to_string)),
            });
        }

        let username = match username {
            Some(username) => username,
            None if self.allow_anonymous => return Ok(Authentication::anonymous()),
            None => return Err(AuthError::NotAuthorized),
        };

        let user = self.users.get(username).ok_or(AuthError::BadCredentials)?;
        if Self::verify_password(secret.unwrap_or(&[]), &user.credential)? {
            debug!("Authenticated user '{}'", username);
            Ok(Authentication {
                username: Some(username.to_string()),
                role: user.role.clone(),
            })
        } else {
            Err(AuthError::BadCredentials)
        }
    }
}
