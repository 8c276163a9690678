//! User directory
//!
//! Identity only: email, display name, password hash, admin flag. Token
//! balances live in the ledger, never here. Argon2 for password storage.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::core_types::UserId;

#[derive(Debug, Clone, Error)]
pub enum AccountError {
    #[error("email already registered")]
    EmailTaken,
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("password hashing failed: {0}")]
    Hash(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub email: String,
    pub name: String,
    pub password_hash: String,
    pub is_admin: bool,
    pub created_at_ms: u64,
}

pub fn hash_password(password: &str) -> Result<String, AccountError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AccountError::Hash(e.to_string()))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

/// In-memory user registry with email uniqueness.
pub struct UserDirectory {
    by_id: DashMap<UserId, UserRecord>,
    by_email: DashMap<String, UserId>,
    next_id: AtomicU64,
}

impl UserDirectory {
    pub fn new(next_id: UserId) -> Self {
        Self {
            by_id: DashMap::new(),
            by_email: DashMap::new(),
            next_id: AtomicU64::new(next_id),
        }
    }

    /// Recovery: install a persisted record verbatim.
    pub fn restore(&self, record: UserRecord) {
        self.by_email.insert(record.email.clone(), record.id);
        self.by_id.insert(record.id, record);
    }

    pub fn register(
        &self,
        email: &str,
        name: &str,
        password: &str,
        now_ms: u64,
    ) -> Result<UserRecord, AccountError> {
        let email = email.trim().to_ascii_lowercase();
        let password_hash = hash_password(password)?;

        // Claim the email first so two racing registrations cannot both win
        let entry = self.by_email.entry(email.clone());
        let record = match entry {
            dashmap::mapref::entry::Entry::Occupied(_) => return Err(AccountError::EmailTaken),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                slot.insert(id);
                UserRecord {
                    id,
                    email,
                    name: name.to_string(),
                    password_hash,
                    is_admin: false,
                    created_at_ms: now_ms,
                }
            }
        };
        self.by_id.insert(record.id, record.clone());
        tracing::info!(user_id = record.id, "user registered");
        Ok(record)
    }

    pub fn authenticate(&self, email: &str, password: &str) -> Result<UserRecord, AccountError> {
        let email = email.trim().to_ascii_lowercase();
        let record = self
            .by_email
            .get(&email)
            .and_then(|id| self.by_id.get(&id).map(|r| r.clone()))
            .ok_or(AccountError::InvalidCredentials)?;
        if verify_password(password, &record.password_hash) {
            Ok(record)
        } else {
            Err(AccountError::InvalidCredentials)
        }
    }

    pub fn get(&self, user_id: UserId) -> Option<UserRecord> {
        self.by_id.get(&user_id).map(|r| r.clone())
    }

    pub fn all(&self) -> Vec<UserRecord> {
        let mut out: Vec<_> = self.by_id.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|u| u.id);
        out
    }

    /// Grant or revoke the admin flag. Returns the updated record.
    pub fn set_admin(&self, user_id: UserId, is_admin: bool) -> Option<UserRecord> {
        self.by_id.get_mut(&user_id).map(|mut r| {
            r.is_admin = is_admin;
            r.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_authenticate() {
        let dir = UserDirectory::new(1);
        let user = dir.register("A@Example.com", "Alice", "hunter22", 0).unwrap();
        assert_eq!(user.email, "a@example.com");
        assert!(!user.is_admin);

        let logged_in = dir.authenticate("a@example.com", "hunter22").unwrap();
        assert_eq!(logged_in.id, user.id);
        assert!(matches!(
            dir.authenticate("a@example.com", "wrong"),
            Err(AccountError::InvalidCredentials)
        ));
    }

    #[test]
    fn duplicate_email_rejected() {
        let dir = UserDirectory::new(1);
        dir.register("a@example.com", "Alice", "pw", 0).unwrap();
        assert!(matches!(
            dir.register("A@EXAMPLE.COM", "Imposter", "pw", 1),
            Err(AccountError::EmailTaken)
        ));
    }

    #[test]
    fn set_admin_round_trip() {
        let dir = UserDirectory::new(1);
        let user = dir.register("a@example.com", "Alice", "pw", 0).unwrap();
        let updated = dir.set_admin(user.id, true).unwrap();
        assert!(updated.is_admin);
        assert!(dir.get(user.id).unwrap().is_admin);
    }
}
