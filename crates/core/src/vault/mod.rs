//! Encrypted credential vault.
//!
//! Stores one provider access token per user, sealed with AES-256-GCM under
//! the key ring's current key. Each stored credential records the id of the
//! key that sealed it, so old keys can be retired after [`CredentialVault::rotate`]
//! or [`CredentialVault::rotate_all`] has moved every credential forward.

pub mod cipher;
pub mod keyring;

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::db::queries::CredentialRow;
use crate::db::Database;
use crate::errors::VaultError;

use self::cipher::Sealed;
use self::keyring::KeyRing;

/// Result of re-encrypting one user's credential during [`CredentialVault::rotate_all`].
#[derive(Debug)]
pub struct RotationReport {
    pub user_id: String,
    pub result: Result<RotationOutcome, VaultError>,
}

/// What happened to a credential during rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// Re-encrypted from `from` to the current key.
    Rotated { from: String },
    /// Already sealed with the current key; the nonce was still refreshed.
    Refreshed,
}

/// Credential vault bound to one provider and key ring.
pub struct CredentialVault {
    db: Arc<Database>,
    keys: KeyRing,
    provider: String,
}

impl CredentialVault {
    pub fn new(db: Arc<Database>, keys: KeyRing, provider: impl Into<String>) -> Self {
        Self {
            db,
            keys,
            provider: provider.into(),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn key_ring(&self) -> &KeyRing {
        &self.keys
    }

    /// Encrypt and store a token, replacing any prior credential.
    pub fn connect(&self, user_id: &str, raw_token: &str) -> Result<(), VaultError> {
        if raw_token.trim().is_empty() {
            return Err(VaultError::Validation("token must not be empty".into()));
        }

        let row = self.seal_row(user_id, raw_token.as_bytes())?;
        self.db.put_credential(&row)?;
        self.db.ensure_sync_state(user_id)?;

        info!(user_id, key_id = %row.key_id, "credential stored");
        Ok(())
    }

    /// Delete the user's credential. Mappings and conflicts are kept.
    pub fn disconnect(&self, user_id: &str) -> Result<(), VaultError> {
        if !self.db.delete_credential(user_id, &self.provider)? {
            return Err(VaultError::NotConnected(user_id.to_string()));
        }
        info!(user_id, "credential deleted");
        Ok(())
    }

    pub fn is_connected(&self, user_id: &str) -> Result<bool, VaultError> {
        Ok(self.db.get_credential(user_id, &self.provider)?.is_some())
    }

    /// Decrypt the user's token.
    pub fn get_token(&self, user_id: &str) -> Result<Zeroizing<String>, VaultError> {
        let row = self.load(user_id)?;
        let plaintext = self.open_row(&row)?;
        String::from_utf8(plaintext.to_vec())
            .map(Zeroizing::new)
            .map_err(|_| VaultError::DecryptionFailed {
                key_id: row.key_id.clone(),
            })
    }

    /// Re-encrypt the user's credential with the current key.
    ///
    /// The replacement is a single conditional update, so a concurrent
    /// `connect` is never overwritten with a stale token.
    pub fn rotate(&self, user_id: &str) -> Result<RotationOutcome, VaultError> {
        let row = self.load(user_id)?;
        self.rotate_row(&row)
    }

    /// Rotate every stored credential, continuing past individual failures.
    pub fn rotate_all(&self) -> Result<Vec<RotationReport>, VaultError> {
        let rows = self.db.list_credentials(&self.provider)?;
        info!(count = rows.len(), current_key = %self.keys.current_id(), "rotating all credentials");

        let reports = rows
            .iter()
            .map(|row| {
                let result = self.rotate_row(row);
                if let Err(ref e) = result {
                    warn!(user_id = %row.user_id, error = %e, "credential rotation failed");
                }
                RotationReport {
                    user_id: row.user_id.clone(),
                    result,
                }
            })
            .collect();
        Ok(reports)
    }

    /// Credentials sealed with a key id that is not configured, as
    /// `(user_id, key_id)` pairs. Those users must reconnect.
    pub fn unreadable_credentials(&self) -> Result<Vec<(String, String)>, VaultError> {
        let rows = self.db.list_credentials(&self.provider)?;
        Ok(rows
            .into_iter()
            .filter(|row| !self.keys.contains(&row.key_id))
            .map(|row| (row.user_id, row.key_id))
            .collect())
    }

    // -- internals ----------------------------------------------------------

    fn load(&self, user_id: &str) -> Result<CredentialRow, VaultError> {
        self.db
            .get_credential(user_id, &self.provider)?
            .ok_or_else(|| VaultError::NotConnected(user_id.to_string()))
    }

    fn rotate_row(&self, row: &CredentialRow) -> Result<RotationOutcome, VaultError> {
        let plaintext = self.open_row(row)?;
        let next = self.seal_row(&row.user_id, &plaintext)?;

        if !self.db.replace_credential(row, &next)? {
            // Replaced or removed since we read it; nothing stale to rotate.
            return Err(VaultError::NotConnected(row.user_id.clone()));
        }

        let outcome = if row.key_id == next.key_id {
            RotationOutcome::Refreshed
        } else {
            RotationOutcome::Rotated {
                from: row.key_id.clone(),
            }
        };
        info!(user_id = %row.user_id, from = %row.key_id, to = %next.key_id, "credential rotated");
        Ok(outcome)
    }

    fn seal_row(&self, user_id: &str, plaintext: &[u8]) -> Result<CredentialRow, VaultError> {
        let key = self.keys.current();
        let aad = cipher::associated_data(&self.provider, user_id);
        let sealed = cipher::seal(key, plaintext, &aad).map_err(VaultError::EncryptionFailed)?;

        Ok(CredentialRow {
            user_id: user_id.to_string(),
            provider: self.provider.clone(),
            key_id: key.id().to_string(),
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce.to_vec(),
            auth_tag: sealed.auth_tag.to_vec(),
            created_at: Utc::now().to_rfc3339(),
        })
    }

    fn open_row(&self, row: &CredentialRow) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let key = self.keys.get(&row.key_id).ok_or_else(|| {
            warn!(user_id = %row.user_id, key_id = %row.key_id, "credential key id not configured");
            VaultError::UnknownKey {
                key_id: row.key_id.clone(),
            }
        })?;

        let failed = || VaultError::DecryptionFailed {
            key_id: row.key_id.clone(),
        };
        let sealed = Sealed {
            ciphertext: row.ciphertext.clone(),
            nonce: row.nonce.as_slice().try_into().map_err(|_| failed())?,
            auth_tag: row.auth_tag.as_slice().try_into().map_err(|_| failed())?,
        };

        let aad = cipher::associated_data(&self.provider, &row.user_id);
        let plaintext = cipher::open(key, &sealed, &aad).ok_or_else(failed)?;
        debug!(user_id = %row.user_id, key_id = %row.key_id, "credential decrypted");
        Ok(Zeroizing::new(plaintext))
    }
}
