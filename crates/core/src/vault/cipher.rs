//! AES-256-GCM sealing for stored credentials.
//!
//! Every seal draws a fresh random 96-bit nonce. The 128-bit tag is stored
//! apart from the ciphertext, and the associated data binds a sealed token
//! to the user and provider it belongs to, so a row copied onto another
//! user fails authentication.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};

use super::keyring::RotationKey;

const TAG_LEN: usize = 16;

/// Output of one encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; 12],
    pub auth_tag: [u8; 16],
}

/// Associated data for a user's credential with a provider.
pub fn associated_data(provider: &str, user_id: &str) -> Vec<u8> {
    format!("{}:{}", provider, user_id).into_bytes()
}

/// Encrypt `plaintext` under `key`.
pub fn seal(key: &RotationKey, plaintext: &[u8], aad: &[u8]) -> Result<Sealed, String> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut combined = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| e.to_string())?;

    // AES-GCM appends the tag to the ciphertext.
    if combined.len() < TAG_LEN {
        return Err("ciphertext shorter than the authentication tag".into());
    }
    let tag_start = combined.len() - TAG_LEN;
    let auth_tag: [u8; 16] = combined[tag_start..]
        .try_into()
        .map_err(|_| "invalid tag length".to_string())?;
    combined.truncate(tag_start);

    Ok(Sealed {
        ciphertext: combined,
        nonce: nonce.into(),
        auth_tag,
    })
}

/// Decrypt and authenticate a sealed value. Returns `None` if the key, the
/// associated data, or any stored byte does not match.
pub fn open(key: &RotationKey, sealed: &Sealed, aad: &[u8]) -> Option<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let mut combined = Vec::with_capacity(sealed.ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(&sealed.ciphertext);
    combined.extend_from_slice(&sealed.auth_tag);

    cipher
        .decrypt(
            Nonce::from_slice(&sealed.nonce),
            Payload {
                msg: &combined,
                aad,
            },
        )
        .ok()
}
