//! Rotation keys and the key ring handed to the vault.
//!
//! A key ring is a set of named 32-byte AES keys plus the id of the key used
//! for new encryptions. Older keys stay configured until every credential
//! has been rotated off them.

use std::collections::HashMap;

use zeroize::Zeroize;

/// Key id assigned to the single-key `primary_key_env` setting.
pub const PRIMARY_KEY_ID: &str = "primary";

/// A named symmetric key. The bytes are wiped when dropped.
#[derive(Clone)]
pub struct RotationKey {
    id: String,
    key: [u8; 32],
}

impl RotationKey {
    pub fn new(id: impl Into<String>, key: [u8; 32]) -> Self {
        Self { id: id.into(), key }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Raw key bytes (use sparingly).
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl Drop for RotationKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for RotationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationKey")
            .field("id", &self.id)
            .field("key", &"[redacted]")
            .finish()
    }
}

/// The configured key set and the id of the current encryption key.
#[derive(Debug, Clone)]
pub struct KeyRing {
    current: String,
    keys: HashMap<String, RotationKey>,
}

impl KeyRing {
    /// Build a key ring; fails if `current` is not among `keys`.
    pub fn new(
        current: impl Into<String>,
        keys: impl IntoIterator<Item = (String, [u8; 32])>,
    ) -> Result<Self, String> {
        let current = current.into();
        let keys: HashMap<String, RotationKey> = keys
            .into_iter()
            .map(|(id, bytes)| (id.clone(), RotationKey::new(id, bytes)))
            .collect();

        if !keys.contains_key(&current) {
            return Err(format!("current key id '{}' is not configured", current));
        }
        Ok(Self { current, keys })
    }

    /// A ring holding one key, which is also current.
    pub fn single(id: impl Into<String>, key: [u8; 32]) -> Self {
        let id = id.into();
        let mut keys = HashMap::new();
        keys.insert(id.clone(), RotationKey::new(id.clone(), key));
        Self { current: id, keys }
    }

    pub fn current_id(&self) -> &str {
        &self.current
    }

    /// The key used for new encryptions.
    pub fn current(&self) -> &RotationKey {
        // `new` and `single` guarantee the current id is present.
        &self.keys[&self.current]
    }

    pub fn get(&self, id: &str) -> Option<&RotationKey> {
        self.keys.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.keys.contains_key(id)
    }

    /// Configured key ids, sorted.
    pub fn key_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.keys.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

/// Parse a 64-character hex string into a 32-byte key.
pub fn parse_hex_key(hex_key: &str) -> Result<[u8; 32], String> {
    let hex_key = hex_key.trim();
    if hex_key.len() != 64 {
        return Err(format!(
            "key must be 64 hex characters (32 bytes), got {} characters",
            hex_key.len()
        ));
    }
    let mut out = [0u8; 32];
    hex::decode_to_slice(hex_key, &mut out).map_err(|e| format!("key is not valid hex: {}", e))?;
    Ok(out)
}

/// Parse `keyId:hexKey` pairs separated by commas and/or whitespace.
pub fn parse_key_pairs(input: &str) -> Result<Vec<(String, [u8; 32])>, String> {
    let mut pairs = Vec::new();
    for item in input
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
    {
        let (id, hex_key) = item
            .split_once(':')
            .ok_or_else(|| "expected 'keyId:hexKey', got an entry without ':'".to_string())?;
        let id = id.trim();
        if id.is_empty() {
            return Err("key id must not be empty".into());
        }
        let key = parse_hex_key(hex_key).map_err(|e| format!("key '{}': {}", id, e))?;
        pairs.push((id.to_string(), key));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_parse_hex_key() {
        let key = parse_hex_key(KEY_A).unwrap();
        assert_eq!(key[0], 0x00);
        assert_eq!(key[31], 0x1f);

        assert!(parse_hex_key("00").is_err());
        assert!(parse_hex_key(&"g".repeat(64)).is_err());
    }

    #[test]
    fn test_parse_key_pairs_separators() {
        let input = format!("a:{}, b:{}\nc:{}", KEY_A, KEY_A, KEY_A);
        let pairs = parse_key_pairs(&input).unwrap();
        let ids: Vec<&str> = pairs.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_parse_key_pairs_errors() {
        assert!(parse_key_pairs(KEY_A).is_err());
        assert!(parse_key_pairs(&format!(":{}", KEY_A)).is_err());
        let err = parse_key_pairs("k1:abcd").unwrap_err();
        assert!(err.contains("k1"));
    }

    #[test]
    fn test_key_ring_rejects_unknown_current() {
        let key = parse_hex_key(KEY_A).unwrap();
        assert!(KeyRing::new("missing", vec![("k1".to_string(), key)]).is_err());

        let ring = KeyRing::new("k1", vec![("k1".to_string(), key)]).unwrap();
        assert_eq!(ring.current().id(), "k1");
        assert_eq!(ring.key_ids(), vec!["k1"]);
    }

    #[test]
    fn test_debug_redacts_key_bytes() {
        let ring = KeyRing::single("k1", [7u8; 32]);
        let debug = format!("{:?}", ring);
        assert!(debug.contains("k1"));
        assert!(debug.contains("redacted"));
        assert!(!debug.contains("7, 7"));
    }
}
