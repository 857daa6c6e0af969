use crate::constants::{
    AES_256_KEY_LEN, MINIMUM_PASSPHRASE_LEN, PBKDF2_SHA1_ITER, PBKDF2_SHA1_ITER_MINIMUM,
};
use crate::crypto::{
    decrypt_aes256_cts_hmac_sha1_96, derive_key_aes256_cts_hmac_sha1_96,
    encrypt_aes256_cts_hmac_sha1_96,
};
use crate::error::KrbError;
use rand::Rng;
use std::fmt;

/// A principal's long-term key. Either loaded as raw key material, or derived from a
/// passphrase with the principal name as salt.
#[derive(Clone)]
pub enum DerivedKey {
    Aes256CtsHmacSha196 {
        k: [u8; AES_256_KEY_LEN],
        i: u32,
        s: String,
    },
}

impl DerivedKey {
    pub fn k(&self) -> Vec<u8> {
        match self {
            DerivedKey::Aes256CtsHmacSha196 { k, .. } => k.to_vec(),
        }
    }

    pub fn new_aes256_cts_hmac_sha1_96(
        passphrase: &str,
        salt: &str,
        iter_count: Option<u32>,
    ) -> Result<Self, KrbError> {
        if passphrase.len() < MINIMUM_PASSPHRASE_LEN {
            // The string to key function is only as good as the passphrase and the
            // pbkdf2 rounds, so we require both to be reasonable.
            return Err(KrbError::InsecurePassphrase);
        }
        let iter_count = iter_count
            .unwrap_or(PBKDF2_SHA1_ITER)
            .clamp(PBKDF2_SHA1_ITER_MINIMUM, u32::MAX);

        let k =
            derive_key_aes256_cts_hmac_sha1_96(passphrase.as_bytes(), salt.as_bytes(), iter_count);

        Ok(DerivedKey::Aes256CtsHmacSha196 {
            k,
            i: iter_count,
            s: salt.to_string(),
        })
    }

    pub(crate) fn encrypt(&self, plaintext: &[u8], key_usage: u32) -> Result<Vec<u8>, KrbError> {
        match self {
            DerivedKey::Aes256CtsHmacSha196 { k, .. } => {
                encrypt_aes256_cts_hmac_sha1_96(k, plaintext, key_usage)
            }
        }
    }

    pub(crate) fn decrypt(&self, ciphertext: &[u8], key_usage: u32) -> Result<Vec<u8>, KrbError> {
        match self {
            DerivedKey::Aes256CtsHmacSha196 { k, .. } => {
                decrypt_aes256_cts_hmac_sha1_96(k, ciphertext, key_usage)
            }
        }
    }
}

/// Raw key material, as found in a keytab or a hex encoded configuration value.
impl TryFrom<&[u8]> for DerivedKey {
    type Error = KrbError;

    fn try_from(key: &[u8]) -> Result<Self, Self::Error> {
        let k: [u8; AES_256_KEY_LEN] = key.try_into().map_err(|_| {
            tracing::error!(key_len = %key.len(), expected = %AES_256_KEY_LEN);
            KrbError::InvalidEncryptionKey
        })?;
        Ok(DerivedKey::Aes256CtsHmacSha196 {
            k,
            i: 0,
            s: String::new(),
        })
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("DerivedKey");
        match self {
            DerivedKey::Aes256CtsHmacSha196 { i, s, .. } => builder
                .field("k", &"Aes256HmacSha1")
                .field("i", i)
                .field("s", s),
        }
        .finish()
    }
}

impl PartialEq for DerivedKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                DerivedKey::Aes256CtsHmacSha196 { k: a, .. },
                DerivedKey::Aes256CtsHmacSha196 { k: b, .. },
            ) => a == b,
        }
    }
}

impl Eq for DerivedKey {}

/// A short lived key shared between a client and exactly one server.
#[derive(Clone, PartialEq, Eq)]
pub enum SessionKey {
    Aes256CtsHmacSha196 { k: [u8; AES_256_KEY_LEN] },
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("SessionKey");
        match self {
            SessionKey::Aes256CtsHmacSha196 { .. } => builder.field("k", &"Aes256"),
        }
        .finish()
    }
}

impl SessionKey {
    pub fn generate() -> Self {
        let mut k = [0u8; AES_256_KEY_LEN];
        rand::rng().fill(&mut k);
        SessionKey::Aes256CtsHmacSha196 { k }
    }

    pub fn k(&self) -> &[u8; AES_256_KEY_LEN] {
        match self {
            SessionKey::Aes256CtsHmacSha196 { k } => k,
        }
    }

    pub(crate) fn from_bytes(k: [u8; AES_256_KEY_LEN]) -> Self {
        SessionKey::Aes256CtsHmacSha196 { k }
    }

    pub(crate) fn encrypt(&self, plaintext: &[u8], key_usage: u32) -> Result<Vec<u8>, KrbError> {
        match self {
            SessionKey::Aes256CtsHmacSha196 { k } => {
                encrypt_aes256_cts_hmac_sha1_96(k, plaintext, key_usage)
            }
        }
    }

    pub(crate) fn decrypt(&self, ciphertext: &[u8], key_usage: u32) -> Result<Vec<u8>, KrbError> {
        match self {
            SessionKey::Aes256CtsHmacSha196 { k } => {
                decrypt_aes256_cts_hmac_sha1_96(k, ciphertext, key_usage)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DerivedKey, SessionKey};
    use crate::constants::PBKDF2_SHA1_ITER_MINIMUM;
    use crate::error::KrbError;

    #[test]
    fn test_derived_key() {
        let _ = tracing_subscriber::fmt::try_init();

        let a = DerivedKey::new_aes256_cts_hmac_sha1_96(
            "a-secure-password",
            "alice",
            Some(PBKDF2_SHA1_ITER_MINIMUM),
        )
        .unwrap();

        let b = DerivedKey::new_aes256_cts_hmac_sha1_96(
            "a-secure-password",
            "bob",
            Some(PBKDF2_SHA1_ITER_MINIMUM),
        )
        .unwrap();

        // The principal name salts the key.
        assert_ne!(a, b);
        assert_eq!(a.k().len(), 32);
    }

    #[test]
    fn test_derived_key_low_iterations_clamped() {
        let low = DerivedKey::new_aes256_cts_hmac_sha1_96("a-secure-password", "alice", Some(1))
            .unwrap();
        let min = DerivedKey::new_aes256_cts_hmac_sha1_96(
            "a-secure-password",
            "alice",
            Some(PBKDF2_SHA1_ITER_MINIMUM),
        )
        .unwrap();
        assert_eq!(low, min);

        let DerivedKey::Aes256CtsHmacSha196 { i, .. } = low;
        assert_eq!(i, PBKDF2_SHA1_ITER_MINIMUM);
    }

    #[test]
    fn test_derived_key_short_passphrase() {
        assert!(matches!(
            DerivedKey::new_aes256_cts_hmac_sha1_96("password", "alice", None),
            Err(KrbError::InsecurePassphrase)
        ));
    }

    #[test]
    fn test_raw_key_length() {
        assert!(DerivedKey::try_from([7u8; 32].as_slice()).is_ok());
        assert!(matches!(
            DerivedKey::try_from([7u8; 16].as_slice()),
            Err(KrbError::InvalidEncryptionKey)
        ));
    }

    #[test]
    fn test_session_keys_are_fresh_and_redacted() {
        let a = SessionKey::generate();
        let b = SessionKey::generate();
        assert_ne!(a, b);

        let dbg = format!("{:?}", a);
        assert!(!dbg.contains(&hex::encode(a.k())));
        assert!(!dbg.contains(&format!("{:?}", a.k())));
    }
}
