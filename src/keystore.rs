use std::collections::BTreeMap;

use tracing::debug;

use crate::error::KrbError;
use crate::keytab::{Keytab, KeytabEntry};
use crate::proto::DerivedKey;

/// Long-term keys by principal. Servers only ever read from this.
pub trait PrincipalStore: Send + Sync {
    fn lookup(&self, principal: &str) -> Result<DerivedKey, KrbError>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryKeyStore {
    keys: BTreeMap<String, DerivedKey>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, principal: &str, key: DerivedKey) -> Option<DerivedKey> {
        self.keys.insert(principal.to_string(), key)
    }

    /// Insert a principal with a key derived from its passphrase. The principal
    /// name is the salt.
    pub fn insert_passphrase(&mut self, principal: &str, passphrase: &str) -> Result<(), KrbError> {
        let key = DerivedKey::new_aes256_cts_hmac_sha1_96(passphrase, principal, None)?;
        self.insert(principal, key);
        Ok(())
    }

    /// Where a keytab holds several versions of a key, the highest kvno wins.
    pub fn from_keytab(keytab: &Keytab) -> Self {
        let mut latest: BTreeMap<&str, &KeytabEntry> = BTreeMap::new();
        for entry in keytab.entries() {
            latest
                .entry(entry.principal.as_str())
                .and_modify(|cur| {
                    if entry.kvno > cur.kvno {
                        *cur = entry
                    }
                })
                .or_insert(entry);
        }

        latest
            .into_values()
            .map(|e| (e.principal.clone(), e.key.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl FromIterator<(String, DerivedKey)> for MemoryKeyStore {
    fn from_iter<I: IntoIterator<Item = (String, DerivedKey)>>(iter: I) -> Self {
        MemoryKeyStore {
            keys: iter.into_iter().collect(),
        }
    }
}

impl PrincipalStore for MemoryKeyStore {
    fn lookup(&self, principal: &str) -> Result<DerivedKey, KrbError> {
        self.keys.get(principal).cloned().ok_or_else(|| {
            debug!(%principal, "principal not found");
            KrbError::UnknownPrincipal
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryKeyStore, PrincipalStore};
    use crate::error::KrbError;
    use crate::keytab::{Keytab, KeytabEntry};
    use crate::proto::DerivedKey;

    fn raw(byte: u8) -> DerivedKey {
        DerivedKey::try_from([byte; 32].as_slice()).unwrap()
    }

    #[test]
    fn test_lookup() {
        let mut store = MemoryKeyStore::new();
        store.insert("krbtgt", raw(1));
        store
            .insert_passphrase("alice", "correct horse battery staple")
            .unwrap();

        assert_eq!(store.lookup("krbtgt").unwrap(), raw(1));
        assert!(store.lookup("alice").is_ok());
        assert_eq!(store.lookup("mallory"), Err(KrbError::UnknownPrincipal));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_from_keytab_latest_kvno() {
        let keytab = Keytab::File(vec![
            KeytabEntry {
                principal: "host/files".to_string(),
                key: raw(2),
                kvno: 2,
            },
            KeytabEntry {
                principal: "host/files".to_string(),
                key: raw(3),
                kvno: 3,
            },
            KeytabEntry {
                principal: "host/files".to_string(),
                key: raw(1),
                kvno: 1,
            },
        ]);

        let store = MemoryKeyStore::from_keytab(&keytab);
        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup("host/files").unwrap(), raw(3));
    }
}
