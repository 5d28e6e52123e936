//! Persistence of keys, issuers and their configuration.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use crate::commons::{PkiEmptyResult, PkiResult};
use crate::commons::crypto::Fingerprint;
use crate::commons::error::Error;
use crate::commons::storage::{Ident, KeyValueStore};
use crate::constants::{
    CONFIG_SCOPE, FINGERPRINT_INDEX_KEY, FINGERPRINT_INDEX_VERSION,
    ISSUERS_CONFIG_KEY, ISSUERS_SCOPE, ISSUER_FINGERPRINTS_SCOPE,
    KEYS_CONFIG_KEY, KEYS_SCOPE, KEY_FINGERPRINTS_SCOPE,
};
use super::entities::{Issuer, IssuerConfig, IssuerId, Key, KeyConfig, KeyId};


//------------ PkiStore ------------------------------------------------------

/// Typed access to the keys and issuers in a key-value store.
///
/// Each operation is a single read or write against the backend. Nothing
/// here spans several operations, so sequences of calls from different
/// threads may interleave.
///
/// Writes of keys and issuers also record the fingerprint of their
/// material in an index so that imports can find existing entries
/// without reading every record.
#[derive(Debug)]
pub struct PkiStore {
    kv: KeyValueStore,
}

impl PkiStore {
    pub fn new(kv: KeyValueStore) -> Self {
        PkiStore { kv }
    }

    pub fn kv(&self) -> &KeyValueStore {
        &self.kv
    }
}


/// # Keys
impl PkiStore {
    /// Stores a key, replacing any key with the same ID.
    pub fn write_key(&self, key: &Key) -> PkiEmptyResult {
        let ident = key.id.ident()?;
        self.kv.store(Some(KEYS_SCOPE), ident, key)?;
        match key.fingerprint() {
            Ok(fingerprint) => self.index_key(&fingerprint, &key.id)?,
            Err(err) => {
                warn!("Not indexing key '{}': {}", key.id, err);
            }
        }
        Ok(())
    }

    /// Returns the key with the given ID.
    ///
    /// An empty ID never refers to a key and results in
    /// [`Error::NotFound`].
    pub fn fetch_key_by_id(&self, id: &KeyId) -> PkiResult<Key> {
        if id.is_empty() {
            return Err(Error::not_found("key", id))
        }
        self.kv.get(Some(KEYS_SCOPE), id.ident()?)?.ok_or_else(|| {
            Error::not_found("key", id)
        })
    }

    pub fn list_keys(&self) -> PkiResult<Vec<KeyId>> {
        Ok(
            self.kv.list_keys(Some(KEYS_SCOPE))?
                .iter().map(|ident| KeyId::from(&**ident)).collect()
        )
    }

    /// Removes a key.
    ///
    /// This does not check whether issuers still use the key. If another
    /// key with the same material remains, the index moves to it.
    pub fn delete_key(&self, id: &KeyId) -> PkiEmptyResult {
        let key = self.fetch_key_by_id(id)?;
        self.kv.drop_key(Some(KEYS_SCOPE), id.ident()?)?;
        let Ok(fingerprint) = key.fingerprint() else {
            return Ok(())
        };
        if self.indexed_key(&fingerprint)?.as_ref() == Some(id) {
            match self.scan_keys(&fingerprint)? {
                Some(other) => self.index_key(&fingerprint, &other.id)?,
                None => self.drop_key_index(&fingerprint)?,
            }
        }
        Ok(())
    }
}


/// # Issuers
impl PkiStore {
    /// Stores an issuer, replacing any issuer with the same ID.
    pub fn write_issuer(&self, issuer: &Issuer) -> PkiEmptyResult {
        let ident = issuer.id.ident()?;
        self.kv.store(Some(ISSUERS_SCOPE), ident, issuer)?;
        match issuer.fingerprint() {
            Ok(fingerprint) => self.index_issuer(&fingerprint, &issuer.id)?,
            Err(err) => {
                warn!("Not indexing issuer '{}': {}", issuer.id, err);
            }
        }
        Ok(())
    }

    /// Returns the issuer with the given ID.
    ///
    /// An empty ID never refers to a issuer and results in
    /// [`Error::NotFound`].
    pub fn fetch_issuer_by_id(&self, id: &IssuerId) -> PkiResult<Issuer> {
        if id.is_empty() {
            return Err(Error::not_found("issuer", id))
        }
        self.kv.get(Some(ISSUERS_SCOPE), id.ident()?)?.ok_or_else(|| {
            Error::not_found("issuer", id)
        })
    }

    pub fn list_issuers(&self) -> PkiResult<Vec<IssuerId>> {
        Ok(
            self.kv.list_keys(Some(ISSUERS_SCOPE))?
                .iter().map(|ident| IssuerId::from(&**ident)).collect()
        )
    }

    pub fn delete_issuer(&self, id: &IssuerId) -> PkiEmptyResult {
        let issuer = self.fetch_issuer_by_id(id)?;
        self.kv.drop_key(Some(ISSUERS_SCOPE), id.ident()?)?;
        let Ok(fingerprint) = issuer.fingerprint() else {
            return Ok(())
        };
        if self.indexed_issuer(&fingerprint)?.as_ref() == Some(id) {
            match self.scan_issuers(&fingerprint)? {
                Some(other) => self.index_issuer(&fingerprint, &other.id)?,
                None => self.drop_issuer_index(&fingerprint)?,
            }
        }
        Ok(())
    }
}


/// # Configuration
impl PkiStore {
    /// Returns the key configuration, empty if it was never set.
    pub fn get_keys_config(&self) -> PkiResult<KeyConfig> {
        Ok(
            self.kv.get(Some(CONFIG_SCOPE), KEYS_CONFIG_KEY)?
                .unwrap_or_default()
        )
    }

    pub fn set_keys_config(&self, config: &KeyConfig) -> PkiEmptyResult {
        Ok(self.kv.store(Some(CONFIG_SCOPE), KEYS_CONFIG_KEY, config)?)
    }

    /// Returns the issuer configuration, empty if it was never set.
    pub fn get_issuers_config(&self) -> PkiResult<IssuerConfig> {
        Ok(
            self.kv.get(Some(CONFIG_SCOPE), ISSUERS_CONFIG_KEY)?
                .unwrap_or_default()
        )
    }

    pub fn set_issuers_config(&self, config: &IssuerConfig) -> PkiEmptyResult {
        Ok(self.kv.store(Some(CONFIG_SCOPE), ISSUERS_CONFIG_KEY, config)?)
    }
}


/// # Fingerprint index
impl PkiStore {
    pub(super) fn indexed_key(
        &self, fingerprint: &Fingerprint
    ) -> PkiResult<Option<KeyId>> {
        Ok(
            self.kv.get::<String>(
                Some(KEY_FINGERPRINTS_SCOPE), fingerprint.as_ident()
            )?.map(KeyId::from)
        )
    }

    pub(super) fn indexed_issuer(
        &self, fingerprint: &Fingerprint
    ) -> PkiResult<Option<IssuerId>> {
        Ok(
            self.kv.get::<String>(
                Some(ISSUER_FINGERPRINTS_SCOPE), fingerprint.as_ident()
            )?.map(IssuerId::from)
        )
    }

    pub(super) fn index_key(
        &self, fingerprint: &Fingerprint, id: &KeyId
    ) -> PkiEmptyResult {
        Ok(self.kv.store(
            Some(KEY_FINGERPRINTS_SCOPE), fingerprint.as_ident(), &id.as_str()
        )?)
    }

    pub(super) fn index_issuer(
        &self, fingerprint: &Fingerprint, id: &IssuerId
    ) -> PkiEmptyResult {
        Ok(self.kv.store(
            Some(ISSUER_FINGERPRINTS_SCOPE), fingerprint.as_ident(),
            &id.as_str()
        )?)
    }

    pub(super) fn drop_key_index(
        &self, fingerprint: &Fingerprint
    ) -> PkiEmptyResult {
        self.drop_index(KEY_FINGERPRINTS_SCOPE, fingerprint)
    }

    pub(super) fn drop_issuer_index(
        &self, fingerprint: &Fingerprint
    ) -> PkiEmptyResult {
        self.drop_index(ISSUER_FINGERPRINTS_SCOPE, fingerprint)
    }

    fn drop_index(
        &self, scope: &Ident, fingerprint: &Fingerprint
    ) -> PkiEmptyResult {
        if self.kv.has(Some(scope), fingerprint.as_ident())? {
            self.kv.drop_key(Some(scope), fingerprint.as_ident())?;
        }
        Ok(())
    }

    /// Reads all keys looking for one with the given fingerprint.
    ///
    /// This is the fallback for when the index has no usable entry.
    pub(super) fn scan_keys(
        &self, fingerprint: &Fingerprint
    ) -> PkiResult<Option<Key>> {
        for id in self.list_keys()? {
            let key = match self.fetch_key_by_id(&id) {
                Ok(key) => key,
                Err(Error::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            if key.fingerprint().ok().as_ref() == Some(fingerprint) {
                return Ok(Some(key))
            }
        }
        Ok(None)
    }

    /// Reads all issuers looking for one with the given fingerprint.
    pub(super) fn scan_issuers(
        &self, fingerprint: &Fingerprint
    ) -> PkiResult<Option<Issuer>> {
        for id in self.list_issuers()? {
            let issuer = match self.fetch_issuer_by_id(&id) {
                Ok(issuer) => issuer,
                Err(Error::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            if issuer.fingerprint().ok().as_ref() == Some(fingerprint) {
                return Ok(Some(issuer))
            }
        }
        Ok(None)
    }

    /// Makes sure the fingerprint index covers all records.
    ///
    /// Records written before the index existed are not in it. The first
    /// call on such a store indexes every key and issuer and then records
    /// the index version so later calls are a single read.
    pub(super) fn ensure_fingerprint_index(&self) -> PkiEmptyResult {
        let state: Option<IndexState> = self.kv.get(
            Some(CONFIG_SCOPE), FINGERPRINT_INDEX_KEY
        )?;
        if state.is_some_and(|state| {
            state.version >= FINGERPRINT_INDEX_VERSION
        }) {
            return Ok(())
        }

        debug!("Building fingerprint index in '{}'", self.kv.namespace());
        for id in self.list_keys()? {
            let key = match self.fetch_key_by_id(&id) {
                Ok(key) => key,
                Err(Error::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            match key.fingerprint() {
                Ok(fingerprint) => self.index_key(&fingerprint, &id)?,
                Err(err) => warn!("Not indexing key '{id}': {err}"),
            }
        }
        for id in self.list_issuers()? {
            let issuer = match self.fetch_issuer_by_id(&id) {
                Ok(issuer) => issuer,
                Err(Error::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            match issuer.fingerprint() {
                Ok(fingerprint) => self.index_issuer(&fingerprint, &id)?,
                Err(err) => warn!("Not indexing issuer '{id}': {err}"),
            }
        }

        self.kv.store(
            Some(CONFIG_SCOPE), FINGERPRINT_INDEX_KEY,
            &IndexState { version: FINGERPRINT_INDEX_VERSION }
        )?;
        Ok(())
    }
}


//------------ IndexState ----------------------------------------------------

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct IndexState {
    version: u32,
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::test;
    use super::*;

    #[test]
    fn configs_round_trip() {
        let store = test::mem_store();

        let empty = store.get_keys_config().unwrap();
        assert!(empty.default.is_empty());
        let empty = store.get_issuers_config().unwrap();
        assert!(empty.default.is_empty());

        let key_config = KeyConfig { default: KeyId::generate() };
        store.set_keys_config(&key_config).unwrap();
        assert_eq!(store.get_keys_config().unwrap(), key_config);

        let issuer_config = IssuerConfig { default: IssuerId::generate() };
        store.set_issuers_config(&issuer_config).unwrap();
        assert_eq!(store.get_issuers_config().unwrap(), issuer_config);
    }

    #[test]
    fn issuer_round_trip() {
        let store = test::mem_store();
        let (issuer, key) = test::gen_issuer_and_key("example.com");

        store.write_key(&key).unwrap();
        store.write_issuer(&issuer).unwrap();

        let fetched = store.fetch_issuer_by_id(&issuer.id).unwrap();
        assert_eq!(fetched, issuer);
        let fetched = store.fetch_key_by_id(&key.id).unwrap();
        assert_eq!(fetched, key);

        assert_eq!(store.list_issuers().unwrap(), vec![issuer.id.clone()]);
        assert_eq!(store.list_keys().unwrap(), vec![key.id.clone()]);
    }

    #[test]
    fn write_replaces_existing() {
        let store = test::mem_store();
        let (_, mut key) = test::gen_issuer_and_key("example.com");
        store.write_key(&key).unwrap();

        key.name = "renamed".into();
        store.write_key(&key).unwrap();
        assert_eq!(store.fetch_key_by_id(&key.id).unwrap().name, "renamed");
        assert_eq!(store.list_keys().unwrap().len(), 1);
    }

    #[test]
    fn fetch_missing_is_not_found() {
        let store = test::mem_store();
        assert!(matches!(
            store.fetch_key_by_id(&KeyId::generate()),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            store.fetch_issuer_by_id(&IssuerId::generate()),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            store.delete_key(&KeyId::generate()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn empty_id_is_not_found() {
        let store = test::mem_store();
        assert!(matches!(
            store.fetch_key_by_id(&KeyId::default()),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            store.fetch_issuer_by_id(&IssuerId::default()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn invalid_id_is_malformed() {
        let store = test::mem_store();
        assert!(matches!(
            store.fetch_key_by_id(&KeyId::from("a/b")),
            Err(Error::MalformedRequest(_))
        ));
        let key = Key { id: KeyId::default(), ..Default::default() };
        assert!(matches!(
            store.write_key(&key), Err(Error::MalformedRequest(_))
        ));
    }

    #[test]
    fn corrupt_record_is_corruption() {
        let store = test::mem_store();
        let id = KeyId::generate();
        store.kv().store(
            Some(KEYS_SCOPE), id.ident().unwrap(), &vec![1, 2, 3]
        ).unwrap();
        assert!(matches!(
            store.fetch_key_by_id(&id), Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn write_and_delete_maintain_index() {
        let store = test::mem_store();
        let (issuer, key) = test::gen_issuer_and_key("example.com");
        store.write_key(&key).unwrap();
        store.write_issuer(&issuer).unwrap();

        let key_fp = key.fingerprint().unwrap();
        let issuer_fp = issuer.fingerprint().unwrap();
        assert_eq!(store.indexed_key(&key_fp).unwrap(), Some(key.id.clone()));
        assert_eq!(
            store.indexed_issuer(&issuer_fp).unwrap(), Some(issuer.id.clone())
        );

        store.delete_issuer(&issuer.id).unwrap();
        store.delete_key(&key.id).unwrap();
        assert_eq!(store.indexed_key(&key_fp).unwrap(), None);
        assert_eq!(store.indexed_issuer(&issuer_fp).unwrap(), None);
        assert!(store.list_keys().unwrap().is_empty());
        assert!(store.list_issuers().unwrap().is_empty());
    }

    #[test]
    fn index_is_built_for_unindexed_records() {
        let store = test::mem_store();
        let (issuer, key) = test::gen_issuer_and_key("example.com");

        // Write around the store so that nothing gets indexed.
        store.kv().store(
            Some(KEYS_SCOPE), key.id.ident().unwrap(), &key
        ).unwrap();
        store.kv().store(
            Some(ISSUERS_SCOPE), issuer.id.ident().unwrap(), &issuer
        ).unwrap();
        let key_fp = key.fingerprint().unwrap();
        assert_eq!(store.indexed_key(&key_fp).unwrap(), None);

        store.ensure_fingerprint_index().unwrap();
        assert_eq!(store.indexed_key(&key_fp).unwrap(), Some(key.id.clone()));
        assert_eq!(
            store.indexed_issuer(&issuer.fingerprint().unwrap()).unwrap(),
            Some(issuer.id.clone())
        );
    }

    #[test]
    fn works_on_disk() {
        test::test_under_tmp(|dir| {
            let store = test::disk_store(&dir);
            let (issuer, key) = test::gen_issuer_and_key("example.com");
            store.write_key(&key).unwrap();
            store.write_issuer(&issuer).unwrap();
            assert_eq!(store.fetch_issuer_by_id(&issuer.id).unwrap(), issuer);
            assert_eq!(store.fetch_key_by_id(&key.id).unwrap(), key);
        })
    }
}
