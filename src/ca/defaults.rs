//! Default key and issuer handling and reference resolution.

use log::{debug, info};
use crate::commons::{PkiEmptyResult, PkiResult};
use crate::commons::error::Error;
use crate::constants::DEFAULT_REF;
use super::entities::{IssuerConfig, IssuerId, KeyConfig, KeyId};
use super::store::PkiStore;


//------------ DefaultResolver -----------------------------------------------

/// Reads and updates the default key and issuer of a store.
///
/// Claiming a default when none is set is a read followed by a write. Two
/// concurrent claims can both see no default and both write, in which case
/// the last write wins.
#[derive(Clone, Copy, Debug)]
pub struct DefaultResolver<'a> {
    store: &'a PkiStore,
}

impl<'a> DefaultResolver<'a> {
    pub fn new(store: &'a PkiStore) -> Self {
        DefaultResolver { store }
    }

    /// Returns the default key, if one is set.
    pub fn default_key(&self) -> PkiResult<Option<KeyId>> {
        let config = self.store.get_keys_config()?;
        Ok((!config.default.is_empty()).then_some(config.default))
    }

    /// Returns the default issuer, if one is set.
    pub fn default_issuer(&self) -> PkiResult<Option<IssuerId>> {
        let config = self.store.get_issuers_config()?;
        Ok((!config.default.is_empty()).then_some(config.default))
    }

    /// Makes an existing key the default.
    pub fn set_default_key(&self, id: &KeyId) -> PkiEmptyResult {
        self.store.fetch_key_by_id(id)?;
        self.store.set_keys_config(&KeyConfig { default: id.clone() })?;
        info!("Default key set to '{id}'");
        Ok(())
    }

    /// Makes an existing issuer the default.
    pub fn set_default_issuer(&self, id: &IssuerId) -> PkiEmptyResult {
        self.store.fetch_issuer_by_id(id)?;
        self.store.set_issuers_config(&IssuerConfig { default: id.clone() })?;
        info!("Default issuer set to '{id}'");
        Ok(())
    }

    /// Makes the key the default if there is no default yet.
    ///
    /// Returns whether the key became the default.
    pub fn claim_default_key(&self, id: &KeyId) -> PkiResult<bool> {
        if self.default_key()?.is_some() {
            return Ok(false)
        }
        self.store.set_keys_config(&KeyConfig { default: id.clone() })?;
        debug!("Key '{id}' is now the default key");
        Ok(true)
    }

    /// Makes the issuer the default if there is no default yet.
    ///
    /// Returns whether the issuer became the default.
    pub fn claim_default_issuer(&self, id: &IssuerId) -> PkiResult<bool> {
        if self.default_issuer()?.is_some() {
            return Ok(false)
        }
        self.store.set_issuers_config(
            &IssuerConfig { default: id.clone() }
        )?;
        debug!("Issuer '{id}' is now the default issuer");
        Ok(true)
    }

    /// Clears the default key if it is `id`.
    pub fn clear_default_key(&self, id: &KeyId) -> PkiEmptyResult {
        if self.default_key()?.as_ref() == Some(id) {
            self.store.set_keys_config(&KeyConfig::default())?;
            info!("Cleared default key '{id}'");
        }
        Ok(())
    }

    /// Clears the default issuer if it is `id`.
    pub fn clear_default_issuer(&self, id: &IssuerId) -> PkiEmptyResult {
        if self.default_issuer()?.as_ref() == Some(id) {
            self.store.set_issuers_config(&IssuerConfig::default())?;
            info!("Cleared default issuer '{id}'");
        }
        Ok(())
    }

    /// Resolves a key reference.
    ///
    /// The reference is either `default`, a key ID, or a key name.
    pub fn resolve_key_ref(&self, reference: &str) -> PkiResult<KeyId> {
        if reference == DEFAULT_REF {
            return self.default_key()?.ok_or_else(|| {
                Error::NotFound("default key".into())
            })
        }
        let id = KeyId::from(reference);
        if id.ident().is_ok() {
            match self.store.fetch_key_by_id(&id) {
                Ok(key) => return Ok(key.id),
                Err(Error::NotFound(_)) => { }
                Err(err) => return Err(err),
            }
        }
        for id in self.store.list_keys()? {
            let key = self.store.fetch_key_by_id(&id)?;
            if key.name == reference {
                return Ok(key.id)
            }
        }
        Err(Error::not_found("key", reference))
    }

    /// Resolves an issuer reference.
    ///
    /// The reference is either `default`, an issuer ID, or an issuer name.
    pub fn resolve_issuer_ref(&self, reference: &str) -> PkiResult<IssuerId> {
        if reference == DEFAULT_REF {
            return self.default_issuer()?.ok_or_else(|| {
                Error::NotFound("default issuer".into())
            })
        }
        let id = IssuerId::from(reference);
        if id.ident().is_ok() {
            match self.store.fetch_issuer_by_id(&id) {
                Ok(issuer) => return Ok(issuer.id),
                Err(Error::NotFound(_)) => { }
                Err(err) => return Err(err),
            }
        }
        for id in self.store.list_issuers()? {
            let issuer = self.store.fetch_issuer_by_id(&id)?;
            if issuer.name == reference {
                return Ok(issuer.id)
            }
        }
        Err(Error::not_found("issuer", reference))
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::test;
    use super::*;

    #[test]
    fn no_defaults_initially() {
        let store = test::mem_store();
        let defaults = DefaultResolver::new(&store);
        assert_eq!(defaults.default_key().unwrap(), None);
        assert_eq!(defaults.default_issuer().unwrap(), None);
        assert!(matches!(
            defaults.resolve_key_ref("default"), Err(Error::NotFound(_))
        ));
        assert!(matches!(
            defaults.resolve_issuer_ref("default"), Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn first_claim_wins() {
        let store = test::mem_store();
        let defaults = DefaultResolver::new(&store);
        let (first, first_key) = test::gen_issuer_and_key("one.example.com");
        let (second, second_key) = test::gen_issuer_and_key("two.example.com");

        assert!(defaults.claim_default_key(&first_key.id).unwrap());
        assert!(!defaults.claim_default_key(&second_key.id).unwrap());
        assert!(defaults.claim_default_issuer(&first.id).unwrap());
        assert!(!defaults.claim_default_issuer(&second.id).unwrap());

        assert_eq!(defaults.default_key().unwrap(), Some(first_key.id));
        assert_eq!(defaults.default_issuer().unwrap(), Some(first.id));
    }

    #[test]
    fn explicit_default_requires_existing_entry() {
        let store = test::mem_store();
        let defaults = DefaultResolver::new(&store);
        assert!(matches!(
            defaults.set_default_issuer(&IssuerId::generate()),
            Err(Error::NotFound(_))
        ));

        let (issuer, key) = test::gen_issuer_and_key("example.com");
        store.write_key(&key).unwrap();
        store.write_issuer(&issuer).unwrap();
        defaults.set_default_issuer(&issuer.id).unwrap();
        defaults.set_default_key(&key.id).unwrap();
        assert_eq!(defaults.resolve_issuer_ref("default").unwrap(), issuer.id);
        assert_eq!(defaults.resolve_key_ref("default").unwrap(), key.id);
    }

    #[test]
    fn resolve_by_id_and_name() {
        let store = test::mem_store();
        let defaults = DefaultResolver::new(&store);
        let (mut issuer, mut key) = test::gen_issuer_and_key("example.com");
        issuer.name = "root-2026".into();
        key.name = "root key".into();
        store.write_key(&key).unwrap();
        store.write_issuer(&issuer).unwrap();

        assert_eq!(
            defaults.resolve_issuer_ref(issuer.id.as_str()).unwrap(),
            issuer.id
        );
        assert_eq!(defaults.resolve_issuer_ref("root-2026").unwrap(), issuer.id);
        assert_eq!(defaults.resolve_key_ref("root key").unwrap(), key.id);
        assert!(matches!(
            defaults.resolve_issuer_ref("unknown"), Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn clear_only_matching_default() {
        let store = test::mem_store();
        let defaults = DefaultResolver::new(&store);
        let id = IssuerId::generate();
        defaults.claim_default_issuer(&id).unwrap();

        defaults.clear_default_issuer(&IssuerId::generate()).unwrap();
        assert_eq!(defaults.default_issuer().unwrap(), Some(id.clone()));

        defaults.clear_default_issuer(&id).unwrap();
        assert_eq!(defaults.default_issuer().unwrap(), None);
    }
}
