//! Importing keys and certificates without creating duplicates.
//!
//! An import first looks for an existing entry with the same material,
//! keys by the fingerprint of their public key and issuers by the
//! fingerprint of the DER certificate. If one exists, it is returned and
//! nothing is written. Otherwise a new entry with a fresh ID is stored.
//!
//! The lookup and the write are separate store operations. Two imports of
//! the same material running at the same time may both miss and both
//! write, leaving two entries with different IDs.

use log::{debug, info, warn};
use crate::commons::PkiResult;
use crate::commons::crypto::{Fingerprint, KeyMaterial, ParsedCertificate};
use crate::commons::error::Error;
use crate::constants::MAX_CHAIN_LENGTH;
use super::entities::{Issuer, IssuerId, Key, KeyId};
use super::store::PkiStore;


/// # Importing
impl PkiStore {
    /// Imports a private key in PEM or DER.
    ///
    /// Returns the key and whether it already existed. If the existing
    /// entry holds only the public key, the private key is added to it.
    pub fn import_key(&self, raw: &[u8]) -> PkiResult<(Key, bool)> {
        let material = KeyMaterial::parse(raw)?;
        let fingerprint = material.fingerprint()?;
        self.ensure_fingerprint_index()?;

        if let Some(mut key) = self.find_key(&fingerprint)? {
            if !key.has_private_key() {
                let upgraded = Key::from_material(key.id.clone(), raw, &material)?;
                key.private_key_type = upgraded.private_key_type;
                key.private_key = upgraded.private_key;
                self.write_key(&key)?;
                info!("Added private key to existing key '{}'", key.id);
            }
            else {
                debug!("Key already present as '{}'", key.id);
            }
            return Ok((key, true))
        }

        let key = Key::from_material(KeyId::generate(), raw, &material)?;
        self.write_key(&key)?;
        info!("Imported {} key '{}'", key.private_key_type, key.id);
        Ok((key, false))
    }

    /// Imports a CA certificate in PEM or DER.
    ///
    /// Returns the issuer and whether it already existed. A new issuer is
    /// linked to the key matching its public key. If there is no such key,
    /// a key holding only the public key is created.
    pub fn import_issuer(&self, raw: &[u8]) -> PkiResult<(Issuer, bool)> {
        let cert = ParsedCertificate::parse(raw)?;
        let fingerprint = cert.fingerprint()?;
        self.ensure_fingerprint_index()?;

        if let Some(issuer) = self.find_issuer(&fingerprint)? {
            debug!("Issuer already present as '{}'", issuer.id);
            return Ok((issuer, true))
        }

        let public_key = cert.public_key()?;
        let key = match self.find_key(&public_key.fingerprint()?)? {
            Some(key) => key,
            None => {
                let key = Key::from_public(KeyId::generate(), &public_key)?;
                self.write_key(&key)?;
                debug!("Created public-only key '{}' for certificate", key.id);
                key
            }
        };

        let certificate = cert.to_pem()?;
        let ca_chain = self.build_chain(&cert, &certificate)?;
        let issuer = Issuer {
            id: IssuerId::generate(),
            name: String::new(),
            key_id: key.id,
            certificate,
            ca_chain,
            serial_number: cert.serial_number()?,
        };
        self.write_issuer(&issuer)?;
        info!(
            "Imported issuer '{}' with serial {}",
            issuer.id, issuer.serial_number
        );
        Ok((issuer, false))
    }

    /// Finds the key with the given public key fingerprint.
    fn find_key(&self, fingerprint: &Fingerprint) -> PkiResult<Option<Key>> {
        let Some(id) = self.indexed_key(fingerprint)? else {
            return Ok(None)
        };
        match self.fetch_key_by_id(&id) {
            Ok(key) => {
                if key.fingerprint().ok().as_ref() == Some(fingerprint) {
                    return Ok(Some(key))
                }
            }
            Err(Error::NotFound(_)) => { }
            Err(err) => return Err(err),
        }
        warn!("Replacing stale key fingerprint entry for '{id}'");
        match self.scan_keys(fingerprint)? {
            Some(key) => {
                self.index_key(fingerprint, &key.id)?;
                Ok(Some(key))
            }
            None => {
                self.drop_key_index(fingerprint)?;
                Ok(None)
            }
        }
    }

    /// Finds the issuer with the given certificate fingerprint.
    fn find_issuer(
        &self, fingerprint: &Fingerprint
    ) -> PkiResult<Option<Issuer>> {
        let Some(id) = self.indexed_issuer(fingerprint)? else {
            return Ok(None)
        };
        match self.fetch_issuer_by_id(&id) {
            Ok(issuer) => {
                if issuer.fingerprint().ok().as_ref() == Some(fingerprint) {
                    return Ok(Some(issuer))
                }
            }
            Err(Error::NotFound(_)) => { }
            Err(err) => return Err(err),
        }
        warn!("Replacing stale issuer fingerprint entry for '{id}'");
        match self.scan_issuers(fingerprint)? {
            Some(issuer) => {
                self.index_issuer(fingerprint, &issuer.id)?;
                Ok(Some(issuer))
            }
            None => {
                self.drop_issuer_index(fingerprint)?;
                Ok(None)
            }
        }
    }

    /// Builds the chain for a certificate from the stored issuers.
    ///
    /// The chain starts with the certificate itself and is followed by
    /// the chain of the stored issuer that signed it, if any.
    fn build_chain(
        &self, cert: &ParsedCertificate, pem: &str
    ) -> PkiResult<Vec<String>> {
        let mut chain = vec![pem.to_string()];
        if cert.is_self_signed() {
            return Ok(chain)
        }
        for id in self.list_issuers()? {
            let parent = match self.fetch_issuer_by_id(&id) {
                Ok(parent) => parent,
                Err(Error::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            let Ok(parent_cert) = parent.parse_certificate() else {
                continue
            };
            if cert.is_issued_by(&parent_cert) {
                if parent.ca_chain.is_empty() {
                    chain.push(parent.certificate);
                }
                else {
                    chain.extend(parent.ca_chain);
                }
                chain.dedup();
                chain.truncate(MAX_CHAIN_LENGTH);
                return Ok(chain)
            }
        }
        Ok(chain)
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::commons::crypto::PrivateKeyType;
    use crate::constants::{ISSUERS_SCOPE, KEYS_SCOPE};
    use crate::test;
    use super::*;

    #[test]
    fn keys_import() {
        let store = test::mem_store();
        let (_, key1) = test::gen_issuer_and_key("example.com");
        let (_, key2) = test::gen_issuer_and_key("example.com");

        let (key1_ref1, existing) = store.import_key(
            key1.private_key.as_bytes()
        ).unwrap();
        assert!(!existing);
        assert!(!key1_ref1.id.is_empty());
        assert_eq!(key1_ref1.private_key_type, PrivateKeyType::Rsa);
        assert_eq!(key1_ref1.private_key, key1.private_key);

        let (key1_ref2, existing) = store.import_key(
            key1.private_key.as_bytes()
        ).unwrap();
        assert!(existing);
        assert_eq!(key1_ref1.id, key1_ref2.id);
        assert_eq!(key1_ref1.private_key, key1_ref2.private_key);

        let (key2_ref, existing) = store.import_key(
            key2.private_key.as_bytes()
        ).unwrap();
        assert!(!existing);
        assert_ne!(key1_ref1.id, key2_ref.id);

        let (key1_ref3, existing) = store.import_key(
            key1.private_key.as_bytes()
        ).unwrap();
        assert!(existing);
        assert_eq!(key1_ref1.id, key1_ref3.id);

        let mut keys = store.list_keys().unwrap();
        keys.sort();
        let mut expected = vec![key1_ref1.id, key2_ref.id];
        expected.sort();
        assert_eq!(keys, expected);
    }

    #[test]
    fn issuer_import() {
        let store = test::mem_store();
        let (issuer1, _) = test::gen_issuer_and_key("example.com");
        let (issuer2, _) = test::gen_issuer_and_key("example.com");

        let (issuer1_ref1, existing) = store.import_issuer(
            issuer1.certificate.as_bytes()
        ).unwrap();
        assert!(!existing);
        assert!(!issuer1_ref1.id.is_empty());
        assert_eq!(issuer1_ref1.certificate, issuer1.certificate);
        assert!(!issuer1_ref1.key_id.is_empty());
        assert_eq!(issuer1_ref1.serial_number, issuer1.serial_number);

        let (issuer1_ref2, existing) = store.import_issuer(
            issuer1.certificate.as_bytes()
        ).unwrap();
        assert!(existing);
        assert_eq!(issuer1_ref1.id, issuer1_ref2.id);
        assert_eq!(issuer1_ref1.key_id, issuer1_ref2.key_id);
        assert_eq!(issuer1_ref1.certificate, issuer1_ref2.certificate);

        let (issuer2_ref, existing) = store.import_issuer(
            issuer2.certificate.as_bytes()
        ).unwrap();
        assert!(!existing);
        assert_ne!(issuer1_ref1.id, issuer2_ref.id);
        assert_ne!(issuer1_ref1.key_id, issuer2_ref.key_id);

        let (issuer1_ref3, existing) = store.import_issuer(
            issuer1.certificate.as_bytes()
        ).unwrap();
        assert!(existing);
        assert_eq!(issuer1_ref1.id, issuer1_ref3.id);

        assert_eq!(store.list_issuers().unwrap().len(), 2);
    }

    #[test]
    fn issuer_without_key_gets_public_only_key() {
        let store = test::mem_store();
        let (issuer, key) = test::gen_issuer_and_key("example.com");

        let (imported, _) = store.import_issuer(
            issuer.certificate.as_bytes()
        ).unwrap();
        let stored_key = store.fetch_key_by_id(&imported.key_id).unwrap();
        assert!(!stored_key.has_private_key());
        assert_eq!(
            stored_key.fingerprint().unwrap(), key.fingerprint().unwrap()
        );

        // Importing the private key later fills in the same entry.
        let (upgraded, existing) = store.import_key(
            key.private_key.as_bytes()
        ).unwrap();
        assert!(existing);
        assert_eq!(upgraded.id, imported.key_id);
        assert!(upgraded.has_private_key());
        assert!(store.fetch_key_by_id(&upgraded.id).unwrap().has_private_key());
        assert_eq!(store.list_keys().unwrap().len(), 1);
    }

    #[test]
    fn issuer_links_to_imported_key() {
        let store = test::mem_store();
        let (issuer, key) = test::gen_issuer_and_key("example.com");

        let (key_ref, _) = store.import_key(key.private_key.as_bytes()).unwrap();
        let (issuer_ref, _) = store.import_issuer(
            issuer.certificate.as_bytes()
        ).unwrap();
        assert_eq!(issuer_ref.key_id, key_ref.id);
        assert_eq!(store.list_keys().unwrap().len(), 1);
    }

    #[test]
    fn der_input_is_accepted() {
        let store = test::mem_store();
        let (issuer, key) = test::gen_issuer_and_key("example.com");
        let cert = ParsedCertificate::parse(
            issuer.certificate.as_bytes()
        ).unwrap();
        let material = KeyMaterial::parse(key.private_key.as_bytes()).unwrap();

        let (from_der, existing) = store.import_issuer(
            &cert.to_der().unwrap()
        ).unwrap();
        assert!(!existing);
        let (from_pem, existing) = store.import_issuer(
            issuer.certificate.as_bytes()
        ).unwrap();
        assert!(existing);
        assert_eq!(from_der.id, from_pem.id);

        let der = material.pkey().private_key_to_der().unwrap();
        let (key_der, _) = store.import_key(&der).unwrap();
        let (key_pem, existing) = store.import_key(
            key.private_key.as_bytes()
        ).unwrap();
        assert!(existing);
        assert_eq!(key_der.id, key_pem.id);
    }

    #[test]
    fn malformed_input_is_rejected() {
        let store = test::mem_store();
        assert!(matches!(
            store.import_key(b"not a key"), Err(Error::MalformedRequest(_))
        ));
        assert!(matches!(
            store.import_issuer(b"not a cert"), Err(Error::MalformedRequest(_))
        ));
        assert!(store.list_keys().unwrap().is_empty());
        assert!(store.list_issuers().unwrap().is_empty());
    }

    #[test]
    fn stale_index_entry_is_ignored() {
        let store = test::mem_store();
        let (issuer, key) = test::gen_issuer_and_key("example.com");
        let (imported, _) = store.import_key(key.private_key.as_bytes()).unwrap();

        // Remove the record behind the index's back.
        store.kv().drop_key(
            Some(KEYS_SCOPE), imported.id.ident().unwrap()
        ).unwrap();

        let (again, existing) = store.import_key(
            key.private_key.as_bytes()
        ).unwrap();
        assert!(!existing);
        assert_ne!(again.id, imported.id);
        assert_eq!(
            store.indexed_key(&key.fingerprint().unwrap()).unwrap(),
            Some(again.id)
        );

        let (issuer_ref, _) = store.import_issuer(
            issuer.certificate.as_bytes()
        ).unwrap();
        store.kv().drop_key(
            Some(ISSUERS_SCOPE), issuer_ref.id.ident().unwrap()
        ).unwrap();
        let (issuer_again, existing) = store.import_issuer(
            issuer.certificate.as_bytes()
        ).unwrap();
        assert!(!existing);
        assert_ne!(issuer_again.id, issuer_ref.id);
    }

    #[test]
    fn deleting_indexed_duplicate_keeps_survivor() {
        let store = test::mem_store();
        let (issuer, key) = test::gen_issuer_and_key("example.com");
        let (first, _) = store.import_key(key.private_key.as_bytes()).unwrap();

        let duplicate = Key { id: KeyId::generate(), ..first.clone() };
        store.write_key(&duplicate).unwrap();
        store.delete_key(&duplicate.id).unwrap();

        let (again, existing) = store.import_key(
            key.private_key.as_bytes()
        ).unwrap();
        assert!(existing);
        assert_eq!(again.id, first.id);
        assert_eq!(store.list_keys().unwrap().len(), 1);

        let (first, _) = store.import_issuer(
            issuer.certificate.as_bytes()
        ).unwrap();
        let duplicate = Issuer { id: IssuerId::generate(), ..first.clone() };
        store.write_issuer(&duplicate).unwrap();
        store.delete_issuer(&duplicate.id).unwrap();

        let (again, existing) = store.import_issuer(
            issuer.certificate.as_bytes()
        ).unwrap();
        assert!(existing);
        assert_eq!(again.id, first.id);
        assert_eq!(store.list_issuers().unwrap().len(), 1);
    }

    #[test]
    fn stale_hit_falls_back_to_survivor() {
        let store = test::mem_store();
        let (_, key) = test::gen_issuer_and_key("example.com");
        let (first, _) = store.import_key(key.private_key.as_bytes()).unwrap();
        let duplicate = Key { id: KeyId::generate(), ..first.clone() };
        store.write_key(&duplicate).unwrap();

        // Remove the indexed record behind the index's back.
        store.kv().drop_key(
            Some(KEYS_SCOPE), duplicate.id.ident().unwrap()
        ).unwrap();

        let (again, existing) = store.import_key(
            key.private_key.as_bytes()
        ).unwrap();
        assert!(existing);
        assert_eq!(again.id, first.id);
        assert_eq!(
            store.indexed_key(&key.fingerprint().unwrap()).unwrap(),
            Some(first.id)
        );
    }

    #[test]
    fn directly_written_entries_are_found() {
        let store = test::mem_store();
        let (issuer, key) = test::gen_issuer_and_key("example.com");
        store.write_key(&key).unwrap();
        store.write_issuer(&issuer).unwrap();

        let (key_ref, existing) = store.import_key(
            key.private_key.as_bytes()
        ).unwrap();
        assert!(existing);
        assert_eq!(key_ref.id, key.id);

        let (issuer_ref, existing) = store.import_issuer(
            issuer.certificate.as_bytes()
        ).unwrap();
        assert!(existing);
        assert_eq!(issuer_ref.id, issuer.id);
    }

    #[test]
    fn chain_is_built_from_stored_parent() {
        let store = test::mem_store();
        let (root, root_key) = test::gen_issuer_and_key("root.example.com");
        let (child, _) = test::gen_child_issuer(
            &root, &root_key, "child.example.com"
        );

        let (root_ref, _) = store.import_issuer(
            root.certificate.as_bytes()
        ).unwrap();
        assert_eq!(root_ref.ca_chain, vec![root.certificate.clone()]);

        let (child_ref, _) = store.import_issuer(
            child.certificate.as_bytes()
        ).unwrap();
        assert_eq!(
            child_ref.ca_chain,
            vec![child.certificate.clone(), root.certificate.clone()]
        );
    }

    #[test]
    fn racing_imports_can_duplicate() {
        let store = test::mem_store();
        let (_, key) = test::gen_issuer_and_key("example.com");
        let material = KeyMaterial::parse(key.private_key.as_bytes()).unwrap();
        let fingerprint = material.fingerprint().unwrap();
        store.ensure_fingerprint_index().unwrap();

        // Two imports both look up before either writes.
        assert!(store.find_key(&fingerprint).unwrap().is_none());
        assert!(store.find_key(&fingerprint).unwrap().is_none());

        let first = Key::from_material(
            KeyId::generate(), key.private_key.as_bytes(), &material
        ).unwrap();
        store.write_key(&first).unwrap();
        let second = Key::from_material(
            KeyId::generate(), key.private_key.as_bytes(), &material
        ).unwrap();
        store.write_key(&second).unwrap();

        assert_eq!(store.list_keys().unwrap().len(), 2);

        // Later imports resolve to whichever write was indexed last.
        let (found, existing) = store.import_key(
            key.private_key.as_bytes()
        ).unwrap();
        assert!(existing);
        assert_eq!(found.id, second.id);
    }
}
