//! The PKI engine: generation and import workflows on top of the store.

use std::time::Duration;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use crate::commons::{PkiEmptyResult, PkiResult};
use crate::commons::crypto::{split_pem, ParsedCertificate, ParsedCsr};
use crate::commons::error::Error;
use crate::config::IssuanceConfig;
use crate::constants::DEFAULT_REF;
use super::defaults::DefaultResolver;
use super::entities::{Issuer, IssuerId, IssuerInfo, Key, KeyId, KeyInfo};
use super::generate::{
    generate_cert, generate_cert_with_timeout, generate_csr, Cancellation,
    CertificateBundle, CsrBundle, GenerationInput, GenerationRequest,
    KeySource, SigningBundle,
};
use super::role::Role;
use super::store::PkiStore;


//------------ CertFormat ----------------------------------------------------

/// The encoding of a fetched certificate.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CertFormat {
    #[default]
    Pem,
    Der,
}


//------------ GeneratedCa ---------------------------------------------------

/// A stored CA created by the engine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GeneratedCa {
    pub issuer_id: IssuerId,
    pub key_id: KeyId,
    pub bundle: CertificateBundle,
}


//------------ GeneratedCsr --------------------------------------------------

/// A CSR for an intermediate CA and the stored key it is for.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GeneratedCsr {
    pub key_id: KeyId,
    pub bundle: CsrBundle,
}


//------------ ImportResult --------------------------------------------------

/// The outcome of importing a PEM bundle.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ImportResult {
    pub imported_keys: Vec<KeyId>,
    pub existing_keys: Vec<KeyId>,
    pub imported_issuers: Vec<IssuerId>,
    pub existing_issuers: Vec<IssuerId>,
}


//------------ PkiEngine -----------------------------------------------------

/// Runs the PKI operations against a store.
///
/// Generation never writes to the store. Whatever is persisted is stored
/// through the import functions after a bundle is complete, so a failed
/// or cancelled generation leaves the store untouched.
#[derive(Debug)]
pub struct PkiEngine {
    store: PkiStore,
    config: IssuanceConfig,
}

impl PkiEngine {
    pub fn new(store: PkiStore, config: IssuanceConfig) -> Self {
        PkiEngine { store, config }
    }

    pub fn store(&self) -> &PkiStore {
        &self.store
    }

    pub fn config(&self) -> &IssuanceConfig {
        &self.config
    }

    fn defaults(&self) -> DefaultResolver<'_> {
        DefaultResolver::new(&self.store)
    }

    fn input(
        &self,
        role: Role,
        request: GenerationRequest,
        key_source: KeySource,
        is_ca: bool,
    ) -> GenerationInput {
        GenerationInput {
            role, request, key_source, is_ca, config: self.config.clone()
        }
    }

    fn signing_bundle(&self, issuer_ref: &str) -> PkiResult<SigningBundle> {
        let id = self.resolve_issuer_ref(issuer_ref)?;
        SigningBundle::load(&self.store, &id)
    }

    fn root_input(
        &self, request: GenerationRequest, key_ref: Option<&str>
    ) -> PkiResult<GenerationInput> {
        let key_source = match key_ref {
            Some(key_ref) => {
                let id = self.resolve_key_ref(key_ref)?;
                KeySource::Existing(self.store.fetch_key_by_id(&id)?)
            }
            None => KeySource::Generate,
        };
        Ok(self.input(Role::for_ca(), request, key_source, true))
    }
}


/// # Generating CAs
impl PkiEngine {
    /// Generates a self-signed root CA and stores it.
    ///
    /// With `key_ref` the root uses a stored key instead of a new one. The
    /// new key and issuer become the defaults if there are none yet.
    pub fn generate_root(
        &self, request: GenerationRequest, key_ref: Option<&str>
    ) -> PkiResult<GeneratedCa> {
        let exported = request.exported;
        let input = self.root_input(request, key_ref)?;
        let bundle = generate_cert(&input, None, &Cancellation::new())?;
        let res = self.persist_ca(bundle)?;
        info!("Generated root CA '{}'", res.issuer_id);
        Ok(GeneratedCa { bundle: res.bundle.restrict(exported), ..res })
    }

    /// Generates a root CA within the configured generation timeout.
    ///
    /// Nothing is stored if the generation is cancelled.
    pub async fn generate_root_with_timeout(
        &self, request: GenerationRequest, key_ref: Option<&str>
    ) -> PkiResult<GeneratedCa> {
        self.generate_root_within(
            request, key_ref, self.config.generation_timeout()
        ).await
    }

    /// Generates a root CA within the given time.
    pub async fn generate_root_within(
        &self,
        request: GenerationRequest,
        key_ref: Option<&str>,
        timeout: Duration,
    ) -> PkiResult<GeneratedCa> {
        let exported = request.exported;
        let input = self.root_input(request, key_ref)?;
        let bundle = generate_cert_with_timeout(input, None, timeout).await?;
        let res = self.persist_ca(bundle)?;
        info!("Generated root CA '{}'", res.issuer_id);
        Ok(GeneratedCa { bundle: res.bundle.restrict(exported), ..res })
    }

    /// Generates a key and a CSR for an intermediate CA.
    ///
    /// The key is stored. The certificate signed for the CSR is later
    /// added through [`Self::set_signed_intermediate`].
    pub fn generate_intermediate(
        &self, request: GenerationRequest
    ) -> PkiResult<GeneratedCsr> {
        let exported = request.exported;
        let input = self.input(
            Role::for_ca(), request, KeySource::Generate, true
        );
        let bundle = generate_csr(&input, &Cancellation::new())?;
        let private_key = bundle.private_key.as_ref().ok_or_else(|| {
            Error::signing("CSR generation returned no key")
        })?;
        let (key, _) = self.store.import_key(private_key.as_bytes())?;
        self.defaults().claim_default_key(&key.id)?;
        info!("Generated intermediate CA key '{}'", key.id);
        Ok(GeneratedCsr { key_id: key.id, bundle: bundle.restrict(exported) })
    }

    /// Signs a CA certificate for a CSR.
    ///
    /// The result is not stored.
    pub fn sign_intermediate(
        &self, issuer_ref: &str, csr: &str, request: GenerationRequest
    ) -> PkiResult<CertificateBundle> {
        let signing = self.signing_bundle(issuer_ref)?;
        let csr = ParsedCsr::parse(csr.as_bytes())?;
        let input = self.input(
            Role::for_ca(), request, KeySource::Csr(csr), true
        );
        let bundle = generate_cert(&input, Some(&signing), &Cancellation::new())?;
        info!(
            "Issuer '{}' signed intermediate CA with serial {}",
            signing.issuer.id, bundle.serial_number
        );
        Ok(bundle)
    }

    /// Stores the signed certificate of an intermediate CA.
    ///
    /// The certificate is linked to the key created by
    /// [`Self::generate_intermediate`] through its public key.
    pub fn set_signed_intermediate(
        &self, certificate: &str
    ) -> PkiResult<(Issuer, bool)> {
        let (issuer, existing) = self.store.import_issuer(
            certificate.as_bytes()
        )?;
        if !self.store.fetch_key_by_id(&issuer.key_id)?.has_private_key() {
            warn!(
                "No private key stored for intermediate CA '{}'", issuer.id
            );
        }
        self.defaults().claim_default_issuer(&issuer.id)?;
        Ok((issuer, existing))
    }

    /// Stores the key and issuer of a complete CA bundle.
    fn persist_ca(&self, bundle: CertificateBundle) -> PkiResult<GeneratedCa> {
        let private_key = bundle.private_key.as_ref().ok_or_else(|| {
            Error::signing("generated CA has no private key")
        })?;
        let (key, _) = self.store.import_key(private_key.as_bytes())?;
        let (issuer, _) = self.store.import_issuer(
            bundle.certificate.as_bytes()
        )?;
        let defaults = self.defaults();
        defaults.claim_default_key(&key.id)?;
        defaults.claim_default_issuer(&issuer.id)?;
        Ok(GeneratedCa { issuer_id: issuer.id, key_id: key.id, bundle })
    }
}


/// # Issuing
impl PkiEngine {
    /// Issues a certificate with a new key.
    ///
    /// The key is returned with the bundle and not stored.
    pub fn issue(
        &self, role: &Role, issuer_ref: &str, request: GenerationRequest
    ) -> PkiResult<CertificateBundle> {
        let signing = self.signing_bundle(issuer_ref)?;
        let input = self.input(
            role.clone(), request, KeySource::Generate, false
        );
        let bundle = generate_cert(&input, Some(&signing), &Cancellation::new())?;
        info!(
            "Issued certificate with serial {} for role '{}'",
            bundle.serial_number, role.name
        );
        Ok(bundle)
    }

    /// Issues a certificate within the configured generation timeout.
    pub async fn issue_with_timeout(
        &self, role: &Role, issuer_ref: &str, request: GenerationRequest
    ) -> PkiResult<CertificateBundle> {
        self.issue_within(
            role, issuer_ref, request, self.config.generation_timeout()
        ).await
    }

    /// Issues a certificate within the given time.
    pub async fn issue_within(
        &self,
        role: &Role,
        issuer_ref: &str,
        request: GenerationRequest,
        timeout: Duration,
    ) -> PkiResult<CertificateBundle> {
        let signing = self.signing_bundle(issuer_ref)?;
        let input = self.input(
            role.clone(), request, KeySource::Generate, false
        );
        let bundle = generate_cert_with_timeout(
            input, Some(signing), timeout
        ).await?;
        info!(
            "Issued certificate with serial {} for role '{}'",
            bundle.serial_number, role.name
        );
        Ok(bundle)
    }

    /// Issues a certificate for the public key of a CSR.
    pub fn sign(
        &self,
        role: &Role,
        issuer_ref: &str,
        csr: &str,
        request: GenerationRequest,
    ) -> PkiResult<CertificateBundle> {
        let signing = self.signing_bundle(issuer_ref)?;
        let csr = ParsedCsr::parse(csr.as_bytes())?;
        let input = self.input(
            role.clone(), request, KeySource::Csr(csr), false
        );
        let bundle = generate_cert(&input, Some(&signing), &Cancellation::new())?;
        info!(
            "Signed certificate with serial {} for role '{}'",
            bundle.serial_number, role.name
        );
        Ok(bundle)
    }
}


/// # Importing
impl PkiEngine {
    /// Imports all keys and certificates of a PEM bundle.
    ///
    /// Keys are imported first so certificates link to them. Certificates
    /// are imported parents first so their chains can be built. New
    /// entries become the defaults if there are none yet.
    pub fn import_bundle(&self, pem: &str) -> PkiResult<ImportResult> {
        let blocks = split_pem(pem)?;
        if blocks.is_empty() {
            return Err(Error::malformed("no PEM blocks in bundle"))
        }
        let mut certs = Vec::new();
        let mut keys = Vec::new();
        for block in blocks {
            if block.is_certificate() {
                certs.push(ParsedCertificate::parse(block.text.as_bytes())?);
            }
            else if block.is_private_key() {
                keys.push(block.text);
            }
            else {
                return Err(Error::malformed(format!(
                    "unsupported PEM block '{}'", block.label
                )))
            }
        }

        let mut res = ImportResult::default();
        for key in keys {
            let (key, existing) = self.store.import_key(key.as_bytes())?;
            if existing {
                res.existing_keys.push(key.id);
            }
            else {
                res.imported_keys.push(key.id);
            }
        }
        for cert in parents_first(certs) {
            let (issuer, existing) = self.store.import_issuer(
                &cert.to_der()?
            )?;
            if existing {
                res.existing_issuers.push(issuer.id);
            }
            else {
                res.imported_issuers.push(issuer.id);
            }
        }

        let defaults = self.defaults();
        if let Some(issuer) = res.imported_issuers.first() {
            defaults.claim_default_issuer(issuer)?;
        }
        if let Some(key) = res.imported_keys.first() {
            defaults.claim_default_key(key)?;
        }
        info!(
            "Imported {} keys and {} issuers, {} keys and {} issuers existed",
            res.imported_keys.len(), res.imported_issuers.len(),
            res.existing_keys.len(), res.existing_issuers.len(),
        );
        Ok(res)
    }
}

/// Orders certificates so that issuers come before what they signed.
fn parents_first(mut pending: Vec<ParsedCertificate>) -> Vec<ParsedCertificate> {
    let mut res = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let idx = (0..pending.len()).find(|&idx| {
            let cert = &pending[idx];
            cert.is_self_signed() || !pending.iter().enumerate().any(
                |(other, parent)| other != idx && cert.is_issued_by(parent)
            )
        }).unwrap_or(0);
        res.push(pending.remove(idx));
    }
    res
}


/// # Issuers and keys
impl PkiEngine {
    /// Returns the certificate of an issuer.
    pub fn fetch_issuer_certificate(
        &self, issuer_ref: &str, format: CertFormat
    ) -> PkiResult<Vec<u8>> {
        let id = self.resolve_issuer_ref(issuer_ref)?;
        let issuer = self.store.fetch_issuer_by_id(&id)?;
        match format {
            CertFormat::Pem => Ok(issuer.certificate.into_bytes()),
            CertFormat::Der => Ok(issuer.parse_certificate()?.to_der()?),
        }
    }

    pub fn resolve_key_ref(&self, key_ref: &str) -> PkiResult<KeyId> {
        self.defaults().resolve_key_ref(key_ref)
    }

    pub fn resolve_issuer_ref(&self, issuer_ref: &str) -> PkiResult<IssuerId> {
        self.defaults().resolve_issuer_ref(issuer_ref)
    }

    pub fn set_default_key(&self, key_ref: &str) -> PkiResult<KeyId> {
        let id = self.resolve_key_ref(key_ref)?;
        self.defaults().set_default_key(&id)?;
        Ok(id)
    }

    pub fn set_default_issuer(&self, issuer_ref: &str) -> PkiResult<IssuerId> {
        let id = self.resolve_issuer_ref(issuer_ref)?;
        self.defaults().set_default_issuer(&id)?;
        Ok(id)
    }

    /// Sets the name of a key.
    ///
    /// Names must be unique among keys and cannot be `default`. An empty
    /// name removes the name.
    pub fn name_key(&self, key_ref: &str, name: &str) -> PkiResult<Key> {
        let id = self.resolve_key_ref(key_ref)?;
        check_name(name)?;
        if !name.is_empty() {
            for other in self.store.list_keys()? {
                if other != id && self.store.fetch_key_by_id(&other)?.name == name {
                    return Err(Error::policy(format!(
                        "key name '{name}' is already used by '{other}'"
                    )))
                }
            }
        }
        let mut key = self.store.fetch_key_by_id(&id)?;
        key.name = name.into();
        self.store.write_key(&key)?;
        Ok(key)
    }

    /// Sets the name of an issuer.
    ///
    /// Names must be unique among issuers and cannot be `default`. An empty
    /// name removes the name.
    pub fn name_issuer(
        &self, issuer_ref: &str, name: &str
    ) -> PkiResult<Issuer> {
        let id = self.resolve_issuer_ref(issuer_ref)?;
        check_name(name)?;
        if !name.is_empty() {
            for other in self.store.list_issuers()? {
                if other != id
                    && self.store.fetch_issuer_by_id(&other)?.name == name
                {
                    return Err(Error::policy(format!(
                        "issuer name '{name}' is already used by '{other}'"
                    )))
                }
            }
        }
        let mut issuer = self.store.fetch_issuer_by_id(&id)?;
        issuer.name = name.into();
        self.store.write_issuer(&issuer)?;
        Ok(issuer)
    }

    /// Deletes a key that no issuer uses anymore.
    pub fn delete_key(&self, key_ref: &str) -> PkiResult<KeyId> {
        let id = self.resolve_key_ref(key_ref)?;
        for issuer_id in self.store.list_issuers()? {
            let issuer = self.store.fetch_issuer_by_id(&issuer_id)?;
            if issuer.key_id == id {
                return Err(Error::policy(format!(
                    "key '{id}' is used by issuer '{issuer_id}'"
                )))
            }
        }
        self.store.delete_key(&id)?;
        self.defaults().clear_default_key(&id)?;
        info!("Deleted key '{id}'");
        Ok(id)
    }

    /// Deletes an issuer.
    ///
    /// Its key is kept.
    pub fn delete_issuer(&self, issuer_ref: &str) -> PkiResult<IssuerId> {
        let id = self.resolve_issuer_ref(issuer_ref)?;
        self.store.delete_issuer(&id)?;
        self.defaults().clear_default_issuer(&id)?;
        info!("Deleted issuer '{id}'");
        Ok(id)
    }

    pub fn list_keys_with_info(&self) -> PkiResult<Vec<KeyInfo>> {
        let mut res = Vec::new();
        for id in self.store.list_keys()? {
            res.push(self.store.fetch_key_by_id(&id)?.info());
        }
        res.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(res)
    }

    pub fn list_issuers_with_info(&self) -> PkiResult<Vec<IssuerInfo>> {
        let mut res = Vec::new();
        for id in self.store.list_issuers()? {
            res.push(self.store.fetch_issuer_by_id(&id)?.info());
        }
        res.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(res)
    }
}

fn check_name(name: &str) -> PkiEmptyResult {
    if name == DEFAULT_REF {
        return Err(Error::malformed(format!("'{DEFAULT_REF}' is reserved")))
    }
    if name.trim() != name {
        return Err(Error::malformed(format!(
            "name '{name}' has surrounding whitespace"
        )))
    }
    Ok(())
}


//------------ Tests ---------------------------------------------------------
