//! The certificate generation pipeline.
//!
//! Generating a certificate runs through these steps:
//!
//! 1. resolve the parameters from the request, the role, and the issuer,
//! 2. acquire the subject key by generating it, using a stored or supplied
//!    key, or taking the public key of a CSR,
//! 3. build and sign the certificate, and
//! 4. assemble the result into a [`CertificateBundle`].
//!
//! Nothing is persisted here. The pipeline checks for cancellation between
//! the steps and returns [`Error::Cancelled`] when asked to stop.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use crate::commons::{PkiEmptyResult, PkiResult};
use crate::commons::crypto::{
    build_certificate, build_csr, random_serial, CertSigner, CertTemplate,
    ExtKeyUsage, KeyMaterial, KeyUsage, ParsedCertificate, ParsedCsr,
    PrivateKeyType, PublicKeyInfo, SubjectAltNames, SubjectName,
};
use crate::commons::error::Error;
use crate::config::IssuanceConfig;
use super::entities::{Issuer, IssuerId, Key, KeyId};
use super::role::{is_valid_hostname, NotAfterBehavior, Role};
use super::store::PkiStore;


//------------ Exported ------------------------------------------------------

/// Whether a generated private key is returned to the caller.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Exported {
    #[default]
    Internal,
    Exported,
}


//------------ GenerationRequest ---------------------------------------------

/// The caller’s parameters for a new certificate.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct GenerationRequest {
    pub common_name: String,

    /// Additional DNS names or email addresses.
    pub alt_names: Vec<String>,
    pub ip_sans: Vec<String>,
    pub uri_sans: Vec<String>,

    /// The requested TTL in seconds.
    pub ttl: Option<u64>,

    pub key_type: Option<PrivateKeyType>,
    pub key_bits: Option<u32>,
    pub exclude_cn_from_sans: bool,

    /// Restricts the extended key usages to a subset of the role’s.
    pub ext_key_usage: Vec<ExtKeyUsage>,

    /// The path length constraint for CA certificates.
    pub max_path_length: Option<u32>,

    pub exported: Exported,
}

impl GenerationRequest {
    pub fn with_common_name(common_name: impl Into<String>) -> Self {
        GenerationRequest {
            common_name: common_name.into(),
            ..Default::default()
        }
    }
}


//------------ KeySource -----------------------------------------------------

/// Where the key of a new certificate comes from.
#[derive(Clone, Debug, Default)]
pub enum KeySource {
    /// Generate a new key according to request and role.
    #[default]
    Generate,

    /// Use a stored key.
    Existing(Key),

    /// Use a key supplied with the request.
    Supplied(KeyMaterial),

    /// Certify the public key of a CSR.
    Csr(ParsedCsr),
}


//------------ GenerationInput -----------------------------------------------

/// Everything the pipeline needs apart from the signing issuer.
#[derive(Clone, Debug)]
pub struct GenerationInput {
    pub role: Role,
    pub request: GenerationRequest,
    pub key_source: KeySource,
    pub is_ca: bool,
    pub config: IssuanceConfig,
}


//------------ SigningBundle -------------------------------------------------

/// An issuer loaded together with its parsed certificate and private key.
#[derive(Clone, Debug)]
pub struct SigningBundle {
    pub issuer: Issuer,
    pub cert: ParsedCertificate,
    pub key: KeyMaterial,
}

impl SigningBundle {
    /// Loads an issuer and checks that it can sign.
    ///
    /// The issuer’s key must hold a private key that matches the
    /// certificate.
    pub fn load(store: &PkiStore, id: &IssuerId) -> PkiResult<Self> {
        let issuer = store.fetch_issuer_by_id(id)?;
        let key = store.fetch_key_by_id(&issuer.key_id).map_err(|err| {
            match err {
                Error::NotFound(_) => Error::signing(format!(
                    "key '{}' of issuer '{}' does not exist",
                    issuer.key_id, issuer.id
                )),
                err => err,
            }
        })?;
        let material = key.material()?;
        let cert = issuer.parse_certificate()?;
        if cert.public_key()?.fingerprint()? != material.fingerprint()? {
            return Err(Error::signing(format!(
                "key '{}' does not match the certificate of issuer '{}'",
                key.id, issuer.id
            )))
        }
        Ok(SigningBundle { issuer, cert, key: material })
    }

    /// Returns the chain for certificates issued by this issuer.
    ///
    /// This is the issuer’s certificate followed by its own chain.
    pub fn chain(&self) -> Vec<String> {
        let mut res = vec![self.issuer.certificate.clone()];
        for cert in &self.issuer.ca_chain {
            if !res.contains(cert) {
                res.push(cert.clone())
            }
        }
        res
    }
}


//------------ CertificateBundle ---------------------------------------------

/// A new certificate together with its chain and possibly its key.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct CertificateBundle {
    /// The certificate as PEM.
    pub certificate: String,

    /// The chain of the signing issuer, starting with its certificate.
    ///
    /// For a self-signed certificate this is the certificate itself.
    pub ca_chain: Vec<String>,

    /// The private key as PEM if it is known.
    pub private_key: Option<String>,
    pub private_key_type: PrivateKeyType,
    pub serial_number: String,
}

impl CertificateBundle {
    /// Converts the bundle into new issuer and key records.
    ///
    /// This does not store anything.
    pub fn to_issuer_and_key(&self) -> PkiResult<(Issuer, Key)> {
        let pem = self.private_key.as_ref().ok_or_else(|| {
            Error::malformed("certificate bundle has no private key")
        })?;
        let material = KeyMaterial::parse(pem.as_bytes())?;
        let key = Key::from_material(
            KeyId::generate(), pem.as_bytes(), &material
        )?;
        let mut ca_chain = vec![self.certificate.clone()];
        for cert in &self.ca_chain {
            if !ca_chain.contains(cert) {
                ca_chain.push(cert.clone())
            }
        }
        let issuer = Issuer {
            id: IssuerId::generate(),
            name: String::new(),
            key_id: key.id.clone(),
            certificate: self.certificate.clone(),
            ca_chain,
            serial_number: self.serial_number.clone(),
        };
        Ok((issuer, key))
    }

    /// Removes the private key unless it is to be exported.
    pub fn restrict(mut self, exported: Exported) -> Self {
        if exported == Exported::Internal {
            self.private_key = None;
        }
        self
    }
}


//------------ CsrBundle -----------------------------------------------------

/// A new CSR together with its private key.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct CsrBundle {
    pub csr: String,
    pub private_key: Option<String>,
    pub private_key_type: PrivateKeyType,
}

impl CsrBundle {
    /// Removes the private key unless it is to be exported.
    pub fn restrict(mut self, exported: Exported) -> Self {
        if exported == Exported::Internal {
            self.private_key = None;
        }
        self
    }
}


//------------ Cancellation --------------------------------------------------

/// A flag to stop a running generation.
#[derive(Clone, Debug, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns an error if cancellation was requested.
    pub fn check(&self) -> PkiEmptyResult {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        }
        else {
            Ok(())
        }
    }
}


//------------ generate_cert -------------------------------------------------

/// Generates a certificate.
///
/// Without a signing bundle the certificate is self-signed, which
/// requires the private key of the subject.
pub fn generate_cert(
    input: &GenerationInput,
    signing: Option<&SigningBundle>,
    cancel: &Cancellation,
) -> PkiResult<CertificateBundle> {
    cancel.check()?;
    let now = chrono::Utc::now().timestamp();
    let params = CertParams::resolve(input, signing, now)?;

    cancel.check()?;
    let subject_key = SubjectKey::acquire(input)?;

    cancel.check()?;
    let template = params.into_template()?;
    let signer = match signing {
        Some(bundle) => CertSigner::Issuer {
            cert: &bundle.cert, key: &bundle.key
        },
        None => match subject_key.material.as_ref() {
            Some(material) => CertSigner::SelfSigned(material),
            None => {
                return Err(Error::malformed(
                    "a self-signed certificate needs a private key"
                ))
            }
        }
    };
    let cert = build_certificate(&template, &subject_key.public, signer)?;

    cancel.check()?;
    let certificate = cert.to_pem()?;
    let ca_chain = match signing {
        Some(bundle) => bundle.chain(),
        None => vec![certificate.clone()],
    };
    let bundle = CertificateBundle {
        certificate,
        ca_chain,
        private_key: subject_key.private_pem,
        private_key_type: subject_key.public.key_type(),
        serial_number: cert.serial_number()?,
    };
    debug!(
        "Generated certificate with serial {} for '{}'",
        bundle.serial_number,
        template_name(&template.subject),
    );
    Ok(bundle)
}

/// Generates a certificate on a blocking thread with a time limit.
///
/// When the limit passes, the generation is cancelled and
/// [`Error::Cancelled`] returned.
pub async fn generate_cert_with_timeout(
    input: GenerationInput,
    signing: Option<SigningBundle>,
    timeout: Duration,
) -> PkiResult<CertificateBundle> {
    let cancel = Cancellation::new();
    let task_cancel = cancel.clone();
    let task = tokio::task::spawn_blocking(move || {
        generate_cert(&input, signing.as_ref(), &task_cancel)
    });
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(res)) => res,
        Ok(Err(err)) => {
            Err(Error::signing(format!("generation task failed: {err}")))
        }
        Err(_) => {
            cancel.cancel();
            warn!(
                "Certificate generation cancelled after {}ms",
                timeout.as_millis()
            );
            Err(Error::Cancelled)
        }
    }
}

/// Generates a CSR for a CA certificate.
pub fn generate_csr(
    input: &GenerationInput, cancel: &Cancellation
) -> PkiResult<CsrBundle> {
    cancel.check()?;
    let now = chrono::Utc::now().timestamp();
    let params = CertParams::resolve(input, None, now)?;

    cancel.check()?;
    let subject_key = SubjectKey::acquire(input)?;
    let (Some(material), Some(private_key)) = (
        subject_key.material.as_ref(), subject_key.private_pem
    ) else {
        return Err(Error::malformed("a CSR needs a private key"))
    };

    cancel.check()?;
    let csr = build_csr(
        &params.subject, &params.alt_names, material, input.is_ca
    )?;
    Ok(CsrBundle {
        csr: csr.to_pem()?,
        private_key: Some(private_key),
        private_key_type: material.key_type(),
    })
}


//------------ CertParams ----------------------------------------------------

/// The resolved parameters of a certificate.
#[derive(Debug)]
struct CertParams {
    subject: SubjectName,
    alt_names: SubjectAltNames,
    not_before: i64,
    not_after: i64,
    is_ca: bool,
    max_path_length: Option<u32>,
    key_usage: Vec<KeyUsage>,
    ext_key_usage: Vec<ExtKeyUsage>,
}

impl CertParams {
    fn resolve(
        input: &GenerationInput,
        signing: Option<&SigningBundle>,
        now: i64,
    ) -> PkiResult<Self> {
        let role = &input.role;
        let request = &input.request;

        let mut common_name = Some(request.common_name.trim().to_string())
            .filter(|cn| !cn.is_empty());
        if common_name.is_none() && role.use_csr_common_name {
            if let KeySource::Csr(csr) = &input.key_source {
                common_name = csr.common_name();
            }
        }
        if common_name.is_none() && role.require_cn {
            return Err(Error::malformed("common_name is required"))
        }

        let mut alt_names = SubjectAltNames::default();
        if let Some(cn) = common_name.as_ref() {
            match cn.parse::<IpAddr>() {
                Ok(addr) => {
                    if !request.exclude_cn_from_sans {
                        alt_names.ip.push(addr)
                    }
                }
                Err(_) => {
                    role.check_name(cn)?;
                    if !request.exclude_cn_from_sans && is_san_name(cn) {
                        push_name(&mut alt_names, cn);
                    }
                }
            }
        }
        for name in &request.alt_names {
            let name = name.trim();
            if name.is_empty() {
                continue
            }
            role.check_name(name)?;
            push_name(&mut alt_names, name);
        }
        for addr in &request.ip_sans {
            let addr = addr.trim().parse::<IpAddr>().map_err(|_| {
                Error::malformed(format!("invalid IP SAN '{addr}'"))
            })?;
            if !alt_names.ip.contains(&addr) {
                alt_names.ip.push(addr)
            }
        }
        role.check_ip_sans(&alt_names.ip)?;
        role.check_uri_sans(&request.uri_sans)?;
        alt_names.uri = request.uri_sans.clone();

        let ttl = role.resolve_ttl(request.ttl, &input.config)?;
        let ttl = i64::try_from(ttl).map_err(|_| {
            Error::malformed(format!("TTL {ttl} is out of range"))
        })?;
        let mut not_after = now.saturating_add(ttl);
        let mut max_path_length = request.max_path_length;

        if let Some(bundle) = signing {
            let issuer_not_after = bundle.cert.not_after()?;
            if not_after > issuer_not_after {
                match role.not_after_behavior {
                    NotAfterBehavior::Err => {
                        return Err(Error::policy(format!(
                            "certificate would expire after issuer '{}'",
                            bundle.issuer.id
                        )))
                    }
                    NotAfterBehavior::Truncate => {
                        not_after = issuer_not_after
                    }
                }
            }
            if input.is_ca {
                if let Some(parent_len) = bundle.cert.path_len() {
                    if parent_len == 0 {
                        return Err(Error::policy(format!(
                            "issuer '{}' may not sign CA certificates",
                            bundle.issuer.id
                        )))
                    }
                    let limit = parent_len - 1;
                    max_path_length = Some(
                        max_path_length.map_or(limit, |len| len.min(limit))
                    );
                }
            }
        }
        if not_after <= now {
            return Err(Error::policy("certificate would already be expired"))
        }

        let (key_usage, ext_key_usage) = if input.is_ca {
            (role.key_usage.clone(), Vec::new())
        }
        else {
            (
                role.key_usage.clone(),
                role.narrow_ext_key_usage(&request.ext_key_usage)?
            )
        };

        Ok(CertParams {
            subject: role.subject(common_name),
            alt_names,
            not_before: now,
            not_after,
            is_ca: input.is_ca,
            max_path_length: if input.is_ca { max_path_length } else { None },
            key_usage,
            ext_key_usage,
        })
    }

    fn into_template(self) -> PkiResult<CertTemplate> {
        Ok(CertTemplate {
            subject: self.subject,
            alt_names: self.alt_names,
            serial: random_serial()?,
            not_before: self.not_before,
            not_after: self.not_after,
            is_ca: self.is_ca,
            max_path_length: self.max_path_length,
            key_usage: self.key_usage,
            ext_key_usage: self.ext_key_usage,
        })
    }
}

fn push_name(alt_names: &mut SubjectAltNames, name: &str) {
    let target = if name.contains('@') {
        &mut alt_names.email
    }
    else {
        &mut alt_names.dns
    };
    if !target.iter().any(|item| item == name) {
        target.push(name.into())
    }
}

/// Returns whether a common name can also be a DNS or email SAN.
fn is_san_name(name: &str) -> bool {
    let host = name.rsplit_once('@').map_or(name, |(_, host)| host);
    is_valid_hostname(host)
}

fn template_name(subject: &SubjectName) -> &str {
    subject.common_name.as_deref().unwrap_or("")
}


//------------ SubjectKey ----------------------------------------------------

/// The key a certificate is issued for.
struct SubjectKey {
    public: PublicKeyInfo,
    material: Option<KeyMaterial>,
    private_pem: Option<String>,
}

impl SubjectKey {
    fn acquire(input: &GenerationInput) -> PkiResult<Self> {
        let role = &input.role;
        match &input.key_source {
            KeySource::Generate => {
                let (key_type, bits) = role.resolve_key_params(
                    input.request.key_type, input.request.key_bits,
                    &input.config,
                )?;
                let material = KeyMaterial::generate(key_type, bits)?;
                debug!("Generated {key_type} key with {bits} bits");
                Self::from_material(material, None)
            }
            KeySource::Existing(key) => {
                let material = key.material()?;
                role.check_key(material.key_type(), material.bits())?;
                Self::from_material(material, Some(key.private_key.clone()))
            }
            KeySource::Supplied(material) => {
                role.check_key(material.key_type(), material.bits())?;
                Self::from_material(material.clone(), None)
            }
            KeySource::Csr(csr) => {
                let public = csr.public_key()?;
                role.check_key(public.key_type(), public.bits())?;
                Ok(SubjectKey { public, material: None, private_pem: None })
            }
        }
    }

    fn from_material(
        material: KeyMaterial, pem: Option<String>
    ) -> PkiResult<Self> {
        let private_pem = match pem {
            Some(pem) => pem,
            None => material.to_pem()?,
        };
        Ok(SubjectKey {
            public: material.public_key()?,
            material: Some(material),
            private_pem: Some(private_pem),
        })
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::ca::role::{RoleKeyType, TtlPolicy};
    use crate::test;
    use super::*;

    fn leaf_role() -> Role {
        Role {
            name: "web".into(),
            allowed_domains: vec!["example.com".into()],
            allow_subdomains: true,
            allow_bare_domains: true,
            key_type: RoleKeyType::Any,
            ..Default::default()
        }
    }

    fn input(role: Role, request: GenerationRequest) -> GenerationInput {
        GenerationInput {
            role,
            request,
            key_source: KeySource::Generate,
            is_ca: false,
            config: IssuanceConfig::default(),
        }
    }

    fn root_bundle(store: &PkiStore) -> SigningBundle {
        let (issuer, key) = test::gen_issuer_and_key("root.example.com");
        store.write_key(&key).unwrap();
        store.write_issuer(&issuer).unwrap();
        SigningBundle::load(store, &issuer.id).unwrap()
    }

    #[test]
    fn self_signed_root() {
        let mut root_input = input(
            Role::for_ca(),
            GenerationRequest {
                common_name: "Root CA".into(),
                ttl: Some(3600),
                ..Default::default()
            }
        );
        root_input.is_ca = true;
        let bundle = generate_cert(
            &root_input, None, &Cancellation::new()
        ).unwrap();

        let cert = ParsedCertificate::parse(
            bundle.certificate.as_bytes()
        ).unwrap();
        assert!(cert.is_self_signed());
        assert_eq!(bundle.ca_chain, vec![bundle.certificate.clone()]);
        assert!(bundle.private_key.is_some());
        assert_eq!(bundle.private_key_type, PrivateKeyType::Rsa);
        assert_eq!(bundle.serial_number, cert.serial_number().unwrap());
    }

    #[test]
    fn leaf_ttl_is_exact() {
        let store = test::mem_store();
        let signing = root_bundle(&store);
        let bundle = generate_cert(
            &input(leaf_role(), GenerationRequest {
                common_name: "www.example.com".into(),
                ttl: Some(3600),
                ..Default::default()
            }),
            Some(&signing),
            &Cancellation::new()
        ).unwrap();

        let cert = ParsedCertificate::parse(
            bundle.certificate.as_bytes()
        ).unwrap();
        assert_eq!(cert.validity_seconds().unwrap(), 3600);
        assert!(cert.is_issued_by(&signing.cert));
        assert_eq!(bundle.ca_chain, signing.chain());
    }

    #[test]
    fn strict_ttl_is_rejected() {
        let store = test::mem_store();
        let signing = root_bundle(&store);
        let role = Role {
            max_ttl: Some(3600),
            ttl_policy: TtlPolicy::Strict,
            ..leaf_role()
        };
        let res = generate_cert(
            &input(role, GenerationRequest {
                common_name: "www.example.com".into(),
                ttl: Some(7200),
                ..Default::default()
            }),
            Some(&signing),
            &Cancellation::new()
        );
        assert!(matches!(res, Err(Error::PolicyViolation(_))));
    }

    #[test]
    fn clamped_ttl() {
        let store = test::mem_store();
        let signing = root_bundle(&store);
        let role = Role { max_ttl: Some(3600), ..leaf_role() };
        let bundle = generate_cert(
            &input(role, GenerationRequest {
                common_name: "www.example.com".into(),
                ttl: Some(7200),
                ..Default::default()
            }),
            Some(&signing),
            &Cancellation::new()
        ).unwrap();
        let cert = ParsedCertificate::parse(
            bundle.certificate.as_bytes()
        ).unwrap();
        assert_eq!(cert.validity_seconds().unwrap(), 3600);
    }

    #[test]
    fn outliving_the_issuer() {
        let store = test::mem_store();
        let signing = root_bundle(&store);
        let request = GenerationRequest {
            common_name: "www.example.com".into(),
            ttl: Some(365 * 24 * 3600),
            ..Default::default()
        };

        let res = generate_cert(
            &input(leaf_role(), request.clone()),
            Some(&signing),
            &Cancellation::new()
        );
        assert!(matches!(res, Err(Error::PolicyViolation(_))));

        let role = Role {
            not_after_behavior: NotAfterBehavior::Truncate, ..leaf_role()
        };
        let bundle = generate_cert(
            &input(role, request), Some(&signing), &Cancellation::new()
        ).unwrap();
        let cert = ParsedCertificate::parse(
            bundle.certificate.as_bytes()
        ).unwrap();
        assert_eq!(
            cert.not_after().unwrap(), signing.cert.not_after().unwrap()
        );
    }

    #[test]
    fn name_policy_is_applied() {
        let store = test::mem_store();
        let signing = root_bundle(&store);
        let res = generate_cert(
            &input(leaf_role(), GenerationRequest {
                common_name: "www.example.org".into(),
                ..Default::default()
            }),
            Some(&signing),
            &Cancellation::new()
        );
        assert!(matches!(res, Err(Error::PolicyViolation(_))));

        let res = generate_cert(
            &input(leaf_role(), GenerationRequest {
                common_name: "www.example.com".into(),
                alt_names: vec!["evil.example.net".into()],
                ..Default::default()
            }),
            Some(&signing),
            &Cancellation::new()
        );
        assert!(matches!(res, Err(Error::PolicyViolation(_))));

        let res = generate_cert(
            &input(leaf_role(), GenerationRequest::default()),
            Some(&signing),
            &Cancellation::new()
        );
        assert!(matches!(res, Err(Error::MalformedRequest(_))));

        let res = generate_cert(
            &input(leaf_role(), GenerationRequest {
                common_name: "www.example.com".into(),
                ip_sans: vec!["not-an-ip".into()],
                ..Default::default()
            }),
            Some(&signing),
            &Cancellation::new()
        );
        assert!(matches!(res, Err(Error::MalformedRequest(_))));
    }

    #[test]
    fn sign_csr() {
        let store = test::mem_store();
        let signing = root_bundle(&store);
        let key = KeyMaterial::generate(PrivateKeyType::Ec, 256).unwrap();
        let csr = build_csr(
            &SubjectName {
                common_name: Some("api.example.com".into()),
                ..Default::default()
            },
            &SubjectAltNames::default(),
            &key,
            false,
        ).unwrap();

        let mut csr_input = input(leaf_role(), GenerationRequest {
            ttl: Some(3600), ..Default::default()
        });
        csr_input.key_source = KeySource::Csr(csr);
        let bundle = generate_cert(
            &csr_input, Some(&signing), &Cancellation::new()
        ).unwrap();

        assert!(bundle.private_key.is_none());
        assert_eq!(bundle.private_key_type, PrivateKeyType::Ec);
        let cert = ParsedCertificate::parse(
            bundle.certificate.as_bytes()
        ).unwrap();
        assert_eq!(cert.common_name().as_deref(), Some("api.example.com"));
        assert_eq!(
            cert.public_key().unwrap().fingerprint().unwrap(),
            key.fingerprint().unwrap()
        );

        // Self-signing a CSR is impossible.
        let res = generate_cert(&csr_input, None, &Cancellation::new());
        assert!(matches!(res, Err(Error::MalformedRequest(_))));
    }

    #[test]
    fn existing_key_is_used() {
        let (_, key) = test::gen_issuer_and_key("example.com");
        let mut ca_input = input(
            Role::for_ca(), GenerationRequest::with_common_name("Root")
        );
        ca_input.is_ca = true;
        ca_input.key_source = KeySource::Existing(key.clone());
        let bundle = generate_cert(
            &ca_input, None, &Cancellation::new()
        ).unwrap();
        assert_eq!(bundle.private_key.as_ref(), Some(&key.private_key));

        let cert = ParsedCertificate::parse(
            bundle.certificate.as_bytes()
        ).unwrap();
        assert_eq!(
            cert.public_key().unwrap().fingerprint().unwrap(),
            key.fingerprint().unwrap()
        );
    }

    #[test]
    fn key_type_policy() {
        let store = test::mem_store();
        let signing = root_bundle(&store);
        let role = Role { key_type: RoleKeyType::Rsa, ..leaf_role() };
        let res = generate_cert(
            &input(role, GenerationRequest {
                common_name: "www.example.com".into(),
                key_type: Some(PrivateKeyType::Ed25519),
                ..Default::default()
            }),
            Some(&signing),
            &Cancellation::new()
        );
        assert!(matches!(res, Err(Error::PolicyViolation(_))));
    }

    #[test]
    fn path_length_is_limited_by_parent() {
        let store = test::mem_store();
        let mut root_input = input(
            Role::for_ca(),
            GenerationRequest {
                common_name: "Root".into(),
                max_path_length: Some(0),
                ttl: Some(7200),
                ..Default::default()
            }
        );
        root_input.is_ca = true;
        let bundle = generate_cert(
            &root_input, None, &Cancellation::new()
        ).unwrap();
        let (issuer, key) = bundle.to_issuer_and_key().unwrap();
        store.write_key(&key).unwrap();
        store.write_issuer(&issuer).unwrap();
        let signing = SigningBundle::load(&store, &issuer.id).unwrap();

        let mut ca_input = input(
            Role::for_ca(),
            GenerationRequest {
                common_name: "Sub".into(),
                ttl: Some(60),
                ..Default::default()
            }
        );
        ca_input.is_ca = true;
        let res = generate_cert(&ca_input, Some(&signing), &Cancellation::new());
        assert!(matches!(res, Err(Error::PolicyViolation(_))));

        // leaves are fine
        let leaf = generate_cert(
            &input(leaf_role(), GenerationRequest {
                common_name: "www.example.com".into(),
                ttl: Some(60),
                ..Default::default()
            }),
            Some(&signing),
            &Cancellation::new()
        );
        assert!(leaf.is_ok());
    }

    #[test]
    fn cancelled_before_start() {
        let cancel = Cancellation::new();
        cancel.cancel();
        let res = generate_cert(
            &input(leaf_role(), GenerationRequest::with_common_name(
                "www.example.com"
            )),
            None,
            &cancel
        );
        assert!(matches!(res, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn timeout_cancels() {
        let mut ca_input = input(Role::for_ca(), GenerationRequest {
            common_name: "Slow Root".into(),
            key_type: Some(PrivateKeyType::Rsa),
            key_bits: Some(4096),
            ..Default::default()
        });
        ca_input.is_ca = true;
        let res = generate_cert_with_timeout(
            ca_input, None, Duration::from_nanos(1)
        ).await;
        assert!(matches!(res, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn timeout_not_reached() {
        let mut ca_input = input(
            Role::for_ca(),
            GenerationRequest {
                common_name: "Root".into(),
                key_type: Some(PrivateKeyType::Ec),
                ..Default::default()
            }
        );
        ca_input.is_ca = true;
        let bundle = generate_cert_with_timeout(
            ca_input, None, Duration::from_secs(60)
        ).await.unwrap();
        assert_eq!(bundle.private_key_type, PrivateKeyType::Ec);
    }

    #[test]
    fn csr_for_intermediate() {
        let mut ca_input = input(
            Role::for_ca(), GenerationRequest::with_common_name("Sub CA")
        );
        ca_input.is_ca = true;
        let bundle = generate_csr(&ca_input, &Cancellation::new()).unwrap();
        let csr = ParsedCsr::parse(bundle.csr.as_bytes()).unwrap();
        let key = KeyMaterial::parse(
            bundle.private_key.as_ref().unwrap().as_bytes()
        ).unwrap();
        assert_eq!(csr.common_name().as_deref(), Some("Sub CA"));
        assert_eq!(
            csr.public_key().unwrap().fingerprint().unwrap(),
            key.fingerprint().unwrap()
        );
    }

    #[test]
    fn signing_bundle_needs_private_key() {
        let store = test::mem_store();
        let (issuer, _) = test::gen_issuer_and_key("example.com");
        let (imported, _) = store.import_issuer(
            issuer.certificate.as_bytes()
        ).unwrap();
        assert!(matches!(
            SigningBundle::load(&store, &imported.id),
            Err(Error::SigningFailure(_))
        ));
        assert!(matches!(
            SigningBundle::load(&store, &IssuerId::generate()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn bundle_restriction() {
        let bundle = CertificateBundle {
            private_key: Some("key".into()),
            ..Default::default()
        };
        assert!(bundle.clone().restrict(Exported::Exported).private_key.is_some());
        assert!(bundle.restrict(Exported::Internal).private_key.is_none());
    }
}
