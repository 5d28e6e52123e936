//! Building and signing certificates.

use std::fmt;
use std::net::IpAddr;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::x509::{X509, X509Builder, X509Name, X509NameBuilder};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage,
    KeyUsage as KeyUsageExt, SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::nid::Nid;
use serde::{Deserialize, Serialize};
use super::{CryptoResult, Error, KeyMaterial, ParsedCertificate, PublicKeyInfo};


//------------ KeyUsage ------------------------------------------------------

/// A bit of the key usage extension.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize
)]
pub enum KeyUsage {
    DigitalSignature,
    ContentCommitment,
    KeyEncipherment,
    DataEncipherment,
    KeyAgreement,
    CertSign,
    CrlSign,
    EncipherOnly,
    DecipherOnly,
}


//------------ ExtKeyUsage ---------------------------------------------------

/// A purpose of the extended key usage extension.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize
)]
pub enum ExtKeyUsage {
    ServerAuth,
    ClientAuth,
    CodeSigning,
    EmailProtection,
    TimeStamping,
    OcspSigning,
}

impl fmt::Display for ExtKeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}


//------------ SubjectName ---------------------------------------------------

/// The parts of a subject distinguished name.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct SubjectName {
    pub common_name: Option<String>,
    pub organization: Vec<String>,
    pub organizational_unit: Vec<String>,
    pub country: Vec<String>,
    pub locality: Vec<String>,
    pub province: Vec<String>,
}

impl SubjectName {
    pub(super) fn to_x509_name(&self) -> CryptoResult<X509Name> {
        let mut name = X509NameBuilder::new().map_err(Error::signing)?;
        let entries = [
            (Nid::COUNTRYNAME, &self.country),
            (Nid::STATEORPROVINCENAME, &self.province),
            (Nid::LOCALITYNAME, &self.locality),
            (Nid::ORGANIZATIONNAME, &self.organization),
            (Nid::ORGANIZATIONALUNITNAME, &self.organizational_unit),
        ];
        for (nid, values) in entries {
            for value in values {
                name.append_entry_by_nid(nid, value).map_err(|err| {
                    Error::SigningError(
                        format!("invalid subject value '{value}': {err}")
                    )
                })?;
            }
        }
        if let Some(cn) = &self.common_name {
            name.append_entry_by_nid(Nid::COMMONNAME, cn).map_err(|err| {
                Error::SigningError(
                    format!("invalid common name '{cn}': {err}")
                )
            })?;
        }
        Ok(name.build())
    }
}


//------------ SubjectAltNames -----------------------------------------------

/// The entries of a subject alternative name extension.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SubjectAltNames {
    pub dns: Vec<String>,
    pub email: Vec<String>,
    pub ip: Vec<IpAddr>,
    pub uri: Vec<String>,
}

impl SubjectAltNames {
    pub fn is_empty(&self) -> bool {
        self.dns.is_empty() && self.email.is_empty()
            && self.ip.is_empty() && self.uri.is_empty()
    }

    pub(super) fn extension(&self) -> SubjectAlternativeName {
        let mut san = SubjectAlternativeName::new();
        for name in &self.dns {
            san.dns(name);
        }
        for name in &self.email {
            san.email(name);
        }
        for addr in &self.ip {
            san.ip(&addr.to_string());
        }
        for uri in &self.uri {
            san.uri(uri);
        }
        san
    }
}


//------------ CertTemplate --------------------------------------------------

/// Everything that goes into a certificate apart from the keys.
#[derive(Debug)]
pub struct CertTemplate {
    pub subject: SubjectName,
    pub alt_names: SubjectAltNames,
    pub serial: BigNum,

    /// The start of the validity period as a Unix timestamp.
    pub not_before: i64,

    /// The end of the validity period as a Unix timestamp.
    pub not_after: i64,

    pub is_ca: bool,
    pub max_path_length: Option<u32>,
    pub key_usage: Vec<KeyUsage>,
    pub ext_key_usage: Vec<ExtKeyUsage>,
}


//------------ CertSigner ----------------------------------------------------

/// Who signs a new certificate.
#[derive(Clone, Copy, Debug)]
pub enum CertSigner<'a> {
    /// The certificate signs itself with the key it certifies.
    SelfSigned(&'a KeyMaterial),

    /// An issuer signs with its key.
    Issuer {
        cert: &'a ParsedCertificate,
        key: &'a KeyMaterial,
    },
}

impl<'a> CertSigner<'a> {
    fn key(self) -> &'a KeyMaterial {
        match self {
            CertSigner::SelfSigned(key) => key,
            CertSigner::Issuer { key, .. } => key,
        }
    }
}


//------------ build_certificate ---------------------------------------------

/// Builds and signs a certificate for `subject_key`.
pub fn build_certificate(
    template: &CertTemplate,
    subject_key: &PublicKeyInfo,
    signer: CertSigner,
) -> CryptoResult<ParsedCertificate> {
    let issuer_cert = match signer {
        CertSigner::SelfSigned(_) => None,
        CertSigner::Issuer { cert, .. } => Some(cert.x509()),
    };

    let mut builder = X509Builder::new().map_err(Error::signing)?;
    builder.set_version(2).map_err(Error::signing)?;
    let serial = template.serial.to_asn1_integer().map_err(Error::signing)?;
    builder.set_serial_number(&serial).map_err(Error::signing)?;

    let subject = template.subject.to_x509_name()?;
    builder.set_subject_name(&subject).map_err(Error::signing)?;
    let issuer_name = match issuer_cert {
        Some(cert) => cert.subject_name(),
        None => &*subject,
    };
    builder.set_issuer_name(issuer_name).map_err(Error::signing)?;

    let not_before = Asn1Time::from_unix(template.not_before)
        .map_err(Error::signing)?;
    let not_after = Asn1Time::from_unix(template.not_after)
        .map_err(Error::signing)?;
    builder.set_not_before(&not_before).map_err(Error::signing)?;
    builder.set_not_after(&not_after).map_err(Error::signing)?;
    builder.set_pubkey(subject_key.pkey()).map_err(Error::signing)?;

    let mut constraints = BasicConstraints::new();
    constraints.critical();
    if template.is_ca {
        constraints.ca();
        if let Some(len) = template.max_path_length {
            constraints.pathlen(len);
        }
    }
    builder.append_extension(
        constraints.build().map_err(Error::signing)?
    ).map_err(Error::signing)?;

    if !template.key_usage.is_empty() {
        builder.append_extension(
            key_usage_extension(&template.key_usage)?
        ).map_err(Error::signing)?;
    }

    if !template.ext_key_usage.is_empty() {
        builder.append_extension(
            ext_key_usage_extension(&template.ext_key_usage)?
        ).map_err(Error::signing)?;
    }

    let ski = SubjectKeyIdentifier::new().build(
        &builder.x509v3_context(issuer_cert, None)
    ).map_err(Error::signing)?;
    builder.append_extension(ski).map_err(Error::signing)?;

    if issuer_cert.is_some() {
        let aki = AuthorityKeyIdentifier::new().keyid(true).build(
            &builder.x509v3_context(issuer_cert, None)
        ).map_err(Error::signing)?;
        builder.append_extension(aki).map_err(Error::signing)?;
    }

    if !template.alt_names.is_empty() {
        let san = template.alt_names.extension().build(
            &builder.x509v3_context(issuer_cert, None)
        ).map_err(Error::signing)?;
        builder.append_extension(san).map_err(Error::signing)?;
    }

    let key = signer.key();
    builder.sign(key.pkey(), key.digest()).map_err(Error::signing)?;
    let cert: X509 = builder.build();
    Ok(ParsedCertificate::from_x509(cert))
}

fn key_usage_extension(
    usage: &[KeyUsage]
) -> CryptoResult<openssl::x509::X509Extension> {
    let mut ext = KeyUsageExt::new();
    ext.critical();
    for item in usage {
        match item {
            KeyUsage::DigitalSignature => ext.digital_signature(),
            KeyUsage::ContentCommitment => ext.non_repudiation(),
            KeyUsage::KeyEncipherment => ext.key_encipherment(),
            KeyUsage::DataEncipherment => ext.data_encipherment(),
            KeyUsage::KeyAgreement => ext.key_agreement(),
            KeyUsage::CertSign => ext.key_cert_sign(),
            KeyUsage::CrlSign => ext.crl_sign(),
            KeyUsage::EncipherOnly => ext.encipher_only(),
            KeyUsage::DecipherOnly => ext.decipher_only(),
        };
    }
    ext.build().map_err(Error::signing)
}

fn ext_key_usage_extension(
    usage: &[ExtKeyUsage]
) -> CryptoResult<openssl::x509::X509Extension> {
    let mut ext = ExtendedKeyUsage::new();
    for item in usage {
        match item {
            ExtKeyUsage::ServerAuth => ext.server_auth(),
            ExtKeyUsage::ClientAuth => ext.client_auth(),
            ExtKeyUsage::CodeSigning => ext.code_signing(),
            ExtKeyUsage::EmailProtection => ext.email_protection(),
            ExtKeyUsage::TimeStamping => ext.time_stamping(),
            ExtKeyUsage::OcspSigning => ext.other("OCSPSigning"),
        };
    }
    ext.build().map_err(Error::signing)
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commons::crypto::{random_serial, PrivateKeyType};

    fn template(cn: &str, is_ca: bool, ttl: i64) -> CertTemplate {
        let now = chrono::Utc::now().timestamp();
        CertTemplate {
            subject: SubjectName {
                common_name: Some(cn.into()),
                organization: vec!["Example Org".into()],
                ..Default::default()
            },
            alt_names: SubjectAltNames {
                dns: vec![cn.into()],
                ..Default::default()
            },
            serial: random_serial().unwrap(),
            not_before: now,
            not_after: now + ttl,
            is_ca,
            max_path_length: None,
            key_usage: vec![KeyUsage::DigitalSignature, KeyUsage::CertSign],
            ext_key_usage: vec![ExtKeyUsage::ServerAuth],
        }
    }

    #[test]
    fn self_signed_certificate() {
        let key = KeyMaterial::generate(PrivateKeyType::Rsa, 2048).unwrap();
        let cert = build_certificate(
            &template("root.example.com", true, 3600),
            &key.public_key().unwrap(),
            CertSigner::SelfSigned(&key),
        ).unwrap();

        assert!(cert.is_self_signed());
        assert_eq!(cert.common_name().as_deref(), Some("root.example.com"));
        assert_eq!(cert.validity_seconds().unwrap(), 3600);
        assert_eq!(
            cert.public_key().unwrap().fingerprint().unwrap(),
            key.fingerprint().unwrap()
        );
    }

    #[test]
    fn issued_certificate_verifies_against_issuer() {
        let root_key = KeyMaterial::generate(PrivateKeyType::Ec, 256).unwrap();
        let root = build_certificate(
            &template("root.example.com", true, 7200),
            &root_key.public_key().unwrap(),
            CertSigner::SelfSigned(&root_key),
        ).unwrap();

        let leaf_key = KeyMaterial::generate(
            PrivateKeyType::Ed25519, 0
        ).unwrap();
        let leaf = build_certificate(
            &template("www.example.com", false, 3600),
            &leaf_key.public_key().unwrap(),
            CertSigner::Issuer { cert: &root, key: &root_key },
        ).unwrap();

        assert!(leaf.is_issued_by(&root));
        assert!(!leaf.is_self_signed());
        assert!(!root.is_issued_by(&leaf));
    }

    #[test]
    fn ed25519_can_sign() {
        let key = KeyMaterial::generate(PrivateKeyType::Ed25519, 0).unwrap();
        let cert = build_certificate(
            &template("ed.example.com", true, 60),
            &key.public_key().unwrap(),
            CertSigner::SelfSigned(&key),
        ).unwrap();
        assert!(cert.is_self_signed());
    }
}
