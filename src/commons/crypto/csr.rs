//! Certificate signing requests.

use std::fmt;
use std::sync::Arc;
use openssl::stack::Stack;
use openssl::x509::{X509Req, X509ReqBuilder};
use openssl::x509::extension::BasicConstraints;
use super::{CryptoResult, Error, KeyMaterial, PublicKeyInfo};
use super::builder::{SubjectAltNames, SubjectName};
use super::cert::common_name;
use super::keys::is_pem;


//------------ ParsedCsr -----------------------------------------------------

/// A parsed certificate signing request with a valid self-signature.
///
/// Clones share the underlying request.
#[derive(Clone)]
pub struct ParsedCsr {
    req: Arc<X509Req>,
}

impl ParsedCsr {
    /// Parses a CSR from PEM or DER and checks its signature.
    pub fn parse(raw: &[u8]) -> CryptoResult<Self> {
        let req = if is_pem(raw) {
            X509Req::from_pem(raw)
        }
        else {
            X509Req::from_der(raw)
        }.map_err(|err| Error::DecodeError(format!("invalid CSR: {err}")))?;
        let key = req.public_key().map_err(|err| {
            Error::DecodeError(format!("invalid CSR public key: {err}"))
        })?;
        if !req.verify(&key).map_err(Error::decode)? {
            return Err(Error::DecodeError("CSR signature does not verify".into()))
        }
        Ok(ParsedCsr { req: Arc::new(req) })
    }

    pub fn public_key(&self) -> CryptoResult<PublicKeyInfo> {
        self.req.public_key().map(PublicKeyInfo::from_pkey).map_err(|err| {
            Error::DecodeError(format!("invalid CSR public key: {err}"))
        })
    }

    pub fn common_name(&self) -> Option<String> {
        common_name(self.req.subject_name())
    }

    pub fn to_pem(&self) -> CryptoResult<String> {
        let pem = self.req.to_pem().map_err(Error::decode)?;
        String::from_utf8(pem).map_err(Error::decode)
    }
}

impl fmt::Debug for ParsedCsr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ParsedCsr")
            .field("subject", &self.common_name())
            .finish()
    }
}


//------------ build_csr -----------------------------------------------------

/// Creates a CSR for `key`, signed with that key.
///
/// When `is_ca` is set the request asks for CA basic constraints.
pub fn build_csr(
    subject: &SubjectName,
    alt_names: &SubjectAltNames,
    key: &KeyMaterial,
    is_ca: bool,
) -> CryptoResult<ParsedCsr> {
    let mut builder = X509ReqBuilder::new().map_err(Error::signing)?;
    builder.set_version(0).map_err(Error::signing)?;
    let name = subject.to_x509_name()?;
    builder.set_subject_name(&name).map_err(Error::signing)?;
    builder.set_pubkey(key.pkey()).map_err(Error::signing)?;

    let mut extensions = Stack::new().map_err(Error::signing)?;
    if is_ca {
        extensions.push(
            BasicConstraints::new().critical().ca().build()
                .map_err(Error::signing)?
        ).map_err(Error::signing)?;
    }
    if !alt_names.is_empty() {
        let san = alt_names.extension().build(
            &builder.x509v3_context(None)
        ).map_err(Error::signing)?;
        extensions.push(san).map_err(Error::signing)?;
    }
    if !extensions.is_empty() {
        builder.add_extensions(&extensions).map_err(Error::signing)?;
    }

    builder.sign(key.pkey(), key.digest()).map_err(Error::signing)?;
    Ok(ParsedCsr { req: Arc::new(builder.build()) })
}


//------------ Tests ---------------------------------------------------------
