//! Private and public key material.

use std::fmt;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::{hash, MessageDigest};
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, PKeyRef, Private, Public};
use openssl::rsa::Rsa;
use serde::{Deserialize, Serialize};
use crate::commons::storage::Ident;
use super::{CryptoResult, Error};


//------------ Constants -----------------------------------------------------

/// The smallest RSA modulus we are willing to create or accept.
pub const MIN_RSA_BITS: u32 = 2048;


//------------ PrivateKeyType ------------------------------------------------

/// The algorithm family of a key.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize
)]
#[serde(rename_all = "lowercase")]
pub enum PrivateKeyType {
    Rsa,
    Ec,
    Ed25519,

    #[default]
    Unknown,
}

impl PrivateKeyType {
    fn from_id(id: Id) -> Self {
        match id {
            Id::RSA => PrivateKeyType::Rsa,
            Id::EC => PrivateKeyType::Ec,
            Id::ED25519 => PrivateKeyType::Ed25519,
            _ => PrivateKeyType::Unknown,
        }
    }

    /// Returns the default size for this key type.
    ///
    /// Ed25519 keys have no choice of size and report zero.
    pub fn default_bits(self, rsa_bits: u32, ec_bits: u32) -> u32 {
        match self {
            PrivateKeyType::Rsa => rsa_bits,
            PrivateKeyType::Ec => ec_bits,
            _ => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PrivateKeyType::Rsa => "rsa",
            PrivateKeyType::Ec => "ec",
            PrivateKeyType::Ed25519 => "ed25519",
            PrivateKeyType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PrivateKeyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


//------------ Fingerprint ---------------------------------------------------

/// The SHA-256 digest of some encoded material as lowercase hex.
///
/// Since the hex digits form a valid [`Ident`], fingerprints can be used
/// directly as keys in a key-value store.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Fingerprint(Box<Ident>);

impl Fingerprint {
    pub fn of(data: &[u8]) -> CryptoResult<Self> {
        let digest = hash(MessageDigest::sha256(), data).map_err(Error::decode)?;
        Ident::boxed_from_string(hex::encode(digest))
            .map(Fingerprint)
            .map_err(Error::decode)
    }

    pub fn as_ident(&self) -> &Ident {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}


//------------ KeyMaterial ---------------------------------------------------

/// A parsed private key.
#[derive(Clone)]
pub struct KeyMaterial {
    pkey: PKey<Private>,
}

impl KeyMaterial {
    /// Creates a new key of the given type and size.
    ///
    /// For EC keys, `bits` selects the curve: 256 for P-256, 384 for P-384,
    /// and 521 for P-521. The size is ignored for Ed25519.
    pub fn generate(key_type: PrivateKeyType, bits: u32) -> CryptoResult<Self> {
        let pkey = match key_type {
            PrivateKeyType::Rsa => {
                if bits < MIN_RSA_BITS {
                    return Err(Error::KeyError(format!(
                        "RSA keys need at least {MIN_RSA_BITS} bits, got {bits}"
                    )))
                }
                let rsa = Rsa::generate(bits).map_err(Error::key_error)?;
                PKey::from_rsa(rsa).map_err(Error::key_error)?
            }
            PrivateKeyType::Ec => {
                let group = EcGroup::from_curve_name(
                    ec_curve(bits).ok_or_else(|| {
                        Error::KeyError(format!("unsupported EC size {bits}"))
                    })?
                ).map_err(Error::key_error)?;
                let ec = EcKey::generate(&group).map_err(Error::key_error)?;
                PKey::from_ec_key(ec).map_err(Error::key_error)?
            }
            PrivateKeyType::Ed25519 => {
                PKey::generate_ed25519().map_err(Error::key_error)?
            }
            PrivateKeyType::Unknown => {
                return Err(Error::KeyError(
                    "cannot generate a key of unknown type".into()
                ))
            }
        };
        Ok(KeyMaterial { pkey })
    }

    /// Parses a private key from PEM or DER.
    ///
    /// PEM may be PKCS#8 or the traditional RSA and EC formats. Only RSA,
    /// EC and Ed25519 keys are accepted.
    pub fn parse(raw: &[u8]) -> CryptoResult<Self> {
        let pkey = if is_pem(raw) {
            PKey::private_key_from_pem(raw)
        }
        else {
            PKey::private_key_from_der(raw)
        }.map_err(|err| {
            Error::DecodeError(format!("invalid private key: {err}"))
        })?;
        let res = KeyMaterial { pkey };
        if res.key_type() == PrivateKeyType::Unknown {
            return Err(Error::DecodeError("unsupported private key type".into()))
        }
        Ok(res)
    }

    pub fn key_type(&self) -> PrivateKeyType {
        PrivateKeyType::from_id(self.pkey.id())
    }

    /// Returns the key size in bits, zero for Ed25519.
    pub fn bits(&self) -> u32 {
        match self.key_type() {
            PrivateKeyType::Ed25519 => 0,
            _ => self.pkey.bits(),
        }
    }

    pub fn pkey(&self) -> &PKeyRef<Private> {
        &self.pkey
    }

    /// Returns the digest to use when signing with this key.
    pub fn digest(&self) -> MessageDigest {
        match self.key_type() {
            PrivateKeyType::Ed25519 => MessageDigest::null(),
            _ => MessageDigest::sha256(),
        }
    }

    /// Returns the key as PKCS#8 PEM.
    pub fn to_pem(&self) -> CryptoResult<String> {
        let pem = self.pkey.private_key_to_pem_pkcs8().map_err(Error::decode)?;
        String::from_utf8(pem).map_err(Error::decode)
    }

    pub fn public_key(&self) -> CryptoResult<PublicKeyInfo> {
        let der = self.pkey.public_key_to_der().map_err(Error::decode)?;
        PublicKeyInfo::from_der(&der)
    }

    /// Returns the fingerprint of the public half of the key.
    pub fn fingerprint(&self) -> CryptoResult<Fingerprint> {
        let der = self.pkey.public_key_to_der().map_err(Error::decode)?;
        Fingerprint::of(&der)
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_type", &self.key_type())
            .field("bits", &self.bits())
            .finish_non_exhaustive()
    }
}


//------------ PublicKeyInfo -------------------------------------------------

/// A parsed public key.
#[derive(Clone)]
pub struct PublicKeyInfo {
    pkey: PKey<Public>,
}

impl PublicKeyInfo {
    pub fn from_der(der: &[u8]) -> CryptoResult<Self> {
        PKey::public_key_from_der(der).map(|pkey| PublicKeyInfo { pkey })
            .map_err(|err| {
                Error::DecodeError(format!("invalid public key: {err}"))
            })
    }

    pub fn from_pem(pem: &[u8]) -> CryptoResult<Self> {
        PKey::public_key_from_pem(pem).map(|pkey| PublicKeyInfo { pkey })
            .map_err(|err| {
                Error::DecodeError(format!("invalid public key: {err}"))
            })
    }

    pub(super) fn from_pkey(pkey: PKey<Public>) -> Self {
        PublicKeyInfo { pkey }
    }

    pub fn key_type(&self) -> PrivateKeyType {
        PrivateKeyType::from_id(self.pkey.id())
    }

    pub fn bits(&self) -> u32 {
        match self.key_type() {
            PrivateKeyType::Ed25519 => 0,
            _ => self.pkey.bits(),
        }
    }

    pub fn pkey(&self) -> &PKeyRef<Public> {
        &self.pkey
    }

    /// Returns the SubjectPublicKeyInfo as PEM.
    pub fn to_pem(&self) -> CryptoResult<String> {
        let pem = self.pkey.public_key_to_pem().map_err(Error::decode)?;
        String::from_utf8(pem).map_err(Error::decode)
    }

    pub fn fingerprint(&self) -> CryptoResult<Fingerprint> {
        let der = self.pkey.public_key_to_der().map_err(Error::decode)?;
        Fingerprint::of(&der)
    }
}

impl fmt::Debug for PublicKeyInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PublicKeyInfo")
            .field("key_type", &self.key_type())
            .field("bits", &self.bits())
            .finish()
    }
}


//------------ Helpers -------------------------------------------------------

/// Returns the curve for an EC key size.
pub fn ec_curve(bits: u32) -> Option<Nid> {
    match bits {
        256 => Some(Nid::X9_62_PRIME256V1),
        384 => Some(Nid::SECP384R1),
        521 => Some(Nid::SECP521R1),
        _ => None,
    }
}

/// Returns whether the data looks like PEM rather than DER.
pub fn is_pem(raw: &[u8]) -> bool {
    raw.windows(11).any(|window| window == b"-----BEGIN ")
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_all_key_types() {
        let rsa = KeyMaterial::generate(PrivateKeyType::Rsa, 2048).unwrap();
        assert_eq!(rsa.key_type(), PrivateKeyType::Rsa);
        assert_eq!(rsa.bits(), 2048);

        let ec = KeyMaterial::generate(PrivateKeyType::Ec, 384).unwrap();
        assert_eq!(ec.key_type(), PrivateKeyType::Ec);
        assert_eq!(ec.bits(), 384);

        let ed = KeyMaterial::generate(PrivateKeyType::Ed25519, 0).unwrap();
        assert_eq!(ed.key_type(), PrivateKeyType::Ed25519);
        assert_eq!(ed.bits(), 0);
    }

    #[test]
    fn reject_weak_or_unknown_keys() {
        assert!(KeyMaterial::generate(PrivateKeyType::Rsa, 1024).is_err());
        assert!(KeyMaterial::generate(PrivateKeyType::Ec, 123).is_err());
        assert!(KeyMaterial::generate(PrivateKeyType::Unknown, 0).is_err());
    }

    #[test]
    fn parse_pem_and_der() {
        let key = KeyMaterial::generate(PrivateKeyType::Ec, 256).unwrap();
        let pem = key.to_pem().unwrap();
        let der = key.pkey().private_key_to_der().unwrap();

        let from_pem = KeyMaterial::parse(pem.as_bytes()).unwrap();
        let from_der = KeyMaterial::parse(&der).unwrap();
        assert_eq!(
            from_pem.fingerprint().unwrap(), key.fingerprint().unwrap()
        );
        assert_eq!(
            from_der.fingerprint().unwrap(), key.fingerprint().unwrap()
        );
    }

    #[test]
    fn parse_garbage_fails() {
        assert!(matches!(
            KeyMaterial::parse(b"not a key"),
            Err(Error::DecodeError(_))
        ));
    }

    #[test]
    fn public_fingerprint_matches_private() {
        let key = KeyMaterial::generate(PrivateKeyType::Ed25519, 0).unwrap();
        let public = key.public_key().unwrap();
        let reparsed = PublicKeyInfo::from_pem(
            public.to_pem().unwrap().as_bytes()
        ).unwrap();
        assert_eq!(
            reparsed.fingerprint().unwrap(), key.fingerprint().unwrap()
        );
        assert_eq!(reparsed.key_type(), PrivateKeyType::Ed25519);
    }

    #[test]
    fn key_type_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&PrivateKeyType::Ed25519).unwrap(),
            "\"ed25519\""
        );
        assert_eq!(
            serde_json::from_str::<PrivateKeyType>("\"rsa\"").unwrap(),
            PrivateKeyType::Rsa
        );
    }
}
