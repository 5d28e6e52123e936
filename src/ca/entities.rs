//! The records kept by the PKI store.

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::commons::PkiResult;
use crate::commons::crypto::{
    split_pem, Fingerprint, KeyMaterial, ParsedCertificate, PrivateKeyType,
    PublicKeyInfo,
};
use crate::commons::error::Error;
use crate::commons::storage::Ident;


//------------ KeyId and IssuerId --------------------------------------------

macro_rules! entity_id {
    ( $name:ident, $kind:expr ) => {
        /// An opaque identifier.
        ///
        /// New identifiers are random UUIDs. The empty identifier is the
        /// unset value.
        #[derive(
            Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq,
            PartialOrd, Serialize
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new random identifier.
            pub fn generate() -> Self {
                $name(Uuid::new_v4().to_string())
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Returns the identifier as a storage key.
            pub fn ident(&self) -> PkiResult<&Ident> {
                Ident::from_str(&self.0).map_err(|_| {
                    Error::malformed(format!(
                        "invalid {} ID '{}'", $kind, self.0
                    ))
                })
            }
        }

        impl From<String> for $name {
            fn from(src: String) -> Self {
                $name(src)
            }
        }

        impl From<&str> for $name {
            fn from(src: &str) -> Self {
                $name(src.into())
            }
        }

        impl From<&Ident> for $name {
            fn from(src: &Ident) -> Self {
                $name(src.as_str().into())
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok($name(s.into()))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    }
}

entity_id!(KeyId, "key");
entity_id!(IssuerId, "issuer");


//------------ Key -----------------------------------------------------------

/// A stored key pair, or only its public half.
///
/// Keys created for imported certificates without a matching private key
/// have an empty `private_key`.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct Key {
    pub id: KeyId,
    pub name: String,
    pub private_key_type: PrivateKeyType,

    /// The private key as PEM, or empty.
    pub private_key: String,

    /// The SubjectPublicKeyInfo as PEM.
    pub public_key: String,
}

impl Key {
    /// Creates a new key record for private key material.
    ///
    /// If `raw` is PEM text, its private key block is kept as is. Other
    /// blocks are dropped. DER input is stored as PKCS#8 PEM.
    pub fn from_material(
        id: KeyId, raw: &[u8], material: &KeyMaterial
    ) -> PkiResult<Self> {
        let block = std::str::from_utf8(raw).ok()
            .and_then(|text| split_pem(text).ok())
            .and_then(|blocks| {
                blocks.into_iter().find(|block| block.is_private_key())
            });
        let private_key = match block {
            Some(block) => block.text,
            None => material.to_pem()?,
        };
        Ok(Key {
            id,
            name: String::new(),
            private_key_type: material.key_type(),
            private_key,
            public_key: material.public_key()?.to_pem()?,
        })
    }

    /// Creates a key record holding only a public key.
    pub fn from_public(id: KeyId, public: &PublicKeyInfo) -> PkiResult<Self> {
        Ok(Key {
            id,
            name: String::new(),
            private_key_type: public.key_type(),
            private_key: String::new(),
            public_key: public.to_pem()?,
        })
    }

    pub fn has_private_key(&self) -> bool {
        !self.private_key.is_empty()
    }

    /// Parses the private key.
    pub fn material(&self) -> PkiResult<KeyMaterial> {
        if !self.has_private_key() {
            return Err(Error::signing(format!(
                "key '{}' has no private key", self.id
            )))
        }
        KeyMaterial::parse(self.private_key.as_bytes()).map_err(|err| {
            Error::signing(format!("key '{}' is unusable: {err}", self.id))
        })
    }

    /// Returns the public key.
    ///
    /// This uses the private key if present and the stored public key
    /// otherwise.
    pub fn public_key_info(&self) -> PkiResult<PublicKeyInfo> {
        if self.has_private_key() {
            Ok(self.material()?.public_key()?)
        }
        else {
            PublicKeyInfo::from_pem(self.public_key.as_bytes()).map_err(|err| {
                Error::signing(format!("key '{}' is unusable: {err}", self.id))
            })
        }
    }

    /// Returns the fingerprint of the public key.
    pub fn fingerprint(&self) -> PkiResult<Fingerprint> {
        Ok(self.public_key_info()?.fingerprint()?)
    }

    pub fn info(&self) -> KeyInfo {
        KeyInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            private_key_type: self.private_key_type,
            has_private_key: self.has_private_key(),
        }
    }
}


//------------ Issuer --------------------------------------------------------

/// A stored CA certificate.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct Issuer {
    pub id: IssuerId,
    pub name: String,

    /// The key certified by the certificate.
    pub key_id: KeyId,

    /// The certificate as PEM.
    pub certificate: String,

    /// The certificate followed by its ancestors, as PEM.
    pub ca_chain: Vec<String>,

    /// The serial number as colon-separated hex.
    pub serial_number: String,
}

impl Issuer {
    pub fn parse_certificate(&self) -> PkiResult<ParsedCertificate> {
        ParsedCertificate::parse(self.certificate.as_bytes()).map_err(|err| {
            Error::signing(format!(
                "certificate of issuer '{}' is unusable: {err}", self.id
            ))
        })
    }

    /// Returns the fingerprint of the certificate.
    pub fn fingerprint(&self) -> PkiResult<Fingerprint> {
        Ok(self.parse_certificate()?.fingerprint()?)
    }

    pub fn info(&self) -> IssuerInfo {
        IssuerInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            key_id: self.key_id.clone(),
            serial_number: self.serial_number.clone(),
        }
    }
}


//------------ KeyConfig and IssuerConfig ------------------------------------

/// The configuration of keys, i.e., the default key.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct KeyConfig {
    pub default: KeyId,
}

/// The configuration of issuers, i.e., the default issuer.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct IssuerConfig {
    pub default: IssuerId,
}


//------------ KeyInfo and IssuerInfo ----------------------------------------

/// The listing details of a key, without any key material.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct KeyInfo {
    pub id: KeyId,
    pub name: String,
    pub private_key_type: PrivateKeyType,
    pub has_private_key: bool,
}

/// The listing details of an issuer.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct IssuerInfo {
    pub id: IssuerId,
    pub name: String,
    pub key_id: KeyId,
    pub serial_number: String,
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::test;
    use super::*;

    #[test]
    fn key_keeps_only_private_key_block() {
        let (issuer, key) = test::gen_issuer_and_key("example.com");
        let material = key.material().unwrap();
        let bundle = format!("{}{}", issuer.certificate, key.private_key);

        let stored = Key::from_material(
            KeyId::generate(), bundle.as_bytes(), &material
        ).unwrap();
        assert_eq!(stored.private_key, key.private_key);
        assert!(!stored.private_key.contains("CERTIFICATE"));

        let der = material.pkey().private_key_to_der().unwrap();
        let stored = Key::from_material(
            KeyId::generate(), &der, &material
        ).unwrap();
        assert_eq!(stored.private_key, material.to_pem().unwrap());
    }

    #[test]
    fn ids_are_unique_uuids() {
        let one = KeyId::generate();
        let two = KeyId::generate();
        assert_ne!(one, two);
        assert!(Uuid::parse_str(one.as_str()).is_ok());
        assert!(one.ident().is_ok());
        assert!(KeyId::default().is_empty());
    }

    #[test]
    fn invalid_id_is_malformed() {
        assert!(matches!(
            IssuerId::from("not/valid").ident(),
            Err(Error::MalformedRequest(_))
        ));
    }

    #[test]
    fn records_tolerate_missing_fields() {
        let key: Key = serde_json::from_str(r#"{"id": "abc"}"#).unwrap();
        assert_eq!(key.id.as_str(), "abc");
        assert!(!key.has_private_key());
        assert_eq!(key.private_key_type, PrivateKeyType::Unknown);

        let issuer: Issuer = serde_json::from_str("{}").unwrap();
        assert!(issuer.ca_chain.is_empty());

        let config: KeyConfig = serde_json::from_str("{}").unwrap();
        assert!(config.default.is_empty());
    }

    #[test]
    fn key_from_material_keeps_pem() {
        let material = KeyMaterial::generate(PrivateKeyType::Ec, 256).unwrap();
        let pem = material.to_pem().unwrap();
        let key = Key::from_material(
            KeyId::generate(), pem.as_bytes(), &material
        ).unwrap();
        assert_eq!(key.private_key, pem);
        assert_eq!(key.private_key_type, PrivateKeyType::Ec);
        assert_eq!(
            key.fingerprint().unwrap(), material.fingerprint().unwrap()
        );
    }

    #[test]
    fn public_only_key() {
        let material = KeyMaterial::generate(PrivateKeyType::Rsa, 2048).unwrap();
        let key = Key::from_public(
            KeyId::generate(), &material.public_key().unwrap()
        ).unwrap();
        assert!(!key.has_private_key());
        assert!(matches!(key.material(), Err(Error::SigningFailure(_))));
        assert_eq!(
            key.fingerprint().unwrap(), material.fingerprint().unwrap()
        );
    }
}
