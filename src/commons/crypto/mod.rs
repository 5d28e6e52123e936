//! Key and certificate handling on top of openssl.

pub use self::builder::{
    build_certificate, CertSigner, CertTemplate, ExtKeyUsage, KeyUsage,
    SubjectAltNames, SubjectName,
};
pub use self::cert::{
    format_serial, random_serial, split_pem, ParsedCertificate, PemBlock,
};
pub use self::csr::{build_csr, ParsedCsr};
pub use self::error::Error;
pub use self::keys::{
    ec_curve, Fingerprint, KeyMaterial, PrivateKeyType, PublicKeyInfo,
    MIN_RSA_BITS,
};

mod builder;
mod cert;
mod csr;
mod error;
mod keys;

pub type CryptoResult<T> = std::result::Result<T, self::error::Error>;
