//! Keys, issuers, and the issuance of certificates.

mod defaults;
mod engine;
mod entities;
mod generate;
mod import;
mod role;
mod store;

pub use self::defaults::DefaultResolver;
pub use self::engine::{
    CertFormat, GeneratedCa, GeneratedCsr, ImportResult, PkiEngine,
};
pub use self::entities::{
    Issuer, IssuerConfig, IssuerId, IssuerInfo, Key, KeyConfig, KeyId,
    KeyInfo,
};
pub use self::generate::{
    generate_cert, generate_cert_with_timeout, generate_csr, Cancellation,
    CertificateBundle, CsrBundle, Exported, GenerationInput,
    GenerationRequest, KeySource, SigningBundle,
};
pub use self::role::{NotAfterBehavior, Role, RoleKeyType, TtlPolicy};
pub use self::store::PkiStore;
