//! Various crate-wide constants.

use crate::commons::storage::Ident;


//------------ Storage -------------------------------------------------------

/// The default storage URI.
pub const DEFAULT_STORAGE_URI: &str = "memory:";

/// The default namespace for all PKI records.
pub const PKI_NS: &Ident = Ident::make("pki");

/// The scope holding key records by key ID.
pub const KEYS_SCOPE: &Ident = Ident::make("keys");

/// The scope holding issuer records by issuer ID.
pub const ISSUERS_SCOPE: &Ident = Ident::make("issuers");

/// The scope holding the default pointers and index state.
pub const CONFIG_SCOPE: &Ident = Ident::make("config");

/// The scope mapping public key fingerprints to key IDs.
pub const KEY_FINGERPRINTS_SCOPE: &Ident = Ident::make("key-fingerprints");

/// The scope mapping certificate fingerprints to issuer IDs.
pub const ISSUER_FINGERPRINTS_SCOPE: &Ident =
    Ident::make("issuer-fingerprints");

/// The name of the key configuration inside [`CONFIG_SCOPE`].
pub const KEYS_CONFIG_KEY: &Ident = Ident::make("keys");

/// The name of the issuer configuration inside [`CONFIG_SCOPE`].
pub const ISSUERS_CONFIG_KEY: &Ident = Ident::make("issuers");

/// The name of the fingerprint index state inside [`CONFIG_SCOPE`].
pub const FINGERPRINT_INDEX_KEY: &Ident = Ident::make("fingerprint-index");

/// The current version of the fingerprint index.
pub const FINGERPRINT_INDEX_VERSION: u32 = 1;


//------------ References ----------------------------------------------------

/// The reference that resolves to the configured default key or issuer.
pub const DEFAULT_REF: &str = "default";


//------------ Issuance ------------------------------------------------------

/// The TTL used when neither the request nor the role sets one.
pub const DEFAULT_TTL_SECONDS: u64 = 30 * 24 * 3600;

/// The upper bound for any TTL unless configured otherwise.
pub const DEFAULT_MAX_TTL_SECONDS: u64 = 10 * 365 * 24 * 3600;

pub const DEFAULT_RSA_BITS: u32 = 2048;
pub const DEFAULT_EC_BITS: u32 = 256;

/// How long a single generation may run before it is cancelled.
pub const DEFAULT_GENERATION_TIMEOUT_SECONDS: u64 = 60;

/// The longest CA chain that is followed when building chains.
pub const MAX_CHAIN_LENGTH: usize = 10;
