//! The errors of the PKI store and issuance engine.

use std::fmt;
use std::fmt::Display;
use crate::commons::crypto;
use crate::commons::storage::KeyValueError;

#[derive(Debug)]
pub enum Error {
    //-----------------------------------------------------------------
    // Lookups
    //-----------------------------------------------------------------

    /// A key, issuer or reference does not exist.
    NotFound(String),

    //-----------------------------------------------------------------
    // Storage
    //-----------------------------------------------------------------

    /// A stored record exists but cannot be decoded.
    Corruption(KeyValueError),

    /// The storage backend failed.
    StorageUnavailable(KeyValueError),

    //-----------------------------------------------------------------
    // Requests
    //-----------------------------------------------------------------

    /// A request was well-formed but denied by a role or other policy.
    PolicyViolation(String),

    /// Input could not be parsed or is inconsistent.
    MalformedRequest(String),

    //-----------------------------------------------------------------
    // Crypto
    //-----------------------------------------------------------------

    KeyGenerationFailure(String),

    /// Signing failed or the issuer cannot sign.
    SigningFailure(String),

    /// The operation was cancelled before it finished.
    Cancelled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NotFound(what) => write!(f, "{what} not found"),
            Error::Corruption(err) => {
                write!(f, "stored data is corrupt: {err}")
            }
            Error::StorageUnavailable(err) => {
                write!(f, "storage unavailable: {err}")
            }
            Error::PolicyViolation(msg) => {
                write!(f, "request denied by policy: {msg}")
            }
            Error::MalformedRequest(msg) => {
                write!(f, "malformed request: {msg}")
            }
            Error::KeyGenerationFailure(msg) => {
                write!(f, "key generation failed: {msg}")
            }
            Error::SigningFailure(msg) => write!(f, "signing failed: {msg}"),
            Error::Cancelled => f.write_str("operation cancelled"),
        }
    }
}

impl std::error::Error for Error { }

impl From<KeyValueError> for Error {
    fn from(err: KeyValueError) -> Self {
        if err.is_corruption() {
            Error::Corruption(err)
        }
        else {
            Error::StorageUnavailable(err)
        }
    }
}

impl From<crypto::Error> for Error {
    fn from(err: crypto::Error) -> Self {
        match err {
            crypto::Error::KeyError(msg) => Error::KeyGenerationFailure(msg),
            crypto::Error::RandomError(msg) => {
                Error::KeyGenerationFailure(msg)
            }
            crypto::Error::SigningError(msg) => Error::SigningFailure(msg),
            crypto::Error::DecodeError(msg) => Error::MalformedRequest(msg),
        }
    }
}

impl Error {
    pub fn not_found(kind: &str, what: impl Display) -> Self {
        Error::NotFound(format!("{kind} '{what}'"))
    }

    pub fn policy(msg: impl Display) -> Self {
        Error::PolicyViolation(msg.to_string())
    }

    pub fn malformed(msg: impl Display) -> Self {
        Error::MalformedRequest(msg.to_string())
    }

    pub fn signing(msg: impl Display) -> Self {
        Error::SigningFailure(msg.to_string())
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_errors_map_to_kinds() {
        assert!(matches!(
            Error::from(crypto::Error::decode("bad")),
            Error::MalformedRequest(_)
        ));
        assert!(matches!(
            Error::from(crypto::Error::key_error("bad")),
            Error::KeyGenerationFailure(_)
        ));
        assert!(matches!(
            Error::from(crypto::Error::signing("bad")),
            Error::SigningFailure(_)
        ));
    }

    #[test]
    fn not_found_display() {
        assert_eq!(
            Error::not_found("key", "abc").to_string(),
            "key 'abc' not found"
        );
    }
}
