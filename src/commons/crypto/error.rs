use std::fmt;
use std::fmt::Display;

/// An error happened while handling key or certificate material.
#[derive(Debug)]
pub enum Error {
    /// Creating key material failed.
    KeyError(String),

    /// The secure random source failed.
    RandomError(String),

    /// Building or signing a certificate or CSR failed.
    SigningError(String),

    /// Input material could not be decoded.
    DecodeError(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::KeyError(e) => write!(f, "key generation failed: {e}"),
            Error::RandomError(e) => write!(f, "random source failed: {e}"),
            Error::SigningError(e) => e.fmt(f),
            Error::DecodeError(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error { }

impl Error {
    pub fn key_error(e: impl Display) -> Self {
        Error::KeyError(e.to_string())
    }

    pub fn random(e: impl Display) -> Self {
        Error::RandomError(e.to_string())
    }

    pub fn signing(e: impl Display) -> Self {
        Error::SigningError(e.to_string())
    }

    pub fn decode(e: impl Display) -> Self {
        Error::DecodeError(e.to_string())
    }
}
