//! A store for keys and CA certificates and the issuance of certificates.

pub mod ca;
pub mod commons;
pub mod config;
pub mod constants;
