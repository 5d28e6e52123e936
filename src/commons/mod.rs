//! Common types used by the store and the issuance engine.
pub mod crypto;
pub mod error;
pub mod storage;

//------------ Response Aliases ----------------------------------------------

pub type PkiEmptyResult = std::result::Result<(), self::error::Error>;
pub type PkiResult<T> = std::result::Result<T, self::error::Error>;
