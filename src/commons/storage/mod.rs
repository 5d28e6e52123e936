//! Persistent storage of data.
//!
//! Values are stored as JSON under a key which consists of an optional
//! scope and a name, both [`Ident`]s, inside a namespace. Where the data
//! actually lives is determined by the storage URI handed to
//! [`StorageSystem::new`]:
//!
//! * `memory:` or `memory:<n>` keeps everything in process memory,
//! * `local:///some/path` or `file:///some/path` keeps one file per value
//!   under the given directory.

pub use self::ident::{Ident, IdentError};

mod backends;
mod ident;

use std::{error, fmt};
use log::trace;
use serde::de::DeserializeOwned;
use serde::ser::Serialize;
use url::Url;
use self::backends::{Backend, BackendSystem};


//------------ StorageSystem -------------------------------------------------

/// Access to the storage configured through a storage URI.
#[derive(Debug)]
pub struct StorageSystem {
    default_uri: Url,
    backends: BackendSystem,
}

impl StorageSystem {
    /// Creates a storage system for the given URI.
    ///
    /// Fails if no backend understands the URI.
    pub fn new(default_uri: Url) -> Result<Self, KeyValueError> {
        let backends = BackendSystem::default();
        backends.check(&default_uri)?;
        Ok(StorageSystem { default_uri, backends })
    }

    /// Returns the storage URI.
    pub fn default_uri(&self) -> &Url {
        &self.default_uri
    }

    /// Opens the store for the given namespace.
    pub fn open(
        &self, namespace: &Ident
    ) -> Result<KeyValueStore, KeyValueError> {
        Ok(KeyValueStore {
            inner: self.backends.open(&self.default_uri, namespace)?,
            namespace: namespace.into(),
        })
    }
}


//------------ KeyValueStore -------------------------------------------------

/// A namespace of key-value pairs.
///
/// Every individual operation is atomic for its key. There are no
/// transactions spanning several operations: a sequence of calls may
/// interleave with calls made by other threads on the same store.
#[derive(Debug)]
pub struct KeyValueStore {
    inner: Backend,
    namespace: Box<Ident>,
}

impl KeyValueStore {
    /// Returns the namespace of this store.
    pub fn namespace(&self) -> &Ident {
        &self.namespace
    }

    /// Returns whether the store has no values at all.
    pub fn is_empty(&self) -> Result<bool, KeyValueError> {
        Ok(self.inner.is_empty()?)
    }

    /// Executes an operation under the lock for `scope`.
    fn execute<F, T>(
        &self, scope: Option<&Ident>, op: F
    ) -> Result<T, KeyValueError>
    where
        F: for<'a> Fn(&mut backends::Transaction<'a>) -> Result<T, backends::Error>
    {
        Ok(self.inner.execute(scope, op)?)
    }

    /// Gets the value for a key.
    ///
    /// Returns `Ok(None)` if there is no value and an error if the value
    /// cannot be deserialized.
    pub fn get<T: DeserializeOwned>(
        &self, scope: Option<&Ident>, key: &Ident
    ) -> Result<Option<T>, KeyValueError> {
        let res = self.execute(scope, |kv| kv.get(scope, key))?;
        trace!(
            "{} value for key '{}' in namespace '{}'",
            if res.is_some() { "got" } else { "no" }, key, self.namespace
        );
        Ok(res)
    }

    /// Stores a key value pair, overwriting an existing value.
    pub fn store<T: Serialize>(
        &self, scope: Option<&Ident>, key: &Ident, value: &T
    ) -> Result<(), KeyValueError> {
        self.execute(scope, |kv| kv.store(scope, key, value))
    }

    /// Returns whether a key exists.
    pub fn has(
        &self, scope: Option<&Ident>, key: &Ident
    ) -> Result<bool, KeyValueError> {
        self.execute(scope, |kv| kv.has(scope, key))
    }

    /// Returns the names of all keys in the given scope.
    pub fn list_keys(
        &self, scope: Option<&Ident>
    ) -> Result<Vec<Box<Ident>>, KeyValueError> {
        self.execute(scope, |kv| kv.list_keys(scope))
    }

    /// Deletes a key-value pair.
    ///
    /// Fails if there is no value for the key.
    pub fn drop_key(
        &self, scope: Option<&Ident>, key: &Ident
    ) -> Result<(), KeyValueError> {
        self.execute(scope, |kv| kv.delete(scope, key))
    }
}


//------------ KeyValueError -------------------------------------------------

/// An error happened while accessing a key-value store.
#[derive(Debug)]
pub enum KeyValueError {
    /// No backend for the URI scheme.
    UnknownScheme(String),

    /// The backend failed.
    Inner(backends::Error),
}

impl KeyValueError {
    /// Returns whether the error was caused by undecodable stored data.
    pub fn is_corruption(&self) -> bool {
        match self {
            KeyValueError::UnknownScheme(_) => false,
            KeyValueError::Inner(err) => err.is_corruption(),
        }
    }
}

impl From<backends::Error> for KeyValueError {
    fn from(err: backends::Error) -> Self {
        KeyValueError::Inner(err)
    }
}

impl fmt::Display for KeyValueError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KeyValueError::UnknownScheme(scheme) => {
                write!(f, "unknown storage scheme: {scheme}")
            }
            KeyValueError::Inner(err) => err.fmt(f),
        }
    }
}

impl error::Error for KeyValueError { }


//------------ Tests ---------------------------------------------------------
