//! In-memory storage.

use std::{error, fmt};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use serde::de::DeserializeOwned;
use serde::ser::Serialize;
use serde_json::Value;
use url::Url;
use crate::commons::storage::Ident;
use super::{
    Error as SuperError,
    Transaction as SuperTransaction
};


//------------ System --------------------------------------------------------

/// The in-memory locations known to a storage system.
///
/// Stores opened through the same system with the same `memory:` URI and
/// namespace share their data.
#[derive(Debug, Default)]
pub struct System {
    locations: Mutex<HashMap<Option<u64>, Location>>,
}

impl System {
    pub fn location(&self, uri: &Url) -> Result<Option<Location>, Error> {
        let Some(uri) = Uri::parse_uri(uri).map_err(Error::Uri)? else {
            return Ok(None)
        };
        let mut locations = self.locations.lock().expect("poisoned lock");
        Ok(Some(locations.entry(uri.path).or_default().clone()))
    }
}


//------------ Location ------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct Location {
    namespaces: Arc<Mutex<HashMap<Box<Ident>, Arc<MemoryNamespace>>>>,
}

impl Location {
    pub fn open(
        &self, namespace: &Ident,
    ) -> Result<Store, Error> {
        let mut namespaces = self.namespaces.lock().expect("poisoned lock");
        Ok(Store::new(
            namespaces.entry(namespace.into()).or_default().clone()
        ))
    }
}


//------------ Store ---------------------------------------------------------

#[derive(Debug)]
pub struct Store {
    namespace: Arc<MemoryNamespace>,
}

impl Store {
    fn new(namespace: Arc<MemoryNamespace>) -> Self {
        Store { namespace }
    }

    pub fn execute<F, T>(
        &self, scope: Option<&Ident>, op: F
    ) -> Result<T, SuperError>
    where
        F: for<'a> Fn(&mut SuperTransaction<'a>) -> Result<T, SuperError>
    {
        match scope {
            Some(scope) => self.execute_scoped(scope.into(), op),
            None => self.execute_global(op),
        }
    }

    fn execute_global<F, T>(
        &self, op: F
    ) -> Result<T, SuperError>
    where
        F: for<'a> Fn(&mut SuperTransaction<'a>) -> Result<T, SuperError>
    {
        let _lock = self.namespace.get_lock(None);
        let _lock = _lock.write().expect("poisoned lock");
        op(&mut SuperTransaction::from(self))
    }

    fn execute_scoped<F, T>(
        &self, scope: Box<Ident>, op: F
    ) -> Result<T, SuperError>
    where
        F: for<'a> Fn(&mut SuperTransaction<'a>) -> Result<T, SuperError>
    {
        let _root_lock = self.namespace.get_lock(None);
        let _root_lock = _root_lock.read().expect("poisoned lock");
        let _lock = self.namespace.get_lock(Some(scope));
        let _lock = _lock.write().expect("poisoned lock");
        op(&mut SuperTransaction::from(self))
    }
}


/// # Reading
impl Store {
    /// Returns whether the store is empty.
    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.namespace.scopes().is_empty())
    }

    /// Returns whether the store contains the given key.
    pub fn has(
        &self, scope: Option<&Ident>, key: &Ident
    ) -> Result<bool, Error> {
        Ok(
            self.namespace.scopes().get(scope).map(|scope| {
                scope.contains_key(key)
            }).unwrap_or(false)
        )
    }

    /// Returns the contents of the stored value with the given key.
    ///
    /// If the value does not exist, returns `Ok(None)`.
    pub fn get<T: DeserializeOwned>(
        &self, scope: Option<&Ident>, key: &Ident
    ) -> Result<Option<T>, Error> {
        let value = self.namespace.scopes().get(scope).and_then(|scope| {
            scope.get(key).cloned()
        });
        match value {
            Some(value) => {
                serde_json::from_value(value).map(Some).map_err(|err| {
                    Error::deserialize(scope, key, err)
                })
            }
            None => Ok(None)
        }
    }

    /// Returns all the keys in the given scope.
    pub fn list_keys(
        &self, scope: Option<&Ident>
    ) -> Result<Vec<Box<Ident>>, Error> {
        let scopes = self.namespace.scopes();
        let Some(scope) = scopes.get(scope) else {
            return Ok(Vec::new())
        };
        Ok(scope.keys().cloned().collect())
    }
}


/// # Writing
impl Store {
    /// Stores the provided value under the given key.
    ///
    /// Quietly overwrites a possibly already existing value.
    pub fn store<T: Serialize>(
        &self, scope: Option<&Ident>, key: &Ident, value: &T
    ) -> Result<(), Error> {
        let value = serde_json::to_value(value).map_err(|err| {
            Error::serialize(scope, key, err)
        })?;
        self.namespace.scopes().get_or_create(scope).insert(
            key.into(), value
        );
        Ok(())
    }

    /// Removes the stored value for a given key.
    pub fn delete(
        &self, scope: Option<&Ident>, key: &Ident
    ) -> Result<(), Error> {
        let _ = self.namespace.scopes().remove_value(scope, key)?;
        Ok(())
    }
}


//------------ Transaction ---------------------------------------------------

pub type Transaction<'a> = &'a Store;

//------------ MemoryValues --------------------------------------------------

type MemoryValues = HashMap<Box<Ident>, Value>;

//------------ MemoryScopes --------------------------------------------------

#[derive(Debug, Default)]
struct MemoryScopes {
    global: MemoryValues,
    scopes: HashMap<Box<Ident>, MemoryValues>,
}

impl MemoryScopes {
    fn is_empty(&self) -> bool {
        self.global.is_empty() && self.scopes.is_empty()
    }

    fn get(&self, scope: Option<&Ident>) -> Option<&MemoryValues> {
        match scope {
            Some(scope) => self.scopes.get(scope),
            None => Some(&self.global)
        }
    }

    fn get_mut(
        &mut self, scope: Option<&Ident>
    ) -> Option<&mut MemoryValues> {
        match scope {
            Some(scope) => self.scopes.get_mut(scope),
            None => Some(&mut self.global)
        }
    }

    fn get_or_create(&mut self, scope: Option<&Ident>) -> &mut MemoryValues {
        match scope {
            Some(scope) => self.scopes.entry(scope.into()).or_default(),
            None => &mut self.global
        }
    }

    fn remove_value(
        &mut self, scope: Option<&Ident>, key: &Ident
    ) -> Result<Value, Error> {
        let values = match self.get_mut(scope) {
            Some(scope) => scope,
            None => {
                return Err(Error::NotFound {
                    scope: scope.map(Into::into),
                    key: key.into()
                })
            }
        };
        let Some(value) = values.remove(key) else {
            return Err(Error::NotFound {
                scope: scope.map(Into::into),
                key: key.into()
            })
        };
        if let Some(scope) = scope {
            if values.is_empty() {
                self.scopes.remove(scope);
            }
        }
        Ok(value)
    }
}


//------------ MemoryNamespace -----------------------------------------------

#[derive(Debug, Default)]
struct MemoryNamespace {
    scopes: Mutex<MemoryScopes>,
    locks: Mutex<HashMap<Option<Box<Ident>>, Arc<RwLock<()>>>>,
}

impl MemoryNamespace {
    fn scopes(&self) -> MutexGuard<'_, MemoryScopes> {
        self.scopes.lock().expect("poisoned lock")
    }

    fn get_lock(&self, scope: Option<Box<Ident>>) -> Arc<RwLock<()>> {
        self.locks
            .lock()
            .expect("poisoned lock")
            .entry(scope)
            .or_default()
            .clone()
    }
}


//------------ Uri -----------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct Uri {
    path: Option<u64>,
}

impl Uri {
    pub fn parse_uri(uri: &Url) -> Result<Option<Uri>, UriError> {
        if uri.scheme() != "memory" {
            return Ok(None)
        }
        if uri.path().is_empty() {
            return Ok(Some(Uri { path: None }))
        }
        if let Ok(path) = u64::from_str(uri.path()) {
            return Ok(Some(Uri { path: Some(path) }))
        }
        Err(UriError::BadPath(uri.path().into()))
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("memory:")?;
        if let Some(path) = self.path {
            write!(f, "{path}")?
        }
        Ok(())
    }
}


//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    Uri(UriError),
    Deserialize {
        scope: Option<Box<Ident>>,
        key: Box<Ident>,
        err: String,
    },
    Serialize {
        scope: Option<Box<Ident>>,
        key: Box<Ident>,
        err: String,
    },
    NotFound {
        scope: Option<Box<Ident>>,
        key: Box<Ident>,
    },
}

impl Error {
    fn deserialize(
        scope: Option<&Ident>, key: &Ident, err: impl fmt::Display
    ) -> Self {
        Error::Deserialize {
            scope: scope.map(Into::into),
            key: key.into(),
            err: err.to_string()
        }
    }

    fn serialize(
        scope: Option<&Ident>, key: &Ident, err: impl fmt::Display
    ) -> Self {
        Error::Serialize {
            scope: scope.map(Into::into),
            key: key.into(),
            err: err.to_string()
        }
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Deserialize { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Uri(err) => err.fmt(f),
            Error::Deserialize { scope, key, err } => {
                match scope {
                    Some(scope) => {
                        write!(f,
                            "failed to deserialize value for key '{key}' \
                            in scope '{scope}': {err}"
                        )
                    }
                    None => {
                        write!(f,
                            "failed to deserialize value for key '{key}' \
                            in global scope: {err}"
                        )
                    }
                }
            }
            Error::Serialize { scope, key, err } => {
                match scope {
                    Some(scope) => {
                        write!(f,
                            "failed to serialize value for key '{key}' \
                            in scope '{scope}': {err}"
                        )
                    }
                    None => {
                        write!(f,
                            "failed to serialize value for key '{key}' \
                            in global scope: {err}"
                        )
                    }
                }
            }
            Error::NotFound { scope, key } => {
                match scope {
                    Some(scope) => {
                        write!(f, "no key '{key}' in scope '{scope}'")
                    }
                    None => {
                        write!(f, "no key '{key}' in global scope")
                    }
                }
            }
        }
    }
}

impl error::Error for Error { }


//------------ UriError ------------------------------------------------------

#[derive(Debug)]
pub enum UriError {
    BadPath(String),
}

impl fmt::Display for UriError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadPath(path) => write!(f, "invalid memory path '{path}'"),
        }
    }
}

impl error::Error for UriError { }
