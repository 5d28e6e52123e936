//! Filesystem-based storage.

use std::{error, fmt, fs, io};
use std::borrow::Cow;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use serde::de::DeserializeOwned;
use serde::ser::Serialize;
use tempfile::NamedTempFile;
use url::Url;
use crate::commons::storage::Ident;
use super::{
    Error as SuperError,
    Transaction as SuperTransaction
};


//------------ Constants -----------------------------------------------------

/// The directory under the root that contains temporary files.
const TMP_FILE_DIR: &str = ".tmp";

/// The directory under the root that contains the lock files.
const LOCK_FILE_DIR: &str = ".locks";

/// The name of the lock file for a scope.
const LOCK_FILE_NAME: &str = "lockfile.lock";


//------------ System --------------------------------------------------------

#[derive(Debug, Default)]
pub struct System(());

impl System {
    pub fn location(&self, uri: &Url) -> Result<Option<Location>, Error> {
        Ok(Uri::parse_uri(uri).map_err(Error::Uri)?.map(|uri| {
            Location { base: uri.path }
        }))
    }
}


//------------ Location ------------------------------------------------------

#[derive(Debug)]
pub struct Location {
    /// The base directory.
    ///
    /// All the namespaces plus the temporary and lock directories are
    /// under this directory.
    base: PathBuf,
}

impl Location {
    pub fn open(
        &self, namespace: &Ident,
    ) -> Result<Store, Error> {
        Store::new(&self.base, namespace)
    }
}


//------------ Store ---------------------------------------------------------

/// A storage backend that uses the filesystem for storing values.
///
/// Each namespace has its own directory under the base directory. A key’s
/// scope becomes a directory under the namespace directory and its name
/// becomes a file in it. Values are stored in these files as JSON.
///
/// Values are first written to a temporary file under `.tmp` and then
/// renamed into place, so a reader either sees the old or the new value of
/// a key but never a partial one.
///
/// Executing on a scope takes an advisory lock on a file under
/// `.locks/$(namespace)/$(scope)`.
#[derive(Debug)]
pub struct Store {
    /// The root path for the store.
    root: PathBuf,

    /// The path for temporary files, shared between namespaces.
    tmp: PathBuf,

    /// The path for lock files for this namespace.
    locks: PathBuf,
}

impl Store {
    fn new(
        path: &Path, namespace: &Ident,
    ) -> Result<Self, Error> {
        let root = path.join(namespace.as_str());
        let tmp = path.join(TMP_FILE_DIR);
        let mut locks = path.join(LOCK_FILE_DIR);
        locks.push(namespace.as_str());

        fs::create_dir_all(&tmp).map_err(|err| {
            Error::io(
                format!(
                    "failed to create temporary directory '{}'",
                    tmp.display()
                ),
                err
            )
        })?;

        Ok(Self { root, tmp, locks })
    }

    pub fn execute<F, T>(
        &self, scope: Option<&Ident>, op: F
    ) -> Result<T, SuperError>
    where
        F: for<'a> Fn(&mut SuperTransaction<'a>) -> Result<T, SuperError>
    {
        let mut file_lock = FileLock::create(self.scope_lock_path(scope))?;
        let _write_lock = file_lock.write()?;
        op(&mut SuperTransaction::from(self))
    }

    /// Returns the path for the given key.
    fn key_path(&self, scope: Option<&Ident>, key: &Ident) -> PathBuf {
        let mut path = self.scope_path(scope);
        path.push(key.as_str());
        path
    }

    /// Returns the path for the given scope.
    fn scope_path(&self, scope: Option<&Ident>) -> PathBuf {
        let mut res = self.root.clone();
        if let Some(scope) = scope {
            res.push(scope.as_str());
        }
        res
    }

    /// Returns the lock file path for the given scope.
    fn scope_lock_path(&self, scope: Option<&Ident>) -> PathBuf {
        let mut res = self.locks.clone();
        if let Some(scope) = scope {
            res.push(scope.as_str());
        }
        res
    }
}


/// # Reading
impl Store {
    /// Returns whether the store is empty.
    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(
            self.root.read_dir().map(|mut d| {
                d.next().is_none()
            }).unwrap_or(true)
        )
    }

    /// Returns whether the store contains the given key.
    pub fn has(
        &self, scope: Option<&Ident>, key: &Ident
    ) -> Result<bool, Error> {
        self.key_path(scope, key).try_exists().map_err(|err| {
            Error::io(
                format!("failed to check existance of key '{key}'"),
                err
            )
        })
    }

    /// Returns the contents of the stored value with the given key.
    ///
    /// If the value does not exist, returns `Ok(None)`.
    pub fn get<T: DeserializeOwned>(
        &self, scope: Option<&Ident>, key: &Ident
    ) -> Result<Option<T>, Error> {
        let path = self.key_path(scope, key);
        let file = match File::open(&path) {
            Ok(file) => io::BufReader::new(file),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(None)
            }
            Err(err) => {
                return Err(Error::io(
                    format!("failed to open file '{}'", path.display()),
                    err
                ))
            }
        };
        match serde_json::from_reader(file) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                if err.is_io() {
                    Err(Error::io(
                        format!(
                            "failed to read stored file '{}'",
                            path.display()
                        ),
                        err.into()
                    ))
                }
                else {
                    Err(Error::deserialize(scope, key, err))
                }
            }
        }
    }

    /// Returns all the keys in the given scope.
    pub fn list_keys(
        &self, scope: Option<&Ident>
    ) -> Result<Vec<Box<Ident>>, Error> {
        let path = self.scope_path(scope);
        let dir = match fs::read_dir(&path) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(Error::io(
                    format!(
                        "failed to read directory '{}'", path.display()
                    ),
                    err
                ));
            }
        };
        let mut res = Vec::new();
        for item in dir {
            let item = item.map_err(|err| {
                Error::io(
                    format!("failed to read directory '{}'", path.display()),
                    err
                )
            })?;
            let file_type = item.file_type().map_err(|err| {
                Error::io(
                    format!("failed to read directory '{}'", path.display()),
                    err
                )
            })?;
            if file_type.is_file() {
                if let Some(name) =
                    item.file_name().into_string().ok().and_then(|name| {
                        Ident::boxed_from_string(name).ok()
                    })
                {
                    res.push(name)
                }
            }
        }

        Ok(res)
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
        let path = self.key_path(scope, key);

        Self::create_dirs(path.parent())?;

        let mut tmp_file = NamedTempFile::new_in(&self.tmp).map_err(|err| {
            Error::io(
                format!(
                    "writing temp file failed for key: '{key}'"
                ),
                err,
            )
        })?;

        let res = serde_json::to_writer_pretty(
            &mut io::BufWriter::new(&mut tmp_file),
            value
        );
        if let Err(err) = res {
            if err.is_io() {
                return Err(Error::io(
                    format!(
                        "failed to write temp file '{}' for key '{}'",
                        tmp_file.as_ref().display(),
                        key
                    ),
                    err.into(),
                ))
            }
            else {
                return Err(Error::serialize(scope, key, err))
            }
        }

        tmp_file.persist(&path).map_err(|err| {
            Error::io(
                format!(
                    "failed to rename temp file '{}' to '{}'",
                    err.file.path().display(),
                    path.display()
                ),
                err.error,
            )
        })?;

        Ok(())
    }

    /// Removes the stored value for a given key.
    pub fn delete(
        &self, scope: Option<&Ident>, key: &Ident
    ) -> Result<(), Error> {
        let path = self.key_path(scope, key);

        fs::remove_file(&path).map_err(|err| {
            Error::io(
                format!(
                    "failed to delete file '{}'", path.display()
                ),
                err
            )
        })?;
        self.remove_empty_dirs(path.parent());

        Ok(())
    }

    /// Creates the given directory if necessary.
    fn create_dirs(path: Option<&Path>) -> Result<(), Error> {
        if let Some(path) = path {
            fs::create_dir_all(path).map_err(|err| {
                Error::io(
                    format!(
                        "Failed to create directory '{}'", path.display()
                    ),
                    err
                )
            })?;
        }
        Ok(())
    }

    /// Removes parent directories up to the store root if they are empty.
    fn remove_empty_dirs(&self, path: Option<&Path>) {
        let Some(path) = path else {
            return
        };
        for dir in path.ancestors() {
            if !dir.starts_with(&self.root) || fs::remove_dir(dir).is_err() {
                break
            }
        }
    }
}


//------------ Transaction ---------------------------------------------------

pub type Transaction<'a> = &'a Store;


//------------ FileLock ------------------------------------------------------

#[derive(Debug)]
struct FileLock {
    lock: fd_lock::RwLock<File>,
}

impl FileLock {
    fn create(path: PathBuf) -> Result<Self, Error> {
        let lock_path = path.join(LOCK_FILE_NAME);
        Store::create_dirs(Some(&path))?;

        let mut options = OpenOptions::new();
        options.create(true).truncate(false).read(true).write(true);
        let lock_file = options.open(&lock_path).map_err(|err| {
            Error::io(
                format!(
                    "failed to open lock file '{}'", lock_path.display(),
                ),
                err
            )
        })?;

        Ok(FileLock { lock: fd_lock::RwLock::new(lock_file) })
    }

    fn write(&mut self) -> Result<fd_lock::RwLockWriteGuard<'_, File>, Error> {
        self.lock
            .write()
            .map_err(|e| Error::io("cannot get file lock", e))
    }
}


//------------ Uri -----------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct Uri {
    path: PathBuf,
}

impl Uri {
    pub fn parse_uri(uri: &Url) -> Result<Option<Uri>, UriError> {
        if uri.scheme() != "file" && uri.scheme() != "local" {
            return Ok(None)
        }

        if !uri.authority().is_empty() {
            return Err(UriError::HasAuthority(uri.authority().into()))
        }

        let path = PathBuf::from(uri.path());
        if !path.is_absolute() {
            return Err(UriError::RelativePath(path))
        }
        Ok(Some(Uri { path }))
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "file://{}", self.path.display())
    }
}


//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    Uri(UriError),
    Io {
        context: Cow<'static, str>,
        err: io::Error,
    },
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
}

impl Error {
    fn io(context: impl Into<Cow<'static, str>>, err: io::Error) -> Self {
        Error::Io { context: context.into(), err }
    }

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
            Error::Io { context, err } => {
                write!(f, "{context}: {err}")
            }
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
        }
    }
}

impl error::Error for Error { }


//------------ UriError ------------------------------------------------------

#[derive(Debug)]
pub enum UriError {
    HasAuthority(String),
    RelativePath(PathBuf),
}

impl fmt::Display for UriError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::HasAuthority(host) => {
                write!(f, "non-local path with host '{host}'")
            }
            Self::RelativePath(path) => {
                write!(f, "{} is not absolute.", path.display())
            }
        }
    }
}

impl error::Error for UriError { }
