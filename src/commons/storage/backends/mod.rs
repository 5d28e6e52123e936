//! Storage backends.


//============ Modules =======================================================
//
// These need to be added to the macro invocation at the very bottom of this
// file.

mod disk;
pub(super) mod memory;


//============ Backend Enum ==================================================

use std::fmt;
use serde::de::DeserializeOwned;
use serde::ser::Serialize;
use url::Url;
use super::{Ident, KeyValueError};

macro_rules! store {
    ( $( ( $variant:ident, $module:ident ) )* ) => {

        //------------ BackendSystem -----------------------------------------

        #[derive(Debug, Default)]
        pub struct BackendSystem {
            $(
                $module: self::$module::System,
            )*
        }

        impl BackendSystem {
            fn location(
                &self, uri: &Url
            )  -> Result<Location, KeyValueError> {
                $(
                    match self.$module.location(uri) {
                        Ok(Some(location)) => {
                            return Ok(Location::$variant(location))
                        }
                        Ok(None) => { }
                        Err(err) => {
                            return Err(KeyValueError::Inner(err.into()))
                        }
                    }
                )*
                Err(KeyValueError::UnknownScheme(uri.scheme().into()))
            }

            /// Checks that the URI names a location a backend can serve.
            pub fn check(&self, storage_uri: &Url) -> Result<(), KeyValueError> {
                self.location(storage_uri).map(|_| ())
            }

            pub fn open(
                &self, storage_uri: &Url, namespace: &Ident,
            ) -> Result<Backend, KeyValueError> {
                Ok(self.location(storage_uri)?.open(namespace)?)
            }
        }


        //------------ Location ----------------------------------------------

        #[derive(Debug)]
        enum Location {
            $(
                $variant( self::$module::Location ),
            )*
        }

        impl Location {
            fn open(
                &self, namespace: &Ident,
            ) -> Result<Backend, Error> {
                match self {
                    $(
                        Self::$variant(inner) => {
                            Ok(Backend(StoreInner::$variant(
                                inner.open(namespace)?
                            )))
                        }
                    )*
                }
            }
        }


        //------------ Backend -----------------------------------------------

        #[derive(Debug)]
        pub struct Backend(StoreInner);

        #[derive(Debug)]
        enum StoreInner {
            $(
                $variant( self::$module::Store),
            )*
        }

        impl Backend {
            pub fn execute<F, T>(
                &self, scope: Option<&Ident>, op: F
            ) -> Result<T, Error>
            where
                F: for<'a> Fn(&mut Transaction<'a>) -> Result<T, Error>
            {
                match &self.0 {
                    $(
                        StoreInner::$variant(inner) => {
                            inner.execute(scope, op)
                        }
                    )*
                }
            }

            pub fn is_empty(&self) -> Result<bool, Error> {
                match &self.0 {
                    $(
                        StoreInner::$variant(inner) => {
                            Ok(inner.is_empty()?)
                        }
                    )*
                }
            }
        }


        //------------ Transaction -------------------------------------------

        #[derive(Debug)]
        pub struct Transaction<'a>(TransactionInner<'a>);

        #[derive(Debug)]
        enum TransactionInner<'a> {
            $(
                $variant(self::$module::Transaction<'a>),
            )*
        }

        $(
            impl<'a> From<self::$module::Transaction<'a>>
            for Transaction<'a> {
                fn from(
                    src: self::$module::Transaction<'a>
                ) -> Self {
                    Self(TransactionInner::$variant(src))
                }
            }
        )*

        /// # Reading
        impl Transaction<'_> {
            pub fn has(
                &mut self, scope: Option<&Ident>, key: &Ident,
            ) -> Result<bool, Error> {
                match &mut self.0 {
                    $(
                        TransactionInner::$variant(inner) => {
                            Ok(inner.has(scope, key)?)
                        }
                    )*
                }
            }

            pub fn get<T: DeserializeOwned>(
                &mut self, scope: Option<&Ident>, key: &Ident
            ) -> Result<Option<T>, Error> {
                match &mut self.0 {
                    $(
                        TransactionInner::$variant(inner) => {
                            Ok(inner.get(scope, key)?)
                        }
                    )*
                }
            }

            pub fn list_keys(
                &mut self, scope: Option<&Ident>,
            ) -> Result<Vec<Box<Ident>>, Error> {
                match &mut self.0 {
                    $(
                        TransactionInner::$variant(inner) => {
                            Ok(inner.list_keys(scope)?)
                        }
                    )*
                }
            }
        }


        /// # Writing
        impl Transaction<'_> {
            pub fn store<T: Serialize>(
                &mut self, scope: Option<&Ident>, key: &Ident, value: &T
            ) -> Result<(), Error> {
                match &mut self.0 {
                    $(
                        TransactionInner::$variant(inner) => {
                            Ok(inner.store(scope, key, value)?)
                        }
                    )*
                }
            }

            pub fn delete(
                &mut self, scope: Option<&Ident>, key: &Ident
            ) -> Result<(), Error> {
                match &mut self.0 {
                    $(
                        TransactionInner::$variant(inner) => {
                            Ok(inner.delete(scope, key)?)
                        }
                    )*
                }
            }
        }


        //------------ Error -------------------------------------------------

        #[derive(Debug)]
        pub struct Error(ErrorInner);

        #[derive(Debug)]
        enum ErrorInner {
            $(
                $variant(self::$module::Error),
            )*
        }

        impl Error {
            /// Returns whether a stored value could not be deserialized.
            ///
            /// Every other error means the backend itself failed.
            pub fn is_corruption(&self) -> bool {
                match &self.0 {
                    $(
                        ErrorInner::$variant(inner) => inner.is_corruption(),
                    )*
                }
            }
        }

        $(
            impl From<self::$module::Error> for Error {
                fn from(src: self::$module::Error) -> Self {
                    Self(ErrorInner::$variant(src))
                }
            }
        )*

        impl fmt::Display for Error {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                match &self.0 {
                    $(
                        ErrorInner::$variant(inner) => inner.fmt(f),
                    )*
                }
            }
        }

        impl std::error::Error for Error { }
    }
}

store! {
    (Disk, disk)
    (Memory, memory)
}
