//! Identifiers for components of a storage key.

use std::{error, fmt, mem};


//------------ Ident ---------------------------------------------------------

/// An identifier for a component of a storage key.
///
/// Idents are strings with a severly limited set of allowed characters.
/// Specifically, only ASCII letters and digits, plus, dash, underscore, and
/// periods are allowed. They can never be empty and they cannot start with
/// a period.
///
/// Key IDs and issuer IDs are UUIDs and fingerprints are hex strings, so
/// both can be used as idents directly.
///
/// This type is an unsized type and needs to be used behind some kind of
/// pointer.
#[derive(Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Ident(str);

impl Ident {
    /// Creates a new ident from a byte slice.
    pub const fn from_bytes(bytes: &[u8]) -> Result<&Self, IdentError> {
        if let Err(err) = Self::check_bytes(bytes) {
            return Err(err)
        }

        // Safety: We just checked.
        Ok(unsafe { Self::from_bytes_unchecked(bytes) })
    }

    /// Creates a new ident form a string slice.
    pub const fn from_str(s: &str) -> Result<&Self, IdentError> {
        Self::from_bytes(s.as_bytes())
    }

    /// Creates a ident from the given string slice or panics.
    ///
    /// This function should be used to create ident constants.
    pub const fn make(s: &str) -> &Self {
        match Self::from_str(s) {
            Ok(some) => some,
            Err(_) => panic!("invalid storage identifier")
        }
    }

    /// Creates a new ident from a bytes slice without checking.
    ///
    /// # Safety
    ///
    /// The bytes slice must not be empty and must only contain valid
    /// characters.
    pub const unsafe fn from_bytes_unchecked(s: &[u8]) -> &Self {
        // SAFETY: Self has #repr(transparent)
        unsafe { mem::transmute(s) }
    }

    /// Creates a new boxed ident from a boxed slice without checking.
    ///
    /// # Safety
    ///
    /// The slice must not be empty and must only contain valid characters.
    pub const unsafe fn from_box_unchecked(s: Box<[u8]>) -> Box<Self> {
        // SAFETY: Self has #repr(transparent)
        unsafe { mem::transmute(s) }
    }

    /// Creates a new boxed ident from an owned string.
    pub fn boxed_from_string(s: String) -> Result<Box<Self>, IdentError> {
        Self::check_bytes(s.as_bytes())?;

        // Safety: We just checked.
        Ok(unsafe {
            Self::from_box_unchecked(s.into_boxed_str().into())
        })
    }

    /// Checks that `bytes` contains a valid ident.
    const fn check_bytes(mut bytes: &[u8]) -> Result<(), IdentError> {
        let Some(first) = bytes.first() else {
            return Err(IdentError(IdentErrorEnum::Empty))
        };
        if *first == b'.' {
            return Err(IdentError(IdentErrorEnum::LeadingDot))
        }

        while let Some((head, tail)) = bytes.split_first() {
            if !head.is_ascii_alphanumeric()
                && *head != b'+' && *head != b'-'
                && *head != b'_' && *head != b'.'
            {
                return Err(
                    IdentError(IdentErrorEnum::IllegalCharacter(*head))
                )
            }
            bytes = tail;
        }
        Ok(())
    }

    /// Converts the ident to a byte slice.
    pub const fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Converts the ident to a string slice.
    pub const fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a boxed ident equal to this ident.
    pub fn to_boxed(&self) -> Box<Self> {
        // Safety: we already have the correct content.
        unsafe { Ident::from_box_unchecked(Box::from(self.as_bytes())) }
    }
}


//--- Clone

impl Clone for Box<Ident> {
    fn clone(&self) -> Self {
        self.to_boxed()
    }
}


//--- From

impl<'a> From<&'a Ident> for Box<Ident> {
    fn from(src: &'a Ident) -> Self {
        src.to_boxed()
    }
}


//--- AsRef

impl AsRef<str> for Ident {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}


//--- ToOwned

impl ToOwned for Ident {
    type Owned = Box<Ident>;

    fn to_owned(&self) -> Self::Owned {
        self.to_boxed()
    }
}


//--- Display

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}


//------------ IdentError ----------------------------------------------------

/// An error happened while parsing an [`Ident`].
#[derive(Clone, Copy, Debug)]
pub struct IdentError(IdentErrorEnum);

#[derive(Clone, Copy, Debug)]
enum IdentErrorEnum {
    Empty,
    LeadingDot,
    IllegalCharacter(u8)
}

impl fmt::Display for IdentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::IdentErrorEnum::*;

        match self.0 {
            Empty => f.write_str("empty storage identifier"),
            LeadingDot => f.write_str("leading period"),
            IllegalCharacter(n) => {
                match char::from_u32(n.into()) {
                    Some(ch) => {
                        write!(f,
                            "storage identifier with illegal character '{ch}'"
                        )
                    },
                    None => {
                        write!(f,
                            "storage identifier with illegal character \
                             0x{n:02x}'"
                        )
                    }
                }
            }
        }
    }
}

impl error::Error for IdentError { }


//============ Tests =========================================================
