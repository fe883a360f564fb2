use std::fmt;

/// Builds an [`Error`] variant from a format string, e.g.
/// `err!(Storage, "page {} out of bounds", n)`.
macro_rules! err {
    ($variant:ident, $($arg:tt)*) => {
        $crate::errors::Error::$variant(format!($($arg)*))
    };
}

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// On-disk or in-cache state violated an invariant. Fatal at the CLI
    /// boundary.
    Storage(String),
    /// Header or row bytes could not be encoded/decoded.
    Encoding(String),
    /// Insert hit an existing key. Reported to the user; the loop continues.
    DuplicateKey,
    /// Delete or lookup missed. Reported to the user; the loop continues.
    KeyNotFound,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error. {}", e),
            Error::Storage(msg) => write!(f, "Storage error. {}", msg),
            Error::Encoding(msg) => write!(f, "Encoding error. {}", msg),
            Error::DuplicateKey => write!(f, "Duplicate key"),
            Error::KeyNotFound => write!(f, "Key not found"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::Io(err)
    }
}
