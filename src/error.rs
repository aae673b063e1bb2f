//! Error taxonomy for the sync engine
//!
//! Transport failures are fatal to a session, parse failures are fatal to the
//! load that hit them, and I/O or remote failures are scoped to one item or
//! operation. Batches collect item errors into an [`ErrorList`].

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// Connection, authentication or host identity failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed cache or catalog content.
    #[error("parse error in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// Local filesystem failure.
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The remote side could not open, read or write one path.
    #[error("remote error on {path}: {message}")]
    Remote { path: String, message: String },

    #[error("config error: {0}")]
    Config(String),

    /// Operation attempted in the wrong session state.
    #[error("session is {0}")]
    State(&'static str),

    /// A single fetch-set entry failed.
    #[error("fetch {remote}: {source}")]
    Item {
        remote: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{0}")]
    Joined(ErrorList),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn remote(path: impl Into<String>, message: impl fmt::Display) -> Self {
        Error::Remote {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn item(remote: impl Into<String>, source: Error) -> Self {
        Error::Item {
            remote: remote.into(),
            source: Box::new(source),
        }
    }

    /// True for errors that end the whole session rather than one item.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Transport(_) | Error::State(_) => true,
            Error::Item { source, .. } => source.is_fatal(),
            _ => false,
        }
    }
}

/// Combined error value for batch operations. Empty means success.
#[derive(Debug, Default)]
pub struct ErrorList(Vec<Error>);

impl ErrorList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, err: Error) {
        self.0.push(err);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Error> {
        self.0.iter()
    }

    /// `Ok(())` when empty, the sole error when there is one, otherwise `Joined`.
    pub fn into_result(mut self) -> Result<()> {
        match self.0.len() {
            0 => Ok(()),
            1 => Err(self.0.remove(0)),
            _ => Err(Error::Joined(self)),
        }
    }
}

impl From<Vec<Error>> for ErrorList {
    fn from(v: Vec<Error>) -> Self {
        Self(v)
    }
}

impl IntoIterator for ErrorList {
    type Item = Error;
    type IntoIter = std::vec::IntoIter<Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.len() {
            0 => write!(f, "no errors"),
            1 => write!(f, "{}", self.0[0]),
            n => {
                write!(f, "{} errors:", n)?;
                for e in &self.0 {
                    write!(f, "\n  {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ErrorList {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_list_is_success() {
        assert!(ErrorList::new().into_result().is_ok());
    }

    #[test]
    fn test_single_error_is_unwrapped() {
        let mut list = ErrorList::new();
        list.push(Error::Transport("gone".into()));
        match list.into_result() {
            Err(Error::Transport(msg)) => assert_eq!(msg, "gone"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_joined_display_names_every_error() {
        let list = ErrorList::from(vec![
            Error::item("a.epub", Error::remote("a.epub", "no such file")),
            Error::item("b.epub", Error::remote("b.epub", "no such file")),
        ]);
        let s = list.to_string();
        assert!(s.starts_with("2 errors:"));
        assert!(s.contains("fetch a.epub"));
        assert!(s.contains("fetch b.epub"));
    }

    #[test]
    fn test_fatality() {
        assert!(Error::Transport("x".into()).is_fatal());
        assert!(Error::item("a", Error::Transport("x".into())).is_fatal());
        assert!(!Error::item("a", Error::remote("a", "missing")).is_fatal());
    }
}
