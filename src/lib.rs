//! Tortuga library
//!
//! Content-addressed e-book sync: a device keeps a `hash -> path` cache, diffs
//! it against the catalog a server publishes, and fetches only what is
//! missing over a pinned TLS connection.

pub mod bay;
pub mod cache;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod digest;
pub mod error;
pub mod fetch;
pub mod logger;
pub mod net_async;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod tls;
pub mod transport;
pub mod url;

pub use bay::Bay;
pub use cache::{diff, Cache, CacheStore};
pub use config::Config;
pub use error::{Error, ErrorList, Result};
pub use fetch::{FetchCoordinator, FetchOptions, FetchReport};
pub use transport::{DirTransport, ReadStream, Transport, WriteStream};
