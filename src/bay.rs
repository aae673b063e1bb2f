//! `Bay`: one sync session against one server
//!
//! A session owns exactly one transport and one cache store. It exists only
//! once connected; `close` moves it to its terminal state, after which every
//! operation fails fast with [`Error::State`].

use std::path::Path;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::cache::{Cache, CacheStore};
use crate::config::Config;
use crate::error::{Error, ErrorList, Result};
use crate::fetch::{self, FetchCoordinator, FetchOptions, FetchReport};
use crate::logger::Logger;
use crate::net_async::client::RemoteTransport;
use crate::protocol::CHUNK_SIZE;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Closed,
}

pub struct Bay {
    id: Uuid,
    state: SessionState,
    config: Config,
    transport: Arc<dyn Transport>,
    store: Arc<CacheStore>,
    logger: Arc<dyn Logger>,
}

impl Bay {
    /// Connect to the configured server and load the local cache.
    ///
    /// The server must present the pinned certificate; any handshake failure
    /// is an [`Error::Transport`] and no cache is read or written.
    pub async fn connect(config: Config, logger: Arc<dyn Logger>) -> Result<Self> {
        config.validate()?;
        let addr = config.remote_addr()?;
        let transport = RemoteTransport::connect(
            &addr,
            &config.remote.token,
            &config.remote.host_fingerprint,
        )
        .await?;
        Self::with_transport(config, Arc::new(transport), logger).await
    }

    /// Start a session over an already established transport
    pub async fn with_transport(
        config: Config,
        transport: Arc<dyn Transport>,
        logger: Arc<dyn Logger>,
    ) -> Result<Self> {
        let store = match CacheStore::open(config.cache_path()) {
            Ok(s) => s,
            Err(e) => {
                let _ = transport.close().await;
                return Err(e);
            }
        };
        let id = Uuid::new_v4();
        let label = if config.remote.address.is_empty() {
            "local"
        } else {
            config.remote.address.as_str()
        };
        logger.start(&id, label);
        Ok(Self {
            id,
            state: SessionState::Connected,
            config,
            transport,
            store: Arc::new(store),
            logger,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current local cache contents
    pub fn cache(&self) -> Cache {
        self.store.snapshot()
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.state {
            SessionState::Connected => Ok(()),
            SessionState::Closed => Err(Error::State("closed")),
        }
    }

    /// Read and parse a remote catalog
    pub async fn metadata(&self, remote_path: &str) -> Result<Cache> {
        self.ensure_connected()?;
        let mut rs = self.transport.open_read(remote_path).await?;
        let mut buf = Vec::new();
        while let Some(chunk) = rs.next_chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Cache::from_json(&buf, remote_path)
    }

    /// Entries of the configured catalog that the local cache does not hold
    pub async fn diff(&self) -> Result<Cache> {
        let catalog = self.metadata(&self.config.remote.catalog).await?;
        Ok(self.store.missing_from(&catalog))
    }

    /// Transfer one file and return the digest of the bytes written locally.
    /// The cache is not touched.
    pub async fn fetch(&self, local: &Path, remote: &str) -> Result<String> {
        self.ensure_connected()?;
        let got = fetch::fetch_file(&*self.transport, remote, local, self.config.sync.digest).await?;
        Ok(got.hash)
    }

    /// Fetch a set of entries concurrently, recording each in the cache
    pub async fn fetch_all(&self, to_fetch: &Cache) -> Result<FetchReport> {
        self.ensure_connected()?;
        let coordinator = FetchCoordinator::new(
            self.transport.clone(),
            self.store.clone(),
            &self.config.local.home,
            FetchOptions::from(&self.config.sync),
            self.logger.clone(),
        );
        Ok(coordinator.fetch_all(to_fetch).await)
    }

    /// Diff against the configured catalog and fetch everything missing
    pub async fn import_all(&self) -> Result<FetchReport> {
        let to_fetch = self.diff().await?;
        self.fetch_all(&to_fetch).await
    }

    /// Push one local file to `remote`, replacing it. Returns bytes sent.
    pub async fn upload(&self, local: &Path, remote: &str) -> Result<u64> {
        self.ensure_connected()?;
        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|e| Error::io(local, e))?;
        let mut ws = self.transport.open_write(remote).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = file.read(&mut buf).await.map_err(|e| Error::io(local, e))?;
            if n == 0 {
                break;
            }
            ws.write_chunk(buf[..n].to_vec()).await?;
            total += n as u64;
        }
        ws.finish().await?;
        self.logger.uploaded(local, remote, total);
        Ok(total)
    }

    /// Remote path for uploading `local` into the configured upload directory
    pub fn upload_destination(&self, local: &Path) -> Option<String> {
        let name = local.file_name()?.to_str()?;
        let dir = self.config.remote.upload_dir.trim_end_matches('/');
        Some(if dir.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", dir, name)
        })
    }

    /// Close the transport and persist the cache.
    ///
    /// Both steps always run; their failures are joined. Closing a closed
    /// session does nothing.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;

        let mut errors = ErrorList::new();
        if let Err(e) = self.transport.close().await {
            self.logger.error("close", "transport", &e.to_string());
            errors.push(e);
        }
        let store = self.store.clone();
        let saved = tokio::task::spawn_blocking(move || store.persist())
            .await
            .unwrap_or_else(|e| {
                Err(Error::io(
                    self.store.path(),
                    std::io::Error::new(std::io::ErrorKind::Other, e),
                ))
            });
        if let Err(e) = saved {
            self.logger
                .error("close", &self.store.path().display().to_string(), &e.to_string());
            errors.push(e);
        }
        errors.into_result()
    }
}
