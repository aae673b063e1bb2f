//! Concurrent fetch-and-verify of a diff set
//!
//! Each entry is copied to the local home under its base name, re-hashed from
//! the bytes that landed on disk, and recorded under that computed hash. The
//! remote-declared hash only selects what to fetch; a corrupted transfer is
//! recorded under whatever its bytes hash to and the remote entry shows up in
//! the next diff again.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cache::{Cache, CacheStore};
use crate::config::SyncConfig;
use crate::digest::{self, DigestKind};
use crate::error::{Error, ErrorList, Result};
use crate::logger::Logger;
use crate::transport::Transport;

#[derive(Clone, Debug)]
pub struct FetchOptions {
    pub max_concurrent: usize, // 0 = unbounded
    pub checkpoint: bool,
    pub digest: DigestKind,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            checkpoint: true,
            digest: DigestKind::Md5,
        }
    }
}

impl From<&SyncConfig> for FetchOptions {
    fn from(s: &SyncConfig) -> Self {
        Self {
            max_concurrent: s.max_concurrent,
            checkpoint: s.checkpoint,
            digest: s.digest,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    pub hash: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedItem {
    pub remote: String,
    pub local: PathBuf,
    pub hash: String,
    pub bytes: u64,
}

/// Outcome of one batch. Every entry ran; `errors` holds one error per failed item.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub fetched: Vec<FetchedItem>,
    pub errors: ErrorList,
}

impl FetchReport {
    pub fn bytes(&self) -> u64 {
        self.fetched.iter().map(|f| f.bytes).sum()
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Combined error of the batch: `Ok` only when no item failed
    pub fn into_result(self) -> Result<Vec<FetchedItem>> {
        let FetchReport { fetched, errors } = self;
        errors.into_result().map(|_| fetched)
    }
}

/// Local destination of a remote path: `home` joined with the remote base name
pub fn local_destination(home: &Path, remote: &str) -> Option<PathBuf> {
    let name = remote.trim_end_matches('/').rsplit('/').next()?;
    if name.is_empty() || name == "." || name == ".." || name.contains('\0') {
        return None;
    }
    Some(home.join(name))
}

/// Digest of a local file, computed off the async runtime
pub async fn hash_local(kind: DigestKind, path: &Path) -> Result<String> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || digest::file_digest(kind, &owned))
        .await
        .map_err(|e| Error::io(path, std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

/// Copy one remote file to `local` and hash the bytes that landed there.
///
/// A failed copy removes the partial local file.
pub async fn fetch_file(
    transport: &dyn Transport,
    remote: &str,
    local: &Path,
    kind: DigestKind,
) -> Result<FetchedFile> {
    let mut rs = transport.open_read(remote).await?;
    if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io(parent, e))?;
    }
    let mut file = tokio::fs::File::create(local)
        .await
        .map_err(|e| Error::io(local, e))?;

    let copied: Result<u64> = async {
        let mut bytes = 0u64;
        while let Some(chunk) = rs.next_chunk().await? {
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::io(local, e))?;
            bytes += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| Error::io(local, e))?;
        file.sync_all().await.map_err(|e| Error::io(local, e))?;
        Ok(bytes)
    }
    .await;
    drop(file);

    let bytes = match copied {
        Ok(n) => n,
        Err(e) => {
            let _ = tokio::fs::remove_file(local).await;
            return Err(e);
        }
    };
    let hash = hash_local(kind, local).await?;
    Ok(FetchedFile { hash, bytes })
}

/// Runs a diff set against one transport and one cache store
pub struct FetchCoordinator {
    transport: Arc<dyn Transport>,
    store: Arc<CacheStore>,
    home: PathBuf,
    opts: FetchOptions,
    logger: Arc<dyn Logger>,
}

impl FetchCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<CacheStore>,
        home: impl Into<PathBuf>,
        opts: FetchOptions,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            transport,
            store,
            home: home.into(),
            opts,
            logger,
        }
    }

    /// Fetch every entry of `to_fetch` and record each under its computed hash.
    ///
    /// Never stops early: the report carries every success and every item
    /// error once all tasks and their checkpoints are done. Entries that
    /// would land on the same local file are fetched once, in hash order,
    /// and the rest are reported as item errors.
    pub async fn fetch_all(&self, to_fetch: &Cache) -> FetchReport {
        let started = Instant::now();
        self.logger.planned(to_fetch.len() as u64);

        let limit = match self.opts.max_concurrent {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };

        let mut report = FetchReport::default();
        let mut claimed: HashMap<PathBuf, &str> = HashMap::new();
        let mut tasks = JoinSet::new();

        for (declared, remote) in to_fetch {
            let local = match local_destination(&self.home, remote) {
                Some(p) => p,
                None => {
                    let e = Error::remote(remote.as_str(), "remote path has no file name");
                    self.item_failed(&mut report, remote, e);
                    continue;
                }
            };
            if let Some(first) = claimed.get(&local) {
                let e = Error::io(
                    &local,
                    std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        format!("destination already claimed by {}", first),
                    ),
                );
                self.item_failed(&mut report, remote, e);
                continue;
            }
            claimed.insert(local.clone(), remote.as_str());

            let job = Job {
                transport: self.transport.clone(),
                store: self.store.clone(),
                logger: self.logger.clone(),
                remote: remote.clone(),
                declared: declared.clone(),
                local,
                opts: self.opts.clone(),
            };
            let limit = limit.clone();
            tasks.spawn(async move {
                let _permit = match limit {
                    Some(sem) => match sem.acquire_owned().await {
                        Ok(p) => Some(p),
                        Err(_) => {
                            let e = Error::State("shutting down");
                            return (job.remote, Err(e));
                        }
                    },
                    None => None,
                };
                // A panicking job still reports which item it was fetching
                let remote = job.remote.clone();
                let res = match tokio::spawn(async move { job.run().await }).await {
                    Ok(res) => res,
                    Err(e) => Err(Error::remote(remote.as_str(), format!("fetch task failed: {}", e))),
                };
                (remote, res)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(item))) => report.fetched.push(item),
                Ok((remote, Err(e))) => self.item_failed(&mut report, &remote, e),
                Err(e) => {
                    let e = Error::remote("<fetch task>", e);
                    self.logger.error("fetch", "<fetch task>", &e.to_string());
                    report.errors.push(e);
                }
            }
        }

        self.logger.done(
            report.fetched.len() as u64,
            report.bytes(),
            started.elapsed().as_secs_f64(),
        );
        report
    }

    fn item_failed(&self, report: &mut FetchReport, remote: &str, e: Error) {
        self.logger.error("fetch", remote, &e.to_string());
        report.errors.push(Error::item(remote, e));
    }
}

struct Job {
    transport: Arc<dyn Transport>,
    store: Arc<CacheStore>,
    logger: Arc<dyn Logger>,
    remote: String,
    declared: String,
    local: PathBuf,
    opts: FetchOptions,
}

impl Job {
    async fn run(&self) -> Result<FetchedItem> {
        let got = fetch_file(&*self.transport, &self.remote, &self.local, self.opts.digest).await?;
        if got.hash != self.declared {
            self.logger.error(
                "verify",
                &self.remote,
                &format!("catalog says {}, bytes hash to {}", self.declared, got.hash),
            );
        }

        let local = self.local.to_string_lossy().into_owned();
        if self.opts.checkpoint {
            let store = self.store.clone();
            let (hash, path) = (got.hash.clone(), local.clone());
            let saved = tokio::task::spawn_blocking(move || store.insert_and_persist(hash, path))
                .await
                .map_err(|e| Error::io(&self.local, std::io::Error::new(std::io::ErrorKind::Other, e)))?;
            // The entry is recorded either way; the final save on close retries
            if let Err(e) = saved {
                self.logger.error("checkpoint", &local, &e.to_string());
            }
        } else {
            self.store.insert(got.hash.clone(), local);
        }

        self.logger
            .fetched(&self.remote, &self.local, &got.hash, got.bytes);
        Ok(FetchedItem {
            remote: self.remote.clone(),
            local: self.local.clone(),
            hash: got.hash,
            bytes: got.bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::digest_bytes;
    use crate::logger::NoopLogger;
    use crate::transport::{DirTransport, Inbound, ReadStream, WriteStream};
    use async_trait::async_trait;
    use std::fs;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Fixture {
        _dir: TempDir,
        remote: PathBuf,
        home: PathBuf,
        cache_path: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let remote = dir.path().join("server");
        let home = dir.path().join("onboard");
        fs::create_dir_all(&remote).unwrap();
        fs::create_dir_all(&home).unwrap();
        let cache_path = home.join("tortuga.json");
        Fixture {
            _dir: dir,
            remote,
            home,
            cache_path,
        }
    }

    fn publish(fx: &Fixture, rel: &str, body: &[u8]) -> String {
        let p = fx.remote.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(&p, body).unwrap();
        digest_bytes(DigestKind::Md5, body)
    }

    fn coordinator(fx: &Fixture, store: Arc<CacheStore>, opts: FetchOptions) -> FetchCoordinator {
        FetchCoordinator::new(
            Arc::new(DirTransport::new(&fx.remote)),
            store,
            &fx.home,
            opts,
            Arc::new(NoopLogger),
        )
    }

    /// Serves one chunk of every file and then fails it; panics on `panic/` paths
    struct FailsMidFile;

    #[async_trait]
    impl Transport for FailsMidFile {
        async fn open_read(&self, path: &str) -> Result<ReadStream> {
            if path.starts_with("panic/") {
                panic!("transport bug while opening {}", path);
            }
            let (tx, rx) = mpsc::channel(4);
            tx.send(Inbound::Data(b"first half of the book".to_vec()))
                .await
                .unwrap();
            tx.send(Inbound::Fail("server read error".to_string()))
                .await
                .unwrap();
            Ok(ReadStream::new(path, rx))
        }

        async fn open_write(&self, path: &str) -> Result<WriteStream> {
            Err(Error::remote(path, "read only"))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_local_destination_uses_base_name() {
        let home = Path::new("/mnt/onboard");
        assert_eq!(
            local_destination(home, "library/sf/dune.epub"),
            Some(PathBuf::from("/mnt/onboard/dune.epub"))
        );
        assert_eq!(
            local_destination(home, "dune.epub"),
            Some(PathBuf::from("/mnt/onboard/dune.epub"))
        );
        assert_eq!(local_destination(home, ""), None);
        assert_eq!(local_destination(home, "library/.."), None);
    }

    #[tokio::test]
    async fn test_fetch_all_into_empty_cache() {
        let fx = fixture();
        let h1 = publish(&fx, "book1.epub", b"first book");
        let h2 = publish(&fx, "shelf/book2.epub", b"second book");
        let catalog: Cache = [(h1.as_str(), "book1.epub"), (h2.as_str(), "shelf/book2.epub")]
            .into_iter()
            .collect();

        let store = Arc::new(CacheStore::open(&fx.cache_path).unwrap());
        let to_fetch = store.missing_from(&catalog);
        let report = coordinator(&fx, store.clone(), FetchOptions::default())
            .fetch_all(&to_fetch)
            .await;

        assert!(report.is_success(), "{}", report.errors);
        assert_eq!(report.fetched.len(), 2);
        assert_eq!(report.bytes(), 21);
        assert_eq!(fs::read(fx.home.join("book1.epub")).unwrap(), b"first book");
        assert_eq!(fs::read(fx.home.join("book2.epub")).unwrap(), b"second book");

        let snap = store.snapshot();
        assert_eq!(snap.get(&h2), fx.home.join("book2.epub").to_str());
        // Checkpointing wrote the same content to disk
        assert_eq!(Cache::load(&fx.cache_path).unwrap(), snap);
        // Second run has nothing to do
        assert!(store.missing_from(&catalog).is_empty());
    }

    #[tokio::test]
    async fn test_only_missing_entries_are_fetched() {
        let fx = fixture();
        let h1 = publish(&fx, "book1.epub", b"first book");
        let h2 = publish(&fx, "book2.epub", b"second book");
        let catalog: Cache = [(h1.as_str(), "book1.epub"), (h2.as_str(), "book2.epub")]
            .into_iter()
            .collect();
        let local: Cache = [(h1.as_str(), "/elsewhere/book1.epub")].into_iter().collect();
        let store = Arc::new(CacheStore::with_cache(&fx.cache_path, local));

        let report = coordinator(&fx, store.clone(), FetchOptions::default())
            .fetch_all(&store.missing_from(&catalog))
            .await;

        assert!(report.is_success());
        assert_eq!(report.fetched.len(), 1);
        assert_eq!(report.fetched[0].remote, "book2.epub");
        assert!(!fx.home.join("book1.epub").exists());
        assert_eq!(store.snapshot().get(&h1), Some("/elsewhere/book1.epub"));
    }

    #[tokio::test]
    async fn test_partial_failure_collects_every_error() {
        let fx = fixture();
        let mut catalog = Cache::new();
        for i in 0..5 {
            let name = format!("book{}.epub", i);
            let h = publish(&fx, &name, name.as_bytes());
            catalog.insert(h, name);
        }
        catalog.insert("0".repeat(32), "gone1.epub");
        catalog.insert("1".repeat(32), "gone2.epub");

        let store = Arc::new(CacheStore::open(&fx.cache_path).unwrap());
        let opts = FetchOptions {
            max_concurrent: 2,
            ..FetchOptions::default()
        };
        let report = coordinator(&fx, store.clone(), opts).fetch_all(&catalog).await;

        assert_eq!(report.fetched.len(), 5);
        assert_eq!(report.errors.len(), 2);
        assert!(report
            .errors
            .iter()
            .all(|e| matches!(e, Error::Item { source, .. } if matches!(**source, Error::Remote { .. }))));
        assert_eq!(store.len(), 5);
        assert!(!fx.home.join("gone1.epub").exists());
        assert!(matches!(report.into_result(), Err(Error::Joined(l)) if l.len() == 2));
    }

    #[tokio::test]
    async fn test_stream_failing_mid_file_leaves_nothing_behind() {
        let fx = fixture();
        let catalog: Cache = [("a".repeat(32).as_str(), "shelf/torn.epub")]
            .into_iter()
            .collect();
        let store = Arc::new(CacheStore::open(&fx.cache_path).unwrap());
        let coordinator = FetchCoordinator::new(
            Arc::new(FailsMidFile),
            store.clone(),
            &fx.home,
            FetchOptions::default(),
            Arc::new(NoopLogger),
        );

        let report = coordinator.fetch_all(&catalog).await;

        assert!(report.fetched.is_empty());
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(
            report.errors.iter().next(),
            Some(Error::Item { remote, source }) if remote == "shelf/torn.epub"
                && matches!(**source, Error::Remote { .. })
        ));
        assert!(store.is_empty());
        assert!(!fx.home.join("torn.epub").exists());
        assert!(Cache::load(&fx.cache_path).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_fetch_is_reported_against_its_item() {
        let fx = fixture();
        let catalog: Cache = [
            ("b".repeat(32).as_str(), "panic/crash.epub"),
            ("c".repeat(32).as_str(), "shelf/torn.epub"),
        ]
        .into_iter()
        .collect();
        let store = Arc::new(CacheStore::open(&fx.cache_path).unwrap());
        let coordinator = FetchCoordinator::new(
            Arc::new(FailsMidFile),
            store.clone(),
            &fx.home,
            FetchOptions::default(),
            Arc::new(NoopLogger),
        );

        let report = coordinator.fetch_all(&catalog).await;

        assert_eq!(report.errors.len(), 2);
        let mut failed: Vec<&str> = report
            .errors
            .iter()
            .filter_map(|e| match e {
                Error::Item { remote, .. } => Some(remote.as_str()),
                _ => None,
            })
            .collect();
        failed.sort();
        assert_eq!(failed, vec!["panic/crash.epub", "shelf/torn.epub"]);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_transfer_is_keyed_by_actual_bytes() {
        let fx = fixture();
        let actual = publish(&fx, "book1.epub", b"not what the catalog claims");
        let declared = "f".repeat(32);
        let catalog: Cache = [(declared.as_str(), "book1.epub")].into_iter().collect();

        let store = Arc::new(CacheStore::open(&fx.cache_path).unwrap());
        let report = coordinator(&fx, store.clone(), FetchOptions::default())
            .fetch_all(&catalog)
            .await;

        assert!(report.is_success());
        assert_eq!(report.fetched[0].hash, actual);
        assert!(store.contains(&actual));
        assert!(!store.contains(&declared));
        // The declared entry stays in the diff for the next run
        assert_eq!(store.missing_from(&catalog).len(), 1);
    }

    #[tokio::test]
    async fn test_colliding_destinations_fetch_once() {
        let fx = fixture();
        let ha = publish(&fx, "a/same.epub", b"from a");
        let hb = publish(&fx, "b/same.epub", b"from b");
        let catalog: Cache = [(ha.as_str(), "a/same.epub"), (hb.as_str(), "b/same.epub")]
            .into_iter()
            .collect();
        let (first, second) = if ha < hb { ("a/same.epub", "b/same.epub") } else { ("b/same.epub", "a/same.epub") };

        let store = Arc::new(CacheStore::open(&fx.cache_path).unwrap());
        let report = coordinator(&fx, store.clone(), FetchOptions::default())
            .fetch_all(&catalog)
            .await;

        assert_eq!(report.fetched.len(), 1);
        assert_eq!(report.fetched[0].remote, first);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors.iter().next(), Some(Error::Item { remote, .. }) if remote == second));
    }

    #[tokio::test]
    async fn test_unbounded_without_checkpoint_leaves_disk_alone() {
        let fx = fixture();
        let mut catalog = Cache::new();
        for i in 0..20 {
            let name = format!("vol{:02}.cbz", i);
            let h = publish(&fx, &name, format!("volume {}", i).as_bytes());
            catalog.insert(h, name);
        }
        let store = Arc::new(CacheStore::open(&fx.cache_path).unwrap());
        let opts = FetchOptions {
            max_concurrent: 0,
            checkpoint: false,
            ..FetchOptions::default()
        };
        let report = coordinator(&fx, store.clone(), opts).fetch_all(&catalog).await;

        assert!(report.is_success());
        assert_eq!(store.len(), 20);
        assert!(!fx.cache_path.exists());
        store.persist().unwrap();
        assert_eq!(Cache::load(&fx.cache_path).unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_fetch_file_other_digest() {
        let fx = fixture();
        publish(&fx, "notes.txt", b"abc");
        let t = DirTransport::new(&fx.remote);
        let got = fetch_file(&t, "notes.txt", &fx.home.join("notes.txt"), DigestKind::Sha256)
            .await
            .unwrap();
        assert_eq!(got.bytes, 3);
        assert_eq!(
            got.hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
