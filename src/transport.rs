//! Transport boundary the sync engine consumes
//!
//! A transport opens remote paths for streaming read or write and is closed
//! once at the end of a session. Authentication and host verification happen
//! when the concrete transport is built, never here.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::protocol::{CHUNK_SIZE, STREAM_BUFFER};
use crate::protocol_core::{ensure_parent_exists, normalize_under_root};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a remote path for streaming read
    async fn open_read(&self, path: &str) -> Result<ReadStream>;

    /// Create or truncate a remote path for streaming write
    async fn open_write(&self, path: &str) -> Result<WriteStream>;

    /// Close the underlying channel. Closing twice is not an error.
    async fn close(&self) -> Result<()>;
}

/// Events delivered to one open stream
#[derive(Debug)]
pub(crate) enum Inbound {
    Ack,
    Data(Vec<u8>),
    End,
    Fail(String),
}

/// Remote file being read, chunk by chunk
pub struct ReadStream {
    path: String,
    rx: mpsc::Receiver<Inbound>,
    finished: bool,
}

impl ReadStream {
    pub(crate) fn new(path: impl Into<String>, rx: mpsc::Receiver<Inbound>) -> Self {
        Self {
            path: path.into(),
            rx,
            finished: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Next chunk of the file, or `None` once the remote signalled the end.
    ///
    /// A stream that stops without an explicit end is reported as a transport
    /// error rather than a short file.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }
        loop {
            match self.rx.recv().await {
                Some(Inbound::Ack) => continue,
                Some(Inbound::Data(b)) => return Ok(Some(b)),
                Some(Inbound::End) => {
                    self.finished = true;
                    return Ok(None);
                }
                Some(Inbound::Fail(msg)) => {
                    self.finished = true;
                    return Err(Error::remote(&self.path, msg));
                }
                None => {
                    self.finished = true;
                    return Err(Error::Transport(format!(
                        "stream for {} closed before end of file",
                        self.path
                    )));
                }
            }
        }
    }
}

/// Messages from a [`WriteStream`] to whoever commits the file.
/// A channel that closes without `Finish` means the write was abandoned.
#[derive(Debug)]
pub(crate) enum WriteOp {
    Data(Vec<u8>),
    Finish,
}

/// Remote file being written. Nothing is committed until [`WriteStream::finish`];
/// dropping the stream abandons the file.
pub struct WriteStream {
    path: String,
    tx: mpsc::Sender<WriteOp>,
    outcome: oneshot::Receiver<std::result::Result<(), String>>,
}

impl WriteStream {
    pub(crate) fn new(
        path: impl Into<String>,
        tx: mpsc::Sender<WriteOp>,
        outcome: oneshot::Receiver<std::result::Result<(), String>>,
    ) -> Self {
        Self {
            path: path.into(),
            tx,
            outcome,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn write_chunk(&mut self, data: Vec<u8>) -> Result<()> {
        if self.tx.send(WriteOp::Data(data)).await.is_ok() {
            return Ok(());
        }
        // The committing side is gone; its outcome says why.
        match (&mut self.outcome).await {
            Ok(Err(msg)) => Err(Error::remote(&self.path, msg)),
            _ => Err(Error::remote(&self.path, "write aborted by remote")),
        }
    }

    /// Signal end of data and wait until the remote side has committed the file
    pub async fn finish(self) -> Result<()> {
        let WriteStream { path, tx, outcome } = self;
        // A failed send means the other side already settled the outcome.
        let _ = tx.send(WriteOp::Finish).await;
        drop(tx);
        match outcome.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(msg)) => Err(Error::remote(path, msg)),
            Err(_) => Err(Error::Transport(format!("write stream for {} lost", path))),
        }
    }
}

/// A local directory standing in for the remote side. Used for mirrors on
/// the same machine and in tests.
pub struct DirTransport {
    root: PathBuf,
    closed: AtomicBool,
}

impl DirTransport {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        if self.is_closed() {
            return Err(Error::Transport("transport is closed".into()));
        }
        normalize_under_root(&self.root, Path::new(path)).map_err(|e| Error::remote(path, e))
    }
}

#[async_trait]
impl Transport for DirTransport {
    async fn open_read(&self, path: &str) -> Result<ReadStream> {
        let full = self.resolve(path)?;
        let mut file = tokio::fs::File::open(&full)
            .await
            .map_err(|e| Error::remote(path, e))?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let msg = match file.read(&mut buf).await {
                    Ok(0) => Inbound::End,
                    Ok(n) => Inbound::Data(buf[..n].to_vec()),
                    Err(e) => Inbound::Fail(e.to_string()),
                };
                let last = !matches!(msg, Inbound::Data(_));
                if tx.send(msg).await.is_err() || last {
                    break;
                }
            }
        });
        Ok(ReadStream::new(path, rx))
    }

    async fn open_write(&self, path: &str) -> Result<WriteStream> {
        let full = self.resolve(path)?;
        ensure_parent_exists(&full).map_err(|e| Error::remote(path, e))?;
        let mut file = tokio::fs::File::create(&full)
            .await
            .map_err(|e| Error::remote(path, e))?;
        let (tx, mut rx) = mpsc::channel::<WriteOp>(STREAM_BUFFER);
        let (otx, orx) = oneshot::channel();
        tokio::spawn(async move {
            let res: std::io::Result<bool> = async {
                while let Some(op) = rx.recv().await {
                    match op {
                        WriteOp::Data(chunk) => file.write_all(&chunk).await?,
                        WriteOp::Finish => {
                            file.flush().await?;
                            file.sync_all().await?;
                            return Ok(true);
                        }
                    }
                }
                Ok(false)
            }
            .await;
            let res = match res {
                Ok(true) => Ok(()),
                Ok(false) => Err("write abandoned".to_string()),
                Err(e) => Err(e.to_string()),
            };
            if res.is_err() {
                drop(file);
                let _ = tokio::fs::remove_file(&full).await;
            }
            let _ = otx.send(res);
        });
        Ok(WriteStream::new(path, tx, orx))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn read_all(t: &dyn Transport, path: &str) -> Result<Vec<u8>> {
        let mut rs = t.open_read(path).await?;
        let mut out = Vec::new();
        while let Some(chunk) = rs.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_dir_transport_write_then_read() {
        let dir = TempDir::new().unwrap();
        let t = DirTransport::new(dir.path());
        let body: Vec<u8> = (0..(CHUNK_SIZE * 2 + 17)).map(|i| (i % 253) as u8).collect();

        let mut ws = t.open_write("notes/book.html").await.unwrap();
        for part in body.chunks(1000) {
            ws.write_chunk(part.to_vec()).await.unwrap();
        }
        ws.finish().await.unwrap();

        assert_eq!(std::fs::read(dir.path().join("notes/book.html")).unwrap(), body);
        assert_eq!(read_all(&t, "/notes/book.html").await.unwrap(), body);
    }

    #[tokio::test]
    async fn test_dir_transport_missing_file_is_remote_error() {
        let dir = TempDir::new().unwrap();
        let t = DirTransport::new(dir.path());
        assert!(matches!(t.open_read("missing.epub").await, Err(Error::Remote { .. })));
    }

    #[tokio::test]
    async fn test_dir_transport_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let t = DirTransport::new(dir.path().join("root"));
        std::fs::create_dir(dir.path().join("root")).unwrap();
        std::fs::write(dir.path().join("secret"), b"x").unwrap();
        assert!(t.open_read("../secret").await.is_err());
        assert!(t.open_write("../secret").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dir_transport_write_through_symlink_stays_inside() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        let outside = dir.path().join("outside");
        std::fs::create_dir(&root).unwrap();
        std::fs::create_dir(&outside).unwrap();
        std::os::unix::fs::symlink("../outside", root.join("link")).unwrap();
        let t = DirTransport::new(&root);

        assert!(matches!(t.open_write("link/x.txt").await, Err(Error::Remote { .. })));
        assert!(matches!(
            t.open_write("link/newdir/evil.txt").await,
            Err(Error::Remote { .. })
        ));
        assert!(!outside.join("newdir").exists());
    }

    #[tokio::test]
    async fn test_dir_transport_close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.epub"), b"a").unwrap();
        let t = DirTransport::new(dir.path());
        t.close().await.unwrap();
        t.close().await.unwrap();
        assert!(matches!(t.open_read("a.epub").await, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn test_dropped_write_stream_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let t = DirTransport::new(dir.path());
        let mut ws = t.open_write("half.epub").await.unwrap();
        ws.write_chunk(b"half".to_vec()).await.unwrap();
        drop(ws);
        for _ in 0..50 {
            if !dir.path().join("half.epub").exists() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("abandoned upload left a partial file behind");
    }

    #[tokio::test]
    async fn test_stream_without_end_is_transport_error() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Inbound::Data(b"partial".to_vec())).await.unwrap();
        drop(tx);
        let mut rs = ReadStream::new("book.epub", rx);
        assert_eq!(rs.next_chunk().await.unwrap(), Some(b"partial".to_vec()));
        assert!(matches!(rs.next_chunk().await, Err(Error::Transport(_))));
        assert_eq!(rs.next_chunk().await.unwrap(), None);
    }
}
