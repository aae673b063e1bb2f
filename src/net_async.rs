//! Async (Tokio) TLS transport between `tortuga` and `tortugad`.
//!
//! One TLS connection carries any number of file streams. Every stream frame
//! starts with a u32 stream id chosen by the client; see `protocol::frame` for
//! the exchange on each stream.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Duration};

use crate::protocol::timeouts::read_deadline_ms;
use crate::protocol::HEADER_LEN;
use crate::protocol_core::{build_frame_header, parse_frame_header, validate_frame_size};

type Frame = (u8, Vec<u8>);

pub(crate) async fn write_frame<S: AsyncWrite + Unpin>(
    stream: &mut S,
    t: u8,
    payload: &[u8],
) -> Result<()> {
    validate_frame_size(payload.len())?;
    let hdr = build_frame_header(t, payload.len() as u32);
    stream.write_all(&hdr).await?;
    if !payload.is_empty() {
        stream.write_all(payload).await?;
    }
    stream.flush().await?;
    Ok(())
}

/// Read one frame. `None` means the peer closed cleanly between frames.
pub(crate) async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Option<Frame>> {
    let mut hdr = [0u8; HEADER_LEN];
    let n = stream.read(&mut hdr[..1]).await?;
    if n == 0 {
        return Ok(None);
    }
    stream
        .read_exact(&mut hdr[1..])
        .await
        .context("truncated frame header")?;
    let (typ, len) = parse_frame_header(&hdr)?;
    let len = len as usize;
    validate_frame_size(len)?;
    let mut payload = vec![0u8; len];
    if len > 0 {
        let ms = read_deadline_ms(len);
        match timeout(Duration::from_millis(ms), stream.read_exact(&mut payload)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => bail!("frame payload timeout ({} ms)", ms),
        }
    }
    Ok(Some((typ, payload)))
}

pub(crate) async fn read_frame_timed<S: AsyncRead + Unpin>(
    stream: &mut S,
    ms: u64,
) -> Result<Option<Frame>> {
    match timeout(Duration::from_millis(ms), read_frame(stream)).await {
        Ok(res) => res,
        Err(_) => bail!("frame IO timeout ({} ms)", ms),
    }
}

pub mod server {
    use super::*;
    use crate::protocol::frame;
    use crate::protocol::timeouts::HANDSHAKE_MS;
    use crate::protocol::{CHUNK_SIZE, STREAM_BUFFER};
    use crate::protocol_core::{decode_open, encode_stream, normalize_under_root, split_stream};
    use sha2::{Digest, Sha256};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio_rustls::TlsAcceptor;

    /// Data for one upload, in order. A channel closed without `End` aborts it.
    enum UploadOp {
        Data(Vec<u8>),
        End,
    }

    pub async fn serve_with_tls(
        bind: &str,
        root: &Path,
        token: &str,
        tls: rustls::ServerConfig,
    ) -> Result<()> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind {}", bind))?;
        serve_listener(listener, root, token, tls).await
    }

    /// Accept loop over an already bound listener
    pub async fn serve_listener(
        listener: TcpListener,
        root: &Path,
        token: &str,
        tls: rustls::ServerConfig,
    ) -> Result<()> {
        let root = root
            .canonicalize()
            .with_context(|| format!("canonicalize root {}", root.display()))?;
        let acceptor = TlsAcceptor::from(Arc::new(tls));
        let token: Arc<str> = Arc::from(token);
        eprintln!(
            "tortugad listening on {} root={}",
            listener.local_addr()?,
            root.display()
        );
        loop {
            let (stream, peer) = listener.accept().await?;
            let _ = stream.set_nodelay(true);
            eprintln!("conn from {}", peer);
            let acceptor = acceptor.clone();
            let root = root.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                match handle_conn(acceptor, stream, root, &token).await {
                    Ok(()) => eprintln!(
                        "conn {} closed after {:.1}s",
                        peer,
                        started.elapsed().as_secs_f64()
                    ),
                    Err(e) => eprintln!("conn {} error: {:#}", peer, e),
                }
            });
        }
    }

    fn token_matches(offered: &[u8], expected: &str) -> bool {
        // Compare digests so the comparison does not leak a matching prefix
        Sha256::digest(offered) == Sha256::digest(expected.as_bytes())
    }

    async fn handle_conn(
        acceptor: TlsAcceptor,
        tcp: TcpStream,
        root: PathBuf,
        token: &str,
    ) -> Result<()> {
        let tls = timeout(Duration::from_millis(HANDSHAKE_MS), acceptor.accept(tcp))
            .await
            .context("tls accept timeout")?
            .context("tls accept")?;
        let (mut rd, mut wr) = tokio::io::split(tls);

        match read_frame_timed(&mut rd, HANDSHAKE_MS).await? {
            Some((frame::HELLO, pl)) if token_matches(&pl, token) => {
                write_frame(&mut wr, frame::WELCOME, &[]).await?;
            }
            Some((frame::HELLO, _)) => {
                write_frame(&mut wr, frame::DENIED, b"bad credentials").await?;
                let _ = wr.shutdown().await;
                bail!("client offered bad credentials");
            }
            Some((t, _)) => {
                write_frame(&mut wr, frame::DENIED, b"expected HELLO").await?;
                let _ = wr.shutdown().await;
                bail!("unexpected frame {} before HELLO", t);
            }
            None => bail!("closed before HELLO"),
        }

        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(64);
        let writer = tokio::spawn(async move {
            while let Some((t, pl)) = out_rx.recv().await {
                write_frame(&mut wr, t, &pl).await?;
            }
            let _ = wr.shutdown().await;
            Ok::<(), anyhow::Error>(())
        });

        let mut uploads: HashMap<u32, mpsc::Sender<UploadOp>> = HashMap::new();
        let res: Result<()> = async {
            while let Some((t, pl)) = read_frame(&mut rd).await? {
                match t {
                    frame::OPEN_READ => {
                        let (id, path) = decode_open(&pl)?;
                        tokio::spawn(send_file(root.clone(), id, path, out_tx.clone()));
                    }
                    frame::OPEN_WRITE => {
                        let (id, path) = decode_open(&pl)?;
                        match create_upload(&root, &path).await {
                            Ok((full, file)) => {
                                let (tx, rx) = mpsc::channel(STREAM_BUFFER);
                                uploads.insert(id, tx);
                                out_tx.send((frame::ACK, encode_stream(id, &[]))).await?;
                                tokio::spawn(receive_file(full, file, id, rx, out_tx.clone()));
                            }
                            Err(e) => {
                                let msg = format!("{:#}", e);
                                out_tx.send((frame::FAIL, encode_stream(id, msg.as_bytes()))).await?;
                            }
                        }
                    }
                    frame::DATA => {
                        let (id, data) = split_stream(&pl)?;
                        if let Some(tx) = uploads.get(&id) {
                            if tx.send(UploadOp::Data(data.to_vec())).await.is_err() {
                                // Upload already failed and reported itself
                                uploads.remove(&id);
                            }
                        }
                    }
                    frame::END => {
                        let (id, _) = split_stream(&pl)?;
                        if let Some(tx) = uploads.remove(&id) {
                            let _ = tx.send(UploadOp::End).await;
                        }
                    }
                    frame::FAIL => {
                        let (id, _) = split_stream(&pl)?;
                        uploads.remove(&id);
                    }
                    frame::BYE => break,
                    other => bail!("unexpected frame: {}", other),
                }
            }
            Ok(())
        }
        .await;

        // Dropping the senders aborts uploads that never reached END
        drop(uploads);
        drop(out_tx);
        let _ = writer.await;
        res
    }

    async fn create_upload(root: &Path, path: &str) -> Result<(PathBuf, tokio::fs::File)> {
        let full = normalize_under_root(root, Path::new(path))?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let file = tokio::fs::File::create(&full)
            .await
            .with_context(|| format!("create {}", path))?;
        Ok((full, file))
    }

    async fn send_file(root: PathBuf, id: u32, path: String, out: mpsc::Sender<Frame>) {
        let opened: Result<tokio::fs::File> = async {
            let full = normalize_under_root(&root, Path::new(&path))?;
            let file = tokio::fs::File::open(&full)
                .await
                .with_context(|| format!("open {}", path))?;
            if file.metadata().await?.is_dir() {
                bail!("{} is a directory", path);
            }
            Ok(file)
        }
        .await;
        let mut file = match opened {
            Ok(f) => f,
            Err(e) => {
                eprintln!("read {}: {:#}", path, e);
                let msg = format!("{:#}", e);
                let _ = out.send((frame::FAIL, encode_stream(id, msg.as_bytes()))).await;
                return;
            }
        };
        if out.send((frame::ACK, encode_stream(id, &[]))).await.is_err() {
            return;
        }
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let next = match file.read(&mut buf).await {
                Ok(0) => (frame::END, encode_stream(id, &[])),
                Ok(n) => (frame::DATA, encode_stream(id, &buf[..n])),
                Err(e) => {
                    eprintln!("read {}: {}", path, e);
                    (frame::FAIL, encode_stream(id, e.to_string().as_bytes()))
                }
            };
            let last = next.0 != frame::DATA;
            if out.send(next).await.is_err() || last {
                return;
            }
        }
    }

    async fn receive_file(
        full: PathBuf,
        mut file: tokio::fs::File,
        id: u32,
        mut rx: mpsc::Receiver<UploadOp>,
        out: mpsc::Sender<Frame>,
    ) {
        let res: Result<bool> = async {
            while let Some(op) = rx.recv().await {
                match op {
                    UploadOp::Data(chunk) => file.write_all(&chunk).await?,
                    UploadOp::End => {
                        file.flush().await?;
                        file.sync_all().await?;
                        return Ok(true);
                    }
                }
            }
            Ok(false)
        }
        .await;
        match res {
            Ok(true) => {
                let _ = out.send((frame::ACK, encode_stream(id, &[]))).await;
            }
            Ok(false) => {
                drop(file);
                let _ = tokio::fs::remove_file(&full).await;
                eprintln!("upload {} abandoned", full.display());
            }
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(&full).await;
                eprintln!("upload {}: {:#}", full.display(), e);
                let msg = format!("{:#}", e);
                let _ = out.send((frame::FAIL, encode_stream(id, msg.as_bytes()))).await;
            }
        }
    }
}

pub mod client {
    use super::*;
    use crate::error::Error;
    use crate::protocol::frame;
    use crate::protocol::timeouts::HANDSHAKE_MS;
    use crate::protocol::{CHUNK_SIZE, STREAM_BUFFER};
    use crate::protocol_core::{encode_open, encode_stream, split_stream};
    use crate::tls;
    use crate::transport::{Inbound, ReadStream, Transport, WriteOp, WriteStream};
    use crate::url::RemoteAddr;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpStream;
    use tokio::sync::{mpsc, oneshot};
    use tokio::task::JoinHandle;
    use tokio_rustls::client::TlsStream;
    use tokio_rustls::TlsConnector;

    type Streams = Arc<Mutex<HashMap<u32, mpsc::Sender<Inbound>>>>;

    /// Client side of a tortugad session
    pub struct RemoteTransport {
        addr: RemoteAddr,
        out: mpsc::Sender<Frame>,
        streams: Streams,
        next_id: AtomicU32,
        closed: AtomicBool,
        writer: Mutex<Option<JoinHandle<Result<()>>>>,
        reader: Mutex<Option<JoinHandle<()>>>,
    }

    async fn tls_connect(
        addr: &RemoteAddr,
        cfg: rustls::ClientConfig,
    ) -> Result<TlsStream<TcpStream>> {
        let tcp = TcpStream::connect(addr.socket_addr())
            .await
            .with_context(|| format!("connect {}", addr))?;
        let _ = tcp.set_nodelay(true);
        TlsConnector::from(Arc::new(cfg))
            .connect(tls::server_name_for(&addr.host), tcp)
            .await
            .with_context(|| format!("tls handshake with {}", addr))
    }

    async fn handshake(
        addr: &RemoteAddr,
        token: &str,
        cfg: rustls::ClientConfig,
    ) -> Result<TlsStream<TcpStream>> {
        let mut stream = tls_connect(addr, cfg).await?;
        write_frame(&mut stream, frame::HELLO, token.as_bytes()).await?;
        match read_frame(&mut stream).await? {
            Some((frame::WELCOME, _)) => Ok(stream),
            Some((frame::DENIED, msg)) => {
                bail!("server denied session: {}", String::from_utf8_lossy(&msg))
            }
            Some((t, _)) => bail!("unexpected frame {} during handshake", t),
            None => bail!("server closed connection during handshake"),
        }
    }

    /// Fetch the fingerprint of the certificate a server presents, without
    /// authenticating. Used to populate `host_fingerprint` in the config.
    pub async fn keyscan(addr: &RemoteAddr) -> crate::Result<String> {
        let (cfg, seen) = tls::build_client_config_capture();
        let mut stream = timeout(Duration::from_millis(HANDSHAKE_MS), tls_connect(addr, cfg))
            .await
            .map_err(|_| Error::Transport(format!("keyscan {} timed out", addr)))?
            .map_err(|e| Error::Transport(format!("{:#}", e)))?;
        let _ = stream.shutdown().await;
        let fp = seen.lock().clone();
        fp.ok_or_else(|| Error::Transport(format!("{} presented no certificate", addr)))
    }

    impl RemoteTransport {
        /// Connect, verify the server against the pinned fingerprint and
        /// authenticate with the token. Every failure is a transport error.
        pub async fn connect(
            addr: &RemoteAddr,
            token: &str,
            host_fingerprint: &str,
        ) -> crate::Result<Self> {
            let cfg = tls::build_client_config_pinned(host_fingerprint);
            let stream = timeout(
                Duration::from_millis(HANDSHAKE_MS),
                handshake(addr, token, cfg),
            )
            .await
            .map_err(|_| Error::Transport(format!("handshake with {} timed out", addr)))?
            .map_err(|e| Error::Transport(format!("{:#}", e)))?;
            Ok(Self::start(addr.clone(), stream))
        }

        fn start(addr: RemoteAddr, stream: TlsStream<TcpStream>) -> Self {
            let (mut rd, mut wr) = tokio::io::split(stream);

            let (out, mut out_rx) = mpsc::channel::<Frame>(64);
            let writer = tokio::spawn(async move {
                while let Some((t, pl)) = out_rx.recv().await {
                    write_frame(&mut wr, t, &pl).await?;
                    if t == frame::BYE {
                        break;
                    }
                }
                wr.shutdown().await.context("shutdown")?;
                Ok::<(), anyhow::Error>(())
            });

            let streams: Streams = Arc::new(Mutex::new(HashMap::new()));
            let demux = streams.clone();
            let reader = tokio::spawn(async move {
                let reason = loop {
                    match read_frame(&mut rd).await {
                        Ok(Some((t, pl))) => {
                            if let Err(e) = dispatch(&demux, t, &pl).await {
                                break format!("{:#}", e);
                            }
                        }
                        Ok(None) => break "connection closed by server".to_string(),
                        Err(e) => break format!("{:#}", e),
                    }
                };
                let pending: Vec<_> = demux.lock().drain().collect();
                for (_, tx) in pending {
                    // A full inbox still ends with a closed channel, which
                    // the stream reports as a transport error
                    let _ = tx.try_send(Inbound::Fail(reason.clone()));
                }
            });

            Self {
                addr,
                out,
                streams,
                next_id: AtomicU32::new(1),
                closed: AtomicBool::new(false),
                writer: Mutex::new(Some(writer)),
                reader: Mutex::new(Some(reader)),
            }
        }

        pub fn addr(&self) -> &RemoteAddr {
            &self.addr
        }

        fn register(&self) -> crate::Result<(u32, mpsc::Receiver<Inbound>)> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::Transport("transport is closed".into()));
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = mpsc::channel(STREAM_BUFFER);
            self.streams.lock().insert(id, tx);
            Ok((id, rx))
        }

        async fn send(&self, t: u8, payload: Vec<u8>) -> crate::Result<()> {
            self.out
                .send((t, payload))
                .await
                .map_err(|_| Error::Transport(format!("connection to {} lost", self.addr)))
        }

        async fn open(&self, t: u8, path: &str) -> crate::Result<(u32, mpsc::Receiver<Inbound>)> {
            let (id, mut inbox) = self.register()?;
            let payload = encode_open(id, path).map_err(|e| Error::remote(path, e))?;
            if let Err(e) = self.send(t, payload).await {
                self.streams.lock().remove(&id);
                return Err(e);
            }
            match inbox.recv().await {
                Some(Inbound::Ack) => Ok((id, inbox)),
                Some(Inbound::Fail(msg)) => Err(Error::remote(path, msg)),
                Some(_) => Err(Error::Transport(format!(
                    "server sent data for {} before acknowledging it",
                    path
                ))),
                None => Err(Error::Transport(format!("connection to {} lost", self.addr))),
            }
        }
    }

    async fn dispatch(streams: &Streams, t: u8, payload: &[u8]) -> Result<()> {
        let (id, rest) = split_stream(payload)?;
        let msg = match t {
            frame::ACK => Inbound::Ack,
            frame::DATA => Inbound::Data(rest.to_vec()),
            frame::END => Inbound::End,
            frame::FAIL => Inbound::Fail(String::from_utf8_lossy(rest).into_owned()),
            other => bail!("unexpected frame: {}", other),
        };
        let terminal = matches!(msg, Inbound::End | Inbound::Fail(_));
        let tx = streams.lock().get(&id).cloned();
        if let Some(tx) = tx {
            if tx.send(msg).await.is_err() || terminal {
                streams.lock().remove(&id);
            }
        }
        Ok(())
    }

    async fn pump_upload(
        id: u32,
        chunks: &mut mpsc::Receiver<WriteOp>,
        inbox: &mut mpsc::Receiver<Inbound>,
        out: &mpsc::Sender<Frame>,
    ) -> std::result::Result<(), String> {
        let lost = |_: mpsc::error::SendError<Frame>| "connection lost".to_string();
        loop {
            tokio::select! {
                op = chunks.recv() => match op {
                    Some(WriteOp::Data(data)) => {
                        for part in data.chunks(CHUNK_SIZE) {
                            out.send((frame::DATA, encode_stream(id, part))).await.map_err(lost)?;
                        }
                    }
                    Some(WriteOp::Finish) => break,
                    None => {
                        let _ = out.send((frame::FAIL, encode_stream(id, b"abandoned"))).await;
                        return Err("write abandoned".into());
                    }
                },
                msg = inbox.recv() => match msg {
                    Some(Inbound::Fail(m)) => return Err(m),
                    Some(_) => return Err("unexpected reply during upload".into()),
                    None => return Err("connection lost".into()),
                },
            }
        }
        out.send((frame::END, encode_stream(id, &[]))).await.map_err(lost)?;
        match inbox.recv().await {
            Some(Inbound::Ack) => Ok(()),
            Some(Inbound::Fail(m)) => Err(m),
            Some(_) => Err("unexpected reply to END".into()),
            None => Err("connection lost before commit".into()),
        }
    }

    #[async_trait]
    impl Transport for RemoteTransport {
        async fn open_read(&self, path: &str) -> crate::Result<ReadStream> {
            let (_, inbox) = self.open(frame::OPEN_READ, path).await?;
            Ok(ReadStream::new(path, inbox))
        }

        async fn open_write(&self, path: &str) -> crate::Result<WriteStream> {
            let (id, mut inbox) = self.open(frame::OPEN_WRITE, path).await?;
            let (tx, mut chunks) = mpsc::channel(STREAM_BUFFER);
            let (otx, orx) = oneshot::channel();
            let out = self.out.clone();
            let streams = self.streams.clone();
            tokio::spawn(async move {
                let res = pump_upload(id, &mut chunks, &mut inbox, &out).await;
                streams.lock().remove(&id);
                let _ = otx.send(res);
            });
            Ok(WriteStream::new(path, tx, orx))
        }

        async fn close(&self) -> crate::Result<()> {
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            // The writer may already be gone with the connection
            let _ = self.out.send((frame::BYE, Vec::new())).await;
            let writer = self.writer.lock().take();
            let res = match writer {
                Some(handle) => match handle.await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(Error::Transport(format!("close {}: {:#}", self.addr, e))),
                    Err(e) => Err(Error::Transport(format!("close {}: {}", self.addr, e))),
                },
                None => Ok(()),
            };
            if let Some(reader) = self.reader.lock().take() {
                reader.abort();
            }
            res
        }
    }

    impl Drop for RemoteTransport {
        fn drop(&mut self) {
            if let Some(h) = self.reader.get_mut().take() {
                h.abort();
            }
            if let Some(h) = self.writer.get_mut().take() {
                h.abort();
            }
        }
    }
}
