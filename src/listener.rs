//! ClientHello capture in front of the TLS acceptor
//!
//! For every accepted TCP connection the first TLS record is read off the
//! socket, the JA3 fingerprint is computed, and the bytes are replayed to the
//! TLS layer through [`PeekedStream`] so the handshake sees exactly what the
//! client sent. The digest is published into a shared side-table keyed by
//! remote endpoint; once the handshake completes the accept loop moves it
//! into the per-connection [`GuardConnection`], removing the entry so the
//! table stays bounded. A sweeper drops entries left behind by abandoned
//! connections.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::extract::connect_info::Connected;
use bytes::Bytes;
use dashmap::DashMap;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::ja3::{compute_ja3, MAX_RECORD_LEN};

/// How long an unclaimed side-table entry may live before the sweeper drops
/// it (the TLS handshake of a live connection completes far faster).
const PENDING_MAX_AGE: Duration = Duration::from_secs(30);

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// TLS record header length.
const RECORD_HEADER_LEN: usize = 5;

pin_project! {
    /// Byte stream that first replays a captured prefix, then delegates to
    /// the live socket. Writes always go straight through.
    pub struct PeekedStream<S> {
        prefix: Bytes,
        offset: usize,
        #[pin]
        inner: S,
    }
}

impl<S> PeekedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncRead> AsyncRead for PeekedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if *this.offset < this.prefix.len() {
            let remaining = &this.prefix[*this.offset..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            *this.offset += n;
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for PeekedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

struct PendingDigest {
    digest: String,
    seen: Instant,
}

/// Side-table of fingerprints for connections whose handshake has not yet
/// produced a request context. Written by the accept path, drained by the
/// connection bridge.
#[derive(Default)]
pub struct Ja3Table {
    pending: DashMap<SocketAddr, PendingDigest>,
}

impl Ja3Table {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a digest for a connection. Must happen before the replayable
    /// stream is handed to the TLS layer.
    pub fn insert(&self, addr: SocketAddr, digest: String) {
        self.pending.insert(
            addr,
            PendingDigest {
                digest,
                seen: Instant::now(),
            },
        );
    }

    /// Claim and remove the digest for a connection.
    pub fn take(&self, addr: &SocketAddr) -> Option<String> {
        self.pending.remove(addr).map(|(_, p)| p.digest)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop entries older than `max_age`.
    pub fn sweep(&self, max_age: Duration) {
        self.pending.retain(|_, p| p.seen.elapsed() < max_age);
    }

    /// Periodic sweep guarding against abandoned connections. Runs until the
    /// shutdown token fires.
    pub async fn run_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let before = self.len();
                    self.sweep(PENDING_MAX_AGE);
                    let dropped = before.saturating_sub(self.len());
                    if dropped > 0 {
                        debug!("side-table sweep dropped {} stale entries", dropped);
                    }
                }
            }
        }
    }
}

/// Read the first TLS record from a fresh connection, compute its JA3
/// fingerprint, and return a stream that replays the consumed bytes.
///
/// Returns `None` for the digest when the first byte is not a TLS handshake
/// (no fingerprint is recorded for such connections). A ClientHello that
/// fails to parse yields `Some("")`: the handshake proceeds and the request
/// is logged as untrusted. I/O errors before the record is complete abort
/// the connection.
pub async fn peek_client_hello<S>(mut stream: S) -> io::Result<(PeekedStream<S>, Option<String>)>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; RECORD_HEADER_LEN];
    stream.read_exact(&mut header).await?;

    if header[0] != 0x16 {
        // Not a TLS handshake; replay the consumed bytes and stay silent
        return Ok((
            PeekedStream::new(Bytes::copy_from_slice(&header), stream),
            None,
        ));
    }

    // Oversized record claims are capped; the fingerprint covers the
    // truncated view
    let declared = u16::from_be_bytes([header[3], header[4]]) as usize;
    let record_len = declared.min(MAX_RECORD_LEN);

    let mut raw = Vec::with_capacity(RECORD_HEADER_LEN + record_len);
    raw.extend_from_slice(&header);
    raw.resize(RECORD_HEADER_LEN + record_len, 0);
    stream.read_exact(&mut raw[RECORD_HEADER_LEN..]).await?;

    let digest = match compute_ja3(&raw) {
        Ok(fp) => {
            trace!("ja3 {} ({})", fp.hash, fp.canonical);
            fp.hash
        }
        Err(e) => {
            debug!("ClientHello parse failed: {}", e);
            String::new()
        }
    };

    Ok((PeekedStream::new(Bytes::from(raw), stream), Some(digest)))
}

/// Per-connection context attached once the TLS handshake completes. Every
/// request multiplexed over the connection sees the same digest.
#[derive(Clone, Debug)]
pub struct GuardConnection {
    pub remote_addr: SocketAddr,
    /// JA3 digest, empty for non-TLS connections and parse failures
    pub ja3_hash: String,
}

pin_project! {
    /// TLS stream tagged with its connection context, so axum's
    /// connect-info extraction can reach the fingerprint.
    pub struct GuardedStream<S> {
        #[pin]
        inner: S,
        conn_info: GuardConnection,
    }
}

impl<S> GuardedStream<S> {
    pub fn new(inner: S, conn_info: GuardConnection) -> Self {
        Self { inner, conn_info }
    }
}

impl<S> Connected<&GuardedStream<S>> for GuardConnection {
    fn connect_info(target: &GuardedStream<S>) -> Self {
        target.conn_info.clone()
    }
}

impl<S: AsyncRead> AsyncRead for GuardedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl<S: AsyncWrite> AsyncWrite for GuardedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn tiny_client_hello() -> Vec<u8> {
        // TLS 1.0 record, one cipher (0x002f), no extensions
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x01]);
        body.extend_from_slice(&[0u8; 32]);
        body.push(0x00);
        body.extend_from_slice(&[0x00, 0x02, 0x00, 0x2f]);
        body.extend_from_slice(&[0x01, 0x00]);
        body.extend_from_slice(&[0x00, 0x00]);

        let mut raw = vec![0x16, 0x03, 0x01];
        raw.extend_from_slice(&((body.len() + 4) as u16).to_be_bytes());
        raw.push(0x01);
        raw.push(0x00);
        raw.extend_from_slice(&(body.len() as u16).to_be_bytes());
        raw.extend_from_slice(&body);
        raw
    }

    #[tokio::test]
    async fn replays_tls_record_bytes() {
        let hello = tiny_client_hello();
        let (mut client, server) = tokio::io::duplex(4096);
        client.write_all(&hello).await.unwrap();
        client.write_all(b"post-handshake").await.unwrap();
        drop(client);

        let (mut stream, digest) = peek_client_hello(server).await.unwrap();
        let digest = digest.expect("TLS record should be fingerprinted");
        assert_eq!(digest.len(), 32);

        // The TLS layer must see the original bytes, prefix first
        let mut replayed = Vec::new();
        stream.read_to_end(&mut replayed).await.unwrap();
        let mut expected = hello;
        expected.extend_from_slice(b"post-handshake");
        assert_eq!(replayed, expected);
    }

    #[tokio::test]
    async fn non_tls_bytes_are_replayed_without_fingerprint() {
        let (mut client, server) = tokio::io::duplex(4096);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        drop(client);

        let (mut stream, digest) = peek_client_hello(server).await.unwrap();
        assert!(digest.is_none());

        let mut replayed = Vec::new();
        stream.read_to_end(&mut replayed).await.unwrap();
        assert_eq!(replayed, b"GET / HTTP/1.1\r\n\r\n");
    }

    #[tokio::test]
    async fn malformed_hello_yields_empty_digest() {
        // Handshake record that is not a ClientHello
        let mut raw = vec![0x16, 0x03, 0x03, 0x00, 0x30];
        raw.push(0x02);
        raw.extend_from_slice(&[0u8; 47]);

        let (mut client, server) = tokio::io::duplex(4096);
        client.write_all(&raw).await.unwrap();
        drop(client);

        let (mut stream, digest) = peek_client_hello(server).await.unwrap();
        assert_eq!(digest, Some(String::new()));

        let mut replayed = Vec::new();
        stream.read_to_end(&mut replayed).await.unwrap();
        assert_eq!(replayed, raw);
    }

    #[tokio::test]
    async fn truncated_record_is_io_error() {
        let (mut client, server) = tokio::io::duplex(4096);
        client.write_all(&[0x16, 0x03, 0x01, 0x01, 0x00]).await.unwrap();
        client.write_all(&[0u8; 16]).await.unwrap(); // record claims 256 bytes
        drop(client);

        assert!(peek_client_hello(server).await.is_err());
    }

    #[tokio::test]
    async fn small_reads_drain_prefix_then_inner() {
        let (mut client, server) = tokio::io::duplex(64);
        client.write_all(b"xyz").await.unwrap();
        drop(client);

        let mut stream = PeekedStream::new(Bytes::from_static(b"abc"), server);
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ab");
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"cx");
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"yz");
    }

    #[test]
    fn side_table_entries_removed_on_first_lookup() {
        let table = Ja3Table::new();
        let addr: SocketAddr = "10.0.0.1:55555".parse().unwrap();

        table.insert(addr, "abc".to_string());
        assert_eq!(table.take(&addr), Some("abc".to_string()));
        assert_eq!(table.take(&addr), None);
        assert!(table.is_empty());
    }

    #[test]
    fn side_table_sweep_drops_stale_entries() {
        let table = Ja3Table::new();
        let addr: SocketAddr = "10.0.0.1:55555".parse().unwrap();
        table.insert(addr, "abc".to_string());

        table.sweep(Duration::from_secs(30));
        assert_eq!(table.len(), 1);

        table.sweep(Duration::ZERO);
        assert!(table.is_empty());
    }
}
