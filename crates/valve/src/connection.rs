//! The relay core: one [`Connection`], two [`Direction`] pumps.
//!
//! A connection owns an accepted client stream and the freshly-connected
//! server stream. Each direction runs on its own task: read a chunk, run it
//! through the filter chain, write the chain's output. When either
//! direction terminates — EOF, I/O error, filter error, or a stop request —
//! the shared token stops the other, both pumps are awaited, and both
//! streams close together. A socket is never left half-open.

use std::io;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn, Instrument};
use uuid::Uuid;

use crate::filter::{FilterChain, Filtered};
use crate::stats::ValveStats;

/// Byte stream the relay can pump — plain TCP or a TLS wrapper.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// A relayed stream with its transport erased.
pub type BoxedIo = Box<dyn Io>;

/// One relayed client/server socket pair.
pub struct Connection {
    id: Uuid,
    controlled: bool,
}

impl Connection {
    pub fn new(controlled: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            controlled,
        }
    }

    /// The correlation id carried in this connection's log span.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Relays until either side closes, a pump fails, or `cancel` fires.
    ///
    /// Runs both directions to completion before returning, so both
    /// underlying streams are closed by the time this resolves.
    pub async fn run(
        self,
        client: BoxedIo,
        server: BoxedIo,
        chain: FilterChain,
        buffer_size: usize,
        cancel: CancellationToken,
        stats: Arc<ValveStats>,
    ) {
        let span = tracing::debug_span!("connection", id = %self.id, controlled = self.controlled);

        async move {
            let chain = if chain.is_empty() {
                None
            } else {
                Some(Arc::new(Mutex::new(chain)))
            };

            let (client_read, client_write) = tokio::io::split(client);
            let (server_read, server_write) = tokio::io::split(server);
            let token = cancel.child_token();

            let client_server = Direction {
                reader: client_read,
                writer: server_write,
                from_client: true,
                label: "client→server",
                chain: chain.clone(),
                buffer_size,
            };
            let server_client = Direction {
                reader: server_read,
                writer: client_write,
                from_client: false,
                label: "server→client",
                chain,
                buffer_size,
            };

            let up = tokio::spawn(
                client_server
                    .pump(token.clone(), Arc::clone(&stats))
                    .in_current_span(),
            );
            let down = tokio::spawn(server_client.pump(token, stats).in_current_span());

            for (label, joined) in [("client→server", up.await), ("server→client", down.await)] {
                match joined {
                    Ok(Ok(bytes)) => trace!(label, bytes, "direction finished"),
                    Ok(Err(e)) => debug!(label, error = %e, "direction failed"),
                    Err(e) => warn!(label, error = %e, "direction task failed"),
                }
            }

            // Dropping the four halves above closed both streams together.
            debug!("connection closed");
        }
        .instrument(span)
        .await
    }
}

/// One half-duplex byte pump within a connection.
struct Direction {
    reader: ReadHalf<BoxedIo>,
    writer: WriteHalf<BoxedIo>,
    from_client: bool,
    label: &'static str,
    chain: Option<Arc<Mutex<FilterChain>>>,
    buffer_size: usize,
}

impl Direction {
    /// Pumps until EOF, error, or cancellation, then stops the opposite
    /// direction through the shared token. Returns the bytes written.
    async fn pump(mut self, token: CancellationToken, stats: Arc<ValveStats>) -> io::Result<u64> {
        let result = self.relay(&token, &stats).await;
        token.cancel();
        result
    }

    async fn relay(&mut self, token: &CancellationToken, stats: &ValveStats) -> io::Result<u64> {
        let mut buf = BytesMut::with_capacity(self.buffer_size);
        let mut total = 0u64;

        loop {
            buf.clear();
            let read = tokio::select! {
                _ = token.cancelled() => return Ok(total),
                read = self.reader.read_buf(&mut buf) => read?,
            };

            if read == 0 {
                // Orderly EOF: flush a FIN to the peer before stopping.
                let _ = self.writer.shutdown().await;
                trace!(label = self.label, "input closed");
                return Ok(total);
            }

            let output = match &self.chain {
                Some(chain) => {
                    let mut chain = chain
                        .lock()
                        .map_err(|_| io::Error::other("filter chain poisoned"))?;
                    chain.apply(self.from_client, &buf)?
                }
                None => Filtered::Unchanged,
            };

            let bytes: &[u8] = match &output {
                Filtered::Unchanged => &buf,
                Filtered::Replaced(replaced) => replaced,
                Filtered::Dropped => {
                    trace!(label = self.label, dropped = read, "chunk dropped by filter");
                    continue;
                }
            };

            tokio::select! {
                _ = token.cancelled() => return Ok(total),
                written = self.writer.write_all(bytes) => written?,
            }

            total += bytes.len() as u64;
            stats.bytes_relayed(bytes.len() as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterFactory, SubstitutionFilter};
    use std::time::Duration;
    use tokio::time::timeout;

    fn empty_chain() -> FilterChain {
        FilterChain::build(&[], false)
    }

    fn substitution_chain() -> FilterChain {
        let factory: FilterFactory =
            Arc::new(|| Box::new(SubstitutionFilter::new(b"LIST".as_slice(), b"LSUB".as_slice())));
        FilterChain::build(&[factory], true)
    }

    #[tokio::test]
    async fn relays_bytes_in_both_directions() {
        let (client, mut client_peer) = tokio::io::duplex(256);
        let (server, mut server_peer) = tokio::io::duplex(256);
        let cancel = CancellationToken::new();

        let conn = tokio::spawn(Connection::new(false).run(
            Box::new(client),
            Box::new(server),
            empty_chain(),
            2048,
            cancel,
            Arc::new(ValveStats::new()),
        ));

        client_peer.write_all(b"REQUEST\r\n").await.unwrap();
        let mut seen = [0u8; 9];
        server_peer.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen, b"REQUEST\r\n");

        server_peer.write_all(b"RESPONSE\r\n").await.unwrap();
        let mut seen = [0u8; 10];
        client_peer.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen, b"RESPONSE\r\n");

        drop(client_peer);
        timeout(Duration::from_secs(5), conn).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn filters_rewrite_relayed_chunks() {
        let (client, mut client_peer) = tokio::io::duplex(256);
        let (server, mut server_peer) = tokio::io::duplex(256);
        let cancel = CancellationToken::new();

        let conn = tokio::spawn(Connection::new(true).run(
            Box::new(client),
            Box::new(server),
            substitution_chain(),
            2048,
            cancel,
            Arc::new(ValveStats::new()),
        ));

        client_peer.write_all(b"LIST\r\n").await.unwrap();
        let mut seen = [0u8; 6];
        server_peer.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen, b"LSUB\r\n");

        server_peer.write_all(b"LSUB\r\n").await.unwrap();
        let mut seen = [0u8; 6];
        client_peer.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen, b"LIST\r\n");

        drop(client_peer);
        timeout(Duration::from_secs(5), conn).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn peer_close_stops_both_directions() {
        let (client, client_peer) = tokio::io::duplex(256);
        let (server, mut server_peer) = tokio::io::duplex(256);
        let cancel = CancellationToken::new();

        let conn = tokio::spawn(Connection::new(false).run(
            Box::new(client),
            Box::new(server),
            empty_chain(),
            2048,
            cancel,
            Arc::new(ValveStats::new()),
        ));

        drop(client_peer);
        timeout(Duration::from_secs(5), conn).await.unwrap().unwrap();

        // The server side saw EOF because the connection closed both streams.
        let mut rest = Vec::new();
        server_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn cancellation_stops_the_relay() {
        let (client, mut client_peer) = tokio::io::duplex(256);
        let (server, _server_peer) = tokio::io::duplex(256);
        let cancel = CancellationToken::new();

        let conn = tokio::spawn(Connection::new(false).run(
            Box::new(client),
            Box::new(server),
            empty_chain(),
            2048,
            cancel.clone(),
            Arc::new(ValveStats::new()),
        ));

        cancel.cancel();
        timeout(Duration::from_secs(5), conn).await.unwrap().unwrap();

        // Relay is gone: the client eventually reads EOF.
        let mut rest = Vec::new();
        client_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn stats_count_relayed_bytes() {
        let (client, mut client_peer) = tokio::io::duplex(256);
        let (server, mut server_peer) = tokio::io::duplex(256);
        let cancel = CancellationToken::new();
        let stats = Arc::new(ValveStats::new());

        let conn = tokio::spawn(Connection::new(false).run(
            Box::new(client),
            Box::new(server),
            empty_chain(),
            2048,
            cancel,
            Arc::clone(&stats),
        ));

        client_peer.write_all(b"12345").await.unwrap();
        let mut seen = [0u8; 5];
        server_peer.read_exact(&mut seen).await.unwrap();

        drop(client_peer);
        timeout(Duration::from_secs(5), conn).await.unwrap().unwrap();
        assert_eq!(stats.snapshot().bytes_relayed, 5);
    }
}
