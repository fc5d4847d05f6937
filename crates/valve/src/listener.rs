//! Accept loops for direct and controlled relay entry points.
//!
//! Each bound address runs its own accept loop task. Direct listeners admit
//! unconditionally. Controlled listeners keep their socket closed while the
//! gate is paused, so connection attempts are refused at the TCP level, and
//! rebind the concrete address resolved at startup when the gate resumes;
//! the `admitting` watch publishes when the transition has actually taken
//! effect.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::connection::{BoxedIo, Connection};
use crate::filter::{FilterChain, FilterFactory};
use crate::stats::ValveStats;

const BACKLOG: u32 = 1024;
const REBIND_RETRY: Duration = Duration::from_millis(500);

/// Binds a listening socket with `SO_REUSEADDR`, so a controlled address
/// can be rebound immediately after a pause/resume cycle.
pub(crate) fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(BACKLOG)
}

/// Everything an accept loop needs to turn an accepted socket into a
/// running [`Connection`]. Shared by all addresses of one listener entry.
pub(crate) struct Relay {
    pub(crate) controlled: bool,
    pub(crate) server_addr: SocketAddr,
    pub(crate) acceptor: Option<TlsAcceptor>,
    pub(crate) connector: Option<(TlsConnector, ServerName<'static>)>,
    pub(crate) filters: Vec<FilterFactory>,
    pub(crate) buffer_size: usize,
    pub(crate) connect_timeout: Duration,
    pub(crate) handshake_timeout: Duration,
    pub(crate) connections_limit: usize,
    pub(crate) stats: Arc<ValveStats>,
    pub(crate) active: AtomicUsize,
}

impl Relay {
    /// Reserves an admission slot, or refuses when the limit is reached.
    fn try_admit(self: &Arc<Self>) -> Option<ActiveGuard> {
        let mut current = self.active.load(Ordering::Relaxed);
        loop {
            if current >= self.connections_limit {
                return None;
            }
            match self.active.compare_exchange(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(ActiveGuard {
                        relay: Arc::clone(self),
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Connections currently being relayed through this entry.
    pub(crate) fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

/// Releases the admission slot when the connection ends.
struct ActiveGuard {
    relay: Arc<Relay>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.relay.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Accept loop for a direct entry point. Ignores the gate entirely.
pub(crate) async fn run_direct(
    listener: TcpListener,
    relay: Arc<Relay>,
    accept_cancel: CancellationToken,
    conn_cancel: CancellationToken,
    tracker: TaskTracker,
) {
    let addr = listener.local_addr().ok();
    info!(addr = ?addr, "direct listener accepting");

    loop {
        tokio::select! {
            _ = accept_cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((client, peer)) => admit(&relay, client, peer, &conn_cancel, &tracker),
                Err(e) => warn!(addr = ?addr, error = %e, "accept error"),
            }
        }
    }

    info!(addr = ?addr, "direct listener stopped");
}

/// Accept loop for a controlled entry point.
///
/// `initial` carries the socket bound during service start when the gate
/// began resumed; while paused the socket stays closed. `addr` is the
/// concrete address (ephemeral port already assigned) reused on rebind.
pub(crate) async fn run_controlled(
    addr: SocketAddr,
    initial: Option<TcpListener>,
    relay: Arc<Relay>,
    mut gate_rx: watch::Receiver<bool>,
    admitting: watch::Sender<bool>,
    accept_cancel: CancellationToken,
    conn_cancel: CancellationToken,
    tracker: TaskTracker,
) {
    let mut listener = initial;
    info!(%addr, "controlled listener ready");

    loop {
        // Gate value: true = paused.
        if *gate_rx.borrow_and_update() {
            if listener.take().is_some() {
                debug!(%addr, "controlled listener paused");
            }
            publish(&admitting, false);
            tokio::select! {
                _ = accept_cancel.cancelled() => break,
                changed = gate_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
        }

        if listener.is_none() {
            match bind(addr) {
                Ok(bound) => {
                    debug!(%addr, "controlled listener admitting");
                    listener = Some(bound);
                }
                Err(e) => {
                    warn!(%addr, error = %e, "rebind failed, retrying");
                    tokio::select! {
                        _ = accept_cancel.cancelled() => break,
                        _ = tokio::time::sleep(REBIND_RETRY) => {}
                        changed = gate_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    continue;
                }
            }
        }
        publish(&admitting, true);

        let Some(bound) = listener.as_ref() else {
            continue;
        };
        tokio::select! {
            _ = accept_cancel.cancelled() => break,
            changed = gate_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                // The top of the loop applies the transition.
            }
            accepted = bound.accept() => match accepted {
                Ok((client, peer)) => admit(&relay, client, peer, &conn_cancel, &tracker),
                Err(e) => warn!(%addr, error = %e, "accept error"),
            }
        }
    }

    drop(listener);
    publish(&admitting, false);
    info!(%addr, "controlled listener stopped");
}

fn publish(admitting: &watch::Sender<bool>, value: bool) {
    admitting.send_if_modified(|current| {
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    });
}

/// Starts a connection for an accepted client, or refuses it when the
/// entry's limit is reached. Never blocks the accept loop.
fn admit(
    relay: &Arc<Relay>,
    client: TcpStream,
    peer: SocketAddr,
    conn_cancel: &CancellationToken,
    tracker: &TaskTracker,
) {
    let Some(guard) = relay.try_admit() else {
        // Dropping the socket here closes it: the refusal is immediate.
        relay.stats.connection_refused();
        debug!(%peer, "connection refused, limit reached");
        return;
    };

    relay.stats.connection_accepted();
    debug!(%peer, controlled = relay.controlled, "connection accepted");

    let relay = Arc::clone(relay);
    let cancel = conn_cancel.clone();
    tracker.spawn(async move {
        let _guard = guard;
        if let Err(e) = serve(relay, client, peer, cancel).await {
            warn!(%peer, error = %e, "connection error");
        }
    });
}

/// Pairs the accepted client with a new server connection and relays until
/// either side closes. Errors here terminate this connection only.
async fn serve(
    relay: Arc<Relay>,
    client: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) -> io::Result<()> {
    client.set_nodelay(true)?;

    let server = match timeout(relay.connect_timeout, TcpStream::connect(relay.server_addr)).await {
        Ok(Ok(server)) => server,
        Ok(Err(e)) => {
            relay.stats.connection_failed();
            return Err(e);
        }
        Err(_) => {
            relay.stats.connection_failed();
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {} timed out", relay.server_addr),
            ));
        }
    };
    server.set_nodelay(true)?;

    let client: BoxedIo = match &relay.acceptor {
        Some(acceptor) => {
            let handshake = timeout(relay.handshake_timeout, acceptor.accept(client))
                .await
                .map_err(|_| {
                    io::Error::new(io::ErrorKind::TimedOut, "client TLS handshake timed out")
                })??;
            Box::new(handshake)
        }
        None => Box::new(client),
    };
    let server: BoxedIo = match &relay.connector {
        Some((connector, name)) => {
            let handshake = timeout(
                relay.handshake_timeout,
                connector.connect(name.clone(), server),
            )
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "server TLS handshake timed out"))??;
            Box::new(handshake)
        }
        None => Box::new(server),
    };

    let chain = FilterChain::build(&relay.filters, relay.controlled);
    let connection = Connection::new(relay.controlled);
    debug!(%peer, id = %connection.id(), "relay started");
    connection
        .run(
            client,
            server,
            chain,
            relay.buffer_size,
            cancel,
            Arc::clone(&relay.stats),
        )
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay_with_limit(limit: usize) -> Arc<Relay> {
        Arc::new(Relay {
            controlled: false,
            server_addr: "127.0.0.1:9".parse().unwrap(),
            acceptor: None,
            connector: None,
            filters: Vec::new(),
            buffer_size: 2048,
            connect_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(1),
            connections_limit: limit,
            stats: Arc::new(ValveStats::new()),
            active: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn bind_assigns_ephemeral_port() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn rebinding_a_released_address_succeeds() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let rebound = bind(addr).unwrap();
        assert_eq!(rebound.local_addr().unwrap(), addr);
    }

    #[test]
    fn admission_limit_is_enforced_and_released() {
        let relay = relay_with_limit(1);

        let first = relay.try_admit().expect("first admission fits");
        assert_eq!(relay.active_connections(), 1);
        assert!(relay.try_admit().is_none());

        drop(first);
        assert_eq!(relay.active_connections(), 0);
        assert!(relay.try_admit().is_some());
    }

    #[test]
    fn unlimited_relay_admits_freely() {
        let relay = relay_with_limit(usize::MAX);
        let _guards: Vec<_> = (0..64).map(|_| relay.try_admit().unwrap()).collect();
        assert_eq!(relay.active_connections(), 64);
    }
}
