//! The out-of-band control channel.
//!
//! A dedicated, never-paused listener accepts short-lived control
//! connections: one command line in, one status line out, close. `PAUSE`
//! and `RESUME` toggle the gate; the acknowledgement is written only after
//! every controlled listener has applied the transition, so a client that
//! has read the reply can rely on the new admission behavior. The protocol
//! carries no authentication by design — bind the control address to
//! localhost or a trusted network, or require client certificates through
//! a security context.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::protocol::{ControlCommand, ControlReply};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::connection::BoxedIo;
use crate::gate::Gate;
use crate::stats::ValveStats;

/// Bound on reading the command line of one control connection.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// The control listener and the state its commands act on.
pub(crate) struct Controller {
    pub(crate) listener: TcpListener,
    pub(crate) gate: Arc<Gate>,
    pub(crate) admissions: Vec<watch::Receiver<bool>>,
    pub(crate) acceptor: Option<TlsAcceptor>,
    pub(crate) ack_timeout: Duration,
    pub(crate) stats: Arc<ValveStats>,
}

struct ControlShared {
    gate: Arc<Gate>,
    admissions: Vec<watch::Receiver<bool>>,
    acceptor: Option<TlsAcceptor>,
    ack_timeout: Duration,
    stats: Arc<ValveStats>,
}

impl Controller {
    /// Accepts control connections until cancelled. Individual connection
    /// failures never stop the listener.
    pub(crate) async fn run(self, cancel: CancellationToken, tracker: TaskTracker) {
        let addr = self.listener.local_addr().ok();
        info!(addr = ?addr, "control channel listening");

        let shared = Arc::new(ControlShared {
            gate: self.gate,
            admissions: self.admissions,
            acceptor: self.acceptor,
            ack_timeout: self.ack_timeout,
            stats: self.stats,
        });

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let shared = Arc::clone(&shared);
                        tracker.spawn(async move {
                            if let Err(e) = serve(shared, stream, peer).await {
                                debug!(%peer, error = %e, "control connection error");
                            }
                        });
                    }
                    Err(e) => warn!(addr = ?addr, error = %e, "control accept error"),
                }
            }
        }

        info!(addr = ?addr, "control channel stopped");
    }
}

/// Handles one control connection: read a line, apply it, reply, close.
async fn serve(shared: Arc<ControlShared>, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
    stream.set_nodelay(true)?;

    let stream: BoxedIo = match &shared.acceptor {
        Some(acceptor) => {
            let handshake = timeout(COMMAND_TIMEOUT, acceptor.accept(stream))
                .await
                .map_err(|_| {
                    io::Error::new(io::ErrorKind::TimedOut, "control TLS handshake timed out")
                })??;
            Box::new(handshake)
        }
        None => Box::new(stream),
    };

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    timeout(COMMAND_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "control command timed out"))??;

    let command = match line.parse::<ControlCommand>() {
        Ok(command) => command,
        Err(e) => {
            // Malformed input: close without touching the gate.
            warn!(%peer, error = %e, "control command rejected");
            return Ok(());
        }
    };

    debug!(%peer, %command, "control command received");
    let reply = apply(&shared, command).await;

    let stream = reader.get_mut();
    stream.write_all(reply.as_str().as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.shutdown().await?;
    Ok(())
}

/// Applies a command to the gate, waiting for controlled listeners to
/// acknowledge a transition before replying.
async fn apply(shared: &ControlShared, command: ControlCommand) -> ControlReply {
    match command {
        ControlCommand::Pause => {
            if shared.gate.pause() {
                shared.stats.paused();
                info!("pausing controlled ports");
            }
            wait_admissions(shared, false).await;
            ControlReply::Ok
        }
        ControlCommand::Resume => {
            if shared.gate.resume() {
                shared.stats.resumed();
                info!("resuming controlled ports");
            }
            wait_admissions(shared, true).await;
            ControlReply::Ok
        }
        ControlCommand::Status => {
            if shared.gate.is_paused() {
                ControlReply::Paused
            } else {
                ControlReply::Resumed
            }
        }
    }
}

async fn wait_admissions(shared: &ControlShared, admitting: bool) {
    for rx in &shared.admissions {
        let mut rx = rx.clone();
        match timeout(shared.ack_timeout, rx.wait_for(|v| *v == admitting)).await {
            Ok(Ok(_)) => {}
            // Listener gone: the service is stopping.
            Ok(Err(_)) => {}
            Err(_) => warn!(admitting, "controlled listener did not apply the transition in time"),
        };
    }
}
