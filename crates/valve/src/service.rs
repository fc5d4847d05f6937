//! [`ValveService`]: top-level orchestration of listeners and the control
//! channel.
//!
//! Lifecycle: `new` (validate configuration), `set_up` (resolve addresses,
//! build TLS contexts, resolve filter identifiers — every setup error is
//! fatal here), `start` (bind every socket first, then spawn the accept
//! loops and the controller), `stop` (stop accepting, drain live
//! connections up to the shutdown grace period, then force-close). A
//! stopped service is not restartable; create a new one.

use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use common::ValveError;
use rustls::pki_types::ServerName;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::address::{AddressSet, AddressSpec};
use crate::config::{Config, ListenerMode};
use crate::control::Controller;
use crate::filter::{FilterFactory, FilterRegistry};
use crate::gate::Gate;
use crate::listener::{self, Relay};
use crate::stats::{StatsSnapshot, ValveStats};
use crate::tls;

/// One listener entry, resolved and ready to bind.
struct ListenerPlan {
    addresses: Vec<SocketAddr>,
    controlled: bool,
    server_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    connector: Option<(TlsConnector, ServerName<'static>)>,
    filters: Vec<FilterFactory>,
    connections_limit: usize,
}

/// The control channel, resolved and ready to bind.
struct ControlPlan {
    addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    ack_timeout: Duration,
}

/// The valve service.
pub struct ValveService {
    config: Config,
    registry: FilterRegistry,
    gate: Arc<Gate>,
    stats: Arc<ValveStats>,

    plans: Vec<ListenerPlan>,
    control_plan: Option<ControlPlan>,

    direct_addrs: Vec<SocketAddr>,
    controlled_addrs: Vec<SocketAddr>,
    control_addr: Option<SocketAddr>,
    admissions: Vec<watch::Receiver<bool>>,

    tracker: TaskTracker,
    accept_cancel: CancellationToken,
    conn_cancel: CancellationToken,
    started: bool,
}

impl ValveService {
    /// Creates a service from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns the first configuration validation failure.
    pub fn new(config: Config, registry: FilterRegistry) -> Result<Self, ValveError> {
        config.validate()?;
        let gate = Arc::new(Gate::new(config.start_paused));

        Ok(Self {
            config,
            registry,
            gate,
            stats: Arc::new(ValveStats::new()),
            plans: Vec::new(),
            control_plan: None,
            direct_addrs: Vec::new(),
            controlled_addrs: Vec::new(),
            control_addr: None,
            admissions: Vec::new(),
            tracker: TaskTracker::new(),
            accept_cancel: CancellationToken::new(),
            conn_cancel: CancellationToken::new(),
            started: false,
        })
    }

    /// Resolves addresses, builds TLS contexts, and resolves filter
    /// identifiers. Nothing is bound yet.
    ///
    /// # Errors
    ///
    /// Any failure here is a fatal setup error; the service must not be
    /// started afterwards.
    pub async fn set_up(&mut self) -> Result<()> {
        let mut plans = Vec::with_capacity(self.config.listeners.len());

        for (index, entry) in self.config.listeners.iter().enumerate() {
            let addresses = AddressSet::parse_all(&entry.addresses)?
                .resolve()
                .await
                .with_context(|| format!("listener {index}: bind addresses"))?;

            let server_spec = AddressSpec::parse(&entry.server_address)?;
            let server_addr = server_spec
                .resolve()
                .await
                .with_context(|| format!("listener {index}: server address"))?;

            let acceptor = match &entry.security {
                Some(name) => Some(tls::server_context(name, self.security(name)?)?),
                None => None,
            };
            let connector = match &entry.server_security {
                Some(name) => {
                    let connector = tls::client_context(name, self.security(name)?)?;
                    let server_name = tls::server_name(server_spec.host())?;
                    Some((connector, server_name))
                }
                None => None,
            };

            let filters = self.registry.resolve(&entry.filters)?;

            plans.push(ListenerPlan {
                addresses,
                controlled: entry.mode == ListenerMode::Controlled,
                server_addr,
                acceptor,
                connector,
                filters,
                connections_limit: entry.connections_limit.unwrap_or(usize::MAX),
            });
        }

        let control_plan = match &self.config.control {
            Some(control) => {
                let addr = AddressSpec::parse(&control.address)?
                    .resolve()
                    .await
                    .context("control address")?;
                let acceptor = match &control.security {
                    Some(name) => Some(tls::server_context(name, self.security(name)?)?),
                    None => None,
                };
                Some(ControlPlan {
                    addr,
                    acceptor,
                    ack_timeout: control.ack_timeout(),
                })
            }
            None => None,
        };

        self.plans = plans;
        self.control_plan = control_plan;
        Ok(())
    }

    /// Binds every configured socket, then starts the accept loops and the
    /// controller. Controlled listeners honor the gate's initial state.
    ///
    /// # Errors
    ///
    /// A bind failure aborts startup with no loop spawned and every
    /// already-bound socket released.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            bail!("valve service already started");
        }
        if self.plans.is_empty() {
            bail!("valve service not set up");
        }

        let plans = mem::take(&mut self.plans);
        let control_plan = self.control_plan.take();

        // Bind everything before spawning anything: a failure below leaves
        // no accept loop running and drops every bound socket.
        let mut bound = Vec::with_capacity(plans.len());
        for plan in plans {
            let mut sockets = Vec::with_capacity(plan.addresses.len());
            for addr in &plan.addresses {
                let socket =
                    listener::bind(*addr).with_context(|| format!("failed to bind {addr}"))?;
                let concrete = socket
                    .local_addr()
                    .with_context(|| format!("local address of {addr}"))?;
                sockets.push((concrete, socket));
            }
            bound.push((plan, sockets));
        }

        let control_bound = match &control_plan {
            Some(plan) => {
                let socket = listener::bind(plan.addr)
                    .with_context(|| format!("failed to bind control address {}", plan.addr))?;
                let concrete = socket.local_addr().context("control local address")?;
                Some((concrete, socket))
            }
            None => None,
        };

        for (plan, sockets) in bound {
            let relay = Arc::new(Relay {
                controlled: plan.controlled,
                server_addr: plan.server_addr,
                acceptor: plan.acceptor,
                connector: plan.connector,
                filters: plan.filters,
                buffer_size: self.config.buffer_size,
                connect_timeout: self.config.connect_timeout(),
                handshake_timeout: self.config.handshake_timeout(),
                connections_limit: plan.connections_limit,
                stats: Arc::clone(&self.stats),
                active: AtomicUsize::new(0),
            });

            for (concrete, socket) in sockets {
                if plan.controlled {
                    self.spawn_controlled(concrete, socket, Arc::clone(&relay));
                } else {
                    self.direct_addrs.push(concrete);
                    self.tracker.spawn(listener::run_direct(
                        socket,
                        Arc::clone(&relay),
                        self.accept_cancel.clone(),
                        self.conn_cancel.clone(),
                        self.tracker.clone(),
                    ));
                }
            }
        }

        if let (Some(plan), Some((concrete, socket))) = (control_plan, control_bound) {
            let controller = Controller {
                listener: socket,
                gate: Arc::clone(&self.gate),
                admissions: self.admissions.clone(),
                acceptor: plan.acceptor,
                ack_timeout: plan.ack_timeout,
                stats: Arc::clone(&self.stats),
            };
            self.control_addr = Some(concrete);
            self.tracker
                .spawn(controller.run(self.accept_cancel.clone(), self.tracker.clone()));
        }

        self.started = true;
        info!(
            direct = self.direct_addrs.len(),
            controlled = self.controlled_addrs.len(),
            paused = self.gate.is_paused(),
            "valve service started"
        );
        Ok(())
    }

    fn spawn_controlled(&mut self, concrete: SocketAddr, socket: TcpListener, relay: Arc<Relay>) {
        self.controlled_addrs.push(concrete);

        let (admitting_tx, admitting_rx) = watch::channel(false);
        self.admissions.push(admitting_rx);

        // The socket served only to fix the concrete (possibly ephemeral)
        // address when the gate starts paused; the listener task rebinds it
        // on resume.
        let initial = if self.gate.is_paused() {
            drop(socket);
            None
        } else {
            Some(socket)
        };

        self.tracker.spawn(listener::run_controlled(
            concrete,
            initial,
            relay,
            self.gate.subscribe(),
            admitting_tx,
            self.accept_cancel.clone(),
            self.conn_cancel.clone(),
            self.tracker.clone(),
        ));
    }

    /// Stops accepting, drains live connections up to the shutdown grace
    /// period, then force-closes what remains. Idempotent.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }
        info!("stopping valve service");

        self.accept_cancel.cancel();
        self.tracker.close();

        if timeout(self.config.shutdown_grace(), self.tracker.wait())
            .await
            .is_err()
        {
            warn!("grace period elapsed, force-closing remaining connections");
            self.conn_cancel.cancel();
            self.tracker.wait().await;
        }

        self.started = false;
        info!("valve service stopped");
    }

    /// Bound direct listener addresses (concrete ports).
    pub fn direct_addresses(&self) -> &[SocketAddr] {
        &self.direct_addrs
    }

    /// Bound controlled listener addresses (concrete ports).
    pub fn controlled_addresses(&self) -> &[SocketAddr] {
        &self.controlled_addrs
    }

    /// Bound control channel address.
    pub fn control_address(&self) -> Option<SocketAddr> {
        self.control_addr
    }

    /// Current gate state.
    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    /// The shared gate, for embedders driving pause/resume directly.
    pub fn gate(&self) -> Arc<Gate> {
        Arc::clone(&self.gate)
    }

    /// Waits until the gate reaches the given state.
    pub async fn wait_for_paused(&self, paused: bool) {
        self.gate.wait_for(paused).await
    }

    /// Waits until every controlled listener reports the given admission
    /// state. Callers bound the wait with `tokio::time::timeout`.
    pub async fn wait_for_admission(&self, admitting: bool) {
        for rx in &self.admissions {
            let mut rx = rx.clone();
            // A dropped sender means the listener stopped; nothing to wait on.
            let _ = rx.wait_for(|v| *v == admitting).await;
        }
    }

    /// Point-in-time activity counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    fn security(&self, name: &str) -> Result<&crate::config::SecurityConfig, ValveError> {
        self.config
            .security
            .get(name)
            .ok_or_else(|| ValveError::Config(format!("security context {name:?} is not defined")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControlConfig, ListenerConfig};
    use std::collections::HashMap;

    fn config() -> Config {
        Config {
            listeners: vec![ListenerConfig {
                addresses: vec!["127.0.0.1:0".into()],
                server_address: "127.0.0.1:9".into(),
                mode: ListenerMode::Direct,
                security: None,
                server_security: None,
                filters: Vec::new(),
                connections_limit: None,
            }],
            control: Some(ControlConfig {
                address: "127.0.0.1:0".into(),
                security: None,
                ack_timeout_ms: 1_000,
            }),
            security: HashMap::new(),
            buffer_size: 2048,
            connect_timeout_ms: 1_000,
            handshake_timeout_ms: 1_000,
            shutdown_grace_ms: 200,
            start_paused: true,
            log_level: "info".into(),
        }
    }

    #[tokio::test]
    async fn start_requires_set_up() {
        let mut service = ValveService::new(config(), FilterRegistry::new()).unwrap();
        assert!(service.start().await.is_err());
    }

    #[tokio::test]
    async fn set_up_rejects_unknown_filters() {
        let mut cfg = config();
        cfg.listeners[0].filters = vec!["missing".into()];
        let mut service = ValveService::new(cfg, FilterRegistry::new()).unwrap();
        let err = service.set_up().await.unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[tokio::test]
    async fn lifecycle_binds_and_stops() {
        let mut service = ValveService::new(config(), FilterRegistry::new()).unwrap();
        service.set_up().await.unwrap();
        service.start().await.unwrap();

        assert_eq!(service.direct_addresses().len(), 1);
        assert_ne!(service.direct_addresses()[0].port(), 0);
        assert!(service.control_address().is_some());
        assert!(service.is_paused());

        service.stop().await;
        // Idempotent.
        service.stop().await;
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let mut service = ValveService::new(config(), FilterRegistry::new()).unwrap();
        service.set_up().await.unwrap();
        service.start().await.unwrap();
        assert!(service.start().await.is_err());
        service.stop().await;
    }
}
