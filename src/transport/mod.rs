//! Listening sockets and connection tasks.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                  Controller                   │
//! │   runtime · listeners · shutdown (watch)      │
//! └───────┬───────────────────────┬───────────────┘
//!         ▼                       ▼
//!  ┌──────────────┐        ┌──────────────┐
//!  │ accept :6633 │        │ accept :6653 │      TCP_NODELAY, optional TLS
//!  └──────┬───────┘        └──────┬───────┘
//!         ▼                       ▼
//!  ┌──────────────────────────────────────┐
//!  │ connection task (one per device)     │ ──► dispatch lanes ──► consumer ──► registry
//!  │ socket · ChannelHandler · timers     │
//!  └──────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use ofctl::{Config, Controller, DefaultDriverProvider};
//!
//! let mut controller = Controller::new(Config::default());
//! controller.start(vec![], Arc::new(DefaultDriverProvider))?;
//! // ...
//! controller.stop();
//! ```

mod connection;
mod dispatch;
mod tls;

pub use tls::{signature, DeviceCertificates, TlsSettings};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;

use crate::config::{Config, DispatchConfig};
use crate::error::{OfError, Result};
use crate::protocol::ChannelContext;
use crate::registry::{SwitchListener, SwitchRegistry};
use crate::switch::DriverProvider;

/// How long `stop` waits for listeners and connections to wind down.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Back-off after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// What every new connection starts from. Swapped by `set_config`.
#[derive(Debug, Clone)]
struct ConnectionSettings {
    ctx: ChannelContext,
    dispatch: DispatchConfig,
}

struct Running {
    /// Present when the controller built its own runtime.
    runtime: Option<Runtime>,
    shutdown: watch::Sender<bool>,
    /// Closes once every listener and connection task has finished.
    done: mpsc::Receiver<()>,
    local_addrs: Vec<SocketAddr>,
    settings: Arc<RwLock<ConnectionSettings>>,
    tls: TlsSettings,
}

/// OpenFlow controller: owns the listeners and the switch registry.
pub struct Controller {
    config: Config,
    registry: Arc<SwitchRegistry>,
    drivers: Option<Arc<dyn DriverProvider>>,
    running: Option<Running>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("ports", &self.config.openflow.ports)
            .field("running", &self.is_running())
            .field("local_addrs", &self.local_addrs())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Create a stopped controller.
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(SwitchRegistry::new(&config.dispatch));
        Self {
            config,
            registry,
            drivers: None,
            running: None,
        }
    }

    /// Register listeners and open the configured ports.
    ///
    /// Runs on the current tokio runtime when called from inside one;
    /// otherwise builds a multi-threaded runtime with
    /// `openflow.worker_threads` workers (0 lets tokio decide).
    pub fn start(
        &mut self,
        listeners: Vec<Arc<dyn SwitchListener>>,
        drivers: Arc<dyn DriverProvider>,
    ) -> Result<()> {
        if self.running.is_some() {
            return Err(OfError::Config("controller already started".into()));
        }
        for listener in listeners {
            self.registry.add_switch_listener(listener);
        }
        self.drivers = Some(drivers);
        self.launch()
    }

    /// Close listeners and connections.
    ///
    /// With an owned runtime this waits up to a grace period for tasks to
    /// finish, then shuts the runtime down. On an embedding runtime it only
    /// signals.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        tracing::info!("Stopping OpenFlow controller on {:?}", running.local_addrs);
        let _ = running.shutdown.send(true);

        if let Some(runtime) = running.runtime {
            let mut done = running.done;
            runtime.block_on(async {
                if tokio::time::timeout(STOP_GRACE, done.recv()).await.is_err() {
                    tracing::warn!("Connections still open after {:?}", STOP_GRACE);
                }
            });
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
    }

    /// Stop, then start again with the current configuration.
    pub fn restart(&mut self) -> Result<()> {
        if self.drivers.is_none() {
            return Err(OfError::Config("controller was never started".into()));
        }
        self.stop();
        self.launch()
    }

    /// Replace the configuration.
    ///
    /// Listener changes (ports, bind address, threads, TLS) restart the
    /// controller. Anything else applies to connections accepted from now on.
    pub fn set_config(&mut self, config: Config) -> Result<()> {
        let restart = self.is_running() && self.config.requires_restart(&config);
        self.config = config;
        if restart {
            tracing::info!("Listening parameters changed, restarting");
            return self.restart();
        }
        if let Some(running) = &self.running {
            let mut settings = running.settings.write();
            settings.ctx.config = self.config.openflow.clone();
            settings.dispatch = self.config.dispatch.clone();
        }
        Ok(())
    }

    /// Whether listeners are open.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bound addresses, useful when a port was configured as 0.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.running
            .as_ref()
            .map(|r| r.local_addrs.clone())
            .unwrap_or_default()
    }

    /// TLS signature of the running listeners, if TLS is on.
    pub fn tls_signature(&self) -> Option<String> {
        self.running
            .as_ref()
            .and_then(|r| r.tls.signature().map(str::to_owned))
    }

    /// The switch registry.
    pub fn registry(&self) -> Arc<SwitchRegistry> {
        self.registry.clone()
    }

    /// Current configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn launch(&mut self) -> Result<()> {
        let Some(drivers) = self.drivers.clone() else {
            return Err(OfError::Config("no driver provider".into()));
        };
        let openflow = &self.config.openflow;
        let tls = TlsSettings::load(&self.config.tls)?;

        let (runtime, handle) = match Handle::try_current() {
            Ok(handle) => (None, handle),
            Err(_) => {
                let runtime = build_runtime(openflow.worker_threads)?;
                let handle = runtime.handle().clone();
                (Some(runtime), handle)
            }
        };

        let mut sockets = Vec::with_capacity(openflow.ports.len());
        for port in &openflow.ports {
            let socket = std::net::TcpListener::bind((openflow.bind_address.as_str(), *port))
                .map_err(|e| {
                    tracing::error!(
                        "Failed to bind {}:{}: {}",
                        openflow.bind_address,
                        port,
                        e
                    );
                    OfError::Io(e)
                })?;
            socket.set_nonblocking(true)?;
            sockets.push(socket);
        }

        let settings = Arc::new(RwLock::new(ConnectionSettings {
            ctx: ChannelContext::new(self.registry.clone())
                .with_drivers(drivers)
                .with_certificates(tls.certificates())
                .with_config(openflow.clone()),
            dispatch: self.config.dispatch.clone(),
        }));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = mpsc::channel::<()>(1);
        let mut local_addrs = Vec::with_capacity(sockets.len());
        {
            let _enter = handle.enter();
            for socket in sockets {
                let listener = TcpListener::from_std(socket)?;
                let addr = listener.local_addr()?;
                local_addrs.push(addr);
                handle.spawn(accept_loop(
                    listener,
                    settings.clone(),
                    tls.acceptor().cloned(),
                    shutdown_rx.clone(),
                    done_tx.clone(),
                ));
            }
        }

        tracing::info!(
            "OpenFlow controller listening on {:?} (TLS {:?})",
            local_addrs,
            tls.mode()
        );
        self.running = Some(Running {
            runtime,
            shutdown: shutdown_tx,
            done: done_rx,
            local_addrs,
            settings,
            tls,
        });
        Ok(())
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(true);
            if let Some(runtime) = running.runtime {
                runtime.shutdown_background();
            }
        }
    }
}

fn build_runtime(worker_threads: usize) -> Result<Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all().thread_name("ofctl-io");
    if worker_threads > 0 {
        builder.worker_threads(worker_threads);
    }
    Ok(builder.build()?)
}

async fn accept_loop(
    listener: TcpListener,
    settings: Arc<RwLock<ConnectionSettings>>,
    acceptor: Option<TlsAcceptor>,
    mut shutdown: watch::Receiver<bool>,
    done: mpsc::Sender<()>,
) {
    let local = listener
        .local_addr()
        .map_or_else(|_| "?".to_string(), |a| a.to_string());

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let ConnectionSettings { ctx, dispatch } = settings.read().clone();
                    tokio::spawn(accept_connection(
                        stream,
                        remote,
                        acceptor.clone(),
                        ctx,
                        dispatch,
                        shutdown.clone(),
                        done.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!("Failed to accept on {}: {}", local, e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
    tracing::info!("Listener on {} closed", local);
}

async fn accept_connection(
    stream: TcpStream,
    remote: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    ctx: ChannelContext,
    dispatch: DispatchConfig,
    shutdown: watch::Receiver<bool>,
    _done: mpsc::Sender<()>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!("Failed to set TCP_NODELAY for {}: {}", remote, e);
    }

    let Some(acceptor) = acceptor else {
        connection::serve_connection(stream, remote.to_string(), None, ctx, dispatch, shutdown)
            .await;
        return;
    };

    match acceptor.accept(stream).await {
        Ok(tls) => {
            let peer = tls
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|chain| chain.first())
                .map(|cert| cert.as_ref().to_vec());
            connection::serve_connection(tls, remote.to_string(), peer, ctx, dispatch, shutdown)
                .await;
        }
        Err(e) => tracing::warn!("TLS handshake with {} failed: {}", remote, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{OfCodec, OfMessage, OfVersion};
    use crate::switch::DefaultDriverProvider;
    use bytes::BytesMut;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn ephemeral() -> Config {
        let mut config = Config::default().with_ports(vec![0]);
        config.openflow.bind_address = "127.0.0.1".into();
        config
    }

    #[test]
    fn test_start_stop_owned_runtime() {
        let mut controller = Controller::new(ephemeral().with_worker_threads(1));
        controller
            .start(vec![], Arc::new(DefaultDriverProvider))
            .unwrap();
        assert!(controller.is_running());
        let addr = controller.local_addrs()[0];
        assert_ne!(addr.port(), 0);

        assert!(matches!(
            controller.start(vec![], Arc::new(DefaultDriverProvider)),
            Err(OfError::Config(_))
        ));

        controller.stop();
        assert!(!controller.is_running());
        assert!(std::net::TcpStream::connect(addr).is_err());
    }

    #[test]
    fn test_restart_requires_start() {
        let mut controller = Controller::new(ephemeral());
        assert!(controller.restart().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_embedded_accepts_hello() {
        let mut controller = Controller::new(ephemeral());
        controller
            .start(vec![], Arc::new(DefaultDriverProvider))
            .unwrap();
        let addr = controller.local_addrs()[0];

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut codec = OfCodec::new();
        let mut out = BytesMut::new();
        codec
            .encode(&OfMessage::hello(OfVersion::Of13, 1), &mut out)
            .unwrap();
        stream.write_all(&out).await.unwrap();

        let mut buf = BytesMut::new();
        let hello = loop {
            if let Some(msg) = codec.decode(&mut buf).unwrap() {
                break msg;
            }
            assert!(stream.read_buf(&mut buf).await.unwrap() > 0);
        };
        assert_eq!(hello.msg_type(), crate::codec::MessageType::Hello);

        controller.stop();
        // The connection task sees the shutdown and closes the socket.
        let mut rest = Vec::new();
        let closed = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await;
        assert!(closed.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_set_config_without_restart() {
        let mut controller = Controller::new(ephemeral());
        controller
            .start(vec![], Arc::new(DefaultDriverProvider))
            .unwrap();
        let addr = controller.local_addrs()[0];

        let mut next = controller.config().clone();
        next.openflow.handshake_timeout_ms = 1_234;
        controller.set_config(next).unwrap();
        assert_eq!(controller.local_addrs(), vec![addr]);
        assert_eq!(controller.config().openflow.handshake_timeout_ms, 1_234);
        controller.stop();
    }
}
