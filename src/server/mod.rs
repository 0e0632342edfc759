// src/server/mod.rs
pub mod client;
pub mod events;
pub mod handler;
pub mod middleware;
pub mod queue;

// Re-export public components
pub use client::{ClientDirectory, ClientSession};
pub use events::{ClientHandle, EventNotifier, ServerEvents, ServerReason};
pub use middleware::rate_limit::ConnectionRateLimiter;
pub use queue::{ChunkSink, SendQueue};

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::utils::error::ServerError;

/// Listen backlog passed to the OS.
const LISTEN_BACKLOG: u32 = 64;

/// Lifecycle stage of a [`Server`].
///
/// Transitions are monotonic, except that `ShuttingDown` is reachable from
/// any stage and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Stage {
    Initializing = 0,
    Listening = 1,
    ShuttingDown = 2,
}

impl Stage {
    fn from_u8(raw: u8) -> Stage {
        match raw {
            0 => Stage::Initializing,
            1 => Stage::Listening,
            _ => Stage::ShuttingDown,
        }
    }
}

/// A connection-oriented stream service.
///
/// Owns the listening endpoint and the lifecycle worker that accepts
/// connections, admits or refuses them against the configured capacity,
/// spawns one worker task per admitted session and reaps terminated sessions.
/// Progress is observable through the [`ServerEvents`] implementation passed
/// at construction.
pub struct Server {
    config: ServerConfig,
    stage: AtomicU8,
    directory: ClientDirectory,
    notifier: EventNotifier,
    rate_limiter: ConnectionRateLimiter,
    lifecycle: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    /// Back-reference to the owning `Arc`, for handing clones to workers.
    weak_self: Weak<Server>,
}

impl Server {
    pub fn new(config: ServerConfig, listener: Arc<dyn ServerEvents>) -> Arc<Self> {
        let rate_limiter = ConnectionRateLimiter::new(config.connection_rate_limit);
        Arc::new_cyclic(|weak_self| Self {
            config,
            stage: AtomicU8::new(Stage::Initializing as u8),
            directory: ClientDirectory::new(),
            notifier: EventNotifier::new(listener),
            rate_limiter,
            lifecycle: Mutex::new(None),
            local_addr: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// Launches the lifecycle worker and returns immediately.
    ///
    /// Callers observe progress (including bind/listen failures) through the
    /// event surface rather than a return value. Calling `start` on a server
    /// that is already running is a no-op.
    pub fn start(&self) {
        let Some(server) = self.weak_self.upgrade() else {
            return;
        };
        let mut slot = self.lifecycle.lock().unwrap();
        if slot.is_some() {
            return;
        }
        self.set_stage(Stage::Initializing);
        *slot = Some(tokio::spawn(server.run()));
    }

    /// Signals termination and waits until the lifecycle worker and every
    /// session worker have fully terminated.
    ///
    /// Shutdown is cooperative: in-flight I/O completes its current bounded
    /// call before the worker observes the stage change at its next tick.
    /// Calling `stop` on a stopped (or never started) server is a safe no-op.
    pub async fn stop(&self) {
        let worker = self.lifecycle.lock().unwrap().take();
        let Some(worker) = worker else {
            return;
        };
        self.notifier
            .server_update(self, ServerReason::ServerStopSignal, 0);
        self.set_stage(Stage::ShuttingDown);
        let _ = worker.await;
    }

    pub fn stage(&self) -> Stage {
        Stage::from_u8(self.stage.load(Ordering::Acquire))
    }

    fn set_stage(&self, stage: Stage) {
        self.stage.store(stage as u8, Ordering::Release);
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.stage() == Stage::ShuttingDown
    }

    /// The bound listening address, once the server has reached the
    /// listening stage. Mainly useful when configured with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    /// Number of currently registered sessions (including sessions that have
    /// terminated but not yet been reaped).
    pub fn connection_count(&self) -> usize {
        self.directory.len()
    }

    /// Queues `data` for in-order delivery to the given client. The bytes
    /// are treated as opaque.
    pub fn send_to_client(&self, handle: ClientHandle, data: &[u8]) -> Result<(), ServerError> {
        let session = self
            .directory
            .session(handle)
            .ok_or(ServerError::ClientNotFound(handle))?;
        session.queue().push(data);
        Ok(())
    }

    /// Marks the client's session disconnected; its worker exits at the next
    /// tick and the session is reaped by a later sweep.
    pub fn close_client(&self, handle: ClientHandle) -> Result<(), ServerError> {
        let session = self
            .directory
            .session(handle)
            .ok_or(ServerError::ClientNotFound(handle))?;
        session.set_connected(false);
        Ok(())
    }

    pub(crate) fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub(crate) fn notifier(&self) -> &EventNotifier {
        &self.notifier
    }

    pub(crate) fn directory(&self) -> &ClientDirectory {
        &self.directory
    }

    async fn run(self: Arc<Self>) {
        self.notifier
            .server_update(&self, ServerReason::ServerStarted, 0);
        info!("lifecycle worker started");

        if let Some(listener) = self.do_initializing() {
            self.notifier.start_listening(&self);
            self.do_listening(&listener).await;
        }

        info!("stopping; joining session workers");
        for worker in self.directory.drain_all() {
            let _ = worker.await;
        }
        *self.local_addr.lock().unwrap() = None;
        self.notifier
            .server_update(&self, ServerReason::ServerStopped, 0);
        info!("stopped");
    }

    /// Binds and starts listening. Initialization failures are fatal to the
    /// server: they are reported once, with the OS error code, and the stage
    /// goes straight to `ShuttingDown`.
    fn do_initializing(&self) -> Option<TcpListener> {
        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.port));
        info!(%bind_addr, "initializing listener");

        let socket = match Self::bound_socket(bind_addr) {
            Ok(socket) => socket,
            Err(e) => {
                self.fail_initializing(ServerReason::InitialBindFail, &e);
                return None;
            }
        };
        let listener = match socket.listen(LISTEN_BACKLOG) {
            Ok(listener) => listener,
            Err(e) => {
                self.fail_initializing(ServerReason::InitialListenFail, &e);
                return None;
            }
        };

        *self.local_addr.lock().unwrap() = listener.local_addr().ok();
        self.set_stage(Stage::Listening);
        Some(listener)
    }

    fn bound_socket(bind_addr: SocketAddr) -> std::io::Result<TcpSocket> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(bind_addr)?;
        Ok(socket)
    }

    fn fail_initializing(&self, reason: ServerReason, error: &std::io::Error) {
        warn!(?reason, %error, "initialization failed");
        self.set_stage(Stage::ShuttingDown);
        self.notifier
            .server_update(self, reason, error.raw_os_error().unwrap_or(0));
    }

    /// The accept loop. When no connection arrives within the accept
    /// timeout, the idle slot is used to reap terminated sessions instead.
    /// Accept errors are transient: log, sweep, retry next tick.
    async fn do_listening(&self, listener: &TcpListener) {
        let tick = self.config.tick_interval();
        while !self.is_shutting_down() {
            match timeout(self.config.accept_timeout(), listener.accept()).await {
                Ok(Ok((stream, addr))) => self.admit_connection(stream, addr),
                Ok(Err(e)) => {
                    warn!(error = %e, "accept failed");
                    self.sweep_directory().await;
                    sleep(tick).await;
                }
                Err(_elapsed) => {
                    self.sweep_directory().await;
                    sleep(tick).await;
                }
            }
        }
    }

    /// Runs admission control for one accepted connection.
    ///
    /// A refused connection (over the rate budget or at capacity) is closed
    /// immediately by dropping the stream; refusal is a policy outcome
    /// reported via `ConnectionRefused`, not an error.
    fn admit_connection(&self, stream: TcpStream, addr: SocketAddr) {
        if !self.rate_limiter.check(addr) {
            debug!(%addr, "connection refused: rate limit");
            drop(stream);
            self.notifier
                .server_update(self, ServerReason::ConnectionRefused, 0);
            return;
        }

        let Some(server) = self.weak_self.upgrade() else {
            return;
        };
        let admitted = self.directory.admit(
            self.config.max_connections,
            self.config.client_timeout(),
            move |session| tokio::spawn(handler::run_client(server, session, stream)),
        );
        match admitted {
            Some(handle) => {
                info!(handle, %addr, "connection accepted");
                self.notifier
                    .server_update(self, ServerReason::ConnectionAccepted, 0);
            }
            None => {
                info!(%addr, "connection refused: at capacity");
                self.notifier
                    .server_update(self, ServerReason::ConnectionRefused, 0);
            }
        }
    }

    /// Reaps terminated sessions. Fires one batched `ConnectionDeleted` per
    /// sweep that removed at least one session.
    async fn sweep_directory(&self) {
        let reaped = self.directory.sweep();
        if reaped.is_empty() {
            return;
        }
        let count = reaped.len();
        for worker in reaped {
            let _ = worker.await;
        }
        debug!(count, "reaped terminated sessions");
        self.notifier
            .server_update(self, ServerReason::ConnectionDeleted, 0);
    }
}
