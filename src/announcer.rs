use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::utils::error::ServerError;

/// A sender of single datagrams to an explicit target.
///
/// The announcer never interprets send results beyond success/failure, so
/// the real UDP socket and test doubles share this one seam.
pub trait DatagramSink: Send {
    fn send_datagram(&self, payload: &[u8], target: SocketAddr) -> io::Result<usize>;
}

impl DatagramSink for UdpSocket {
    fn send_datagram(&self, payload: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.send_to(payload, target)
    }
}

/// Settings of the presence announcer, usually obtained from
/// [`crate::config::ServerConfig::announcer`].
#[derive(Debug, Clone)]
pub struct AnnouncerConfig {
    pub payload: Vec<u8>,
    pub port: u16,
    pub max_attempts: u32,
    pub retry_interval: Duration,
    pub tick_interval: Duration,
}

struct AnnouncerState {
    sink: Option<Box<dyn DatagramSink>>,
    target: Option<SocketAddr>,
    enabled: bool,
    attempts: u32,
}

/// Periodic presence announcer with bounded-retry backoff.
///
/// While enabled, the background worker sends the configured payload as one
/// datagram per retry interval until `max_attempts` sends have succeeded,
/// then goes silent. The attempt counter resets only on a disconnected
/// renewal ([`Announcer::renew`] with `connected = false`); renewing an
/// already-enabled announcer rebinds the target but keeps the counter, so a
/// reconnect must be preceded by a disconnect to start a fresh burst.
///
/// The announcer is independent of the server; they share nothing but the
/// configuration entry point.
pub struct Announcer {
    config: AnnouncerConfig,
    state: Mutex<AnnouncerState>,
    shutdown: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    /// Back-reference to the owning `Arc`, for handing a clone to the worker.
    weak_self: Weak<Announcer>,
}

impl Announcer {
    pub fn new(config: AnnouncerConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            config,
            state: Mutex::new(AnnouncerState {
                sink: None,
                target: None,
                enabled: false,
                attempts: 0,
            }),
            shutdown: AtomicBool::new(false),
            worker: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// Launches the background worker. No-op when already running.
    pub fn start(&self) {
        let Some(announcer) = self.weak_self.upgrade() else {
            return;
        };
        let mut slot = self.worker.lock().unwrap();
        if slot.is_some() {
            return;
        }
        self.shutdown.store(false, Ordering::Release);
        *slot = Some(tokio::spawn(announcer.run()));
    }

    /// Signals the worker and waits for it to finish. Safe to call twice.
    pub async fn stop(&self) {
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            self.shutdown.store(true, Ordering::Release);
            let _ = worker.await;
        }
    }

    /// The sole mutator of announcer state.
    ///
    /// With `connected = true`, binds a fresh broadcast-capable socket on
    /// `interface_ip` and replaces the previous target; on any failure the
    /// prior state is left untouched. With `connected = false`, disables
    /// announcements and resets the attempt counter.
    pub fn renew(&self, connected: bool, interface_ip: Option<Ipv4Addr>) -> Result<(), ServerError> {
        let mut state = self.state.lock().unwrap();
        if !connected {
            state.enabled = false;
            state.attempts = 0;
            debug!("announcer disabled");
            return Ok(());
        }

        let ip = interface_ip.ok_or_else(|| {
            ServerError::InvalidAddress("announcer renewal requires an interface address".into())
        })?;
        let socket = UdpSocket::bind((ip, 0)).map_err(ServerError::Datagram)?;
        socket.set_broadcast(true).map_err(ServerError::Datagram)?;
        socket.set_nonblocking(true).map_err(ServerError::Datagram)?;

        let target = SocketAddr::from((Self::broadcast_target(ip), self.config.port));
        state.sink = Some(Box::new(socket));
        state.target = Some(target);
        state.enabled = true;
        debug!(%target, "announcer target renewed");
        Ok(())
    }

    /// Loopback interfaces have no broadcast route, so announcements stay on
    /// the interface address itself; everything else uses the limited
    /// broadcast address.
    fn broadcast_target(interface_ip: Ipv4Addr) -> Ipv4Addr {
        if interface_ip.is_loopback() {
            interface_ip
        } else {
            Ipv4Addr::BROADCAST
        }
    }

    /// Successful sends so far in the current burst.
    pub fn attempts(&self) -> u32 {
        self.state.lock().unwrap().attempts
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().unwrap().enabled
    }

    async fn run(self: Arc<Self>) {
        info!("announcer started");
        let mut last_attempt = Instant::now();
        while !self.shutdown.load(Ordering::Acquire) {
            sleep(self.config.tick_interval).await;
            self.tick_once(&mut last_attempt, Instant::now());
        }
        info!("announcer stopped");
    }

    /// One pass of the announcer loop.
    ///
    /// Sends at most one datagram, and only when enabled, under the attempt
    /// limit, and past the retry interval. Only a successful send advances
    /// the counter and the elapsed-time reference; a failed send retries at
    /// the same counter value next time.
    fn tick_once(&self, last_attempt: &mut Instant, now: Instant) {
        let mut state = self.state.lock().unwrap();
        if !state.enabled || state.attempts >= self.config.max_attempts {
            return;
        }
        if now.duration_since(*last_attempt) < self.config.retry_interval {
            return;
        }
        let Some(target) = state.target else {
            return;
        };
        let sent = match state.sink.as_deref() {
            Some(sink) => sink.send_datagram(&self.config.payload, target),
            None => return,
        };
        match sent {
            Ok(_) => {
                state.attempts += 1;
                *last_attempt = now;
                debug!(attempt = state.attempts, %target, "announcement sent");
            }
            Err(e) => debug!(error = %e, "announcement failed; will retry"),
        }
    }

    #[cfg(test)]
    fn install_sink(&self, sink: Box<dyn DatagramSink>, target: SocketAddr) {
        let mut state = self.state.lock().unwrap();
        state.sink = Some(sink);
        state.target = Some(target);
        state.enabled = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingSink {
        sent: Arc<AtomicU32>,
        failing: Arc<AtomicBool>,
    }

    impl DatagramSink for CountingSink {
        fn send_datagram(&self, _payload: &[u8], _target: SocketAddr) -> io::Result<usize> {
            if self.failing.load(Ordering::Acquire) {
                return Err(io::Error::new(io::ErrorKind::Other, "no route"));
            }
            self.sent.fetch_add(1, Ordering::AcqRel);
            Ok(0)
        }
    }

    fn config(max_attempts: u32, retry: Duration) -> AnnouncerConfig {
        AnnouncerConfig {
            payload: b"announce".to_vec(),
            port: 3055,
            max_attempts,
            retry_interval: retry,
            tick_interval: Duration::from_millis(1),
        }
    }

    fn target() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 3055))
    }

    fn counting(announcer: &Announcer) -> (Arc<AtomicU32>, Arc<AtomicBool>) {
        let sent = Arc::new(AtomicU32::new(0));
        let failing = Arc::new(AtomicBool::new(false));
        announcer.install_sink(
            Box::new(CountingSink {
                sent: Arc::clone(&sent),
                failing: Arc::clone(&failing),
            }),
            target(),
        );
        (sent, failing)
    }

    #[test]
    fn sends_stop_at_max_attempts() {
        let announcer = Announcer::new(config(3, Duration::ZERO));
        let (sent, _) = counting(&announcer);

        let mut last = Instant::now() - Duration::from_secs(1);
        let now = Instant::now();
        for _ in 0..10 {
            announcer.tick_once(&mut last, now);
        }
        assert_eq!(sent.load(Ordering::Acquire), 3);
        assert_eq!(announcer.attempts(), 3);
    }

    #[test]
    fn failed_send_does_not_advance_counter() {
        let announcer = Announcer::new(config(5, Duration::ZERO));
        let (sent, failing) = counting(&announcer);
        failing.store(true, Ordering::Release);

        let mut last = Instant::now() - Duration::from_secs(1);
        for _ in 0..4 {
            announcer.tick_once(&mut last, Instant::now());
        }
        assert_eq!(announcer.attempts(), 0);
        assert_eq!(sent.load(Ordering::Acquire), 0);

        // Once sends succeed again, the burst resumes from the same counter.
        failing.store(false, Ordering::Release);
        announcer.tick_once(&mut last, Instant::now());
        assert_eq!(announcer.attempts(), 1);
        assert_eq!(sent.load(Ordering::Acquire), 1);
    }

    #[test]
    fn retry_interval_gates_sends() {
        let announcer = Announcer::new(config(10, Duration::from_secs(5)));
        let (sent, _) = counting(&announcer);

        let start = Instant::now();
        let mut last = start;
        announcer.tick_once(&mut last, start + Duration::from_secs(1));
        assert_eq!(sent.load(Ordering::Acquire), 0);

        announcer.tick_once(&mut last, start + Duration::from_secs(5));
        assert_eq!(sent.load(Ordering::Acquire), 1);

        // Reference resets on success: one second later is too early again.
        announcer.tick_once(&mut last, start + Duration::from_secs(6));
        assert_eq!(sent.load(Ordering::Acquire), 1);
    }

    #[test]
    fn disconnect_renewal_resets_counter_and_reenables_sends() {
        let announcer = Announcer::new(config(2, Duration::ZERO));
        let (sent, _) = counting(&announcer);

        let mut last = Instant::now() - Duration::from_secs(1);
        for _ in 0..5 {
            announcer.tick_once(&mut last, Instant::now());
        }
        assert_eq!(announcer.attempts(), 2);

        announcer.renew(false, None).unwrap();
        assert_eq!(announcer.attempts(), 0);
        assert!(!announcer.is_enabled());
        // Disabled: no sends even though the counter is fresh.
        announcer.tick_once(&mut last, Instant::now());
        assert_eq!(sent.load(Ordering::Acquire), 2);

        let (sent2, _) = counting(&announcer);
        last = Instant::now() - Duration::from_secs(1);
        for _ in 0..5 {
            announcer.tick_once(&mut last, Instant::now());
        }
        assert_eq!(sent2.load(Ordering::Acquire), 2);
    }

    #[test]
    fn connected_renewal_alone_does_not_reset_counter() {
        let announcer = Announcer::new(config(2, Duration::ZERO));
        let (_sent, _) = counting(&announcer);

        let mut last = Instant::now() - Duration::from_secs(1);
        for _ in 0..3 {
            announcer.tick_once(&mut last, Instant::now());
        }
        assert_eq!(announcer.attempts(), 2);

        // Rebinding while still connected keeps the exhausted counter.
        announcer.renew(true, Some(Ipv4Addr::LOCALHOST)).unwrap();
        assert_eq!(announcer.attempts(), 2);
        let (sent2, _) = counting(&announcer);
        announcer.tick_once(&mut last, Instant::now());
        assert_eq!(sent2.load(Ordering::Acquire), 0);
    }

    #[test]
    fn renewal_without_interface_fails_and_keeps_state() {
        let announcer = Announcer::new(config(2, Duration::ZERO));
        assert!(announcer.renew(true, None).is_err());
        assert!(!announcer.is_enabled());
    }
}
