use governor::{
    clock::QuantaClock, middleware::NoOpMiddleware, state::keyed::DashMapStateStore, Quota,
    RateLimiter,
};
use nonzero_ext::nonzero;
use std::{
    net::{IpAddr, SocketAddr},
    num::NonZeroU32,
    sync::Arc,
    time::Duration,
};

/// A rate limiter for connection attempts, keyed by client IP address.
///
/// This sits in front of admission control: a connect attempt that exceeds
/// the per-second budget for its source address is refused before the
/// directory's capacity check even runs.
#[derive(Clone)]
pub struct ConnectionRateLimiter {
    /// The underlying rate limiter instance, shared across instances.
    limiter: Arc<RateLimiter<IpAddr, DashMapStateStore<IpAddr>, QuantaClock, NoOpMiddleware>>,
}

impl ConnectionRateLimiter {
    /// Creates a new `ConnectionRateLimiter` allowing `per_second` connect
    /// attempts per source address. A zero limit is clamped to one.
    pub fn new(per_second: u32) -> Self {
        let burst_size = NonZeroU32::new(per_second).unwrap_or(nonzero!(1u32));

        let quota = Quota::with_period(Duration::from_secs(1))
            .unwrap_or_else(|| Quota::per_second(burst_size))
            .allow_burst(burst_size);

        Self {
            limiter: Arc::new(RateLimiter::keyed(quota)),
        }
    }

    /// Checks whether a connection from `addr` is within budget right now.
    ///
    /// Unlike a blocking limiter, this never waits: the acceptor either
    /// admits the connection immediately or refuses it.
    pub fn check(&self, addr: SocketAddr) -> bool {
        self.limiter.check_key(&addr.ip()).is_ok()
    }
}
