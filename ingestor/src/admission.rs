use crate::config::RateLimitConfig;
use crate::errors::{Error, Result};
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Clients idle for longer than this many sweep intervals are forgotten.
const IDLE_SWEEPS: u32 = 3;

struct ClientBucket {
    limiter: Arc<DirectRateLimiter>,
    last_seen: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Per-client token buckets keyed by client identity (source address,
/// MQTT topic).
///
/// Each bucket is a GCRA cell updated with compare-and-swap, so concurrent
/// requests from one client never spend the same token twice. The bucket
/// table is sharded; distinct clients do not contend.
pub struct AdmissionController {
    quota: Quota,
    request_delay: Duration,
    sweep_interval: Duration,
    clients: Arc<DashMap<String, ClientBucket>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl AdmissionController {
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        let invalid = || {
            Error::Config(format!(
                "unusable rate limit: {} req/s, burst {}",
                config.requests_per_second, config.burst
            ))
        };

        let period = config.period().ok_or_else(invalid)?;
        let burst = NonZeroU32::new(config.burst).ok_or_else(invalid)?;
        let quota = Quota::with_period(period)
            .ok_or_else(invalid)?
            .allow_burst(burst);

        Ok(Self {
            quota,
            request_delay: config.request_delay,
            sweep_interval: config.sweep_interval,
            clients: Arc::new(DashMap::new()),
            sweeper: Mutex::new(None),
        })
    }

    /// Takes one token from `client`'s bucket, creating the bucket on first
    /// sight. The client's activity timestamp is refreshed either way.
    pub fn check(&self, client: &str) -> Admission {
        let now = Instant::now();

        let limiter = match self.clients.get_mut(client) {
            Some(mut bucket) => {
                bucket.last_seen = now;
                bucket.limiter.clone()
            }
            None => {
                let mut bucket = self
                    .clients
                    .entry(client.to_string())
                    .or_insert_with(|| ClientBucket {
                        limiter: Arc::new(RateLimiter::direct(self.quota)),
                        last_seen: now,
                    });
                bucket.last_seen = now;
                bucket.limiter.clone()
            }
        };

        match limiter.check() {
            Ok(()) => Admission::Allowed,
            Err(not_until) => Admission::Denied {
                retry_after: not_until.wait_time_from(DefaultClock::default().now()),
            },
        }
    }

    /// [`check`](Self::check), followed by the configured smoothing delay
    /// when the request is let through.
    pub async fn admit(&self, client: &str) -> Admission {
        let admission = self.check(client);
        if admission.is_allowed() && !self.request_delay.is_zero() {
            tokio::time::sleep(self.request_delay).await;
        }
        admission
    }

    #[cfg(test)]
    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }

    fn idle_after(&self) -> Duration {
        self.sweep_interval * IDLE_SWEEPS
    }

    /// Drops every client whose last activity is older than the idle
    /// threshold as of `now`. Returns how many were dropped.
    #[cfg(test)]
    pub fn evict_idle(&self, now: Instant) -> usize {
        evict_idle(&self.clients, self.idle_after(), now)
    }

    /// Starts the periodic idle sweep. The task stops on
    /// [`shutdown`](Self::shutdown) or when the controller is dropped.
    pub fn spawn_sweeper(&self) {
        let mut slot = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }

        let clients = Arc::clone(&self.clients);
        let every = self.sweep_interval;
        let idle_after = self.idle_after();
        info!(
            "Starting admission sweeper every {:?}, idle threshold {:?}",
            every, idle_after
        );

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let evicted = evict_idle(&clients, idle_after, Instant::now());
                if evicted > 0 {
                    debug!("Evicted {} idle clients, {} tracked", evicted, clients.len());
                }
            }
        }));
    }

    pub fn shutdown(&self) {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            info!("Admission sweeper stopped");
        }
    }
}

impl Drop for AdmissionController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// `retain` holds each shard's write lock, and `check` refreshes
/// `last_seen` under the same lock, so a bucket touched by an in-flight
/// request is never considered idle.
fn evict_idle(clients: &DashMap<String, ClientBucket>, idle_after: Duration, now: Instant) -> usize {
    let mut evicted = 0;
    clients.retain(|_, bucket| {
        let keep = now.saturating_duration_since(bucket.last_seen) <= idle_after;
        if !keep {
            evicted += 1;
        }
        keep
    });
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(requests_per_second: f64, burst: u32) -> AdmissionController {
        AdmissionController::new(&RateLimitConfig {
            requests_per_second,
            burst,
            request_delay: Duration::ZERO,
            sweep_interval: Duration::from_secs(60),
        })
        .unwrap()
    }

    #[test]
    fn test_burst_then_deny() {
        let admission = controller(1.0, 3);

        for _ in 0..3 {
            assert_eq!(admission.check("10.0.0.1"), Admission::Allowed);
        }
        match admission.check("10.0.0.1") {
            Admission::Denied { retry_after } => assert!(retry_after <= Duration::from_secs(1)),
            Admission::Allowed => panic!("fourth request inside one second was admitted"),
        }
    }

    #[test]
    fn test_clients_have_independent_buckets() {
        let admission = controller(0.001, 2);

        assert!(admission.check("a").is_allowed());
        assert!(admission.check("a").is_allowed());
        assert!(!admission.check("a").is_allowed());

        assert!(admission.check("b").is_allowed());
        assert!(admission.check("b").is_allowed());
        assert_eq!(admission.tracked_clients(), 2);
    }

    #[test]
    fn test_concurrent_requests_never_exceed_burst() {
        let admission = controller(0.001, 10);
        let allowed = std::sync::atomic::AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..25 {
                        if admission.check("shared").is_allowed() {
                            allowed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(allowed.into_inner(), 10);
    }

    #[test]
    fn test_rejects_unusable_quota() {
        let base = RateLimitConfig::default();
        assert!(AdmissionController::new(&RateLimitConfig { burst: 0, ..base.clone() }).is_err());
        assert!(AdmissionController::new(&RateLimitConfig {
            requests_per_second: 0.0,
            ..base.clone()
        })
        .is_err());
        assert!(AdmissionController::new(&RateLimitConfig {
            requests_per_second: 1e-30,
            ..base.clone()
        })
        .is_err());
        assert!(AdmissionController::new(&RateLimitConfig {
            requests_per_second: f64::INFINITY,
            ..base
        })
        .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle() {
        let admission = controller(10.0, 10);
        admission.check("old");
        tokio::time::advance(Duration::from_secs(150)).await;
        admission.check("recent");

        let now = Instant::now();
        assert_eq!(admission.evict_idle(now), 0);
        assert_eq!(admission.evict_idle(now + Duration::from_secs(31)), 1);
        assert_eq!(admission.tracked_clients(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_forgets_idle_clients() {
        let admission = controller(10.0, 10);
        admission.spawn_sweeper();

        admission.check("idle");
        tokio::time::sleep(Duration::from_secs(200)).await;
        admission.check("active");
        tokio::time::sleep(Duration::from_secs(41)).await;

        assert_eq!(admission.tracked_clients(), 1);
        assert!(admission.clients.contains_key("active"));

        admission.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_applies_delay_only_when_allowed() {
        let admission = AdmissionController::new(&RateLimitConfig {
            requests_per_second: 0.001,
            burst: 1,
            request_delay: Duration::from_millis(10),
            sweep_interval: Duration::from_secs(60),
        })
        .unwrap();

        let start = Instant::now();
        assert!(admission.admit("c").await.is_allowed());
        assert!(start.elapsed() >= Duration::from_millis(10));

        let start = Instant::now();
        assert!(!admission.admit("c").await.is_allowed());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
