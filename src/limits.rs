use std::{
    collections::HashMap,
    hash::Hash,
    net::IpAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tracing::trace;

use crate::models::UserId;

/// Sliding-window rate limiter. Expired hits are pruned lazily on
/// `allow`; `sweep` drops keys whose window has fully drained.
pub struct RateLimiter<K: Eq + Hash + Clone> {
    max: usize,
    window: Duration,
    hits: Mutex<HashMap<K, Vec<Instant>>>,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, key: K) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().expect("rate limiter poisoned");

        let entry = hits.entry(key).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);

        if entry.len() >= self.max {
            return false;
        }

        entry.push(now);
        true
    }

    /// Ages out keys with no live hits. Run from a periodic task.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut hits = self.hits.lock().expect("rate limiter poisoned");
        hits.retain(|_, entry| {
            entry.retain(|t| now.duration_since(*t) < self.window);
            !entry.is_empty()
        });
    }

    #[cfg(test)]
    pub fn tracked_keys(&self) -> usize {
        self.hits.lock().expect("rate limiter poisoned").len()
    }
}

#[derive(Default)]
struct Counts {
    global: usize,
    per_ip: HashMap<IpAddr, usize>,
}

#[derive(Debug, PartialEq)]
pub enum AdmissionError {
    GlobalCap,
    PerIpCap,
}

/// Admission bookkeeping for the SMTP listener: a global concurrent
/// connection cap and a per-remote-IP cap. Acquiring returns a guard that
/// releases both counts on drop.
#[derive(Clone)]
pub struct ConnectionLimits {
    global_max: usize,
    per_ip_max: usize,
    counts: Arc<Mutex<Counts>>,
}

impl ConnectionLimits {
    pub fn new(global_max: usize, per_ip_max: usize) -> Self {
        Self {
            global_max,
            per_ip_max,
            counts: Arc::new(Mutex::new(Counts::default())),
        }
    }

    pub fn try_acquire(&self, ip: IpAddr) -> Result<ConnectionPermit, AdmissionError> {
        let mut counts = self.counts.lock().expect("connection counts poisoned");

        if counts.global >= self.global_max {
            return Err(AdmissionError::GlobalCap);
        }
        if *counts.per_ip.get(&ip).unwrap_or(&0) >= self.per_ip_max {
            return Err(AdmissionError::PerIpCap);
        }

        counts.global += 1;
        *counts.per_ip.entry(ip).or_insert(0) += 1;
        trace!(%ip, global = counts.global, "connection admitted");

        Ok(ConnectionPermit {
            counts: self.counts.clone(),
            ip,
        })
    }

    pub fn active(&self) -> usize {
        self.counts.lock().expect("connection counts poisoned").global
    }
}

pub struct ConnectionPermit {
    counts: Arc<Mutex<Counts>>,
    ip: IpAddr,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        let mut counts = self.counts.lock().expect("connection counts poisoned");
        counts.global = counts.global.saturating_sub(1);
        if let Some(count) = counts.per_ip.get_mut(&self.ip) {
            *count -= 1;
            if *count == 0 {
                counts.per_ip.remove(&self.ip);
            }
        }
    }
}

/// Per-user cap on concurrent event streams; same guard pattern as the
/// SMTP admission counts.
#[derive(Clone)]
pub struct StreamLimits {
    per_user_max: usize,
    counts: Arc<Mutex<HashMap<UserId, usize>>>,
}

impl StreamLimits {
    pub fn new(per_user_max: usize) -> Self {
        Self {
            per_user_max,
            counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn try_acquire(&self, user: UserId) -> Option<StreamPermit> {
        let mut counts = self.counts.lock().expect("stream counts poisoned");
        let count = counts.entry(user).or_insert(0);
        if *count >= self.per_user_max {
            return None;
        }
        *count += 1;

        Some(StreamPermit {
            counts: self.counts.clone(),
            user,
        })
    }
}

pub struct StreamPermit {
    counts: Arc<Mutex<HashMap<UserId, usize>>>,
    user: UserId,
}

impl Drop for StreamPermit {
    fn drop(&mut self) {
        let mut counts = self.counts.lock().expect("stream counts poisoned");
        if let Some(count) = counts.get_mut(&self.user) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&self.user);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn rate_limiter_caps_within_window() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));

        assert!(limiter.allow("key"));
        assert!(limiter.allow("key"));
        assert!(limiter.allow("key"));
        assert!(!limiter.allow("key"));
        assert!(limiter.allow("other"));
    }

    #[test]
    fn rate_limiter_window_expires() {
        let limiter = RateLimiter::new(1, Duration::from_millis(10));

        assert!(limiter.allow("key"));
        assert!(!limiter.allow("key"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(limiter.allow("key"));
    }

    #[test]
    fn sweep_drops_drained_keys() {
        let limiter = RateLimiter::new(1, Duration::from_millis(5));
        limiter.allow("key");
        assert_eq!(limiter.tracked_keys(), 1);

        std::thread::sleep(Duration::from_millis(10));
        limiter.sweep();
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn connection_limits_enforce_both_caps() {
        let limits = ConnectionLimits::new(3, 2);
        let ip1: IpAddr = "10.0.0.1".parse().unwrap();
        let ip2: IpAddr = "10.0.0.2".parse().unwrap();

        let _a = limits.try_acquire(ip1).unwrap();
        let _b = limits.try_acquire(ip1).unwrap();
        assert_eq!(
            limits.try_acquire(ip1).unwrap_err(),
            AdmissionError::PerIpCap
        );

        let _c = limits.try_acquire(ip2).unwrap();
        assert_eq!(
            limits.try_acquire(ip2).unwrap_err(),
            AdmissionError::GlobalCap
        );
    }

    #[test]
    fn connection_permit_releases_on_drop() {
        let limits = ConnectionLimits::new(1, 1);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        let permit = limits.try_acquire(ip).unwrap();
        assert!(limits.try_acquire(ip).is_err());
        drop(permit);
        assert!(limits.try_acquire(ip).is_ok());
    }

    #[test]
    fn stream_limits_cap_per_user() {
        let limits = StreamLimits::new(2);
        let user: UserId = Uuid::new_v4().into();

        let _a = limits.try_acquire(user).unwrap();
        let b = limits.try_acquire(user).unwrap();
        assert!(limits.try_acquire(user).is_none());

        drop(b);
        assert!(limits.try_acquire(user).is_some());
    }
}
