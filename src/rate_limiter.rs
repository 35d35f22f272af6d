//! Per-client fixed-window admission control.
//!
//! Each client IP gets a counter that resets every [`RateLimiterLimits::window`].
//! Once a counter's `count` exceeds `max_requests` within the current window
//! the request is rejected; a new window starts the next time that IP is
//! seen after the previous window has elapsed. IPs on the blacklist are
//! rejected unconditionally; IPs on the whitelist bypass counting entirely.
//!
//! The limiter is meant to sit behind an `Rc` on the connection's
//! single-threaded reactor, so its state is a plain [`RefCell`] rather than
//! a lock — see the crate's concurrency model.

use crate::limits::RateLimiterLimits;
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

struct Counter {
    window_start: Instant,
    count: usize,
}

/// Why a request was rejected by the rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    /// The client IP matched a blacklist entry.
    Blacklisted,
    /// The client exceeded `max_requests` within the current window.
    LimitExceeded,
}

/// Per-IP fixed-window request counter with CIDR allow/deny lists.
pub struct RateLimiter {
    limits: RateLimiterLimits,
    reap_after: Duration,
    counters: RefCell<HashMap<IpAddr, Counter>>,
}

impl RateLimiter {
    /// Builds a limiter from the given limits.
    pub fn new(limits: RateLimiterLimits) -> Self {
        let reap_after = limits.window * 2;
        Self {
            limits,
            reap_after,
            counters: RefCell::new(HashMap::new()),
        }
    }

    /// Checks whether `ip` may proceed, recording the request if so.
    ///
    /// Returns `Ok(())` when the request is admitted (including whitelisted
    /// IPs, which are never counted), or `Err(Rejected)` explaining the
    /// rejection.
    pub fn check(&self, ip: IpAddr) -> Result<(), Rejected> {
        if self.limits.blacklist.iter().any(|p| p.contains(ip)) {
            return Err(Rejected::Blacklisted);
        }

        if self.limits.whitelist.iter().any(|p| p.contains(ip)) {
            return Ok(());
        }

        let now = Instant::now();
        let mut counters = self.counters.borrow_mut();

        self.reap_stale(&mut counters, now);

        let counter = counters.entry(ip).or_insert_with(|| Counter {
            window_start: now,
            count: 0,
        });

        if now.duration_since(counter.window_start) >= self.limits.window {
            counter.window_start = now;
            counter.count = 0;
        }

        counter.count += 1;

        if counter.count > self.limits.max_requests {
            Err(Rejected::LimitExceeded)
        } else {
            Ok(())
        }
    }

    /// Current `(remaining_requests, reset_time)` for `ip`: how many more
    /// requests it may make and when its window resets, whether or not it
    /// has an active counter yet.
    pub fn status(&self, ip: IpAddr) -> (usize, Instant) {
        let counters = self.counters.borrow();
        match counters.get(&ip) {
            Some(counter) => {
                let remaining = self.limits.max_requests.saturating_sub(counter.count);
                (remaining, counter.window_start + self.limits.window)
            }
            None => (self.limits.max_requests, Instant::now() + self.limits.window),
        }
    }

    /// Clears the counter for a single IP, letting it start a fresh window
    /// immediately.
    pub fn reset(&self, ip: IpAddr) {
        self.counters.borrow_mut().remove(&ip);
    }

    /// Clears all per-IP counters.
    pub fn clear_all(&self) {
        self.counters.borrow_mut().clear();
    }

    /// Drops counters idle for longer than `2 * window`, called lazily on
    /// every admission check so long-running servers don't accumulate one
    /// entry per ever-seen IP.
    fn reap_stale(&self, counters: &mut HashMap<IpAddr, Counter>, now: Instant) {
        counters.retain(|_, counter| now.duration_since(counter.window_start) < self.reap_after);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::IpPattern;
    use std::net::Ipv4Addr;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn admits_within_limit_then_rejects() {
        let limiter = RateLimiter::new(RateLimiterLimits {
            max_requests: 3,
            window: Duration::from_secs(60),
            ..Default::default()
        });

        let client = ip(10, 0, 0, 5);
        assert!(limiter.check(client).is_ok());
        assert!(limiter.check(client).is_ok());
        assert!(limiter.check(client).is_ok());
        assert_eq!(limiter.check(client), Err(Rejected::LimitExceeded));
    }

    #[test]
    fn whitelisted_ip_is_never_counted() {
        let limiter = RateLimiter::new(RateLimiterLimits {
            max_requests: 1,
            window: Duration::from_secs(60),
            whitelist: vec![IpPattern::parse("10.0.0.0/8").unwrap()],
            ..Default::default()
        });

        let client = ip(10, 1, 2, 3);
        for _ in 0..10 {
            assert!(limiter.check(client).is_ok());
        }
        assert_eq!(limiter.status(client).0, 1);
    }

    #[test]
    fn blacklisted_ip_always_rejected() {
        let limiter = RateLimiter::new(RateLimiterLimits {
            blacklist: vec![IpPattern::parse("192.168.1.1").unwrap()],
            ..Default::default()
        });

        assert_eq!(
            limiter.check(ip(192, 168, 1, 1)),
            Err(Rejected::Blacklisted)
        );
    }

    #[test]
    fn separate_ips_have_independent_counters() {
        let limiter = RateLimiter::new(RateLimiterLimits {
            max_requests: 1,
            window: Duration::from_secs(60),
            ..Default::default()
        });

        assert!(limiter.check(ip(1, 1, 1, 1)).is_ok());
        assert!(limiter.check(ip(2, 2, 2, 2)).is_ok());
        assert_eq!(limiter.check(ip(1, 1, 1, 1)), Err(Rejected::LimitExceeded));
    }

    #[test]
    fn reset_clears_a_single_counter() {
        let limiter = RateLimiter::new(RateLimiterLimits {
            max_requests: 1,
            window: Duration::from_secs(60),
            ..Default::default()
        });

        let client = ip(8, 8, 8, 8);
        assert!(limiter.check(client).is_ok());
        assert_eq!(limiter.check(client), Err(Rejected::LimitExceeded));

        limiter.reset(client);
        assert!(limiter.check(client).is_ok());
    }
}
