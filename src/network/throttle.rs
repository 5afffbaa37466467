//! Per-IP connection throttle
//!
//! Counts accepted connections per address. The counts are cleared once
//! per window by a background task owned by the server.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};

#[derive(Debug)]
pub struct ConnectThrottle {
    counts: Mutex<HashMap<IpAddr, u32>>,
    /// 0 disables the throttle
    limit: u32,
}

impl ConnectThrottle {
    pub fn new(limit: u32) -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            limit,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limit > 0
    }

    /// Records a connection attempt. Returns false once `ip` is over the limit.
    pub fn record(&self, ip: IpAddr) -> bool {
        if self.limit == 0 {
            return true;
        }
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(ip).or_insert(0);
        *count = count.saturating_add(1);
        if *count > self.limit {
            tracing::debug!("[throttle] [reject] ip={} count={}", ip, *count);
            return false;
        }
        true
    }

    pub fn count(&self, ip: IpAddr) -> u32 {
        let counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        counts.get(&ip).copied().unwrap_or(0)
    }

    /// Clears all counts.
    pub fn reset(&self) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        if !counts.is_empty() {
            tracing::debug!("[throttle] [reset] cleared={}", counts.len());
        }
        counts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_and_reset() {
        let throttle = ConnectThrottle::new(2);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(throttle.record(ip));
        assert!(throttle.record(ip));
        assert!(!throttle.record(ip));
        assert!(throttle.record("10.0.0.2".parse().unwrap()));

        throttle.reset();
        assert_eq!(throttle.count(ip), 0);
        assert!(throttle.record(ip));
    }

    #[test]
    fn test_disabled_never_counts() {
        let throttle = ConnectThrottle::new(0);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        for _ in 0..100 {
            assert!(throttle.record(ip));
        }
        assert_eq!(throttle.count(ip), 0);
    }
}
