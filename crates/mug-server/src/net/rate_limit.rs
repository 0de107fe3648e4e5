//! Flood protection for the relay port.
//!
//! New connections are limited per source address in the accept loop;
//! messages are limited per connection in the server loop. A participant
//! page stuck in a reconnect loop trips the first, a broken one spamming
//! signals trips the second.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tracing::debug;

/// Rates are per second; zero turns that limit off.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub connections_per_ip: u32,
    pub messages_per_conn: u32,
    /// Burst size as a multiple of the rate.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            connections_per_ip: 10,
            messages_per_conn: 200,
            burst: 3,
        }
    }
}

fn quota(per_sec: u32, burst: u32) -> Option<Quota> {
    let rate = NonZeroU32::new(per_sec)?;
    let burst = NonZeroU32::new(per_sec.saturating_mul(burst)).unwrap_or(rate);
    Some(Quota::per_second(rate).allow_burst(burst))
}

/// Connection attempts per source address.
pub struct IpRateLimiter {
    buckets: DashMap<IpAddr, DefaultDirectRateLimiter>,
    quota: Option<Quota>,
}

impl IpRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            quota: quota(config.connections_per_ip, config.burst),
        }
    }

    pub fn allow(&self, ip: IpAddr) -> bool {
        let Some(quota) = self.quota else {
            return true;
        };
        let bucket = self
            .buckets
            .entry(ip)
            .or_insert_with(|| RateLimiter::direct(quota));
        bucket.check().is_ok()
    }

    /// Drop buckets until at most `keep` addresses are tracked. Which ones
    /// go is unspecified; a dropped address just starts with a full bucket.
    pub fn prune(&self, keep: usize) {
        let excess = self.buckets.len().saturating_sub(keep);
        if excess == 0 {
            return;
        }
        let victims: Vec<IpAddr> = self.buckets.iter().take(excess).map(|e| *e.key()).collect();
        for ip in &victims {
            self.buckets.remove(ip);
        }
        debug!(pruned = victims.len(), "Pruned connection rate buckets");
    }

    /// Prune to `keep` addresses every `every`, for as long as the limiter
    /// is alive elsewhere.
    pub fn spawn_pruner(self: &Arc<Self>, every: Duration, keep: usize) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.tick().await;
            loop {
                tick.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                limiter.prune(keep);
            }
        });
    }

    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }
}

/// Message budget of one relay connection.
#[derive(Clone)]
pub struct ConnRateLimiter(Arc<DefaultDirectRateLimiter>);

impl ConnRateLimiter {
    /// `None` when message limiting is off.
    pub fn new(config: &RateLimitConfig) -> Option<Self> {
        let quota = quota(config.messages_per_conn, config.burst)?;
        Some(Self(Arc::new(RateLimiter::direct(quota))))
    }

    pub fn allow(&self) -> bool {
        self.0.check().is_ok()
    }
}
