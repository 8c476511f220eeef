use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::net::IpAddr;
use tokio::sync::RwLock;

#[derive(Debug)]
struct RequestWindow {
    timestamps: Vec<DateTime<Utc>>,
}

impl RequestWindow {
    fn new() -> Self {
        Self {
            timestamps: Vec::new(),
        }
    }

    fn cleanup_old_requests(&mut self, window_size: Duration, now: DateTime<Utc>) {
        let cutoff = now - window_size;
        self.timestamps.retain(|ts| *ts > cutoff);
    }
}

/// Sliding-window cap on how many new identities one address is issued.
///
/// State is per process; with several workers behind a balancer each one
/// enforces the limit on its own share of traffic.
pub struct IdentityRequestLimiter {
    windows: RwLock<HashMap<IpAddr, RequestWindow>>,
    window_size: Duration,
}

impl IdentityRequestLimiter {
    pub fn new(window_size: Duration) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            window_size,
        }
    }

    pub fn hourly() -> Self {
        Self::new(Duration::hours(1))
    }

    /// Claims a slot for `ip` if fewer than `limit` were taken inside the
    /// window. Check and claim happen under one write lock, so concurrent
    /// first contacts from one address cannot overshoot the limit.
    pub async fn try_acquire(&self, ip: IpAddr, limit: u32, now: DateTime<Utc>) -> bool {
        let mut windows = self.windows.write().await;
        let window = windows.entry(ip).or_insert_with(RequestWindow::new);
        window.cleanup_old_requests(self.window_size, now);
        if window.timestamps.len() >= limit as usize {
            return false;
        }
        window.timestamps.push(now);
        true
    }

    /// Returns a slot claimed at `at`, for a request that ended up issuing
    /// no identity.
    pub async fn release(&self, ip: IpAddr, at: DateTime<Utc>) {
        let mut windows = self.windows.write().await;
        if let Some(window) = windows.get_mut(&ip) {
            if let Some(pos) = window.timestamps.iter().rposition(|ts| *ts == at) {
                window.timestamps.remove(pos);
            }
        }
    }

    /// Drops addresses with no issuance inside the window.
    pub async fn cleanup(&self, now: DateTime<Utc>) {
        let mut windows = self.windows.write().await;
        windows.retain(|_, window| {
            window.cleanup_old_requests(self.window_size, now);
            !window.timestamps.is_empty()
        });
    }

    pub async fn tracked_addresses(&self) -> usize {
        self.windows.read().await.len()
    }
}
