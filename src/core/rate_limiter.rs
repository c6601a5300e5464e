//! Sliding-window rate limiting per caller identity.
//!
//! Each identity owns a deque of `(timestamp, count)` entries covering the trailing
//! window. Limits are looked up through a [`RateLimitResolver`] so that business rules
//! (global default, per-client overrides) stay outside the limiter itself.
//!
//! State is purely in memory. A process restart resets every counter; this is accepted
//! behavior for a gateway that runs behind its own restart policy.

use crate::core::cancel::CancellationSignal;
use crate::core::config::AppConfig;
use axum::http::{HeaderMap, HeaderValue};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

pub const DEFAULT_REQUESTS_PER_WINDOW: u32 = 100;
pub const DEFAULT_WINDOW_SECONDS: u64 = 60;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300;

/// Limit applied to one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitPolicy {
    pub requests_per_window: u32,
    pub window_seconds: u64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            requests_per_window: DEFAULT_REQUESTS_PER_WINDOW,
            window_seconds: DEFAULT_WINDOW_SECONDS,
        }
    }
}

/// Resolves the limit for a caller identity.
pub trait RateLimitResolver: Send + Sync {
    fn limit_for(&self, identity: &str) -> RateLimitPolicy;
}

/// Global default with optional per-identity overrides.
#[derive(Debug, Clone, Default)]
pub struct StaticRateLimitResolver {
    default: RateLimitPolicy,
    overrides: HashMap<String, RateLimitPolicy>,
}

impl StaticRateLimitResolver {
    pub fn new(default: RateLimitPolicy) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, identity: impl Into<String>, policy: RateLimitPolicy) -> Self {
        self.overrides.insert(identity.into(), policy);
        self
    }

    /// Build from `router_settings.rate_limit_per_user` plus `clients.<name>.requests_per_minute`.
    ///
    /// Client overrides are keyed by the identity the authenticator assigns (`client_<name>`)
    /// and share the global window length.
    pub fn from_config(config: &AppConfig) -> Self {
        let settings = &config.router_settings.rate_limit_per_user;
        let default = RateLimitPolicy {
            requests_per_window: settings.requests_per_minute,
            window_seconds: settings.window_seconds,
        };

        let mut resolver = Self::new(default);
        for (name, client) in &config.clients {
            if let Some(rpm) = client.requests_per_minute {
                resolver.overrides.insert(
                    format!("client_{}", name),
                    RateLimitPolicy {
                        requests_per_window: rpm,
                        window_seconds: settings.window_seconds,
                    },
                );
            }
        }
        resolver
    }
}

impl RateLimitResolver for StaticRateLimitResolver {
    fn limit_for(&self, identity: &str) -> RateLimitPolicy {
        self.overrides
            .get(identity)
            .copied()
            .unwrap_or(self.default)
    }
}

/// Window state reported to the caller and mirrored into `x-ratelimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
    /// Epoch seconds at which the oldest counted request leaves the window.
    pub reset: u64,
    pub window_seconds: u64,
}

impl RateLimitInfo {
    /// Seconds until the window frees a slot, never less than one.
    pub fn retry_after_secs(&self) -> u64 {
        let now = now_epoch_secs() as u64;
        self.reset.saturating_sub(now).max(1)
    }

    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        let pairs = [
            ("x-ratelimit-limit", self.limit.to_string()),
            ("x-ratelimit-remaining", self.remaining.to_string()),
            ("x-ratelimit-reset", self.reset.to_string()),
            ("x-ratelimit-window", self.window_seconds.to_string()),
        ];
        for (name, value) in pairs {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(name, value);
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    timestamp: f64,
    count: u32,
}

/// Trailing window of admitted requests for one identity.
#[derive(Debug, Default)]
pub struct RateLimitWindow {
    entries: VecDeque<WindowEntry>,
}

impl RateLimitWindow {
    /// Drop entries strictly older than `now - window_seconds`.
    fn prune(&mut self, now: f64, window_seconds: u64) {
        let cutoff = now - window_seconds as f64;
        while let Some(front) = self.entries.front() {
            if front.timestamp < cutoff {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn total(&self) -> u32 {
        self.entries.iter().map(|e| e.count).sum()
    }

    fn record(&mut self, now: f64) {
        match self.entries.back_mut() {
            Some(last) if last.timestamp == now => last.count += 1,
            _ => self.entries.push_back(WindowEntry {
                timestamp: now,
                count: 1,
            }),
        }
    }

    fn reset_at(&self, now: f64, window_seconds: u64) -> u64 {
        let base = self.entries.front().map(|e| e.timestamp).unwrap_or(now);
        (base + window_seconds as f64) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-identity sliding-window limiter.
///
/// Windows live in a sharded map; admitting for one identity holds only that
/// identity's entry, so unrelated callers do not serialize on each other.
pub struct RateLimiter {
    windows: DashMap<String, RateLimitWindow>,
    resolver: Arc<dyn RateLimitResolver>,
}

impl RateLimiter {
    pub fn new(resolver: Arc<dyn RateLimitResolver>) -> Self {
        Self {
            windows: DashMap::new(),
            resolver,
        }
    }

    /// Admit one request for `identity` at the current wall-clock time.
    pub fn admit(&self, identity: &str) -> (bool, RateLimitInfo) {
        self.admit_at(identity, now_epoch_secs())
    }

    /// Admit one request for `identity` at `now` (epoch seconds).
    pub fn admit_at(&self, identity: &str, now: f64) -> (bool, RateLimitInfo) {
        let policy = self.resolver.limit_for(identity);
        let limit = policy.requests_per_window;

        let mut window = self.windows.entry(identity.to_string()).or_default();
        window.prune(now, policy.window_seconds);
        let used = window.total();

        let (allowed, remaining) = if used < limit {
            window.record(now);
            (true, limit - used - 1)
        } else {
            (false, limit.saturating_sub(used))
        };

        let info = RateLimitInfo {
            limit,
            remaining,
            reset: window.reset_at(now, policy.window_seconds),
            window_seconds: policy.window_seconds,
        };
        drop(window);

        if !allowed {
            tracing::warn!(
                identity = %identity,
                limit = limit,
                reset = info.reset,
                "Rate limit exceeded"
            );
        }

        (allowed, info)
    }

    /// Current window state for `identity` without consuming a slot.
    pub fn stats(&self, identity: &str) -> RateLimitInfo {
        self.stats_at(identity, now_epoch_secs())
    }

    pub fn stats_at(&self, identity: &str, now: f64) -> RateLimitInfo {
        let policy = self.resolver.limit_for(identity);
        let (used, reset) = match self.windows.get_mut(identity) {
            Some(mut window) => {
                window.prune(now, policy.window_seconds);
                (window.total(), window.reset_at(now, policy.window_seconds))
            }
            None => (0, (now + policy.window_seconds as f64) as u64),
        };

        RateLimitInfo {
            limit: policy.requests_per_window,
            remaining: policy.requests_per_window.saturating_sub(used),
            reset,
            window_seconds: policy.window_seconds,
        }
    }

    /// Forget all history for `identity`.
    pub fn reset(&self, identity: &str) {
        self.windows.remove(identity);
    }

    pub fn tracked_identities(&self) -> usize {
        self.windows.len()
    }

    /// Prune every window and drop identities left with no entries.
    ///
    /// Returns the number of identities removed.
    pub fn purge_idle(&self, now: f64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|identity, window| {
            let policy = self.resolver.limit_for(identity);
            window.prune(now, policy.window_seconds);
            !window.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    /// Run [`purge_idle`](Self::purge_idle) every `interval` until `cancel` fires.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationSignal,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately; skip it so the first sweep happens after one interval
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = limiter.purge_idle(now_epoch_secs());
                        if removed > 0 {
                            tracing::debug!(
                                removed_count = removed,
                                remaining = limiter.tracked_identities(),
                                "Purged idle rate limit windows"
                            );
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            tracing::debug!("Rate limit cleanup task stopped");
        })
    }
}

pub(crate) fn now_epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
