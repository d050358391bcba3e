//! Rate limiting: token bucket, sliding window, or fixed window per key
//! (authenticated principal or client address). State is shared across
//! all workers and swept for idle keys periodically.

use dashmap::DashMap;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use torii_core::GatewayError;
use torii_http::Request;
use torii_middleware::{Flow, Middleware, MiddlewareInstance, RequestContext};
use torii_observability::Metrics;

pub struct RateLimitMiddleware {
    metrics: Arc<Metrics>,
}

impl RateLimitMiddleware {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

#[derive(Debug, Deserialize, Clone)]
struct RateLimitConfig {
    #[serde(default)]
    algorithm: Algorithm,

    max_requests: u64,

    window_ms: u64,

    #[serde(default)]
    key_by: KeyBy,

    /// Emit `x-ratelimit-*` headers on denials.
    #[serde(default = "default_true")]
    expose_headers: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
enum Algorithm {
    #[default]
    TokenBucket,
    SlidingWindow,
    FixedWindow,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
enum KeyBy {
    /// Authenticated principal id, falling back to the client address.
    Principal,
    #[default]
    ClientIp,
}

impl KeyBy {
    fn class(&self) -> &'static str {
        match self {
            KeyBy::Principal => "principal",
            KeyBy::ClientIp => "client_ip",
        }
    }
}

fn default_true() -> bool {
    true
}

impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn default_priority(&self) -> i32 {
        30
    }

    fn configure(
        &self,
        config: &serde_json::Value,
    ) -> anyhow::Result<Arc<dyn MiddlewareInstance>> {
        let cfg: RateLimitConfig = serde_json::from_value(config.clone())
            .map_err(|e| anyhow::anyhow!("rate_limit config: {e}"))?;
        if cfg.max_requests == 0 || cfg.window_ms == 0 {
            anyhow::bail!("rate_limit: max_requests and window_ms must be positive");
        }
        Ok(Arc::new(RateLimitInstance {
            cfg,
            epoch: Instant::now(),
            keys: DashMap::new(),
            metrics: Arc::clone(&self.metrics),
        }))
    }
}

struct KeyEntry {
    state: KeyState,
    last_seen: Instant,
}

enum KeyState {
    Bucket { tokens: f64, last_refill: Instant },
    Sliding { timestamps: VecDeque<Instant> },
    Fixed { window_index: u64, count: u64 },
}

#[derive(Debug, PartialEq)]
enum Decision {
    Allowed,
    Denied { retry_after_secs: u64 },
}

pub struct RateLimitInstance {
    cfg: RateLimitConfig,
    /// Baseline for fixed-window bucketing.
    epoch: Instant,
    keys: DashMap<String, KeyEntry>,
    metrics: Arc<Metrics>,
}

impl RateLimitInstance {
    fn window(&self) -> Duration {
        Duration::from_millis(self.cfg.window_ms)
    }

    /// Tokens per second the bucket refills at.
    fn refill_rate(&self) -> f64 {
        self.cfg.max_requests as f64 / self.window().as_secs_f64()
    }

    fn check(&self, key: &str, now: Instant) -> Decision {
        let mut entry = self.keys.entry(key.to_string()).or_insert_with(|| KeyEntry {
            state: self.fresh_state(now),
            last_seen: now,
        });
        entry.last_seen = now;
        match &mut entry.state {
            KeyState::Bucket { tokens, last_refill } => {
                let rate = self.refill_rate();
                let elapsed = now.duration_since(*last_refill).as_secs_f64();
                *tokens = (*tokens + elapsed * rate).min(self.cfg.max_requests as f64);
                *last_refill = now;
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    Decision::Allowed
                } else {
                    let deficit = 1.0 - *tokens;
                    Decision::Denied {
                        retry_after_secs: (deficit / rate).ceil().max(1.0) as u64,
                    }
                }
            }
            KeyState::Sliding { timestamps } => {
                let window = self.window();
                while let Some(front) = timestamps.front() {
                    if now.duration_since(*front) >= window {
                        timestamps.pop_front();
                    } else {
                        break;
                    }
                }
                if (timestamps.len() as u64) < self.cfg.max_requests {
                    timestamps.push_back(now);
                    Decision::Allowed
                } else {
                    let oldest = *timestamps.front().expect("non-empty at limit");
                    let until_free = window.saturating_sub(now.duration_since(oldest));
                    Decision::Denied {
                        retry_after_secs: (until_free.as_secs_f64().ceil() as u64).max(1),
                    }
                }
            }
            KeyState::Fixed { window_index, count } => {
                let window = self.window();
                let since_epoch = now.duration_since(self.epoch);
                let index = (since_epoch.as_millis() / window.as_millis()) as u64;
                if index != *window_index {
                    *window_index = index;
                    *count = 0;
                }
                if *count < self.cfg.max_requests {
                    *count += 1;
                    Decision::Allowed
                } else {
                    let into_window = since_epoch.as_millis() % window.as_millis();
                    let remaining_ms = window.as_millis() - into_window;
                    Decision::Denied {
                        retry_after_secs: ((remaining_ms as f64 / 1000.0).ceil() as u64).max(1),
                    }
                }
            }
        }
    }

    fn fresh_state(&self, now: Instant) -> KeyState {
        match self.cfg.algorithm {
            Algorithm::TokenBucket => KeyState::Bucket {
                tokens: self.cfg.max_requests as f64,
                last_refill: now,
            },
            Algorithm::SlidingWindow => KeyState::Sliding {
                timestamps: VecDeque::with_capacity(self.cfg.max_requests as usize),
            },
            Algorithm::FixedWindow => KeyState::Fixed {
                window_index: 0,
                count: 0,
            },
        }
    }

    fn key_for(&self, ctx: &RequestContext) -> String {
        match self.cfg.key_by {
            KeyBy::Principal => ctx
                .principal
                .as_ref()
                .map(|p| p.id.clone())
                .unwrap_or_else(|| ctx.client_ip()),
            KeyBy::ClientIp => ctx.client_ip(),
        }
    }
}

impl MiddlewareInstance for RateLimitInstance {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn on_request(&self, ctx: &mut RequestContext, _req: &mut Request) -> Flow {
        let key = self.key_for(ctx);
        let class = self.cfg.key_by.class();
        match self.check(&key, Instant::now()) {
            Decision::Allowed => {
                self.metrics.ratelimit_allowed.with_label_values(&[class]).inc();
                Flow::Continue
            }
            Decision::Denied { retry_after_secs } => {
                self.metrics.ratelimit_denied.with_label_values(&[class]).inc();
                let mut resp = GatewayError::RateLimited { retry_after_secs }.to_response();
                if self.cfg.expose_headers {
                    resp.headers
                        .set("x-ratelimit-limit", self.cfg.max_requests.to_string());
                    resp.headers.set("x-ratelimit-remaining", "0");
                }
                Flow::Respond(resp)
            }
        }
    }

    /// Drop keys idle for more than two windows (at least a minute).
    fn sweep(&self) {
        let now = Instant::now();
        let idle_cutoff = (self.window() * 2).max(Duration::from_secs(60));
        self.keys
            .retain(|_, entry| now.duration_since(entry.last_seen) < idle_cutoff);
    }
}
