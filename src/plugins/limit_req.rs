/*
 * Copyright 2024 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use prometheus::IntCounter;
use serde::{Deserialize, Deserializer, Serialize};

use crate::filters::prelude::*;
use crate::metrics::{opts, CollectorExt};
use crate::plugins::FilterFactory;

pub const NAME: &str = "limitReq";

static REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::with_opts(opts(
        "rejected_total",
        "limit_req",
        "Total number of requests rejected due to rate limiting",
    ))
    .unwrap()
});

/// Limits the request rate per key with a token bucket. Requests over the
/// rate are delayed while the delay stays short, and rejected with `429`
/// otherwise.
pub struct LimitReq;

impl Plugin for LimitReq {
    fn category(&self) -> Category {
        Category::Traffic
    }

    fn order(&self) -> PluginOrder {
        PluginOrder::new(OrderPosition::Traffic)
    }

    fn filter_factory(&self) -> Option<Arc<dyn FilterFactory>> {
        Some(Self::factory())
    }

    fn register_metrics(&self, registry: &prometheus::Registry) -> prometheus::Result<()> {
        REJECTED.clone().register_if_not_exists(registry).map(drop)
    }
}

impl FilterPlugin for LimitReq {
    type Config = Config;

    fn create_filter(config: Arc<Config>, callbacks: Arc<FilterCallbackHandler>) -> Box<dyn Filter> {
        Box::new(LimitReqFilter { config, callbacks })
    }
}

/// Config represents [`LimitReq`]'s configuration.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Requests allowed per `period`.
    #[serde(default)]
    pub average: u32,
    /// The duration `average` applies to, either seconds as a number or a
    /// string such as `"0.5s"`. Defaults to one second.
    #[serde(default, deserialize_with = "deserialize_period", skip_serializing)]
    pub period: Option<Duration>,
    /// How many requests may exceed the rate at once. Defaults to `1`.
    #[serde(default)]
    pub burst: u32,
    /// Header whose value the request is limited by. The client address is
    /// used when unset or when the header is missing.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(skip)]
    limiter: OnceCell<Limiter>,
}

impl PartialEq for Config {
    fn eq(&self, other: &Self) -> bool {
        self.average == other.average
            && self.period == other.period
            && self.burst == other.burst
            && self.key == other.key
    }
}

impl PluginConfig for Config {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.average == 0 {
            return Err(ValidationError::invalid("average", "value must be greater than 0"));
        }
        if self.period.is_some_and(|period| period.is_zero()) {
            return Err(ValidationError::invalid("period", "value must be greater than 0s"));
        }
        if let Some(key) = &self.key {
            if http::HeaderName::try_from(key.as_str()).is_err() {
                return Err(ValidationError::invalid(
                    "key",
                    format!("{key:?} is not a valid header name"),
                ));
            }
        }
        Ok(())
    }

    fn init(&self) -> crate::Result<()> {
        let limiter = self.limiter();
        tracing::debug!(rate = limiter.rate, max_delay = ?limiter.max_delay, "limitReq initialized");
        Ok(())
    }
}

impl Config {
    fn limiter(&self) -> &Limiter {
        self.limiter.get_or_init(|| {
            Limiter::new(
                self.average,
                self.period.unwrap_or(Duration::from_secs(1)),
                self.burst.max(1),
            )
        })
    }
}

fn deserialize_period<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Period {
        Seconds(f64),
        Text(String),
    }

    let seconds = match Option::<Period>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(Period::Seconds(seconds)) => seconds,
        Some(Period::Text(text)) => text
            .strip_suffix('s')
            .and_then(|seconds| seconds.parse::<f64>().ok())
            .ok_or_else(|| {
                serde::de::Error::custom(format!("invalid duration {text:?}, expected e.g. \"1.5s\""))
            })?,
    };

    Duration::try_from_secs_f64(seconds)
        .map(Some)
        .map_err(serde::de::Error::custom)
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    updated: Instant,
}

/// Token buckets keyed by the limited value. Buckets unused for longer than
/// `ttl` are swept on access.
#[derive(Debug)]
struct Limiter {
    /// Tokens per second.
    rate: f64,
    burst: f64,
    max_delay: Duration,
    ttl: Duration,
    buckets: DashMap<String, Bucket>,
    last_sweep: Mutex<Instant>,
}

/// Outcome of taking a token.
#[derive(Debug, PartialEq)]
enum Reservation {
    Ready(Duration),
    Rejected,
}

impl Limiter {
    fn new(average: u32, period: Duration, burst: u32) -> Self {
        let rate = f64::from(average) / period.as_secs_f64();

        let (max_delay, ttl) = if rate < 1.0 {
            (
                Duration::from_millis(500),
                Duration::from_secs(1) + Duration::from_secs_f64(1.0 / rate),
            )
        } else {
            (
                Duration::from_secs_f64(1.0 / (2.0 * rate)),
                Duration::from_secs(2),
            )
        };

        Self {
            rate,
            burst: f64::from(burst),
            max_delay,
            ttl,
            buckets: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    fn reserve(&self, key: &str) -> Reservation {
        self.reserve_at(key, Instant::now())
    }

    fn reserve_at(&self, key: &str, now: Instant) -> Reservation {
        self.sweep(now);

        let mut bucket = self.buckets.entry(key.to_owned()).or_insert_with(|| Bucket {
            tokens: self.burst,
            updated: now,
        });

        let elapsed = now.saturating_duration_since(bucket.updated).as_secs_f64();
        let tokens = (bucket.tokens + elapsed * self.rate).min(self.burst) - 1.0;
        let delay = if tokens < 0.0 {
            Duration::from_secs_f64(-tokens / self.rate)
        } else {
            Duration::ZERO
        };

        if delay > self.max_delay {
            // The reservation is cancelled, only the refill is kept.
            bucket.tokens = tokens + 1.0;
            bucket.updated = now;
            return Reservation::Rejected;
        }

        bucket.tokens = tokens;
        bucket.updated = now;
        Reservation::Ready(delay)
    }

    fn sweep(&self, now: Instant) {
        let mut last_sweep = self.last_sweep.lock();
        if now.saturating_duration_since(*last_sweep) < self.ttl {
            return;
        }
        *last_sweep = now;
        drop(last_sweep);

        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.updated) < self.ttl);
    }
}

struct LimitReqFilter {
    config: Arc<Config>,
    callbacks: Arc<FilterCallbackHandler>,
}

impl LimitReqFilter {
    fn key(&self, headers: &HeaderMap) -> String {
        let from_header = self
            .config
            .key
            .as_deref()
            .and_then(|name| headers.get(name))
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty());

        match from_header {
            Some(value) => value.to_owned(),
            None => {
                if self.config.key.is_some() {
                    tracing::info!("limitReq uses client IP as key because the configured key is empty");
                }
                self.callbacks
                    .stream_info()
                    .downstream_remote_address
                    .map(|address| address.ip().to_string())
                    .unwrap_or_default()
            }
        }
    }
}

impl Filter for LimitReqFilter {
    fn decode_headers(&mut self, headers: &mut HeaderMap, _: bool) -> ResultAction {
        let key = self.key(headers);
        let reservation = self.config.limiter().reserve(&key);
        tracing::debug!(%key, ?reservation, "limitReq filter");

        match reservation {
            Reservation::Rejected => {
                REJECTED.inc();
                LocalResponse::new(429).into()
            }
            Reservation::Ready(delay) => {
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                ResultAction::Continue
            }
        }
    }
}
