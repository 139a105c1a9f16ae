/*
 * Copyright 2024 Google LLC All Rights Reserved.
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

use once_cell::sync::Lazy;
use prometheus::core::Collector;
pub use prometheus::Result;
use prometheus::{
    exponential_buckets, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
    DEFAULT_BUCKETS,
};

pub const PLUGIN_LABEL: &str = "plugin";
pub const PHASE_LABEL: &str = "phase";
pub const CODE_LABEL: &str = "code";

/// Start the histogram bucket at an eighth of a millisecond, filters are
/// expected to take well under a millisecond for each call.
const BUCKET_START: f64 = 0.000125;

const BUCKET_FACTOR: f64 = 2.5;

/// At an exponential factor of 2.5 ([`BUCKET_FACTOR`]), 11 iterations gets us
/// to just over half a second, anything slower than that is not worth
/// distinguishing.
const BUCKET_COUNT: usize = 11;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::default);

pub(crate) static FILTER_PHASE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        histogram_opts(
            "phase_duration_seconds",
            "filter",
            "Seconds taken to execute one filter method.",
            Some(exponential_buckets(BUCKET_START, BUCKET_FACTOR, BUCKET_COUNT).unwrap()),
        ),
        &[PLUGIN_LABEL, PHASE_LABEL],
    )
    .and_then(|histogram| histogram.register_if_not_exists(registry()))
    .unwrap()
});

pub(crate) static FILTER_LOCAL_REPLIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        opts(
            "local_replies_total",
            "filter",
            "Total number of local replies generated, labelled by the plugin that produced them.",
        ),
        &[PLUGIN_LABEL, CODE_LABEL],
    )
    .and_then(|counter| counter.register_if_not_exists(registry()))
    .unwrap()
});

/// The registry every metric of this crate is registered with.
pub fn registry() -> &'static Registry {
    &REGISTRY
}

pub fn opts(name: &str, subsystem: &str, description: &str) -> Opts {
    Opts::new(name, description)
        .namespace("tollgate")
        .subsystem(subsystem)
}

pub fn histogram_opts(
    name: &str,
    subsystem: &str,
    description: &str,
    buckets: Option<Vec<f64>>,
) -> HistogramOpts {
    HistogramOpts {
        common_opts: opts(name, subsystem, description),
        buckets: buckets.unwrap_or(Vec::from(DEFAULT_BUCKETS as &'static [f64])),
    }
}

pub trait CollectorExt: Collector + Clone + Sized + 'static {
    fn register_if_not_exists(self, registry: &Registry) -> Result<Self> {
        match registry.register(Box::new(self.clone())) {
            Ok(_) | Err(prometheus::Error::AlreadyReg) => Ok(self),
            // A collector with the same descriptor but different help text is
            // reported as a plain message rather than `AlreadyReg`.
            Err(prometheus::Error::Msg(msg)) if msg.contains("already exists") => Ok(self),
            Err(err) => Err(err),
        }
    }
}

impl<C: Collector + Clone + 'static> CollectorExt for C {}
