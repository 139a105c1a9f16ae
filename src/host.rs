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

//! Glue between a host proxy's per-stream callbacks and the [`FilterManager`].
//!
//! Phases every filter declared non-blocking run on the host's thread. Any
//! other phase is moved onto the runtime's blocking pool, the host is told
//! the stream is [`Status::Running`], and the outcome is reported back
//! through [`HostCallbacks`] once it is known. The host's thread never waits
//! on a phase running on the pool.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use bytes::BytesMut;
use http::HeaderMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::{
    filters::{AtomicPhase, FilterCallbackHandler, Phase, StreamInfo},
    manager::{Direction, FilterManager, FilterManagerFactory, LocalReply, PhaseOutcome},
};

/// Headers shared between the host and the filter manager.
pub type SharedHeaderMap = Arc<Mutex<HeaderMap>>;
/// A body buffer shared between the host and the filter manager. Holds the
/// whole body received so far while the stream is buffering.
pub type SharedBuffer = Arc<Mutex<BytesMut>>;

/// What a host callback returns to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Continue,
    StopAndBuffer,
    /// The phase is running elsewhere, wait for
    /// [`HostCallbacks::continue_stream`] or
    /// [`HostCallbacks::send_local_reply`].
    Running,
    /// A reply has been sent with [`HostCallbacks::send_local_reply`].
    LocalReply,
}

/// Calls into the host for one stream.
pub trait HostCallbacks: Send + Sync + 'static {
    /// Resumes a stream which was left [`Status::Running`].
    fn continue_stream(&self, direction: Direction, status: Status);

    fn send_local_reply(
        &self,
        code: u16,
        body: String,
        headers: HeaderMap,
        grpc_status: Option<i32>,
        details: &str,
    );
}

/// The host facing filter of one stream.
pub struct HttpFilter {
    manager: Arc<Mutex<FilterManager>>,
    callbacks: Arc<FilterCallbackHandler>,
    non_blocking: Arc<AtomicPhase>,
    host: Arc<dyn HostCallbacks>,
    runtime: Handle,
    span: tracing::Span,
}

impl HttpFilter {
    pub fn new(
        factory: &FilterManagerFactory,
        stream_info: StreamInfo,
        host: Arc<dyn HostCallbacks>,
        runtime: Handle,
    ) -> Self {
        let span = tracing::debug_span!("stream", route = %stream_info.route_name);
        let manager = span.in_scope(|| factory.create(stream_info));

        Self {
            callbacks: manager.callbacks().clone(),
            non_blocking: manager.shared_non_blocking_phases(),
            manager: Arc::new(Mutex::new(manager)),
            host,
            runtime,
            span,
        }
    }

    pub fn callbacks(&self) -> &Arc<FilterCallbackHandler> {
        &self.callbacks
    }

    pub fn decode_headers(&self, headers: SharedHeaderMap, end_stream: bool) -> Status {
        self.dispatch(Direction::Decode, Phase::DECODE_HEADERS, move |manager| {
            manager.decode_headers(&headers, end_stream)
        })
    }

    pub fn decode_data(&self, data: SharedBuffer, end_stream: bool) -> Status {
        self.dispatch(Direction::Decode, Phase::DECODE_DATA, move |manager| {
            manager.decode_data(&data, end_stream)
        })
    }

    // TODO: hand trailers to the filters once `Filter` has trailer hooks.
    pub fn decode_trailers(&self, _trailers: SharedHeaderMap) -> Status {
        Status::Continue
    }

    pub fn encode_headers(&self, headers: SharedHeaderMap, end_stream: bool) -> Status {
        self.dispatch(Direction::Encode, Phase::ENCODE_HEADERS, move |manager| {
            manager.encode_headers(&headers, end_stream)
        })
    }

    pub fn encode_data(&self, data: SharedBuffer, end_stream: bool) -> Status {
        self.dispatch(Direction::Encode, Phase::ENCODE_DATA, move |manager| {
            manager.encode_data(&data, end_stream)
        })
    }

    pub fn encode_trailers(&self, _trailers: SharedHeaderMap) -> Status {
        Status::Continue
    }

    /// Runs the filters' log hooks. Nothing is reported to the host.
    pub fn on_log(&self) {
        if self.non_blocking(Phase::ON_LOG) {
            if let Some(mut manager) = self.manager.try_lock() {
                self.span.in_scope(|| log_guarded(&mut manager));
                return;
            }
        }

        let manager = self.manager.clone();
        let span = self.span.clone();
        drop(
            self.runtime
                .spawn_blocking(move || span.in_scope(|| log_guarded(&mut manager.lock()))),
        );
    }

    /// The host has torn the stream down. Work still queued for it is
    /// dropped.
    pub fn on_destroy(&self) {
        tracing::trace!(parent: &self.span, "stream destroyed");
        self.callbacks.cancel();
    }

    fn non_blocking(&self, phase: Phase) -> bool {
        self.non_blocking.load().contains(phase)
    }

    fn dispatch(
        &self,
        direction: Direction,
        phase: Phase,
        run: impl FnOnce(&mut FilterManager) -> PhaseOutcome + Send + 'static,
    ) -> Status {
        // A phase still running on the pool holds the manager, in which case
        // this one queues up behind it.
        if self.non_blocking(phase) {
            if let Some(mut manager) = self.manager.try_lock() {
                let outcome = self
                    .span
                    .in_scope(|| run_guarded(&mut manager, direction, run));
                drop(manager);
                return match outcome {
                    PhaseOutcome::Continue => Status::Continue,
                    PhaseOutcome::StopAndBuffer => Status::StopAndBuffer,
                    PhaseOutcome::LocalReply(reply) => {
                        send_local_reply(&*self.host, reply);
                        Status::LocalReply
                    }
                };
            }
        }

        let manager = self.manager.clone();
        let callbacks = self.callbacks.clone();
        let host = self.host.clone();
        let span = self.span.clone();
        drop(self.runtime.spawn_blocking(move || {
            let _entered = span.enter();
            if callbacks.is_cancelled() {
                tracing::debug!(phase = phase.name(), "stream gone, phase skipped");
                return;
            }

            match run_guarded(&mut manager.lock(), direction, run) {
                PhaseOutcome::Continue => host.continue_stream(direction, Status::Continue),
                PhaseOutcome::StopAndBuffer => {
                    host.continue_stream(direction, Status::StopAndBuffer)
                }
                PhaseOutcome::LocalReply(reply) => send_local_reply(&*host, reply),
            }
        }));

        Status::Running
    }
}

/// Runs a phase, turning a panic anywhere in the filters into a `500` which
/// ends `direction`.
fn run_guarded(
    manager: &mut FilterManager,
    direction: Direction,
    run: impl FnOnce(&mut FilterManager) -> PhaseOutcome,
) -> PhaseOutcome {
    match catch_unwind(AssertUnwindSafe(|| run(&mut *manager))) {
        Ok(outcome) => outcome,
        Err(panic) => {
            tracing::error!(panic = crate::panic_message(&*panic), "error in plugin");
            PhaseOutcome::LocalReply(manager.abort(direction))
        }
    }
}

fn log_guarded(manager: &mut FilterManager) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| manager.on_log())) {
        tracing::error!(panic = crate::panic_message(&*panic), "panic in on_log");
    }
}

fn send_local_reply(host: &dyn HostCallbacks, reply: LocalReply) {
    host.send_local_reply(reply.code, reply.body, reply.headers, None, "");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{load_test_plugins, shared_buffer, shared_headers, HostEvent, MockHost};
    use crate::manager::{FilterManagerConfig, FilterManagerSpec};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn http_filter(plugins: serde_json::Value) -> (HttpFilter, MockHost) {
        load_test_plugins();
        let spec = FilterManagerSpec {
            namespace: "host-test".into(),
            plugins: serde_json::from_value(plugins).unwrap(),
        };
        let factory = FilterManagerFactory::new(FilterManagerConfig::from_spec(&spec));
        let host = MockHost::new();
        let filter = HttpFilter::new(
            &factory,
            StreamInfo::default(),
            Arc::new(host.clone()),
            Handle::current(),
        );
        (filter, host)
    }

    #[tokio::test]
    async fn non_blocking_phase_runs_inline() {
        let (filter, host) = http_filter(json!([{"name": "stream"}]));
        let headers = shared_headers(&[]);

        assert_eq!(Status::Continue, filter.decode_headers(headers.clone(), true));
        assert_eq!("stream", headers.lock()["run"]);
        assert!(host.try_event().is_none());
    }

    #[tokio::test]
    async fn blocking_phase_reports_back() {
        let (filter, host) = http_filter(json!([{"name": "buffer", "config": {"need": true}}]));
        let headers = shared_headers(&[]);

        assert_eq!(Status::Running, filter.decode_headers(headers.clone(), false));
        assert_eq!(
            HostEvent::Continue(Direction::Decode, Status::StopAndBuffer),
            host.event().await
        );
    }

    #[tokio::test]
    async fn local_reply_is_sent_to_host() {
        let (filter, host) = http_filter(json!([
            {"name": "stream"},
            {"name": "localReply", "config": {"decode": true}},
        ]));

        // `localReply` is non-blocking as well, so the reply is immediate.
        assert_eq!(Status::LocalReply, filter.decode_headers(shared_headers(&[]), true));
        let Some(HostEvent::LocalReply { code, body, .. }) = host.try_event() else {
            panic!("expected a local reply");
        };
        assert_eq!(206, code);
        assert_eq!(r#"{"msg":"ok"}"#, body);
    }

    #[tokio::test]
    async fn panic_becomes_internal_error() {
        let (filter, host) = http_filter(json!([{"name": "panic"}]));

        assert_eq!(Status::Running, filter.decode_headers(shared_headers(&[]), true));
        let HostEvent::LocalReply { code, .. } = host.event().await else {
            panic!("expected a local reply");
        };
        assert_eq!(500, code);

        // The request direction is over, the panicking filter is not run
        // again.
        assert_eq!(Status::Running, filter.decode_headers(shared_headers(&[]), true));
        assert_eq!(
            HostEvent::Continue(Direction::Decode, Status::Continue),
            host.event().await
        );
        assert_eq!(Status::Running, filter.decode_data(shared_buffer(""), true));
        assert_eq!(
            HostEvent::Continue(Direction::Decode, Status::Continue),
            host.event().await
        );
    }

    #[tokio::test]
    async fn slow_phase_does_not_block_host() {
        let (filter, host) = http_filter(json!([{"name": "slow"}]));
        filter
            .callbacks()
            .set_plugin_state("test", "on_log", Mutex::new(Vec::<String>::new()));

        assert_eq!(Status::Running, filter.decode_headers(shared_headers(&[]), true));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        filter.on_destroy();
        filter.on_log();
        assert!(started.elapsed() < Duration::from_millis(100));

        assert_eq!(
            HostEvent::Continue(Direction::Decode, Status::Continue),
            host.event().await
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        let logged = filter
            .callbacks()
            .plugin_state::<Mutex<Vec<String>>>("test", "on_log")
            .unwrap();
        assert_eq!(vec!["slow"], *logged.lock());
    }

    #[tokio::test]
    async fn non_blocking_phase_waits_for_running_one() {
        let (filter, host) = http_filter(json!([{"name": "stream"}]));
        let headers = shared_headers(&[]);

        let manager = filter.manager.clone();
        let held = manager.lock();
        assert_eq!(Status::Running, filter.decode_headers(headers.clone(), true));
        assert!(host.try_event().is_none());
        drop(held);

        assert_eq!(
            HostEvent::Continue(Direction::Decode, Status::Continue),
            host.event().await
        );
        assert_eq!("stream", headers.lock()["run"]);
    }

    #[tokio::test]
    async fn destroyed_stream_skips_queued_phase() {
        let (filter, host) = http_filter(json!([{"name": "buffer", "config": {"need": true}}]));

        filter.on_destroy();
        assert_eq!(Status::Running, filter.decode_headers(shared_headers(&[]), false));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(host.try_event().is_none());
        assert!(filter.callbacks().is_cancelled());
    }
}
