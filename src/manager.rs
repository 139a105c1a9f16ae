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

//! The per-request filter manager and the factory creating it.

mod config;

use std::{sync::Arc, time::Instant};

use bytes::BytesMut;
use http::{header::CONTENT_TYPE, HeaderMap, HeaderValue};

pub use self::config::{FilterManagerConfig, FilterManagerSpec, ParsedFilterConfig, PluginEntry};

use crate::{
    filters::{
        AtomicPhase, Filter, FilterCallbackHandler, LocalResponse, LogExecution, Phase,
        ResultAction, StreamInfo,
    },
    host::{SharedBuffer, SharedHeaderMap},
    metrics::{FILTER_LOCAL_REPLIES, FILTER_PHASE_DURATION},
    plugins::PluginRegistry,
};

/// The direction a phase runs in. Decode walks the chain front to back,
/// encode back to front.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The request.
    Decode,
    /// The response.
    Encode,
}

impl Direction {
    const fn headers_phase(self) -> Phase {
        match self {
            Self::Decode => Phase::DECODE_HEADERS,
            Self::Encode => Phase::ENCODE_HEADERS,
        }
    }

    const fn data_phase(self) -> Phase {
        match self {
            Self::Decode => Phase::DECODE_DATA,
            Self::Encode => Phase::ENCODE_DATA,
        }
    }

    const fn whole_phase(self) -> Phase {
        match self {
            Self::Decode => Phase::DECODE_REQUEST,
            Self::Encode => Phase::ENCODE_RESPONSE,
        }
    }
}

/// What the host is asked to do once a phase has run.
#[derive(Clone, Debug, PartialEq)]
pub enum PhaseOutcome {
    /// Forward what was processed and deliver the next event.
    Continue,
    /// Hold the body back and deliver it once it has been received
    /// completely.
    StopAndBuffer,
    /// Stop the stream and answer with this reply instead.
    LocalReply(LocalReply),
}

/// A normalized local response, ready for the host.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalReply {
    /// Never `0`.
    pub code: u16,
    pub body: String,
    /// At most one value per header name.
    pub headers: HeaderMap,
}

/// Creates a [`FilterManager`] per request from one parsed configuration.
#[derive(Clone, Debug)]
pub struct FilterManagerFactory {
    config: Arc<FilterManagerConfig>,
    non_blocking: Phase,
    log_execution: bool,
}

impl FilterManagerFactory {
    pub fn new(config: impl Into<Arc<FilterManagerConfig>>) -> Self {
        let config = config.into();
        let non_blocking = config
            .filters()
            .iter()
            .fold(Phase::ALL, |phases, filter| phases & filter.non_blocking_phases());

        Self {
            config,
            non_blocking,
            log_execution: tracing::enabled!(tracing::Level::DEBUG),
        }
    }

    /// Forces the logging of every filter method call on or off.
    pub fn with_execution_logging(mut self, enabled: bool) -> Self {
        self.log_execution = enabled;
        self
    }

    pub fn config(&self) -> &Arc<FilterManagerConfig> {
        &self.config
    }

    /// The phases every filter of the chain can run in without being moved
    /// off the host's thread.
    pub fn non_blocking_phases(&self) -> Phase {
        self.non_blocking
    }

    /// Creates the filters of one request.
    pub fn create(&self, stream_info: StreamInfo) -> FilterManager {
        let callbacks = Arc::new(FilterCallbackHandler::new(
            self.config.namespace(),
            stream_info,
        ));

        let mut filters: Vec<_> = self
            .config
            .filters()
            .iter()
            .map(|config| FilterEntry::create(config, &callbacks, self.log_execution))
            .collect();
        let consumer_filters = filters
            .drain(..self.config.consumer_filters_end_at().min(filters.len()))
            .collect();

        FilterManager {
            filters,
            consumer_filters,
            callbacks,
            non_blocking: Arc::new(AtomicPhase::new(self.non_blocking)),
            log_execution: self.log_execution,
            decode: StreamState::default(),
            encode: StreamState::default(),
            logged: false,
        }
    }
}

impl Default for FilterManagerFactory {
    fn default() -> Self {
        Self::new(FilterManagerConfig::default())
    }
}

/// A filter manager's filter, with the name of the plugin producing it.
struct FilterEntry {
    name: String,
    filter: Box<dyn Filter>,
}

/// A filter returned something other than `Continue`.
#[derive(Debug)]
struct Rejection {
    plugin: String,
    response: LocalResponse,
}

impl FilterEntry {
    fn create(
        config: &ParsedFilterConfig,
        callbacks: &Arc<FilterCallbackHandler>,
        log_execution: bool,
    ) -> Self {
        let filter = config.create_filter(callbacks.clone());
        let filter: Box<dyn Filter> = if log_execution {
            Box::new(LogExecution::new(config.name(), filter))
        } else {
            filter
        };

        Self {
            name: config.name().to_owned(),
            filter,
        }
    }

    fn timed(
        &mut self,
        phase: Phase,
        call: impl FnOnce(&mut dyn Filter) -> ResultAction,
    ) -> Result<(), Rejection> {
        let start = Instant::now();
        let action = call(&mut *self.filter);
        FILTER_PHASE_DURATION
            .with_label_values(&[&self.name, phase.name()])
            .observe(start.elapsed().as_secs_f64());

        match action {
            ResultAction::Continue => Ok(()),
            ResultAction::LocalResponse(response) => Err(Rejection {
                plugin: self.name.clone(),
                response,
            }),
        }
    }

    fn needs_whole(&self, direction: Direction, headers: &HeaderMap) -> bool {
        match direction {
            Direction::Decode => self.filter.need_decode_whole_request(headers),
            Direction::Encode => self.filter.need_encode_whole_response(headers),
        }
    }

    fn headers(
        &mut self,
        direction: Direction,
        headers: &mut HeaderMap,
        end_stream: bool,
    ) -> Result<(), Rejection> {
        self.timed(direction.headers_phase(), |filter| match direction {
            Direction::Decode => filter.decode_headers(headers, end_stream),
            Direction::Encode => filter.encode_headers(headers, end_stream),
        })
    }

    fn data(
        &mut self,
        direction: Direction,
        data: &mut BytesMut,
        end_stream: bool,
    ) -> Result<(), Rejection> {
        self.timed(direction.data_phase(), |filter| match direction {
            Direction::Decode => filter.decode_data(data, end_stream),
            Direction::Encode => filter.encode_data(data, end_stream),
        })
    }

    fn whole(
        &mut self,
        direction: Direction,
        headers: &mut HeaderMap,
        data: Option<&mut BytesMut>,
    ) -> Result<(), Rejection> {
        self.timed(direction.whole_phase(), |filter| match direction {
            Direction::Decode => filter.decode_request(headers, data),
            Direction::Encode => filter.encode_response(headers, data),
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum StreamPhase {
    #[default]
    Idle,
    Headers,
    Data,
    Done,
}

/// Per direction state of a request.
#[derive(Debug, Default)]
struct StreamState {
    phase: StreamPhase,
    /// Position, in walk order, of the filter waiting for the whole body.
    buffer_index: Option<usize>,
    headers: Option<SharedHeaderMap>,
}

/// The chain as walked in one direction. Position `0` is the first filter
/// to run in that direction.
struct Chain<'a> {
    filters: &'a mut [FilterEntry],
    direction: Direction,
}

impl Chain<'_> {
    fn len(&self) -> usize {
        self.filters.len()
    }

    fn get(&mut self, position: usize) -> &mut FilterEntry {
        let index = match self.direction {
            Direction::Decode => position,
            Direction::Encode => self.filters.len() - 1 - position,
        };
        &mut self.filters[index]
    }

    fn run_headers(
        &mut self,
        state: &mut StreamState,
        headers: &mut HeaderMap,
        end_stream: bool,
    ) -> Result<PhaseOutcome, Rejection> {
        let direction = self.direction;

        for position in 0..self.len() {
            let entry = self.get(position);
            if !entry.needs_whole(direction, headers) {
                entry.headers(direction, headers, end_stream)?;
                continue;
            }

            if !end_stream {
                tracing::debug!(plugin = %entry.name, ?direction, "wait for the whole body");
                state.buffer_index = Some(position);
                return Ok(PhaseOutcome::StopAndBuffer);
            }

            // Nothing to wait for.
            entry.whole(direction, headers, None)?;
        }

        Ok(PhaseOutcome::Continue)
    }

    fn run_data(
        &mut self,
        state: &mut StreamState,
        headers: &mut HeaderMap,
        data: &mut BytesMut,
        end_stream: bool,
    ) -> Result<PhaseOutcome, Rejection> {
        let direction = self.direction;
        let len = self.len();

        let Some(buffer_index) = state.buffer_index else {
            for position in 0..len {
                self.get(position).data(direction, data, end_stream)?;
            }
            return Ok(PhaseOutcome::Continue);
        };

        if !end_stream {
            return Ok(PhaseOutcome::StopAndBuffer);
        }

        // Filters before the buffering one have streamed since the headers.
        for position in 0..buffer_index {
            self.get(position).data(direction, data, end_stream)?;
        }
        self.get(buffer_index).whole(direction, headers, Some(data))?;

        // The remaining filters have not seen the headers yet. Each run of
        // streaming filters gets the headers then the body, up to the next
        // filter needing the whole body.
        let mut position = buffer_index + 1;
        while position < len {
            let start = position;
            let mut next_buffer = None;

            while position < len {
                let entry = self.get(position);
                if entry.needs_whole(direction, headers) {
                    next_buffer = Some(position);
                    break;
                }
                entry.headers(direction, headers, false)?;
                position += 1;
            }

            for streaming in start..position {
                self.get(streaming).data(direction, data, end_stream)?;
            }

            if let Some(next) = next_buffer {
                state.buffer_index = Some(next);
                self.get(next).whole(direction, headers, Some(data))?;
                position = next + 1;
            }
        }

        Ok(PhaseOutcome::Continue)
    }
}

/// Drives the filters of one request through its phases.
///
/// Each phase method runs synchronously and tells the host how to proceed.
/// Whether it runs on the host's thread or a worker is decided by the host
/// integration in [`crate::host`].
pub struct FilterManager {
    filters: Vec<FilterEntry>,
    /// Filters identifying the consumer, run ahead of the rest of the chain.
    consumer_filters: Vec<FilterEntry>,
    callbacks: Arc<FilterCallbackHandler>,
    non_blocking: Arc<AtomicPhase>,
    log_execution: bool,
    decode: StreamState,
    encode: StreamState,
    logged: bool,
}

impl FilterManager {
    pub fn callbacks(&self) -> &Arc<FilterCallbackHandler> {
        &self.callbacks
    }

    /// The phases which can run on the host's thread. Can shrink once the
    /// consumer's own filters have been added.
    pub fn non_blocking_phases(&self) -> Phase {
        self.non_blocking.load()
    }

    /// The same set as [`Self::non_blocking_phases`], readable without
    /// access to the manager.
    pub fn shared_non_blocking_phases(&self) -> Arc<AtomicPhase> {
        self.non_blocking.clone()
    }

    /// Names of the filters in chain order, without the consumer stage.
    pub fn filter_names(&self) -> Vec<&str> {
        self.filters.iter().map(|entry| entry.name.as_str()).collect()
    }

    pub fn decode_headers(&mut self, headers: &SharedHeaderMap, end_stream: bool) -> PhaseOutcome {
        self.headers(Direction::Decode, headers, end_stream)
    }

    pub fn decode_data(&mut self, data: &SharedBuffer, end_stream: bool) -> PhaseOutcome {
        self.data(Direction::Decode, data, end_stream)
    }

    pub fn encode_headers(&mut self, headers: &SharedHeaderMap, end_stream: bool) -> PhaseOutcome {
        self.headers(Direction::Encode, headers, end_stream)
    }

    pub fn encode_data(&mut self, data: &SharedBuffer, end_stream: bool) -> PhaseOutcome {
        self.data(Direction::Encode, data, end_stream)
    }

    /// Calls every filter's log hook in chain order. Only the first call has
    /// any effect.
    pub fn on_log(&mut self) {
        if std::mem::replace(&mut self.logged, true) {
            return;
        }

        let request = self.decode.headers.as_ref().map(|headers| headers.lock());
        let response = self.encode.headers.as_ref().map(|headers| headers.lock());

        for entry in self.consumer_filters.iter_mut().chain(self.filters.iter_mut()) {
            let _ = entry.timed(Phase::ON_LOG, |filter| {
                filter.on_log(request.as_deref(), response.as_deref());
                ResultAction::Continue
            });
        }
    }

    fn state(&mut self, direction: Direction) -> &mut StreamState {
        match direction {
            Direction::Decode => &mut self.decode,
            Direction::Encode => &mut self.encode,
        }
    }

    fn split(&mut self, direction: Direction) -> (Chain<'_>, &mut StreamState) {
        let state = match direction {
            Direction::Decode => &mut self.decode,
            Direction::Encode => &mut self.encode,
        };
        let chain = Chain {
            filters: &mut self.filters,
            direction,
        };
        (chain, state)
    }

    fn headers(
        &mut self,
        direction: Direction,
        headers: &SharedHeaderMap,
        end_stream: bool,
    ) -> PhaseOutcome {
        let state = self.state(direction);
        if state.phase == StreamPhase::Done {
            tracing::trace!(?direction, "stream already done, headers ignored");
            return PhaseOutcome::Continue;
        }
        state.phase = StreamPhase::Headers;
        state.headers = Some(headers.clone());

        let result = {
            let mut headers = headers.lock();
            self.run_headers(direction, &mut headers, end_stream)
        };
        self.finish(direction, result, end_stream)
    }

    fn run_headers(
        &mut self,
        direction: Direction,
        headers: &mut HeaderMap,
        end_stream: bool,
    ) -> Result<PhaseOutcome, Rejection> {
        if direction == Direction::Decode {
            self.run_consumer_stage(headers, end_stream)?;
        }

        let (mut chain, state) = self.split(direction);
        chain.run_headers(state, headers, end_stream)
    }

    fn data(&mut self, direction: Direction, data: &SharedBuffer, end_stream: bool) -> PhaseOutcome {
        let state = self.state(direction);
        if state.phase == StreamPhase::Done {
            tracing::trace!(?direction, "stream already done, data ignored");
            return PhaseOutcome::Continue;
        }
        state.phase = StreamPhase::Data;

        let result = {
            let stashed = state.headers.clone();
            let mut stashed = stashed.as_ref().map(|headers| headers.lock());
            let mut missing = HeaderMap::new();
            let headers = stashed.as_deref_mut().unwrap_or(&mut missing);
            let mut data = data.lock();

            let (mut chain, state) = self.split(direction);
            chain.run_data(state, headers, &mut data, end_stream)
        };
        self.finish(direction, result, end_stream)
    }

    /// Gives up on `direction` after a filter panicked in it. Later events
    /// for that direction are ignored.
    pub(crate) fn abort(&mut self, direction: Direction) -> LocalReply {
        self.state(direction).phase = StreamPhase::Done;
        LocalReply {
            code: 500,
            ..<_>::default()
        }
    }

    fn finish(
        &mut self,
        direction: Direction,
        result: Result<PhaseOutcome, Rejection>,
        end_stream: bool,
    ) -> PhaseOutcome {
        match result {
            Ok(PhaseOutcome::Continue) => {
                if end_stream {
                    self.state(direction).phase = StreamPhase::Done;
                }
                PhaseOutcome::Continue
            }
            Ok(outcome) => outcome,
            Err(rejection) => {
                self.state(direction).phase = StreamPhase::Done;
                PhaseOutcome::LocalReply(self.local_reply(rejection))
            }
        }
    }

    /// Runs the consumer stage, then replaces the chain's filters with the
    /// identified consumer's own ones.
    fn run_consumer_stage(&mut self, headers: &mut HeaderMap, end_stream: bool) -> Result<(), Rejection> {
        let Some(last) = self.consumer_filters.last() else {
            return Ok(());
        };
        let stage = last.name.clone();

        for entry in &mut self.consumer_filters {
            entry.headers(Direction::Decode, headers, end_stream)?;
        }

        let Some(consumer) = self.callbacks.consumer() else {
            tracing::info!("reject for consumer not found");
            return Err(Rejection {
                plugin: stage,
                response: LocalResponse::new(401).with_msg("consumer not found"),
            });
        };

        if consumer.filters().is_empty() {
            return Ok(());
        }

        self.filters.retain(|entry| {
            !consumer
                .filters()
                .iter()
                .any(|config| config.name() == entry.name)
        });
        for config in consumer.filters() {
            self.non_blocking.retain(config.non_blocking_phases());
            self.filters
                .push(FilterEntry::create(config, &self.callbacks, self.log_execution));
        }

        let registry = PluginRegistry::global();
        self.filters
            .sort_by(|a, b| registry.compare_order(&a.name, &b.name));

        tracing::debug!(consumer = consumer.name(), filters = ?self.filter_names(), "merged consumer filters");
        Ok(())
    }

    fn local_reply(&self, Rejection { plugin, response }: Rejection) -> LocalReply {
        let code = if response.code == 0 { 200 } else { response.code };
        FILTER_LOCAL_REPLIES
            .with_label_values(&[&plugin, &code.to_string()])
            .inc();
        tracing::debug!(%plugin, code, "local reply");

        let mut headers = HeaderMap::with_capacity(response.headers.keys_len());
        for name in response.headers.keys() {
            if let Some(value) = response.headers.get(name) {
                headers.insert(name.clone(), value.clone());
            }
        }

        let mut body = response.msg;
        if !body.is_empty() && !headers.contains_key(CONTENT_TYPE) && self.replies_json() {
            body = serde_json::json!({ "msg": body }).to_string();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        LocalReply { code, body, headers }
    }

    /// A reply is JSON if the response declares JSON, or, before there is
    /// a response, unless the request declares something other than JSON.
    fn replies_json(&self) -> bool {
        let is_json = |headers: &Option<SharedHeaderMap>| {
            headers.as_ref().and_then(|headers| {
                headers
                    .lock()
                    .get(CONTENT_TYPE)
                    .map(|value| value.as_bytes() == b"application/json")
            })
        };

        is_json(&self.encode.headers)
            .or_else(|| is_json(&self.decode.headers))
            .unwrap_or(true)
    }
}

impl std::fmt::Debug for FilterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let consumer_filters: Vec<_> = self
            .consumer_filters
            .iter()
            .map(|entry| entry.name.as_str())
            .collect();
        f.debug_struct("FilterManager")
            .field("consumer_filters", &consumer_filters)
            .field("filters", &self.filter_names())
            .field("decode", &self.decode)
            .field("encode", &self.encode)
            .finish_non_exhaustive()
    }
}
