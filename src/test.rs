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

/// Common utilities for testing
use std::{collections::VecDeque, sync::Arc, sync::Once, time::Duration};

use bytes::{Bytes, BytesMut};
use http::{HeaderName, HeaderValue};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{runtime::Handle, sync::Notify};
use tracing_subscriber::EnvFilter;

use crate::{
    filters::prelude::*,
    host::{HostCallbacks, HttpFilter, SharedBuffer, SharedHeaderMap, Status},
    manager::{Direction, FilterManagerFactory},
    plugins::{consumer_parser, register_plugin, ConsumerConfigParser, FilterFactory},
};

static LOG_ONCE: Once = Once::new();

/// Call to safely enable logging calls with a given tracing env filter, e.g. "tollgate=debug"
/// This can be very useful when attempting to debug unit and integration tests.
pub fn enable_log(filter: impl Into<EnvFilter>) {
    LOG_ONCE.call_once(|| {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(filter)
            .init()
    });
}

pub fn shared_headers(pairs: &[(&'static str, &str)]) -> SharedHeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        headers.append(*name, HeaderValue::from_str(value).unwrap());
    }
    Arc::new(Mutex::new(headers))
}

pub fn shared_buffer(data: &str) -> SharedBuffer {
    Arc::new(Mutex::new(BytesMut::from(data)))
}

/// A call made on the host.
#[derive(Clone, Debug, PartialEq)]
pub enum HostEvent {
    Continue(Direction, Status),
    LocalReply {
        code: u16,
        body: String,
        headers: HeaderMap,
        grpc_status: Option<i32>,
    },
}

/// Records the calls made on the host, in order.
#[derive(Clone, Default)]
pub struct MockHost {
    events: Arc<Mutex<VecDeque<HostEvent>>>,
    notify: Arc<Notify>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for the next event, failing the test after five seconds.
    pub async fn event(&self) -> HostEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(event) = self.try_event() {
                    return event;
                }
                self.notify.notified().await;
            }
        })
        .await
        .expect("no host event after 5s")
    }

    pub fn try_event(&self) -> Option<HostEvent> {
        self.events.lock().pop_front()
    }

    fn push(&self, event: HostEvent) {
        self.events.lock().push_back(event);
        self.notify.notify_one();
    }
}

impl HostCallbacks for MockHost {
    fn continue_stream(&self, direction: Direction, status: Status) {
        self.push(HostEvent::Continue(direction, status));
    }

    fn send_local_reply(
        &self,
        code: u16,
        body: String,
        headers: HeaderMap,
        grpc_status: Option<i32>,
        _details: &str,
    ) {
        self.push(HostEvent::LocalReply {
            code,
            body,
            headers,
            grpc_status,
        });
    }
}

/// A request to drive through a [`TestStream`].
#[derive(Clone, Debug, Default)]
pub struct TestRequest {
    pub headers: HeaderMap,
    pub chunks: Vec<Bytes>,
}

impl TestRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: &'static str, value: &str) -> Self {
        self.headers
            .append(name, HeaderValue::from_str(value).unwrap());
        self
    }

    pub fn chunk(mut self, data: &'static str) -> Self {
        self.chunks.push(Bytes::from_static(data.as_bytes()));
        self
    }
}

/// What reached the upstream.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Upstream {
    pub headers: HeaderMap,
    pub body: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TestResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
    /// `None` when the request was answered locally.
    pub upstream: Option<Upstream>,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

enum Step {
    Continue,
    StopAndBuffer,
    Reply(TestResponse),
}

/// Plays the host for a single stream: sends the request through the
/// filters, buffers and forwards bodies the way a proxy does, and answers
/// from a fake upstream.
pub struct TestStream {
    filter: HttpFilter,
    host: MockHost,
}

impl TestStream {
    pub fn new(factory: &FilterManagerFactory, stream_info: StreamInfo) -> Self {
        let host = MockHost::new();
        let filter = HttpFilter::new(
            factory,
            stream_info,
            Arc::new(host.clone()),
            Handle::current(),
        );
        Self { filter, host }
    }

    pub fn filter(&self) -> &HttpFilter {
        &self.filter
    }

    /// Sends `request` to an upstream echoing the request body.
    pub async fn send(&self, request: TestRequest) -> TestResponse {
        self.send_with(request, |upstream| TestResponse {
            status: 200,
            body: upstream.body.clone(),
            ..<_>::default()
        })
        .await
    }

    pub async fn send_with(
        &self,
        request: TestRequest,
        respond: impl FnOnce(&Upstream) -> TestResponse,
    ) -> TestResponse {
        let headers = Arc::new(Mutex::new(request.headers));
        let status = self
            .filter
            .decode_headers(headers.clone(), request.chunks.is_empty());
        if let Step::Reply(reply) = self.resolve(status).await {
            return self.reply(reply).await;
        }

        let buffer = SharedBuffer::default();
        let mut forwarded = BytesMut::new();
        let chunks = request.chunks.len();
        for (index, chunk) in request.chunks.into_iter().enumerate() {
            buffer.lock().extend_from_slice(&chunk);
            let status = self.filter.decode_data(buffer.clone(), index + 1 == chunks);
            match self.resolve(status).await {
                Step::Continue => {
                    let data = buffer.lock().split();
                    forwarded.extend_from_slice(&data);
                }
                Step::StopAndBuffer => {}
                Step::Reply(reply) => return self.reply(reply).await,
            }
        }

        let upstream = Upstream {
            headers: headers.lock().clone(),
            body: String::from_utf8_lossy(&forwarded).into_owned(),
        };
        let mut response = respond(&upstream);
        response.upstream = Some(upstream);
        let response = self.encode(response).await;
        self.finish(response)
    }

    /// A reply sent while decoding still runs through the response filters.
    async fn reply(&self, reply: TestResponse) -> TestResponse {
        let response = self.encode(reply).await;
        self.finish(response)
    }

    async fn encode(&self, mut response: TestResponse) -> TestResponse {
        let headers = Arc::new(Mutex::new(std::mem::take(&mut response.headers)));
        let body = std::mem::take(&mut response.body);

        let status = self.filter.encode_headers(headers.clone(), body.is_empty());
        if let Step::Reply(reply) = self.resolve(status).await {
            return reply;
        }

        if !body.is_empty() {
            let buffer = Arc::new(Mutex::new(BytesMut::from(body.as_str())));
            if let Step::Reply(reply) = self
                .resolve(self.filter.encode_data(buffer.clone(), true))
                .await
            {
                return reply;
            }
            response.body = String::from_utf8_lossy(&buffer.lock()).into_owned();
        }

        response.headers = headers.lock().clone();
        response
    }

    fn finish(&self, response: TestResponse) -> TestResponse {
        self.filter.on_log();
        self.filter.on_destroy();
        response
    }

    async fn resolve(&self, status: Status) -> Step {
        match status {
            Status::Continue => Step::Continue,
            Status::StopAndBuffer => Step::StopAndBuffer,
            Status::Running | Status::LocalReply => match self.host.event().await {
                HostEvent::Continue(_, Status::StopAndBuffer) => Step::StopAndBuffer,
                HostEvent::Continue(..) => Step::Continue,
                HostEvent::LocalReply {
                    code,
                    body,
                    headers,
                    ..
                } => Step::Reply(TestResponse {
                    status: code,
                    headers,
                    body,
                    upstream: None,
                }),
            },
        }
    }
}

/// Configuration of the test plugins. `decode` and `encode` turn on body
/// changes in that direction, `need` asks for the whole body.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    pub decode: bool,
    pub encode: bool,
    pub need: bool,
}

impl PluginConfig for TestConfig {}

fn run(headers: &mut HeaderMap, value: &'static str) {
    headers.append("run", HeaderValue::from_static(value));
}

/// Records `name` in the `test`/`on_log` plugin state, if a test set one.
fn record_log(callbacks: &FilterCallbackHandler, name: &str) {
    if let Some(log) = callbacks.plugin_state::<Mutex<Vec<String>>>("test", "on_log") {
        log.lock().push(name.to_owned());
    }
}

/// Streaming plugin: tags headers with `run: stream` and appends `stream\n`
/// to every body chunk.
pub struct StreamPlugin;

impl Plugin for StreamPlugin {
    fn filter_factory(&self) -> Option<Arc<dyn FilterFactory>> {
        Some(Self::factory())
    }
}

impl FilterPlugin for StreamPlugin {
    type Config = TestConfig;

    fn create_filter(config: Arc<TestConfig>, callbacks: Arc<FilterCallbackHandler>) -> Box<dyn Filter> {
        Box::new(StreamFilter { config, callbacks })
    }

    fn non_blocking_phases() -> Phase {
        Phase::ALL
    }
}

struct StreamFilter {
    config: Arc<TestConfig>,
    callbacks: Arc<FilterCallbackHandler>,
}

impl Filter for StreamFilter {
    fn decode_headers(&mut self, headers: &mut HeaderMap, _: bool) -> ResultAction {
        run(headers, "stream");
        ResultAction::Continue
    }

    fn decode_data(&mut self, data: &mut BytesMut, _: bool) -> ResultAction {
        if self.config.decode {
            data.extend_from_slice(b"stream\n");
        }
        ResultAction::Continue
    }

    fn encode_headers(&mut self, headers: &mut HeaderMap, _: bool) -> ResultAction {
        run(headers, "stream");
        ResultAction::Continue
    }

    fn encode_data(&mut self, data: &mut BytesMut, _: bool) -> ResultAction {
        if self.config.encode {
            data.extend_from_slice(b"stream\n");
        }
        ResultAction::Continue
    }

    fn on_log(&mut self, _: Option<&HeaderMap>, _: Option<&HeaderMap>) {
        record_log(&self.callbacks, "stream");
    }
}

/// Buffering plugin: wants the whole body when `need` is set, unless the
/// headers carry `stream`.
pub struct BufferPlugin;

impl Plugin for BufferPlugin {
    fn filter_factory(&self) -> Option<Arc<dyn FilterFactory>> {
        Some(Self::factory())
    }
}

impl FilterPlugin for BufferPlugin {
    type Config = TestConfig;

    fn create_filter(config: Arc<TestConfig>, callbacks: Arc<FilterCallbackHandler>) -> Box<dyn Filter> {
        Box::new(BufferFilter { config, callbacks })
    }
}

struct BufferFilter {
    config: Arc<TestConfig>,
    callbacks: Arc<FilterCallbackHandler>,
}

impl BufferFilter {
    fn need(&self, headers: &HeaderMap) -> bool {
        self.config.need && !headers.contains_key("stream")
    }
}

impl Filter for BufferFilter {
    fn decode_headers(&mut self, headers: &mut HeaderMap, _: bool) -> ResultAction {
        run(headers, "no buffer");
        ResultAction::Continue
    }

    fn decode_data(&mut self, data: &mut BytesMut, _: bool) -> ResultAction {
        if self.config.decode {
            data.extend_from_slice(b"no buffer\n");
        }
        ResultAction::Continue
    }

    fn need_decode_whole_request(&self, headers: &HeaderMap) -> bool {
        self.need(headers)
    }

    fn decode_request(&mut self, headers: &mut HeaderMap, data: Option<&mut BytesMut>) -> ResultAction {
        run(headers, "buffer");
        if let (Some(data), true) = (data, self.config.decode) {
            data.extend_from_slice(b"buffer\n");
        }
        ResultAction::Continue
    }

    fn encode_headers(&mut self, headers: &mut HeaderMap, _: bool) -> ResultAction {
        run(headers, "no buffer");
        ResultAction::Continue
    }

    fn encode_data(&mut self, data: &mut BytesMut, _: bool) -> ResultAction {
        if self.config.encode {
            data.extend_from_slice(b"no buffer\n");
        }
        ResultAction::Continue
    }

    fn need_encode_whole_response(&self, headers: &HeaderMap) -> bool {
        self.need(headers)
    }

    fn encode_response(&mut self, headers: &mut HeaderMap, data: Option<&mut BytesMut>) -> ResultAction {
        run(headers, "buffer");
        if let (Some(data), true) = (data, self.config.encode) {
            data.extend_from_slice(b"buffer\n");
        }
        ResultAction::Continue
    }

    fn on_log(&mut self, _: Option<&HeaderMap>, _: Option<&HeaderMap>) {
        record_log(&self.callbacks, "buffer");
    }
}

/// Replies `206 ok` from the headers phase of each enabled direction. The
/// `order` header lists the `run` tags seen so far.
pub struct LocalReplyPlugin;

impl Plugin for LocalReplyPlugin {
    fn filter_factory(&self) -> Option<Arc<dyn FilterFactory>> {
        Some(Self::factory())
    }
}

impl FilterPlugin for LocalReplyPlugin {
    type Config = TestConfig;

    fn create_filter(config: Arc<TestConfig>, callbacks: Arc<FilterCallbackHandler>) -> Box<dyn Filter> {
        Box::new(LocalReplyFilter { config, callbacks })
    }

    fn non_blocking_phases() -> Phase {
        Phase::ALL
    }
}

struct LocalReplyFilter {
    config: Arc<TestConfig>,
    callbacks: Arc<FilterCallbackHandler>,
}

impl LocalReplyFilter {
    fn reply(headers: &HeaderMap) -> ResultAction {
        let order = headers
            .get_all("run")
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect::<Vec<_>>()
            .join("|");

        LocalResponse::new(206)
            .with_msg("ok")
            .with_header(
                HeaderName::from_static("order"),
                HeaderValue::from_str(&order).unwrap(),
            )
            .with_header(HeaderName::from_static("order"), HeaderValue::from_static("ignored"))
            .into()
    }
}

impl Filter for LocalReplyFilter {
    fn decode_headers(&mut self, headers: &mut HeaderMap, _: bool) -> ResultAction {
        if self.config.decode {
            return Self::reply(headers);
        }
        ResultAction::Continue
    }

    fn encode_headers(&mut self, headers: &mut HeaderMap, _: bool) -> ResultAction {
        if self.config.encode {
            return Self::reply(headers);
        }
        ResultAction::Continue
    }

    fn on_log(&mut self, _: Option<&HeaderMap>, _: Option<&HeaderMap>) {
        record_log(&self.callbacks, "localReply");
    }
}

/// Panics when decoding headers.
pub struct PanicPlugin;

impl Plugin for PanicPlugin {
    fn filter_factory(&self) -> Option<Arc<dyn FilterFactory>> {
        Some(Self::factory())
    }
}

impl FilterPlugin for PanicPlugin {
    type Config = TestConfig;

    fn create_filter(_: Arc<TestConfig>, _: Arc<FilterCallbackHandler>) -> Box<dyn Filter> {
        Box::new(PanicFilter)
    }
}

struct PanicFilter;

impl Filter for PanicFilter {
    fn decode_headers(&mut self, _: &mut HeaderMap, _: bool) -> ResultAction {
        panic!("test plugin panic");
    }
}

/// Consumer plugin: identifies the consumer named by the `consumer` header.
pub struct ConsumerPlugin;

impl Plugin for ConsumerPlugin {
    fn category(&self) -> Category {
        Category::Authn
    }

    fn order(&self) -> PluginOrder {
        PluginOrder::new(OrderPosition::Authn)
    }

    fn filter_factory(&self) -> Option<Arc<dyn FilterFactory>> {
        Some(Self::factory())
    }

    fn consumer_parser(&self) -> Option<Arc<dyn ConsumerConfigParser>> {
        Some(consumer_parser::<TestConsumerConfig>())
    }
}

impl FilterPlugin for ConsumerPlugin {
    type Config = TestConfig;

    fn create_filter(_: Arc<TestConfig>, callbacks: Arc<FilterCallbackHandler>) -> Box<dyn Filter> {
        Box::new(ConsumerFilter { callbacks })
    }

    fn non_blocking_phases() -> Phase {
        Phase::ALL
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TestConsumerConfig {
    pub name: String,
}

impl PluginConfig for TestConsumerConfig {}

impl ConsumerConfig for TestConsumerConfig {
    fn index(&self) -> String {
        self.name.clone()
    }
}

struct ConsumerFilter {
    callbacks: Arc<FilterCallbackHandler>,
}

impl Filter for ConsumerFilter {
    fn decode_headers(&mut self, headers: &mut HeaderMap, _: bool) -> ResultAction {
        let consumer = headers
            .get("consumer")
            .and_then(|value| value.to_str().ok())
            .and_then(|name| self.callbacks.lookup_consumer("consumer", name));
        if let Some(consumer) = consumer {
            self.callbacks.set_consumer(consumer);
        }
        ResultAction::Continue
    }

    fn on_log(&mut self, _: Option<&HeaderMap>, _: Option<&HeaderMap>) {
        record_log(&self.callbacks, "consumer");
    }
}

/// Takes half a second to decode headers.
pub struct SlowPlugin;

impl Plugin for SlowPlugin {
    fn filter_factory(&self) -> Option<Arc<dyn FilterFactory>> {
        Some(Self::factory())
    }
}

impl FilterPlugin for SlowPlugin {
    type Config = TestConfig;

    fn create_filter(_: Arc<TestConfig>, callbacks: Arc<FilterCallbackHandler>) -> Box<dyn Filter> {
        Box::new(SlowFilter { callbacks })
    }
}

struct SlowFilter {
    callbacks: Arc<FilterCallbackHandler>,
}

impl Filter for SlowFilter {
    fn decode_headers(&mut self, _: &mut HeaderMap, _: bool) -> ResultAction {
        std::thread::sleep(Duration::from_millis(500));
        ResultAction::Continue
    }

    fn on_log(&mut self, _: Option<&HeaderMap>, _: Option<&HeaderMap>) {
        record_log(&self.callbacks, "slow");
    }
}

/// Registers the test plugins `stream`, `buffer`, `localReply`, `panic`,
/// `consumer` and `slow`.
pub fn load_test_plugins() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        register_plugin("stream", Arc::new(StreamPlugin));
        register_plugin("buffer", Arc::new(BufferPlugin));
        register_plugin("localReply", Arc::new(LocalReplyPlugin));
        register_plugin("panic", Arc::new(PanicPlugin));
        register_plugin("consumer", Arc::new(ConsumerPlugin));
        register_plugin("slow", Arc::new(SlowPlugin));
    });
}
