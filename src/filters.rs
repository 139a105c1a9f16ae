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

//! Per-request filters and the types they exchange with the filter manager.

mod callbacks;
mod internal_error;
mod phase;
mod wrapper;

use bytes::BytesMut;
use http::{HeaderMap, HeaderName, HeaderValue};

/// Prelude containing all types and traits required to implement a [`Filter`]
/// and the plugin that produces it.
pub mod prelude {
    pub use super::{Filter, FilterCallbackHandler, LocalResponse, Phase, ResultAction, StreamInfo};
    pub use crate::plugins::{
        Category, ConsumerConfig, FilterPlugin, OrderOperation, OrderPosition, Plugin,
        PluginConfig, PluginOrder, ValidationError,
    };
    pub use bytes::BytesMut;
    pub use http::HeaderMap;
}

#[doc(inline)]
pub use self::{
    callbacks::{FilterCallbackHandler, StreamInfo},
    internal_error::InternalErrorFilter,
    phase::{AtomicPhase, Phase},
    wrapper::LogExecution,
};

/// The result of running one filter method.
///
/// Anything other than [`ResultAction::Continue`] stops the current phase and
/// answers the downstream directly.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ResultAction {
    #[default]
    Continue,
    LocalResponse(LocalResponse),
}

impl ResultAction {
    pub fn is_continue(&self) -> bool {
        matches!(self, Self::Continue)
    }
}

impl From<LocalResponse> for ResultAction {
    fn from(response: LocalResponse) -> Self {
        Self::LocalResponse(response)
    }
}

/// A response generated by a filter instead of forwarding the request.
///
/// A `code` of `0` is sent as `200`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalResponse {
    pub code: u16,
    pub msg: String,
    pub headers: HeaderMap,
}

impl LocalResponse {
    pub fn new(code: u16) -> Self {
        Self {
            code,
            ..<_>::default()
        }
    }

    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = msg.into();
        self
    }

    /// Appends a header to the response, values are appended rather than
    /// replaced.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }
}

/// Trait for intercepting a single HTTP request and its response.
///
/// One instance is created per request by the plugin's factory and dropped
/// once the request has been logged. The request direction ("decode") walks
/// the chain front to back, the response direction ("encode") walks it back to
/// front.
///
/// A filter that needs the complete body returns `true` from
/// [`Filter::need_decode_whole_request`] (or its encode counterpart). Instead
/// of the per-chunk methods it then receives a single
/// [`Filter::decode_request`] call once the whole body has been buffered.
/// Filters that only stream keep the default pass-through implementations.
pub trait Filter: Send {
    fn decode_headers(&mut self, _headers: &mut HeaderMap, _end_stream: bool) -> ResultAction {
        ResultAction::Continue
    }

    fn decode_data(&mut self, _data: &mut BytesMut, _end_stream: bool) -> ResultAction {
        ResultAction::Continue
    }

    fn need_decode_whole_request(&self, _headers: &HeaderMap) -> bool {
        false
    }

    /// Receives the request headers and the complete body, `None` when the
    /// request has no body at all.
    fn decode_request(
        &mut self,
        _headers: &mut HeaderMap,
        _data: Option<&mut BytesMut>,
    ) -> ResultAction {
        ResultAction::Continue
    }

    fn encode_headers(&mut self, _headers: &mut HeaderMap, _end_stream: bool) -> ResultAction {
        ResultAction::Continue
    }

    fn encode_data(&mut self, _data: &mut BytesMut, _end_stream: bool) -> ResultAction {
        ResultAction::Continue
    }

    fn need_encode_whole_response(&self, _headers: &HeaderMap) -> bool {
        false
    }

    fn encode_response(
        &mut self,
        _headers: &mut HeaderMap,
        _data: Option<&mut BytesMut>,
    ) -> ResultAction {
        ResultAction::Continue
    }

    /// Called exactly once when the request is finished, however it ended.
    fn on_log(
        &mut self,
        _request_headers: Option<&HeaderMap>,
        _response_headers: Option<&HeaderMap>,
    ) {
    }
}

/// A filter which does nothing.
#[derive(Debug, Default)]
pub struct PassThrough;

impl Filter for PassThrough {}
