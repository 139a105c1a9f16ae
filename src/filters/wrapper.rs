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

//! A decorator that logs every method call made on a filter before
//! forwarding it unchanged.

use super::prelude::*;

pub struct LogExecution {
    name: String,
    inner: Box<dyn Filter>,
}

impl LogExecution {
    pub fn new(name: impl Into<String>, inner: Box<dyn Filter>) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }

    fn log(&self, method: &'static str) {
        tracing::debug!(plugin = %self.name, method, "run plugin");
    }
}

impl Filter for LogExecution {
    fn decode_headers(&mut self, headers: &mut HeaderMap, end_stream: bool) -> ResultAction {
        self.log("decode_headers");
        self.inner.decode_headers(headers, end_stream)
    }

    fn decode_data(&mut self, data: &mut BytesMut, end_stream: bool) -> ResultAction {
        self.log("decode_data");
        self.inner.decode_data(data, end_stream)
    }

    fn need_decode_whole_request(&self, headers: &HeaderMap) -> bool {
        self.log("need_decode_whole_request");
        self.inner.need_decode_whole_request(headers)
    }

    fn decode_request(&mut self, headers: &mut HeaderMap, data: Option<&mut BytesMut>) -> ResultAction {
        self.log("decode_request");
        self.inner.decode_request(headers, data)
    }

    fn encode_headers(&mut self, headers: &mut HeaderMap, end_stream: bool) -> ResultAction {
        self.log("encode_headers");
        self.inner.encode_headers(headers, end_stream)
    }

    fn encode_data(&mut self, data: &mut BytesMut, end_stream: bool) -> ResultAction {
        self.log("encode_data");
        self.inner.encode_data(data, end_stream)
    }

    fn need_encode_whole_response(&self, headers: &HeaderMap) -> bool {
        self.log("need_encode_whole_response");
        self.inner.need_encode_whole_response(headers)
    }

    fn encode_response(&mut self, headers: &mut HeaderMap, data: Option<&mut BytesMut>) -> ResultAction {
        self.log("encode_response");
        self.inner.encode_response(headers, data)
    }

    fn on_log(&mut self, request_headers: Option<&HeaderMap>, response_headers: Option<&HeaderMap>) {
        self.log("on_log");
        self.inner.on_log(request_headers, response_headers)
    }
}
