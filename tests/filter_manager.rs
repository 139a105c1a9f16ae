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

use pretty_assertions::assert_eq;

use tollgate::{
    filters::StreamInfo,
    test::{load_test_plugins, TestRequest, TestResponse, TestStream},
    FilterManagerConfig, FilterManagerFactory,
};

fn stream(yaml: &str) -> TestStream {
    load_test_plugins();
    let spec = serde_yaml::from_str(yaml).unwrap();
    let factory = FilterManagerFactory::new(FilterManagerConfig::from_spec(&spec));
    TestStream::new(&factory, StreamInfo::default())
}

fn run(headers: &http::HeaderMap) -> Vec<&str> {
    headers
        .get_all("run")
        .iter()
        .map(|value| value.to_str().unwrap())
        .collect()
}

#[tokio::test]
async fn buffered_request() {
    let stream = stream(
        "
plugins:
  - {name: stream, config: {decode: true}}
  - {name: buffer, config: {decode: true, need: true}}
  - {name: stream, config: {decode: true}}
  - {name: buffer, config: {decode: true, need: true}}
",
    );

    let response = stream
        .send(TestRequest::new().chunk("0").chunk("1"))
        .await;
    let upstream = response.upstream.unwrap();

    assert_eq!(200, response.status);
    assert_eq!("01stream\nbuffer\nstream\nbuffer\n", upstream.body);
    assert_eq!(vec!["stream", "buffer", "stream", "buffer"], run(&upstream.headers));
}

#[tokio::test]
async fn streamed_request() {
    let stream = stream(
        "
plugins:
  - {name: buffer, config: {decode: true}}
  - {name: stream, config: {decode: true}}
",
    );

    let response = stream
        .send(TestRequest::new().chunk("0").chunk("1").chunk(""))
        .await;

    assert_eq!(
        "0no buffer\nstream\n1no buffer\nstream\nno buffer\nstream\n",
        response.upstream.unwrap().body
    );
}

#[tokio::test]
async fn buffering_declined_by_headers() {
    let stream = stream(
        "
plugins:
  - {name: buffer, config: {decode: true, need: true}}
",
    );

    let response = stream
        .send(TestRequest::new().header("stream", "yes").chunk("0").chunk("1"))
        .await;
    let upstream = response.upstream.unwrap();

    assert_eq!("0no buffer\n1no buffer\n", upstream.body);
    assert_eq!(vec!["no buffer"], run(&upstream.headers));
}

#[tokio::test]
async fn buffered_response() {
    let stream = stream(
        "
plugins:
  - {name: buffer, config: {encode: true, need: true}}
  - {name: stream, config: {encode: true}}
",
    );

    let response = stream.send(TestRequest::new().chunk("01")).await;

    assert_eq!("01stream\nbuffer\n", response.body);
    assert_eq!(vec!["stream", "buffer"], run(&response.headers));
}

#[tokio::test]
async fn local_reply_runs_response_filters() {
    let stream = stream(
        "
plugins:
  - {name: stream, config: {encode: true}}
  - {name: localReply, config: {decode: true}}
",
    );

    let response = stream.send(TestRequest::new().chunk("ignored")).await;

    assert_eq!(None, response.upstream);
    assert_eq!(206, response.status);
    assert_eq!("{\"msg\":\"ok\"}stream\n", response.body);
    assert_eq!(Some("application/json"), response.header("content-type"));
    assert_eq!(Some("stream"), response.header("order"));
    assert_eq!(vec!["stream"], run(&response.headers));
}

#[tokio::test]
async fn local_reply_while_encoding() {
    let stream = stream(
        "
plugins:
  - {name: localReply, config: {encode: true}}
  - {name: stream, config: {encode: true}}
",
    );

    let response = stream
        .send_with(TestRequest::new(), |_| TestResponse {
            status: 200,
            body: "upstream".into(),
            headers: [(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("text/plain"),
            )]
                .into_iter()
                .collect(),
            upstream: None,
        })
        .await;

    assert_eq!(206, response.status);
    assert_eq!("ok", response.body);
    assert!(response.upstream.is_none());
}

#[tokio::test]
async fn panic_is_internal_error() {
    let stream = stream(
        "
plugins:
  - {name: stream}
  - {name: panic}
",
    );

    let response = stream.send(TestRequest::new()).await;

    assert_eq!(500, response.status);
    assert_eq!(None, response.upstream);
}

#[tokio::test]
async fn unknown_plugins_are_passed_over() {
    let stream = stream(
        "
plugins:
  - {name: doesNotExist}
  - {name: stream, config: {decode: true}}
",
    );

    let response = stream.send(TestRequest::new().chunk("0")).await;

    assert_eq!(200, response.status);
    assert_eq!("0stream\n", response.body);
}
