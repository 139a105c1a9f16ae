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

use std::{any::Any, collections::HashMap, net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::consumer::{self, Consumer};

/// Information about the stream provided by the host.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamInfo {
    pub route_name: String,
    pub filter_chain_name: String,
    pub virtual_cluster_name: Option<String>,
    pub downstream_remote_address: Option<SocketAddr>,
}

type PluginStateKey = (String, String);

/// The per-request handle given to every filter of a request.
///
/// It is shared by all of the request's filters, so anything stored here by
/// one filter (the consumer, plugin state) is visible to the others.
pub struct FilterCallbackHandler {
    namespace: String,
    stream_info: StreamInfo,
    consumer: Mutex<Option<Arc<Consumer>>>,
    plugin_state: Mutex<HashMap<PluginStateKey, Arc<dyn Any + Send + Sync>>>,
    cancellation: CancellationToken,
}

impl FilterCallbackHandler {
    pub fn new(namespace: impl Into<String>, stream_info: StreamInfo) -> Self {
        Self {
            namespace: namespace.into(),
            stream_info,
            consumer: <_>::default(),
            plugin_state: <_>::default(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn stream_info(&self) -> &StreamInfo {
        &self.stream_info
    }

    /// Looks up the consumer registered in this request's namespace whose
    /// `plugin` config is indexed by `key`.
    pub fn lookup_consumer(&self, plugin: &str, key: &str) -> Option<Arc<Consumer>> {
        consumer::lookup(&self.namespace, plugin, key)
    }

    pub fn set_consumer(&self, consumer: Arc<Consumer>) {
        tracing::debug!(consumer = consumer.name(), "consumer set");
        *self.consumer.lock() = Some(consumer);
    }

    pub fn consumer(&self) -> Option<Arc<Consumer>> {
        self.consumer.lock().clone()
    }

    pub fn plugin_state<T: Any + Send + Sync>(&self, namespace: &str, key: &str) -> Option<Arc<T>> {
        self.plugin_state
            .lock()
            .get(&(namespace.to_owned(), key.to_owned()))
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    pub fn set_plugin_state<T: Any + Send + Sync>(&self, namespace: &str, key: &str, value: T) {
        self.plugin_state
            .lock()
            .insert((namespace.to_owned(), key.to_owned()), Arc::new(value));
    }

    /// Cancelled once the host has torn down the stream. Filters doing long
    /// running work should check or await it.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub(crate) fn cancel(&self) {
        self.cancellation.cancel();
    }
}

impl std::fmt::Debug for FilterCallbackHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterCallbackHandler")
            .field("namespace", &self.namespace)
            .field("stream_info", &self.stream_info)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
