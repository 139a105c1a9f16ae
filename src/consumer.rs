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

//! Consumers: identified callers whose per-identity config is looked up by
//! consumer plugins such as `keyAuth`.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::{
    manager::ParsedFilterConfig,
    plugins::{json_or_string, ConsumerConfig, ParseError, ParsedConsumerConfig, PluginRegistry},
};

static STORE: Lazy<ConsumerStore> = Lazy::new(ConsumerStore::default);

/// A consumer as delivered by the control plane.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerSpec {
    /// Consumer plugin name to that plugin's config for this consumer. The
    /// config may also be a string containing JSON.
    #[serde(default)]
    pub auth: BTreeMap<String, serde_json::Value>,
    /// Filter configs which replace the route's config of the same plugin
    /// once this consumer has been identified.
    #[serde(default)]
    pub filters: BTreeMap<String, ConsumerFilter>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerFilter {
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct Consumer {
    namespace: String,
    name: String,
    auth: HashMap<String, ParsedConsumerConfig>,
    filters: Vec<Arc<ParsedFilterConfig>>,
}

impl Consumer {
    pub fn parse(namespace: &str, name: &str, spec: &ConsumerSpec) -> Result<Self, ParseError> {
        Self::parse_with(PluginRegistry::global(), namespace, name, spec)
    }

    pub fn parse_with(
        registry: &PluginRegistry,
        namespace: &str,
        name: &str,
        spec: &ConsumerSpec,
    ) -> Result<Self, ParseError> {
        tracing::info!(namespace, consumer = name, "init configs for consumer");

        let mut auth = HashMap::with_capacity(spec.auth.len());
        for (plugin, raw) in &spec.auth {
            let parser = registry
                .load(plugin)
                .and_then(|registered| registered.consumer_parser().cloned())
                .ok_or_else(|| ParseError::NotConsumerPlugin(plugin.clone()))?;
            let config = json_or_string(raw)
                .and_then(|raw| parser.parse(&raw))
                .map_err(|error| error.in_plugin(plugin))?;
            auth.insert(plugin.clone(), config);
        }

        let mut filters = Vec::with_capacity(spec.filters.len());
        for (plugin, filter) in &spec.filters {
            let factory = registry
                .load(plugin)
                .and_then(|registered| registered.filter_factory().cloned())
                .ok_or_else(|| ParseError::UnknownPlugin(plugin.clone()))?;
            let config = factory
                .parse(filter.config.as_ref())
                .map_err(|error| error.in_plugin(plugin))?;
            filters.push(Arc::new(ParsedFilterConfig::new(
                plugin.clone(),
                factory,
                config,
            )));
        }

        Ok(Self {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
            auth,
            filters,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// This consumer's config for the consumer plugin `plugin`.
    pub fn plugin_config<C: ConsumerConfig>(&self, plugin: &str) -> Option<Arc<C>> {
        self.auth.get(plugin).and_then(ParsedConsumerConfig::downcast)
    }

    pub fn filters(&self) -> &[Arc<ParsedFilterConfig>] {
        &self.filters
    }
}

/// Plugin name to lookup index to consumer.
type ConsumerIndex = HashMap<String, HashMap<String, Arc<Consumer>>>;

/// Consumers of every namespace, indexed for lookup by consumer plugins.
#[derive(Default)]
pub struct ConsumerStore {
    namespaces: ArcSwap<HashMap<String, Arc<ConsumerIndex>>>,
}

impl ConsumerStore {
    pub fn global() -> &'static Self {
        &STORE
    }

    /// Replaces every consumer of `namespace`. Consumers which fail to parse
    /// are logged and left out. Returns the number of consumers loaded.
    pub fn update(&self, namespace: &str, consumers: &BTreeMap<String, ConsumerSpec>) -> usize {
        self.update_with(PluginRegistry::global(), namespace, consumers)
    }

    pub fn update_with(
        &self,
        registry: &PluginRegistry,
        namespace: &str,
        consumers: &BTreeMap<String, ConsumerSpec>,
    ) -> usize {
        let mut index = ConsumerIndex::new();
        let mut loaded = 0;

        for (name, spec) in consumers {
            let consumer = match Consumer::parse_with(registry, namespace, name, spec) {
                Ok(consumer) => Arc::new(consumer),
                Err(error) => {
                    tracing::error!(namespace, consumer = %name, %error, "failed to parse consumer");
                    continue;
                }
            };

            for (plugin, config) in &consumer.auth {
                let previous = index
                    .entry(plugin.clone())
                    .or_default()
                    .insert(config.index().to_owned(), consumer.clone());
                if let Some(previous) = previous {
                    tracing::warn!(
                        namespace,
                        plugin = %plugin,
                        consumer = %name,
                        previous = previous.name(),
                        "duplicate consumer index, replacing"
                    );
                }
            }
            loaded += 1;
        }

        let index = Arc::new(index);
        self.namespaces.rcu(|namespaces| {
            let mut namespaces = HashMap::clone(namespaces);
            namespaces.insert(namespace.to_owned(), index.clone());
            namespaces
        });
        loaded
    }

    pub fn remove(&self, namespace: &str) {
        self.namespaces.rcu(|namespaces| {
            let mut namespaces = HashMap::clone(namespaces);
            namespaces.remove(namespace);
            namespaces
        });
    }

    pub fn lookup(&self, namespace: &str, plugin: &str, key: &str) -> Option<Arc<Consumer>> {
        self.namespaces
            .load()
            .get(namespace)?
            .get(plugin)?
            .get(key)
            .cloned()
    }
}

pub fn update(namespace: &str, consumers: &BTreeMap<String, ConsumerSpec>) -> usize {
    ConsumerStore::global().update(namespace, consumers)
}

pub fn lookup(namespace: &str, plugin: &str, key: &str) -> Option<Arc<Consumer>> {
    ConsumerStore::global().lookup(namespace, plugin, key)
}
