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

use std::{fmt, sync::Arc};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::{
    filters::{Filter, FilterCallbackHandler, InternalErrorFilter, Phase},
    plugins::{FilterFactory, ParseError, ParsedConfig, PluginRegistry},
};

/// One entry of the plugin list, as authored.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

impl PluginEntry {
    pub fn new(name: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            config: Some(config),
        }
    }
}

/// The unparsed configuration of one filter manager.
///
/// The plugin order is trusted as given. Sorting by order position happens
/// before the configuration is delivered.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterManagerSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
}

/// `{"type_url": "...", "value": {...}}`, only the value is used.
#[derive(Debug, Deserialize)]
struct TypedStruct {
    value: Option<FilterManagerSpec>,
}

/// A plugin's parsed configuration together with the factory creating its
/// filters. The configuration's `init` runs at most once.
pub struct ParsedFilterConfig {
    name: String,
    factory: Arc<dyn FilterFactory>,
    config: ParsedConfig,
    init: OnceCell<Result<(), String>>,
}

impl ParsedFilterConfig {
    pub fn new(name: impl Into<String>, factory: Arc<dyn FilterFactory>, config: ParsedConfig) -> Self {
        Self {
            name: name.into(),
            factory,
            config,
            init: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ParsedConfig {
        &self.config
    }

    pub fn non_blocking_phases(&self) -> Phase {
        self.factory.non_blocking_phases()
    }

    /// Merges this parent scope config with `child` using the plugin's own
    /// merge.
    pub fn merge(&self, child: &Self) -> Self {
        Self::new(
            child.name.clone(),
            child.factory.clone(),
            self.factory.merge(&self.config, &child.config),
        )
    }

    /// Runs the config's `init` the first time it is called and returns the
    /// remembered outcome afterwards.
    pub fn init(&self) -> Result<(), &str> {
        self.init
            .get_or_init(|| {
                self.config.init().map_err(|error| {
                    tracing::error!(plugin = %self.name, %error, "failed to init plugin config");
                    format!("{error:#}")
                })
            })
            .as_ref()
            .map(drop)
            .map_err(String::as_str)
    }

    /// Creates the filter for one request. A config whose `init` failed
    /// creates a filter answering `500`.
    pub fn create_filter(&self, callbacks: Arc<FilterCallbackHandler>) -> Box<dyn Filter> {
        match self.init() {
            Ok(()) => self.factory.create_filter(&self.config, callbacks),
            Err(error) => Box::new(InternalErrorFilter::new(&self.name, error)),
        }
    }
}

impl fmt::Debug for ParsedFilterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParsedFilterConfig")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// The parsed configuration of one request processing scope, e.g. a route.
#[derive(Debug, Default)]
pub struct FilterManagerConfig {
    pub(crate) namespace: String,
    pub(crate) filters: Vec<Arc<ParsedFilterConfig>>,
    /// The filters before this index form the consumer stage.
    pub(crate) consumer_filters_end_at: usize,
    pub(crate) skipped: Vec<String>,
}

impl FilterManagerConfig {
    /// Parses a TypedStruct envelope. An empty payload is an empty chain.
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        Self::parse_with(PluginRegistry::global(), payload)
    }

    pub fn parse_with(registry: &PluginRegistry, payload: &[u8]) -> Result<Self, ParseError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }

        let envelope: TypedStruct = serde_json::from_slice(payload)?;
        let spec = envelope.value.ok_or(ParseError::BadTypedStruct)?;
        Ok(Self::from_spec_with(registry, &spec))
    }

    pub fn from_spec(spec: &FilterManagerSpec) -> Self {
        Self::from_spec_with(PluginRegistry::global(), spec)
    }

    /// Resolves every entry against `registry`. Entries naming an unknown
    /// plugin, or whose config fails to parse, are logged and skipped.
    pub fn from_spec_with(registry: &PluginRegistry, spec: &FilterManagerSpec) -> Self {
        let mut config = Self {
            namespace: spec.namespace.clone(),
            filters: Vec::with_capacity(spec.plugins.len()),
            ..Self::default()
        };

        for entry in &spec.plugins {
            let name = entry.name.as_str();
            let registered = registry.load(name);
            let Some(factory) = registered
                .as_ref()
                .and_then(|plugin| plugin.filter_factory().cloned())
            else {
                tracing::warn!(plugin = name, "plugin not found, ignored");
                config.skipped.push(entry.name.clone());
                continue;
            };

            let parsed = match factory.parse(entry.config.as_ref()) {
                Ok(parsed) => parsed,
                Err(error) => {
                    tracing::error!(plugin = name, %error, "failed to parse plugin config, ignored");
                    config.skipped.push(entry.name.clone());
                    continue;
                }
            };

            let parsed = Arc::new(ParsedFilterConfig::new(name, factory, parsed));
            // The outcome is remembered and reported by the created filters.
            let _ = parsed.init();
            config.filters.push(parsed);

            if registered.is_some_and(|plugin| plugin.descriptor().consumer) {
                config.consumer_filters_end_at = config.filters.len();
            }
        }

        config
    }

    /// Merging two scopes is "child wins" as a whole.
    pub fn merge(_parent: &Arc<Self>, child: &Arc<Self>) -> Arc<Self> {
        Arc::clone(child)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn filters(&self) -> &[Arc<ParsedFilterConfig>] {
        &self.filters
    }

    /// Names of the entries left out of the chain.
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    pub fn consumer_filters_end_at(&self) -> usize {
        self.consumer_filters_end_at
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}
