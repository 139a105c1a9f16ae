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

use std::{
    any::Any,
    fmt,
    marker::PhantomData,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use serde::de::DeserializeOwned;

use super::{ParseError, ValidationError};
use crate::filters::{Filter, FilterCallbackHandler, InternalErrorFilter, Phase};

/// The typed configuration of a plugin.
///
/// A missing payload is parsed as an empty object, so configs should default
/// every optional field and [`PluginConfig::validate`] always runs.
pub trait PluginConfig: DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }

    /// Expensive setup, run once per parsed config before its first filter is
    /// created. A failure turns every request through this plugin into a
    /// `500`.
    fn init(&self) -> crate::Result<()> {
        Ok(())
    }
}

/// The per-consumer configuration of a consumer plugin.
pub trait ConsumerConfig: PluginConfig {
    /// The value a request presents to look this consumer up, e.g. its key.
    fn index(&self) -> String;
}

/// Statically typed half of a managed plugin. Implement this alongside
/// [`Plugin`][super::Plugin] and return [`FilterPlugin::factory`] from
/// [`Plugin::filter_factory`][super::Plugin::filter_factory].
pub trait FilterPlugin: Send + Sync + 'static {
    type Config: PluginConfig;

    /// Creates the filter for one request.
    fn create_filter(
        config: Arc<Self::Config>,
        callbacks: Arc<FilterCallbackHandler>,
    ) -> Box<dyn Filter>;

    /// Merges a parent scope's config with a child scope's. The child wins
    /// unless overridden.
    fn merge(_parent: &Arc<Self::Config>, child: &Arc<Self::Config>) -> Arc<Self::Config> {
        Arc::clone(child)
    }

    fn non_blocking_phases() -> Phase {
        Phase::NONE
    }

    fn factory() -> Arc<dyn FilterFactory>
    where
        Self: Sized,
    {
        Arc::new(TypedFilterFactory::<Self>(PhantomData))
    }
}

/// Type erased parser and factory of a managed plugin.
pub trait FilterFactory: Send + Sync {
    fn parse(&self, raw: Option<&serde_json::Value>) -> Result<ParsedConfig, ParseError>;
    fn merge(&self, parent: &ParsedConfig, child: &ParsedConfig) -> ParsedConfig;
    fn non_blocking_phases(&self) -> Phase;
    fn create_filter(
        &self,
        config: &ParsedConfig,
        callbacks: Arc<FilterCallbackHandler>,
    ) -> Box<dyn Filter>;
}

/// Type erased parser of a consumer plugin's per-consumer config.
pub trait ConsumerConfigParser: Send + Sync {
    fn parse(&self, raw: &serde_json::Value) -> Result<ParsedConsumerConfig, ParseError>;
}

pub fn consumer_parser<C: ConsumerConfig>() -> Arc<dyn ConsumerConfigParser> {
    Arc::new(TypedConsumerParser::<C>(PhantomData))
}

/// A parsed, validated plugin configuration shared by every filter created
/// from it.
#[derive(Clone)]
pub struct ParsedConfig {
    value: Arc<dyn Any + Send + Sync>,
    init: fn(&(dyn Any + Send + Sync)) -> crate::Result<()>,
    debug: fn(&(dyn Any + Send + Sync), &mut fmt::Formatter<'_>) -> fmt::Result,
}

impl ParsedConfig {
    pub fn new<C: PluginConfig>(config: C) -> Self {
        Self::from_arc(Arc::new(config))
    }

    pub fn from_arc<C: PluginConfig>(config: Arc<C>) -> Self {
        Self {
            value: config,
            init: init_erased::<C>,
            debug: debug_erased::<C>,
        }
    }

    pub fn downcast<C: PluginConfig>(&self) -> Option<Arc<C>> {
        self.value.clone().downcast::<C>().ok()
    }

    pub fn downcast_ref<C: PluginConfig>(&self) -> Option<&C> {
        self.value.downcast_ref::<C>()
    }

    pub fn init(&self) -> crate::Result<()> {
        (self.init)(&*self.value)
    }
}

impl fmt::Debug for ParsedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (self.debug)(&*self.value, f)
    }
}

fn init_erased<C: PluginConfig>(value: &(dyn Any + Send + Sync)) -> crate::Result<()> {
    value.downcast_ref::<C>().map_or(Ok(()), C::init)
}

fn debug_erased<C: PluginConfig>(
    value: &(dyn Any + Send + Sync),
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    match value.downcast_ref::<C>() {
        Some(config) => fmt::Debug::fmt(config, f),
        None => f.write_str("<unknown config>"),
    }
}

/// A parsed consumer config together with its lookup index.
#[derive(Clone, Debug)]
pub struct ParsedConsumerConfig {
    index: String,
    config: ParsedConfig,
}

impl ParsedConsumerConfig {
    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn downcast<C: ConsumerConfig>(&self) -> Option<Arc<C>> {
        self.config.downcast::<C>()
    }
}

/// Deserializes and validates `C` from `raw`. A panic inside the plugin's
/// deserializer or validation is caught and returned as
/// [`ParseError::Panic`].
pub fn parse_config<C: PluginConfig>(raw: Option<&serde_json::Value>) -> Result<C, ParseError> {
    catch_unwind(AssertUnwindSafe(|| -> Result<C, ParseError> {
        let config = match raw {
            Some(value) if !value.is_null() => C::deserialize(value)?,
            _ => C::deserialize(serde_json::Value::Object(<_>::default()))?,
        };
        config.validate()?;
        Ok(config)
    }))
    .unwrap_or_else(|panic| {
        tracing::error!(
            config = std::any::type_name::<C>(),
            panic = crate::panic_message(&*panic),
            "plugin config parser panic"
        );
        Err(ParseError::Panic)
    })
}

struct TypedFilterFactory<P>(PhantomData<fn() -> P>);

impl<P: FilterPlugin> FilterFactory for TypedFilterFactory<P> {
    fn parse(&self, raw: Option<&serde_json::Value>) -> Result<ParsedConfig, ParseError> {
        parse_config::<P::Config>(raw).map(ParsedConfig::new)
    }

    fn merge(&self, parent: &ParsedConfig, child: &ParsedConfig) -> ParsedConfig {
        match (parent.downcast::<P::Config>(), child.downcast::<P::Config>()) {
            (Some(parent), Some(child)) => ParsedConfig::from_arc(P::merge(&parent, &child)),
            _ => child.clone(),
        }
    }

    fn non_blocking_phases(&self) -> Phase {
        P::non_blocking_phases()
    }

    fn create_filter(
        &self,
        config: &ParsedConfig,
        callbacks: Arc<FilterCallbackHandler>,
    ) -> Box<dyn Filter> {
        match config.downcast::<P::Config>() {
            Some(config) => P::create_filter(config, callbacks),
            None => Box::new(InternalErrorFilter::new(
                std::any::type_name::<P>(),
                format!("mismatched config type: {config:?}"),
            )),
        }
    }
}

struct TypedConsumerParser<C>(PhantomData<fn() -> C>);

impl<C: ConsumerConfig> ConsumerConfigParser for TypedConsumerParser<C> {
    fn parse(&self, raw: &serde_json::Value) -> Result<ParsedConsumerConfig, ParseError> {
        let config = parse_config::<C>(Some(raw))?;
        Ok(ParsedConsumerConfig {
            index: config.index(),
            config: ParsedConfig::new(config),
        })
    }
}

/// Deserializes a consumer's auth config, accepting either a JSON value or a
/// string holding JSON.
pub(crate) fn json_or_string(raw: &serde_json::Value) -> Result<serde_json::Value, ParseError> {
    match raw {
        serde_json::Value::String(text) => Ok(serde_json::from_str(text)?),
        value => Ok(value.clone()),
    }
}
