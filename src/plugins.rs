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

//! Plugin descriptors, their ordering, and the registry of known plugins.

mod error;
mod order;
mod parser;
mod registry;

pub mod key_auth;
pub mod limit_req;

use std::{cmp::Ordering, sync::Arc, sync::Once};

#[doc(inline)]
pub use self::{
    error::{ParseError, RegistrationError, ValidationError},
    order::{Category, OrderOperation, OrderPosition, PluginOrder},
    parser::{
        consumer_parser, parse_config, ConsumerConfig, ConsumerConfigParser, FilterFactory,
        FilterPlugin, ParsedConfig, ParsedConsumerConfig, PluginConfig,
    },
    registry::{PluginDescriptor, PluginKind, PluginRegistry, RegisteredPlugin},
};

pub(crate) use self::parser::json_or_string;

/// A plugin, as registered with the [`PluginRegistry`].
///
/// Which capabilities a plugin has is decided once when it is registered:
/// a plugin returning a [`FilterFactory`] is managed and runs inside the
/// filter manager, a plugin returning a native type URL runs inside the
/// host. A plugin returning a [`ConsumerConfigParser`] additionally supplies
/// per-consumer configuration and must use [`OrderPosition::Authn`].
///
/// ```
/// use std::sync::Arc;
/// use tollgate::filters::prelude::*;
///
/// #[derive(Debug, Default, serde::Deserialize)]
/// struct Config {}
///
/// impl PluginConfig for Config {}
///
/// struct Greet;
///
/// impl Filter for Greet {
///     fn decode_headers(&mut self, headers: &mut HeaderMap, _: bool) -> ResultAction {
///         headers.insert("greeting", "hello".parse().unwrap());
///         ResultAction::Continue
///     }
/// }
///
/// struct GreetPlugin;
///
/// impl FilterPlugin for GreetPlugin {
///     type Config = Config;
///
///     fn create_filter(_: Arc<Config>, _: Arc<FilterCallbackHandler>) -> Box<dyn Filter> {
///         Box::new(Greet)
///     }
/// }
///
/// impl Plugin for GreetPlugin {
///     fn order(&self) -> PluginOrder {
///         PluginOrder::new(OrderPosition::Transform)
///     }
///
///     fn filter_factory(&self) -> Option<Arc<dyn tollgate::plugins::FilterFactory>> {
///         Some(Self::factory())
///     }
/// }
///
/// tollgate::plugins::register_plugin("greet", Arc::new(GreetPlugin));
/// ```
pub trait Plugin: Send + Sync + 'static {
    fn category(&self) -> Category {
        Category::General
    }

    fn order(&self) -> PluginOrder {
        PluginOrder::default()
    }

    fn filter_factory(&self) -> Option<Arc<dyn FilterFactory>> {
        None
    }

    fn native_type_url(&self) -> Option<&'static str> {
        None
    }

    fn consumer_parser(&self) -> Option<Arc<dyn ConsumerConfigParser>> {
        None
    }

    /// Registers the plugin's own metrics. Called once on registration.
    fn register_metrics(&self, _registry: &prometheus::Registry) -> prometheus::Result<()> {
        Ok(())
    }
}

pub fn register_plugin(name: &str, plugin: Arc<dyn Plugin>) {
    PluginRegistry::global().register(name, plugin)
}

pub fn register_plugin_type(name: &str, descriptor: PluginDescriptor) {
    PluginRegistry::global().register_type(name, descriptor)
}

pub fn load_plugin(name: &str) -> Option<Arc<RegisteredPlugin>> {
    PluginRegistry::global().load(name)
}

pub fn load_plugin_type(name: &str) -> Option<Arc<PluginDescriptor>> {
    PluginRegistry::global().load_type(name)
}

pub fn disable_plugin(name: &str) {
    PluginRegistry::global().disable(name)
}

pub fn compare_plugin_order(a: &str, b: &str) -> Ordering {
    PluginRegistry::global().compare_order(a, b)
}

/// Registers the plugins shipped with this crate. Safe to call repeatedly.
pub fn load_builtin_plugins() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        register_plugin(key_auth::NAME, Arc::new(key_auth::KeyAuth));
        register_plugin(limit_req::NAME, Arc::new(limit_req::LimitReq));
    });
}
