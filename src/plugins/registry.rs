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

use std::{cmp::Ordering, collections::HashMap, ops::ControlFlow, sync::Arc};

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;

use super::{
    Category, ConsumerConfigParser, FilterFactory, Plugin, PluginOrder, RegistrationError,
};

static REGISTRY: Lazy<PluginRegistry> = Lazy::new(PluginRegistry::default);

/// How a plugin's logic is executed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PluginKind {
    /// Runs inside the filter manager's per-request loop.
    Managed,
    /// Runs as an opaque stage of the host's own filter chain. Only known
    /// here for ordering.
    Native,
}

/// Identifies one plugin type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PluginDescriptor {
    pub name: String,
    pub kind: PluginKind,
    pub category: Category,
    pub order: PluginOrder,
    /// Whether the plugin supplies per-consumer auth config.
    pub consumer: bool,
}

/// A runnable plugin, with the capabilities probed once at registration.
pub struct RegisteredPlugin {
    descriptor: Arc<PluginDescriptor>,
    factory: Option<Arc<dyn FilterFactory>>,
    consumer_parser: Option<Arc<dyn ConsumerConfigParser>>,
    native_type_url: Option<&'static str>,
}

impl RegisteredPlugin {
    fn classify(name: &str, plugin: &dyn Plugin) -> Result<Self, RegistrationError> {
        let order = plugin.order();
        let factory = plugin.filter_factory();
        let native_type_url = plugin.native_type_url();

        let kind = if factory.is_some() {
            if order.position.is_native_only() {
                return Err(RegistrationError::ManagedPosition);
            }
            PluginKind::Managed
        } else if native_type_url.is_some() {
            if !order.position.is_valid_for_native() {
                return Err(RegistrationError::NativePosition);
            }
            PluginKind::Native
        } else {
            return Err(RegistrationError::UnknownKind);
        };

        let consumer_parser = plugin.consumer_parser();
        if consumer_parser.is_some() && order.position != super::OrderPosition::Authn {
            return Err(RegistrationError::ConsumerPosition);
        }

        Ok(Self {
            descriptor: Arc::new(PluginDescriptor {
                name: name.to_owned(),
                kind,
                category: plugin.category(),
                order,
                consumer: consumer_parser.is_some(),
            }),
            factory,
            consumer_parser,
            native_type_url,
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &Arc<PluginDescriptor> {
        &self.descriptor
    }

    pub fn order(&self) -> PluginOrder {
        self.descriptor.order
    }

    /// The parser and factory of a managed plugin.
    pub fn filter_factory(&self) -> Option<&Arc<dyn FilterFactory>> {
        self.factory.as_ref()
    }

    pub fn consumer_parser(&self) -> Option<&Arc<dyn ConsumerConfigParser>> {
        self.consumer_parser.as_ref()
    }

    pub fn native_type_url(&self) -> Option<&'static str> {
        self.native_type_url
    }
}

impl std::fmt::Debug for RegisteredPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredPlugin")
            .field("descriptor", &self.descriptor)
            .field("native_type_url", &self.native_type_url)
            .finish_non_exhaustive()
    }
}

/// Registry of every plugin known to the process.
///
/// Types and runnable plugins are kept apart: registering a type only makes
/// it available for validating configuration, while registering a plugin
/// makes it runnable and also registers its type. Writes are expected at
/// startup and replace a snapshot, so lookups never take a lock.
#[derive(Default)]
pub struct PluginRegistry {
    types: ArcSwap<HashMap<String, Arc<PluginDescriptor>>>,
    plugins: ArcSwap<HashMap<String, Arc<RegisteredPlugin>>>,
}

impl PluginRegistry {
    /// The process wide registry.
    pub fn global() -> &'static Self {
        &REGISTRY
    }

    /// Inserts or replaces the type named `name`.
    pub fn register_type(&self, name: &str, descriptor: PluginDescriptor) {
        let descriptor = Arc::new(descriptor);
        let previous = self.types.rcu(|types| {
            let mut types = HashMap::clone(types);
            types.insert(name.to_owned(), descriptor.clone());
            types
        });

        if !previous.contains_key(name) {
            tracing::info!(plugin = name, "register plugin type");
        }
    }

    /// Inserts or replaces the runnable plugin named `name`.
    ///
    /// # Panics
    /// If the plugin's kind or order position is invalid, as that is a
    /// programming error in the plugin.
    pub fn register(&self, name: &str, plugin: Arc<dyn Plugin>) {
        if let Err(error) = self.try_register(name, plugin) {
            panic!("failed to register plugin {name}: {error}");
        }
    }

    /// Like [`PluginRegistry::register`], returning the validation error
    /// instead of panicking.
    pub fn try_register(&self, name: &str, plugin: Arc<dyn Plugin>) -> Result<(), RegistrationError> {
        let registered = Arc::new(RegisteredPlugin::classify(name, &*plugin)?);

        if let Err(error) = plugin.register_metrics(crate::metrics::registry()) {
            tracing::warn!(plugin = name, %error, "failed to register plugin metrics");
        }

        self.register_type(name, PluginDescriptor::clone(registered.descriptor()));
        self.plugins.rcu(|plugins| {
            let mut plugins = HashMap::clone(plugins);
            plugins.insert(name.to_owned(), registered.clone());
            plugins
        });

        tracing::debug!(plugin = name, kind = ?registered.descriptor.kind, "registered plugin");
        Ok(())
    }

    pub fn load(&self, name: &str) -> Option<Arc<RegisteredPlugin>> {
        self.plugins.load().get(name).cloned()
    }

    pub fn load_type(&self, name: &str) -> Option<Arc<PluginDescriptor>> {
        self.types.load().get(name).cloned()
    }

    /// Calls `f` for every runnable plugin in no particular order, until it
    /// returns [`ControlFlow::Break`].
    pub fn iterate(&self, mut f: impl FnMut(&str, &RegisteredPlugin) -> ControlFlow<()>) {
        for (name, plugin) in self.plugins.load().iter() {
            if f(name, plugin).is_break() {
                return;
            }
        }
    }

    /// Calls `f` for every plugin type in no particular order, until it
    /// returns [`ControlFlow::Break`].
    pub fn iterate_types(&self, mut f: impl FnMut(&str, &PluginDescriptor) -> ControlFlow<()>) {
        for (name, descriptor) in self.types.load().iter() {
            if f(name, descriptor).is_break() {
                return;
            }
        }
    }

    /// Removes `name` from both the types and the runnable plugins. Only meant
    /// to be called at startup.
    pub fn disable(&self, name: &str) {
        self.plugins.rcu(|plugins| {
            let mut plugins = HashMap::clone(plugins);
            plugins.remove(name);
            plugins
        });
        self.types.rcu(|types| {
            let mut types = HashMap::clone(types);
            types.remove(name);
            types
        });
        tracing::info!(plugin = name, "disabled plugin");
    }

    /// Total order of two runnable plugins: position, then operation, then
    /// name. Falls back to comparing names when either is unregistered.
    pub fn compare_order(&self, a: &str, b: &str) -> Ordering {
        let plugins = self.plugins.load();
        match (plugins.get(a), plugins.get(b)) {
            (Some(pa), Some(pb)) => pa.order().cmp(&pb.order()).then_with(|| a.cmp(b)),
            _ => a.cmp(b),
        }
    }
}
