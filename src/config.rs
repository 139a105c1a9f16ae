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

//! Configuration files and their hot reload.

mod slot;
pub mod watch;

use std::{collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};

pub use self::slot::Slot;

use crate::{
    consumer::{ConsumerSpec, ConsumerStore},
    manager::{FilterManagerConfig, FilterManagerFactory, FilterManagerSpec, PluginEntry},
};

/// A configuration file: the plugin list of one filter manager and the
/// consumers of its namespace. YAML or JSON.
///
/// ```yaml
/// namespace: default
/// plugins:
///   - name: keyAuth
///     config:
///       keys:
///         - name: Authorization
/// consumers:
///   rick:
///     auth:
///       keyAuth:
///         key: rick
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub consumers: BTreeMap<String, ConsumerSpec>,
}

impl ConfigFile {
    pub fn from_slice(buf: &[u8]) -> crate::Result<Self> {
        Ok(serde_yaml::from_slice(buf)?)
    }

    pub async fn read(path: &Path) -> crate::Result<Self> {
        tracing::trace!(path = %path.display(), "reading file");
        let buf = tokio::fs::read(path).await?;
        Self::from_slice(&buf)
    }

    pub fn spec(&self) -> FilterManagerSpec {
        FilterManagerSpec {
            namespace: self.namespace.clone(),
            plugins: self.plugins.clone(),
        }
    }

    /// Loads the consumers into `store` and parses the plugin list.
    pub fn apply_to(&self, store: &ConsumerStore) -> FilterManagerFactory {
        let consumers = store.update(&self.namespace, &self.consumers);
        if consumers != self.consumers.len() {
            tracing::warn!(
                namespace = %self.namespace,
                loaded = consumers,
                configured = self.consumers.len(),
                "some consumers were not loaded"
            );
        }

        FilterManagerFactory::new(FilterManagerConfig::from_spec(&self.spec()))
    }

    /// [`ConfigFile::apply_to`] the global consumer store.
    pub fn apply(&self) -> FilterManagerFactory {
        self.apply_to(ConsumerStore::global())
    }
}
