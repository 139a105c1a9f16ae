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

use serde::{Deserialize, Serialize};

/// Informational classification of a plugin. It does not affect the
/// execution order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Category {
    Security,
    Authn,
    Authz,
    Traffic,
    Transform,
    Observability,
    #[default]
    General,
}

/// The coarse slot a plugin occupies in the execution order. Variants are
/// declared in ascending order, and the derived [`Ord`] is the execution
/// order.
///
/// * `Listener` and `Network` are reserved for non-HTTP native plugins.
/// * `Outer` and `Inner` are reserved for native HTTP plugins, which run
///   before and after every managed plugin respectively.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum OrderPosition {
    Listener,
    Network,
    Outer,
    Access,
    Authn,
    Authz,
    Traffic,
    Transform,
    #[default]
    Unspecified,
    BeforeUpstream,
    Stats,
    Inner,
}

impl OrderPosition {
    /// Positions that only native plugins may use.
    pub fn is_native_only(self) -> bool {
        matches!(self, Self::Outer | Self::Inner)
    }

    /// Positions a native plugin is allowed to use.
    pub fn is_valid_for_native(self) -> bool {
        matches!(
            self,
            Self::Outer | Self::Inner | Self::Listener | Self::Network
        )
    }
}

/// Tie-break applied between plugins sharing the same [`OrderPosition`].
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
#[repr(i8)]
pub enum OrderOperation {
    InsertFirst = -1,
    #[default]
    Nop = 0,
    InsertLast = 1,
}

/// Where a plugin runs relative to the other plugins.
///
/// Ordering compares `position` first and `operation` second; the registry
/// uses the plugin name as the final tie-break.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PluginOrder {
    pub position: OrderPosition,
    #[serde(default)]
    pub operation: OrderOperation,
}

impl PluginOrder {
    pub const fn new(position: OrderPosition) -> Self {
        Self {
            position,
            operation: OrderOperation::Nop,
        }
    }

    pub const fn with_operation(mut self, operation: OrderOperation) -> Self {
        self.operation = operation;
        self
    }
}
