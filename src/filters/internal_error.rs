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

use super::prelude::*;

/// Stands in for a plugin whose configuration could not be initialised.
/// Every request through it is answered with a `500`.
#[derive(Debug)]
pub struct InternalErrorFilter {
    plugin: String,
    error: String,
}

impl InternalErrorFilter {
    pub fn new(plugin: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            error: error.into(),
        }
    }
}

impl Filter for InternalErrorFilter {
    fn decode_headers(&mut self, _: &mut HeaderMap, _: bool) -> ResultAction {
        tracing::error!(plugin = %self.plugin, error = %self.error, "error in plugin");
        LocalResponse::new(500).into()
    }
}
