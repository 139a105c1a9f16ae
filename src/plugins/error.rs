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

/// A plugin that cannot be registered. These are programming errors in the
/// plugin and are fatal at startup.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum RegistrationError {
    #[error("a plugin should be either managed or native")]
    UnknownKind,
    #[error(
        "invalid plugin order position: managed plugin should not use OrderPosition::Outer or OrderPosition::Inner"
    )]
    ManagedPosition,
    #[error(
        "invalid plugin order position: native plugin should use OrderPosition::Outer, Inner, Listener or Network"
    )]
    NativePosition,
    #[error("invalid plugin order position: consumer plugin should use OrderPosition::Authn")]
    ConsumerPosition,
}

/// A configuration value which failed its validation.
#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("field `{}` is invalid, reason: {}", field, reason)]
    FieldInvalid { field: String, reason: String },
    #[error("field `{}` is required but not found", .0)]
    MissingField(&'static str),
}

impl ValidationError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::FieldInvalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// An error produced while turning a configuration payload into a parsed
/// configuration.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("failed to unmarshal config: {}", .0)]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {}", .0)]
    Validation(#[from] ValidationError),
    #[error("plugin config parser panic")]
    Panic,
    #[error("bad TypedStruct format")]
    BadTypedStruct,
    #[error("plugin {} not found", .0)]
    UnknownPlugin(String),
    #[error("plugin {} is not for consumer", .0)]
    NotConsumerPlugin(String),
    #[error("{} during parsing plugin {}", source, name)]
    Plugin {
        name: String,
        #[source]
        source: Box<ParseError>,
    },
}

impl ParseError {
    pub fn in_plugin(self, name: impl Into<String>) -> Self {
        Self::Plugin {
            name: name.into(),
            source: Box::new(self),
        }
    }
}
