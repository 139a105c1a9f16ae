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

use std::sync::Arc;

use http::HeaderName;
use serde::{Deserialize, Serialize};

use crate::filters::prelude::*;
use crate::plugins::{consumer_parser, ConsumerConfigParser, FilterFactory};

pub const NAME: &str = "keyAuth";

/// Authenticates a request by a key presented in one of the configured
/// headers, and identifies the consumer owning that key.
pub struct KeyAuth;

impl Plugin for KeyAuth {
    fn category(&self) -> Category {
        Category::Authn
    }

    fn order(&self) -> PluginOrder {
        PluginOrder::new(OrderPosition::Authn)
    }

    fn filter_factory(&self) -> Option<Arc<dyn FilterFactory>> {
        Some(Self::factory())
    }

    fn consumer_parser(&self) -> Option<Arc<dyn ConsumerConfigParser>> {
        Some(consumer_parser::<self::ConsumerConfig>())
    }
}

impl FilterPlugin for KeyAuth {
    type Config = Config;

    fn create_filter(config: Arc<Config>, callbacks: Arc<FilterCallbackHandler>) -> Box<dyn Filter> {
        Box::new(KeyAuthFilter { config, callbacks })
    }
}

/// Config represents [`KeyAuth`]'s configuration for a route.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Where to look for the key, checked in order. The first source which
    /// is present decides the outcome.
    #[serde(default)]
    pub keys: Vec<Key>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Key {
    /// Header name.
    pub name: String,
}

impl PluginConfig for Config {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.keys.is_empty() {
            return Err(ValidationError::MissingField("keys"));
        }

        for key in &self.keys {
            if key.name.is_empty() {
                return Err(ValidationError::invalid("keys.name", "must not be empty"));
            }
            if HeaderName::try_from(key.name.as_str()).is_err() {
                return Err(ValidationError::invalid(
                    "keys.name",
                    format!("{:?} is not a valid header name", key.name),
                ));
            }
        }

        Ok(())
    }
}

/// The key a consumer authenticates with.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub key: String,
}

impl PluginConfig for ConsumerConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.key.is_empty() {
            return Err(ValidationError::MissingField("key"));
        }
        Ok(())
    }
}

impl crate::plugins::ConsumerConfig for ConsumerConfig {
    fn index(&self) -> String {
        self.key.clone()
    }
}

struct KeyAuthFilter {
    config: Arc<Config>,
    callbacks: Arc<FilterCallbackHandler>,
}

impl KeyAuthFilter {
    fn verify(&self, key: &[u8]) -> ResultAction {
        let consumer = std::str::from_utf8(key)
            .ok()
            .and_then(|key| self.callbacks.lookup_consumer(NAME, key));

        match consumer {
            Some(consumer) => {
                self.callbacks.set_consumer(consumer);
                ResultAction::Continue
            }
            None => LocalResponse::new(401).with_msg("invalid key").into(),
        }
    }
}

impl Filter for KeyAuthFilter {
    fn decode_headers(&mut self, headers: &mut HeaderMap, _: bool) -> ResultAction {
        for key in &self.config.keys {
            let mut values = headers.get_all(key.name.as_str()).iter();
            match (values.next(), values.next()) {
                (Some(value), None) => return self.verify(value.as_bytes()),
                (Some(_), Some(_)) => {
                    return LocalResponse::new(401)
                        .with_msg("duplicate key found")
                        .into()
                }
                (None, _) => {}
            }
        }

        ResultAction::Continue
    }
}
