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

use std::path::PathBuf;

use serde::Serialize;

use crate::{
    config::ConfigFile,
    consumer::Consumer,
    manager::{FilterManagerConfig, FilterManagerFactory},
};

/// Parses a configuration file and prints the filter chain it resolves to.
#[derive(clap::Args, Clone, Debug)]
pub struct Check {
    /// The configuration file, YAML or JSON.
    pub path: PathBuf,
    /// Fail if any plugin or consumer was left out.
    #[clap(long)]
    pub strict: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    namespace: String,
    filters: Vec<ReportFilter>,
    skipped: Vec<String>,
    consumers: usize,
    invalid_consumers: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ReportFilter {
    name: String,
    consumer_stage: bool,
    non_blocking: String,
}

impl Check {
    pub async fn run(&self) -> crate::Result<()> {
        let file = ConfigFile::read(&self.path).await?;
        let report = report(&file);
        println!("{}", serde_json::to_string_pretty(&report)?);

        if self.strict && (!report.skipped.is_empty() || !report.invalid_consumers.is_empty()) {
            eyre::bail!(
                "{} plugin(s) skipped, {} consumer(s) invalid",
                report.skipped.len(),
                report.invalid_consumers.len()
            );
        }
        Ok(())
    }
}

fn report(file: &ConfigFile) -> Report {
    // Consumers are only parsed, the consumer store is left alone.
    let invalid_consumers: Vec<_> = file
        .consumers
        .iter()
        .filter_map(|(name, spec)| {
            Consumer::parse(&file.namespace, name, spec)
                .err()
                .map(|error| format!("{name}: {error}"))
        })
        .collect();
    let factory = FilterManagerFactory::new(FilterManagerConfig::from_spec(&file.spec()));
    let config = factory.config();

    let filters = config
        .filters()
        .iter()
        .enumerate()
        .map(|(index, filter)| ReportFilter {
            name: filter.name().to_owned(),
            consumer_stage: index < config.consumer_filters_end_at(),
            non_blocking: format!("{:?}", filter.non_blocking_phases()),
        })
        .collect();

    Report {
        namespace: file.namespace.clone(),
        filters,
        skipped: config.skipped().to_vec(),
        consumers: file.consumers.len() - invalid_consumers.len(),
        invalid_consumers,
    }
}
