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

use tokio::signal;

use crate::{config::Slot, manager::FilterManagerFactory};

/// Watches a configuration file and logs every reload until interrupted.
#[derive(clap::Args, Clone, Debug)]
pub struct Watch {
    /// The configuration file, YAML or JSON.
    pub path: PathBuf,
}

impl Watch {
    pub async fn run(&self) -> crate::Result<()> {
        let slot = Slot::<FilterManagerFactory>::empty();
        slot.watch(|factory| {
            let config = factory.config();
            let filters: Vec<_> = config.filters().iter().map(|filter| filter.name()).collect();
            tracing::info!(
                namespace = config.namespace(),
                ?filters,
                skipped = ?config.skipped(),
                non_blocking = ?factory.non_blocking_phases(),
                "configuration loaded"
            );
        });

        #[cfg(target_os = "linux")]
        let mut sig_term_fut = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        #[cfg(target_os = "linux")]
        let sig_term = sig_term_fut.recv();
        #[cfg(not(target_os = "linux"))]
        let sig_term = std::future::pending::<Option<()>>();

        tokio::select! {
            result = crate::config::watch::fs(slot, self.path.clone()) => result,
            _ = signal::ctrl_c() => {
                tracing::info!(signal = "SIGINT", "shutting down from signal");
                Ok(())
            }
            _ = sig_term => {
                tracing::info!(signal = "SIGTERM", "shutting down from signal");
                Ok(())
            }
        }
    }
}
