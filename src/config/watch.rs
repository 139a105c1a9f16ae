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

//! Keeps a [`Slot`] up to date with a configuration file.

use std::path::{Path, PathBuf};

use notify::Watcher;
use tracing::Instrument;

use super::{ConfigFile, Slot};
use crate::manager::FilterManagerFactory;

/// Loads `path` into `slot`, then reloads it each time the file is written.
///
/// Failing to read or parse the file initially is an error. A later file
/// that fails to parse is logged and the previous configuration stays.
pub async fn fs(slot: Slot<FilterManagerFactory>, path: impl Into<PathBuf>) -> crate::Result<()> {
    let path = path.into();
    let span = tracing::info_span!("config_provider", path = %path.display());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    async fn watch_inner(
        slot: &Slot<FilterManagerFactory>,
        path: &Path,
        tx: tokio::sync::mpsc::UnboundedSender<Result<notify::Event, notify::Error>>,
    ) -> crate::Result<notify::RecommendedWatcher> {
        tracing::info!("watching configuration file");
        let mut watcher = notify::RecommendedWatcher::new(
            move |res| {
                // The receiver is only gone once the watch has stopped.
                let _ = tx.send(res);
            },
            Default::default(),
        )?;

        let file = ConfigFile::read(path).await?;
        tracing::info!(namespace = %file.namespace, "applying initial configuration");
        slot.store(file.apply());
        watcher.watch(path, notify::RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }

    let _watcher = watch_inner(&slot, &path, tx)
        .instrument(span.clone())
        .await?;

    while let Some(event) = rx.recv().instrument(span.clone()).await.transpose()? {
        tracing::trace!(parent: &span, event = ?event.kind, "new file event");

        if !matches!(
            event.kind,
            notify::EventKind::Modify(notify::event::ModifyKind::Data(_))
        ) {
            continue;
        }

        for path in event.paths {
            // Writers do not always finish before the event arrives.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            reload(&slot, &path).instrument(span.clone()).await;
        }
    }

    Err(eyre::eyre!("filesystem watch unexpectedly stopped"))
}

async fn reload(slot: &Slot<FilterManagerFactory>, path: &Path) {
    tracing::info!(path = %path.display(), "file changed, updating config");
    match ConfigFile::read(path).await {
        Ok(file) => slot.store(file.apply()),
        Err(error) => {
            tracing::error!(%error, "invalid configuration, keeping the previous one");
        }
    }
}
