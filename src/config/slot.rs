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

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

type Watcher<T> = Box<dyn Fn(&Arc<T>) + Send + Sync>;

/// A shared, atomically replaced value. Readers never block, each store is
/// announced to the slot's watchers.
pub struct Slot<T> {
    inner: Arc<ArcSwapOption<T>>,
    version: Arc<AtomicU64>,
    watchers: Arc<Mutex<Vec<Watcher<T>>>>,
}

impl<T> Slot<T> {
    pub fn new(value: impl Into<Option<T>>) -> Self {
        Self {
            inner: Arc::new(ArcSwapOption::new(value.into().map(Arc::new))),
            version: <_>::default(),
            watchers: <_>::default(),
        }
    }

    pub fn empty() -> Self {
        Self::new(None)
    }

    /// Calls `watcher` with every value stored from now on.
    pub fn watch(&self, watcher: impl Fn(&Arc<T>) + Send + Sync + 'static) {
        tracing::trace!("adding new watcher");
        self.watchers.lock().push(Box::new(watcher));
    }

    pub fn is_some(&self) -> bool {
        self.inner.load().is_some()
    }

    pub fn load(&self) -> Option<Arc<T>> {
        self.inner.load_full()
    }

    /// The number of values stored so far.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn store(&self, value: impl Into<Arc<T>>) {
        let value = value.into();
        tracing::trace!("storing new value");
        self.inner.store(Some(value.clone()));
        self.version.fetch_add(1, Ordering::AcqRel);

        for watcher in self.watchers.lock().iter() {
            (watcher)(&value);
        }
    }

    pub fn remove(&self) {
        self.inner.store(None);
        self.version.fetch_add(1, Ordering::AcqRel);
    }
}

impl<T: Default> Slot<T> {
    pub fn load_or_default(&self) -> Arc<T> {
        self.load().unwrap_or_default()
    }
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            version: self.version.clone(),
            watchers: self.watchers.clone(),
        }
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("value", &self.inner.load())
            .field("version", &self.version())
            .finish()
    }
}

impl<T> From<T> for Slot<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn store_notifies_watchers() {
        let slot = Slot::<String>::empty();
        assert!(!slot.is_some());
        assert_eq!("", *slot.load_or_default());

        let seen = Arc::new(AtomicUsize::new(0));
        slot.watch({
            let seen = seen.clone();
            move |value| {
                assert_eq!("reloaded", value.as_str());
                seen.fetch_add(1, Ordering::SeqCst);
            }
        });

        let clone = slot.clone();
        clone.store(String::from("reloaded"));
        assert_eq!(1, seen.load(Ordering::SeqCst));
        assert_eq!(Some("reloaded"), slot.load().as_deref().map(String::as_str));
        assert_eq!(1, slot.version());

        slot.remove();
        assert!(clone.load().is_none());
        assert_eq!(1, seen.load(Ordering::SeqCst));
        assert_eq!(2, clone.version());
    }
}
