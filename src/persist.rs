//! Load-on-start, mutate-in-memory, persist-whole-on-change state cell.
//!
//! The in-memory value is authoritative for the running process. Every
//! change bumps a revision and the whole value is rewritten to the
//! key-value store; a flush never replaces a newer snapshot with an older
//! one, so a failed write is healed by the next successful one.

use crate::traits::KeyValueStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// On-disk envelope, `{"state": ..., "version": 0}`.
#[derive(Serialize, Deserialize)]
struct StoredState<T> {
    state: T,
    #[serde(default)]
    version: u32,
}

const STATE_VERSION: u32 = 0;

struct Revision<T> {
    value: T,
    revision: u64,
}

pub struct Persisted<T> {
    name: &'static str,
    store: Arc<dyn KeyValueStore>,
    inner: Mutex<Revision<T>>,
    flushed: tokio::sync::Mutex<u64>,
}

impl<T> Persisted<T>
where
    T: Serialize + DeserializeOwned + Default + Send,
{
    /// Reads the value stored under `name`. Missing or unreadable state starts empty.
    pub async fn load(store: Arc<dyn KeyValueStore>, name: &'static str) -> Self {
        let value = match store.get(name).await {
            Ok(Some(blob)) => match serde_json::from_str::<StoredState<T>>(&blob) {
                Ok(stored) => {
                    debug!("Loaded '{}' (version {})", name, stored.version);
                    stored.state
                }
                Err(e) => {
                    warn!("Discarding unreadable state '{}': {}", name, e);
                    T::default()
                }
            },
            Ok(None) => {
                debug!("No stored state for '{}', starting empty", name);
                T::default()
            }
            Err(e) => {
                warn!("Failed to load state '{}': {}", name, e);
                T::default()
            }
        };

        Self {
            name,
            store,
            inner: Mutex::new(Revision { value, revision: 0 }),
            flushed: tokio::sync::Mutex::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Revision<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.lock().value)
    }

    /// Applies `f` in memory only. Returning `None` marks the call as a no-op.
    pub fn apply<R>(&self, f: impl FnOnce(&mut T) -> Option<R>) -> Option<R> {
        let mut inner = self.lock();
        let result = f(&mut inner.value);
        if result.is_some() {
            inner.revision += 1;
        }
        result
    }

    /// Applies `f` and persists the result when it changed anything.
    pub async fn update<R, F>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut T) -> Option<R> + Send,
        R: Send,
    {
        let result = self.apply(f);
        if result.is_some() {
            self.flush().await;
        }
        result
    }

    /// Writes the latest snapshot if it is newer than the last successful write.
    pub async fn flush(&self) {
        let mut flushed = self.flushed.lock().await;

        let snapshot = {
            let inner = self.lock();
            if inner.revision <= *flushed {
                return;
            }
            let stored = StoredState {
                state: &inner.value,
                version: STATE_VERSION,
            };
            serde_json::to_string(&stored).map(|blob| (inner.revision, blob))
        };

        match snapshot {
            Ok((revision, blob)) => match self.store.set(self.name, &blob).await {
                Ok(()) => *flushed = revision,
                Err(e) => warn!("Failed to persist '{}': {}", self.name, e),
            },
            Err(e) => warn!("Failed to serialize '{}': {}", self.name, e),
        }
    }
}
