/**
 * Resource mirror
 *
 * Thread-safe local snapshot of one resource kind, kept in sync with a
 * `WatchSource` through an initial list, an incremental watch and periodic
 * full relists. Every observed change is handed to an event sink exactly once.
 */
use super::config::{INITIAL_BACKOFF_SECONDS, MAX_BACKOFF_SECONDS};
use super::errors::lock_poisoned_error;
use super::source::{SourceEvent, WatchSource};
use crate::error::Result;
use crate::model::Event;
use futures::StreamExt;
use kube::{Resource, ResourceExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Receives every change a mirror observes
pub type EventSink<K> = Arc<dyn Fn(Arc<K>, Event) + Send + Sync>;

type Change<K> = (Arc<K>, Event);

/// Store key for an object: `namespace/name`, or `name` for cluster-scoped kinds
#[must_use]
pub fn key_func(name: &str, namespace: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    }
}

fn object_key<K: Resource>(obj: &K) -> String {
    key_func(&obj.name_any(), &obj.namespace().unwrap_or_default())
}

/// Shared "initial list merged" flag, readable without holding the mirror
#[derive(Debug, Clone, Default)]
pub struct SyncFlag(Arc<AtomicBool>);

impl SyncFlag {
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn set(&self) {
        self.0.store(true, Ordering::Release);
    }
}

pub struct Mirror<K> {
    kind: String,
    store: RwLock<HashMap<String, Arc<K>>>,
    synced: SyncFlag,
    resync_period: Duration,
}

impl<K> Mirror<K>
where
    K: Resource + Clone + PartialEq + Send + Sync + 'static,
    <K as Resource>::DynamicType: Default,
{
    #[must_use]
    pub fn new(resync_period: Duration) -> Self {
        Self {
            kind: K::kind(&K::DynamicType::default()).to_string(),
            store: RwLock::new(HashMap::new()),
            synced: SyncFlag::default(),
            resync_period,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Point lookup; cluster-scoped objects use an empty namespace
    #[must_use]
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.get_by_key(&key_func(name, namespace))
    }

    #[must_use]
    pub fn get_by_key(&self, key: &str) -> Option<Arc<K>> {
        match self.store.read() {
            Ok(store) => store.get(key).cloned(),
            Err(_) => {
                warn!("{} mirror lock poisoned, treating {} as missing", self.kind, key);
                None
            }
        }
    }

    /// Point-in-time copy of every entry
    #[must_use]
    pub fn list(&self) -> Vec<Arc<K>> {
        self.store.read().map_or_else(
            |_| {
                warn!("{} mirror lock poisoned, listing nothing", self.kind);
                Vec::new()
            },
            |store| store.values().cloned().collect(),
        )
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.store.read().map_or(0, |store| store.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the initial full list has been merged
    #[must_use]
    pub fn has_synced(&self) -> bool {
        self.synced.is_set()
    }

    #[must_use]
    pub fn sync_flag(&self) -> SyncFlag {
        self.synced.clone()
    }

    /// Insert or replace an object. Deeply equal replacements produce no change.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned
    pub fn upsert(&self, obj: K) -> Result<Option<Change<K>>> {
        let key = object_key(&obj);
        let mut store = self
            .store
            .write()
            .map_err(|_| lock_poisoned_error(&format!("{} mirror store", self.kind)))?;

        let unchanged = store.get(&key).map(|old| **old == obj);
        let change = match unchanged {
            Some(true) => None,
            Some(false) => {
                let obj = Arc::new(obj);
                store.insert(key, obj.clone());
                Some((obj, Event::Update))
            }
            None => {
                let obj = Arc::new(obj);
                store.insert(key, obj.clone());
                Some((obj, Event::Add))
            }
        };
        drop(store);
        Ok(change)
    }

    /// Remove an object, reporting the delete with its final observed state.
    /// Deleting an object the mirror never held produces no change.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned
    pub fn remove(&self, obj: K) -> Result<Option<Change<K>>> {
        let key = object_key(&obj);
        let removed = self
            .store
            .write()
            .map_err(|_| lock_poisoned_error(&format!("{} mirror store", self.kind)))?
            .remove(&key);
        Ok(removed.map(|_| (Arc::new(obj), Event::Delete)))
    }

    /// Merge a full listing: new keys are added, changed keys updated and keys
    /// missing from the listing deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned
    pub fn replace(&self, items: Vec<K>) -> Result<Vec<Change<K>>> {
        let mut store = self
            .store
            .write()
            .map_err(|_| lock_poisoned_error(&format!("{} mirror store", self.kind)))?;

        let mut previous = std::mem::take(&mut *store);
        let mut changes = Vec::new();

        for obj in items {
            let key = object_key(&obj);
            match previous.remove(&key) {
                Some(old) if *old == obj => {
                    store.insert(key, old);
                }
                Some(_) => {
                    let obj = Arc::new(obj);
                    store.insert(key, obj.clone());
                    changes.push((obj, Event::Update));
                }
                None => {
                    let obj = Arc::new(obj);
                    store.insert(key, obj.clone());
                    changes.push((obj, Event::Add));
                }
            }
        }
        drop(store);

        changes.extend(previous.into_values().map(|old| (old, Event::Delete)));
        Ok(changes)
    }

    fn apply(&self, event: SourceEvent<K>) -> Result<Option<Change<K>>> {
        match event {
            SourceEvent::Added(obj) | SourceEvent::Modified(obj) => self.upsert(obj),
            SourceEvent::Deleted(obj) => self.remove(obj),
            SourceEvent::Bookmark(_) => Ok(None),
        }
    }

    fn resync_deadline(&self) -> Option<Instant> {
        if self.resync_period.is_zero() {
            None
        } else {
            Some(Instant::now() + self.resync_period)
        }
    }

    /// Keep the mirror in sync with `source` until `cancel` fires.
    ///
    /// Watch disconnects and list failures are retried here and never
    /// surface to callers; a missed event is repaired by the next relist.
    #[allow(clippy::cognitive_complexity)]
    pub async fn run(
        &self,
        source: Arc<dyn WatchSource<K>>,
        sink: EventSink<K>,
        cancel: CancellationToken,
    ) {
        info!("🔍 Starting {} mirror", self.kind);
        let mut backoff_seconds = INITIAL_BACKOFF_SECONDS;

        'relist: loop {
            let listing = tokio::select! {
                () = cancel.cancelled() => break 'relist,
                listing = source.list() => listing,
            };

            let mut resource_version = match listing {
                Ok(listing) => {
                    let count = listing.items.len();
                    match self.replace(listing.items) {
                        Ok(changes) => {
                            debug!("📋 {} relist: {} objects, {} changes", self.kind, count, changes.len());
                            dispatch(&sink, changes);
                        }
                        Err(e) => error!("❌ {} relist could not be merged: {}", self.kind, e),
                    }
                    if !self.synced.is_set() {
                        self.synced.set();
                        info!("✅ {} mirror synced ({} objects)", self.kind, count);
                    }
                    backoff_seconds = INITIAL_BACKOFF_SECONDS;
                    listing.resource_version
                }
                Err(e) => {
                    warn!(
                        "❌ {} list failed: {}, retrying in {}s",
                        self.kind, e, backoff_seconds
                    );
                    if !pause(&cancel, Duration::from_secs(backoff_seconds)).await {
                        break 'relist;
                    }
                    backoff_seconds = (backoff_seconds * 2).min(MAX_BACKOFF_SECONDS);
                    continue 'relist;
                }
            };

            let resync_at = self.resync_deadline();

            // Watch sessions, resumed from the last resource version until the
            // next resync or a watch error forces a relist.
            loop {
                let stream = tokio::select! {
                    () = cancel.cancelled() => break 'relist,
                    stream = source.watch(&resource_version) => stream,
                };
                let mut stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(
                            "❌ {} watch failed: {}, relisting in {}s",
                            self.kind, e, backoff_seconds
                        );
                        if !pause(&cancel, Duration::from_secs(backoff_seconds)).await {
                            break 'relist;
                        }
                        backoff_seconds = (backoff_seconds * 2).min(MAX_BACKOFF_SECONDS);
                        continue 'relist;
                    }
                };

                let mut delivered = false;
                loop {
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break 'relist,
                        () = resync_tick(resync_at) => {
                            debug!("🔄 {} periodic resync", self.kind);
                            continue 'relist;
                        }
                        next = stream.next() => match next {
                            Some(Ok(event)) => {
                                delivered = true;
                                if let Some(version) = event_version(&event) {
                                    resource_version = version;
                                }
                                match self.apply(event) {
                                    Ok(Some((obj, event))) => sink(obj, event),
                                    Ok(None) => {}
                                    Err(e) => error!("❌ {} watch event dropped: {}", self.kind, e),
                                }
                            }
                            Some(Err(e)) => {
                                warn!("❌ {} watch error: {}, relisting", self.kind, e);
                                if !pause(&cancel, Duration::from_secs(backoff_seconds)).await {
                                    break 'relist;
                                }
                                backoff_seconds = (backoff_seconds * 2).min(MAX_BACKOFF_SECONDS);
                                continue 'relist;
                            }
                            None => {
                                debug!("🔍 {} watch stream ended, resuming at {}", self.kind, resource_version);
                                break;
                            }
                        }
                    }
                }

                // A stream that closes without delivering anything would spin
                if !delivered && !pause(&cancel, Duration::from_secs(INITIAL_BACKOFF_SECONDS)).await {
                    break 'relist;
                }
            }
        }

        info!("🛑 {} mirror stopped", self.kind);
    }
}

fn dispatch<K>(sink: &EventSink<K>, changes: Vec<Change<K>>) {
    for (obj, event) in changes {
        sink(obj, event);
    }
}

fn event_version<K: Resource>(event: &SourceEvent<K>) -> Option<String> {
    match event {
        SourceEvent::Added(obj) | SourceEvent::Modified(obj) | SourceEvent::Deleted(obj) => {
            obj.resource_version()
        }
        SourceEvent::Bookmark(version) => Some(version.clone()),
    }
}

async fn resync_tick(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Sleep unless cancelled first; returns false on cancellation
async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = sleep(duration) => true,
    }
}
