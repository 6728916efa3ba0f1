/**
 * Handler chains
 *
 * Ordered stages invoked for every event of one resource kind. Stages run in
 * the order they were appended, and a failing stage aborts the rest of the
 * chain; the dispatch queue then retries the whole chain from the first
 * stage, so every stage must be idempotent.
 */
use super::errors::{lock_poisoned_error, not_synced_error};
use super::mirror::SyncFlag;
use crate::error::Result;
use crate::model::Event;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// One stage of a handler chain
pub type Handler<K> = Arc<dyn Fn(&K, Event) -> Result<()> + Send + Sync>;

/// Fails until every registered mirror has merged its initial listing
#[derive(Debug, Clone, Default)]
pub struct SyncGate {
    mirrors: Vec<(String, SyncFlag)>,
}

impl SyncGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn watch(mut self, kind: &str, flag: SyncFlag) -> Self {
        self.mirrors.push((kind.to_string(), flag));
        self
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.mirrors.iter().all(|(_, flag)| flag.is_set())
    }

    /// # Errors
    ///
    /// Returns a `NotSynced` error naming every mirror still waiting on its initial list
    pub fn check(&self) -> Result<()> {
        let pending: Vec<&str> = self
            .mirrors
            .iter()
            .filter(|(_, flag)| !flag.is_set())
            .map(|(kind, _)| kind.as_str())
            .collect();

        if pending.is_empty() {
            Ok(())
        } else {
            Err(not_synced_error(&pending))
        }
    }
}

pub struct ChainHandler<K> {
    funcs: RwLock<Vec<Handler<K>>>,
}

impl<K> Default for ChainHandler<K> {
    fn default() -> Self {
        Self {
            funcs: RwLock::new(Vec::new()),
        }
    }
}

impl<K> ChainHandler<K>
where
    K: kube::Resource + 'static,
{
    /// A chain whose first stage is the synchronization gate
    #[must_use]
    pub fn gated(gate: SyncGate) -> Self {
        let notify: Handler<K> = Arc::new(move |obj: &K, event: Event| {
            gate.check()?;
            debug!(
                "📨 Event {}: key {}/{}",
                event,
                kube::ResourceExt::namespace(obj).unwrap_or_default(),
                kube::ResourceExt::name_any(obj)
            );
            Ok(())
        });

        Self {
            funcs: RwLock::new(vec![notify]),
        }
    }

    /// Append a stage to the end of the chain
    ///
    /// # Errors
    ///
    /// Returns an error if the chain lock is poisoned
    pub fn append<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&K, Event) -> Result<()> + Send + Sync + 'static,
    {
        self.funcs
            .write()
            .map_err(|_| lock_poisoned_error("handler chain"))?
            .push(Arc::new(f));
        Ok(())
    }

    /// Run every stage in order, stopping at the first failure
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing stage
    pub fn apply(&self, obj: &K, event: Event) -> Result<()> {
        // Snapshot so stages may be appended while a chain is running
        let funcs = self
            .funcs
            .read()
            .map_err(|_| lock_poisoned_error("handler chain"))?
            .clone();

        for f in &funcs {
            f(obj, event)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.funcs.read().map_or(0, |funcs| funcs.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
