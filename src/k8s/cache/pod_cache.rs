/**
 * Pod address index
 *
 * Maps pod IPs to the identity of the workload currently holding them. The
 * index is maintained by a stage of the pod handler chain and can always be
 * rebuilt from the pod mirror, so every update here is an idempotent upsert.
 */
use super::errors::lock_poisoned_error;
use super::mirror::{key_func, Mirror};
use crate::error::Result;
use crate::k8s::convert::convert_tags;
use crate::model::{Event, Tags};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodEntry {
    /// `namespace/name` of the owning pod
    pub key: String,
    pub namespace: String,
    pub tags: Tags,
    pub node_name: String,
    pub service_account: String,
}

impl PodEntry {
    fn from_pod(pod: &Pod) -> Self {
        let namespace = pod.namespace().unwrap_or_default();
        let spec = pod.spec.as_ref();
        Self {
            key: key_func(&pod.name_any(), &namespace),
            namespace,
            tags: convert_tags(pod.labels()),
            node_name: spec.and_then(|s| s.node_name.clone()).unwrap_or_default(),
            service_account: spec
                .and_then(|s| s.service_account_name.clone())
                .unwrap_or_default(),
        }
    }
}

fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()
        .and_then(|status| status.pod_ip.as_deref())
        .filter(|ip| !ip.is_empty())
}

/// Both directions of the address mapping, guarded together
#[derive(Debug, Default)]
struct Index {
    by_ip: HashMap<String, PodEntry>,
    /// Address last recorded for each pod key
    by_pod: HashMap<String, String>,
}

impl Index {
    /// Forget the address recorded for `key`, unless another pod took it over
    fn release(&mut self, key: &str) {
        let Some(ip) = self.by_pod.remove(key) else {
            return;
        };
        if self.by_ip.get(&ip).is_some_and(|entry| entry.key == key) {
            self.by_ip.remove(&ip);
            debug!("📍 {} released by {}", ip, key);
        }
    }

    fn assign(&mut self, ip: &str, entry: PodEntry) {
        self.release(&entry.key);
        debug!("📍 {} -> {}", ip, entry.key);
        let key = entry.key.clone();
        if let Some(previous) = self.by_ip.insert(ip.to_string(), entry) {
            // recycled address: the previous holder no longer owns it
            if previous.key != key {
                self.by_pod.remove(&previous.key);
            }
        }
        self.by_pod.insert(key, ip.to_string());
    }
}

#[derive(Debug, Default)]
pub struct PodCache {
    index: RwLock<Index>,
}

impl PodCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one pod event to the index
    ///
    /// A pod that loses or changes its address gives up the address it held
    /// before, so replaying events always agrees with [`PodCache::rebuild`].
    ///
    /// # Errors
    ///
    /// Returns an error if the index lock is poisoned
    pub fn event(&self, pod: &Pod, event: Event) -> Result<()> {
        let mut index = self
            .index
            .write()
            .map_err(|_| lock_poisoned_error("pod index"))?;

        match (event, pod_ip(pod)) {
            (Event::Add | Event::Update, Some(ip)) => index.assign(ip, PodEntry::from_pod(pod)),
            // Pods are scheduled before they get an address
            (Event::Add | Event::Update, None) | (Event::Delete, _) => {
                index.release(&key_func(&pod.name_any(), &pod.namespace().unwrap_or_default()));
            }
        }
        Ok(())
    }

    /// Discard the index and replay every pod currently in `pods`
    ///
    /// # Errors
    ///
    /// Returns an error if the index lock is poisoned
    pub fn rebuild(&self, pods: &Mirror<Pod>) -> Result<()> {
        let mut rebuilt = Index::default();
        for pod in pods.list() {
            if let Some(ip) = pod_ip(&pod) {
                rebuilt.assign(ip, PodEntry::from_pod(&pod));
            }
        }

        *self
            .index
            .write()
            .map_err(|_| lock_poisoned_error("pod index"))? = rebuilt;
        Ok(())
    }

    #[must_use]
    pub fn entry_by_ip(&self, ip: &str) -> Option<PodEntry> {
        match self.index.read() {
            Ok(index) => index.by_ip.get(ip).cloned(),
            Err(_) => {
                warn!("Pod index lock poisoned, treating {} as unknown", ip);
                None
            }
        }
    }

    /// Labels of the pod holding `ip`, if any
    #[must_use]
    pub fn lookup_by_address(&self, ip: &str) -> Option<Tags> {
        self.entry_by_ip(ip).map(|entry| entry.tags)
    }

    /// Labels of the pod holding `ip`, empty when the address is unknown
    #[must_use]
    pub fn tags_by_ip(&self, ip: &str) -> Tags {
        self.lookup_by_address(ip).unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.read().map_or(0, |index| index.by_ip.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
