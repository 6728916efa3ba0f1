/**
 * Catalog controller
 *
 * Owns one mirror and one handler chain per watched kind (Service, Endpoints,
 * Pod, Node), the pod index and the dispatch queue. Mirrors push a task for
 * every change; the queue runs the task's chain, whose first stage holds
 * everything back until all four mirrors have synced.
 */
use super::cache::{
    ChainHandler, ControllerOptions, EventSink, KubeSource, Mirror, PodCache, Queue, QueueStats,
    SyncGate, Task, WatchSource,
};
use super::catalog::Catalog;
use super::convert::convert_service;
use crate::error::Result;
use crate::model::{Event, InstanceSet, Service, ServiceInstance, TagsList};
use k8s_openapi::api::core::v1::{Endpoints, Node, Pod, Service as KubeService};
use kube::{Client, Resource};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Where each mirror lists and watches its objects
pub struct Sources {
    pub services: Arc<dyn WatchSource<KubeService>>,
    pub endpoints: Arc<dyn WatchSource<Endpoints>>,
    pub pods: Arc<dyn WatchSource<Pod>>,
    pub nodes: Arc<dyn WatchSource<Node>>,
}

impl Sources {
    /// Cluster API sources; nodes are cluster-scoped and ignore `namespace`
    #[must_use]
    pub fn kube(client: &Client, namespace: Option<&str>) -> Self {
        Self {
            services: Arc::new(KubeSource::<KubeService>::namespaced(client.clone(), namespace)),
            endpoints: Arc::new(KubeSource::<Endpoints>::namespaced(client.clone(), namespace)),
            pods: Arc::new(KubeSource::<Pod>::namespaced(client.clone(), namespace)),
            nodes: Arc::new(KubeSource::<Node>::cluster(client.clone())),
        }
    }
}

/// Mirror, chain and source of one watched kind
struct CacheHandler<K> {
    mirror: Arc<Mirror<K>>,
    chain: Arc<ChainHandler<K>>,
    source: Arc<dyn WatchSource<K>>,
}

impl<K> CacheHandler<K>
where
    K: Resource + Clone + PartialEq + Send + Sync + 'static,
    <K as Resource>::DynamicType: Default,
{
    fn new(mirror: Arc<Mirror<K>>, source: Arc<dyn WatchSource<K>>, gate: &SyncGate) -> Self {
        Self {
            mirror,
            chain: Arc::new(ChainHandler::gated(gate.clone())),
            source,
        }
    }

    async fn run(&self, queue: Arc<Queue>, cancel: CancellationToken) {
        let chain = self.chain.clone();
        let sink: EventSink<K> = Arc::new(move |obj: Arc<K>, event: Event| {
            queue.push(Task::new(chain.clone(), obj, event));
        });
        self.mirror.run(self.source.clone(), sink, cancel).await;
    }
}

pub struct Controller {
    services: CacheHandler<KubeService>,
    endpoints: CacheHandler<Endpoints>,
    pods: CacheHandler<Pod>,
    nodes: CacheHandler<Node>,
    pod_cache: Arc<PodCache>,
    catalog: Catalog,
    queue: Arc<Queue>,
}

impl Controller {
    /// Controller watching the cluster behind `client`
    ///
    /// # Errors
    ///
    /// Returns an error if the pod index stage cannot be registered
    pub fn new(client: &Client, options: &ControllerOptions) -> Result<Self> {
        Self::with_sources(Sources::kube(client, options.namespace()), options)
    }

    /// Controller over arbitrary watch sources
    ///
    /// # Errors
    ///
    /// Returns an error if the pod index stage cannot be registered
    pub fn with_sources(sources: Sources, options: &ControllerOptions) -> Result<Self> {
        let services = Arc::new(Mirror::<KubeService>::new(options.resync_period));
        let endpoints = Arc::new(Mirror::<Endpoints>::new(options.resync_period));
        let pods = Arc::new(Mirror::<Pod>::new(options.resync_period));
        let nodes = Arc::new(Mirror::<Node>::new(options.resync_period));

        let gate = SyncGate::new()
            .watch(services.kind(), services.sync_flag())
            .watch(endpoints.kind(), endpoints.sync_flag())
            .watch(pods.kind(), pods.sync_flag())
            .watch(nodes.kind(), nodes.sync_flag());

        let pod_cache = Arc::new(PodCache::new());
        let catalog = Catalog::new(
            services.clone(),
            endpoints.clone(),
            nodes.clone(),
            pod_cache.clone(),
            &options.domain_suffix,
        );

        let controller = Self {
            services: CacheHandler::new(services, sources.services, &gate),
            endpoints: CacheHandler::new(endpoints, sources.endpoints, &gate),
            pods: CacheHandler::new(pods, sources.pods, &gate),
            nodes: CacheHandler::new(nodes, sources.nodes, &gate),
            pod_cache,
            catalog,
            queue: Arc::new(Queue::new(options.retry_delay)),
        };

        let index = controller.pod_cache.clone();
        controller
            .pods
            .chain
            .append(move |pod: &Pod, event| index.event(pod, event))?;

        Ok(controller)
    }

    /// True once every mirror has merged its initial list
    #[must_use]
    pub fn has_synced(&self) -> bool {
        self.services.mirror.has_synced()
            && self.endpoints.mirror.has_synced()
            && self.pods.mirror.has_synced()
            && self.nodes.mirror.has_synced()
    }

    /// Run the dispatch queue and every mirror until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!("🚀 Starting catalog controller");
        tokio::join!(
            self.queue.run(cancel.clone()),
            self.services.run(self.queue.clone(), cancel.clone()),
            self.endpoints.run(self.queue.clone(), cancel.clone()),
            self.pods.run(self.queue.clone(), cancel.clone()),
            self.nodes.run(self.queue.clone(), cancel.clone()),
        );
        info!("🛑 Catalog controller stopped");
    }

    #[must_use]
    pub fn services(&self) -> Vec<Service> {
        self.catalog.services()
    }

    #[must_use]
    pub fn get_service(&self, hostname: &str) -> Option<Service> {
        self.catalog.get_service(hostname)
    }

    #[must_use]
    pub fn instances(&self, hostname: &str, ports: &[&str], tags_list: &TagsList) -> Vec<ServiceInstance> {
        self.catalog.instances(hostname, ports, tags_list)
    }

    #[must_use]
    pub fn host_instances(&self, addresses: &HashSet<String>) -> Vec<ServiceInstance> {
        self.catalog.host_instances(addresses)
    }

    /// Identity URIs of the workloads serving `hostname` on `ports`
    #[must_use]
    pub fn service_accounts(&self, hostname: &str, ports: &[&str]) -> Vec<String> {
        self.catalog.service_accounts(hostname, ports)
    }

    /// Call `f` for every change of a well-formed service, after the stages registered before it
    ///
    /// # Errors
    ///
    /// Returns an error if the service chain lock is poisoned
    pub fn on_service_change<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&Service, Event) + Send + Sync + 'static,
    {
        let domain_suffix = self.catalog.domain_suffix().to_string();
        self.services.chain.append(move |svc: &KubeService, event| {
            if let Some(service) = convert_service(svc, &domain_suffix) {
                f(&service, event);
            }
            Ok(())
        })
    }

    /// Call `f` with the instances of every changed endpoints object whose service is known
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoints chain lock is poisoned
    pub fn on_instance_change<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&InstanceSet, Event) + Send + Sync + 'static,
    {
        let catalog = self.catalog.clone();
        self.endpoints.chain.append(move |ep: &Endpoints, event| {
            if let Some(set) = catalog.instance_set(ep) {
                f(&set, event);
            }
            Ok(())
        })
    }

    #[must_use]
    pub const fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Discard the pod index and rebuild it from the pod mirror
    ///
    /// # Errors
    ///
    /// Returns an error if the index lock is poisoned
    pub fn rebuild_pod_index(&self) -> Result<()> {
        self.pod_cache.rebuild(&self.pods.mirror)
    }

    #[must_use]
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }
}
