#![allow(dead_code)]
//! In-memory watch sources and object builders for driving a controller
//! without a cluster.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Node, Pod, PodSpec, PodStatus,
    Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use kubecatalog::error::Result;
use kubecatalog::k8s::cache::{ControllerOptions, Listing, SourceEvent, WatchSource};
use kubecatalog::k8s::controller::{Controller, Sources};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

/// Serves a mutable listing and one long-lived watch fed by `add`/`modify`/`delete`
pub struct FakeSource<K> {
    items: Mutex<Vec<K>>,
    tx: mpsc::UnboundedSender<SourceEvent<K>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<SourceEvent<K>>>>,
    released: AtomicBool,
    release: Notify,
}

impl<K> FakeSource<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new(items: Vec<K>) -> Arc<Self> {
        let source = Self::held(items);
        source.release();
        source
    }

    /// A source whose first list blocks until `release` is called
    pub fn held(items: Vec<K>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            items: Mutex::new(items),
            tx,
            rx: Mutex::new(Some(rx)),
            released: AtomicBool::new(false),
            release: Notify::new(),
        })
    }

    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.release.notify_one();
    }

    fn store(&self, obj: &K) {
        let mut items = self.items.lock().unwrap();
        items.retain(|item| !same_object(item, obj));
        items.push(obj.clone());
    }

    pub fn add(&self, obj: K) {
        self.store(&obj);
        let _ = self.tx.send(SourceEvent::Added(obj));
    }

    pub fn modify(&self, obj: K) {
        self.store(&obj);
        let _ = self.tx.send(SourceEvent::Modified(obj));
    }

    pub fn delete(&self, obj: K) {
        self.items.lock().unwrap().retain(|item| !same_object(item, &obj));
        let _ = self.tx.send(SourceEvent::Deleted(obj));
    }
}

fn same_object<K: Resource>(l: &K, r: &K) -> bool {
    l.name_any() == r.name_any() && l.namespace() == r.namespace()
}

#[async_trait]
impl<K> WatchSource<K> for FakeSource<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn list(&self) -> Result<Listing<K>> {
        if !self.released.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        Ok(Listing {
            items: self.items.lock().unwrap().clone(),
            resource_version: "1".to_string(),
        })
    }

    async fn watch(&self, _resource_version: &str) -> Result<BoxStream<'static, Result<SourceEvent<K>>>> {
        match self.rx.lock().unwrap().take() {
            Some(rx) => Ok(UnboundedReceiverStream::new(rx).map(Ok).boxed()),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

/// A controller over fake sources, running on a background task
pub struct Harness {
    pub services: Arc<FakeSource<Service>>,
    pub endpoints: Arc<FakeSource<Endpoints>>,
    pub pods: Arc<FakeSource<Pod>>,
    pub nodes: Arc<FakeSource<Node>>,
    pub controller: Arc<Controller>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

pub fn options() -> ControllerOptions {
    ControllerOptions {
        resync_period: Duration::ZERO,
        retry_delay: Duration::from_millis(50),
        ..ControllerOptions::default()
    }
}

impl Harness {
    pub fn new(
        services: Arc<FakeSource<Service>>,
        endpoints: Arc<FakeSource<Endpoints>>,
        pods: Arc<FakeSource<Pod>>,
        nodes: Arc<FakeSource<Node>>,
    ) -> Self {
        let sources = Sources {
            services: services.clone(),
            endpoints: endpoints.clone(),
            pods: pods.clone(),
            nodes: nodes.clone(),
        };
        let controller = Arc::new(Controller::with_sources(sources, &options()).unwrap());
        Self {
            services,
            endpoints,
            pods,
            nodes,
            controller,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    /// Register handlers on `controller` before calling this
    pub fn start(&mut self) {
        let controller = self.controller.clone();
        let cancel = self.cancel.clone();
        self.handle = Some(tokio::spawn(async move { controller.run(cancel).await }));
    }

    /// Wait until the queue has completed `tasks` tasks in total
    pub async fn settle(&self, tasks: u64) {
        let controller = self.controller.clone();
        wait_for(move || controller.queue_stats().succeeded >= tasks).await;
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            timeout(Duration::from_secs(5), handle)
                .await
                .expect("controller did not stop")
                .unwrap();
        }
    }
}

pub async fn wait_for<F: Fn() -> bool>(condition: F) {
    timeout(Duration::from_secs(10), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn meta(name: &str, namespace: Option<&str>, labels: &[(&str, &str)]) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(
            labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<BTreeMap<_, _>>(),
        ),
        ..ObjectMeta::default()
    }
}

pub fn service(name: &str, namespace: &str, cluster_ip: &str, ports: &[(&str, i32)]) -> Service {
    Service {
        metadata: meta(name, Some(namespace), &[]),
        spec: Some(ServiceSpec {
            cluster_ip: Some(cluster_ip.to_string()),
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, port)| ServicePort {
                        name: Some((*port_name).to_string()),
                        port: *port,
                        protocol: Some("TCP".to_string()),
                        ..ServicePort::default()
                    })
                    .collect(),
            ),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

pub fn endpoints(name: &str, namespace: &str, ips: &[&str], ports: &[(&str, i32)]) -> Endpoints {
    Endpoints {
        metadata: meta(name, Some(namespace), &[]),
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| EndpointAddress {
                        ip: (*ip).to_string(),
                        ..EndpointAddress::default()
                    })
                    .collect(),
            ),
            ports: Some(
                ports
                    .iter()
                    .map(|(port_name, port)| EndpointPort {
                        name: Some((*port_name).to_string()),
                        port: *port,
                        ..EndpointPort::default()
                    })
                    .collect(),
            ),
            ..EndpointSubset::default()
        }]),
    }
}

pub fn pod(
    name: &str,
    namespace: &str,
    ip: &str,
    labels: &[(&str, &str)],
    node: &str,
    service_account: &str,
) -> Pod {
    Pod {
        metadata: meta(name, Some(namespace), labels),
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            service_account_name: Some(service_account.to_string()),
            ..PodSpec::default()
        }),
        status: Some(PodStatus {
            pod_ip: Some(ip.to_string()),
            ..PodStatus::default()
        }),
    }
}

pub fn node(name: &str, labels: &[(&str, &str)]) -> Node {
    Node {
        metadata: meta(name, None, labels),
        ..Node::default()
    }
}
