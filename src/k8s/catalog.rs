/**
 * Service catalog
 *
 * Read-side joins over the mirrors: services come from the service mirror,
 * instances from endpoints joined with their service, the pod index for tags
 * and identity, and the node mirror for locality. Lookups never fail; a
 * missing piece yields an empty result or an unknown locality.
 */
use crate::k8s::cache::{Mirror, PodCache};
use crate::k8s::convert::{convert_service, node_locality, parse_hostname, service_account_id};
use crate::model::{
    InstanceSet, Locality, NetworkEndpoint, Port, Service, ServiceInstance, Tags, TagsList,
};
use k8s_openapi::api::core::v1::{Endpoints, Node, Service as KubeService};
use kube::ResourceExt;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct Catalog {
    services: Arc<Mirror<KubeService>>,
    endpoints: Arc<Mirror<Endpoints>>,
    nodes: Arc<Mirror<Node>>,
    pods: Arc<PodCache>,
    domain_suffix: String,
}

impl Catalog {
    #[must_use]
    pub fn new(
        services: Arc<Mirror<KubeService>>,
        endpoints: Arc<Mirror<Endpoints>>,
        nodes: Arc<Mirror<Node>>,
        pods: Arc<PodCache>,
        domain_suffix: &str,
    ) -> Self {
        Self {
            services,
            endpoints,
            nodes,
            pods,
            domain_suffix: domain_suffix.to_string(),
        }
    }

    #[must_use]
    pub fn domain_suffix(&self) -> &str {
        &self.domain_suffix
    }

    /// Every well-formed service, ordered by hostname
    #[must_use]
    pub fn services(&self) -> Vec<Service> {
        let mut services: Vec<Service> = self
            .services
            .list()
            .iter()
            .filter_map(|svc| convert_service(svc, &self.domain_suffix))
            .collect();
        services.sort_by(|l, r| l.hostname.cmp(&r.hostname));
        services
    }

    #[must_use]
    pub fn get_service(&self, hostname: &str) -> Option<Service> {
        let (name, namespace) = self.parse(hostname)?;
        self.service_by_key(&name, &namespace)
    }

    /// Backends of `hostname` on the named `ports` whose tags satisfy `tags_list`
    #[must_use]
    pub fn instances(&self, hostname: &str, ports: &[&str], tags_list: &TagsList) -> Vec<ServiceInstance> {
        let Some((name, namespace)) = self.parse(hostname) else {
            return Vec::new();
        };
        let Some(svc) = self.service_by_key(&name, &namespace) else {
            return Vec::new();
        };
        let Some(ep) = self.endpoints.get(&namespace, &name) else {
            return Vec::new();
        };

        self.join(
            &ep,
            &svc,
            |_, tags| tags_list.has_subset_of(tags),
            |port| ports.contains(&port.name.as_str()),
        )
    }

    /// Every instance, across all services, whose address is in `addresses`
    #[must_use]
    pub fn host_instances(&self, addresses: &HashSet<String>) -> Vec<ServiceInstance> {
        let mut out = Vec::new();
        for ep in self.endpoints.list() {
            let hosts_any = ep
                .subsets
                .iter()
                .flatten()
                .flat_map(|subset| subset.addresses.iter().flatten())
                .any(|address| addresses.contains(&address.ip));
            if !hosts_any {
                continue;
            }

            let Some(svc) = self.service_by_key(&ep.name_any(), &ep.namespace().unwrap_or_default()) else {
                continue;
            };
            out.extend(self.join(&ep, &svc, |ip, _| addresses.contains(ip), |_| true));
        }
        out
    }

    /// Sorted, unique workload identities backing `hostname` on `ports`
    #[must_use]
    pub fn service_accounts(&self, hostname: &str, ports: &[&str]) -> Vec<String> {
        let accounts: BTreeSet<String> = self
            .instances(hostname, ports, &TagsList::default())
            .iter()
            .filter_map(|instance| self.pods.entry_by_ip(&instance.endpoint.address))
            .map(|entry| service_account_id(&entry.service_account, &entry.namespace, &self.domain_suffix))
            .collect();
        accounts.into_iter().collect()
    }

    /// The owning service and every instance derived from one endpoints object
    #[must_use]
    pub fn instance_set(&self, ep: &Endpoints) -> Option<InstanceSet> {
        let service = self.service_by_key(&ep.name_any(), &ep.namespace().unwrap_or_default())?;
        let instances = self.join(ep, &service, |_, _| true, |_| true);
        Some(InstanceSet { service, instances })
    }

    /// Region/zone of the node running the pod that holds `ip`
    #[must_use]
    pub fn locality(&self, ip: &str) -> Locality {
        self.pods
            .entry_by_ip(ip)
            .filter(|entry| !entry.node_name.is_empty())
            .and_then(|entry| self.nodes.get("", &entry.node_name))
            .map_or(Locality::Unknown, |node| node_locality(&node))
    }

    fn parse(&self, hostname: &str) -> Option<(String, String)> {
        parse_hostname(hostname, &self.domain_suffix)
            .map_err(|e| debug!("Lookup of {} skipped: {}", hostname, e))
            .ok()
    }

    fn service_by_key(&self, name: &str, namespace: &str) -> Option<Service> {
        self.services
            .get(namespace, name)
            .and_then(|svc| convert_service(&svc, &self.domain_suffix))
    }

    /// Cross every ready address of `ep` with every endpoint port that names a
    /// port of `svc`, keeping what the two filters accept.
    fn join<A, P>(&self, ep: &Endpoints, svc: &Service, accept_address: A, accept_port: P) -> Vec<ServiceInstance>
    where
        A: Fn(&str, &Tags) -> bool,
        P: Fn(&Port) -> bool,
    {
        let mut out = Vec::new();
        for subset in ep.subsets.iter().flatten() {
            for address in subset.addresses.iter().flatten() {
                let ip = address.ip.as_str();
                let tags = self.pods.tags_by_ip(ip);
                if !accept_address(ip, &tags) {
                    continue;
                }
                let locality = self.locality(ip);

                for port in subset.ports.iter().flatten() {
                    let Some(service_port) = svc.ports.get(port.name.as_deref().unwrap_or_default()) else {
                        continue;
                    };
                    if !accept_port(service_port) {
                        continue;
                    }
                    out.push(ServiceInstance {
                        endpoint: NetworkEndpoint {
                            address: ip.to_string(),
                            port: port.port,
                            service_port: service_port.clone(),
                        },
                        service: svc.clone(),
                        tags: tags.clone(),
                        locality: locality.clone(),
                    });
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Event;
    use k8s_openapi::api::core::v1::{
        EndpointAddress, EndpointPort, EndpointSubset, Pod, PodSpec, PodStatus, ServicePort, ServiceSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;
    use std::time::Duration;

    const HOSTNAME: &str = "reviews.default.svc.cluster.local";

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

    fn fixture() -> Catalog {
        let services = Arc::new(Mirror::<KubeService>::new(Duration::ZERO));
        let endpoints = Arc::new(Mirror::<Endpoints>::new(Duration::ZERO));
        let nodes = Arc::new(Mirror::<Node>::new(Duration::ZERO));
        let pods = Arc::new(PodCache::new());

        let service_port = |name: &str, port: i32| ServicePort {
            name: Some(name.to_string()),
            port,
            protocol: Some("TCP".to_string()),
            ..ServicePort::default()
        };
        services
            .upsert(KubeService {
                metadata: meta("reviews", Some("default"), &[]),
                spec: Some(ServiceSpec {
                    cluster_ip: Some("10.96.0.20".to_string()),
                    ports: Some(vec![service_port("http", 80), service_port("grpc", 90)]),
                    ..ServiceSpec::default()
                }),
                ..KubeService::default()
            })
            .unwrap();

        let endpoint_port = |name: &str, port: i32| EndpointPort {
            name: Some(name.to_string()),
            port,
            ..EndpointPort::default()
        };
        endpoints
            .upsert(Endpoints {
                metadata: meta("reviews", Some("default"), &[]),
                subsets: Some(vec![EndpointSubset {
                    addresses: Some(
                        ["10.0.0.1", "10.0.0.2", "10.0.0.3"]
                            .iter()
                            .map(|ip| EndpointAddress { ip: (*ip).to_string(), ..EndpointAddress::default() })
                            .collect(),
                    ),
                    ports: Some(vec![endpoint_port("http", 8080), endpoint_port("grpc", 9090)]),
                    ..EndpointSubset::default()
                }]),
            })
            .unwrap();

        nodes
            .upsert(Node {
                metadata: meta(
                    "node-1",
                    None,
                    &[("topology.kubernetes.io/region", "us-east1"), ("topology.kubernetes.io/zone", "us-east1-b")],
                ),
                ..Node::default()
            })
            .unwrap();

        let pod = |name: &str, ip: &str, version: &str, node: &str| Pod {
            metadata: meta(name, Some("default"), &[("app", "reviews"), ("version", version)]),
            spec: Some(PodSpec {
                node_name: Some(node.to_string()),
                service_account_name: Some(format!("reviews-{version}")),
                ..PodSpec::default()
            }),
            status: Some(PodStatus { pod_ip: Some(ip.to_string()), ..PodStatus::default() }),
        };
        pods.event(&pod("reviews-v1", "10.0.0.1", "v1", "node-1"), Event::Add).unwrap();
        pods.event(&pod("reviews-v2", "10.0.0.2", "v2", "node-unknown"), Event::Add).unwrap();

        Catalog::new(services, endpoints, nodes, pods, "cluster.local")
    }

    #[test]
    fn test_instances_only_for_requested_ports() {
        let catalog = fixture();
        let instances = catalog.instances(HOSTNAME, &["http"], &TagsList::default());

        assert_eq!(instances.len(), 3);
        for instance in &instances {
            assert_eq!(instance.endpoint.service_port.port, 80);
            assert_eq!(instance.endpoint.port, 8080);
            assert_eq!(instance.service.hostname, HOSTNAME);
        }
        assert!(catalog.instances(HOSTNAME, &["https"], &TagsList::default()).is_empty());
        assert!(catalog.instances("ratings.default.svc.cluster.local", &["http"], &TagsList::default()).is_empty());
        assert!(catalog.instances("not a hostname", &["http"], &TagsList::default()).is_empty());
    }

    #[test]
    fn test_instances_filtered_by_tags() {
        let catalog = fixture();
        let v1: Tags = [("version", "v1")].into_iter().collect();
        let instances = catalog.instances(HOSTNAME, &["http", "grpc"], &TagsList::from(v1));

        assert_eq!(instances.len(), 2);
        assert!(instances.iter().all(|i| i.endpoint.address == "10.0.0.1"));
    }

    #[test]
    fn test_locality_degrades_to_unknown() {
        let catalog = fixture();
        assert_eq!(catalog.locality("10.0.0.1").to_string(), "us-east1/us-east1-b");
        // pod on a node the mirror has never seen
        assert_eq!(catalog.locality("10.0.0.2"), Locality::Unknown);
        // address with no pod at all
        assert_eq!(catalog.locality("10.0.0.3"), Locality::Unknown);
    }

    #[test]
    fn test_host_instances() {
        let catalog = fixture();
        let addresses = HashSet::from(["10.0.0.2".to_string(), "192.168.1.1".to_string()]);
        let instances = catalog.host_instances(&addresses);

        assert_eq!(instances.len(), 2);
        assert!(instances.iter().all(|i| i.endpoint.address == "10.0.0.2"));
        let mut ports: Vec<i32> = instances.iter().map(|i| i.endpoint.service_port.port).collect();
        ports.sort_unstable();
        assert_eq!(ports, vec![80, 90]);
    }

    #[test]
    fn test_service_accounts_sorted_and_unique() {
        let catalog = fixture();
        assert_eq!(
            catalog.service_accounts(HOSTNAME, &["http", "grpc"]),
            vec![
                "spiffe://cluster.local/ns/default/sa/reviews-v1".to_string(),
                "spiffe://cluster.local/ns/default/sa/reviews-v2".to_string(),
            ]
        );
    }

    #[test]
    fn test_services_and_lookup() {
        let catalog = fixture();
        let services = catalog.services();
        assert_eq!(services.len(), 1);
        assert_eq!(catalog.get_service(HOSTNAME), Some(services[0].clone()));
        assert!(catalog.get_service("reviews.default.svc.example.com").is_none());
    }
}
