//! Conversions from Kubernetes objects to catalog records.
//!
use crate::error::Result;
use crate::k8s::cache::errors::invalid_hostname_error;
use crate::model::{Locality, Port, PortList, Protocol, Service, Tags};
use k8s_openapi::api::core::v1::{Node, Service as KubeService, ServicePort};
use kube::ResourceExt;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

pub const NODE_REGION_LABEL: &str = "topology.kubernetes.io/region";
pub const NODE_ZONE_LABEL: &str = "topology.kubernetes.io/zone";
pub const LEGACY_NODE_REGION_LABEL: &str = "failure-domain.beta.kubernetes.io/region";
pub const LEGACY_NODE_ZONE_LABEL: &str = "failure-domain.beta.kubernetes.io/zone";

/// URI scheme of workload identities
pub const IDENTITY_SCHEME: &str = "spiffe";

const CLUSTER_IP_NONE: &str = "None";
const EXTERNAL_NAME_TYPE: &str = "ExternalName";
const DEFAULT_SERVICE_ACCOUNT: &str = "default";

/// `<name>.<namespace>.svc.<domain_suffix>`
#[must_use]
pub fn service_hostname(name: &str, namespace: &str, domain_suffix: &str) -> String {
    format!("{name}.{namespace}.svc.{domain_suffix}")
}

/// Split a hostname built by [`service_hostname`] back into `(name, namespace)`
///
/// # Errors
///
/// Returns `InvalidHostname` unless the hostname is exactly
/// `<name>.<namespace>.svc.<domain_suffix>` with non-empty name and namespace
pub fn parse_hostname(hostname: &str, domain_suffix: &str) -> Result<(String, String)> {
    let suffix = format!(".svc.{domain_suffix}");
    let prefix = hostname
        .strip_suffix(&suffix)
        .ok_or_else(|| invalid_hostname_error(hostname, &suffix[1..]))?;

    match prefix.split('.').collect::<Vec<_>>().as_slice() {
        [name, namespace] if !name.is_empty() && !namespace.is_empty() => {
            Ok(((*name).to_string(), (*namespace).to_string()))
        }
        _ => Err(invalid_hostname_error(hostname, &suffix[1..])),
    }
}

/// Protocol of a service port from its transport and the prefix of its name
#[must_use]
pub fn convert_protocol(name: &str, transport: Option<&str>) -> Protocol {
    if transport == Some("UDP") {
        return Protocol::Udp;
    }

    let prefix = name.split('-').next().unwrap_or_default();
    match Protocol::from_prefix(prefix) {
        // a TCP port never speaks UDP, whatever it is called
        Some(Protocol::Udp) | None => Protocol::Tcp,
        Some(protocol) => protocol,
    }
}

#[must_use]
pub fn convert_port(port: &ServicePort) -> Port {
    let name = port.name.clone().unwrap_or_default();
    let protocol = convert_protocol(&name, port.protocol.as_deref());
    Port {
        name,
        port: port.port,
        protocol,
    }
}

/// Convert a Kubernetes service, or `None` if it is malformed
#[must_use]
pub fn convert_service(svc: &KubeService, domain_suffix: &str) -> Option<Service> {
    let name = svc.name_any();
    let namespace = svc.namespace().unwrap_or_default();
    let spec = svc.spec.as_ref()?;

    let address = spec
        .cluster_ip
        .as_deref()
        .filter(|ip| !ip.is_empty() && *ip != CLUSTER_IP_NONE)
        .map(str::to_string);
    let external_name = spec
        .external_name
        .as_deref()
        .filter(|ext| !ext.is_empty() && spec.type_.as_deref() == Some(EXTERNAL_NAME_TYPE))
        .map(str::to_string);

    if address.is_some() == external_name.is_some() {
        debug!(
            "Skipping service {}/{}: needs exactly one of cluster IP and external name",
            namespace, name
        );
        return None;
    }

    let ports: Vec<Port> = spec.ports.iter().flatten().map(convert_port).collect();
    let mut seen = HashSet::new();
    if !ports.iter().all(|port| seen.insert(port.name.as_str())) {
        debug!("Skipping service {}/{}: duplicate port names", namespace, name);
        return None;
    }

    Some(Service {
        hostname: service_hostname(&name, &namespace, domain_suffix),
        address,
        external_name,
        ports: PortList(ports),
    })
}

/// `spiffe://<domain>/ns/<namespace>/sa/<account>`; an empty account is `default`
#[must_use]
pub fn service_account_id(account: &str, namespace: &str, domain_suffix: &str) -> String {
    let account = if account.is_empty() { DEFAULT_SERVICE_ACCOUNT } else { account };
    format!("{IDENTITY_SCHEME}://{domain_suffix}/ns/{namespace}/sa/{account}")
}

#[must_use]
pub fn convert_tags(labels: &BTreeMap<String, String>) -> Tags {
    Tags(labels.clone())
}

/// Region and zone of a node, from the topology labels or their legacy names
#[must_use]
pub fn node_locality(node: &Node) -> Locality {
    let labels = node.labels();
    let label = |current: &str, legacy: &str| labels.get(current).or_else(|| labels.get(legacy)).cloned();

    match (
        label(NODE_REGION_LABEL, LEGACY_NODE_REGION_LABEL),
        label(NODE_ZONE_LABEL, LEGACY_NODE_ZONE_LABEL),
    ) {
        (Some(region), Some(zone)) => Locality::Zone { region, zone },
        _ => Locality::Unknown,
    }
}
