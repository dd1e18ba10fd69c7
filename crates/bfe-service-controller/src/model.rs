//! Reconciler views of the Service and Endpoints objects

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{Endpoints, ObjectReference, Service};
use kube::{Resource, ResourceExt};

use crate::config::{annotations, labels};

/// Namespace and name of a Service
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_resource<K: Resource>(obj: &K) -> Self {
        Self::new(obj.namespace().unwrap_or_default(), obj.name_any())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The parts of a Service the reconciler reads
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManagedService {
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    pub labels: BTreeMap<String, String>,
    /// Port names in declaration order, `None` for unnamed ports
    pub ports: Vec<Option<String>>,
    pub deleting: bool,
    pub finalizers: Vec<String>,
    /// Raw value of the applied-pools annotation
    pub applied_pools: Option<String>,
    pub reference: ObjectReference,
}

impl ManagedService {
    pub fn from_service(service: &Service) -> Self {
        let ports = service
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref())
            .map(|ports| {
                ports
                    .iter()
                    .map(|port| port.name.clone().filter(|name| !name.is_empty()))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            namespace: service.namespace().unwrap_or_default(),
            name: service.name_any(),
            uid: service.uid(),
            resource_version: service.resource_version(),
            labels: service.labels().clone(),
            ports,
            deleting: service.metadata.deletion_timestamp.is_some(),
            finalizers: service.finalizers().to_vec(),
            applied_pools: service.annotations().get(annotations::APPLIED_POOLS).cloned(),
            reference: service.object_ref(&()),
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    /// Value of the product label, if present and non-empty
    pub fn product(&self) -> Option<&str> {
        self.labels
            .get(labels::PRODUCT)
            .map(String::as_str)
            .filter(|product| !product.is_empty())
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Named ports only, in declaration order
    pub fn named_ports(&self) -> impl Iterator<Item = &str> {
        self.ports.iter().filter_map(|port| port.as_deref())
    }
}

/// One ready backend address for a port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub address: String,
    pub port: i32,
}

/// Ready addresses of an Endpoints object, grouped by port name
///
/// Not-ready addresses are dropped. Unnamed ports are dropped too since they
/// cannot be matched to a Service port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSet {
    ports: BTreeMap<String, Vec<Member>>,
}

impl EndpointSet {
    pub fn from_endpoints(endpoints: &Endpoints) -> Self {
        let mut set = Self::default();
        for subset in endpoints.subsets.iter().flatten() {
            let addresses = subset.addresses.as_deref().unwrap_or_default();
            for port in subset.ports.iter().flatten() {
                let Some(name) = port.name.as_deref().filter(|name| !name.is_empty()) else {
                    continue;
                };
                for address in addresses {
                    set.insert(name, &address.ip, port.port);
                }
            }
        }
        set
    }

    pub fn insert(&mut self, port_name: &str, address: &str, port: i32) {
        self.ports
            .entry(port_name.to_string())
            .or_default()
            .push(Member {
                address: address.to_string(),
                port,
            });
    }

    pub fn members(&self, port_name: &str) -> &[Member] {
        self.ports
            .get(port_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.values().all(Vec::is_empty)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        EndpointAddress, EndpointPort, EndpointSubset, ServicePort, ServiceSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    pub(crate) fn test_service(
        namespace: &str,
        name: &str,
        ports: &[&str],
        labels: &[(&str, &str)],
    ) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                uid: Some(format!("{}-uid", name)),
                resource_version: Some("1".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(
                    ports
                        .iter()
                        .enumerate()
                        .map(|(i, port)| ServicePort {
                            name: Some(port.to_string()),
                            port: 8000 + i as i32,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn address(ip: &str) -> EndpointAddress {
        EndpointAddress {
            ip: ip.to_string(),
            ..Default::default()
        }
    }

    fn port(name: Option<&str>, port: i32) -> EndpointPort {
        EndpointPort {
            name: name.map(str::to_string),
            port,
            ..Default::default()
        }
    }

    #[test]
    fn test_managed_service_from_service() {
        let mut service = test_service("default", "web", &["http", ""], &[("bfe-product", "shop")]);
        service.metadata.finalizers = Some(vec!["k8s.bfenetworks.com/delete-protection".into()]);
        service.metadata.annotations = Some(BTreeMap::from([(
            annotations::APPLIED_POOLS.to_string(),
            "[]".to_string(),
        )]));

        let managed = ManagedService::from_service(&service);

        assert_eq!(managed.key(), ObjectKey::new("default", "web"));
        assert_eq!(managed.uid.as_deref(), Some("web-uid"));
        assert_eq!(managed.product(), Some("shop"));
        assert_eq!(managed.ports, vec![Some("http".to_string()), None]);
        assert_eq!(managed.named_ports().collect::<Vec<_>>(), vec!["http"]);
        assert!(managed.has_finalizer("k8s.bfenetworks.com/delete-protection"));
        assert_eq!(managed.applied_pools.as_deref(), Some("[]"));
        assert!(!managed.deleting);
        assert_eq!(managed.reference.name.as_deref(), Some("web"));
        assert_eq!(managed.reference.kind.as_deref(), Some("Service"));
    }

    #[test]
    fn test_deletion_timestamp_marks_deleting() {
        let mut service = test_service("default", "web", &["http"], &[]);
        service.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        let managed = ManagedService::from_service(&service);
        assert!(managed.deleting);
        assert_eq!(managed.product(), None);
    }

    #[test]
    fn test_empty_product_label_is_absent() {
        let service = test_service("default", "web", &["http"], &[("bfe-product", "")]);
        assert_eq!(ManagedService::from_service(&service).product(), None);
    }

    #[test]
    fn test_endpoint_set_uses_ready_addresses_only() {
        let endpoints = Endpoints {
            subsets: Some(vec![
                EndpointSubset {
                    addresses: Some(vec![address("10.0.0.1"), address("10.0.0.2")]),
                    not_ready_addresses: Some(vec![address("10.0.0.9")]),
                    ports: Some(vec![port(Some("http"), 8080), port(None, 9090)]),
                },
                EndpointSubset {
                    addresses: Some(vec![address("10.0.1.1")]),
                    not_ready_addresses: None,
                    ports: Some(vec![port(Some("http"), 8081), port(Some("grpc"), 9000)]),
                },
            ]),
            ..Default::default()
        };

        let set = EndpointSet::from_endpoints(&endpoints);

        let http: Vec<_> = set
            .members("http")
            .iter()
            .map(|m| (m.address.as_str(), m.port))
            .collect();
        assert_eq!(
            http,
            vec![("10.0.0.1", 8080), ("10.0.0.2", 8080), ("10.0.1.1", 8081)]
        );
        assert_eq!(set.members("grpc").len(), 1);
        assert!(set.members("metrics").is_empty());
    }

    #[test]
    fn test_endpoint_set_without_subsets_is_empty() {
        let set = EndpointSet::from_endpoints(&Endpoints::default());
        assert!(set.is_empty());
    }
}
