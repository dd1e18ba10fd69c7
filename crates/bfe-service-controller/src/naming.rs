//! Pool identifiers
//!
//! A pool id is `{product}.k8s_{namespace}_{service}_{port}`, with
//! `_{cluster}` appended when a cluster name is configured. Namespace,
//! Service and port names cannot contain `_`, so distinct tuples never map
//! to the same id.

pub fn pool_name(product: &str, namespace: &str, service: &str, port: &str, cluster: &str) -> String {
    if cluster.is_empty() {
        format!("{}.k8s_{}_{}_{}", product, namespace, service, port)
    } else {
        format!("{}.k8s_{}_{}_{}_{}", product, namespace, service, port, cluster)
    }
}
