//! Desired pool state derived from a Service and its Endpoints

use std::collections::BTreeMap;

use crate::ledger::AppliedPool;
use crate::model::{EndpointSet, ManagedService};
use crate::naming::pool_name;

/// Weight given to every pool member
pub const DEFAULT_WEIGHT: i64 = 1;

/// Tag attached to every pool member
pub const MEMBER_TAG: (&str, &str) = ("key", "value");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolMember {
    pub address: String,
    pub port: i32,
    pub weight: i64,
    pub tags: BTreeMap<String, String>,
}

/// A pool as it should exist remotely
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredPool {
    pub product: String,
    pub pool_id: String,
    pub members: Vec<PoolMember>,
}

impl DesiredPool {
    /// A pool with no ready members is tracked but never sent to the open-api
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn applied(&self) -> AppliedPool {
        AppliedPool::new(&self.product, &self.pool_id)
    }
}

/// Builds one [`DesiredPool`] per named Service port
#[derive(Debug, Clone, Default)]
pub struct DesiredStateBuilder {
    cluster_name: String,
}

impl DesiredStateBuilder {
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
        }
    }

    /// Pools in Service port order; empty when the Service has no product
    pub fn build(&self, service: &ManagedService, endpoints: &EndpointSet) -> Vec<DesiredPool> {
        let Some(product) = service.product() else {
            return Vec::new();
        };

        service
            .named_ports()
            .map(|port| DesiredPool {
                product: product.to_string(),
                pool_id: pool_name(
                    product,
                    &service.namespace,
                    &service.name,
                    port,
                    &self.cluster_name,
                ),
                members: endpoints
                    .members(port)
                    .iter()
                    .map(|member| PoolMember {
                        address: member.address.clone(),
                        port: member.port,
                        weight: DEFAULT_WEIGHT,
                        tags: BTreeMap::from([(MEMBER_TAG.0.to_string(), MEMBER_TAG.1.to_string())]),
                    })
                    .collect(),
            })
            .collect()
    }
}
