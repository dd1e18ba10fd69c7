//! Cluster reads and writes used by the reconciler
//!
//! Metadata patches carry the `resourceVersion` the reconciler last read, so
//! a concurrent write surfaces as [`StoreError::Conflict`] instead of being
//! overwritten.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Service};
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::{Api, Client};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::CONTROLLER_NAME;
use crate::model::{EndpointSet, ManagedService, ObjectKey};
use crate::recorder::{record_name, ResultRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found")]
    NotFound,

    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[source] kube::Error),
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) if response.code == 404 => Self::NotFound,
            kube::Error::Api(response) if response.code == 409 => Self::Conflict(response.message),
            other => Self::Kube(other),
        }
    }
}

/// A single metadata change on a Service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMutation {
    /// Replace the finalizer list
    SetFinalizers(Vec<String>),
    /// Set an annotation, or remove it when `value` is `None`
    SetAnnotation { key: String, value: Option<String> },
}

impl MetadataMutation {
    /// JSON merge patch applying this change, guarded by `resource_version`
    pub fn to_merge_patch(&self, resource_version: Option<&str>) -> Value {
        let mut metadata = Map::new();
        if let Some(rv) = resource_version {
            metadata.insert("resourceVersion".to_string(), json!(rv));
        }
        match self {
            Self::SetFinalizers(finalizers) => {
                metadata.insert("finalizers".to_string(), json!(finalizers));
            }
            Self::SetAnnotation { key, value } => {
                let mut annotations = Map::new();
                annotations.insert(
                    key.clone(),
                    value.clone().map(Value::String).unwrap_or(Value::Null),
                );
                metadata.insert("annotations".to_string(), Value::Object(annotations));
            }
        }
        json!({ "metadata": metadata })
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceStore: Send + Sync {
    async fn get_service(&self, key: &ObjectKey) -> Result<ManagedService, StoreError>;

    /// Endpoints share the Service's name; a missing object is an empty set
    async fn get_endpoints(&self, key: &ObjectKey) -> Result<EndpointSet, StoreError>;

    /// Apply `mutation` to the Service as last read, returning the updated Service
    async fn patch_metadata(
        &self,
        service: &ManagedService,
        mutation: MetadataMutation,
    ) -> Result<ManagedService, StoreError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Create or replace the result record of the Service at `key`
    async fn put_record(&self, key: &ObjectKey, record: &ResultRecord) -> Result<(), StoreError>;

    /// Remove the result record; an absent record is success
    async fn remove_record(&self, key: &ObjectKey) -> Result<(), StoreError>;
}

/// [`ServiceStore`] and [`ResultStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceStore for KubeStore {
    #[instrument(skip(self), fields(service = %key))]
    async fn get_service(&self, key: &ObjectKey) -> Result<ManagedService, StoreError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &key.namespace);
        let service = api.get(&key.name).await?;
        Ok(ManagedService::from_service(&service))
    }

    #[instrument(skip(self), fields(service = %key))]
    async fn get_endpoints(&self, key: &ObjectKey) -> Result<EndpointSet, StoreError> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), &key.namespace);
        match api.get(&key.name).await.map_err(StoreError::from) {
            Ok(endpoints) => Ok(EndpointSet::from_endpoints(&endpoints)),
            Err(StoreError::NotFound) => {
                debug!("No Endpoints object, treating as no ready members");
                Ok(EndpointSet::default())
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, service), fields(service = %service.key()))]
    async fn patch_metadata(
        &self,
        service: &ManagedService,
        mutation: MetadataMutation,
    ) -> Result<ManagedService, StoreError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &service.namespace);
        let patch = mutation.to_merge_patch(service.resource_version.as_deref());
        let updated = api
            .patch(&service.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(?mutation, "Patched Service metadata");
        Ok(ManagedService::from_service(&updated))
    }
}

#[async_trait]
impl ResultStore for KubeStore {
    #[instrument(skip(self, record), fields(service = %key))]
    async fn put_record(&self, key: &ObjectKey, record: &ResultRecord) -> Result<(), StoreError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &key.namespace);
        let config_map = record.to_config_map(key);
        api.patch(
            &record_name(&key.name),
            &PatchParams::apply(CONTROLLER_NAME).force(),
            &Patch::Apply(&config_map),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip(self), fields(service = %key))]
    async fn remove_record(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &key.namespace);
        match api
            .delete(&record_name(&key.name), &DeleteParams::default())
            .await
            .map_err(StoreError::from)
        {
            Ok(_) | Err(StoreError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
