//! Idempotent pool operations against the BFE open-api
//!
//! Wraps [`OpenApiClient`] so the reconciler only deals with "make this pool
//! look like X" and "make this pool not exist".

use async_trait::async_trait;
use bfe_openapi::{ApiError, Instance, OpenApiClient, UpsertParam, DEFAULT_PORT_KEY};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::desired::DesiredPool;

/// Pool operations needed by the reconciler
///
/// This trait allows for mocking in tests while keeping the concrete
/// implementation for production use.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PoolGateway: Send + Sync {
    /// Whether the pool currently exists
    async fn exists(&self, product: &str, pool_id: &str) -> Result<bool, GatewayError>;

    /// Create or replace the pool so its members equal `pool.members`
    async fn upsert(&self, pool: &DesiredPool) -> Result<UpsertOutcome, GatewayError>;

    /// Remove the pool; a pool (or product) that is already gone is success
    async fn delete(&self, product: &str, pool_id: &str) -> Result<DeleteOutcome, GatewayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    /// Remote members already matched; nothing was sent
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyAbsent,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// No usable response: timeout, connection failure, undecodable body
    #[error("open-api unreachable: {0}")]
    Transient(String),

    /// The request itself was refused (4xx)
    #[error("open-api rejected request ({status}): {message}")]
    RemoteRejected { status: u16, message: String },

    /// The server failed to handle the request (5xx)
    #[error("open-api unavailable ({status}): {message}")]
    RemoteUnavailable { status: u16, message: String },
}

impl GatewayError {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::RemoteRejected { .. })
    }
}

impl From<ApiError> for GatewayError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Status { status, message } if (400..500).contains(&status) => {
                Self::RemoteRejected { status, message }
            }
            ApiError::Status { status, message } => Self::RemoteUnavailable { status, message },
            ApiError::Config(message) => Self::RemoteRejected { status: 0, message },
            other => Self::Transient(other.to_string()),
        }
    }
}

/// Whether a status answer means the pool (or its product) does not exist
fn is_absent(status: u16, message: &str) -> bool {
    status == 404 || (status == 422 && message.to_ascii_lowercase().contains("not exist"))
}

/// Whether a create failed because the pool appeared since we looked
fn is_create_race(err: &ApiError) -> bool {
    match err {
        ApiError::Status { status: 409, .. } => true,
        ApiError::Status { status, message } if (400..500).contains(status) => {
            message.to_ascii_lowercase().contains("already exist")
        }
        _ => false,
    }
}

/// Compare member sets by address, port and weight, ignoring order
fn same_members(remote: &[Instance], desired: &[Instance]) -> bool {
    fn key(instance: &Instance) -> (&str, Option<i32>, i64) {
        (instance.ip.as_str(), instance.default_port(), instance.weight)
    }

    let mut remote: Vec<_> = remote.iter().map(key).collect();
    let mut desired: Vec<_> = desired.iter().map(key).collect();
    remote.sort_unstable();
    desired.sort_unstable();
    remote == desired
}

fn to_upsert_param(pool: &DesiredPool) -> UpsertParam {
    UpsertParam {
        name: pool.pool_id.clone(),
        instances: pool
            .members
            .iter()
            .map(|member| Instance {
                hostname: member.address.clone(),
                ip: member.address.clone(),
                weight: member.weight,
                ports: BTreeMap::from([(DEFAULT_PORT_KEY.to_string(), member.port)]),
                tags: member.tags.clone(),
            })
            .collect(),
    }
}

/// [`PoolGateway`] backed by the open-api
#[derive(Debug, Clone)]
pub struct AlbPoolGateway {
    client: OpenApiClient,
}

impl AlbPoolGateway {
    pub fn new(client: OpenApiClient) -> Self {
        Self { client }
    }

    async fn fetch(
        &self,
        product: &str,
        pool_id: &str,
    ) -> Result<Option<Vec<Instance>>, GatewayError> {
        match self.client.get_pool(product, pool_id).await {
            Ok(pool) => Ok(Some(pool.instances)),
            Err(ApiError::Status { status, message }) if is_absent(status, &message) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl PoolGateway for AlbPoolGateway {
    #[instrument(skip(self))]
    async fn exists(&self, product: &str, pool_id: &str) -> Result<bool, GatewayError> {
        Ok(self.fetch(product, pool_id).await?.is_some())
    }

    #[instrument(skip(self, pool), fields(product = %pool.product, pool = %pool.pool_id))]
    async fn upsert(&self, pool: &DesiredPool) -> Result<UpsertOutcome, GatewayError> {
        let param = to_upsert_param(pool);

        match self.fetch(&pool.product, &pool.pool_id).await? {
            Some(remote) if same_members(&remote, &param.instances) => {
                debug!("Pool members already match");
                Ok(UpsertOutcome::Unchanged)
            }
            Some(_) => {
                self.client.update_pool(&pool.product, &param).await?;
                debug!(members = param.instances.len(), "Updated pool");
                Ok(UpsertOutcome::Updated)
            }
            None => match self.client.create_pool(&pool.product, &param).await {
                Ok(_) => {
                    debug!(members = param.instances.len(), "Created pool");
                    Ok(UpsertOutcome::Created)
                }
                Err(e) if is_create_race(&e) => {
                    warn!(error = %e, "Pool appeared concurrently, updating instead");
                    self.client.update_pool(&pool.product, &param).await?;
                    Ok(UpsertOutcome::Updated)
                }
                Err(e) => Err(e.into()),
            },
        }
    }

    #[instrument(skip(self))]
    async fn delete(&self, product: &str, pool_id: &str) -> Result<DeleteOutcome, GatewayError> {
        match self.client.delete_pool(product, pool_id).await {
            Ok(()) => {
                debug!("Deleted pool");
                Ok(DeleteOutcome::Deleted)
            }
            Err(ApiError::Status { status, message }) if is_absent(status, &message) => {
                debug!(status, "Pool already absent");
                Ok(DeleteOutcome::AlreadyAbsent)
            }
            Err(e) => Err(e.into()),
        }
    }
}
