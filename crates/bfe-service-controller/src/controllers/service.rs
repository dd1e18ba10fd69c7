//! Service controller
//!
//! Keeps the BFE product pools of every `bfe-product` labeled Service in line
//! with the Service's ready endpoints, one pool per named port.
//!
//! ## Delivery contract
//!
//! Deliveries for the same Service must never run concurrently. The kube-rs
//! `Controller` serializes reconciles per object key; nothing in this module
//! takes a lock of its own.
//!
//! ## Update path
//!
//! 1. Attach the finalizer if it is missing and end the delivery. Pools are
//!    only created once the finalizer is durably on the object.
//! 2. Upsert every desired pool that has members. A failed pool does not stop
//!    the others.
//! 3. Delete pools that were applied before but are no longer desired.
//! 4. Persist the new applied set. Pools whose upsert or delete failed stay
//!    in it so the next delivery retries exactly those.
//!
//! ## Delete path
//!
//! Delete every applied pool, persist the ones that could not be deleted,
//! and release the finalizer only once none remain (or when the operator
//! forces it). Once none remain the applied-pools annotation is removed too,
//! so a Service held by another finalizer is not cleaned up twice.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::runtime::controller::{Action, Config as ControllerConfig};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{annotations, labels};
use crate::desired::DesiredPool;
use crate::finalizer::{self, FINALIZER_NAME};
use crate::gateway::GatewayError;
use crate::ledger::{next_applied, AppliedPool, AppliedPoolSet, LedgerError};
use crate::model::{ManagedService, ObjectKey};
use crate::recorder::Operation;
use crate::store::{MetadataMutation, StoreError};

use super::retry::{is_escalated, retry_delay, ErrorKind, RetryTracker};
use super::ControllerContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolAction {
    Upsert,
    Delete,
}

impl fmt::Display for PoolAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upsert => f.write_str("upsert"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

/// One pool operation that failed during a delivery
#[derive(Debug, Clone, PartialEq)]
pub struct PoolFailure {
    pub pool: AppliedPool,
    pub action: PoolAction,
    pub error: GatewayError,
}

impl fmt::Display for PoolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.action, self.pool, self.error)
    }
}

fn join_failures(failures: &[PoolFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to read Service: {0}")]
    LoadService(#[source] StoreError),

    #[error("failed to read Endpoints: {0}")]
    LoadEndpoints(#[source] StoreError),

    #[error("failed to attach finalizer: {0}")]
    AttachFinalizer(#[source] StoreError),

    #[error("failed to release finalizer: {0}")]
    ReleaseFinalizer(#[source] StoreError),

    #[error("failed to persist applied pools: {0}")]
    PersistApplied(#[source] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("{}", join_failures(.0))]
    Pools(Vec<PoolFailure>),
}

impl ReconcileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Pools(failures) if failures.iter().any(|f| f.error.is_rejected()) => {
                ErrorKind::Rejected
            }
            _ => ErrorKind::Transient,
        }
    }
}

/// What a successful delivery did
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Not ours to handle
    Skipped,
    /// The Service no longer exists; its result record was cleared
    Gone,
    /// First sight of the Service; pools follow on the next delivery
    FinalizerAttached,
    /// Every desired pool is in place and the applied set is persisted
    Converged(AppliedPoolSet),
    /// Every applied pool is deleted and the finalizer released
    Released,
}

/// Reconcile the Service at `key` once
///
/// The caller guarantees no other delivery for `key` is in flight.
#[instrument(skip(ctx), fields(namespace = %key.namespace, name = %key.name))]
pub async fn reconcile_key(
    key: &ObjectKey,
    ctx: &ControllerContext,
) -> Result<Delivery, ReconcileError> {
    if !ctx.options.namespace.allows(&key.namespace) {
        debug!("Namespace out of scope, skipping");
        return Ok(Delivery::Skipped);
    }

    let service = match ctx.store.get_service(key).await {
        Ok(service) => service,
        Err(StoreError::NotFound) => return Ok(handle_missing(key, ctx).await),
        Err(e) => return Err(ReconcileError::LoadService(e)),
    };

    if service.deleting {
        // The label may already be gone; what we own is recorded on the object
        if !service.has_finalizer(FINALIZER_NAME) && service.applied_pools.is_none() {
            debug!("Service being deleted without pools of ours, skipping");
            return Ok(Delivery::Skipped);
        }
        let result = retract_pools(&service, ctx).await;
        record_outcome(&service, Operation::Delete, &result, ctx).await;
        return result;
    }

    if service.product().is_none() {
        debug!("Service has no product label, skipping");
        return Ok(Delivery::Skipped);
    }

    if finalizer::attach(ctx.store.as_ref(), &service)
        .await
        .map_err(ReconcileError::AttachFinalizer)?
        .is_some()
    {
        return Ok(Delivery::FinalizerAttached);
    }

    let result = converge_pools(&service, ctx).await;
    record_outcome(&service, Operation::Update, &result, ctx).await;
    result
}

async fn handle_missing(key: &ObjectKey, ctx: &ControllerContext) -> Delivery {
    if ctx.options.skip_nil_svc_delete {
        debug!("Service no longer exists, skipping");
        return Delivery::Skipped;
    }

    info!("Service no longer exists, clearing result record");
    ctx.recorder.record(key, None, Operation::Delete, None).await;
    Delivery::Gone
}

/// Applied set recorded on the Service; a malformed record counts as empty
fn recorded_pools(service: &ManagedService) -> AppliedPoolSet {
    let Some(raw) = service.applied_pools.as_deref() else {
        return AppliedPoolSet::default();
    };
    match AppliedPoolSet::decode(raw) {
        Ok(pools) => pools,
        Err(e) => {
            warn!(error = %e, raw, "Ignoring unreadable applied-pools annotation");
            AppliedPoolSet::default()
        }
    }
}

async fn converge_pools(
    service: &ManagedService,
    ctx: &ControllerContext,
) -> Result<Delivery, ReconcileError> {
    let endpoints = ctx
        .store
        .get_endpoints(&service.key())
        .await
        .map_err(ReconcileError::LoadEndpoints)?;
    let desired = ctx.builder.build(service, &endpoints);
    let old = recorded_pools(service);

    let mut failures = Vec::new();
    let mut settled = Vec::new();
    for pool in &desired {
        if pool.is_empty() {
            debug!(pool = %pool.pool_id, "No ready members, recording pool without remote call");
            settled.push(pool.applied());
            continue;
        }
        match ctx.gateway.upsert(pool).await {
            Ok(outcome) => {
                debug!(pool = %pool.pool_id, ?outcome, "Upserted pool");
                settled.push(pool.applied());
            }
            Err(error) => {
                warn!(pool = %pool.pool_id, error = %error, "Failed to upsert pool");
                failures.push(PoolFailure {
                    pool: pool.applied(),
                    action: PoolAction::Upsert,
                    error,
                });
            }
        }
    }

    let desired_ids: Vec<AppliedPool> = desired.iter().map(DesiredPool::applied).collect();
    let stale = old.diff(&desired_ids.iter().cloned().collect());
    let stale_failed = delete_pools(&stale, ctx, &mut failures).await;

    let applied = next_applied(&old, &desired_ids, &settled, &stale_failed);
    persist_applied(service, &applied, ctx).await?;

    if failures.is_empty() {
        info!(pools = applied.len(), "Pools converged");
        Ok(Delivery::Converged(applied))
    } else {
        Err(ReconcileError::Pools(failures))
    }
}

async fn retract_pools(
    service: &ManagedService,
    ctx: &ControllerContext,
) -> Result<Delivery, ReconcileError> {
    let applied: Vec<AppliedPool> = recorded_pools(service).iter().cloned().collect();
    let mut failures = Vec::new();
    let remaining = delete_pools(&applied, ctx, &mut failures).await;

    let current = if remaining.is_empty() {
        clear_applied(service, ctx).await?
    } else {
        let current = persist_applied(service, &AppliedPoolSet::new(remaining), ctx).await?;
        if !ctx.options.force_rm_finalizer {
            return Err(ReconcileError::Pools(failures));
        }
        warn!(
            failed = failures.len(),
            "Releasing finalizer despite failed pool deletions"
        );
        current
    };

    finalizer::release(ctx.store.as_ref(), &current)
        .await
        .map_err(ReconcileError::ReleaseFinalizer)?;

    if failures.is_empty() {
        info!(pools = applied.len(), "Pools released");
        Ok(Delivery::Released)
    } else {
        Err(ReconcileError::Pools(failures))
    }
}

/// Delete each pool, returning the ones that could not be deleted
async fn delete_pools(
    pools: &[AppliedPool],
    ctx: &ControllerContext,
    failures: &mut Vec<PoolFailure>,
) -> Vec<AppliedPool> {
    let mut remaining = Vec::new();
    for pool in pools {
        match ctx.gateway.delete(&pool.product, &pool.pool_id).await {
            Ok(outcome) => debug!(pool = %pool.pool_id, ?outcome, "Deleted pool"),
            Err(error) => {
                warn!(pool = %pool.pool_id, error = %error, "Failed to delete pool");
                failures.push(PoolFailure {
                    pool: pool.clone(),
                    action: PoolAction::Delete,
                    error,
                });
                remaining.push(pool.clone());
            }
        }
    }
    remaining
}

/// Write the applied set to the Service unless it is already recorded
async fn persist_applied(
    service: &ManagedService,
    applied: &AppliedPoolSet,
    ctx: &ControllerContext,
) -> Result<ManagedService, ReconcileError> {
    let encoded = applied.encode()?;
    if service.applied_pools.as_deref() == Some(encoded.as_str()) {
        return Ok(service.clone());
    }

    let mutation = MetadataMutation::SetAnnotation {
        key: annotations::APPLIED_POOLS.to_string(),
        value: Some(encoded),
    };
    ctx.store
        .patch_metadata(service, mutation)
        .await
        .map_err(ReconcileError::PersistApplied)
}

/// Remove the applied-pools annotation once nothing remains to delete
async fn clear_applied(
    service: &ManagedService,
    ctx: &ControllerContext,
) -> Result<ManagedService, ReconcileError> {
    if service.applied_pools.is_none() {
        return Ok(service.clone());
    }

    let mutation = MetadataMutation::SetAnnotation {
        key: annotations::APPLIED_POOLS.to_string(),
        value: None,
    };
    ctx.store
        .patch_metadata(service, mutation)
        .await
        .map_err(ReconcileError::PersistApplied)
}

async fn record_outcome(
    service: &ManagedService,
    operation: Operation,
    result: &Result<Delivery, ReconcileError>,
    ctx: &ControllerContext,
) {
    let message = match result {
        Ok(_) => None,
        Err(e) => {
            // error_policy counts this failure after we return
            let attempt = service
                .uid
                .as_deref()
                .map_or(0, |uid| ctx.retry_tracker.get(uid))
                + 1;
            if is_escalated(attempt) {
                error!(attempt, error = %e, "Service keeps failing to reconcile");
                Some(format!("failed {} consecutive times: {}", attempt, e))
            } else {
                Some(e.to_string())
            }
        }
    };

    ctx.recorder
        .record(
            &service.key(),
            Some(&service.reference),
            operation,
            message.as_deref(),
        )
        .await;
}

/// Whether a Service carries anything this controller acts on
///
/// Checked against the watch cache before reading the Service from the API.
fn is_candidate(service: &ManagedService) -> bool {
    service.product().is_some()
        || service.has_finalizer(FINALIZER_NAME)
        || service.applied_pools.is_some()
}

/// Reconcile a Service delivered by the controller
pub(crate) async fn reconcile(
    service: Arc<Service>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileError> {
    let key = ObjectKey::from_resource(service.as_ref());
    if !is_candidate(&ManagedService::from_service(&service)) {
        debug!(service = %key, "Service not managed, skipping");
        return Ok(Action::await_change());
    }

    let delivery = reconcile_key(&key, &ctx).await?;

    if let Some(uid) = service.uid() {
        ctx.retry_tracker.reset(&uid);
    }

    Ok(match delivery {
        Delivery::FinalizerAttached => Action::requeue(Duration::ZERO),
        Delivery::Converged(_) => Action::requeue(ctx.options.resync_interval()),
        Delivery::Skipped | Delivery::Gone | Delivery::Released => Action::await_change(),
    })
}

/// Error policy: every failure is retried, with backoff unless a fixed interval is set
fn error_policy(service: Arc<Service>, error: &ReconcileError, ctx: Arc<ControllerContext>) -> Action {
    let uid = service.metadata.uid.as_deref().unwrap_or("unknown");
    let attempt = ctx.retry_tracker.increment(uid);
    let delay = retry_delay(attempt, ctx.options.retry_interval());

    warn!(
        namespace = %service.namespace().unwrap_or_default(),
        name = %service.name_any(),
        error = %error,
        attempt,
        error_kind = ?error.kind(),
        delay_secs = delay.as_secs(),
        "Reconciliation error"
    );

    Action::requeue(delay)
}

/// Run the Service controller until a shutdown signal arrives
pub async fn run(client: Client, ctx: Arc<ControllerContext>) {
    let (services, endpoints): (Api<Service>, Api<Endpoints>) =
        match ctx.options.namespace.single() {
            Some(namespace) => (
                Api::namespaced(client.clone(), namespace),
                Api::namespaced(client, namespace),
            ),
            None => (Api::all(client.clone()), Api::all(client)),
        };
    let config = ControllerConfig::default().concurrency(ctx.options.reconcile_concurrency);

    info!(
        namespaces = ?ctx.options.namespace,
        concurrency = ctx.options.reconcile_concurrency,
        "Starting Service controller"
    );

    let controller = Controller::new(services, WatcherConfig::default());
    let cache = controller.store();

    let reconciled = controller
        .watches(
            endpoints,
            WatcherConfig::default().labels(labels::PRODUCT),
            |endpoints| {
                Some(
                    ObjectRef::<Service>::new(&endpoints.name_any())
                        .within(&endpoints.namespace().unwrap_or_default()),
                )
            },
        )
        .with_config(config)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok((service, _)) => debug!(service = %service, "Reconciled"),
                Err(e) => error!(error = ?e, "Service controller stream error"),
            }
        });

    // The pruning loop never ends; the controller stopping ends both
    tokio::select! {
        _ = reconciled => {}
        _ = prune_retry_state(cache, ctx) => {}
    }
}

/// Forget retry state of Services that vanished while failing
///
/// Such Services never get another successful delivery, so nothing else
/// resets their entry.
async fn prune_retry_state(cache: Store<Service>, ctx: Arc<ControllerContext>) {
    if cache.wait_until_ready().await.is_err() {
        // Watch cache gone; leave shutdown to the controller stream
        return futures::future::pending().await;
    }

    let mut ticker = tokio::time::interval(ctx.options.resync_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let pruned = prune_once(&cache.state(), &ctx.retry_tracker);
        if pruned > 0 {
            debug!(pruned, "Dropped retry state of vanished Services");
        }
    }
}

fn prune_once(services: &[Arc<Service>], tracker: &RetryTracker) -> usize {
    let active: HashSet<String> = services.iter().filter_map(|service| service.uid()).collect();
    tracker.cleanup(&active)
}
