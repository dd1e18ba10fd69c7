//! Kubernetes controllers for watched resources

pub mod retry;
pub mod service;

use std::sync::Arc;

use crate::config::ControllerOptions;
use crate::desired::DesiredStateBuilder;
use crate::gateway::PoolGateway;
use crate::recorder::ResultRecorder;
use crate::store::ServiceStore;

use retry::RetryTracker;

/// Shared state for the controller
pub struct ControllerContext {
    /// Cluster reads and metadata patches
    pub store: Arc<dyn ServiceStore>,
    /// BFE open-api pool operations
    pub gateway: Arc<dyn PoolGateway>,
    /// Result records and Events
    pub recorder: Arc<ResultRecorder>,
    /// Desired pools from Service and Endpoints
    pub builder: DesiredStateBuilder,
    /// Startup configuration
    pub options: Arc<ControllerOptions>,
    /// Consecutive failures per Service UID
    pub retry_tracker: Arc<RetryTracker>,
}

impl ControllerContext {
    pub fn new(
        store: Arc<dyn ServiceStore>,
        gateway: Arc<dyn PoolGateway>,
        recorder: Arc<ResultRecorder>,
        options: Arc<ControllerOptions>,
    ) -> Self {
        Self {
            store,
            gateway,
            recorder,
            builder: DesiredStateBuilder::new(options.cluster_name.clone()),
            options,
            retry_tracker: Arc::new(RetryTracker::new()),
        }
    }
}
