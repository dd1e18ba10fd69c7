//! Per-Service reconcile outcome, published as a ConfigMap and an Event
//!
//! The record for Service `web` lives in ConfigMap `web.result` in the same
//! namespace. It carries the last operation, `Succ` or the error text, and a
//! timestamp. A successful delete removes the record. Failures here are
//! logged and never change the reconcile outcome.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Local};
use k8s_openapi::api::core::v1::{ConfigMap, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::events::EventType;
use tracing::{debug, warn};

use crate::config::labels;
use crate::events::{actions, reasons, EventPublisher};
use crate::model::ObjectKey;
use crate::store::ResultStore;

/// `result` value written on success
pub const RESULT_SUCCESS: &str = "Succ";

pub const RESULT_KEY: &str = "result";
pub const TIMESTAMP_KEY: &str = "timestamp";

const RESULT_TYPE_SERVICE: &str = "service";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of the record ConfigMap for a Service
pub fn record_name(service: &str) -> String {
    format!("{}.result", service)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    pub operation: Operation,
    /// `Succ` or the error text
    pub result: String,
    pub timestamp: String,
}

impl ResultRecord {
    pub fn new(operation: Operation, error: Option<&str>, at: DateTime<Local>) -> Self {
        Self {
            operation,
            result: error.unwrap_or(RESULT_SUCCESS).to_string(),
            timestamp: at.format(TIMESTAMP_FORMAT).to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result == RESULT_SUCCESS
    }

    pub fn to_config_map(&self, key: &ObjectKey) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(record_name(&key.name)),
                namespace: Some(key.namespace.clone()),
                labels: Some(BTreeMap::from([
                    (labels::RESULT_MARKER.to_string(), "yes".to_string()),
                    (labels::RESULT_TYPE.to_string(), RESULT_TYPE_SERVICE.to_string()),
                    (
                        labels::RESULT_OPERATION.to_string(),
                        self.operation.as_str().to_string(),
                    ),
                ])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                (RESULT_KEY.to_string(), self.result.clone()),
                (TIMESTAMP_KEY.to_string(), self.timestamp.clone()),
            ])),
            ..Default::default()
        }
    }
}

/// Publishes reconcile outcomes
pub struct ResultRecorder {
    store: Arc<dyn ResultStore>,
    events: Arc<dyn EventPublisher>,
}

impl ResultRecorder {
    pub fn new(store: Arc<dyn ResultStore>, events: Arc<dyn EventPublisher>) -> Self {
        Self { store, events }
    }

    /// Record the outcome of `operation` on the Service at `key`
    ///
    /// `reference` is absent when the Service no longer exists, in which case
    /// no Event is emitted.
    pub async fn record(
        &self,
        key: &ObjectKey,
        reference: Option<&ObjectReference>,
        operation: Operation,
        error: Option<&str>,
    ) {
        let record = ResultRecord::new(operation, error, Local::now());

        let stored = if operation == Operation::Delete && error.is_none() {
            self.store.remove_record(key).await
        } else {
            self.store.put_record(key, &record).await
        };
        match stored {
            Ok(()) => debug!(service = %key, %operation, "Recorded reconcile result"),
            Err(e) => warn!(service = %key, %operation, error = %e, "Failed to write result record"),
        }

        let Some(reference) = reference else {
            return;
        };
        let (type_, reason, note) = match (operation, error) {
            (Operation::Update, None) => (
                EventType::Normal,
                reasons::POOLS_SYNCED,
                format!("update succeeded for {}", key),
            ),
            (Operation::Delete, None) => (
                EventType::Normal,
                reasons::POOLS_RELEASED,
                format!("delete succeeded for {}", key),
            ),
            (Operation::Update, Some(e)) => {
                (EventType::Warning, reasons::POOLS_SYNC_FAILED, e.to_string())
            }
            (Operation::Delete, Some(e)) => {
                (EventType::Warning, reasons::POOLS_RELEASE_FAILED, e.to_string())
            }
        };
        let action = match operation {
            Operation::Update => actions::UPDATE,
            Operation::Delete => actions::DELETE,
        };
        self.events
            .publish(reference, type_, reason, action, Some(note))
            .await;
    }
}
