//! Record of the pools created on behalf of a Service
//!
//! The set is stored on the Service as a JSON annotation:
//!
//! ```text
//! [{"Product":"shop","Poolname":"shop.k8s_default_web_http"}]
//! ```
//!
//! It only grows to include pools that were actually established, and only
//! shrinks by pools that were actually deleted.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("malformed applied-pools record: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("failed to encode applied-pools record: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppliedPool {
    #[serde(rename = "Product")]
    pub product: String,
    #[serde(rename = "Poolname")]
    pub pool_id: String,
}

impl AppliedPool {
    pub fn new(product: impl Into<String>, pool_id: impl Into<String>) -> Self {
        Self {
            product: product.into(),
            pool_id: pool_id.into(),
        }
    }
}

impl fmt::Display for AppliedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.product, self.pool_id)
    }
}

/// Ordered, duplicate-free list of applied pools
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct AppliedPoolSet(Vec<AppliedPool>);

impl AppliedPoolSet {
    pub fn new(pools: impl IntoIterator<Item = AppliedPool>) -> Self {
        let mut seen = HashSet::new();
        Self(
            pools
                .into_iter()
                .filter(|pool| seen.insert(pool.clone()))
                .collect(),
        )
    }

    /// Parse the annotation value; a blank or `null` value is the empty set
    pub fn decode(raw: &str) -> Result<Self, LedgerError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let pools: Option<Vec<AppliedPool>> =
            serde_json::from_str(raw).map_err(LedgerError::Malformed)?;
        Ok(Self::new(pools.unwrap_or_default()))
    }

    pub fn encode(&self) -> Result<String, LedgerError> {
        serde_json::to_string(self).map_err(LedgerError::Encode)
    }

    pub fn contains(&self, pool: &AppliedPool) -> bool {
        self.0.contains(pool)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AppliedPool> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries of `self` that are absent from `other`, in `self` order
    pub fn diff(&self, other: &AppliedPoolSet) -> Vec<AppliedPool> {
        self.0
            .iter()
            .filter(|pool| !other.contains(pool))
            .cloned()
            .collect()
    }
}

impl FromIterator<AppliedPool> for AppliedPoolSet {
    fn from_iter<I: IntoIterator<Item = AppliedPool>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// Applied set after one converge pass
///
/// * `desired` - every pool the Service should have, in build order
/// * `settled` - desired pools that now exist remotely (or were recorded
///   without a remote call because they have no members)
/// * `stale_failed` - previously applied pools that should be gone but whose
///   deletion failed
///
/// A desired pool whose upsert failed keeps its entry only if it was already
/// applied before. Settled pools come first in desired order, followed by the
/// stale pools still owed a delete.
pub fn next_applied(
    old: &AppliedPoolSet,
    desired: &[AppliedPool],
    settled: &[AppliedPool],
    stale_failed: &[AppliedPool],
) -> AppliedPoolSet {
    desired
        .iter()
        .filter(|pool| settled.contains(pool) || old.contains(pool))
        .chain(stale_failed.iter())
        .cloned()
        .collect()
}
