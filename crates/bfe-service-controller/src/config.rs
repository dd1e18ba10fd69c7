//! Command-line configuration and well-known object keys

use std::convert::Infallible;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use clap::{ArgAction, Parser};
use thiserror::Error;

/// Name reported as the event source and used as the server-side apply field manager
pub const CONTROLLER_NAME: &str = "bfe-service-controller";

/// Labels read from or written to cluster objects
pub mod labels {
    /// Service label naming the BFE product the Service belongs to
    pub const PRODUCT: &str = "bfe-product";
    /// Marks a ConfigMap as a reconcile result record
    pub const RESULT_MARKER: &str = "bfe-cm-result";
    /// Kind of object the result record describes
    pub const RESULT_TYPE: &str = "bfe-result-type";
    /// Operation the result record describes
    pub const RESULT_OPERATION: &str = "extra-msg";
}

/// Annotations written to managed Services
pub mod annotations {
    /// JSON list of the pools this controller owns on behalf of the Service
    pub const APPLIED_POOLS: &str = "k8s.bfenetworks.com/productpool-result";
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--bfe-api-addr must not be empty")]
    MissingApiAddr,

    #[error("--bfe-api-addr {addr:?} is not an http(s) URL: {reason}")]
    InvalidApiAddr { addr: String, reason: String },

    #[error("--bfe-api-token must not be empty")]
    MissingApiToken,

    #[error("--{flag} must be greater than zero")]
    ZeroValue { flag: &'static str },

    #[error("probe path {0:?} must start with '/'")]
    InvalidProbePath(String),
}

/// Which namespaces the controller acts in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceScope {
    All,
    Only(Vec<String>),
}

impl NamespaceScope {
    pub fn allows(&self, namespace: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(allowed) => allowed.iter().any(|ns| ns == namespace),
        }
    }

    /// The namespace to watch when exactly one is allowed
    pub fn single(&self) -> Option<&str> {
        match self {
            Self::Only(allowed) if allowed.len() == 1 => Some(allowed[0].as_str()),
            _ => None,
        }
    }
}

/// `*`, an empty string, or a list containing `*` all mean every namespace
impl FromStr for NamespaceScope {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let allowed: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|ns| !ns.is_empty())
            .map(str::to_string)
            .collect();

        if allowed.is_empty() || allowed.iter().any(|ns| ns == "*") {
            Ok(Self::All)
        } else {
            Ok(Self::Only(allowed))
        }
    }
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "bfe-service-controller",
    version,
    about = "Syncs Kubernetes Service endpoints to BFE product pools"
)]
pub struct ControllerOptions {
    /// Base URL of the BFE open-api, e.g. http://bfe-api:8183
    #[arg(long = "bfe-api-addr", env = "BFE_API_ADDR", default_value = "")]
    pub api_addr: String,

    /// Token sent verbatim in the Authorization header
    #[arg(
        long = "bfe-api-token",
        env = "BFE_API_TOKEN",
        default_value = "",
        hide_env_values = true
    )]
    pub api_token: String,

    /// Per-request timeout for open-api calls
    #[arg(long = "bfe-api-timeout-ms", env = "BFE_API_TIMEOUT_MS", default_value_t = 3000)]
    pub api_timeout_ms: u64,

    /// Appended to pool names so several clusters can share one product
    #[arg(long = "k8s-cluster-name", env = "K8S_CLUSTER_NAME", default_value = "")]
    pub cluster_name: String,

    /// Namespaces to reconcile: `*` or a comma-separated list
    #[arg(short = 'n', long, env = "WATCH_NAMESPACE", default_value = "*")]
    pub namespace: NamespaceScope,

    /// Do nothing when a delivered Service no longer exists
    #[arg(
        long,
        env = "SKIP_NIL_SVC_DELETE",
        default_value_t = true,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub skip_nil_svc_delete: bool,

    /// Release the finalizer even when some pools could not be deleted
    #[arg(
        long,
        env = "FORCE_RM_FINALIZER",
        default_value_t = false,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub force_rm_finalizer: bool,

    /// Fixed requeue delay after a failed reconcile; non-positive selects exponential backoff
    #[arg(
        long = "retry-interval-unit-sec",
        env = "RETRY_INTERVAL_UNIT_SEC",
        default_value_t = -1,
        allow_negative_numbers = true
    )]
    pub retry_interval_unit_sec: i64,

    /// Periodic resync interval for converged Services
    #[arg(long, env = "RESYNC_INTERVAL_SEC", default_value_t = 300)]
    pub resync_interval_sec: u64,

    /// Maximum number of Services reconciled concurrently
    #[arg(long, env = "RECONCILE_CONCURRENCY", default_value_t = 10)]
    pub reconcile_concurrency: u16,

    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = "0.0.0.0:9081")]
    pub health_probe_bind_address: SocketAddr,

    #[arg(long, default_value = "/healthz")]
    pub liveness_endpoint_name: String,

    #[arg(long, default_value = "/readyz")]
    pub readiness_endpoint_name: String,

    /// Seconds after startup during which readiness reports not ready
    #[arg(long, env = "UNREADY_DURATION", default_value_t = 30)]
    pub unready_duration: u64,
}

impl ControllerOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_addr.trim().is_empty() {
            return Err(ConfigError::MissingApiAddr);
        }
        let url = url::Url::parse(&self.api_addr).map_err(|e| ConfigError::InvalidApiAddr {
            addr: self.api_addr.clone(),
            reason: e.to_string(),
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::InvalidApiAddr {
                addr: self.api_addr.clone(),
                reason: format!("unsupported scheme {}", url.scheme()),
            });
        }
        if self.api_token.is_empty() {
            return Err(ConfigError::MissingApiToken);
        }
        if self.api_timeout_ms == 0 {
            return Err(ConfigError::ZeroValue {
                flag: "bfe-api-timeout-ms",
            });
        }
        if self.resync_interval_sec == 0 {
            return Err(ConfigError::ZeroValue {
                flag: "resync-interval-sec",
            });
        }
        if self.reconcile_concurrency == 0 {
            return Err(ConfigError::ZeroValue {
                flag: "reconcile-concurrency",
            });
        }
        for path in [&self.liveness_endpoint_name, &self.readiness_endpoint_name] {
            if !path.starts_with('/') {
                return Err(ConfigError::InvalidProbePath(path.clone()));
            }
        }
        Ok(())
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.api_timeout_ms)
    }

    /// Fixed retry delay, if one is configured
    pub fn retry_interval(&self) -> Option<Duration> {
        u64::try_from(self.retry_interval_unit_sec)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_sec)
    }

    pub fn unready_duration(&self) -> Duration {
        Duration::from_secs(self.unready_duration)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Options with every flag at its default and a valid API endpoint
    pub(crate) fn test_options() -> ControllerOptions {
        ControllerOptions::try_parse_from([
            "bfe-service-controller",
            "--bfe-api-addr",
            "http://bfe-api:8183",
            "--bfe-api-token",
            "Token secret",
        ])
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let options = test_options();

        assert_eq!(options.api_timeout(), Duration::from_millis(3000));
        assert_eq!(options.namespace, NamespaceScope::All);
        assert!(options.skip_nil_svc_delete);
        assert!(!options.force_rm_finalizer);
        assert_eq!(options.retry_interval(), None);
        assert_eq!(options.resync_interval(), Duration::from_secs(300));
        assert_eq!(options.reconcile_concurrency, 10);
        assert_eq!(options.health_probe_bind_address.port(), 9081);
        assert_eq!(options.liveness_endpoint_name, "/healthz");
        assert_eq!(options.readiness_endpoint_name, "/readyz");
        assert!(options.cluster_name.is_empty());
        assert_eq!(options.validate(), Ok(()));
    }

    #[test]
    fn test_flags_override_defaults() {
        let options = ControllerOptions::try_parse_from([
            "bfe-service-controller",
            "--bfe-api-addr",
            "https://bfe-api",
            "--bfe-api-token",
            "t",
            "-n",
            "prod, staging",
            "--skip-nil-svc-delete",
            "false",
            "--force-rm-finalizer",
            "--retry-interval-unit-sec",
            "15",
            "--k8s-cluster-name",
            "east",
        ])
        .unwrap();

        assert_eq!(
            options.namespace,
            NamespaceScope::Only(vec!["prod".to_string(), "staging".to_string()])
        );
        assert!(!options.skip_nil_svc_delete);
        assert!(options.force_rm_finalizer);
        assert_eq!(options.retry_interval(), Some(Duration::from_secs(15)));
        assert_eq!(options.cluster_name, "east");
    }

    #[test]
    fn test_negative_retry_interval_selects_backoff() {
        let mut options = test_options();
        options.retry_interval_unit_sec = 0;
        assert_eq!(options.retry_interval(), None);
        options.retry_interval_unit_sec = -5;
        assert_eq!(options.retry_interval(), None);
    }

    #[test]
    fn test_validate_rejects_bad_api_addr() {
        let mut options = test_options();
        options.api_addr = String::new();
        assert_eq!(options.validate(), Err(ConfigError::MissingApiAddr));

        options.api_addr = "bfe-api:8183".to_string();
        assert!(matches!(
            options.validate(),
            Err(ConfigError::InvalidApiAddr { .. })
        ));

        options.api_addr = "ftp://bfe-api".to_string();
        assert!(matches!(
            options.validate(),
            Err(ConfigError::InvalidApiAddr { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_missing_token_and_zero_values() {
        let mut options = test_options();
        options.api_token = String::new();
        assert_eq!(options.validate(), Err(ConfigError::MissingApiToken));

        let mut options = test_options();
        options.reconcile_concurrency = 0;
        assert_eq!(
            options.validate(),
            Err(ConfigError::ZeroValue {
                flag: "reconcile-concurrency"
            })
        );

        let mut options = test_options();
        options.readiness_endpoint_name = "readyz".to_string();
        assert!(matches!(
            options.validate(),
            Err(ConfigError::InvalidProbePath(_))
        ));
    }

    #[test]
    fn test_namespace_scope_parsing() {
        assert_eq!("*".parse::<NamespaceScope>().unwrap(), NamespaceScope::All);
        assert_eq!("".parse::<NamespaceScope>().unwrap(), NamespaceScope::All);
        assert_eq!(
            "a,*".parse::<NamespaceScope>().unwrap(),
            NamespaceScope::All
        );

        let scope: NamespaceScope = "prod".parse().unwrap();
        assert!(scope.allows("prod"));
        assert!(!scope.allows("dev"));
        assert_eq!(scope.single(), Some("prod"));

        let scope: NamespaceScope = "prod,dev".parse().unwrap();
        assert_eq!(scope.single(), None);
        assert!(NamespaceScope::All.allows("anything"));
    }
}
