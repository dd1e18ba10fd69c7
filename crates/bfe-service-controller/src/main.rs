use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::Client;
use tokio::select;
use tracing::{error, info};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use bfe_openapi::OpenApiClient;
use bfe_service_controller::config::CONTROLLER_NAME;
use bfe_service_controller::controllers::{self, ControllerContext};
use bfe_service_controller::events::KubeEventPublisher;
use bfe_service_controller::gateway::AlbPoolGateway;
use bfe_service_controller::health::{run_health_server, HealthState};
use bfe_service_controller::recorder::ResultRecorder;
use bfe_service_controller::store::KubeStore;
use bfe_service_controller::ControllerOptions;

#[tokio::main]
async fn main() -> Result<()> {
    let options = ControllerOptions::parse();

    // JSON logs for production; RUST_LOG overrides the default level
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(false),
        )
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    options.validate().context("Invalid configuration")?;

    info!(
        api_addr = %options.api_addr,
        cluster_name = %options.cluster_name,
        namespaces = ?options.namespace,
        skip_nil_svc_delete = options.skip_nil_svc_delete,
        force_rm_finalizer = options.force_rm_finalizer,
        retry_interval_unit_sec = options.retry_interval_unit_sec,
        "bfe-service-controller starting"
    );

    let kube_client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    info!("Connected to Kubernetes cluster");

    let api_client = OpenApiClient::new(&options.api_addr, &options.api_token, options.api_timeout())
        .context("Failed to create BFE open-api client")?;

    let store = Arc::new(KubeStore::new(kube_client.clone()));
    let events = Arc::new(KubeEventPublisher::new(kube_client.clone(), CONTROLLER_NAME));
    let recorder = Arc::new(ResultRecorder::new(store.clone(), events));
    let options = Arc::new(options);

    let ctx = Arc::new(ControllerContext::new(
        store,
        Arc::new(AlbPoolGateway::new(api_client)),
        recorder,
        options.clone(),
    ));

    let health = Arc::new(HealthState::new(options.unready_duration()));

    select! {
        _ = controllers::service::run(kube_client, ctx) => {
            info!("Service controller stopped, shutdown complete");
        }
        result = run_health_server(
            health,
            options.health_probe_bind_address,
            &options.liveness_endpoint_name,
            &options.readiness_endpoint_name,
        ) => {
            match result {
                Ok(()) => bail!("Health check server exited unexpectedly"),
                Err(e) => {
                    error!(error = %e, "Health check server failed");
                    return Err(e).context("Health check server failure");
                }
            }
        }
    }

    Ok(())
}
