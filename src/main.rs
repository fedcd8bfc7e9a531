//! KubeDB Operator Entry Point
//!
//! Starts one controller per enabled database kind, the DormantDatabase controller,
//! the metrics server and, when enabled, the mutating admission webhook.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kubedb_operator::config::OperatorConfig;
use kubedb_operator::controller::{self, EventSink, KubeEventSink};
use kubedb_operator::store::ClusterStores;
use kubedb_operator::{crd, server, telemetry};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing(config: &OperatorConfig) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let fmt_layer = if config.log_json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    // Only enable OTEL if an endpoint is provided
    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        match telemetry::init_telemetry() {
            Ok(otel_layer) => {
                registry.with(otel_layer).init();
                info!("OpenTelemetry tracing initialized");
            }
            Err(e) => {
                registry.init();
                error!("OpenTelemetry tracing disabled: {}", e);
            }
        }
    } else {
        registry.init();
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }
}

/// Cancel `token` on SIGTERM or Ctrl-C
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
                    }
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl-C");
        }
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::parse();
    init_tracing(&config);
    config.validate()?;

    info!(
        "Starting KubeDB Operator v{} ({}, built {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_SHA"),
        env!("BUILD_DATE")
    );

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");
    info!("Operating namespace: {}", config.operator_namespace);

    if config.install_crds {
        crd::install(&client, config.crd_timeout())
            .await
            .context("failed to install CRDs")?;
    }

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let stores = ClusterStores::from_client(&client);
    let events: Arc<dyn EventSink> = Arc::new(KubeEventSink::new(client.clone(), "kubedb-operator"));
    let controller_config = config.controller_config(shutdown.clone());

    let mut tasks = JoinSet::new();
    for kind in config.enabled_kinds() {
        tasks.spawn(controller::run_kind(
            kind,
            client.clone(),
            stores.clone(),
            Arc::clone(&events),
            controller_config.clone(),
            shutdown.clone(),
        ));
    }
    tasks.spawn(controller::run_dormant_controller(
        client.clone(),
        stores.clone(),
        Arc::clone(&events),
        controller_config.clone(),
        shutdown.clone(),
    ));

    {
        let addr = config.metrics_addr;
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            if let Err(e) = server::serve(addr, shutdown).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    if config.enable_mutating_webhook {
        #[cfg(feature = "admission-webhook")]
        {
            let (addr, cert, key) = (
                config.webhook_addr,
                config.tls_cert.clone(),
                config.tls_key.clone(),
            );
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                if let Err(e) =
                    kubedb_operator::admission::server::serve(addr, &cert, &key, shutdown).await
                {
                    error!("Admission webhook server error: {}", e);
                }
            });
        }
        #[cfg(not(feature = "admission-webhook"))]
        error!("Mutating webhook requested but built without the admission-webhook feature");
    }

    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            error!("Operator task failed: {}", e);
            shutdown.cancel();
        }
    }

    info!("KubeDB Operator stopped");
    telemetry::shutdown_telemetry();
    Ok(())
}
