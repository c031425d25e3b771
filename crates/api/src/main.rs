use std::sync::Arc;

use anyhow::Context;

use reportflow_api::app::{
    self,
    services::{self, AppServices, Collaborators},
};
use reportflow_api::collaborators::{HttpArtifactRenderer, HttpReportComputer};
use reportflow_infra::config::PipelineConfig;

fn main() -> anyhow::Result<()> {
    reportflow_observability::init();

    let config = PipelineConfig::from_env().context("invalid pipeline configuration")?;

    // The blocking HTTP clients must be built outside the runtime.
    let report_url =
        std::env::var("REPORTFLOW_REPORT_URL").unwrap_or_else(|_| "http://localhost:9001".to_string());
    let artifact_url =
        std::env::var("REPORTFLOW_ARTIFACT_URL").unwrap_or_else(|_| "http://localhost:9002".to_string());
    let collaborators = Collaborators {
        computer: Arc::new(HttpReportComputer::new(report_url).context("report client")?),
        renderer: Arc::new(HttpArtifactRenderer::new(artifact_url).context("artifact client")?),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    let backends = runtime.block_on(services::build_backends(&config))?;
    let services = Arc::new(AppServices::new(config, backends, collaborators));
    let background = services
        .start_background()
        .context("failed to start background workers")?;

    let bind_addr = std::env::var("REPORTFLOW_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let router = app::build_app(services.clone());

    runtime.block_on(async {
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        tracing::info!("listening on {}", listener.local_addr()?);

        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown requested");
            })
            .await
            .context("server error")
    })?;

    services.stop_watches();
    background.shutdown();
    Ok(())
}
