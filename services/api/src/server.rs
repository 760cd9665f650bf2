use crate::cli::ServeArgs;
use crate::infra::{local_service, AppState};
use crate::routes::with_review_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use review_engine::config::AppConfig;
use review_engine::error::AppError;
use review_engine::telemetry;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let (service, _mailer) = local_service(&config.review);
    let service = Arc::new(service);

    let app = with_review_routes(service.clone())
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    match service.load().await {
        Ok(report) => {
            readiness_flag.store(true, Ordering::Release);
            info!(
                applications = report.applications,
                cache_hit = report.cache_hit,
                "initial workspace load complete"
            );
        }
        // Cached data, if any, is still served; readiness stays off.
        Err(error) => warn!(%error, "initial workspace load failed"),
    }

    info!(
        ?config.environment,
        %addr,
        workspace_id = %config.review.workspace_id,
        form_id = %config.review.form_id,
        "review orchestration service listening"
    );

    axum::serve(listener, app).await?;
    Ok(())
}
