use crate::cli::ServeArgs;
use crate::infra::{seed_bootstrap_admin, seed_catalog, AppState, BucketBlobStore, LoggingPublisher};
use crate::routes::with_operational_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use clap::Args;
use health_permit::config::{AppConfig, ReviewConfig};
use health_permit::error::AppError;
use health_permit::telemetry;
use health_permit::workflows::permit::{
    permit_router, InMemoryReviewStore, PermitReviewService, RepositoryError, ReviewStore,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

type ReviewService = PermitReviewService<InMemoryReviewStore>;

#[derive(Args, Debug, Default)]
pub(crate) struct SweepArgs {
    /// Ledger snapshot to sweep (defaults to PERMIT_STATE_PATH)
    #[arg(long)]
    pub(crate) state: Option<PathBuf>,
}

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
    let readiness_flag = Arc::new(AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let store = Arc::new(open_store(&config.review)?);
    let service = Arc::new(build_service(store.clone(), &config.review));
    let sweeper = tokio::spawn(sweep_periodically(
        service.clone(),
        store.clone(),
        config.review.clone(),
    ));

    let app = with_operational_routes(permit_router(service))
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, "health permit review service ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    readiness_flag.store(false, Ordering::Release);
    sweeper.abort();
    persist(&store, config.review.state_path.as_deref());
    info!("health permit review service stopped");
    Ok(())
}

/// One-off archival pass over the persisted ledger, for cron-style deployments.
pub(crate) fn sweep_once(args: SweepArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;
    if let Some(state) = args.state {
        config.review.state_path = Some(state);
    }

    telemetry::init(&config.telemetry)?;
    if config.review.state_path.is_none() {
        warn!("no ledger snapshot configured; sweeping an empty ledger");
    }

    let store = Arc::new(open_store(&config.review)?);
    let service = build_service(store.clone(), &config.review);
    let report = service.sweep_expired_pending_payments()?;
    persist(&store, config.review.state_path.as_deref());

    println!(
        "Archived {} application(s); skipped {}",
        report.archived_count(),
        report.skipped
    );
    for application_id in &report.archived {
        println!("  - {application_id}");
    }
    Ok(())
}

pub(crate) fn open_store(review: &ReviewConfig) -> Result<InMemoryReviewStore, AppError> {
    let store = match review.state_path.as_deref() {
        Some(path) if path.exists() => {
            let store = InMemoryReviewStore::load_snapshot(path)?;
            info!(path = %path.display(), "review ledger restored");
            store
        }
        _ => InMemoryReviewStore::default(),
    };

    if let Some(admin_id) = review.bootstrap_admin {
        store.transaction(|tables| {
            seed_bootstrap_admin(tables, admin_id);
            Ok::<_, RepositoryError>(())
        })?;
    }
    Ok(store)
}

fn build_service(store: Arc<InMemoryReviewStore>, review: &ReviewConfig) -> ReviewService {
    PermitReviewService::new(
        store,
        Arc::new(seed_catalog()),
        Arc::new(BucketBlobStore::new(review.blob_base_url.clone())),
        Arc::new(LoggingPublisher),
    )
    .with_policy(review.policy())
}

async fn sweep_periodically(
    service: Arc<ReviewService>,
    store: Arc<InMemoryReviewStore>,
    review: ReviewConfig,
) {
    let mut ticker = tokio::time::interval(review.sweep_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let service = service.clone();
        match tokio::task::spawn_blocking(move || service.sweep_expired_pending_payments()).await {
            Ok(Ok(report)) if report.archived_count() > 0 => {
                info!(
                    archived = report.archived_count(),
                    skipped = report.skipped,
                    "payment deadline sweep archived applications"
                );
                persist(&store, review.state_path.as_deref());
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(error = %err, "payment deadline sweep failed"),
            Err(err) => warn!(error = %err, "payment deadline sweep task aborted"),
        }
    }
}

fn persist(store: &InMemoryReviewStore, path: Option<&Path>) {
    let Some(path) = path else {
        return;
    };
    if let Err(err) = store.save_snapshot(path) {
        warn!(path = %path.display(), error = %err, "failed to save review ledger");
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "unable to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
