use std::sync::Arc;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dealscout_common::Config;
use dealscout_ingest::extract::CardExtractor;
use dealscout_ingest::scheduler::SchedulerDefaults;
use dealscout_ingest::{
    DedupLedger, GroupTracker, HttpPageFetcher, ListingStore, PageFetcher, PgLedger,
    PgListingStore, PgScheduleStore, ScheduleManager, ScheduleStore, WorkerPool,
};

mod events;
mod rest;

pub struct AppState {
    pub config: Config,
    pub tracker: Arc<GroupTracker>,
    pub pool: Arc<WorkerPool>,
    pub schedules: Arc<ScheduleManager>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("dealscout=info".parse()?))
        .init();

    info!("Deal Scout API starting...");

    let config = Config::from_env();
    config.log_redacted();

    let pg = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    dealscout_ingest::schema::init_schema(&pg).await?;

    let tracker = Arc::new(GroupTracker::new());
    let ledger: Arc<dyn DedupLedger> = Arc::new(PgLedger::new(pg.clone()));
    let store: Arc<dyn ListingStore> = Arc::new(PgListingStore::new(pg.clone()));
    let fetcher: Arc<dyn PageFetcher> = Arc::new(HttpPageFetcher::new(
        Arc::new(CardExtractor::new()),
        config.fetch_timeout_secs,
    ));
    let pool = Arc::new(WorkerPool::new(
        fetcher,
        store,
        ledger.clone(),
        tracker.clone(),
        config.max_consecutive_failures,
    ));
    let schedule_store: Arc<dyn ScheduleStore> = Arc::new(PgScheduleStore::new(pg));
    let schedules = Arc::new(ScheduleManager::new(
        schedule_store,
        pool.clone(),
        tracker.clone(),
        ledger,
        SchedulerDefaults {
            worker_count: config.default_worker_count,
            concurrency: config.default_concurrency,
        },
    ));

    // Fires due schedules and settles finished runs in the background.
    tokio::spawn(schedules.clone().run_loop(config.scheduler_tick_secs));

    let state = Arc::new(AppState {
        config: config.clone(),
        tracker,
        pool,
        schedules,
    });

    let app = Router::new()
        // Health check
        .route("/", get(|| async { "ok" }))
        // Job groups
        .route("/api/groups", get(rest::list_groups).post(rest::start_group))
        .route("/api/groups/{id}", get(rest::get_group))
        .route("/api/groups/{id}/stop", post(rest::stop_group))
        // Schedules
        .route(
            "/api/schedules",
            get(rest::schedules::list_schedules).post(rest::schedules::create_schedule),
        )
        .route(
            "/api/schedules/{id}",
            get(rest::schedules::get_schedule).delete(rest::schedules::delete_schedule),
        )
        .route("/api/schedules/{id}/toggle", post(rest::schedules::toggle_schedule))
        .route("/api/schedules/{id}/run", post(rest::schedules::run_schedule_now))
        // Live status feed
        .route("/api/events", get(events::group_events))
        .with_state(state)
        // CORS
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        // Logging layer: method + path only
        .layer(
            tower_http::trace::TraceLayer::new_for_http().make_span_with(
                |request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                },
            ),
        );

    let addr = format!("{}:{}", config.web_host, config.web_port);
    info!("Deal Scout API listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
