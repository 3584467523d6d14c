use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use diesel::PgConnection;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

use anyhow::Result;
use clap::Parser;
use diesel::Connection;
use diesel_async::{pooled_connection::bb8::Pool, AsyncPgConnection};
use inventory_service::api::{self, AppState};
use inventory_service::clock::SystemClock;
use inventory_service::config::{Args, ServiceConfig};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("inventory_service=info,tower_http=info")),
        )
        .init();
    let args = Args::parse();
    let config = ServiceConfig::from(&args);
    let clock = Arc::new(SystemClock);

    let app_state = if args.in_memory {
        warn!("Running with in-memory storage; state is lost on restart");
        AppState::in_memory(&config, clock)
    } else {
        // Run migrations first
        info!("Running database migrations...");
        let mut conn = PgConnection::establish(&args.database_url)?;
        conn.run_pending_migrations(MIGRATIONS).map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
        info!("Migrations completed successfully");

        let manager =
            diesel_async::pooled_connection::AsyncDieselConnectionManager::<AsyncPgConnection>::new(&args.database_url);
        let pool = Pool::builder().build(manager).await?;
        AppState::postgres(pool, &config, clock)
    };

    let providers = app_state.processor.normalizer().providers();
    if providers.is_empty() {
        warn!("No webhook provider secrets configured; webhook routes will answer 404");
    } else {
        info!("Webhook providers enabled: {}", providers.join(", "));
    }

    let sweeper = app_state.sweeper(config.sweep_interval);
    tokio::spawn(async move {
        sweeper.run().await;
    });

    let app = api::create_router(app_state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;

    info!("Inventory service web server started on port {}", args.port);

    axum::serve(listener, app).await?;

    Ok(())
}
