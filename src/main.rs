use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;

use storefront_rewards::{
    repositories::{LocalStore, MirroredStore, PgStore, Store},
    services,
    settings::Settings,
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    #[arg(short, long)]
    listen: Option<String>,
    #[arg(long, default_value = "log4rs.yaml")]
    log4rs: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    init_logging(&args.log4rs)?;
    let settings = Settings::load(&args.config)?;
    log::info!("Starting storefront rewards engine.");

    let pool = PgPoolOptions::new().max_connections(settings.postgres.max_connections);

    let store: Arc<dyn Store> = if settings.fallback.enabled {
        let path = settings.fallback.snapshot_path()?;
        let fallback = LocalStore::open(&path).await?;
        log::info!("Local fallback enabled at {}.", path.display());

        // Connect lazily so an unreachable primary starts the engine degraded.
        let primary = PgStore::new(pool.connect_lazy(&settings.postgres.url)?);
        match primary.migrate().await {
            Ok(()) => log::info!("Database migrations applied."),
            Err(e) if e.is_storage_unavailable() => log::error!(
                "Primary store unreachable at startup, migrations deferred to the next restart: {}",
                e
            ),
            Err(e) => return Err(e.into()),
        }

        let store = MirroredStore::new(primary, fallback, settings.fallback.recheck_interval());
        if store.ping().await.is_err() {
            log::warn!("Starting in degraded mode on the local fallback.");
        }
        Arc::new(store)
    } else {
        let primary = PgStore::new(pool.connect(&settings.postgres.url).await?);
        primary.migrate().await?;
        log::info!("Database migrations applied.");
        Arc::new(primary)
    };

    let listen = args
        .listen
        .clone()
        .unwrap_or_else(|| settings.server.listen.clone());
    services::start_services(store, settings, &listen).await
}

fn init_logging(path: &str) -> Result<(), anyhow::Error> {
    if !Path::new("logs").exists() {
        fs::create_dir("logs")?;
    }

    match log4rs::init_file(path, Default::default()) {
        Ok(_) => {
            println!("[*] Logging initialized successfully.");
            Ok(())
        }
        Err(e) => {
            println!("[ERROR] Failed to initialize logging: {}", e);
            Err(anyhow::anyhow!("Could not initialize logging: {}", e))
        }
    }
}
