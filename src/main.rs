use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edgebuf::{Config, RecordStatus, RecordStore};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            eprintln!("Optional: EDGEBUF_DATABASE_URL (default: sqlite://edgebuf.db)");
            eprintln!("Optional: EDGEBUF_UNLIMITED, EDGEBUF_MAX_SAMPLES, EDGEBUF_OLDEST_FIRST");
            eprintln!("Optional: EDGEBUF_DELETE_METHOD, EDGEBUF_AFTER_DAYS");
            eprintln!("Optional: EDGEBUF_FORWARD_METHOD, EDGEBUF_TIME_START, EDGEBUF_TIME_END");
            std::process::exit(1);
        }
    };

    tracing::info!("Starting edgebuf");
    tracing::info!("Database: {}", config.database_url);
    tracing::info!(
        "Capacity: {}",
        if config.capacity.unlimited {
            "unlimited".to_string()
        } else {
            format!("{} records", config.capacity.max_samples)
        }
    );
    tracing::info!("Deletion policy: {:?}", config.deletion.method);
    tracing::info!("Forwarding policy: {:?}", config.forwarding.method);

    // Open the store and start the retention sweeper
    let store = match RecordStore::open(&config).await {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Database error: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Buffered records: {} unsent, {} pending, {} sent",
        store.count_by_status(RecordStatus::Unsent).await,
        store.count_by_status(RecordStatus::Pending).await,
        store.count_by_status(RecordStatus::Sent).await
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }

    tracing::info!("Shutting down");
    store.close().await;
}
