use persister::{AsyncStoragePersister, PersistedClient, Persister};
use serde_json::json;
use shared::config::PersistConfig;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use storage_engine::open_backend;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const MUTATIONS: u64 = 25;

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Load environment variables from .env file (if exists)
    match dotenvy::dotenv() {
        Ok(_) => info!("Loaded environment variables from .env file"),
        Err(_) => info!("No .env file found, using system environment variables"),
    }

    let config = PersistConfig::from_env();
    let storage = match open_backend(&config.backend) {
        Ok(storage) => storage,
        Err(e) => {
            warn!("Failed to open storage backend: {}. Running without persistence.", e);
            None
        }
    };

    let persister: AsyncStoragePersister<PersistedClient> = AsyncStoragePersister::builder()
        .maybe_storage(storage)
        .apply_config(&config)
        .build();

    // Startup: rehydrate whatever the previous run left behind
    let mut generation = match persister.restore_client().await {
        Ok(Some(snapshot)) => {
            info!("Restored snapshot: {}", snapshot);
            snapshot["generation"].as_u64().unwrap_or(0) + 1
        }
        Ok(None) => {
            info!("No snapshot stored yet, starting fresh");
            0
        }
        Err(e) => {
            warn!("Stored snapshot unreadable ({}), starting fresh", e);
            0
        }
    };

    // Simulate a burst of cache mutations; only a few of these reach storage
    for mutation in 0..MUTATIONS {
        let snapshot = json!({
            "generation": generation,
            "timestamp": now_millis() as u64,
            "clientState": { "mutations": mutation + 1 },
        });
        persister.persist_client(snapshot);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    generation += 1;

    info!("Flushing pending snapshot before exit");
    persister.flush().await;

    match persister.restore_client().await? {
        Some(snapshot) => info!("Stored snapshot now: {}", snapshot),
        None => info!("Nothing stored (persistence disabled or every save failed)"),
    }
    info!("Next run will start at generation {}", generation);

    Ok(())
}
