use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use splitroom::config::Config;
use splitroom::hub::Hub;
use splitroom::presence;
use splitroom::server::{self, AppState};
use splitroom::store::{MemoryStore, RedisStore, RoomStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();

    let store: Arc<dyn RoomStore> = if config.redis_url.starts_with("memory://") {
        info!("using in-memory room store");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(RedisStore::connect(&config.redis_url, config.room_ttl).await?)
    };

    let hub = Arc::new(Hub::new(Arc::clone(&store)));
    tokio::spawn(presence::run(Arc::clone(&hub)));

    let addr = format!("0.0.0.0:{}", config.port);
    let app = server::router(AppState::new(config, store, hub));
    let listener = TcpListener::bind(&addr).await?;
    info!("splitroom backend listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}
