#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use splitroom::hub::Hub;
use splitroom::server::AppState;
use splitroom::store::{MemoryStore, RoomStore};
use splitroom::Config;

pub fn test_config() -> Config {
    Config {
        port: 0,
        redis_url: "memory://".to_string(),
        session_secret: String::new(),
        join_token_key: String::new(),
        cors_allowed_origins: Vec::new(),
        room_ttl: Duration::from_secs(14_400),
        cookie_secure: false,
        cookie_domain: String::new(),
        openai_api_key: String::new(),
        openai_base_url: "https://api.openai.com".to_string(),
        public_base_url: "https://localhost".to_string(),
        ecb_rates_url: "https://api.exchangerate.host/latest".to_string(),
    }
}

pub fn test_state() -> AppState {
    test_state_with(test_config())
}

pub fn test_state_with(config: Config) -> AppState {
    let store: Arc<dyn RoomStore> = Arc::new(MemoryStore::new());
    let hub = Arc::new(Hub::new(Arc::clone(&store)));
    AppState::new(config, store, hub)
}
