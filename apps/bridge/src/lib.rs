#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    config::Config,
    nonce::NonceRegistry,
    pairing::PairTokenTable,
    push::PushGateway,
    server::{AppState, build_router},
    signature::RequestAuthenticator,
    store::{MemoryStore, PgStore, RecordStore},
    waiter::DecisionWaiters,
};

pub mod approvals;
pub mod config;
pub mod nonce;
pub mod pairing;
pub mod push;
pub mod runs;
pub mod server;
pub mod signature;
pub mod store;
pub mod types;
pub mod waiter;

pub async fn build_bridge_state(config: Config) -> Result<AppState> {
    let store: Arc<dyn RecordStore> = match config.db_url.clone() {
        Some(url) => Arc::new(PgStore::connect(url.as_str()).await?),
        None => Arc::new(MemoryStore::new()),
    };
    let nonces = Arc::new(NonceRegistry::new(config.signature_ttl_ms));
    let authenticator = Arc::new(RequestAuthenticator::new(nonces));
    let waiters = Arc::new(DecisionWaiters::new());
    let pair_tokens = Arc::new(PairTokenTable::new(config.pair_token_ttl_ms));
    let push = Arc::new(PushGateway::from_config(&config));

    Ok(AppState::new(
        config,
        store,
        authenticator,
        waiters,
        pair_tokens,
        push,
    ))
}

pub async fn build_app(config: Config) -> Result<axum::Router> {
    Ok(build_router(build_bridge_state(config).await?))
}

pub async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        "bridge service listening"
    );
    axum::serve(listener, build_app(config).await?).await?;
    Ok(())
}
