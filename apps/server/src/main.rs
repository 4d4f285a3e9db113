//! FlowSlide sync core server.
//!
//! Exit codes: 0 on clean shutdown, 42 when a restore completed and the
//! process must be restarted so the local store reopens.

mod api;
mod error;
mod factory;
mod state;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use flowslide_core::context::CoreContext;
use flowslide_core::settings::RuntimeConfig;
use flowslide_core::store::new_write_barrier;
use flowslide_storage_sqlite::{LocalRecordStore, TransitionLogStore};

use crate::factory::DefaultAdapterFactory;
use crate::state::AppState;

const RESTART_EXIT_CODE: i32 = 42;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let exit_code = match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("fatal: {e}");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run() -> Result<i32, Box<dyn std::error::Error>> {
    let config = RuntimeConfig::from_env();
    let env_vars: HashMap<String, String> = std::env::vars().collect();

    let barrier = new_write_barrier();
    let local = Arc::new(LocalRecordStore::open(&config.local_db_path, barrier.clone())?);
    let transition_log = Arc::new(TransitionLogStore::new(local.pool(), local.writer()));

    let core = CoreContext::initialize(
        config,
        local,
        barrier,
        Arc::new(DefaultAdapterFactory),
        transition_log,
        env_vars,
    )
    .await?;
    core.start().await;

    let mut restart = core.restart_requested();
    let state = AppState {
        core: Arc::clone(&core),
    };

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("control API listening on {bind_addr}");

    let router = api::router(state);
    let server = async move { axum::serve(listener, router).await };

    let exit_code = tokio::select! {
        result = server => {
            result?;
            0
        }
        _ = restart.wait_for(|&requested| requested) => {
            info!("restart requested after restore");
            RESTART_EXIT_CODE
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            0
        }
    };

    core.shutdown().await;
    Ok(exit_code)
}
