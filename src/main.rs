mod api;
mod app;
mod blockchain;
mod config;
mod miner;
mod realtime;
mod store;
mod transaction;
mod user;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use actix_web::{App, HttpServer, web};
use dotenvy::dotenv;
use log::{error, info};

use app::AppState;
use config::Config;
use store::MemoryStore;

#[actix_web::main]
async fn main() -> io::Result<()> {
    let _ = dotenv();
    env_logger::init();

    let config = Config::from_env().map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let (host, port) = (config.host.clone(), config.port);
    let ws_addr: SocketAddr = format!("{}:{}", config.ws_host, config.ws_port)
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let store = MemoryStore::open(config.store_path.clone())
        .await
        .map_err(io::Error::other)?;
    let state = AppState::build(config, Arc::new(store))
        .await
        .map_err(io::Error::other)?;

    let gateway = state.clone();
    tokio::spawn(async move {
        if let Err(e) = realtime::gateway::serve(gateway, ws_addr).await {
            error!("Realtime gateway stopped: {e}");
        }
    });

    info!("⛓️ Starting miner API at http://{host}:{port}");

    let data = web::Data::new(state);
    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .configure(api::init_routes)
    })
    .bind((host.as_str(), port))?
    .run()
    .await
}
