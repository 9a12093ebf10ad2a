use actix_web::{App, HttpServer};
use color_eyre::eyre::{Report, WrapErr};
use dotenv::dotenv;
use livevote_server::{
    config::Config,
    db::{MemoryStore, PgStore, Store},
    log, server,
    services::Services,
};
use std::sync::Arc;
use tracing::{info, warn};

#[actix_rt::main]
async fn main() -> Result<(), Report> {
    dotenv().ok();
    log::init()?;
    let config = Config::from_env()?;

    let store: Arc<dyn Store> = match &config.database_url {
        Some(database_url) => Arc::new(
            PgStore::connect(database_url)
                .await
                .wrap_err("Failed to connect to database")?,
        ),
        None => {
            warn!("DATABASE_URL not set, polls are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };
    let services = Services::start(store, &config);

    info!("Starting server on {}", config.bind_address);
    let bind_address = config.bind_address.clone();
    HttpServer::new(move || {
        let services = services.clone();
        let config = config.clone();
        App::new().configure(|cfg| server::configure(cfg, services, config))
    })
    .bind(&bind_address)
    .wrap_err_with(|| format!("Failed to bind {}", bind_address))?
    .run()
    .await?;
    Ok(())
}
