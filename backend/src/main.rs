use std::env;

use actix_web::{App, HttpServer, middleware, web};
use fruitnet_server::config::ServerConfig;
use fruitnet_server::model::ModelHandle;
use fruitnet_server::routes::{UploadDir, configure_routes};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    } else {
        log::error!("Failed to get the current working directory.");
    }

    let config = ServerConfig::load().map_err(|e| {
        log::error!("Invalid configuration: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
    })?;
    log::info!("Configuration: {:?}", config);

    let model = ModelHandle::from_startup(&config.model_path, config.require_model).map_err(|e| {
        log::error!("Failed to preload model at startup: {}", e);
        std::io::Error::new(std::io::ErrorKind::Other, format!("Model loading failed: {}", e))
    })?;
    if !model.is_loaded() {
        log::warn!("Starting without a model; /predict will fail until restart");
    }

    std::fs::create_dir_all(&config.upload_dir)?;
    let upload_dir = UploadDir(config.upload_dir.clone());

    let bind_address = config.bind_address();

    let mut server = HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .app_data(web::Data::new(model.clone()))
            .app_data(web::Data::new(upload_dir.clone()))
            .configure(configure_routes)
    });
    if let Some(workers) = config.workers {
        server = server.workers(workers);
    }

    let server = server.bind(&bind_address)?;
    log::info!("Servidor corriendo en http://{}", bind_address);
    server.run().await
}
