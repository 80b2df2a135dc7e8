#![forbid(unsafe_code)]

mod config;

use std::{convert::Infallible, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use config::Config;
use futures_util::FutureExt;
use graphfed_handler::{
    handler::{self, HandlerConfig},
    Engine,
    HealthCache,
    HttpCaller,
};
use graphfed_planner::{Response, ServerError};
use tokio::signal;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use warp::{
    body::BodyDeserializeError,
    filters::BoxedFilter,
    hyper::StatusCode,
    reject::MethodNotAllowed,
    Filter,
    Rejection,
    Reply,
};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Refresh the health of every service that has health checks enabled.
async fn check_service_health(engine: Arc<Engine>, caller: Arc<HttpCaller>, health: Arc<HealthCache>) {
    loop {
        let config = engine.config();
        let interval = config
            .services
            .iter()
            .filter_map(|service| service.health_check.as_ref())
            .filter(|health_check| health_check.enabled)
            .map(|health_check| health_check.interval)
            .min();
        let Some(interval) = interval else {
            return;
        };

        for service in &config.services {
            if service.health_url().is_some() {
                health.check(caller.as_ref(), service).await;
            }
        }

        tokio::time::sleep(interval).await;
    }
}

fn graphql_path(path: Option<&str>) -> BoxedFilter<()> {
    match path.map(|path| path.trim_matches('/')).filter(|path| !path.is_empty()) {
        Some(path) => warp::path(path.to_string()).and(warp::path::end()).boxed(),
        None => warp::path::end().boxed(),
    }
}

async fn handle_rejection(err: Rejection) -> std::result::Result<impl Reply, Infallible> {
    let (code, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not Found".to_string())
    } else if let Some(e) = err.find::<BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if err.find::<MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed".to_string())
    } else {
        tracing::error!("unhandled error: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
    };

    let res = warp::reply::json(&Response::from_error(ServerError::new(message)));

    Ok(warp::reply::with_status(res, code))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = Config::try_parse()?;

    let federation = config.federation_config()?;
    if federation.services.is_empty() {
        tracing::info!("No services configured.");
        return Ok(());
    }

    let caller = Arc::new(HttpCaller::new());
    let health = Arc::new(HealthCache::default());
    let engine = Engine::new(federation.clone(), caller.clone())
        .context("Invalid federation configuration.")?
        .health_cache(health.clone());
    engine.initialize(federation)?;
    let engine = Arc::new(engine);
    tokio::spawn(check_service_health(engine.clone(), caller, health));

    let handler_config = HandlerConfig {
        engine: engine.clone(),
        forward_headers: Arc::new(config.forward_headers),
    };

    let graphql = graphql_path(config.path.as_deref()).and(handler::graphql_request(handler_config));
    let health = warp::path!("health").and(handler::health(engine.clone()));
    let status = warp::path!("status").and(handler::status(engine.clone()));

    let bind_addr: SocketAddr = config
        .bind
        .parse()
        .context(format!("Failed to parse bind addr '{}'", config.bind))?;
    let routes = graphql.or(health).or(status);
    let (addr, server) = warp::serve(routes.recover(handle_rejection))
        .bind_with_graceful_shutdown(bind_addr, signal::ctrl_c().map(|_| ()));
    tracing::info!(addr = %addr, "Listening");
    server.await;
    engine.shutdown();
    tracing::info!("Server shutdown");

    Ok(())
}
