use std::env;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use inference_router::config::Config;
use inference_router::metrics;
use inference_router::router::Router;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match env::var("LOG_FORMAT").as_deref() {
        Ok("json") => subscriber.json().init(),
        _ => subscriber.init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    let metrics_port = config.metrics_port;

    if let Err(e) = metrics::register_metrics() {
        error!(error = %e, "failed to register metrics");
        return ExitCode::FAILURE;
    }
    let prom_registry = Arc::new(Mutex::new(prometheus::default_registry().clone()));
    tokio::spawn(metrics::start_metrics_server(metrics_port, prom_registry));

    let router = match Router::bootstrap(config).await {
        Ok(router) => router,
        Err(e) => {
            error!(error = %e, "router failed to start");
            return ExitCode::FAILURE;
        }
    };

    info!(
        strategy = router.strategy_name(),
        models = ?router.available_models(),
        "router ready"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }

    info!("shutting down");
    router.shutdown();
    ExitCode::SUCCESS
}
