//! Demo binary for variant-router
//!
//! Loads a routing configuration, routes a batch of sample requests through
//! the echo invoker, and prints the resulting status and per-variant metrics.
//!
//! ## Arguments
//!
//! - `--config <path>`: TOML config file; watched for changes while running
//! - `--requests <n>`: number of sample requests (default: 1000)
//! - `--schema`: print the config JSON schema and exit
//! - `--metrics-addr <addr>`: serve `/metrics`, `/status`, `/health` and keep
//!   running until Ctrl-C (requires the `metrics-server` feature)
//!
//! Without `--config`, the `AB_*` environment variables are used, and
//! without those a built-in 90/10 split.
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON output (production)
//! - `RUST_LOG=info`: log level filter (default: info)

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;
use variant_router::config::watcher::ConfigWatcher;
use variant_router::config::{self, loader, RoutingConfig, VariantConfig};
use variant_router::routing::spawn_reload_task;
use variant_router::{
    init_tracing, EchoInvoker, RequestContext, RouterConfig, RouterError, Stage, VariantRouter,
};

/// Value following `flag` in `args`, if any.
fn arg_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

/// Address to serve metrics on, when the flag is given and the server is
/// compiled in.
fn metrics_addr(args: &[String]) -> Option<&str> {
    let addr = arg_value(args, "--metrics-addr")?;
    if cfg!(feature = "metrics-server") {
        Some(addr)
    } else {
        tracing::warn!(addr, "--metrics-addr ignored, built without the metrics-server feature");
        None
    }
}

fn default_config() -> RouterConfig {
    RouterConfig::from_routing(
        RoutingConfig::new("demo", "hash")
            .with_variant(
                VariantConfig::new("production", 90, Stage::Champion).with_model("models:/demo/1"),
            )
            .with_variant(
                VariantConfig::new("staging", 10, Stage::Challenger).with_model("models:/demo/2"),
            ),
    )
}

fn load_config(path: Option<&PathBuf>) -> Result<RouterConfig, RouterError> {
    if let Some(path) = path {
        return Ok(loader::load_from_file(path)?);
    }
    if let Some(config) = loader::load_from_env()? {
        return Ok(config);
    }
    info!("no config file or environment configuration, using built-in demo split");
    Ok(default_config())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = init_tracing();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--schema") {
        println!("{}", config::export_schema()?);
        return Ok(());
    }

    let config_path = arg_value(&args, "--config").map(PathBuf::from);
    let requests: usize = arg_value(&args, "--requests")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000);

    let config = load_config(config_path.as_ref())?;
    let router = VariantRouter::from_config(&config, EchoInvoker::with_delay(1))?;

    let _watcher = match &config_path {
        Some(path) => {
            let (watcher, rx) = ConfigWatcher::new(path.clone())?;
            spawn_reload_task(Arc::clone(router.controller()), rx);
            Some(watcher)
        }
        None => None,
    };

    let serve_addr = metrics_addr(&args);

    #[cfg(feature = "metrics-server")]
    {
        if let Some(addr) = serve_addr {
            let state = variant_router::metrics_server::ServerState {
                controller: Arc::clone(router.controller()),
                metrics: Arc::clone(router.metrics()),
            };
            let addr = addr.to_string();
            tokio::spawn(async move {
                if let Err(e) = variant_router::metrics_server::start_server(&addr, state).await {
                    tracing::error!(error = %e, "metrics server stopped");
                }
            });
        }
    }

    info!(requests, "routing sample traffic");

    let mut tasks = Vec::with_capacity(requests);
    for i in 0..requests {
        let router = router.clone();
        tasks.push(tokio::spawn(async move {
            // Every fifth request carries no identifier to exercise the fallback.
            let context = if i % 5 == 0 {
                RequestContext::anonymous()
            } else {
                RequestContext::for_user(format!("user-{}", i % 200))
                    .with_session(format!("session-{i}"))
            };
            router
                .route_and_invoke(format!("request {i}"), &context)
                .await
                .map(|routed| routed.fallback_used)
        }));
    }

    let mut fallbacks = 0usize;
    let mut failures = 0usize;
    for task in tasks {
        match task.await {
            Ok(Ok(true)) => fallbacks += 1,
            Ok(Ok(false)) => {}
            Ok(Err(e)) => {
                failures += 1;
                tracing::warn!(error = %e, "request failed");
            }
            Err(e) => {
                failures += 1;
                tracing::error!(error = %e, "request task panicked");
            }
        }
    }

    info!(fallbacks, failures, "sample traffic complete");

    println!("{}", serde_json::to_string_pretty(&router.status()?)?);
    println!("{}", serde_json::to_string_pretty(&router.metrics_snapshot())?);

    if let Some(addr) = serve_addr {
        info!(addr, "serving metrics, press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
    }

    Ok(())
}
