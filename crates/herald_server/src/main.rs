mod routes;
mod state;
mod ws;

use clap::Parser;
use herald_core::config::{load_config, load_config_from_standard_locations};
use herald_core::runtime::HeraldRuntime;
use miette::{IntoDiagnostic, Result, WrapErr};
use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "herald", version, about = "Watch upstream feeds and fan changes out to subscribers")]
struct Cli {
    /// Configuration file (defaults to the standard locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_panic_hook();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path).await?,
        None => load_config_from_standard_locations().await?,
    };
    let _guard = init_tracing(&config.logging.directory, cli.debug || config.logging.debug);

    let runtime = HeraldRuntime::builder().config(config.clone()).build().await?;
    let state = AppState::new(runtime.control().clone());

    let http_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&http_addr)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to bind control API on {}", http_addr))?;
    info!("control API listening on {}", http_addr);
    let app = routes::router(state.clone());
    let http_task = tokio::spawn(async move { axum::serve(listener, app).await });

    let ws_task = if config.websocket.enable {
        let ws_addr = format!("{}:{}", config.websocket.host, config.websocket.port);
        let listener = tokio::net::TcpListener::bind(&ws_addr)
            .await
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to bind websocket endpoint on {}", ws_addr))?;
        info!("websocket endpoint listening on {}", ws_addr);
        let app = ws::router(state);
        Some(tokio::spawn(async move { axum::serve(listener, app).await }))
    } else {
        info!("websocket endpoint disabled");
        None
    };

    let handles = runtime.start();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
        result = http_task => match result {
            Ok(Err(e)) => error!("control API server error: {}", e),
            Err(e) => error!("control API server task failed: {}", e),
            Ok(Ok(())) => info!("control API server exited"),
        },
    }

    handles.abort();
    if let Some(task) = ws_task {
        task.abort();
    }
    Ok(())
}

fn init_tracing(log_dir: &Path, debug: bool) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_appender::rolling;
    use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    std::fs::create_dir_all(log_dir).ok();
    let file_appender = rolling::daily(log_dir, "herald.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug {
            EnvFilter::new("herald_core=debug,herald_server=debug,info")
        } else {
            EnvFilter::new("herald_core=info,herald_server=info,warn")
        }
    });

    let terminal_layer = fmt::layer()
        .with_target(debug)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact();

    let file_layer = fmt::layer()
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(terminal_layer.with_filter(env_filter))
        .with(file_layer.with_filter(EnvFilter::new("herald_core=debug,herald_server=debug,info")))
        .init();

    info!("logging to {:?}", log_dir.join("herald.log"));
    guard
}
