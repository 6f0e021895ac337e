//! mcp-plugin-host: a pluggable MCP server.
//!
//! Loads modules, then serves their tools over stdio or streaming HTTP until
//! the client disconnects or the process is asked to stop.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use mcp_plugin_host::config::{self, Config, LogFormat, TransportKind};
use mcp_plugin_host::mcp::{serve_http, serve_stdio, HttpState, McpServer};
use mcp_plugin_host::modules::{
    builtin, LoaderSettings, ModuleCatalog, ModuleLoader, StaticConfigProvider,
};
use mcp_plugin_host::registry::{BasicSchemaValidator, ToolRegistry};
use mcp_plugin_host::security::{OriginPolicy, RateLimiter};
use mcp_plugin_host::session::SessionManager;
use mcp_plugin_host::telemetry::{Telemetry, TracingTelemetry};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Pluggable MCP server exposing module-provided tools.
#[derive(Parser, Debug)]
#[command(name = "mcp-plugin-host")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(value_name = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Transport to serve (overrides the configuration file)
    #[arg(long, value_enum)]
    transport: Option<TransportKind>,

    /// Address for the HTTP transport (overrides the configuration file)
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors)
    #[arg(short, long)]
    quiet: bool,
}

/// Determines the log level from CLI arguments.
#[allow(clippy::match_same_arms)] // Explicit "warn" arm for clarity
fn get_log_level(verbose: u8, quiet: bool, config_level: &str) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => match config_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the tracing subscriber. Logs go to stderr; stdout belongs to the stdio transport.
fn init_tracing(level: Level, format: LogFormat) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Resolves once SIGINT or SIGTERM (Ctrl+C on Windows) arrives.
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut sigint), Ok(mut sigterm)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) else {
        warn!("Could not install signal handlers");
        return std::future::pending().await;
    };

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, initiating graceful shutdown"),
        _ = sigterm.recv() => info!("Received SIGTERM, initiating graceful shutdown"),
    }
}

/// Resolves once SIGINT or SIGTERM (Ctrl+C on Windows) arrives.
#[cfg(not(unix))]
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl+C, initiating graceful shutdown");
    } else {
        warn!("Could not install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

/// Loads modules and serves the configured transport until shutdown.
async fn run(cfg: Config) -> Result<(), BoxError> {
    let telemetry: Arc<dyn Telemetry> = Arc::new(TracingTelemetry);
    let registry = Arc::new(ToolRegistry::new(
        Arc::new(BasicSchemaValidator),
        Arc::clone(&telemetry),
        cfg.tools.call_timeout(),
    ));
    let loader = Arc::new(ModuleLoader::new(
        ModuleCatalog::with_builtins(),
        Arc::clone(&registry),
        Arc::new(StaticConfigProvider::new(cfg.modules.config.clone())),
        Arc::clone(&telemetry),
        LoaderSettings {
            start_timeout: Duration::from_secs(cfg.modules.start_timeout_secs),
            stop_timeout: Duration::from_secs(cfg.modules.stop_timeout_secs),
        },
    ));

    let summary = match &cfg.modules.directory {
        Some(dir) => loader.load_directory(dir).await,
        None => loader.load_all(builtin::manifests()).await,
    };
    for (name, e) in &summary.failed {
        warn!(module = %name, error = %e, "Module not started");
    }
    info!(
        started = ?summary.succeeded,
        failed = summary.failed.len(),
        tools = registry.len(),
        "Modules loaded"
    );
    if let Err(e) = summary.check_required(&cfg.modules.required) {
        loader.stop_all().await;
        return Err(format!("required module failed: {e}").into());
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let server = Arc::new(McpServer::new(registry));
    let result = match cfg.transport {
        TransportKind::Stdio => {
            info!("MCP server ready on stdio, waiting for client connection...");
            serve_stdio(server, shutdown.clone()).await
        }
        TransportKind::Http => {
            let sessions = Arc::new(SessionManager::new(cfg.session.timeout(), telemetry));
            let mut state = HttpState::new(server, sessions)
                .with_loader(Arc::clone(&loader))
                .with_origins(OriginPolicy::new(cfg.http.allowed_origins.clone()))
                .with_stream_responses(cfg.http.stream_responses);
            if let Some(limit) = &cfg.rate_limit {
                state = state.with_rate_limiter(Arc::new(RateLimiter::new(
                    limit.requests_per_second,
                    limit.burst,
                )));
            }
            serve_http(
                state,
                cfg.http.bind_addr()?,
                &cfg.http.endpoint,
                cfg.session.sweep_interval(),
                shutdown.clone(),
            )
            .await
        }
    };

    shutdown.cancel();
    for e in loader.stop_all().await {
        warn!(error = %e, "Module did not stop cleanly");
    }
    result.map_err(Into::into)
}

/// Entry point for the mcp-plugin-host server.
fn main() -> ExitCode {
    let args = Args::parse();

    let config_path = args.config.as_deref();
    let mut cfg = match config::load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(transport) = args.transport {
        cfg.transport = transport;
    }
    if let Some(bind) = args.bind {
        cfg.http.bind = bind;
        if let Err(e) = cfg.http.bind_addr() {
            eprintln!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    }

    let log_level = get_log_level(args.verbose, args.quiet, &cfg.logging.level);
    init_tracing(log_level, cfg.logging.format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        transport = ?cfg.transport,
        "Starting mcp-plugin-host"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create Tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run(cfg));
    // A blocked stdin read must not hold up exit.
    runtime.shutdown_timeout(Duration::from_secs(1));

    match result {
        Ok(()) => {
            info!("Server shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::FAILURE
        }
    }
}
