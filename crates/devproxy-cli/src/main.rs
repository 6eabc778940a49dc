//! Process entry point: loads configuration, wires the plugin chain the
//! config file names, and runs the proxy until its inactivity watchdog or a
//! Ctrl-C fires. Owns the terminal, too — the interactive recording toggles
//! live here rather than in `devproxy-net`, which never touches stdin.

use std::io::IsTerminal;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use devproxy_config::{Config, LatencyConfig, MockPluginConfig, PluginEntry, RandomErrorConfig, RateLimitConfig, RateLimitTokensConfig};
use devproxy_core::{Dispatcher, Plugin, UrlPattern, WatchSet};
use devproxy_net::{ProxyServer, DEFAULT_DRAIN_GRACE, DEFAULT_IDLE_TIMEOUT};
use devproxy_plugins::{LatencyInjector, MockEngine, RandomErrorEngine, RateLimitCount, RateLimitTokens, RecordingController, RetryAfterEnforcer};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "An intercepting developer proxy for chaos-testing HTTP clients.")]
struct Args {
    /// Path to the JSON config file.
    #[arg(short, long, default_value = "devproxyrc.json")]
    config: PathBuf,

    /// Override the config's `port`.
    #[arg(long)]
    port: Option<u16>,

    /// Override the config's `ipAddress`.
    #[arg(long)]
    ip: Option<String>,

    /// Override the config's `logLevel` (also respects `RUST_LOG`).
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("dev-proxy: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = devproxy_config::load_config(&args.config).await?;

    init_logging(args.log_level.as_deref().or(config.log_level.as_deref()));

    let port = args.port.unwrap_or(config.port);
    let ip: IpAddr = args
        .ip
        .as_deref()
        .unwrap_or(&config.ip_address)
        .parse()
        .with_context(|| format!("invalid IP address `{}`", config.ip_address))?;

    let patterns: Vec<UrlPattern> = config.urls_to_watch.iter().map(|raw| UrlPattern::parse(raw)).collect();
    let watch = WatchSet::compile(&patterns).context("compiling urlsToWatch")?;

    let config_dir = args.config.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    let recording = Arc::new(RecordingController::new("recording", 10_000));
    let plugins = build_plugins(&config, &config_dir, recording.clone()).await?;
    let dispatcher = Dispatcher::new(plugins);

    let server = ProxyServer::bind(ip, port, dispatcher, watch, DEFAULT_IDLE_TIMEOUT, DEFAULT_DRAIN_GRACE).await?;
    let addr = server.local_addr()?;
    tracing::info!(%addr, "dev-proxy listening");

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    if std::io::stdin().is_terminal() {
        spawn_stdin_toggles(recording, addr, cancel.clone());
    }

    server.run(cancel).await;
    Ok(())
}

fn init_logging(level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

/// Builds the plugin chain named by `config.plugins`, in file order — the
/// order `Dispatcher` runs mutators in. The recording controller is always
/// present; its `enabled()` hinges on whether a recording session is active,
/// not on the config file (there's no `"recording"` entry to enable/disable).
async fn build_plugins(config: &Config, config_dir: &Path, recording: Arc<RecordingController>) -> Result<Vec<Arc<dyn Plugin>>> {
    let mut plugins: Vec<Arc<dyn Plugin>> = Vec::with_capacity(config.plugins.len() + 1);

    for entry in &config.plugins {
        if !entry.enabled {
            continue;
        }
        if let Some(plugin) = build_plugin(entry, config_dir).await? {
            plugins.push(plugin);
        }
    }

    plugins.push(recording);
    Ok(plugins)
}

async fn build_plugin(entry: &PluginEntry, config_dir: &Path) -> Result<Option<Arc<dyn Plugin>>> {
    let plugin: Arc<dyn Plugin> = match entry.name.as_str() {
        "rate-limiting" | "request-rate-limiting" => {
            let cfg: RateLimitConfig = serde_json::from_value(entry.config.clone())
                .with_context(|| format!("plugin `{}` config", entry.name))?;
            Arc::new(RateLimitCount::new(entry.name.clone(), cfg))
        }
        "token-rate-limiting" => {
            let cfg: RateLimitTokensConfig = serde_json::from_value(entry.config.clone())
                .with_context(|| format!("plugin `{}` config", entry.name))?;
            Arc::new(RateLimitTokens::new(entry.name.clone(), cfg))
        }
        "random-error" | "generic-random-error" => {
            let cfg: RandomErrorConfig = serde_json::from_value(entry.config.clone())
                .with_context(|| format!("plugin `{}` config", entry.name))?;
            let catalog = match &cfg.errors_file {
                Some(rel) => {
                    let path = config_dir.join(rel);
                    let file = devproxy_config::load_error_catalog_file(&path)
                        .await
                        .with_context(|| format!("loading error catalog for plugin `{}`", entry.name))?;
                    Some(file)
                }
                None => None,
            };
            Arc::new(RandomErrorEngine::new(entry.name.clone(), cfg, catalog))
        }
        "latency" => {
            let cfg: LatencyConfig = serde_json::from_value(entry.config.clone())
                .with_context(|| format!("plugin `{}` config", entry.name))?;
            Arc::new(LatencyInjector::new(entry.name.clone(), cfg))
        }
        "retry-after" => Arc::new(RetryAfterEnforcer::new(entry.name.clone())),
        "mock-response" | "mock-generator" => {
            let cfg: MockPluginConfig = serde_json::from_value(entry.config.clone())
                .with_context(|| format!("plugin `{}` config", entry.name))?;
            let mocks_path = config_dir.join(&cfg.mocks_file);
            let file = devproxy_config::load_mock_file(&mocks_path)
                .await
                .with_context(|| format!("loading mocks for plugin `{}`", entry.name))?;
            let engine = MockEngine::new(entry.name.clone(), &mocks_path, file, cfg.block_unmocked_requests, cfg.batch_endpoint.as_deref())
                .map_err(|e| anyhow::anyhow!(e))?;
            Arc::new(engine)
        }
        other => {
            tracing::warn!(plugin = other, "unrecognized plugin name; skipping");
            return Ok(None);
        }
    };
    Ok(Some(plugin))
}

/// Interactive toggles: `r` starts recording, `s` stops it and prints a
/// summary, `c` clears the screen, `w` probes the proxy's own listener to
/// confirm it's still accepting connections.
fn spawn_stdin_toggles(recording: Arc<RecordingController>, addr: std::net::SocketAddr, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                line = lines.next_line() => {
                    let Ok(Some(line)) = line else { return };
                    match line.trim().chars().next() {
                        Some('r') => recording.start_recording(),
                        Some('s') => {
                            let entries = recording.stop_recording();
                            println!("recorded {} request(s)", entries.len());
                        }
                        Some('c') => print!("\x1b[2J\x1b[H"),
                        Some('w') => probe(addr).await,
                        _ => {}
                    }
                }
            }
        }
    });
}

async fn probe(addr: std::net::SocketAddr) {
    match tokio::net::TcpStream::connect(addr).await {
        Ok(_) => println!("test request: proxy at {addr} is accepting connections"),
        Err(e) => println!("test request: proxy at {addr} is unreachable ({e})"),
    }
}
