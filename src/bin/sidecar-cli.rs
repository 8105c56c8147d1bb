use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

use sidecar_proxy::config::{load_config, parse_config};
use sidecar_proxy::keepalive::{KeepAlive, KeepAliveConfig, KeepaliveStatus, PolicyStore};
use sidecar_proxy::net::heartbeat::TcpHeartbeatTransport;

#[derive(Parser)]
#[command(name = "sidecar-cli")]
#[command(about = "Management CLI for the sidecar proxy", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a config file and print the effective keepalive policy
    Check { file: PathBuf },
    /// Run keepalive probes against an upstream
    Probe {
        addr: String,
        #[arg(long, default_value_t = 5)]
        count: u32,
        #[arg(long, default_value_t = 3000)]
        timeout_ms: u64,
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// Check proxy system status
    Status,
    /// List pooled connections and their keepalive state
    Connections,
    /// Show the running keepalive policy
    Policy,
    /// Replace the running keepalive policy with the [keepalive] section of a file
    SetPolicy { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check { file } => check(&file),
        Commands::Probe {
            addr,
            count,
            timeout_ms,
            interval_ms,
        } => probe(&addr, count, Duration::from_millis(timeout_ms), Duration::from_millis(interval_ms)).await,
        command => admin(&cli.url, &cli.key, command).await,
    }
}

fn check(file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    match load_config(file) {
        Ok(config) => {
            println!("{}: ok ({} upstreams)", file.display(), config.upstreams.len());
            println!("{}", serde_json::to_string_pretty(&config.keepalive.policy())?);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}: {}", file.display(), e);
            std::process::exit(1);
        }
    }
}

async fn probe(
    addr: &str,
    count: u32,
    timeout: Duration,
    interval: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let transport = TcpHeartbeatTransport::connect(addr, timeout).await?;
    println!("connected to {} ({})", transport.peer_addr(), transport.id());

    let keepalive = KeepAlive::builder(transport)
        .config(KeepAliveConfig { timeout, interval })
        .policy_store(Arc::new(PolicyStore::default()))
        .build();
    keepalive.add_callback(|status: KeepaliveStatus| println!("probe: {}", status));

    for n in 0..count {
        if n > 0 {
            tokio::time::sleep(interval).await;
        }
        keepalive.send_keep_alive().await;
        if let Some(reason) = keepalive.close_reason() {
            println!("connection closed: {}", reason);
            return Ok(());
        }
    }
    keepalive.stop();
    Ok(())
}

async fn admin(url: &str, key: &str, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    let client = reqwest::Client::new();
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", key))?);

    let request = match command {
        Commands::Status => client.get(format!("{}/admin/status", url)),
        Commands::Connections => client.get(format!("{}/admin/connections", url)),
        Commands::Policy => client.get(format!("{}/admin/policy", url)),
        Commands::SetPolicy { file } => {
            let config = parse_config(&std::fs::read_to_string(&file)?)?;
            client
                .put(format!("{}/admin/policy", url))
                .json(&config.keepalive.policy())
        }
        Commands::Check { .. } | Commands::Probe { .. } => return Ok(()),
    };

    let res = request.headers(headers).send().await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
