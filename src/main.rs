//! shelly-rpc - issue one RPC call against a Shelly Gen2 device

use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shelly_rpc::{Client, ClientConfig, Request};

/// Call one method on a Shelly Gen2 device and print the response
#[derive(Parser, Debug, Clone)]
#[command(name = "shelly-rpc")]
#[command(about = "JSON-RPC over WebSocket client for Shelly Gen2 devices")]
struct Args {
    /// TOML config file; command line values override it
    #[arg(long, env = "SHELLY_CONFIG")]
    config: Option<PathBuf>,

    /// Device hostname or IP, optionally with port
    #[arg(long, env = "SHELLY_HOST")]
    hostname: Option<String>,

    /// Digest auth user
    #[arg(long, env = "SHELLY_USER")]
    username: Option<String>,

    /// Digest auth password
    #[arg(long, env = "SHELLY_PASS", hide_env_values = true)]
    password: Option<String>,

    /// Per-attempt response timeout in milliseconds
    #[arg(long)]
    send_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// RPC method, e.g. Shelly.GetDeviceInfo
    method: String,

    /// Params as a JSON object
    #[arg(long)]
    params: Option<String>,
}

impl Args {
    fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::load(path)?,
            None => ClientConfig::default(),
        };

        if let Some(hostname) = &self.hostname {
            config.hostname = hostname.clone();
        }
        if let Some(username) = &self.username {
            config.username = username.clone();
        }
        if let Some(password) = &self.password {
            config.password = Some(password.clone());
        }
        if let Some(ms) = self.send_timeout_ms {
            config.send_timeout_ms = ms;
        }

        Ok(config)
    }

    fn request(&self) -> anyhow::Result<Request> {
        let request = Request::new(self.method.as_str());
        Ok(match &self.params {
            Some(params) => {
                let params: serde_json::Value = serde_json::from_str(params)?;
                request.with_params(params)?
            }
            None => request,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("shelly_rpc={}", args.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = args.client_config()?;
    let request = args.request()?;

    let component = request
        .method
        .split_once('.')
        .map(|(component, _)| component)
        .unwrap_or(request.method.as_str())
        .to_string();

    let client = Client::connect(&config)?;
    let handle = client.new_handle(&component).await;
    debug!(handle = %component, method = %request.method, "Issuing call");

    let ctx = CancellationToken::new();
    let result = tokio::select! {
        result = handle.send(&ctx, &request) => result,
        _ = tokio::signal::ctrl_c() => {
            ctx.cancel();
            Err(shelly_rpc::RpcError::Cancelled)
        }
    };

    client.close().await;

    match result {
        Ok(raw) => {
            let value: serde_json::Value = serde_json::from_slice(&raw)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(e) => {
            error!("{} failed: {}", request.method, e);
            Err(e.into())
        }
    }
}
