mod cli;
mod config;
mod detection;
mod error;
mod gguf;
mod http_client;
mod inspector;
mod installation;
mod logging;
mod registry;
mod supervisor;
mod switcher;

use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use cli::{Cli, Command};
use detection::DetectionEngine;
use inspector::FileGgufReader;
use installation::Installation;
use http_client::ReqwestCompletionsClient;
use registry::SpecRegistry;
use switcher::{ServerSpec, Switcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cli = Cli::parse();

    let install_dir = cli
        .install_dir
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());
    let installation = Arc::new(
        Installation::detect(&install_dir)
            .ok_or_else(|| anyhow::anyhow!("no llama-server/llama-cli found under {}", install_dir.display()))?,
    );

    match cli.cmd {
        Command::Detect { model_path, aliases } => run_detect(installation, &model_path, aliases).await,
        Command::Serve { bind, registry } => run_serve(installation, &bind, &registry).await,
    }
}

async fn run_detect(
    installation: Arc<Installation>,
    model_path: &Path,
    aliases: Vec<String>,
) -> anyhow::Result<()> {
    let engine = DetectionEngine::new(
        Arc::new(FileGgufReader),
        installation,
        Arc::new(ReqwestCompletionsClient::new()),
    );
    info!(model = %model_path.display(), "running capability detection");
    let result = engine.detect(model_path).await?;

    let mut spec_registry = SpecRegistry::new();
    spec_registry.add_detection_result(result, aliases);
    println!("{}", spec_registry.to_json_string()?);
    Ok(())
}

/// Minimal line-oriented front end: each stdin line is a JSON
/// `{"identifier": "...", "context_size": <optional u64>}` request; the
/// switcher resolves it to a running server and the base URL is printed to
/// stdout as `{"base_url": "..."}`. Not a bound HTTP listener — `bind` is
/// carried only for logging, for a caller that fronts this process with
/// its own HTTP server. Proxying the actual completion traffic is left to
/// that caller; this command only owns spec resolution and process
/// lifecycle.
async fn run_serve(installation: Arc<Installation>, bind: &str, registry_path: &Path) -> anyhow::Result<()> {
    let json = std::fs::read_to_string(registry_path)?;
    let spec_registry = SpecRegistry::load_from_str(&json)?;
    let switcher: Switcher<ServerSpec> = Switcher::new();

    info!(%bind, registry = %registry_path.display(), "switchboard ready, reading requests from stdin");

    #[derive(serde::Deserialize)]
    struct Request {
        identifier: String,
        context_size: Option<u64>,
    }
    #[derive(serde::Serialize)]
    struct Response {
        base_url: Option<String>,
        error: Option<String>,
    }

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(req) => match spec_registry.select_spec(&req.identifier, req.context_size) {
                Some(entry) => {
                    let config = entry
                        .result
                        .per_context
                        .iter()
                        .find(|c| req.context_size.map(|cs| c.context_size >= cs).unwrap_or(true))
                        .map(|c| c.config.clone())
                        .unwrap_or_else(|| config::Config::new(entry.result.model_path.clone()));
                    let spec = ServerSpec::new(installation.clone(), config);
                    match switcher
                        .with_context(spec, |ctx| Box::pin(async move { Ok(ctx.base_url()) }))
                        .await
                    {
                        Ok(base_url) => Response { base_url: Some(base_url), error: None },
                        Err(e) => Response { base_url: None, error: Some(e.to_string()) },
                    }
                }
                None => Response {
                    base_url: None,
                    error: Some(format!("no spec satisfies identifier {:?}", req.identifier)),
                },
            },
            Err(e) => {
                error!(error = %e, "malformed request line");
                Response { base_url: None, error: Some(format!("malformed request: {e}")) }
            }
        };
        writeln!(stdout, "{}", serde_json::to_string(&response)?)?;
        stdout.flush()?;
    }

    switcher.stop().await?;
    Ok(())
}
