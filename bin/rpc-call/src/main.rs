use anyhow::{bail, Context, Result};
use clap::Parser;
use rpc_client::{CallOutcome, RpcServiceClient, TcpTransport};
use rpc_core::ServicesConfig;
use serde_json::Value;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Exit status when the remote side answered with an application error
const APPLICATION_ERROR_EXIT: u8 = 2;

/// Call one method of a configured service and print the outcome as JSON
#[derive(Parser, Debug)]
#[command(name = "rpc-call", version, about)]
struct Cli {
    /// Services YAML file listing the consumers
    #[arg(short, long, env = "RPC_SERVICES_CONFIG")]
    config: PathBuf,

    /// Consumer (service) name to call
    #[arg(short, long)]
    service: String,

    /// Method name, joined to the service name by the consumer's path separator
    #[arg(short, long)]
    method: String,

    /// Positional parameters as a JSON array
    #[arg(short, long, default_value = "[]")]
    params: String,

    /// Correlation id to send instead of a generated one
    #[arg(long)]
    id: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn parse_params(raw: &str) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_str(raw).context("--params is not valid JSON")?;
    match value {
        Value::Array(params) => Ok(params),
        other => bail!("--params must be a JSON array, got {}", other),
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let params = parse_params(&cli.params)?;

    let services = ServicesConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    let consumer = services.require_consumer(&cli.service)?;
    let transport = TcpTransport::from_options(&consumer.options);

    let client = RpcServiceClient::builder_for(&services, &cli.service, transport)?
        .build()
        .await
        .with_context(|| format!("Failed to set up client for {}", cli.service))?;

    debug!("Calling {} with {} params", cli.method, params.len());
    let outcome = client.call_with_id(&cli.method, params, cli.id).await?;

    match outcome {
        CallOutcome::Result(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(ExitCode::SUCCESS)
        }
        CallOutcome::Error(error) => {
            info!("{}.{} returned an application error", cli.service, cli.method);
            println!("{}", serde_json::to_string_pretty(&error)?);
            Ok(ExitCode::from(APPLICATION_ERROR_EXIT))
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from([
            "rpc-call",
            "--config",
            "services.yaml",
            "--service",
            "Calc",
            "--method",
            "add",
            "--params",
            "[1, 2]",
            "--id",
            "abc",
        ])
        .unwrap();

        assert_eq!(cli.service, "Calc");
        assert_eq!(cli.method, "add");
        assert_eq!(cli.id.as_deref(), Some("abc"));
        assert!(!cli.json_logs);
    }

    #[test]
    fn test_params_default_to_empty() {
        let cli = Cli::try_parse_from([
            "rpc-call", "-c", "services.yaml", "-s", "Calc", "-m", "ping",
        ])
        .unwrap();
        assert!(parse_params(&cli.params).unwrap().is_empty());
    }

    #[test]
    fn test_parse_params() {
        assert_eq!(parse_params("[1, \"a\"]").unwrap(), vec![json!(1), json!("a")]);
        assert!(parse_params("{\"a\": 1}").is_err());
        assert!(parse_params("[1,").is_err());
    }
}
