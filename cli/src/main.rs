use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8080";
const TOKEN_ENV: &str = "SOLOBASE_TOKEN";

#[derive(Parser)]
#[command(name = "solobase-ctl")]
#[command(about = "Solobase CLI - operate a running extension host over its admin HTTP API", long_about = None)]
struct Cli {
    /// Base URL of the Solobase host (e.g. http://localhost:8080)
    #[arg(long, default_value = DEFAULT_API_URL)]
    api_url: String,

    /// Bearer token for an admin-role subject; falls back to SOLOBASE_TOKEN
    #[arg(long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every registered extension and its lifecycle state
    List,
    /// Check one extension's health
    Health {
        /// Extension name
        name: String,
    },
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show an extension's currently applied configuration
    Get {
        /// Extension name
        name: String,
    },
    /// Apply a new configuration, validated against the extension's schema
    Apply {
        /// Extension name
        name: String,
        /// Configuration as an inline JSON object
        #[arg(long, conflicts_with = "file")]
        json: Option<String>,
        /// Path to a file containing the configuration as JSON
        #[arg(long, conflicts_with = "json")]
        file: Option<String>,
    },
}

#[derive(Deserialize, Debug)]
struct ExtensionSummary {
    name: String,
    version: String,
    state: String,
    url_prefix: String,
    table_prefix: String,
}

#[derive(Deserialize, Debug)]
struct HealthStatus {
    status: String,
    message: String,
    #[serde(default)]
    checks: Vec<HealthCheck>,
}

#[derive(Deserialize, Debug)]
struct HealthCheck {
    name: String,
    ok: bool,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    error: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let token = cli.token.clone().or_else(|| std::env::var(TOKEN_ENV).ok());
    let client = reqwest::Client::new();

    match cli.command {
        Commands::List => list_extensions(&client, &cli.api_url, token.as_deref()).await?,
        Commands::Health { name } => health(&client, &cli.api_url, &name).await?,
        Commands::Config(ConfigCommands::Get { name }) => {
            get_config(&client, &cli.api_url, token.as_deref(), &name).await?
        }
        Commands::Config(ConfigCommands::Apply { name, json, file }) => {
            let body = load_config_body(json, file)?;
            apply_config(&client, &cli.api_url, token.as_deref(), &name, body).await?
        }
    }

    Ok(())
}

fn load_config_body(json: Option<String>, file: Option<String>) -> Result<serde_json::Value> {
    let raw = match (json, file) {
        (Some(json), None) => json,
        (None, Some(path)) => {
            std::fs::read_to_string(&path).with_context(|| format!("reading config file `{path}`"))?
        }
        _ => anyhow::bail!("pass exactly one of --json or --file"),
    };
    serde_json::from_str(&raw).context("config is not valid JSON")
}

fn bearer(req: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
    match token {
        Some(token) => req.header("authorization", format!("Bearer {token}")),
        None => req,
    }
}

async fn api_error_for(response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    match response.json::<ApiError>().await {
        Ok(body) => anyhow::anyhow!("{status}: {}", body.error),
        Err(_) => anyhow::anyhow!("request failed with status {status}"),
    }
}

async fn list_extensions(client: &reqwest::Client, api_url: &str, token: Option<&str>) -> Result<()> {
    let req = bearer(client.get(format!("{api_url}/admin/extensions")), token);
    let response = req.send().await.context("failed to reach the host")?;

    if !response.status().is_success() {
        return Err(api_error_for(response).await);
    }

    let extensions: Vec<ExtensionSummary> = response.json().await.context("parsing extension list")?;
    if extensions.is_empty() {
        println!("no extensions registered");
        return Ok(());
    }

    println!("{:<20} {:<10} {:<12} {:<20} {}", "NAME", "VERSION", "STATE", "URL PREFIX", "TABLE PREFIX");
    for ext in extensions {
        println!(
            "{:<20} {:<10} {:<12} {:<20} {}",
            ext.name, ext.version, ext.state, ext.url_prefix, ext.table_prefix
        );
    }
    Ok(())
}

async fn health(client: &reqwest::Client, api_url: &str, name: &str) -> Result<()> {
    let response = client
        .get(format!("{api_url}/ext/{name}/health"))
        .send()
        .await
        .context("failed to reach the host")?;

    let status_code = response.status();
    if status_code == reqwest::StatusCode::NOT_FOUND {
        anyhow::bail!("no such extension `{name}`");
    }

    let health: HealthStatus = response.json().await.context("parsing health status")?;
    println!("{name}: {} ({})", health.status, health.message);
    for check in health.checks {
        let mark = if check.ok { "✓" } else { "✗" };
        match check.message {
            Some(msg) => println!("  {mark} {}: {msg}", check.name),
            None => println!("  {mark} {}", check.name),
        }
    }

    if !status_code.is_success() {
        anyhow::bail!("extension `{name}` is unhealthy");
    }
    Ok(())
}

async fn get_config(client: &reqwest::Client, api_url: &str, token: Option<&str>, name: &str) -> Result<()> {
    let req = bearer(client.get(format!("{api_url}/admin/extensions/{name}/config")), token);
    let response = req.send().await.context("failed to reach the host")?;

    if !response.status().is_success() {
        return Err(api_error_for(response).await);
    }

    let config: serde_json::Value = response.json().await.context("parsing config")?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn apply_config(
    client: &reqwest::Client,
    api_url: &str,
    token: Option<&str>,
    name: &str,
    config: serde_json::Value,
) -> Result<()> {
    let req = bearer(
        client.post(format!("{api_url}/admin/extensions/{name}/config")),
        token,
    );
    let response = req.json(&config).send().await.context("failed to reach the host")?;

    if !response.status().is_success() {
        return Err(api_error_for(response).await);
    }

    println!("✓ configuration applied to `{name}`");
    Ok(())
}
