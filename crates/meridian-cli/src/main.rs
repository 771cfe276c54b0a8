//! Meridian CLI — command-line client for the control plane.
//!
//! A standalone HTTP client that talks to `meridian-server` over its REST
//! API. No internal crate dependency — everything is driven through
//! `reqwest` the way a real operator tool would be.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";

/// Meridian — a self-hosted container orchestrator's command-line client.
#[derive(Parser)]
#[command(
    name = "meridian",
    version,
    about = "Meridian CLI — manage applications and inspect the cluster",
    long_about = None,
    after_help = format!(
        "{DIM}Environment variables:{RESET}\n  \
         MERIDIAN_ADDR   Server address (default: http://127.0.0.1:7700)\n\n\
         {DIM}Examples:{RESET}\n  \
         meridian apps ls\n  \
         meridian apps up web\n  \
         meridian apps scale web --replicas 3\n  \
         meridian cluster status"
    )
)]
struct Cli {
    /// Meridian server address.
    #[arg(long, env = "MERIDIAN_ADDR", default_value = "http://127.0.0.1:7700")]
    addr: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Application lifecycle operations.
    Apps {
        #[command(subcommand)]
        action: AppCommands,
    },
    /// Cluster coordination operations.
    Cluster {
        #[command(subcommand)]
        action: ClusterCommands,
    },
    /// This node's health.
    Health,
}

#[derive(Subcommand)]
enum AppCommands {
    /// Register a new application.
    Register {
        name: String,
        /// Container image reference.
        #[arg(long)]
        image: String,
        /// Port the container listens on.
        #[arg(long)]
        port: u16,
        /// Initial replica count.
        #[arg(long)]
        replicas: Option<u32>,
    },
    /// Bring an application up.
    Up {
        name: String,
        #[arg(long)]
        replicas: Option<u32>,
    },
    /// Bring an application down.
    Down {
        name: String,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        timeout: Option<u32>,
    },
    /// Set an application's replica count.
    Scale { name: String, replicas: u32 },
    /// Alias for `scale` — rescale to a new replica count.
    Rescale { name: String, replicas: u32 },
    /// Remove an application and its instances.
    Rm { name: String },
    /// List applications.
    Ls,
    /// Show one application's detail.
    Show { name: String },
    /// Show an application's recent metrics.
    Metrics { name: String },
    /// Show an application's event log.
    Events { name: String },
    /// Show an application's logs (the event log, log view).
    Logs { name: String },
    /// Show an application's instance health.
    Health { name: String },
    /// Trigger an immediate health probe of every running instance.
    Check { name: String },
    /// Update an application's scaling policy.
    Scaling {
        name: String,
        #[arg(long)]
        min_replicas: Option<u32>,
        #[arg(long)]
        max_replicas: Option<u32>,
        #[arg(long)]
        target_rps_per_replica: Option<f64>,
        #[arg(long)]
        cooldown_seconds: Option<u32>,
    },
}

#[derive(Subcommand)]
enum ClusterCommands {
    /// Node and lease snapshot.
    Status,
    /// Current leader, if any.
    Leader,
    /// Cluster-wide health summary.
    Health,
}

struct Client {
    http: reqwest::Client,
    addr: String,
}

impl Client {
    fn new(addr: String) -> Self {
        Self { http: reqwest::Client::new(), addr }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.addr)
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let resp = self.http.get(self.url(path)).send().await.context("request failed")?;
        handle_response(resp).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let resp = self.http.post(self.url(path)).json(body).send().await.context("request failed")?;
        handle_response(resp).await
    }

    async fn put(&self, path: &str, body: &Value) -> Result<Value> {
        let resp = self.http.put(self.url(path)).json(body).send().await.context("request failed")?;
        handle_response(resp).await
    }

    async fn delete(&self, path: &str) -> Result<Value> {
        let resp = self.http.delete(self.url(path)).send().await.context("request failed")?;
        handle_response(resp).await
    }
}

async fn handle_response(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    if status == reqwest::StatusCode::NO_CONTENT {
        return Ok(Value::Null);
    }
    let body = resp.text().await.context("failed to read response body")?;
    if !status.is_success() {
        bail!("server returned {status}: {body}");
    }
    if body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body).context("failed to parse response JSON")
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let client = Client::new(cli.addr);

    match run(&client, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{RED}{BOLD}error:{RESET} {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(client: &Client, cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Apps { action } => run_apps(client, action).await,
        Commands::Cluster { action } => run_cluster(client, action).await,
        Commands::Health => print_json(&client.get("/health").await?),
    }
}

async fn run_apps(client: &Client, action: AppCommands) -> Result<()> {
    match action {
        AppCommands::Register { name, image, port, replicas } => {
            let body = json!({ "name": name, "image": image, "port": port, "replicas": replicas });
            print_json(&client.post("/api/v1/apps/register", &body).await?)
        }
        AppCommands::Up { name, replicas } => {
            let body = json!({ "replicas": replicas });
            print_json(&client.post(&format!("/api/v1/apps/{name}/up"), &body).await?)
        }
        AppCommands::Down { name, force, timeout } => {
            let body = json!({ "force": force, "timeout": timeout });
            print_json(&client.post(&format!("/api/v1/apps/{name}/down"), &body).await?)
        }
        AppCommands::Scale { name, replicas } | AppCommands::Rescale { name, replicas } => {
            let body = json!({ "replicas": replicas });
            print_json(&client.post(&format!("/api/v1/apps/{name}/scale"), &body).await?)
        }
        AppCommands::Rm { name } => {
            client.delete(&format!("/api/v1/apps/{name}")).await?;
            println!("{GREEN}application '{name}' removed{RESET}");
            Ok(())
        }
        AppCommands::Ls => print_json(&client.get("/api/v1/apps").await?),
        AppCommands::Show { name } => print_json(&client.get(&format!("/api/v1/apps/{name}")).await?),
        AppCommands::Metrics { name } => print_json(&client.get(&format!("/api/v1/apps/{name}/metrics")).await?),
        AppCommands::Events { name } => print_json(&client.get(&format!("/api/v1/apps/{name}/events")).await?),
        AppCommands::Logs { name } => print_json(&client.get(&format!("/api/v1/apps/{name}/logs")).await?),
        AppCommands::Health { name } => print_json(&client.get(&format!("/api/v1/apps/{name}/health")).await?),
        AppCommands::Check { name } => {
            client.post(&format!("/api/v1/apps/{name}/health/check"), &json!({})).await?;
            println!("{GREEN}health check triggered for '{name}'{RESET}");
            Ok(())
        }
        AppCommands::Scaling { name, min_replicas, max_replicas, target_rps_per_replica, cooldown_seconds } => {
            let body = json!({
                "min_replicas": min_replicas,
                "max_replicas": max_replicas,
                "target_rps_per_replica": target_rps_per_replica,
                "cooldown_seconds": cooldown_seconds,
            });
            print_json(&client.put(&format!("/api/v1/apps/{name}/scaling"), &body).await?)
        }
    }
}

async fn run_cluster(client: &Client, action: ClusterCommands) -> Result<()> {
    match action {
        ClusterCommands::Status => print_json(&client.get("/cluster/status").await?),
        ClusterCommands::Leader => print_json(&client.get("/cluster/leader").await?),
        ClusterCommands::Health => print_json(&client.get("/cluster/health").await?),
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
