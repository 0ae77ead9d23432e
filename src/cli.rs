//! Command-line interface
//!
//! `run` boots the full bot; the remaining commands are thin operator
//! clients against a running bot's admin server.

use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::error::{GambitError, Result};

pub const DEFAULT_ADMIN_URL: &str = "http://127.0.0.1:8080";

#[derive(Parser)]
#[command(name = "gambit", version, about = "Resilient automated trading bot")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the bot: pipeline, health monitor, DLQ scheduler, admin server
    Run {
        /// Configuration file (defaults to config/default.toml layering)
        #[arg(long)]
        config: Option<String>,
        /// Force dry-run mode: simulated brokerage/advisor, in-memory store
        #[arg(long)]
        dry_run: bool,
    },
    /// Bot state and runs per stage
    Status {
        #[arg(long, env = "GAMBIT_ADMIN_URL", default_value = DEFAULT_ADMIN_URL)]
        admin_url: String,
    },
    /// Circuit breaker states and counters
    Breakers {
        #[arg(long, env = "GAMBIT_ADMIN_URL", default_value = DEFAULT_ADMIN_URL)]
        admin_url: String,
        /// Force every breaker closed
        #[arg(long)]
        reset: bool,
    },
    /// Dead-letter queue inspection and replay
    Dlq {
        #[arg(long, env = "GAMBIT_ADMIN_URL", default_value = DEFAULT_ADMIN_URL)]
        admin_url: String,
        #[command(subcommand)]
        action: Option<DlqAction>,
    },
    /// Recent alerts
    Alerts {
        #[arg(long, env = "GAMBIT_ADMIN_URL", default_value = DEFAULT_ADMIN_URL)]
        admin_url: String,
        /// Clear the alert history
        #[arg(long)]
        clear: bool,
    },
}

#[derive(Subcommand)]
pub enum DlqAction {
    /// List every dead-lettered operation (default)
    List,
    /// Queue statistics
    Stats,
    /// Replay one item now, scheduled or not
    Replay { id: Uuid },
    /// Drop everything from the queue
    Clear,
}

async fn request(
    method: reqwest::Method,
    admin_url: &str,
    path: &str,
) -> Result<serde_json::Value> {
    let url = format!("{}{}", admin_url.trim_end_matches('/'), path);
    let response = reqwest::Client::new().request(method, &url).send().await?;
    let status = response.status();
    let body: serde_json::Value = response.json().await?;

    if !status.is_success() {
        let detail = body["error"].as_str().unwrap_or("request failed");
        return Err(GambitError::Internal(format!("{}: {}", status, detail)));
    }
    Ok(body)
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn show_status(admin_url: &str) -> Result<()> {
    let status = request(reqwest::Method::GET, admin_url, "/bot/status").await?;
    let health = request(reqwest::Method::GET, admin_url, "/health").await?;
    print_json(&serde_json::json!({ "bot": status, "health": health }))
}

pub async fn show_breakers(admin_url: &str, reset: bool) -> Result<()> {
    if reset {
        request(reqwest::Method::POST, admin_url, "/breakers/reset").await?;
        println!("all breakers reset");
    }
    print_json(&request(reqwest::Method::GET, admin_url, "/breakers").await?)
}

pub async fn run_dlq_action(admin_url: &str, action: Option<DlqAction>) -> Result<()> {
    match action.unwrap_or(DlqAction::List) {
        DlqAction::List => {
            print_json(&request(reqwest::Method::GET, admin_url, "/dlq").await?)
        }
        DlqAction::Stats => {
            print_json(&request(reqwest::Method::GET, admin_url, "/dlq/stats").await?)
        }
        DlqAction::Replay { id } => {
            request(
                reqwest::Method::POST,
                admin_url,
                &format!("/dlq/{}/replay", id),
            )
            .await?;
            println!("replayed {}", id);
            Ok(())
        }
        DlqAction::Clear => {
            request(reqwest::Method::POST, admin_url, "/dlq/clear").await?;
            println!("dead-letter queue cleared");
            Ok(())
        }
    }
}

pub async fn show_alerts(admin_url: &str, clear: bool) -> Result<()> {
    if clear {
        request(reqwest::Method::POST, admin_url, "/alerts/clear").await?;
        println!("alert history cleared");
        return Ok(());
    }
    print_json(&request(reqwest::Method::GET, admin_url, "/alerts").await?)
}
