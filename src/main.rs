mod auth;
mod config;
mod gmail;
mod labeler;
mod models;
mod retry;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use google_gmail1::Gmail;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::gmail::GmailClient;
use crate::labeler::LabelApplier;
use crate::models::LabelAssignment;

const USAGE: &str = "usage: glabel <command> [args]

commands:
  recent [n]               list the n most recent matching messages
  count                    total messages in the account
  labels                   list all labels (name -> id)
  apply <message-id> <label>   apply one label, creating it if needed
  batch <file.json>        apply classifier output: [{\"id\", \"label\", \"confidence\", ...}]

flags:
  --reset-token            forget the stored OAuth token and exit";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("glabel=info")),
        )
        .init();

    if std::env::args().any(|arg| arg == "--reset-token") {
        auth::RingStorage.clear_token().await?;
        println!("Token cleared. Re-run to authenticate again.");
        return Ok(());
    }

    let args: Vec<String> = std::env::args()
        .skip(1)
        .filter(|a| !a.starts_with("--"))
        .collect();
    let Some(command) = args.first() else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let config = Config::load();

    let secret = auth::Authenticator::load_secret(&config.credentials_path).await?;
    let authenticator = auth::Authenticator::authenticate(secret).await?;
    // Run the interactive consent flow up front rather than on first API call.
    authenticator
        .token(auth::SCOPES)
        .await
        .context("Failed to obtain OAuth token")?;

    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .context("Failed to load native TLS roots")?
        .https_only()
        .enable_http1()
        .build();
    let hub = Gmail::new(hyper::Client::builder().build(connector), authenticator);
    let client = GmailClient::new(hub);
    let applier = LabelApplier::new(client.clone(), config.retry.clone());

    match command.as_str() {
        "recent" => {
            let n = args
                .get(1)
                .and_then(|s| s.parse().ok())
                .unwrap_or(config.max_results);
            let emails = client.list_recent(&config.query, n).await?;
            info!(count = emails.len(), "fetched recent messages");
            for email in &emails {
                let when = DateTime::from_timestamp_millis(email.timestamp)
                    .map(|d| d.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!("{}  {}  {}  {}", email.id, when, email.sender, email.subject);
            }
        }
        "count" => {
            println!("{}", client.message_count().await?);
        }
        "labels" => {
            let labels = applier.list_all_labels().await?;
            let mut rows: Vec<_> = labels.into_iter().collect();
            rows.sort();
            for (name, id) in rows {
                println!("{name}  {id}");
            }
        }
        "apply" => {
            let (Some(message_id), Some(label)) = (args.get(1), args.get(2)) else {
                eprintln!("{USAGE}");
                std::process::exit(2);
            };
            let ok = applier.apply_label(message_id, label).await;
            println!("{message_id}: {}", if ok { "ok" } else { "failed" });
            if !ok {
                std::process::exit(1);
            }
        }
        "batch" => {
            let Some(path) = args.get(1) else {
                eprintln!("{USAGE}");
                std::process::exit(2);
            };
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {path}"))?;
            let assignments: Vec<LabelAssignment> =
                serde_json::from_str(&content).context("Failed to parse batch file")?;

            let results = applier.apply_batch(&assignments).await;
            let mut failed = false;
            for assignment in &assignments {
                let ok = results.get(&assignment.id).copied().unwrap_or(false);
                println!(
                    "{}: {} ({})",
                    assignment.id,
                    if ok { "ok" } else { "failed" },
                    assignment.classification.label
                );
                failed |= !ok;
            }
            if failed {
                std::process::exit(1);
            }
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}
