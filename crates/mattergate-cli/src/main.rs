//! Mattergate CLI: check a Mattermost connection, send messages and tail
//! inbound posts from the terminal.

mod cli;
mod ui;

use crate::cli::{Cli, Commands};
use anyhow::{bail, Context, Result};
use chrono::{Local, TimeZone};
use clap::Parser;
use colored::Colorize;
use mattergate_channels::backend::ChatBackend;
use mattergate_channels::MattermostBackend;
use mattergate_kernel::config::{EnvSettings, FileSettings, LayeredSettings};
use mattergate_kernel::{ConnectionState, DeliveryGateway};
use mattergate_types::config::{is_configured, keys, non_blank, GatewayConfig};
use mattergate_types::error::DeliveryResult;
use mattergate_types::message::{Ack, IdempotencyKey, InboundEvent, InboundPost, OutboundMessage};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio_stream::StreamExt;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    // Working-directory .env; variables already set take priority.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing_stderr();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            ui::error(&format!("Failed to start async runtime: {e}"));
            std::process::exit(1);
        }
    };
    if let Err(err) = runtime.block_on(run(cli)) {
        ui::error(&format!("{err:#}"));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = load_settings(cli.config.as_deref())?;
    match cli.command {
        Commands::Check => cmd_check(&settings).await,
        Commands::Send {
            channel,
            text,
            thread,
            key,
            timeout,
        } => {
            let mut message = OutboundMessage::to_channel(channel, text);
            if let Some(root_id) = thread {
                message = message.in_thread(root_id);
            }
            if let Some(key) = key {
                message = message.with_idempotency_key(IdempotencyKey::new(key));
            }
            cmd_send(&settings, message, timeout).await
        }
        Commands::Dm {
            user,
            text,
            timeout,
        } => cmd_dm(&settings, &user, &text, timeout).await,
        Commands::Listen => cmd_listen(&settings).await,
        Commands::Config => cmd_config(&settings),
    }
}

fn load_settings(path: Option<&Path>) -> Result<LayeredSettings> {
    let settings = LayeredSettings::new().with(EnvSettings);
    Ok(match path {
        Some(path) => settings.with(FileSettings::load(path)?),
        None => settings,
    })
}

fn load_config(settings: &LayeredSettings) -> Result<GatewayConfig> {
    if !is_configured(settings) {
        bail!(
            "{} and {} must be set (environment, .env or --config)",
            keys::URL,
            keys::TOKEN
        );
    }
    Ok(GatewayConfig::from_settings(settings)?)
}

fn build_gateway(settings: &LayeredSettings) -> Result<DeliveryGateway> {
    let config = load_config(settings)?;
    let backend = MattermostBackend::new(&config).context("Failed to build HTTP client")?;
    Ok(DeliveryGateway::new(config, Arc::new(backend)))
}

async fn cmd_check(settings: &LayeredSettings) -> Result<()> {
    let config = load_config(settings)?;
    ui::section("Mattermost connection check");
    ui::kv("Server", config.base_url());

    let backend = MattermostBackend::new(&config).context("Failed to build HTTP client")?;
    let identity = match backend.authenticate().await {
        Ok(identity) => identity,
        Err(e) => {
            ui::check_fail(&format!("Authentication failed: {e}"));
            if e.is_auth_rejection() {
                ui::hint("Check that the bot token is valid and not revoked.");
            }
            bail!("connection check failed");
        }
    };
    ui::check_ok(&format!(
        "Connected as @{} ({})",
        identity.username, identity.user_id
    ));

    match backend.resolve_team(config.team.as_deref()).await {
        Ok(Some(team)) => ui::check_ok(&format!("Team: {} ({})", team.display_name, team.name)),
        Ok(None) => ui::check_warn("Bot is not a member of any team"),
        Err(e) => {
            ui::check_fail(&e.to_string());
            bail!("connection check failed");
        }
    }

    match backend.open_event_stream().await {
        Ok(_) => ui::check_ok("Event stream opened"),
        Err(e) => {
            ui::check_fail(&format!("Event stream failed: {e}"));
            bail!("connection check failed");
        }
    }
    Ok(())
}

async fn cmd_send(settings: &LayeredSettings, message: OutboundMessage, timeout: u64) -> Result<()> {
    let gateway = build_gateway(settings)?;
    gateway.start();
    let ticket = gateway.queue().enqueue(message);
    let result = tokio::time::timeout(Duration::from_secs(timeout), ticket).await;
    gateway.shutdown().await;
    report_delivery(result, timeout)
}

async fn cmd_dm(settings: &LayeredSettings, user: &str, text: &str, timeout: u64) -> Result<()> {
    let gateway = build_gateway(settings)?;
    gateway.start();
    let result = tokio::time::timeout(
        Duration::from_secs(timeout),
        gateway.send_direct(user, text),
    )
    .await;
    gateway.shutdown().await;
    report_delivery(result, timeout)
}

fn report_delivery(result: Result<DeliveryResult<Ack>, Elapsed>, timeout: u64) -> Result<()> {
    match result {
        Ok(Ok(ack)) => {
            ui::success(&format!(
                "Delivered post {} to {} ({} attempt(s))",
                ack.post_id, ack.channel_id, ack.attempts
            ));
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => bail!("not delivered within {timeout}s"),
    }
}

async fn cmd_listen(settings: &LayeredSettings) -> Result<()> {
    let gateway = build_gateway(settings)?;
    let mut events = gateway.events();
    let mut status = gateway.supervisor().subscribe();
    gateway.start();

    ui::section("Listening for posts (Ctrl+C to stop)");
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(InboundEvent::Posted(post)) => print_post(&post),
                None => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                match current.state {
                    ConnectionState::Connected => {
                        let name = current.identity.map(|i| i.username).unwrap_or_default();
                        ui::check_ok(&format!("Connected as @{name}"));
                    }
                    ConnectionState::Backoff => {
                        let reason = current.last_error.unwrap_or_default();
                        ui::check_warn(&format!("Disconnected: {reason}"));
                    }
                    _ => {}
                }
            },
            _ = &mut ctrl_c => break,
        }
    }

    gateway.shutdown().await;
    Ok(())
}

fn print_post(post: &InboundPost) {
    let when = Local
        .timestamp_millis_opt(post.post.create_at)
        .single()
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());
    let marker = if post.is_direct() { "dm" } else { "ch" };
    println!(
        "  {} {} {} {}",
        when.dimmed(),
        format!("[{marker} {}]", post.post.channel_id).cyan(),
        format!("@{}:", post.sender_name).bold(),
        post.post.message
    );
}

fn cmd_config(settings: &LayeredSettings) -> Result<()> {
    ui::section("Resolved settings");
    for key in keys::ALL {
        let value = match non_blank(settings, key) {
            Some(_) if *key == keys::TOKEN => "********".to_string(),
            Some(v) => v,
            None => "(unset)".dimmed().to_string(),
        };
        ui::kv(key, &value);
    }
    println!();

    match GatewayConfig::from_settings(settings) {
        Ok(_) => {
            ui::check_ok("Configuration is valid");
            Ok(())
        }
        Err(e) => {
            for issue in e.issues() {
                ui::check_fail(&issue.to_string());
            }
            bail!("invalid configuration");
        }
    }
}
