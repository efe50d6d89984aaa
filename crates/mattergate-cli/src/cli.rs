//! Clap CLI definitions for Mattergate.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  mattergate check                      Verify URL, token and team
  mattergate send town-square-id \"hi\"   Post to a channel
  mattergate dm user-id \"hello\"         Send a direct message
  mattergate listen                     Print inbound posts until Ctrl+C

\x1b[1;36mSettings:\x1b[0m
  MATTERMOST_URL, MATTERMOST_TOKEN and MATTERMOST_TEAM are read from the
  environment, a .env file in the working directory, or --config <file>.";

/// Mattergate: reliable message delivery to Mattermost.
#[derive(Parser)]
#[command(name = "mattergate", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// TOML settings file with a [mattermost] table. Environment wins.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check that the server is reachable and the token is accepted.
    Check,
    /// Post a message to a channel.
    Send {
        /// Channel ID.
        channel: String,
        /// Message text.
        text: String,
        /// Reply in the thread rooted at this post ID.
        #[arg(long)]
        thread: Option<String>,
        /// Idempotency key; repeating a send with the same key posts once.
        #[arg(long)]
        key: Option<String>,
        /// Give up after this many seconds.
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
    /// Send a direct message to a user.
    Dm {
        /// User ID.
        user: String,
        /// Message text.
        text: String,
        /// Give up after this many seconds.
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
    /// Print inbound posts until interrupted.
    Listen,
    /// Show resolved settings and validation problems.
    Config,
}
