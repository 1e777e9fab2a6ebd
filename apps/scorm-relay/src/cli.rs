use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use scorm_relay::{AckTarget, OriginAllowList, RelayConfig, TargetOrigin};

#[derive(Debug, Parser)]
#[command(
    name = "scorm-relay",
    author,
    version,
    about = "Relays completion from cross-origin content to a SCORM runtime"
)]
pub struct Cli {
    #[command(flatten)]
    pub relay: RelayArgs,

    /// Print Prometheus metrics collected during the command.
    #[arg(long, global = true)]
    pub print_metrics: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Args)]
pub struct RelayArgs {
    /// Comma separated origins allowed to send commands to the host.
    #[arg(
        long,
        global = true,
        env = "SCORM_RELAY_ALLOWED_ORIGINS",
        default_value = "http://localhost:5500,http://127.0.0.1:5500"
    )]
    pub allowed_origins: String,

    /// Target origin content posts commands with (`*` for any).
    #[arg(long, global = true, env = "SCORM_RELAY_TARGET_ORIGIN", default_value = "*")]
    pub target_origin: String,

    /// Where acknowledgments go: `any` or `sender`.
    #[arg(long, global = true, env = "SCORM_RELAY_ACK_TARGET", default_value = "any")]
    pub ack_target: String,

    /// How long content waits for an acknowledgment.
    #[arg(long, global = true, env = "SCORM_RELAY_ACK_TIMEOUT_MS", default_value_t = 5_000)]
    pub ack_timeout_ms: u64,

    /// Shared secret for launch tokens. A random one is used when unset.
    #[arg(long, global = true, env = "SCORM_RELAY_TOKEN_SECRET", hide_env_values = true)]
    pub token_secret: Option<String>,

    /// Launch token lifetime.
    #[arg(long, global = true, env = "SCORM_RELAY_TOKEN_TTL_SECS", default_value_t = 300)]
    pub token_ttl_secs: i64,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a host and a content bridge in-process against a recording LMS.
    Demo {
        /// Origin the host page is served from.
        #[arg(long, default_value = "https://lms.example.org")]
        host_origin: String,

        /// Origin the content frame is served from.
        #[arg(long, default_value = "http://localhost:5500")]
        content_origin: String,

        /// Leave the LMS runtime out, as when testing outside an LMS.
        #[arg(long)]
        without_lms: bool,

        /// Number of completion commands to send.
        #[arg(long, default_value_t = 2)]
        completions: usize,
    },

    /// Launch token helpers.
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Origin allow-list helpers.
    Origin {
        #[command(subcommand)]
        command: OriginCommands,
    },
}

#[derive(Debug, Subcommand)]
pub enum TokenCommands {
    /// Issue a token for a learner and course.
    Issue {
        #[arg(long)]
        user: String,
        #[arg(long)]
        course: String,
        /// Print a launch URL with the token appended instead of the bare token.
        #[arg(long)]
        launch_url: Option<String>,
    },

    /// Validate a token.
    Validate { token: String },

    /// Extract the token query parameter from a URL.
    FromUrl { url: String },
}

#[derive(Debug, Subcommand)]
pub enum OriginCommands {
    /// Check an origin against the configured allow-list.
    Check { origin: String },
}

impl TryFrom<&RelayArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: &RelayArgs) -> Result<Self, Self::Error> {
        let ack_target: AckTarget = args
            .ack_target
            .parse()
            .with_context(|| format!("invalid ack target: {}", args.ack_target))?;
        let target_origin = match args.target_origin.parse::<TargetOrigin>() {
            Ok(target) => target,
            Err(never) => match never {},
        };
        let config = RelayConfig {
            allowed_origins: OriginAllowList::parse_list(&args.allowed_origins),
            target_origin,
            ack_target,
            ack_timeout: Duration::from_millis(args.ack_timeout_ms),
            token_secret: args.token_secret.clone(),
            token_ttl: time::Duration::seconds(args.token_ttl_secs),
        };
        config.validate().context("invalid relay configuration")?;
        Ok(config)
    }
}
