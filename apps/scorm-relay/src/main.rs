use anyhow::{bail, Result};
use clap::Parser;
use launch_token::{describe_expiry, format_time_remaining, token_from_url, TokenVerdict};
use metrics::counter;
use scorm_relay::{
    demo::{run_roundtrip, DemoOptions},
    AckOutcome, RelayConfig,
};
use tracing::{info, warn};
use url::Url;

mod cli;
mod telemetry;

use cli::{Cli, Commands, OriginCommands, TokenCommands};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init("info")?;
    let cli = Cli::parse();
    let config = RelayConfig::try_from(&cli.relay)?;
    info!(
        allowed_origins = config.allowed_origins.len(),
        target_origin = %config.target_origin,
        ack_target = %config.ack_target,
        "scorm-relay configured"
    );

    let outcome = match cli.command {
        Commands::Demo {
            host_origin,
            content_origin,
            without_lms,
            completions,
        } => {
            let options = DemoOptions {
                host_origin,
                content_origin,
                with_tracking: !without_lms,
                completions,
            };
            demo(&config, &options).await
        }
        Commands::Token { command } => token(&config, command),
        Commands::Origin {
            command: OriginCommands::Check { origin },
        } => {
            let allowed = config.allowed_origins.is_allowed(origin.trim_end_matches('/'));
            println!("{origin}: {}", if allowed { "allowed" } else { "blocked" });
            Ok(())
        }
    };

    if cli.print_metrics {
        print!("{}", telemetry.render_metrics());
    }
    outcome
}

async fn demo(config: &RelayConfig, options: &DemoOptions) -> Result<()> {
    let report = run_roundtrip(config, options).await?;

    println!("ping: {}", describe_outcome(&report.ping));
    for (index, outcome) in report.completions.iter().enumerate() {
        println!("completion #{}: {}", index + 1, describe_outcome(outcome));
    }
    println!("messages sent: {}, acks received: {}", report.sent, report.acked);
    println!(
        "lesson status: {}",
        report.lesson_status.as_deref().unwrap_or("(not tracked)")
    );
    println!("lms calls: {}", report.lms_calls.len());
    println!("terminate: {:?}", report.terminate);
    Ok(())
}

fn describe_outcome(outcome: &AckOutcome) -> String {
    match outcome {
        AckOutcome::Acknowledged(ack) => {
            let verdict = if ack.success { "ok" } else { "failed" };
            match ack.scorm_available {
                Some(available) => format!("{verdict} ({}, scormAvailable={available})", ack.message),
                None => format!("{verdict} ({})", ack.message),
            }
        }
        AckOutcome::Unacknowledged { id, .. } => format!("no acknowledgment for {id}"),
    }
}

fn token(config: &RelayConfig, command: TokenCommands) -> Result<()> {
    match command {
        TokenCommands::Issue {
            user,
            course,
            launch_url,
        } => {
            let issuer = config.token_issuer();
            let token = issuer.issue(&user, &course)?;
            counter!("scorm_relay_tokens_issued_total", 1);
            match launch_url {
                Some(base) => {
                    let mut url = Url::parse(&base)?;
                    url.query_pairs_mut()
                        .append_pair(launch_token::TOKEN_QUERY_PARAM, &token);
                    println!("{url}");
                }
                None => println!("{token}"),
            }
            info!(
                user = %user,
                course = %course,
                valid_for = %format_time_remaining(issuer.expiration_window()),
                "launch token issued"
            );
            Ok(())
        }
        TokenCommands::Validate { token } => {
            let verdict = config.token_issuer().validate(token.trim());
            match verdict {
                TokenVerdict::Valid {
                    claims,
                    time_remaining,
                } => {
                    counter!("scorm_relay_tokens_validated_total", 1, "result" => "valid");
                    println!("valid");
                    println!("user: {}", claims.user_id);
                    println!("course: {}", claims.course_id);
                    println!("session: {}", claims.session_id);
                    println!("expires: {}", describe_expiry(&claims));
                    println!("remaining: {}", format_time_remaining(time_remaining));
                    Ok(())
                }
                TokenVerdict::Invalid(rejection) => {
                    counter!(
                        "scorm_relay_tokens_validated_total",
                        1,
                        "result" => rejection.reason.metric_label()
                    );
                    if let Some(elapsed) = rejection.elapsed {
                        warn!(elapsed_secs = elapsed.whole_seconds(), "token expired");
                    }
                    bail!("{}: {}", rejection.reason, rejection.details)
                }
            }
        }
        TokenCommands::FromUrl { url } => match token_from_url(&url) {
            Some(token) => {
                println!("{token}");
                Ok(())
            }
            None => bail!("no token parameter in {url}"),
        },
    }
}
