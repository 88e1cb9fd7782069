use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::clock::SystemClock;
use turnstile::config::TurnstileConfig;
use turnstile::ratelimit::RateLimiter;

/// Operator tooling for the Turnstile rate limiter.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the effective rule table
    Rules,
    /// Count requests for an identity and print each decision
    Check {
        #[arg(long)]
        identity: String,
        #[arg(long)]
        rule: String,
        /// Number of requests to count
        #[arg(long, default_value_t = 1)]
        hits: u32,
    },
    /// Show the live counter for an identity without counting a request
    Status {
        #[arg(long)]
        identity: String,
        #[arg(long)]
        rule: String,
    },
    /// Clear the counter for an identity so its next request starts a new window
    Reset {
        #[arg(long)]
        identity: String,
        #[arg(long)]
        rule: String,
    },
    /// Show which rule a request path is classified to
    Route {
        #[arg(long)]
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = TurnstileConfig::load(cli.config.as_deref())?;
    info!(backend = ?config.store.backend, "Configuration loaded");

    match cli.command {
        Command::Route { path } => {
            println!("{}", config.classifier().classify(&path));
        }
        Command::Rules => {
            let rules = config.build_rules()?;
            for rule in rules.rules() {
                println!(
                    "{:<24} window={:>6}s max={:>5} skip_successful={} skip_failed={}",
                    rule.name(),
                    rule.window().as_secs(),
                    rule.max_requests(),
                    rule.skips_successful(),
                    rule.skips_failed(),
                );
            }
        }
        Command::Check {
            identity,
            rule,
            hits,
        } => {
            let limiter = build_limiter(&config).await?;
            if !limiter.rules().contains(&rule) {
                anyhow::bail!("unknown rule '{}'", rule);
            }
            for _ in 0..hits {
                let result = limiter.check_limit(&identity, &rule, None).await;
                println!("{}", serde_json::to_string(&result)?);
            }
            println!("{}", serde_json::to_string(&limiter.stats())?);
        }
        Command::Status { identity, rule } => {
            let limiter = build_limiter(&config).await?;
            let record = limiter.status(&identity, &rule).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Reset { identity, rule } => {
            let limiter = build_limiter(&config).await?;
            limiter.reset_limit(&identity, &rule).await?;
            info!(identity = %identity, rule = %rule, "Counter reset");
        }
    }

    Ok(())
}

async fn build_limiter(config: &TurnstileConfig) -> anyhow::Result<RateLimiter> {
    Ok(config.build_limiter(Arc::new(SystemClock)).await?)
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
