use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::ratelimit::{AdmissionDecision, ApiKeyGrant, Principal, QuotaLimiter, Rejection};
use tollgate::TollgateConfig;

/// Tollgate - inspect and exercise quotas against the configured store
#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// Configuration file; without it, layered config/ files and TOLLGATE__* variables are used
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Count requests for a principal and print the last decision
    Check {
        #[command(flatten)]
        principal: PrincipalArgs,

        /// Number of requests to count
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Take tokens from the upstream buckets
    Upstream {
        /// Tokens one call costs
        #[arg(long, default_value_t = 1.0)]
        cost: f64,
    },
    /// Show a principal's usage without counting a request
    Usage {
        #[command(flatten)]
        principal: PrincipalArgs,
    },
    /// Show the upstream buckets without consuming tokens
    UpstreamUsage,
    /// Delete a principal's window counters
    Reset {
        #[command(flatten)]
        principal: PrincipalArgs,
    },
    /// Refill the upstream buckets
    ResetUpstream,
    /// Print the effective policy table
    Policy,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PrincipalKind {
    Anonymous,
    User,
    ApiKey,
}

#[derive(Args, Debug)]
struct PrincipalArgs {
    /// Principal kind
    #[arg(long, value_enum)]
    kind: PrincipalKind,

    /// Client address, user id or key value
    #[arg(long)]
    id: String,

    /// Per-minute threshold of an API key
    #[arg(long)]
    per_minute: Option<u64>,

    /// Per-hour threshold of an API key
    #[arg(long)]
    per_hour: Option<u64>,

    /// Per-day threshold of an API key
    #[arg(long)]
    per_day: Option<u64>,
}

impl PrincipalArgs {
    fn principal(&self) -> Principal {
        match self.kind {
            PrincipalKind::Anonymous => Principal::Anonymous {
                client_addr: self.id.clone(),
            },
            PrincipalKind::User => Principal::User {
                user_id: self.id.clone(),
            },
            PrincipalKind::ApiKey => {
                let mut grant = ApiKeyGrant::new(self.id.clone());
                grant.per_minute = self.per_minute;
                grant.per_hour = self.per_hour;
                grant.per_day = self.per_day;
                Principal::ApiKey(grant)
            }
        }
    }
}

/// A decision as printed by `check` and `upstream`.
#[derive(Serialize)]
struct DecisionOutput<'a> {
    decision: &'a AdmissionDecision,
    headers: Vec<(String, String)>,
    rejection: Option<Rejection>,
}

impl<'a> DecisionOutput<'a> {
    fn new(decision: &'a AdmissionDecision) -> Self {
        Self {
            decision,
            headers: decision.headers(),
            rejection: decision.rejection(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => TollgateConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => TollgateConfig::load().context("Failed to load configuration")?,
    };
    info!(backend = ?config.store.backend, "Configuration loaded");

    let limiter = QuotaLimiter::connect(&config)
        .await
        .context("Failed to initialize quota limiter")?;

    match cli.command {
        Command::Check { principal, count } => {
            let principal = principal.principal();
            let mut last = None;
            for _ in 0..count.max(1) {
                last = Some(limiter.admit(&principal).await);
            }
            let decision = last.context("No request was counted")?;
            print_json(&DecisionOutput::new(&decision))?;
            return Ok(exit_code(&decision));
        }
        Command::Upstream { cost } => {
            let decision = limiter.admit_upstream(cost).await;
            print_json(&DecisionOutput::new(&decision))?;
            return Ok(exit_code(&decision));
        }
        Command::Usage { principal } => {
            let usage = limiter.get_usage(&principal.principal()).await?;
            print_json(&usage)?;
        }
        Command::UpstreamUsage => {
            let usage = limiter.get_upstream_usage().await?;
            print_json(&usage)?;
        }
        Command::Reset { principal } => {
            let subject = principal.principal().subject()?;
            limiter.reset(&subject).await?;
            println!("Reset {}", subject);
        }
        Command::ResetUpstream => {
            limiter.reset_upstream().await?;
            println!("Reset {}", limiter.upstream_subject());
        }
        Command::Policy => {
            let yaml = serde_yaml::to_string(&limiter.policy_table())?;
            print!("{}", yaml);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Denied requests exit with status 1 so scripts can branch on the verdict.
fn exit_code(decision: &AdmissionDecision) -> ExitCode {
    if decision.allowed {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}
