// ABOUTME: Command-line entry point for subscription lifecycle operations
// ABOUTME: Parses arguments, loads configuration and dispatches to the library

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pg_subscription_lifecycle::convergence::{self, enabled_flag_is};
use pg_subscription_lifecycle::postgres::redact_url;
use pg_subscription_lifecycle::{
    Config, Gateway, Lsn, OriginReconciler, SubscriptionController, SubscriptionSpec,
};

#[derive(Parser)]
#[command(name = "pgsub")]
#[command(about = "Manage PostgreSQL logical replication subscriptions", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Connection URL; overrides the config file and PGSUB_DATABASE_URL
    #[arg(long, global = true)]
    url: Option<String>,
    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or reconcile a subscription to match a spec file
    Apply {
        #[arg(long)]
        spec: PathBuf,
    },
    /// Create a subscription from a spec file
    Create {
        #[arg(long)]
        spec: PathBuf,
    },
    /// Reconcile publications, connection and slot name with a spec file
    Update {
        #[arg(long)]
        spec: PathBuf,
    },
    /// Enable a subscription, optionally starting replay at an LSN
    Enable {
        #[arg(long)]
        name: String,
        #[arg(long)]
        database: String,
        /// Position such as 0/16B3748; only valid when the subscription is disabled
        #[arg(long)]
        start_lsn: Option<Lsn>,
        /// Block until the catalog reports the subscription enabled
        #[arg(long)]
        wait: bool,
    },
    /// Disable a subscription
    Disable {
        #[arg(long)]
        name: String,
        #[arg(long)]
        database: String,
        #[arg(long)]
        wait: bool,
    },
    /// Drop a subscription and clean up its replication origins
    Drop {
        #[arg(long)]
        name: String,
        #[arg(long)]
        database: String,
        /// Keep the replication slot on the publisher
        #[arg(long)]
        keep_slot: bool,
    },
    /// Print the catalog state of a subscription as JSON
    Show {
        #[arg(long)]
        name: String,
        #[arg(long)]
        database: String,
    },
    /// Check whether a subscription's replication origin exists
    VerifyOrigin {
        #[arg(long)]
        name: String,
        #[arg(long)]
        database: String,
    },
    /// Drop replication origins that no subscription owns
    SweepOrigins {
        /// Database to connect to; defaults to connection.admin_database
        #[arg(long)]
        database: Option<String>,
    },
    /// Wait until a subscription's enabled flag reaches the requested value
    WaitEnabled {
        #[arg(long)]
        name: String,
        #[arg(long)]
        database: String,
        /// Wait for the disabled state instead
        #[arg(long)]
        disabled: bool,
        /// Overrides convergence.timeout_secs
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_spec(path: &Path) -> Result<SubscriptionSpec> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read spec file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Failed to parse spec file {}", path.display()))
}

async fn wait_for_flag(
    gateway: &Gateway,
    config: &Config,
    name: &str,
    database: &str,
    expected: bool,
    timeout_secs: Option<u64>,
) -> Result<()> {
    let mut policy = config.convergence.poll_policy();
    if let Some(secs) = timeout_secs {
        policy.timeout = Duration::from_secs(secs);
    }
    let outcome = convergence::wait_until(&policy, || {
        enabled_flag_is(gateway, database, name, expected)
    })
    .await?;
    tracing::info!(
        subscription = %name,
        enabled = expected,
        attempts = outcome.attempts,
        "Subscription reached requested state in {:?}",
        outcome.elapsed
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(url) = cli.url {
        config.connection.url = url;
    }
    tracing::debug!(url = %redact_url(&config.connection.url), "Configuration loaded");

    let gateway = Gateway::new(&config.connection)?;
    let controller = SubscriptionController::new(gateway.clone());
    let origins = OriginReconciler::new(gateway.clone());

    match cli.command {
        Commands::Apply { spec } => {
            let spec = load_spec(&spec)?;
            controller.apply(&spec).await?;
        }
        Commands::Create { spec } => {
            let spec = load_spec(&spec)?;
            controller.create(&spec).await?;
        }
        Commands::Update { spec } => {
            let spec = load_spec(&spec)?;
            controller.update(&spec).await?;
        }
        Commands::Enable {
            name,
            database,
            start_lsn,
            wait,
        } => {
            controller
                .set_enabled(&name, &database, true, start_lsn)
                .await?;
            if wait {
                wait_for_flag(&gateway, &config, &name, &database, true, None).await?;
            }
        }
        Commands::Disable {
            name,
            database,
            wait,
        } => {
            controller.set_enabled(&name, &database, false, None).await?;
            if wait {
                wait_for_flag(&gateway, &config, &name, &database, false, None).await?;
            }
        }
        Commands::Drop {
            name,
            database,
            keep_slot,
        } => {
            controller
                .drop_subscription(&name, &database, !keep_slot)
                .await?;
        }
        Commands::Show { name, database } => {
            let state = controller.read(&database, &name).await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::VerifyOrigin { name, database } => {
            let exists = origins.verify_origin_exists(&database, &name).await?;
            println!("{}", exists);
        }
        Commands::SweepOrigins { database } => {
            let database = database.unwrap_or_else(|| config.connection.admin_database.clone());
            let report = origins.sweep_orphans(&database).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_clean() {
                anyhow::bail!(
                    "{} replication origin(s) could not be dropped",
                    report.failures.len()
                );
            }
        }
        Commands::WaitEnabled {
            name,
            database,
            disabled,
            timeout_secs,
        } => {
            wait_for_flag(&gateway, &config, &name, &database, !disabled, timeout_secs).await?;
        }
    }

    Ok(())
}
