//! Loyalty Admin CLI: validate a program config before rollout, inspect
//! the tier ladder, quote booking points, and audit exported transaction
//! logs.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use marketplace_core::config::AppConfig;
use marketplace_core::loyalty::Transaction;
use marketplace_loyalty::store::replay;
use marketplace_loyalty::{ActiveConfig, ConfigStore, TierEngine};
use serde::Serialize;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "loyalty-admin")]
#[command(about = "Loyalty ledger administration tool")]
#[command(version)]
struct Cli {
    /// Config file (TOML/JSON/YAML). Environment variables prefixed with
    /// LOYALTY__ override it.
    #[arg(short, long, env = "LOYALTY_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the program config and print the resulting snapshot
    CheckConfig,

    /// Show the tier standing for a lifetime-earned total
    Tier {
        #[arg(long)]
        points: u64,
    },

    /// Points a booking of `amount` should award at `tier`
    Quote {
        #[arg(long)]
        tier: String,

        #[arg(long)]
        amount: f64,
    },

    /// Replay an exported JSON array of one account's transactions and
    /// check every balance snapshot
    VerifyLog {
        #[arg(short, long)]
        file: String,
    },
}

#[derive(Serialize)]
struct ConfigReport<'a> {
    version: u64,
    redemption_rate: f64,
    min_redemption_points: u64,
    vouchers: Vec<DenominationReport>,
    tiers: &'a [marketplace_loyalty::TierLevel],
    voucher_validity_days: u32,
    points_expiry_months: u32,
}

#[derive(Serialize)]
struct DenominationReport {
    face_value: f64,
    points_cost: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loyalty_admin=info,marketplace_loyalty=info".into()),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let app = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let store = ConfigStore::new(app.loyalty.clone()).context("validating loyalty config")?;
    let active = store.active();

    match cli.command {
        Commands::CheckConfig => check_config(&active),
        Commands::Tier { points } => {
            let status = TierEngine::new(&active).evaluate(points);
            print_json(&status)
        }
        Commands::Quote { tier, amount } => {
            let engine = TierEngine::new(&active);
            if engine.multiplier(&tier).is_none() {
                bail!("unknown tier '{tier}'");
            }
            println!("{}", engine.suggested_points(&tier, amount));
            Ok(())
        }
        Commands::VerifyLog { file } => verify_log(&file),
    }
}

fn check_config(active: &ActiveConfig) -> anyhow::Result<()> {
    let vouchers = active
        .denominations()
        .iter()
        .filter_map(|face_value| {
            active.points_cost(*face_value).map(|points_cost| DenominationReport {
                face_value: *face_value,
                points_cost,
            })
        })
        .collect();

    let report = ConfigReport {
        version: active.version,
        redemption_rate: active.program.redemption_rate,
        min_redemption_points: active.program.min_redemption_points,
        vouchers,
        tiers: active.ladder(),
        voucher_validity_days: active.program.voucher_validity_days,
        points_expiry_months: active.program.points_expiry_months,
    };
    info!(tiers = report.tiers.len(), "Loyalty config is valid");
    print_json(&report)
}

fn verify_log(path: &str) -> anyhow::Result<()> {
    let contents = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let transactions: Vec<Transaction> =
        serde_json::from_str(&contents).with_context(|| format!("parsing {path}"))?;

    if let Some(first) = transactions.first() {
        if let Some(other) = transactions.iter().find(|t| t.account_id != first.account_id) {
            bail!(
                "log mixes accounts '{}' and '{}'",
                first.account_id,
                other.account_id
            );
        }
    }

    match replay(&transactions) {
        Ok(balance) => {
            println!(
                "Log is consistent: {} transactions, final balance {balance}",
                transactions.len()
            );
            Ok(())
        }
        Err(detail) => bail!("log is inconsistent: {detail}"),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
