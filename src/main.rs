use std::net::SocketAddr;
use std::path::PathBuf;

use atelier_backend_core::api::server::serve;
use atelier_backend_core::db::jobs::JobStore;
use atelier_backend_core::db::resolve_db_config;
use atelier_backend_core::pipeline::service::ServiceConfig;
use serde_json::json;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    if matches!(cli_args.first().map(String::as_str), Some("ledger-status")) {
        run_ledger_status_cli(cli_args.into_iter().skip(1).collect::<Vec<_>>())?;
        return Ok(());
    }
    if matches!(cli_args.first().map(String::as_str), Some("ledger-grant")) {
        run_ledger_grant_cli(cli_args.into_iter().skip(1).collect::<Vec<_>>())?;
        return Ok(());
    }

    let bind =
        std::env::var("ATELIER_BACKEND_BIND").unwrap_or_else(|_| String::from("127.0.0.1:8791"));
    let addr: SocketAddr = bind.parse()?;

    serve(addr).await?;
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LedgerStatusCliArgs {
    owner_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LedgerGrantCliArgs {
    owner_id: String,
    amount: i64,
}

fn parse_ledger_status_cli_args(
    args: &[String],
) -> Result<LedgerStatusCliArgs, Box<dyn std::error::Error>> {
    let mut owner_id = None::<String>;
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> Result<String, Box<dyn std::error::Error>> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };

        match flag {
            "--owner" => {
                owner_id = Some(needs_value(i)?);
                i += 2;
            }
            unknown => {
                return Err(std::io::Error::other(format!(
                    "Unknown argument: {unknown}\n\nUse --help for usage."
                ))
                .into());
            }
        }
    }

    let owner_id = owner_id
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| std::io::Error::other("Missing required --owner"))?;
    Ok(LedgerStatusCliArgs { owner_id })
}

fn parse_ledger_grant_cli_args(
    args: &[String],
) -> Result<LedgerGrantCliArgs, Box<dyn std::error::Error>> {
    let mut owner_id = None::<String>;
    let mut amount = None::<i64>;
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> Result<String, Box<dyn std::error::Error>> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };

        match flag {
            "--owner" => {
                owner_id = Some(needs_value(i)?);
                i += 2;
            }
            "--amount" => {
                let raw = needs_value(i)?;
                let parsed = raw.trim().parse::<i64>().map_err(|_| {
                    std::io::Error::other(format!("Invalid --amount value: {raw}"))
                })?;
                amount = Some(parsed);
                i += 2;
            }
            unknown => {
                return Err(std::io::Error::other(format!(
                    "Unknown argument: {unknown}\n\nUse --help for usage."
                ))
                .into());
            }
        }
    }

    let owner_id = owner_id
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| std::io::Error::other("Missing required --owner"))?;
    let amount = amount.ok_or_else(|| std::io::Error::other("Missing required --amount"))?;
    if amount <= 0 {
        return Err(std::io::Error::other("--amount must be positive").into());
    }
    Ok(LedgerGrantCliArgs { owner_id, amount })
}

fn open_job_store_for_cli() -> Result<JobStore, Box<dyn std::error::Error>> {
    let repo_root = default_repo_root();
    let db_config = resolve_db_config(repo_root.as_path());
    let config = ServiceConfig::from_env();
    let store = JobStore::new(db_config.app_db_path, config.account_defaults());
    store.initialize()?;
    Ok(store)
}

fn default_repo_root() -> PathBuf {
    let fallback = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    fallback.canonicalize().unwrap_or(fallback)
}

fn run_ledger_status_cli(args: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    if args
        .iter()
        .any(|arg| matches!(arg.as_str(), "-h" | "--help"))
    {
        print_ledger_status_usage();
        return Ok(());
    }
    let parsed = parse_ledger_status_cli_args(args.as_slice())?;
    let store = open_job_store_for_cli()?;
    let balance = store.get_balance(parsed.owner_id.as_str())?;
    let active_jobs = store.count_active_jobs(parsed.owner_id.as_str())?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "ok": true,
            "balance": balance,
            "active_jobs": active_jobs
        }))?
    );
    Ok(())
}

fn run_ledger_grant_cli(args: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    if args
        .iter()
        .any(|arg| matches!(arg.as_str(), "-h" | "--help"))
    {
        print_ledger_grant_usage();
        return Ok(());
    }
    let parsed = parse_ledger_grant_cli_args(args.as_slice())?;
    let store = open_job_store_for_cli()?;
    let balance = store.grant_tokens(parsed.owner_id.as_str(), parsed.amount)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "ok": true,
            "granted": parsed.amount,
            "balance": balance
        }))?
    );
    Ok(())
}

fn print_ledger_status_usage() {
    eprintln!(concat!(
        "Usage:\n",
        "  cargo run -- ledger-status --owner <owner-id>\n"
    ));
}

fn print_ledger_grant_usage() {
    eprintln!(concat!(
        "Usage:\n",
        "  cargo run -- ledger-grant --owner <owner-id> --amount <tokens>\n"
    ));
}
