mod error;

use std::path::{Path, PathBuf};

use audit::{AuditEvent, AuditEventType, SearchCriteria, SearchOptions, SqliteSink};
use authority::Config;
use chrono::{Local, TimeZone, Utc};
use clap::{Parser, Subcommand};
use tokens::KeyManager;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use error::{Error, Result};

const CONFIG_FILE: &str = "keel.toml";

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Administration for the keel capability kernel", long_about = None)]
#[command(version)]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Signing key utilities
    Keys {
        #[command(subcommand)]
        command: KeysCommand,
    },
    /// Token utilities
    Token {
        #[command(subcommand)]
        command: TokenCommand,
    },
    /// Query a SQLite audit log
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Parse and validate a configuration file
    Check {
        #[arg(short, long, default_value = CONFIG_FILE)]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum KeysCommand {
    /// Generate a signing key and print its public JWK set
    Export {
        /// RSA modulus size; defaults to the configured size
        #[arg(long)]
        bits: Option<usize>,
        #[arg(short, long, default_value = CONFIG_FILE)]
        config: PathBuf,
    },
}

#[derive(Subcommand)]
enum TokenCommand {
    /// Print a token's claims without verifying its signature
    Inspect { token: String },
}

#[derive(Subcommand)]
enum AuditCommand {
    /// Verify the checksum chain of the whole log
    Verify {
        #[arg(long)]
        db: PathBuf,
    },
    /// Search audit events
    Search {
        #[arg(long)]
        db: PathBuf,
        /// Event type, e.g. capability_revoked
        #[arg(short = 't', long = "type")]
        event_type: Option<String>,
        #[arg(short, long)]
        principal: Option<String>,
        #[arg(short, long, default_value = "50")]
        limit: usize,
        /// Show the most recent events first
        #[arg(long)]
        newest: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    if let Err(e) = run(cli.command).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Config {
            command: ConfigCommand::Check { config },
        } => cmd_config_check(&config),
        Commands::Keys {
            command: KeysCommand::Export { bits, config },
        } => cmd_keys_export(bits, &config).await,
        Commands::Token {
            command: TokenCommand::Inspect { token },
        } => cmd_token_inspect(&token),
        Commands::Audit {
            command: AuditCommand::Verify { db },
        } => cmd_audit_verify(&db),
        Commands::Audit {
            command:
                AuditCommand::Search {
                    db,
                    event_type,
                    principal,
                    limit,
                    newest,
                },
        } => cmd_audit_search(&db, event_type.as_deref(), principal, limit, newest),
    }
}

fn cmd_config_check(path: &Path) -> Result<()> {
    let config = if path.exists() {
        Config::load(path)?
    } else {
        println!("{} not found, checking built-in defaults", path.display());
        Config::default()
    };

    println!("Issuer: {}", config.issuer);
    println!(
        "Capabilities: lifetime {}s, max delegation depth {}, retention {}s",
        config.default_capability_lifetime_secs,
        config.max_delegation_depth,
        config.capability_retention_secs
    );
    for (resource_type, rule) in &config.policy.rules {
        let paths: Vec<_> = rule.paths.iter().map(|p| p.as_str()).collect();
        let ops: Vec<_> = rule.operations.iter().map(|o| o.as_str()).collect();
        println!(
            "Allow {resource_type}: paths [{}] operations [{}]",
            paths.join(", "),
            ops.join(", ")
        );
    }
    for resource_type in &config.policy.deny.all {
        println!("Deny {resource_type}");
    }
    println!(
        "Keys: RSA-{} rotated every {}s",
        config.keys.rsa_bits, config.keys.rotation_interval_secs
    );
    println!("Audit sinks: {}", serde_json::to_string(&config.audit.sinks)?);
    println!("OK");
    Ok(())
}

async fn cmd_keys_export(bits: Option<usize>, config: &Path) -> Result<()> {
    let bits = match bits {
        Some(bits) => bits,
        None => Config::load_or_default(config)?.keys.rsa_bits,
    };
    debug!(bits, "generating signing key");
    let keys = tokio::task::spawn_blocking(move || KeyManager::new(bits)).await??;
    println!("{}", serde_json::to_string_pretty(&keys.export_key_set())?);
    Ok(())
}

fn cmd_token_inspect(token: &str) -> Result<()> {
    let claims = tokens::peek_claims(token)?;
    println!("{}", serde_json::to_string_pretty(&claims)?);

    match claims.expires_at() {
        Some(at) if claims.is_expired_at(Utc::now()) => println!("Expired at {}", local(at)),
        Some(at) => println!("Expires at {}", local(at)),
        None => println!("Expiry out of range"),
    }
    println!("Signature NOT verified");
    Ok(())
}

fn cmd_audit_verify(db: &Path) -> Result<()> {
    let store = open_store(db)?;
    let count = store.verify()?;
    println!("Chain intact: {count} events");
    Ok(())
}

fn cmd_audit_search(
    db: &Path,
    event_type: Option<&str>,
    principal: Option<String>,
    limit: usize,
    newest: bool,
) -> Result<()> {
    let store = open_store(db)?;

    let mut criteria = SearchCriteria::new();
    if let Some(event_type) = event_type {
        criteria = criteria.event_type(event_type.parse::<AuditEventType>()?);
    }
    if let Some(principal) = principal {
        criteria = criteria.principal(principal);
    }
    let mut options = SearchOptions::limit(limit);
    if newest {
        options = options.newest_first();
    }

    let events = store.load_events(&criteria, &options)?;
    if events.is_empty() {
        println!("No events found.");
        return Ok(());
    }

    println!("{:<8}  {:<19}  {:<24}  {:<16}  DETAILS", "SEQ", "TIME", "TYPE", "PRINCIPAL");
    println!("{}", "-".repeat(100));
    for event in &events {
        print_event(event);
    }
    Ok(())
}

fn print_event(event: &AuditEvent) {
    let details = event.details.to_string();
    // Keep rows on one line.
    let details = if details.len() > 120 {
        let cut = (0..=120).rev().find(|i| details.is_char_boundary(*i)).unwrap_or(0);
        format!("{}...", &details[..cut])
    } else {
        details
    };
    println!(
        "{:<8}  {:<19}  {:<24}  {:<16}  {details}",
        event.sequence,
        local(event.timestamp),
        event.event_type.as_str(),
        event.principal_id.as_deref().unwrap_or("-"),
    );
}

fn local(at: chrono::DateTime<Utc>) -> String {
    Local
        .from_utc_datetime(&at.naive_utc())
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

fn open_store(db: &Path) -> Result<SqliteSink> {
    if !db.exists() {
        return Err(Error::DatabaseNotFound {
            path: db.to_path_buf(),
        });
    }
    Ok(SqliteSink::open(db)?)
}
