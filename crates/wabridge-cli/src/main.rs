use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use wabridge_config::DatabaseConfig;
use wabridge_db::{Database, Migrator, Registry};

/// wabridge - database bootstrap and schema migrations.
#[derive(Parser, Debug)]
#[command(name = "wabridge", version, about, long_about = None)]
struct Cli {
    /// Directory holding `dbdata/users.db` when no PostgreSQL credentials are
    /// set. Defaults to the directory of this executable.
    #[arg(long, global = true, env = "WABRIDGE_DATADIR")]
    datadir: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply all pending migrations (the default).
    Migrate,
    /// List every known migration and whether it has been applied.
    Status,
    /// Keep only the newest messages of one chat.
    Trim {
        #[arg(long)]
        user: String,
        #[arg(long)]
        chat: String,
        #[arg(long, default_value_t = 500)]
        limit: usize,
    },
    /// Print the newest messages of one chat as JSON lines.
    Recent {
        #[arg(long)]
        user: String,
        #[arg(long)]
        chat: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = DatabaseConfig::from_env(cli.datadir.as_deref())
        .context("failed to resolve database configuration")?;

    match cli.command.unwrap_or(Command::Migrate) {
        Command::Migrate => {
            let mut db = Database::open(&config).context("failed to open database")?;
            let report = Migrator::new(Registry::builtin())
                .apply_all(&mut db)
                .context("migration failed")?;
            if report.is_noop() {
                println!("{} schema is up to date", db.dialect());
            } else {
                println!(
                    "{} schema migrated: applied {:?}, already present {:?}",
                    db.dialect(),
                    report.applied,
                    report.skipped
                );
            }
        }
        Command::Status => {
            let mut db = Database::open(&config).context("failed to open database")?;
            let status = Migrator::new(Registry::builtin())
                .status(&mut db)
                .context("failed to read migration status")?;
            for entry in status {
                let state = match (entry.applied, entry.applied_at) {
                    (true, Some(at)) => format!("applied {at}"),
                    (true, None) => "applied".to_string(),
                    (false, _) => "pending".to_string(),
                };
                println!("{:>4}  {:<28} {state}", entry.id, entry.name);
            }
        }
        Command::Trim { user, chat, limit } => {
            let mut db = wabridge_db::initialize(&config).context("database startup failed")?;
            let outcome = db
                .history()
                .trim(&user, &chat, limit)
                .context("failed to trim message history")?;
            info!(
                "trimmed {} messages and {} secrets",
                outcome.messages, outcome.secrets
            );
            println!(
                "removed {} messages and {} message secrets",
                outcome.messages, outcome.secrets
            );
        }
        Command::Recent { user, chat, limit } => {
            let mut db = wabridge_db::initialize(&config).context("database startup failed")?;
            let messages = db
                .history()
                .recent(&user, &chat, limit)
                .context("failed to read message history")?;
            for message in messages {
                println!("{}", serde_json::to_string(&message)?);
            }
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}
