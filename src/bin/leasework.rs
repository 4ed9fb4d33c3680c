//! Command-line administration for a PostgreSQL-backed leasework queue.
//!
//! Usage:
//!   leasework --database-url postgresql://localhost/leasework migrate
//!   leasework --database-url postgresql://localhost/leasework status
//!   leasework enqueue --queue-type export shard-1 shard-2
//!   leasework jobs --queue-type export --group-id 7 --json
//!   leasework cancel --queue-type export --group-id 7

use clap::{Args, Parser, Subcommand};
use leasework::{
    JobInfo, LeaseworkConfig, LeaseworkError, PostgresStore, QueueClient, QueueType,
    logging::init_logging,
    migrations::{MigrationManager, ensure_schema_current, postgres::PostgresMigrationRunner},
};
use std::{path::PathBuf, process};
use tracing::debug;

#[derive(Parser)]
#[command(name = "leasework", version, about = "Leasework job queue management tool")]
struct Cli {
    /// Database connection URL (overrides the config file and LEASEWORK_DATABASE_URL)
    #[arg(long = "database-url", value_name = "URL", global = true)]
    database_url: Option<String>,

    /// TOML configuration file
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run pending database migrations
    Migrate,

    /// Show migration status
    Status,

    /// Enqueue one job per definition
    Enqueue {
        #[arg(long = "queue-type")]
        queue_type: QueueType,

        /// Group to add the jobs to; a new group is minted when omitted
        #[arg(long = "group-id")]
        group_id: Option<i64>,

        /// Fail if the queue type already has pending or running jobs
        #[arg(long = "force-one-active")]
        force_one_active: bool,

        /// Print the resulting jobs as JSON
        #[arg(long)]
        json: bool,

        #[arg(required = true)]
        definitions: Vec<String>,
    },

    /// List jobs of a queue type
    Jobs {
        #[arg(long = "queue-type")]
        queue_type: QueueType,

        #[command(flatten)]
        target: JobsTarget,

        /// Print job definitions
        #[arg(long = "definitions")]
        definitions: bool,

        /// Print jobs as JSON
        #[arg(long)]
        json: bool,
    },

    /// Cancel a job or a whole group
    Cancel {
        #[arg(long = "queue-type")]
        queue_type: QueueType,

        #[command(flatten)]
        target: CancelTarget,
    },
}

#[derive(Args)]
#[group(multiple = false)]
struct JobsTarget {
    #[arg(long = "id")]
    ids: Vec<i64>,

    #[arg(long = "group-id")]
    group_id: Option<i64>,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct CancelTarget {
    #[arg(long = "id")]
    id: Option<i64>,

    #[arg(long = "group-id")]
    group_id: Option<i64>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(2);
        }
    };

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("Error: {}", e);
        process::exit(2);
    }

    if let Err(e) = run(cli.command, &config).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn load_config(cli: &Cli) -> leasework::Result<LeaseworkConfig> {
    let mut config = match &cli.config {
        Some(path) => LeaseworkConfig::from_file(path)?,
        None => LeaseworkConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok())?;
    if let Some(url) = &cli.database_url {
        config.database.url = url.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn run(command: Command, config: &LeaseworkConfig) -> leasework::Result<()> {
    debug!(
        pool_size = config.database.pool_size,
        connection_timeout_secs = config.database.connection_timeout_secs,
        "Connecting to database"
    );
    let store = PostgresStore::from_config(&config.database).await?;
    let manager = MigrationManager::new(Box::new(PostgresMigrationRunner::new(store.pool().clone())));

    match command {
        Command::Migrate => {
            let applied = manager.run_migrations().await?;
            if applied.is_empty() {
                println!("Database is up to date");
            } else {
                for id in applied {
                    println!("Applied {}", id);
                }
            }
            return Ok(());
        }
        Command::Status => {
            for (migration, applied) in manager.get_migration_status().await? {
                let marker = if applied { "applied" } else { "pending" };
                println!("{:<8} {} - {}", marker, migration.id, migration.description);
            }
            return Ok(());
        }
        _ => {}
    }

    if config.database.auto_migrate {
        manager.run_migrations().await?;
    } else {
        ensure_schema_current(&manager).await?;
    }

    let client = QueueClient::new(store);

    match command {
        Command::Enqueue {
            queue_type,
            group_id,
            force_one_active,
            json,
            definitions,
        } => {
            let jobs = client
                .enqueue(queue_type, &definitions, group_id, force_one_active)
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                print_jobs(&jobs, false);
            }
        }
        Command::Jobs {
            queue_type,
            target,
            definitions,
            json,
        } => {
            let jobs = if let Some(group_id) = target.group_id {
                client.get_by_group_id(queue_type, group_id, definitions).await?
            } else if !target.ids.is_empty() {
                client.get_by_ids(queue_type, &target.ids, definitions).await?
            } else {
                client.get_by_queue_type(queue_type, definitions).await?
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                print_jobs(&jobs, definitions);
            }
        }
        Command::Cancel { queue_type, target } => {
            let summary = match (target.id, target.group_id) {
                (Some(id), _) => client.cancel_by_id(queue_type, id).await?,
                (None, Some(group_id)) => client.cancel_by_group_id(queue_type, group_id).await?,
                (None, None) => {
                    return Err(LeaseworkError::InvalidArgument {
                        message: "either --id or --group-id is required".to_string(),
                    });
                }
            };
            println!(
                "Cancelled {} pending job(s), requested cancellation of {} running job(s)",
                summary.cancelled, summary.cancel_requested
            );
        }
        Command::Migrate | Command::Status => {}
    }

    Ok(())
}

fn print_jobs(jobs: &[JobInfo], with_definitions: bool) {
    if jobs.is_empty() {
        println!("No jobs");
        return;
    }

    println!(
        "{:>8} {:>8} {:<10} {:<7} {:>7} {:<16} {:<25} {}",
        "ID", "GROUP", "STATUS", "CANCEL", "VERSION", "WORKER", "HEARTBEAT", "RESULT"
    );
    for job in jobs {
        println!(
            "{:>8} {:>8} {:<10} {:<7} {:>7} {:<16} {:<25} {}",
            job.id,
            job.group_id,
            job.status,
            if job.cancel_requested { "yes" } else { "no" },
            job.version,
            job.worker.as_deref().unwrap_or("-"),
            job.heartbeat_date_time.format("%Y-%m-%d %H:%M:%S UTC"),
            job.result.as_deref().unwrap_or("")
        );
        if with_definitions {
            if let Some(definition) = &job.definition {
                println!("         definition: {}", definition);
            }
        }
    }
}
