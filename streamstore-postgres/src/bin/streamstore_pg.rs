//! `streamstore-pg`: sets up or tears down the Postgres schema this crate's
//! driver expects.

use bb8_postgres::PostgresConnectionManager;
use clap::{Parser, Subcommand};
use envconfig::Envconfig;

use streamstore_postgres::{migrate, Config, PgPool};

#[derive(Parser)]
#[command(name = "streamstore-pg", about = "Bootstrap or tear down the streamstore Postgres schema")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Applies the schema migration. Idempotent: safe to run against an
    /// already-migrated database.
    Setup,
    /// Drops the tables, sequence and trigger this crate owns. Idempotent:
    /// missing objects are not an error.
    Teardown,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init_from_env()?;
    env_logger::builder().filter_level(config.log_level.parse().unwrap_or(log::LevelFilter::Info)).init();

    let cli = Cli::parse();

    let pg_config = config.pg_config()?;
    let manager = PostgresConnectionManager::new(pg_config, tokio_postgres::NoTls);
    let pool: PgPool<tokio_postgres::NoTls> = bb8::Pool::builder().max_size(config.db_pool_max_size).build(manager).await?;

    match cli.command {
        Command::Setup => {
            migrate(&pool).await?;
            println!("schema is up to date");
        },
        Command::Teardown => {
            let conn = pool.get().await?;
            conn.batch_execute(
                "DROP TRIGGER IF EXISTS messages_notify_trigger ON messages;
                 DROP FUNCTION IF EXISTS notify_message_appended();
                 DROP TABLE IF EXISTS messages;
                 DROP TABLE IF EXISTS streams;
                 DROP SEQUENCE IF EXISTS message_position_seq;
                 DROP TABLE IF EXISTS refinery_schema_history;",
            )
            .await?;
            println!("schema dropped");
        },
    }

    Ok(())
}
