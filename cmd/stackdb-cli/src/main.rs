//! Thin CLI front-end over `stackdb` (SPEC_FULL §6), in the style of
//! `cmd/ethrex`'s subcommand layout: one `Command` enum, one `run` per
//! variant, a shared `Options` bag for what every subcommand needs.

mod value_json;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use stackdb::{Database, DatabaseOptions, EngineType, ObjectStoreOptions};
use tracing::info;

pub const VERSION_STRING: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "stackdb", author, version = VERSION_STRING, about = "Inspect and poke at a stackdb database directory")]
struct Cli {
    /// Directory the database's native files live in.
    #[arg(long, default_value = "./stackdb-data")]
    dir: PathBuf,

    /// Schema version to open the database at.
    #[arg(long, default_value_t = 1)]
    version: u32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open (and connect) the database, reporting its persisted version.
    Open,
    /// Write a JSON-encoded value under a key in an object store.
    Put { store: String, key: String, value: String },
    /// Read the value stored under a key.
    Get { store: String, key: String },
    /// List keys in a store, optionally bounded by a limit.
    Scan {
        store: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print a store's key count.
    Stats { store: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let db = Database::open(&cli.dir, cli.version, EngineType::Redb, DatabaseOptions::default())?;
    db.connect().await?;

    match cli.command {
        Command::Open => {
            info!(dir = %cli.dir.display(), version = db.version(), "database opened");
            println!("opened {} at schema version {}", cli.dir.display(), db.version());
        }
        Command::Put { store, key, value } => {
            let store = open_store(&db, &store).await?;
            let parsed: serde_json::Value = serde_json::from_str(&value)?;
            store.put(key.into_bytes().into(), value_json::from_json(parsed)).await?;
            println!("ok");
        }
        Command::Get { store, key } => {
            let store = open_store(&db, &store).await?;
            match store.get(&key.into_bytes().into()).await? {
                Some(v) => println!("{}", value_json::to_json(&v)),
                None => println!("null"),
            }
        }
        Command::Scan { store, limit } => {
            let store = open_store(&db, &store).await?;
            for key in store.primary_keys(limit).await? {
                println!("{}", String::from_utf8_lossy(&key));
            }
        }
        Command::Stats { store } => {
            let store = open_store(&db, &store).await?;
            println!("{} keys, empty={}", store.count().await?, store.is_empty().await?);
        }
    }

    Ok(())
}

async fn open_store(db: &Database, name: &str) -> anyhow::Result<stackdb::ObjectStore> {
    Ok(db
        .create_object_store(name, ObjectStoreOptions { persistent: true, ..Default::default() }, None)
        .await?)
}
