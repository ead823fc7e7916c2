use anyhow::Context;
use beanstore::{admin, api, ingest, ingest::LoadSpec, Config, Database};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "beanstore", version, about = "Document collections with scalar and IVF vector indexes")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the HTTP gateway
    Serve {
        /// Address to listen on (overrides BEANSTORE_BIND)
        #[arg(long)]
        bind: Option<String>,
        /// Import documents before serving, as COLLECTION=PATH (.jsonl or .parquet)
        #[arg(long = "load", value_name = "COLLECTION=PATH")]
        load: Vec<LoadSpec>,
    },
    /// Apply a JSON script of administrative commands
    Apply {
        /// File holding one command document or an array of them
        script: PathBuf,
        /// Import documents before running the script, as COLLECTION=PATH
        #[arg(long = "load", value_name = "COLLECTION=PATH")]
        load: Vec<LoadSpec>,
        /// Afterwards write a collection to a file, as COLLECTION=PATH
        #[arg(long = "export", value_name = "COLLECTION=PATH")]
        export: Vec<LoadSpec>,
    },
}

async fn load_all(db: &Database, specs: &[LoadSpec]) -> anyhow::Result<()> {
    for spec in specs {
        ingest::load_file(db, spec).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;
    tracing_subscriber::fmt().with_max_level(config.log_level).init();
    tracing::info!("beanstore {} starting", beanstore::VERSION);

    let catalog = config.open_catalog().await?;
    let db = Arc::new(Database::open(catalog, config.search.clone()).await?);

    match cli.cmd {
        Cmd::Serve { bind, load } => {
            load_all(&db, &load).await?;
            let mut config = config;
            if let Some(bind) = bind {
                config.bind = bind;
            }
            api::run(&config, db).await?;
        }
        Cmd::Apply { script, load, export } => {
            load_all(&db, &load).await?;
            let text = tokio::fs::read_to_string(&script)
                .await
                .with_context(|| format!("Failed to read script {}", script.display()))?;
            let commands: serde_json::Value = serde_json::from_str(&text)
                .with_context(|| format!("Script {} is not valid JSON", script.display()))?;
            let replies = admin::run_script(&db, &commands).await?;
            for reply in &replies {
                println!("{}", serde_json::to_string(reply)?);
            }
            for spec in &export {
                ingest::export_collection(&db, &spec.collection, &spec.path).await?;
            }
        }
    }
    Ok(())
}
