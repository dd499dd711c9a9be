use anyhow::Context;
use clap::{Parser, Subcommand};
use esis_core::{index_directory, DirectoryScanner, ElasticsearchStore};
use std::fs;
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "esis", version, about = "Elasticsearch Index & Search")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Elasticsearch base URL
    #[arg(long, global = true, env = "ESIS_HOST", default_value = "http://localhost:9200")]
    host: String,

    /// Elasticsearch index name
    #[arg(long, global = true, default_value = "esis")]
    index: String,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Index SQLite database rows found under a directory
    Index {
        /// Base directory to scan recursively
        directory: PathBuf,

        /// Directory (relative to the base) to skip; may be repeated
        #[arg(long = "skip")]
        skip: Vec<PathBuf>,
    },
    /// Search indexed data
    Search {
        /// Search query
        query: String,
    },
    /// Show how many documents are indexed
    Count,
    /// Delete all indexed documents
    Clean,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(fmt::layer())
        .init();

    let store = ElasticsearchStore::new(&cli.host, &cli.index);

    match cli.command {
        Command::Index { directory, skip } => {
            anyhow::ensure!(
                directory.is_dir(),
                "{} is not a directory",
                directory.display()
            );
            fs::read_dir(&directory)
                .with_context(|| format!("{} is not readable", directory.display()))?;

            let scanner = DirectoryScanner::with_blacklist(&directory, skip);
            let report = index_directory(&scanner, &store)
                .await
                .with_context(|| format!("cannot index into elasticsearch at {}", cli.host))?;

            for skipped in &report.skipped {
                warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped database");
            }
            println!(
                "{} documents indexed from {} database(s)",
                report.documents_indexed, report.databases_indexed
            );
        }
        Command::Search { query } => {
            let mut cursor = store
                .search(&query)
                .await
                .with_context(|| format!("cannot search elasticsearch at {}", cli.host))?;

            let mut total = 0usize;
            while let Some(hits) = cursor.next_page().await? {
                for hit in hits {
                    println!(
                        "score={:.4} file={} table={}",
                        hit.score, hit.filename, hit.table
                    );
                    println!("  {}", serde_json::Value::Object(hit.fields));
                    total += 1;
                }
            }
            println!("{total} hit(s)");
        }
        Command::Count => {
            let count = store
                .count()
                .await
                .with_context(|| format!("cannot reach elasticsearch at {}", cli.host))?;
            println!("{count} documents indexed");
        }
        Command::Clean => {
            store
                .delete_all()
                .await
                .with_context(|| format!("cannot reach elasticsearch at {}", cli.host))?;
            println!("index {} deleted", cli.index);
        }
    }

    Ok(())
}
