//! kg-memory CLI: knowledge-graph memory server and maintenance commands.

use std::io::{BufReader, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use kg_memory::config::MemoryConfig;
use kg_memory::export;
use kg_memory::graph::OptimizedGraphManager;
use kg_memory::tools;

#[derive(Parser)]
#[command(name = "kg-memory", version, about = "Durable knowledge-graph memory for agents")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database connection string (redb:///abs/path, redb://rel/path, a path, or :memory:).
    /// Overrides the config file and KG_MEMORY_DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve line-delimited JSON tool requests on stdin, responses on stdout.
    Serve,

    /// Print the whole graph as JSON.
    Read,

    /// Search entities by name, type or observation (case-insensitive).
    Search {
        /// Substring to look for.
        query: String,
    },

    /// Print the named entities and the relations among them.
    Open {
        /// Entity names.
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Export the graph as JSONL.
    Export {
        /// Output file (defaults to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Import a JSONL export as one atomic batch.
    Import {
        /// JSONL file to read.
        file: PathBuf,
    },

    /// Show database location and graph statistics.
    Info,
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    // stdout carries protocol output; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => MemoryConfig::load(path)?,
        None => MemoryConfig::default(),
    }
    .with_env(|key| std::env::var(key))
    .with_database_url(cli.database_url.clone());

    let manager = OptimizedGraphManager::open(&config)?;

    match cli.command {
        Commands::Serve => {
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            tracing::info!(database = %config.database_url, "serving tool requests on stdin");
            tools::serve(&manager, stdin.lock(), stdout.lock()).into_diagnostic()?;
        }

        Commands::Read => {
            let graph = manager.read_graph()?;
            print_json(&graph)?;
        }

        Commands::Search { query } => {
            let graph = manager.search_nodes(&query)?;
            print_json(&graph)?;
        }

        Commands::Open { names } => {
            let graph = manager.open_nodes(&names)?;
            print_json(&graph)?;
        }

        Commands::Export { output } => {
            let graph = manager.read_graph()?;
            let lines = match &output {
                Some(path) => {
                    let file = std::fs::File::create(path).into_diagnostic()?;
                    export::write_jsonl(&graph, std::io::BufWriter::new(file))?
                }
                None => export::write_jsonl(&graph, std::io::stdout().lock())?,
            };
            tracing::info!(lines, "exported graph");
        }

        Commands::Import { file } => {
            let reader = BufReader::new(std::fs::File::open(&file).into_diagnostic()?);
            let batch = export::read_jsonl(reader)?;
            let outcome = manager.apply_batch(&batch)?;
            println!(
                "Imported {} entities and {} relations from {} ({} skipped)",
                outcome.entities.len(),
                outcome.relations.len(),
                file.display(),
                batch.len() - outcome.entities.len() - outcome.relations.len(),
            );
        }

        Commands::Info => {
            let graph = manager.read_graph()?;
            println!("kg-memory info:");
            println!("  Database:     {}", config.location()?);
            println!("  Entities:     {}", graph.entities.len());
            println!("  Relations:    {}", graph.relations.len());
            println!("  Observations: {}", graph.observation_count());
            println!("  Missing-endpoint policy: {:?}", config.missing_endpoint);
        }
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).into_diagnostic()?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{json}").into_diagnostic()
}
