//! relgraph CLI
//!
//! Command-line tools for relgraph schema files.
//!
//! # Commands
//!
//! - `inspect` - Display entities, keys and relationships of a schema
//! - `order` - Print the commit order of the schema's entities
//! - `compile` - Compile a query against the schema and print the SQL

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// relgraph command-line schema and query tools.
#[derive(Parser)]
#[command(name = "relgraph")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the schema JSON file
    #[arg(global = true, short, long)]
    schema: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display entities, keys and relationships
    Inspect {
        /// Show attribute details
        #[arg(short, long)]
        attributes: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print the order in which commit batches touch each entity
    Order {
        /// Only these entities (default: all)
        #[arg(short, long)]
        entity: Vec<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Compile a query to SQL
    Compile {
        /// Root entity
        entity: String,

        /// Filter such as `paintings.title~Water%` or `name!=Monet`;
        /// repeated filters are combined with AND
        #[arg(short = 'w', long = "where")]
        filters: Vec<String>,

        /// Ordering path, `-path` for descending
        #[arg(short, long)]
        order: Vec<String>,

        /// Projected column path (default: whole objects)
        #[arg(short, long)]
        column: Vec<String>,

        /// Add COUNT(*) to the projection
        #[arg(long)]
        count: bool,

        /// Request DISTINCT rows
        #[arg(short, long)]
        distinct: bool,

        /// Fetch limit
        #[arg(short, long)]
        limit: Option<usize>,

        /// Fetch offset
        #[arg(long, default_value = "0")]
        offset: usize,

        /// Quote identifiers with this character
        #[arg(short, long)]
        quote: Option<char>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Inspect { attributes, format } => {
            let path = cli.schema.ok_or("Schema path required for inspect")?;
            commands::inspect::run(&path, attributes, &format)?;
        }
        Commands::Order { entity, format } => {
            let path = cli.schema.ok_or("Schema path required for order")?;
            commands::order::run(&path, &entity, &format)?;
        }
        Commands::Compile {
            entity,
            filters,
            order,
            column,
            count,
            distinct,
            limit,
            offset,
            quote,
            format,
        } => {
            let path = cli.schema.ok_or("Schema path required for compile")?;
            let request = commands::compile::Request {
                entity,
                filters,
                orderings: order,
                columns: column,
                count,
                distinct,
                limit,
                offset,
                quote,
            };
            commands::compile::run(&path, &request, &format)?;
        }
        Commands::Version => {
            println!("relgraph CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
