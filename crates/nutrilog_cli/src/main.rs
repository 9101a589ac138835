//! NutriLog command-line front end.
//!
//! # Responsibility
//! - Provide a small executable over `nutrilog_core` for local inspection.
//! - Resolve settings through `CoreConfig` and start file logging once.
//!
//! # Invariants
//! - Commands never mutate food versions except through `VersionedStore`.
//! - Failures print one line to stderr and exit with status 1.

use clap::{Parser, Subcommand};
use log::warn;
use nutrilog_core::{
    open_db, CoreConfig, SqliteFoodRepository, TaxonomyIndex, VersionKey, VersionedStore,
};
use std::error::Error;
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "nutrilog")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect nutrient taxonomies and versioned food stores")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check core linkage
    Ping,
    /// Print the nutrient taxonomy tree
    Taxonomy {
        /// Taxonomy JSON definition; the configured or built-in one otherwise
        #[arg(short, long, value_name = "PATH")]
        file: Option<PathBuf>,
    },
    /// Print a food snapshot as JSON
    Show {
        /// Database file; overrides `db_path`
        #[arg(long, value_name = "PATH")]
        db: Option<PathBuf>,
        /// Specific version instead of the current one
        #[arg(long, value_name = "VERSION")]
        at: Option<u32>,
        food_id: Uuid,
    },
    /// Run one garbage-collection pass and print the report
    Gc {
        /// Database file; overrides `db_path`
        #[arg(long, value_name = "PATH")]
        db: Option<PathBuf>,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = CoreConfig::load(cli.config.as_deref())?;
    if let Err(err) = nutrilog_core::init_logging(&config) {
        eprintln!("warning: logging disabled: {err}");
    }

    match cli.command {
        Command::Ping => {
            println!("nutrilog_core ping={}", nutrilog_core::ping());
            println!("nutrilog_core version={}", nutrilog_core::core_version());
        }
        Command::Taxonomy { file } => {
            let taxonomy = load_taxonomy(file.as_deref(), &config)?;
            if let Some(root) = taxonomy.root_name() {
                print_taxonomy(&taxonomy, root, 0);
            } else {
                warn!("event=cli_taxonomy module=cli status=empty");
                println!("(empty taxonomy)");
            }
        }
        Command::Show { db, at, food_id } => {
            let conn = open_db(db.as_deref().unwrap_or(config.db_path.as_path()))?;
            let store = VersionedStore::new(SqliteFoodRepository::try_new(&conn)?);
            let record = match at {
                Some(version) => store.get_version(VersionKey::new(food_id, version))?,
                None => store.get_current(food_id)?,
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Gc { db } => {
            let conn = open_db(db.as_deref().unwrap_or(config.db_path.as_path()))?;
            let store = VersionedStore::new(SqliteFoodRepository::try_new(&conn)?);
            let report = store.collect_garbage()?;
            let stats = store.stats()?;
            println!("versions_deleted={}", report.versions_deleted);
            println!("ingredient_links_deleted={}", report.ingredient_links_deleted);
            println!("nutrient_trees_deleted={}", report.nutrient_trees_deleted);
            println!("nutrient_nodes_deleted={}", report.nutrient_nodes_deleted);
            println!("versions_retained={}", report.versions_retained);
            println!("foods={} nutrient_nodes={}", stats.foods, stats.nutrient_nodes);
        }
    }
    Ok(())
}

fn load_taxonomy(
    file: Option<&Path>,
    config: &CoreConfig,
) -> Result<TaxonomyIndex, Box<dyn Error>> {
    if let Some(path) = file {
        return Ok(TaxonomyIndex::from_file(path)?);
    }
    Ok(match &config.taxonomy_path {
        Some(path) => TaxonomyIndex::load_or_empty(path),
        None => TaxonomyIndex::builtin(),
    })
}

fn print_taxonomy(taxonomy: &TaxonomyIndex, name: &str, depth: usize) {
    let marker = if taxonomy.is_generic(name) { " *" } else { "" };
    println!("{}{name}{marker}", "  ".repeat(depth));
    for child in taxonomy.children(name, false) {
        print_taxonomy(taxonomy, &child, depth + 1);
    }
}
