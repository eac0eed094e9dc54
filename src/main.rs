mod query;

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use jify_engine::database::Database;
use jify_engine::index::FieldSpec;
use jify_engine::{Error, FieldType};

/// An append-only JSON document store with secondary indexes.
#[derive(Debug, Parser)]
#[clap(version)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Builds or extends the index over one or more fields.
    Index {
        /// Path to the data file.
        file: PathBuf,
        /// A field to index, as `name` or `name:date-time`. May be
        /// repeated.
        #[clap(long = "field", required = true)]
        fields: Vec<String>,
    },
    /// Finds records matching one or more queries. Results from separate
    /// `--query` arguments are unioned.
    Find {
        /// Path to the data file.
        file: PathBuf,
        /// A query of the form `field<op>value[,field<op>value...]`,
        /// where `<op>` is one of `=`, `<`, `>`, `<=`, `>=`. May be
        /// repeated.
        #[clap(long = "query", required = true)]
        queries: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    init_logging();

    let code = match run().await {
        Ok(()) => exitcode::OK,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

/// Installs a `tracing_subscriber::fmt` subscriber when `DEBUG` is set to a
/// non-empty value, seeding its filter from that value so namespaced
/// targets (e.g. `DEBUG=jify_engine::index=trace`) behave like the
/// original's labelled debug flags. Absent, no subscriber is installed and
/// every `tracing` call in `jify-engine` is a no-op.
fn init_logging() {
    let Ok(debug) = std::env::var("DEBUG") else { return };
    if debug.is_empty() {
        return;
    }
    let filter = tracing_subscriber::EnvFilter::try_new(&debug)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trace"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Index { file, fields } => run_index(file, fields).await,
        Command::Find { file, queries } => run_find(file, queries).await,
    }
}

async fn run_index(file: PathBuf, fields: Vec<String>) -> Result<()> {
    let specs = fields
        .iter()
        .map(|raw| parse_field_spec(raw))
        .collect::<Result<Vec<_>>>()?;

    let database = open_database(&file).await?;
    database.index(&specs).await.context("failed to build index")?;
    Ok(())
}

async fn run_find(file: PathBuf, queries: Vec<String>) -> Result<()> {
    let database = open_database(&file).await?;
    // Opens (or creates) the index without registering any new fields;
    // `find` only makes sense against fields someone already indexed.
    let index = database.index(&[]).await.context("failed to open index")?;

    let mut field_kinds: HashMap<String, FieldType> = HashMap::new();
    for (name, header) in index.headers().await.context("failed to read index headers")? {
        if let jify_engine::predicate::NodeValue::String(metadata) = &header.node.value {
            let metadata = jify_engine::predicate::FieldMetadata::from_json_string(metadata)?;
            if let Some(kind) = metadata.kind {
                field_kinds.insert(name, kind);
            }
        }
    }

    let parsed = queries
        .iter()
        .map(|raw| query::parse_query(raw, &field_kinds))
        .collect::<Result<Vec<_>>>()?;

    let records = database
        .find_queries(&index, &parsed)
        .await
        .context("failed to evaluate query")?;
    for record in records {
        println!("{record}");
    }
    Ok(())
}

/// Opens `file` if it already exists on disk, or creates a fresh empty
/// data file otherwise. [`Database::open`] can't make this distinction
/// itself: opening a file handle implicitly creates it, which would leave
/// a brand-new file as zero bytes rather than a valid empty array.
async fn open_database(file: &PathBuf) -> Result<Database> {
    if tokio::fs::try_exists(file)
        .await
        .with_context(|| format!("failed to stat {}", file.display()))?
    {
        Database::open(file)
            .await
            .with_context(|| format!("failed to open {}", file.display()))
    } else {
        Database::create(file)
            .await
            .with_context(|| format!("failed to create {}", file.display()))
    }
}

fn parse_field_spec(raw: &str) -> Result<FieldSpec> {
    match raw.split_once(':') {
        None => Ok(FieldSpec::new(raw, None)),
        Some((name, "date-time")) => Ok(FieldSpec::new(name, Some(FieldType::DateTime))),
        Some((_, kind)) => bail!("unknown field type {kind:?} (expected \"date-time\")"),
    }
}

/// Maps an engine error to a process exit code (spec §6: "exit code 0 on
/// success, non-zero on any error").
fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<Error>() {
        Some(Error::InvalidFormat { .. } | Error::PredicateInvalid { .. } | Error::FieldInTransaction { .. }) => {
            exitcode::DATAERR
        }
        Some(Error::NotFound { .. } | Error::FieldMissing { .. }) => exitcode::NOINPUT,
        Some(Error::AlreadyExists { .. }) => exitcode::CANTCREAT,
        Some(Error::Io { .. }) => exitcode::IOERR,
        None => exitcode::SOFTWARE,
    }
}
