#![forbid(unsafe_code)]

use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use jobdb::identifier::{hint_from_path, resolve, resolve_or_prompt, LinePrompt};
use jobdb::properties::{parse_source, split_assignment};
use jobdb::{codec, normalize, Filter, JobDbConfig, JobDbError, PropertySet, RecordStore, Result};

#[derive(Parser)]
#[command(name = "jobdb", version, about = "Job metadata store CLI")]
struct Cli {
    /// SQLite store path (default: $JOBDB_STORE, the config's store_path, or jobs.sqlite)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Configuration file (default: $JOBDB_CONFIG or ./jobdb.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the job table from the configured schema
    InitStore {
        /// Drop and recreate an existing table
        #[arg(long)]
        force: bool,
    },
    /// Normalize property sources and append them as one atomic batch
    Insert {
        /// Property files (JSON, job documents, or key: value lines); globs allowed, `-` reads stdin
        #[arg(required = true)]
        sources: Vec<String>,

        /// Job identifier (overrides anything guessed or read from the sources)
        #[arg(long)]
        id: Option<String>,

        /// Manual property, applied on top of every source
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,

        /// Do not stamp rows with recorded_at
        #[arg(long)]
        no_timestamp: bool,
    },
    /// Write the deterministic text form of the store (`-` for stdout)
    DumpStore { path: PathBuf },
    /// Rebuild the store from a dump (`-` for stdin)
    LoadStore { path: PathBuf },
    /// Print matching rows as JSON lines
    Query {
        /// Match the identifier column
        #[arg(long)]
        id: Option<String>,

        /// Column equality, e.g. --where complete=true
        #[arg(long = "where", value_name = "KEY=VALUE")]
        conditions: Vec<String>,

        /// Require the column to be present
        #[arg(long)]
        present: Vec<String>,

        /// Require the column to be absent
        #[arg(long)]
        absent: Vec<String>,

        /// Only the most recently appended match
        #[arg(long)]
        latest: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(64)
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    init_tracing();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("jobdb: {err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("JOBDB_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = JobDbConfig::load(cli.config.as_deref())?;
    let db = config.store_path(cli.db);

    match cli.command {
        Commands::InitStore { force } => {
            let schema = config.schema()?;
            let _lock = RecordStore::lock_exclusive(&db)?;
            let store = RecordStore::initialize(&db, schema, force)?;
            println!(
                "initialized {} with {} columns",
                db.display(),
                store.schema().len()
            );
        }
        Commands::Insert {
            sources,
            id,
            set,
            no_timestamp,
        } => {
            let _lock = RecordStore::lock_exclusive(&db)?;
            let store = RecordStore::open(&db)?;
            let manual = parse_assignments(&set)?;
            let key = store.schema().key_name().to_string();
            let explicit = id.as_deref().map(|id| resolve(id).to_properties(&key));
            let stamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
            let mut prompt = LinePrompt::new(BufReader::new(io::stdin()), io::stderr());

            let mut rows = Vec::new();
            for source in expand_sources(&sources)? {
                let (text, path_hint) = read_source(&source)?;
                for props in parse_source(&text, &config.properties)? {
                    let hint = id
                        .clone()
                        .or_else(|| props.get(&key).flatten().map(str::to_string))
                        .or_else(|| path_hint.clone());
                    let identifier = resolve_or_prompt(hint.as_deref(), &source, &mut prompt)?;

                    let mut layered = identifier
                        .to_properties(&key)
                        .overlay(&props)
                        .overlay(&manual);
                    if let Some(explicit) = &explicit {
                        layered = layered.overlay(explicit);
                    }
                    if !no_timestamp && !layered.contains_key("recorded_at") {
                        layered.push("recorded_at", Some(stamp.clone()));
                    }
                    rows.push(normalize(&layered, store.schema()));
                }
            }
            let count = store.insert_batch(rows).await?;
            info!(rows = count, db = %db.display(), "inserted");
            println!("inserted {count} rows");
        }
        Commands::DumpStore { path } => {
            let store = RecordStore::open(&db)?;
            let text = store.dump().await?;
            if path.as_os_str() == "-" {
                io::stdout().write_all(text.as_bytes())?;
            } else {
                write_atomic(&path, &text)?;
                eprintln!("dumped {} to {}", db.display(), path.display());
            }
        }
        Commands::LoadStore { path } => {
            let text = if path.as_os_str() == "-" {
                let mut buf = String::new();
                io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                std::fs::read_to_string(&path)?
            };
            let expected = if config.has_explicit_schema() {
                Some(config.schema()?)
            } else {
                None
            };
            let _lock = RecordStore::lock_exclusive(&db)?;
            let store = codec::load_into_path(&text, &db, expected.as_ref()).await?;
            println!(
                "loaded {} rows into {}",
                store.count().await?,
                db.display()
            );
        }
        Commands::Query {
            id,
            conditions,
            present,
            absent,
            latest,
        } => {
            let store = RecordStore::open(&db)?;
            let mut filters = Vec::new();
            if let Some(id) = id {
                filters.push(Filter::eq(store.schema().key_name(), id));
            }
            for (key, value) in parse_assignments(&conditions)?.iter() {
                filters.push(Filter::eq(key, value.map(str::to_string)));
            }
            filters.extend(present.into_iter().map(Filter::Present));
            filters.extend(absent.into_iter().map(Filter::Absent));

            let mut rows = store.query(Filter::And(filters)).await?;
            if latest {
                rows = rows.pop().into_iter().collect();
            }
            let mut out = io::stdout().lock();
            for row in &rows {
                let line =
                    serde_json::to_string(row).map_err(|e| JobDbError::Serde(e.to_string()))?;
                writeln!(out, "{line}")?;
            }
        }
    }
    Ok(())
}

/// `KEY=VALUE` (or `KEY: VALUE`) pairs; an empty value is absent.
fn parse_assignments(items: &[String]) -> Result<PropertySet> {
    let mut props = PropertySet::new();
    for item in items {
        let (key, value) = split_assignment(item).ok_or_else(|| {
            JobDbError::MalformedInput(format!("expected KEY=VALUE, found {item:?}"))
        })?;
        props.push(key, value);
    }
    Ok(props)
}

fn expand_sources(sources: &[String]) -> Result<Vec<String>> {
    let mut expanded = Vec::new();
    for source in sources {
        if source == "-" || !source.contains(&['*', '?', '['][..]) {
            expanded.push(source.clone());
            continue;
        }
        let paths = glob::glob(source)
            .map_err(|e| JobDbError::MalformedInput(format!("bad pattern {source:?}: {e}")))?;
        let before = expanded.len();
        for entry in paths {
            let path = entry.map_err(|e| JobDbError::Io(e.into_error()))?;
            expanded.push(path.display().to_string());
        }
        if expanded.len() == before {
            return Err(JobDbError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("pattern {source:?} matched no files"),
            )));
        }
    }
    Ok(expanded)
}

/// Source text plus the identifier hint its file name provides.
fn read_source(source: &str) -> Result<(String, Option<String>)> {
    if source == "-" {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        return Ok((buf, None));
    }
    let path = Path::new(source);
    let text = std::fs::read_to_string(path)?;
    Ok((text, hint_from_path(path)))
}

fn write_atomic(path: &Path, text: &str) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(text.as_bytes())?;
    file.flush()?;
    file.persist(path).map_err(|e| JobDbError::Io(e.error))?;
    Ok(())
}
