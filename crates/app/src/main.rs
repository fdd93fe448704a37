use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use quiz_core::catalog::CategoryCatalog;
use services::{ProgressRepository, RepositoryConfig, attach_sync_engine};
use storage::migrate::MigrationEngine;
use storage::{QuotaConfig, StorageGateway, StorageKey};
use sync::{HttpRemoteStore, SyncConfig, SyncState};
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    UnknownArg(String),
    InvalidDbUrl { raw: String },
    InvalidCatalog { raw: String, reason: String },
    MissingRemote,
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
            ArgsError::InvalidCatalog { raw, reason } => {
                write!(f, "could not read catalog {raw}: {reason}")
            }
            ArgsError::MissingRemote => write!(f, "sync-once requires --remote <url>"),
        }
    }
}

impl std::error::Error for ArgsError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p app -- info      [options]");
    eprintln!("  cargo run -p app -- migrate   [options]");
    eprintln!("  cargo run -p app -- repair    [options] [--apply]");
    eprintln!("  cargo run -p app -- reset     [options]");
    eprintln!("  cargo run -p app -- sync-once [options] --remote <url>");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --db <sqlite_url>    storage location (default sqlite://progress.sqlite3)");
    eprintln!("  --identity <id>      progress identity (default \"default\")");
    eprintln!("  --catalog <path>     category catalog JSON file");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  QUIZ_DB_URL, QUIZ_IDENTITY, QUIZ_CATALOG");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Info,
    Migrate,
    Repair,
    Reset,
    SyncOnce,
}

impl Command {
    fn from_arg(arg: &str) -> Option<Self> {
        match arg {
            "info" => Some(Self::Info),
            "migrate" => Some(Self::Migrate),
            "repair" => Some(Self::Repair),
            "reset" => Some(Self::Reset),
            "sync-once" => Some(Self::SyncOnce),
            _ => None,
        }
    }
}

struct Args {
    db_url: String,
    identity: String,
    catalog: CategoryCatalog,
    apply: bool,
    remote: Option<String>,
}

impl Args {
    fn parse(args: &mut impl Iterator<Item = String>) -> Result<Self, ArgsError> {
        let mut db_url = std::env::var("QUIZ_DB_URL")
            .ok()
            .map_or_else(|| "sqlite://progress.sqlite3".into(), normalize_sqlite_url);
        let mut identity = std::env::var("QUIZ_IDENTITY")
            .ok()
            .unwrap_or_else(|| "default".into());
        let mut catalog_path = std::env::var("QUIZ_CATALOG").ok();
        let mut apply = false;
        let mut remote = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    db_url = normalize_sqlite_url(value);
                }
                "--identity" => identity = require_value(args, "--identity")?,
                "--catalog" => catalog_path = Some(require_value(args, "--catalog")?),
                "--apply" => apply = true,
                "--remote" => remote = Some(require_value(args, "--remote")?),
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        let catalog = match catalog_path {
            Some(path) => load_catalog(&path)?,
            None => {
                eprintln!("note: no --catalog given, category totals will not be enforced");
                CategoryCatalog::new(Vec::new())
            }
        };

        Ok(Self {
            db_url,
            identity,
            catalog,
            apply,
            remote,
        })
    }
}

fn load_catalog(path: &str) -> Result<CategoryCatalog, ArgsError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ArgsError::InvalidCatalog {
        raw: path.to_owned(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&raw).map_err(|e| ArgsError::InvalidCatalog {
        raw: path.to_owned(),
        reason: e.to_string(),
    })
}

fn normalize_sqlite_url(raw: String) -> String {
    if raw == "sqlite::memory:" || raw.starts_with("sqlite://") {
        return raw;
    }

    let trimmed = raw.trim().to_string();
    let path_str = trimmed
        .strip_prefix("sqlite:")
        .unwrap_or(trimmed.as_str())
        .to_string();
    let path = std::path::Path::new(&path_str);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| std::path::PathBuf::from("."))
            .join(path)
    };
    format!("sqlite://{}", absolute.display())
}

fn prepare_sqlite_file(db_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    if db_url == "sqlite::memory:" {
        return Ok(());
    }

    let path = db_url
        .strip_prefix("sqlite://")
        .ok_or_else(|| ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        })?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        return Err(ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        }
        .into());
    }

    let path = std::path::Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if !path.exists() {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
    }

    Ok(())
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut argv: Vec<String> = std::env::args().skip(1).collect();

    let cmd = match argv.first().map(String::as_str) {
        None | Some("--help" | "-h") => {
            print_usage();
            return Ok(());
        }
        Some(first) => Command::from_arg(first).ok_or_else(|| {
            eprintln!("unknown subcommand: {first}");
            print_usage();
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "unknown subcommand")
        })?,
    };
    argv.remove(0);

    let mut iter = argv.into_iter();
    let args = Args::parse(&mut iter).map_err(|e| {
        eprintln!("{e}");
        print_usage();
        e
    })?;

    prepare_sqlite_file(&args.db_url)?;
    let gateway = StorageGateway::open_sqlite(&args.db_url, QuotaConfig::default()).await;
    if !gateway.persistent() {
        eprintln!("warning: running against in-memory storage, changes will not survive exit");
    }

    match cmd {
        Command::Info => info(&gateway, &args).await,
        Command::Migrate => migrate(&gateway, &args).await,
        Command::Repair => repair(gateway, args).await,
        Command::Reset => reset(gateway, args).await,
        Command::SyncOnce => sync_once(gateway, args).await,
    }
}

async fn info(gateway: &StorageGateway, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let repo = ProgressRepository::new(
        &args.identity,
        gateway.clone(),
        args.catalog.clone(),
        RepositoryConfig::default(),
    );
    let progress = repo.load().await?;
    let usage = repo.storage_info().await?;

    println!("identity:          {}", args.identity);
    println!("schema version:    {}", progress.schema_version);
    println!("answered:          {}", progress.total_questions_answered);
    println!("correct:           {}", progress.correct_answers);
    println!("categories:        {}", progress.category_progress.len());
    println!("sessions:          {}", progress.study_sessions.len());
    println!("exam attempts:     {}", progress.exam_history.len());
    println!("open mistakes:     {}", progress.incorrect_questions.len());
    println!("overcome:          {}", progress.overcome_questions.len());
    println!(
        "streak:            {} (best {})",
        progress.current_streak, progress.best_streak
    );
    println!(
        "storage:           {} / {} bytes ({:.1}%)",
        usage.used, usage.total, usage.percentage
    );
    Ok(())
}

async fn migrate(gateway: &StorageGateway, args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let key = StorageKey::progress(&args.identity);
    let Some(mut raw) = gateway.get(&key).await? else {
        println!("no stored progress for {}", args.identity);
        return Ok(());
    };

    let report = MigrationEngine::new().run(&mut raw);
    println!("version before: {}", report.version_before);
    println!("changed:        {}", report.changed);
    println!("message:        {}", report.message);
    for step in &report.applied {
        println!("  applied {step}");
    }
    if report.incomplete {
        println!("warning: migration incomplete, document left as-is");
        return Ok(());
    }
    if report.changed {
        gateway.set(&key, &raw).await?;
        println!("migrated document written back");
    }
    Ok(())
}

async fn repair(gateway: StorageGateway, args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let repo = ProgressRepository::new(
        &args.identity,
        gateway,
        args.catalog.clone(),
        RepositoryConfig::default(),
    );
    let outcome = if args.apply {
        repo.repair_and_save().await?
    } else {
        repo.check_integrity().await?
    };

    if outcome.violations.is_empty() {
        println!("no violations found");
        return Ok(());
    }
    println!("{} violation(s):", outcome.violations.len());
    for violation in &outcome.violations {
        println!("  {}", serde_json::to_string(violation)?);
    }
    if args.apply {
        println!("corrected aggregate written back");
    } else {
        println!("dry run, pass --apply to write the corrected aggregate");
    }
    Ok(())
}

async fn reset(gateway: StorageGateway, args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let repo = ProgressRepository::new(
        &args.identity,
        gateway,
        args.catalog.clone(),
        RepositoryConfig::default(),
    );
    let outcome = repo.reset_all().await?;
    println!("{}", outcome.message);
    for change in &outcome.changes {
        println!("  {change}");
    }
    Ok(())
}

async fn sync_once(gateway: StorageGateway, args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let base_url = args.remote.clone().ok_or(ArgsError::MissingRemote)?;
    let repo = Arc::new(ProgressRepository::new(
        &args.identity,
        gateway,
        args.catalog.clone(),
        RepositoryConfig::default(),
    ));
    repo.load().await?;

    let remote = HttpRemoteStore::new(base_url, Duration::from_secs(30))?;
    let handle = attach_sync_engine(
        Arc::clone(&repo),
        SyncConfig::default(),
        Arc::new(remote),
    );

    let mut states = handle.subscribe_state();
    let outcome = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let state = *states.borrow();
            if matches!(state, SyncState::Synced | SyncState::Offline) {
                return state;
            }
            if states.changed().await.is_err() {
                return SyncState::Disconnected;
            }
        }
    })
    .await;

    match outcome {
        Ok(SyncState::Synced) => println!("synced"),
        Ok(state) => println!("sync did not complete: {state:?}"),
        Err(_) => println!("sync timed out"),
    }
    handle.stop().await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(2);
    }
}
