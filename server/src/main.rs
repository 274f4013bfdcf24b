// Cosheet server - collaborative spreadsheet documents over JSONL/TCP

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use cosheet_config::ServerSettings;
use cosheet_io::{DocumentStore, MemoryStore, SqliteStore};
use cosheet_server::session_server::{
    auth, CollabServer, DocumentOptions, DocumentRegistry, EventRegistry, GatewayConfig,
    SessionHub,
};

const EXIT_SUCCESS: u8 = 0;
const EXIT_ERROR: u8 = 1;
const EXIT_USAGE: u8 = 2;

#[derive(Parser)]
#[command(name = "cosheet-server")]
#[command(about = "Collaborative spreadsheet server")]
#[command(version)]
struct Args {
    /// Settings file (defaults to the user config directory)
    #[arg(long, short = 'c', value_name = "PATH")]
    config: Option<PathBuf>,

    /// Listen address, overriding the settings file
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// SQLite database path, overriding the settings file
    #[arg(long, value_name = "PATH")]
    database: Option<PathBuf>,

    /// Print the effective settings as TOML and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let settings = match load_settings(&args) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(EXIT_USAGE);
        }
    };

    if args.print_config {
        return match settings.to_toml() {
            Ok(text) => {
                print!("{}", text);
                ExitCode::from(EXIT_SUCCESS)
            }
            Err(e) => {
                eprintln!("error: {}", e);
                ExitCode::from(EXIT_ERROR)
            }
        };
    }

    match run(settings) {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(e) => {
            log::error!("{}", e);
            ExitCode::from(EXIT_ERROR)
        }
    }
}

fn load_settings(args: &Args) -> Result<ServerSettings, cosheet_config::ConfigError> {
    let mut settings = match &args.config {
        Some(path) => ServerSettings::load_from(path)?,
        None => ServerSettings::load()?,
    };
    if let Some(bind) = &args.bind {
        settings.bind = bind.clone();
    }
    if let Some(database) = &args.database {
        settings.database = Some(database.clone());
    }
    settings.validate()?;
    Ok(settings)
}

fn open_store(settings: &ServerSettings) -> Result<Arc<dyn DocumentStore>, String> {
    let Some(path) = &settings.database else {
        log::warn!("No database configured; documents are kept in memory and lost on exit");
        return Ok(Arc::new(MemoryStore::new()));
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("cannot create {}: {}", parent.display(), e))?;
    }
    let store = SqliteStore::open(path).map_err(|e| format!("{}: {}", path.display(), e))?;
    log::info!("Document store: {}", path.display());
    Ok(Arc::new(store))
}

fn run(settings: ServerSettings) -> Result<(), String> {
    let store = open_store(&settings)?;
    let events = EventRegistry::new(settings.event_queue_depth);
    let registry = DocumentRegistry::new(
        store,
        Arc::new(events.clone()),
        DocumentOptions::from_settings(&settings),
    );
    let hub = Arc::new(SessionHub::new(registry));
    let authenticator: Arc<dyn auth::Authenticator> = Arc::from(auth::from_settings(&settings.auth));

    let mut server = CollabServer::new(Arc::clone(&hub), events, authenticator);
    let addr = server
        .start(GatewayConfig::from_settings(&settings))
        .map_err(|e| format!("cannot listen on {}: {}", settings.bind, e))?;
    eprintln!("cosheet-server listening on {} (type \"quit\" to stop)", addr);

    wait_for_quit();

    log::info!("Shutting down");
    server.stop();
    let failures = hub.shutdown();
    if failures > 0 {
        return Err(format!("{} document(s) could not be persisted", failures));
    }
    Ok(())
}

/// Block until "quit" on stdin. A closed stdin (daemonized) blocks forever.
fn wait_for_quit() {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        match line {
            Ok(line) if matches!(line.trim(), "quit" | "exit") => return,
            Ok(_) => {}
            Err(e) => {
                log::debug!("stdin: {}", e);
                break;
            }
        }
    }
    loop {
        std::thread::park();
    }
}
