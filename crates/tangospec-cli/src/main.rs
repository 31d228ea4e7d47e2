//! `tangospec-cli` – the bridge console.
//!
//! This binary serves one `Spec` device (and its motor/counter children) in
//! process, against a simulated four-circle session.  It:
//!
//! 1. Loads `~/.tangospec/config.toml`, writing defaults on the first run.
//! 2. Opens the SQLite property database and merges the config into the
//!    `Spec` device properties.
//! 3. Creates the device and drops the user into an **interactive REPL**.
//! 4. Intercepts **Ctrl-C** to tear every device down and exit safely.

mod config;
mod repl;

use colored::Colorize;
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use tangospec_device::{SPEC_CLASS, SpecConfig, register_classes};
use tangospec_middleware::{DeviceServer, LocalServer};
use tangospec_session::{CounterType, SessionAddress, SimConnector, SimSession};
use tangospec_store::{PropertyStore, SqlitePropertyStore};
use tangospec_types::BridgeError;

fn main() {
    let _telemetry = tangospec_bridge::telemetry::init_tracing("tangospec");

    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let cfg = config::Config::default();
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    let server = match start(&cfg) {
        Ok(server) => server,
        Err(e) => {
            println!("{}: {}", "Cannot start the device server".red(), e);
            return;
        }
    };

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let server_ctrlc = server.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting devices down …".yellow().bold());
        server_ctrlc.shutdown();
        println!("{}", "  ✓ Exiting tangospec.".green());
        shutdown_clone.store(true, Ordering::SeqCst);
        std::process::exit(0);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let watching = Arc::new(AtomicBool::new(false));
    spawn_event_printer(&server, watching.clone(), shutdown.clone());

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    let console = repl::Console {
        server: server.clone(),
        device: cfg.device_name.clone(),
        watching,
    };
    repl::run(&console, shutdown);

    server.shutdown();
}

/// Open the database, seed the device properties and create the device.
fn start(cfg: &config::Config) -> Result<Arc<LocalServer>, BridgeError> {
    let db_path = cfg.database_path(&config::home_dir());
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| BridgeError::Store(format!("cannot create {}: {e}", parent.display())))?;
    }
    let store: Arc<dyn PropertyStore> = Arc::new(SqlitePropertyStore::open(&db_path)?);
    println!("  Property database {}", db_path.display().to_string().bold());

    let mut spec = SpecConfig::load(store.as_ref(), &cfg.device_name)?;
    cfg.apply_to(&mut spec);
    spec.save(store.as_ref(), &cfg.device_name)?;

    let session = demo_session(&cfg.session)?;
    let server = LocalServer::new(store);
    register_classes(&server, Arc::new(SimConnector::new().with_session(session)));

    print!("  Starting {} on {} … ", cfg.device_name.bold(), cfg.session.yellow());
    std::io::stdout().flush().ok();
    server.create_device(SPEC_CLASS, &cfg.device_name, None)?;
    let status = server.read_attribute(&cfg.device_name, "Status")?;
    println!("{}", status.to_string().green());
    info!(device = %cfg.device_name, session = %cfg.session, "console ready");
    Ok(server)
}

/// A four-circle session to play with.
fn demo_session(address: &str) -> Result<Arc<SimSession>, BridgeError> {
    let address = SessionAddress::parse(address)?;
    SimSession::builder(&address.to_string())
        .with_motor("tth", 0.0)
        .with_motor("th", 0.0)
        .with_motor("chi", 0.0)
        .with_motor("phi", 0.0)
        .with_counter("sec", CounterType::Timer)
        .with_counter("mon", CounterType::Monitor)
        .with_counter("det", CounterType::Scaler)
        .with_variable("DEMO", json!({"energy": 12.4, "sample": "Si"}))
        .build()
}

/// Print bus events on a background thread while `watching` is set.
fn spawn_event_printer(server: &LocalServer, watching: Arc<AtomicBool>, shutdown: Arc<AtomicBool>) {
    let mut rx = server.bus().subscribe();
    let spawned = std::thread::Builder::new()
        .name("event-printer".to_string())
        .spawn(move || {
            loop {
                match rx.blocking_recv() {
                    Ok(event) if watching.load(Ordering::SeqCst) => {
                        println!("{}", repl::format_event(&event).dimmed());
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => warn!(lagged_by = n, "event printer lagged"),
                    Err(RecvError::Closed) => break,
                }
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "cannot start event printer");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"  _                              ___ ___  ___ ___ "#.bold().cyan());
    println!("{}", r#" | |_ __ _ _ _  __ _ ___  ___  / __| _ \| __/ __|"#.bold().cyan());
    println!("{}", r#" |  _/ _` | ' \/ _` / _ \|___| \__ \  _/| _| (__ "#.bold().cyan());
    println!("{}", r#"  \__\__,_|_||_\__, \___/      |___/_|  |___\___|"#.bold().cyan());
    println!("{}", r#"               |___/                             "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "tangospec".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  SPEC session bridge");
    println!();
}
