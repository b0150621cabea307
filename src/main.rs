//! # duet
//!
//! Expert/learner chat server and its maintenance commands.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use duet_settings::DuetSettings;
use duet_store::{Database, SessionRepo, SessionSummary, SqliteLog};
use duet_telemetry::{LogQuery, LogRecord, SqliteLogSink, TelemetryConfig};

/// Real-time expert/learner sessions with persisted transcripts.
#[derive(Parser, Debug)]
#[command(name = "duet", about = "Expert/learner chat server")]
struct Cli {
    /// Settings file (defaults to ~/.duet/settings.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Chat database, overriding settings.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP + WebSocket server (default).
    Serve {
        /// Port to bind (0 for auto-assign).
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print every session with its status and message count.
    Sessions {
        #[arg(long, default_value = "1000")]
        limit: u32,
    },
    /// Delete all sessions and messages.
    Clear {
        /// Skip the three second grace period.
        #[arg(long)]
        yes: bool,
    },
    /// Bring the database schema up to date.
    Migrate,
    /// Show persisted warnings and errors, newest first.
    Logs {
        /// Only this level (warn or error).
        #[arg(long)]
        level: Option<String>,
        /// Only events tagged with this session.
        #[arg(long)]
        session: Option<String>,
        /// Substring of the event target, e.g. `duet_server::router`.
        #[arg(long)]
        target: Option<String>,
        /// RFC 3339 lower bound.
        #[arg(long)]
        since: Option<String>,
        #[arg(long, default_value = "50")]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => duet_settings::load_settings_from_path(path),
        None => duet_settings::load_settings(),
    }
    .context("Failed to load settings")?;
    if let Some(db) = &cli.db {
        settings.storage.db_path = db.clone();
    }

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => {
            if let Some(port) = port {
                settings.server.port = port;
            }
            serve(settings).await
        }
        Command::Sessions { limit } => list_sessions(&open_db(&settings.storage.db_path)?, limit),
        Command::Clear { yes } => clear(&open_db(&settings.storage.db_path)?, yes).await,
        Command::Migrate => migrate(&settings.storage.db_path),
        Command::Logs {
            level,
            session,
            target,
            since,
            limit,
        } => show_logs(
            &settings.logging.log_db_path,
            &LogQuery {
                level,
                target,
                session_id: session,
                since,
                limit: Some(limit),
                ..Default::default()
            },
        ),
    }
}

async fn serve(settings: DuetSettings) -> Result<()> {
    let telemetry = duet_telemetry::init_telemetry(telemetry_config(&settings));
    if let Some(logs) = telemetry.logs() {
        match logs.count() {
            Ok(persisted) => tracing::debug!(persisted, "log database ready"),
            Err(e) => tracing::debug!(error = %e, "log database unreadable"),
        }
    }

    let db = open_db(&settings.storage.db_path)?;
    let report = db.migration_report();
    if !report.added_columns.is_empty() {
        tracing::info!(columns = ?report.added_columns, "upgraded chat database");
    }

    let config = duet_server::ServerConfig::from_settings(&settings);
    let handle = duet_server::start(config, Arc::new(SqliteLog::new(db)))
        .await
        .context("Failed to start server")?;
    tracing::info!(addr = %handle.addr(), "duet ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

fn telemetry_config(settings: &DuetSettings) -> TelemetryConfig {
    let logging = &settings.logging;
    let log_level = logging.level.parse().unwrap_or_else(|_| {
        eprintln!("duet: unknown log level {:?}, using info", logging.level);
        tracing::Level::INFO
    });
    let module_levels = logging
        .modules
        .iter()
        .filter_map(|(module, level)| match level.parse() {
            Ok(level) => Some((module.clone(), level)),
            Err(_) => {
                eprintln!("duet: unknown log level {level:?} for {module}, ignoring");
                None
            }
        })
        .collect();
    TelemetryConfig {
        log_level,
        module_levels,
        json: logging.json,
        log_to_sqlite: logging.persist_warnings,
        log_db_path: logging.log_db_path.clone(),
        ..Default::default()
    }
}

fn open_db(path: &Path) -> Result<Database> {
    Database::open(path).with_context(|| format!("Failed to open database: {}", path.display()))
}

fn list_sessions(db: &Database, limit: u32) -> Result<()> {
    let sessions = SessionRepo::new(db.clone())
        .list_with_counts(limit, 0)
        .context("Failed to list sessions")?;

    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    println!("{} session(s)\n", sessions.len());
    for summary in &sessions {
        println!("{}", describe(summary));
    }
    Ok(())
}

fn describe(summary: &SessionSummary) -> String {
    let session = &summary.session;
    let mut lines = vec![
        format!("Session {} [{}]", session.id, session.status()),
        format!("  created:  {}", format_ms(session.created_at)),
    ];
    if let Some(ended_at) = session.ended_at {
        lines.push(format!("  ended:    {}", format_ms(ended_at)));
        lines.push(format!(
            "  duration: {} min",
            duration_minutes(session.created_at, ended_at)
        ));
    }
    lines.push(format!("  messages: {}", summary.message_count));
    lines.join("\n")
}

/// Whole minutes between two ms timestamps, rounded to nearest.
fn duration_minutes(start: i64, end: i64) -> i64 {
    ((end - start).max(0) + 30_000) / 60_000
}

fn format_ms(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

async fn clear(db: &Database, yes: bool) -> Result<()> {
    let repo = SessionRepo::new(db.clone());
    let count = repo.count().context("Failed to count sessions")?;
    if count == 0 {
        println!("Database is already empty.");
        return Ok(());
    }

    if !yes {
        println!(
            "WARNING: deleting {count} session(s) and all their messages from {}.",
            db.path().display()
        );
        println!("Press Ctrl+C within 3 seconds to cancel...");
        tokio::time::sleep(Duration::from_secs(3)).await;
    }

    let (sessions, messages) = repo.purge_all().context("Failed to clear database")?;
    println!("Deleted {sessions} session(s) and {messages} message(s).");
    Ok(())
}

fn migrate(path: &Path) -> Result<()> {
    let db = open_db(path)?;
    let opened = db.migration_report().clone();
    let rerun = db.migrate().context("Migration failed")?;
    if !rerun.is_noop() {
        tracing::warn!(report = ?rerun, "schema changed on second pass");
    }

    match opened.from {
        Some(v) if opened.added_columns.is_empty() && v == opened.to => {
            println!("Schema already at version {v}.");
        }
        from => {
            let from = from.map_or_else(|| "untracked".to_string(), |v| v.to_string());
            println!("Migrated schema {from} -> {}.", opened.to);
            for column in &opened.added_columns {
                println!("  added messages.{column}");
            }
        }
    }
    Ok(())
}

fn show_logs(path: &Path, query: &LogQuery) -> Result<()> {
    if !path.exists() {
        println!("No log database at {}.", path.display());
        return Ok(());
    }
    let sink = SqliteLogSink::new(path)
        .with_context(|| format!("Failed to open log database: {}", path.display()))?;
    let records = sink.query(query).context("Failed to query logs")?;
    if records.is_empty() {
        println!("No matching log entries.");
        return Ok(());
    }
    let total = sink.count().context("Failed to count logs")?;
    println!("{} of {total} entries\n", records.len());
    for record in &records {
        println!("{}", describe_log(record));
    }
    Ok(())
}

fn describe_log(record: &LogRecord) -> String {
    let mut line = format!(
        "{} {:<5} {} {}",
        record.timestamp, record.level, record.target, record.message
    );
    if let Some(session_id) = &record.session_id {
        line.push_str(&format!(" session={session_id}"));
    }
    if let Some(connection_id) = &record.connection_id {
        line.push_str(&format!(" connection={connection_id}"));
    }
    if let Some(fields) = &record.fields {
        line.push_str(&format!(" {fields}"));
    }
    line
}
