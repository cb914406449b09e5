//! `SQLite` persistence of the event log and of per-domain activity.
//!
//! Writes go through a background writer task so recording an event never
//! waits for the database.

use core::str::FromStr as _;
use std::path::Path;

use chrono::{DateTime, Utc};
use eyre::WrapErr as _;
use futures::future::BoxFuture;
use sqlx::{
    Row as _, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument as _, error, warn};

use super::{
    controller::MachineState,
    events::{Event, EventLogError, EventSink, LogEntry, trace_event},
};

pub type DbPool = SqlitePool;

/// Events buffered for the writer before new ones are dropped.
const WRITE_QUEUE: usize = 1024;

/// Opens (creating if needed) the database at `path` and applies migrations.
///
/// `:memory:` opens a private in-memory database.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or migrated.
pub async fn init(path: &Path) -> eyre::Result<DbPool> {
    let in_memory = path == Path::new(":memory:");
    let options = if in_memory {
        SqliteConnectOptions::from_str("sqlite::memory:")?
    } else {
        SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
    };
    let pool_options = if in_memory {
        // every connection would get its own database
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(4)
    };
    let pool = pool_options
        .connect_with(options)
        .await
        .wrap_err("Failed to open database")?;
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .wrap_err("Failed to migrate database")?;
    Ok(pool)
}

/// Last recorded activity of every domain.
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn load_activity(pool: &DbPool) -> Result<Vec<(String, DateTime<Utc>)>, sqlx::Error> {
    sqlx::query("SELECT domain, last_activity FROM activity WHERE last_activity IS NOT NULL")
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| Ok((row.try_get("domain")?, row.try_get("last_activity")?)))
        .collect()
}

/// The `limit` most recent log rows, newest first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn recent_logs(pool: &DbPool, limit: usize) -> Result<Vec<LogEntry>, sqlx::Error> {
    sqlx::query(
        "SELECT timestamp, domain, action, status, details, client_ip FROM logs ORDER BY id DESC LIMIT ?",
    )
    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
    .fetch_all(pool)
    .await?
    .iter()
    .map(|row| {
        Ok(LogEntry {
            timestamp: row.try_get("timestamp")?,
            domain: row.try_get("domain")?,
            action: row.try_get("action")?,
            status: row.try_get("status")?,
            details: row.try_get("details")?,
            client_ip: row.try_get("client_ip")?,
        })
    })
    .collect()
}

async fn insert_log(pool: &DbPool, entry: &LogEntry) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO logs (timestamp, domain, action, status, details, client_ip) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.timestamp)
    .bind(entry.domain.as_deref())
    .bind(&entry.action)
    .bind(&entry.status)
    .bind(entry.details.as_deref())
    .bind(entry.client_ip.as_deref())
    .execute(pool)
    .await?;
    Ok(())
}

async fn write_event(pool: &DbPool, at: DateTime<Utc>, event: &Event) -> Result<(), sqlx::Error> {
    match *event {
        Event::Activity { ref domain, .. } => {
            sqlx::query(
                "INSERT INTO activity (domain, last_activity) VALUES (?, ?)
                 ON CONFLICT(domain) DO UPDATE SET last_activity = excluded.last_activity
                 WHERE activity.last_activity IS NULL OR excluded.last_activity > activity.last_activity",
            )
            .bind(domain)
            .bind(at)
            .execute(pool)
            .await?;
            // activity is too frequent for the log table
            return Ok(());
        }
        Event::WakeSignal {
            ref domain,
            error: None,
            ..
        } => {
            sqlx::query(
                "INSERT INTO activity (domain, last_wake) VALUES (?, ?)
                 ON CONFLICT(domain) DO UPDATE SET last_wake = excluded.last_wake",
            )
            .bind(domain)
            .bind(at)
            .execute(pool)
            .await?;
        }
        Event::Transition {
            ref domain,
            from: MachineState::Booting,
            to: MachineState::Running,
            ..
        } => {
            sqlx::query(
                "INSERT INTO activity (domain, boot_count) VALUES (?, 1)
                 ON CONFLICT(domain) DO UPDATE SET boot_count = boot_count + 1",
            )
            .bind(domain)
            .execute(pool)
            .await?;
        }
        _ => {}
    }
    insert_log(pool, &LogEntry::from_event(at, event)).await
}

#[derive(Debug)]
enum WriterMsg {
    Record(DateTime<Utc>, Event),
    Flush(oneshot::Sender<()>),
}

async fn run_writer(pool: DbPool, mut rx: mpsc::Receiver<WriterMsg>) {
    while let Some(msg) = rx.recv().await {
        match msg {
            WriterMsg::Record(at, event) => {
                if let Err(e) = write_event(&pool, at, &event).await {
                    error!(error = %e, ?event, "Failed to persist event");
                }
            }
            WriterMsg::Flush(done) => drop(done.send(())),
        }
    }
}

/// Event sink persisting to `SQLite`. Events are traced as well.
#[derive(Debug, Clone)]
pub struct SqliteSink {
    pool: DbPool,
    tx: mpsc::Sender<WriterMsg>,
}

impl SqliteSink {
    /// Creates the sink and spawns its writer task.
    #[must_use]
    pub fn spawn(pool: DbPool) -> Self {
        let (tx, rx) = mpsc::channel(WRITE_QUEUE);
        tokio::spawn(run_writer(pool.clone(), rx).in_current_span());
        Self { pool, tx }
    }

    /// Waits until every event recorded so far is written.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(WriterMsg::Flush(done)).await.is_ok() {
            drop(wait.await);
        }
    }

    #[must_use]
    pub const fn pool(&self) -> &DbPool {
        &self.pool
    }
}

impl EventSink for SqliteSink {
    fn record(&self, at: DateTime<Utc>, event: Event) {
        trace_event(&event);
        if let Err(e) = self.tx.try_send(WriterMsg::Record(at, event)) {
            warn!(error = %e, "Event log queue unavailable, dropping event");
        }
    }

    fn recent(&self, limit: usize) -> BoxFuture<'_, Result<Vec<LogEntry>, EventLogError>> {
        Box::pin(async move { Ok(recent_logs(&self.pool, limit).await?) })
    }
}
