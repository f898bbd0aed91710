use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::Connection;
use tracing::debug;

use super::{AcceptanceStat, BreakHistory, BreakOutcome};
use crate::error::CollaboratorError;
use crate::suggestion::{BreakType, SuggestionSource};

const NAME: &str = "break history";

fn db_err(e: rusqlite::Error) -> CollaboratorError {
    CollaboratorError::unavailable(NAME, e)
}

/// Answered breaks in a SQLite database.
///
/// Queries run on the blocking pool.
pub struct SqliteBreakHistory {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBreakHistory {
    /// Open or create the history database.
    pub fn open(db_path: &Path) -> Result<Self, CollaboratorError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CollaboratorError::unavailable(NAME, e))?;
        }
        let conn = Connection::open(db_path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;").map_err(db_err)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, CollaboratorError> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self, CollaboratorError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS breaks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                suggestion_id TEXT NOT NULL UNIQUE,
                break_type TEXT NOT NULL,
                source TEXT NOT NULL,
                accepted INTEGER NOT NULL,
                responded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_breaks_type ON breaks(break_type);",
        )
        .map_err(db_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, CollaboratorError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, CollaboratorError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| CollaboratorError::unavailable(NAME, format!("lock poisoned: {e}")))?;
            f(&guard)
        })
        .await
        .map_err(|e| CollaboratorError::unavailable(NAME, e))?
    }
}

#[async_trait]
impl BreakHistory for SqliteBreakHistory {
    async fn append(&self, outcome: &BreakOutcome) -> Result<(), CollaboratorError> {
        let outcome = outcome.clone();
        self.with_conn(move |conn| {
            let source = match outcome.source {
                SuggestionSource::Engine => "engine",
                SuggestionSource::Fallback => "fallback",
            };
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO breaks (suggestion_id, break_type, source, accepted, responded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        outcome.suggestion_id,
                        outcome.break_type.as_str(),
                        source,
                        outcome.accepted,
                        outcome
                            .responded_at
                            .to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
                    ],
                )
                .map_err(db_err)?;
            if inserted == 0 {
                debug!(id = %outcome.suggestion_id, "Break outcome already recorded");
            }
            Ok(())
        })
        .await
    }

    async fn acceptance_stats(&self) -> Result<Vec<AcceptanceStat>, CollaboratorError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT break_type, COUNT(*), SUM(accepted)
                     FROM breaks GROUP BY break_type ORDER BY break_type",
                )
                .map_err(db_err)?;
            let stats = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })
                .map_err(db_err)?
                .filter_map(|r| r.ok())
                .filter_map(|(kind, offered, accepted)| {
                    Some(AcceptanceStat {
                        break_type: BreakType::from_str(&kind)?,
                        offered: offered as u64,
                        accepted: accepted as u64,
                    })
                })
                .collect();
            Ok(stats)
        })
        .await
    }
}
