//! Engine startup and the readiness gate.
//!
//! Startup runs once: open the database, sync the schema, apply pending
//! migrations. The outcome is published on a `watch` channel that every
//! dispatcher task waits on before it touches the engine.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use rusqlite::Connection;
use tokio::sync::watch;

use super::error::{EngineError, EngineResult};
use super::sql;
use super::sqlite::SqliteEngine;
use super::Engine;
use crate::config::{EngineSettings, FailurePolicy};
use crate::error::{BridgeError, BridgeResult};
use crate::schema::Registry;

// ============================================================================
// Schema sync
// ============================================================================

/// What [`sync_schema`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaReport {
    /// Tables created from scratch.
    pub created: Vec<&'static str>,
    /// `(table, column)` pairs added to existing tables.
    pub added_columns: Vec<(&'static str, &'static str)>,
}

impl SchemaReport {
    pub fn is_unchanged(&self) -> bool {
        self.created.is_empty() && self.added_columns.is_empty()
    }
}

fn existing_columns(conn: &Connection, table: &str) -> EngineResult<HashSet<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", sql::quote_ident(table)))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(names)
}

/// Create missing tables and add missing columns, in one transaction.
///
/// Columns are never dropped or retyped.
pub fn sync_schema(conn: &mut Connection, registry: &Registry) -> EngineResult<SchemaReport> {
    let tx = conn.transaction()?;
    let mut report = SchemaReport::default();

    for entity in registry.iter() {
        let existing = existing_columns(&tx, entity.table)?;
        if existing.is_empty() {
            tx.execute_batch(&sql::create_table(entity))?;
            report.created.push(entity.table);
            continue;
        }

        for def in entity.columns {
            if !existing.contains(def.name) {
                tx.execute_batch(&sql::add_column(entity, def))?;
                report.added_columns.push((entity.table, def.name));
            }
        }
    }

    tx.commit()?;
    Ok(report)
}

// ============================================================================
// Migrations
// ============================================================================

/// A versioned SQL script applied at most once per database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: u32,
    pub name: String,
    pub sql: String,
}

impl Migration {
    pub fn new(version: u32, name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
            sql: sql.into(),
        }
    }
}

/// Migrations shipped with this build.
pub fn builtin_migrations() -> Vec<Migration> {
    vec![
        Migration::new(
            1,
            "messages_by_session",
            r#"CREATE INDEX IF NOT EXISTS "idx_messages_session" ON "messages" ("sessionId")"#,
        ),
        Migration::new(
            2,
            "sessions_by_status",
            r#"CREATE INDEX IF NOT EXISTS "idx_sessions_status" ON "sessions" ("status")"#,
        ),
    ]
}

const LEDGER_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS "_migrations" (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s','now') AS INTEGER))
);
"#;

/// Apply migrations not yet recorded in the ledger, in version order.
///
/// Each migration runs in its own transaction together with its ledger row.
/// Returns the versions applied by this call.
pub fn apply_migrations(conn: &mut Connection, migrations: &[Migration]) -> EngineResult<Vec<u32>> {
    conn.execute_batch(LEDGER_DDL)?;

    let applied: HashSet<u32> = {
        let mut stmt = conn.prepare(r#"SELECT version FROM "_migrations""#)?;
        let versions = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        versions
    };

    let mut pending: Vec<&Migration> = migrations
        .iter()
        .filter(|m| !applied.contains(&m.version))
        .collect();
    pending.sort_by_key(|m| m.version);

    let mut done = Vec::with_capacity(pending.len());
    for migration in pending {
        let failed = |source: rusqlite::Error| EngineError::Migration {
            version: migration.version,
            name: migration.name.clone(),
            source,
        };

        let tx = conn.transaction().map_err(failed)?;
        tx.execute_batch(&migration.sql).map_err(failed)?;
        tx.execute(
            r#"INSERT INTO "_migrations" (version, name) VALUES (?1, ?2)"#,
            rusqlite::params![migration.version, migration.name],
        )
        .map_err(failed)?;
        tx.commit().map_err(failed)?;

        tracing::info!(version = migration.version, name = %migration.name, "applied migration");
        done.push(migration.version);
    }

    Ok(done)
}

// ============================================================================
// Readiness gate
// ============================================================================

/// State of the readiness gate.
#[derive(Clone)]
pub enum BootstrapState {
    NotStarted,
    Initializing,
    Ready(Arc<dyn Engine>),
    Failed(String),
}

impl fmt::Debug for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => f.write_str("NotStarted"),
            Self::Initializing => f.write_str("Initializing"),
            Self::Ready(_) => f.write_str("Ready"),
            Self::Failed(reason) => f.debug_tuple("Failed").field(reason).finish(),
        }
    }
}

type InitFuture = BoxFuture<'static, BridgeResult<Arc<dyn Engine>>>;

/// One-shot engine startup guarding access to the engine.
///
/// The engine handle is only reachable through [`Bootstrap::wait_ready`], so
/// nothing can run against it before startup has completed.
pub struct Bootstrap {
    state: watch::Sender<BootstrapState>,
    init: Mutex<Option<InitFuture>>,
}

impl Bootstrap {
    /// Gate around an arbitrary startup future. Nothing runs until [`trigger`].
    ///
    /// [`trigger`]: Bootstrap::trigger
    pub fn new<F>(init: F) -> Arc<Self>
    where
        F: Future<Output = BridgeResult<Arc<dyn Engine>>> + Send + 'static,
    {
        let (state, _) = watch::channel(BootstrapState::NotStarted);
        Arc::new(Self {
            state,
            init: Mutex::new(Some(init.boxed())),
        })
    }

    /// Gate that is already open.
    pub fn ready(engine: Arc<dyn Engine>) -> Arc<Self> {
        let (state, _) = watch::channel(BootstrapState::Ready(engine));
        Arc::new(Self {
            state,
            init: Mutex::new(None),
        })
    }

    /// Standard SQLite startup: open, sync schema, apply migrations.
    pub fn sqlite(
        settings: EngineSettings,
        policy: FailurePolicy,
        registry: Registry,
        migrations: Vec<Migration>,
    ) -> Arc<Self> {
        Self::new(async move {
            let engine = open_engine(settings).await?;

            let report = engine
                .with_connection(move |conn| sync_schema(conn, &registry))
                .await?;
            if !report.is_unchanged() {
                tracing::info!(
                    created = ?report.created,
                    added_columns = ?report.added_columns,
                    "schema synced"
                );
            }

            match engine
                .with_connection(move |conn| apply_migrations(conn, &migrations))
                .await
            {
                Ok(_) => {}
                Err(err) if policy == FailurePolicy::Degrade => {
                    tracing::warn!(error = %err, "migration failed; continuing without it");
                }
                Err(err) => return Err(err.into()),
            }

            Ok::<Arc<dyn Engine>, BridgeError>(Arc::new(engine))
        })
    }

    /// Start startup if it has not started yet. Returns whether this call did.
    pub fn trigger(self: &Arc<Self>) -> bool {
        let init = match self.init.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(init) = init else {
            return false;
        };

        self.state.send_replace(BootstrapState::Initializing);
        tracing::debug!("engine bootstrap started");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let next = match AssertUnwindSafe(init).catch_unwind().await {
                Ok(Ok(engine)) => {
                    tracing::info!("engine ready");
                    BootstrapState::Ready(engine)
                }
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "engine bootstrap failed");
                    BootstrapState::Failed(err.message())
                }
                Err(_) => {
                    tracing::error!("engine bootstrap panicked");
                    BootstrapState::Failed("engine bootstrap panicked".to_string())
                }
            };
            this.state.send_replace(next);
        });

        true
    }

    pub fn state(&self) -> BootstrapState {
        self.state.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.state.borrow(), BootstrapState::Ready(_))
    }

    /// Wait until startup settles and return the engine.
    ///
    /// Fails with `EngineNotInitialized` when startup failed.
    pub async fn wait_ready(&self) -> BridgeResult<Arc<dyn Engine>> {
        let mut rx = self.state.subscribe();
        let settled = rx
            .wait_for(|s| matches!(s, BootstrapState::Ready(_) | BootstrapState::Failed(_)))
            .await
            .map(|state| state.clone());

        match settled {
            Ok(BootstrapState::Ready(engine)) => Ok(engine),
            Ok(BootstrapState::Failed(reason)) => Err(BridgeError::EngineNotInitialized(reason)),
            Ok(_) | Err(_) => Err(BridgeError::EngineNotInitialized(
                "engine bootstrap was abandoned".to_string(),
            )),
        }
    }
}

async fn open_engine(settings: EngineSettings) -> BridgeResult<SqliteEngine> {
    let path = settings
        .resolved_path()
        .map_err(|e| BridgeError::EngineExecution(e.to_string()))?;
    let busy_timeout = settings.busy_timeout();

    let engine = tokio::task::spawn_blocking(move || match path {
        Some(path) => SqliteEngine::open(path, busy_timeout),
        None => SqliteEngine::open_in_memory(),
    })
    .await
    .map_err(EngineError::from)??;
    Ok(engine)
}
