pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Shared handle to the local SQLite database.
///
/// Clones share one connection. Other processes open their own connection to
/// the same file; SQLite's write lock serializes their transactions.
#[derive(Clone)]
pub struct Database {
  conn: Arc<Mutex<Connection>>,
}

impl Database {
  /// Open or create the database at `path`, applying pending migrations.
  ///
  /// If another session is upgrading the schema this blocks (up to
  /// `busy_timeout`) until that upgrade commits.
  pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
      }
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::init(conn, busy_timeout)
  }

  /// Private in-memory database, used by tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::init(conn, Duration::from_secs(1))
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("hoard").join("hoard.db"))
  }

  fn init(mut conn: Connection, busy_timeout: Duration) -> Result<Self> {
    conn
      .busy_timeout(busy_timeout)
      .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;

    let version = run_migrations(&mut conn)?;
    debug!(schema_version = version, "database opened");

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  /// Schema version recorded in the database.
  pub fn schema_version(&self) -> Result<u32> {
    self.with_conn(|conn| {
      conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| eyre!("Failed to read schema version: {}", e))
    })
  }

  /// Run `f` against the connection outside of an explicit transaction.
  pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    f(&conn)
  }

  /// Run `f` inside an IMMEDIATE transaction. Commits when `f` returns `Ok`,
  /// rolls back otherwise.
  pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction_with_behavior(TransactionBehavior::Immediate)
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let value = f(&tx)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(value)
  }
}

/// Bring the schema up to `schema::current_version()`.
///
/// The version check and every migration happen in a single IMMEDIATE
/// transaction, so a concurrent opener waits on the write lock and then finds
/// nothing left to do.
fn run_migrations(conn: &mut Connection) -> Result<u32> {
  let target = schema::current_version();

  let tx = conn
    .transaction_with_behavior(TransactionBehavior::Immediate)
    .map_err(|e| eyre!("Failed to begin schema upgrade: {}", e))?;

  let current: u32 = tx
    .query_row("PRAGMA user_version", [], |row| row.get(0))
    .map_err(|e| eyre!("Failed to read schema version: {}", e))?;

  if current > target {
    return Err(eyre!(
      "Database schema version {} is newer than supported version {}",
      current,
      target
    ));
  }

  for migration in schema::MIGRATIONS.iter().filter(|m| m.version > current) {
    info!(
      version = migration.version,
      description = migration.description,
      "applying schema migration"
    );
    tx.execute_batch(migration.sql)
      .map_err(|e| eyre!("Migration {} failed: {}", migration.version, e))?;
  }

  if current != target {
    tx.pragma_update(None, "user_version", target)
      .map_err(|e| eyre!("Failed to record schema version: {}", e))?;
  }

  tx.commit()
    .map_err(|e| eyre!("Failed to commit schema upgrade: {}", e))?;

  Ok(target)
}
