use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use postgres::config::SslMode as PgSslMode;
use postgres::{Client, NoTls};
use rusqlite::{Connection, TransactionBehavior};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{info, warn};
use wabridge_common::{Dialect, Error, Result};
use wabridge_config::{DatabaseConfig, EmbeddedConfig, NetworkConfig, SslMode};

use crate::capabilities::{ColumnInfo, PostgresCatalog, SchemaCapabilities, SqliteCatalog};
use crate::history::MessageHistory;
use crate::ledger::{self, LedgerEntry};

/// How long SQLite waits on a locked database before failing the statement.
pub const BUSY_TIMEOUT: Duration = Duration::from_millis(3000);

/// Raw failure from either driver, before it is classified into [`Error`].
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("{0}")]
    Postgres(#[from] postgres::Error),
}

/// An open connection to one of the two supported backends.
pub enum Database {
    Network(Client),
    Embedded(Connection),
}

impl Database {
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        match config {
            DatabaseConfig::Network(network) => Self::open_network(network),
            DatabaseConfig::Embedded(embedded) => Self::open_embedded(embedded),
        }
    }

    pub fn open_network(config: &NetworkConfig) -> Result<Self> {
        info!(
            "opening postgres connection to {}:{}/{}",
            config.host, config.port, config.dbname
        );
        let ssl_mode = driver_ssl_mode(&config.ssl_mode)?;

        let mut pg = postgres::Config::new();
        pg.user(&config.user)
            .password(&config.password)
            .dbname(&config.dbname)
            .host(&config.host)
            .port(config.port)
            .ssl_mode(ssl_mode);

        let client = if matches!(ssl_mode, PgSslMode::Disable) {
            pg.connect(NoTls)
        } else {
            pg.connect(tls_connector()?)
        }
        .map_err(|e| Error::Connection(format!("failed to open postgres connection: {e}")))?;

        let mut db = Database::Network(client);
        db.ping()?;
        Ok(db)
    }

    /// Open `<dir>/users.db`, creating the directory if needed.
    pub fn open_embedded(config: &EmbeddedConfig) -> Result<Self> {
        create_data_dir(&config.dir)?;
        let path = config.db_path();
        info!("opening sqlite database at {}", path.display());

        let conn = Connection::open(&path).map_err(|e| {
            Error::Connection(format!(
                "failed to open sqlite database at {}: {e}",
                path.display()
            ))
        })?;
        Self::from_sqlite(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Connection(format!("failed to open in-memory database: {e}")))?;
        Self::from_sqlite(conn)
    }

    fn from_sqlite(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Connection(format!("failed to set pragmas: {e}")))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| Error::Connection(format!("failed to set busy timeout: {e}")))?;

        let mut db = Database::Embedded(conn);
        db.ping()?;
        Ok(db)
    }

    fn ping(&mut self) -> Result<()> {
        let result = match self {
            Database::Network(client) => client
                .query_one("SELECT 1", &[])
                .map(|_| ())
                .map_err(DriverError::from),
            Database::Embedded(conn) => conn
                .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map(|_| ())
                .map_err(DriverError::from),
        };
        result.map_err(|e| {
            Error::Connection(format!("failed to ping {} database: {e}", self.dialect()))
        })
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            Database::Network(_) => Dialect::Network,
            Database::Embedded(_) => Dialect::Embedded,
        }
    }

    /// Catalog checks outside of any explicit transaction.
    pub fn capabilities(&mut self) -> Box<dyn SchemaCapabilities + '_> {
        match self {
            Database::Network(client) => Box::new(PostgresCatalog::new(client)),
            Database::Embedded(conn) => Box::new(SqliteCatalog::new(conn)),
        }
    }

    /// Run `body` inside a transaction, committing on `Ok` and rolling back on
    /// `Err`. The transaction never outlives this call.
    pub fn transaction<F, T>(&mut self, body: F) -> Result<T>
    where
        F: FnOnce(&mut SchemaTx<'_>) -> Result<T>,
    {
        let mut tx = match self {
            Database::Network(client) => SchemaTx::Network(
                client
                    .transaction()
                    .map_err(|e| Error::Database(format!("BEGIN failed: {e}")))?,
            ),
            Database::Embedded(conn) => SchemaTx::Embedded(
                conn.transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(|e| Error::Database(format!("BEGIN failed: {e}")))?,
            ),
        };

        match body(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!("ROLLBACK failed: {rollback_err}");
                }
                Err(err)
            }
        }
    }

    pub fn history(&mut self) -> MessageHistory<'_> {
        MessageHistory::new(self)
    }

    /// Rows of the `migrations` table, ordered by id.
    pub fn ledger_entries(&mut self) -> Result<Vec<LedgerEntry>> {
        ledger::entries(self)
    }
}

/// An open transaction on either backend.
pub enum SchemaTx<'a> {
    Network(postgres::Transaction<'a>),
    Embedded(rusqlite::Transaction<'a>),
}

impl SchemaTx<'_> {
    pub fn dialect(&self) -> Dialect {
        match self {
            SchemaTx::Network(_) => Dialect::Network,
            SchemaTx::Embedded(_) => Dialect::Embedded,
        }
    }

    pub fn execute_batch(&mut self, sql: &str) -> std::result::Result<(), DriverError> {
        match self {
            SchemaTx::Network(tx) => tx.batch_execute(sql)?,
            SchemaTx::Embedded(tx) => tx.execute_batch(sql)?,
        }
        Ok(())
    }

    fn catalog(&mut self) -> Box<dyn SchemaCapabilities + '_> {
        match self {
            SchemaTx::Network(tx) => Box::new(PostgresCatalog::new(tx)),
            SchemaTx::Embedded(tx) => Box::new(SqliteCatalog::new(&**tx)),
        }
    }

    fn commit(self) -> Result<()> {
        let result = match self {
            SchemaTx::Network(tx) => tx.commit().map_err(DriverError::from),
            SchemaTx::Embedded(tx) => tx.commit().map_err(DriverError::from),
        };
        result.map_err(|e| Error::Database(format!("COMMIT failed: {e}")))
    }

    fn rollback(self) -> std::result::Result<(), DriverError> {
        match self {
            SchemaTx::Network(tx) => tx.rollback()?,
            SchemaTx::Embedded(tx) => tx.rollback()?,
        }
        Ok(())
    }
}

impl SchemaCapabilities for SchemaTx<'_> {
    fn table_exists(&mut self, table: &str) -> Result<bool> {
        self.catalog().table_exists(table)
    }

    fn column_exists(&mut self, table: &str, column: &str) -> Result<bool> {
        self.catalog().column_exists(table, column)
    }

    fn column_type(&mut self, table: &str, column: &str) -> Result<Option<String>> {
        self.catalog().column_type(table, column)
    }

    fn table_columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>> {
        self.catalog().table_columns(table)
    }
}

/// Map the configured mode onto what the postgres driver understands.
fn driver_ssl_mode(mode: &SslMode) -> Result<PgSslMode> {
    match mode.as_str() {
        "disable" => Ok(PgSslMode::Disable),
        "allow" | "prefer" => Ok(PgSslMode::Prefer),
        "require" | "verify-ca" | "verify-full" => Ok(PgSslMode::Require),
        other => Err(Error::Config(format!("unsupported DB_SSLMODE value: {other}"))),
    }
}

fn tls_connector() -> Result<MakeRustlsConnect> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Connection(format!("failed to build TLS config: {e}")))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(MakeRustlsConnect::new(config))
}

#[cfg(unix)]
fn create_data_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o751)
        .create(dir)
        .map_err(|e| {
            Error::Connection(format!("could not create data directory {}: {e}", dir.display()))
        })
}

#[cfg(not(unix))]
fn create_data_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| {
        Error::Connection(format!("could not create data directory {}: {e}", dir.display()))
    })
}
