use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;
use wabridge_common::{Dialect, Error, Result};

pub const DB_USER: &str = "DB_USER";
pub const DB_PASSWORD: &str = "DB_PASSWORD";
pub const DB_NAME: &str = "DB_NAME";
pub const DB_HOST: &str = "DB_HOST";
pub const DB_PORT: &str = "DB_PORT";
pub const DB_SSLMODE: &str = "DB_SSLMODE";

/// Directory under the data dir that holds the SQLite file.
pub const EMBEDDED_SUBDIR: &str = "dbdata";
pub const EMBEDDED_FILENAME: &str = "users.db";

/// TLS mode for the PostgreSQL connection, resolved from the tri-state
/// `DB_SSLMODE` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SslMode {
    Require,
    Disable,
    /// Any other value, handed to the driver as-is.
    Other(String),
}

impl SslMode {
    /// `"true"` means require, `"false"` or unset means disable, anything
    /// else passes through verbatim.
    pub fn from_flag(value: Option<&str>) -> Self {
        match value.unwrap_or("") {
            "true" => SslMode::Require,
            "false" | "" => SslMode::Disable,
            other => SslMode::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SslMode::Require => "require",
            SslMode::Disable => "disable",
            SslMode::Other(value) => value,
        }
    }
}

/// Credentials for the network backend. All five fields are required.
#[derive(Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub host: String,
    pub port: u16,
    pub ssl_mode: SslMode,
}

// Hand-written so the password never ends up in logs.
impl fmt::Debug for NetworkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkConfig")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("dbname", &self.dbname)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Location of the embedded database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddedConfig {
    /// Directory holding the database file (`<data_dir>/dbdata`).
    pub dir: PathBuf,
}

impl EmbeddedConfig {
    pub fn from_data_dir(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join(EMBEDDED_SUBDIR),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.join(EMBEDDED_FILENAME)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseConfig {
    Network(NetworkConfig),
    Embedded(EmbeddedConfig),
}

impl DatabaseConfig {
    /// Resolve from the process environment. `data_dir` is the optional
    /// `--datadir` flag; without it the executable's own directory is used.
    pub fn from_env(data_dir: Option<&Path>) -> Result<Self> {
        let exe_dir = match data_dir {
            Some(_) => PathBuf::new(),
            None => executable_dir()?,
        };
        Self::from_lookup(|key| std::env::var(key).ok(), data_dir, &exe_dir)
    }

    /// Resolve using `lookup` for variable access.
    ///
    /// The network dialect is chosen only when user, password, database name,
    /// host and port are all present and non-empty. Otherwise the embedded
    /// dialect is used under `data_dir`, falling back to `exe_dir`.
    pub fn from_lookup<F>(lookup: F, data_dir: Option<&Path>, exe_dir: &Path) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.is_empty());

        if let (Some(user), Some(password), Some(dbname), Some(host), Some(port)) = (
            get(DB_USER),
            get(DB_PASSWORD),
            get(DB_NAME),
            get(DB_HOST),
            get(DB_PORT),
        ) {
            let port = port
                .trim()
                .parse::<u16>()
                .map_err(|e| Error::Config(format!("invalid {DB_PORT} value {port:?}: {e}")))?;
            let ssl_mode = SslMode::from_flag(lookup(DB_SSLMODE).as_deref());
            debug!("using postgres at {host}:{port}/{dbname} (sslmode={})", ssl_mode.as_str());
            return Ok(DatabaseConfig::Network(NetworkConfig {
                user,
                password,
                dbname,
                host,
                port,
                ssl_mode,
            }));
        }

        let base = data_dir.unwrap_or(exe_dir);
        let embedded = EmbeddedConfig::from_data_dir(base);
        debug!("using sqlite at {}", embedded.db_path().display());
        Ok(DatabaseConfig::Embedded(embedded))
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            DatabaseConfig::Network(_) => Dialect::Network,
            DatabaseConfig::Embedded(_) => Dialect::Embedded,
        }
    }
}

fn executable_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| Error::Config(format!("executable {} has no parent directory", exe.display())))
}
