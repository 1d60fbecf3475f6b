use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    /// Opening or pinging the backend failed. Fatal to startup.
    #[error("connection error: {0}")]
    Connection(String),

    /// A system catalog query failed while checking tables or columns.
    #[error("schema introspection error: {0}")]
    SchemaIntrospection(String),

    /// A DDL/DML statement inside a migration body failed.
    #[error("migration execution error: {0}")]
    MigrationExecution(String),

    /// Creating the `migrations` ledger or inserting into it failed.
    #[error("ledger write error: {0}")]
    LedgerWrite(String),

    /// Any of the above, tagged with the migration that was being applied.
    #[error("migration {id} ({name}) failed: {source}")]
    Migration {
        id: i32,
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("database error: {0}")]
    Database(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Id of the migration this error was raised in, if any.
    pub fn migration_id(&self) -> Option<i32> {
        match self {
            Error::Migration { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// The innermost error, with any migration context stripped.
    pub fn root(&self) -> &Error {
        match self {
            Error::Migration { source, .. } => source.root(),
            other => other,
        }
    }
}
