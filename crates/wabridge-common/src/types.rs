use std::fmt;

/// The two SQL backends the persistence layer can run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// Network-served PostgreSQL.
    Network,
    /// Embedded file-based SQLite.
    Embedded,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Network => "postgres",
            Dialect::Embedded => "sqlite",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
