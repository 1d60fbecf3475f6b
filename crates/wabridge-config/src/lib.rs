pub mod database;

pub use database::{DatabaseConfig, EmbeddedConfig, NetworkConfig, SslMode};
