/// Database configuration and connection management
pub mod database;

/// Runtime settings and course catalog loading from config.toml
pub mod settings;
