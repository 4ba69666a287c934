//! Error types shared across the combat core.

use thiserror::Error;

/// Failures of the lease/lock backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lease store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum CombatError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("character {0} not found")]
    CharacterNotFound(i64),
    #[error("character {0} is not on a map")]
    NoMap(i64),
    #[error("character {0} is not fighting")]
    NotFighting(i64),
    #[error("map {0} has no spawn table")]
    UnknownMap(i64),
    #[error("combat round failed: {0}")]
    Round(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised while loading TOML data files.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("{0}")]
    Invalid(String),
}
