use thiserror::Error;

/// Errors that can occur anywhere in the scheduling pipeline.
#[derive(Error, Debug)]
pub enum TaktError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("missing global config key: {0}")]
    MissingConfig(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    /// A conditional UPDATE matched zero rows: another writer changed the
    /// task since this tick's snapshot was taken. The tick's transaction is
    /// rolled back and the decision is retried next tick; never escalated.
    #[error("task {task_id} changed by a concurrent writer, tick abandoned")]
    TaskRaced { task_id: i64 },

    #[error("unknown row: {0}")]
    UnknownRow(String),

    #[error("{0}")]
    Other(String),
}
