use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("malformed trip row {id}: {reason}")]
    MalformedRow { id: String, reason: String },
    #[error("not found")]
    NotFound,
    #[error("invalid action: {0}")]
    InvalidAction(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    pub fn malformed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        AppError::MalformedRow {
            id: id.into(),
            reason: reason.into(),
        }
    }
}
