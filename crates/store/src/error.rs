use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Duplicate {entity}: {key}")]
    Duplicate { entity: &'static str, key: String },

    #[error("Corrupt {column} value: {detail}")]
    Corrupt { column: &'static str, detail: String },
}

impl StoreError {
    pub(crate) fn corrupt(column: &'static str, detail: impl ToString) -> Self {
        StoreError::Corrupt {
            column,
            detail: detail.to_string(),
        }
    }
}
