use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid version '{0}': expected major.minor.patch")]
    InvalidVersion(String),

    #[error("Unknown {kind}: '{value}'")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("Invalid amount '{0}'")]
    InvalidAmount(String),
}

impl CoreError {
    pub(crate) fn unknown(kind: &'static str, value: &str) -> Self {
        CoreError::UnknownVariant {
            kind,
            value: value.to_string(),
        }
    }
}
