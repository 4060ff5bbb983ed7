#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Event column identifier {ident:?} contains invalid characters ({invalid:?})")]
    InvalidIdentifier { ident: String, invalid: String },

    #[error("Invalid timestamp {0:?}")]
    InvalidTimestamp(String),

    #[error("Validation failed: {0}")]
    Validation(String),
}
