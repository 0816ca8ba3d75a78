#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Validation failed: {0}")]
    Validation(String),
}
