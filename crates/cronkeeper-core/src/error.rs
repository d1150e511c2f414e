use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The layered configuration could not be extracted.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CoreError {
    /// Short error code string for logs and response frames.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
