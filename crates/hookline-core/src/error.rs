use thiserror::Error;

#[derive(Debug, Error)]
pub enum HooklineError {
    #[error("Configuration error: {0}")]
    Config(String),
}

impl HooklineError {
    /// Short machine-readable code, logged alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            HooklineError::Config(_) => "CONFIG_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, HooklineError>;
