//! Core error type for the rein engine.
//!
//! `ReinError` is used throughout the core (graph loading, stores, runner,
//! scheduler, control channel). Block-level execution failures are not
//! errors at this level: they are recorded as `failed` block states and the
//! run carries on. Only definition problems and infrastructure failures
//! surface as `Err`.

#[derive(Debug, thiserror::Error)]
pub enum ReinError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow definition:\n{}", .0.join("\n"))]
    Definition(Vec<String>),

    #[error("Invalid task input: {0}")]
    Input(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Hook error: {0}")]
    Hook(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Control channel error: {0}")]
    Control(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReinError {
    /// Shorthand for a single-message definition error.
    pub fn definition(msg: impl Into<String>) -> Self {
        ReinError::Definition(vec![msg.into()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_error_lists_every_problem() {
        let err = ReinError::Definition(vec![
            "duplicate block name 'a'".to_string(),
            "block 'b' depends on unknown block 'x'".to_string(),
        ]);
        let text = err.to_string();
        assert!(text.contains("duplicate block name 'a'"));
        assert!(text.contains("unknown block 'x'"));
    }
}
