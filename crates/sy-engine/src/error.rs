use sy_config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Backlog size must be between 1 and {max}, was {size}")]
    InvalidBacklogSize { size: i64, max: usize },

    #[error("Unknown language: {0}")]
    UnknownLanguage(String),

    #[error("Invalid {language} expression '{expression}': {reason}")]
    InvalidExpression {
        language: String,
        expression: String,
        reason: String,
    },

    #[error("Predicate evaluation failed: {0}")]
    PredicateEvaluation(String),

    #[error("Failed to compose node {node_id}: {reason}")]
    Composition { node_id: String, reason: String },

    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
