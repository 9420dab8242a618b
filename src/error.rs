use crate::expression::ExpressionError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Expression error in {context}: {source}")]
    Expression {
        context: String,
        #[source]
        source: ExpressionError,
    },

    #[error("Invalid stage tree: {0}")]
    InvalidStage(String),

    /// The action list broke a structural guarantee of the pipeline
    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    pub fn expression(context: impl Into<String>, source: ExpressionError) -> Self {
        Error::Expression {
            context: context.into(),
            source,
        }
    }
}

/// Attach the enclosing operation to an expression failure
pub(crate) trait ExpressionContext<T> {
    fn context(self, context: impl FnOnce() -> String) -> Result<T>;
}

impl<T> ExpressionContext<T> for std::result::Result<T, ExpressionError> {
    fn context(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|source| Error::expression(context(), source))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expression_error_carries_context() {
        let err: Result<()> = Err(ExpressionError::UnexpectedEnd).context(|| "condition of 'step1'".to_string());
        let message = err.unwrap_err().to_string();
        assert_eq!(
            message,
            "Expression error in condition of 'step1': Unexpected end of expression"
        );
    }
}
